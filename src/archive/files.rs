//! Archive of the site files with `zip`.

use std::path::Path;

use crate::settings::Options;
use crate::util::process::{relative_to, CommandError, CommandRunner, Invocation};

/// `zip -x` patterns for the excluded paths, relative to the site root.
///
/// `staging_dir` is excluded as well if it lies inside the site root, so a
/// backup never contains earlier backups.
pub fn exclusion_patterns(root: &Path, exclude: &[String], staging_dir: &Path) -> Vec<String> {
    let staging = relative_to(staging_dir, root).filter(|s| !s.is_empty());

    let mut paths: Vec<String> = exclude
        .iter()
        .map(|p| p.trim().trim_matches('/').to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if let Some(staging) = staging {
        if !paths.contains(&staging) {
            paths.push(staging);
        }
    }

    paths
        .into_iter()
        .flat_map(|p| [format!("{p}/*"), p])
        .collect()
}

/// Builds the `zip` call archiving `root` into `dest`.
pub fn archive_invocation(
    root: &Path,
    options: &Options,
    staging_dir: &Path,
    dest: &Path,
) -> Invocation {
    let mut invocation = Invocation::new(&options.zip, options.archive_timeout())
        .current_dir(root)
        .args(["-r", "-q", "-y"])
        .arg(dest.to_string_lossy())
        .arg(".");

    let patterns = exclusion_patterns(root, &options.exclude, staging_dir);
    if !patterns.is_empty() {
        invocation = invocation.arg("-x").args(patterns);
    }

    invocation
}

/// Archives the site files into `dest`. A nonzero exit of `zip` is an error.
pub fn archive_site<R: CommandRunner>(
    runner: &R,
    root: &Path,
    options: &Options,
    staging_dir: &Path,
    dest: &Path,
) -> Result<(), CommandError> {
    log::info!(target: "archive::files", "Create archive of site files: {}", root.display());

    runner.run_checked(&archive_invocation(root, options, staging_dir, dest))?;

    log::info!(target: "archive::files", "Finished archive of site files: {}", dest.display());
    Ok(())
}
