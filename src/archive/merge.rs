//! Merging artifacts into one flat zip archive.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Extensions of already compressed files, stored without recompression.
const COMPRESSED: [&str; 3] = ["zip", "gz", "tgz"];

#[derive(Debug, Display, Error, From)]
/// Errors on merging artifacts.
pub enum MergeError {
    #[from]
    #[display("Merging I/O failed: {_0}")]
    Io(io::Error),
    #[from]
    #[display("Writing the zip archive failed: {_0}")]
    Zip(zip::result::ZipError),
    /// A source has no usable file name.
    #[display("Can't name archive entry for {}", _0.display())]
    InvalidName(#[error(ignore)] PathBuf),
    /// Two sources share the same file name.
    #[display("Duplicate archive entry: {_0}")]
    DuplicateEntry(#[error(ignore)] String),
}

/// Writes `sources` into a new zip archive at `dest`.
///
/// Entries are named by the file name of their source only, the archive
/// contains no directories.
pub fn merge_flat(sources: &[&Path], dest: &Path) -> Result<(), MergeError> {
    let mut names = HashSet::new();
    for source in sources {
        let name = entry_name(source)?;
        if !names.insert(name) {
            return Err(MergeError::DuplicateEntry(name.to_string()));
        }
    }

    let mut zip = ZipWriter::new(BufWriter::new(File::create_new(dest)?));
    for source in sources {
        let name = entry_name(source)?;
        let file = File::open(source)?;
        let len = file.metadata()?.len();

        let compressed = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| COMPRESSED.contains(&e));
        let method = if compressed {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        let options = FileOptions::default()
            .compression_method(method)
            .large_file(len >= u64::from(u32::MAX));

        log::debug!(target: "archive::merge", "Adding {} ({len} bytes, {method:?})", source.display());
        zip.start_file(name, options)?;
        io::copy(&mut BufReader::new(file), &mut zip)?;
    }

    let mut writer = zip.finish()?;
    io::Write::flush(&mut writer)?;
    Ok(())
}

fn entry_name(source: &Path) -> Result<&str, MergeError> {
    source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MergeError::InvalidName(source.to_path_buf()))
}
