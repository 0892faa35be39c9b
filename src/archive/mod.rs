//! Building the backup archive of a site.
//!
//! A build runs three steps, each aborting the build on failure:
//!
//! - [database]: Dump of the site database.
//! - [files]: Archive of the site files.
//! - [merge]: Both merged into `<prefix>_<timestamp>.zip`.
//!
//! All artifacts of a run are written into their own directory below the
//! staging directory, named after the [RunId].

pub mod database;
pub mod files;
pub mod merge;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use derive_more::{Display, Error};
use uuid::Uuid;

pub use merge::MergeError;

use crate::settings::Options;
use crate::util::process::{CommandError, CommandRunner};
use crate::wordpress::WordPress;

/// Timestamp format of backup names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// What an artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ArtifactKind {
    #[display("database dump")]
    Database,
    #[display("file archive")]
    Filesystem,
    #[display("backup archive")]
    Merged,
}

/// A file produced by a backup run.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub created_at: DateTime<Local>,
    pub kind: ArtifactKind,
}

impl BackupArtifact {
    fn new(path: PathBuf, kind: ArtifactKind) -> Self {
        Self {
            path,
            created_at: Local::now(),
            kind,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Identifies one backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunId {
    id: Uuid,
    started: DateTime<Local>,
}

impl RunId {
    pub fn new() -> Self {
        Self::started_at(Local::now())
    }

    pub fn started_at(started: DateTime<Local>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Start of the run, formatted with [TIMESTAMP_FORMAT].
    pub fn timestamp(&self) -> String {
        self.started.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Directory of the run's artifacts below `staging_dir`.
    pub fn run_dir(&self, staging_dir: &Path) -> PathBuf {
        staging_dir.join(format!("run-{}", self.id.simple()))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

/// Name of the merged archive: `<prefix>_<timestamp>.zip`.
pub fn backup_name(prefix: &str, timestamp: &str) -> String {
    format!("{prefix}_{timestamp}.zip")
}

#[derive(Debug, Display, Error)]
/// Errors on building a backup archive.
pub enum BuildError {
    /// The staging directory couldn't be created.
    #[display("Creating staging directory {} failed: {source}", path.display())]
    Staging { path: PathBuf, source: io::Error },
    /// The database dump failed.
    #[display("Database dump failed: {_0}")]
    DumpFailed(CommandError),
    /// The file archive failed.
    #[display("File archive failed: {_0}")]
    ArchiveFailed(CommandError),
    /// Merging dump and file archive failed.
    #[display("Merging the backup archive failed: {_0}")]
    MergeFailed(MergeError),
}

/// The artifacts of a successful build.
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub run_dir: PathBuf,
    pub database: BackupArtifact,
    pub filesystem: BackupArtifact,
    pub merged: BackupArtifact,
}

impl BuiltArchive {
    /// Name of the merged archive.
    pub fn name(&self) -> String {
        self.merged.file_name()
    }

    pub fn artifacts(&self) -> [&BackupArtifact; 3] {
        [&self.database, &self.filesystem, &self.merged]
    }

    /// Removes all artifacts and the run directory.
    ///
    /// Keeps going if a single removal fails and returns the failures.
    pub fn cleanup(self) -> Vec<(PathBuf, io::Error)> {
        let mut failures = Vec::new();

        for artifact in self.artifacts() {
            match fs::remove_file(&artifact.path) {
                Ok(()) => {
                    log::debug!(target: "archive", "Removed {} {}", artifact.kind, artifact.path.display());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!(target: "archive", "Removing {} failed: {e}", artifact.path.display());
                    failures.push((artifact.path.clone(), e));
                }
            }
        }

        if let Err(e) = fs::remove_dir(&self.run_dir) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!(target: "archive", "Removing {} failed: {e}", self.run_dir.display());
                failures.push((self.run_dir.clone(), e));
            }
        }

        failures
    }
}

/// Files left in the run directory of `run`, e.g. after a failed build.
pub fn leftovers(staging_dir: &Path, run: &RunId) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(run.run_dir(staging_dir)) else {
        return Vec::new();
    };

    let mut paths: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    paths
}

/// Builds backup archives of a [WordPress] site.
pub struct ArchiveBuilder<'a, R> {
    site: &'a WordPress,
    options: &'a Options,
    prefix: &'a str,
    runner: &'a R,
}

impl<'a, R: CommandRunner> ArchiveBuilder<'a, R> {
    pub fn new(site: &'a WordPress, options: &'a Options, prefix: &'a str, runner: &'a R) -> Self {
        Self {
            site,
            options,
            prefix,
            runner,
        }
    }

    /// Configured staging directory or the site default, always absolute.
    pub fn staging_dir(&self) -> PathBuf {
        match &self.options.staging_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => std::path::absolute(dir).unwrap_or_else(|_| self.site.root().join(dir)),
            None => self.site.default_staging_dir(),
        }
    }

    pub fn build(&self, run: &RunId) -> Result<BuiltArchive, BuildError> {
        let staging_dir = self.staging_dir();
        fs::create_dir_all(run.run_dir(&staging_dir)).map_err(|source| BuildError::Staging {
            path: run.run_dir(&staging_dir),
            source,
        })?;
        // compared against the canonical site root when excluding it from the file archive
        let staging_dir = fs::canonicalize(&staging_dir).map_err(|source| BuildError::Staging {
            path: staging_dir.clone(),
            source,
        })?;
        let run_dir = run.run_dir(&staging_dir);
        log::debug!(target: "archive", "Staging artifacts of run {} in {}", run.id(), run_dir.display());

        let timestamp = run.timestamp();

        let dump_name = if self.options.compress_dump {
            format!("db_backup_{timestamp}.sql.gz")
        } else {
            format!("db_backup_{timestamp}.sql")
        };
        let dump_path = run_dir.join(dump_name);
        database::dump_database(self.runner, self.site.db(), self.options, &dump_path)
            .map_err(BuildError::DumpFailed)?;
        let database = BackupArtifact::new(dump_path, ArtifactKind::Database);

        let files_path = run_dir.join(format!("files_backup_{timestamp}.zip"));
        files::archive_site(
            self.runner,
            self.site.root(),
            self.options,
            &staging_dir,
            &files_path,
        )
        .map_err(BuildError::ArchiveFailed)?;
        let filesystem = BackupArtifact::new(files_path, ArtifactKind::Filesystem);

        let merged_path = run_dir.join(backup_name(self.prefix, &timestamp));
        log::info!(target: "archive", "Merging backup archive {}", merged_path.display());
        merge::merge_flat(&[database.path.as_path(), filesystem.path.as_path()], &merged_path)
            .map_err(BuildError::MergeFailed)?;
        let merged = BackupArtifact::new(merged_path, ArtifactKind::Merged);

        Ok(BuiltArchive {
            run_dir,
            database,
            filesystem,
            merged,
        })
    }
}
