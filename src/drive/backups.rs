//! Listing and deleting uploaded backups.

use std::collections::BTreeMap;

use derive_more::{Display, Error};

use super::{DriveApi, DriveError, RemoteBackupEntry, Session};

/// Drive search query for all files directly inside `folder`.
pub fn parents_query(folder: &str) -> String {
    let escaped = folder.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}' in parents")
}

/// The backups in a Drive folder: files whose name starts with a prefix.
///
/// Nothing is fetched until iterated. Every iteration enumerates the folder
/// anew, following all result pages, and keeps the order of Drive.
pub struct Backups<'a, D> {
    drive: &'a D,
    session: &'a Session,
    query: String,
    prefix: String,
}

/// Backups in `folder` named with `prefix`.
pub fn list<'a, D: DriveApi>(
    drive: &'a D,
    session: &'a Session,
    folder: &str,
    prefix: &str,
) -> Backups<'a, D> {
    Backups {
        drive,
        session,
        query: parents_query(folder),
        prefix: prefix.to_string(),
    }
}

impl<'a, D: DriveApi> Backups<'a, D> {
    pub fn iter(&self) -> BackupIter<'_, D> {
        BackupIter {
            backups: self,
            page: Vec::new().into_iter(),
            pending: Some(None),
        }
    }

    /// Collects all backups, failing on the first Drive error.
    pub fn fetch_all(&self) -> Result<Vec<RemoteBackupEntry>, DriveError> {
        self.iter().collect()
    }
}

impl<'b, 'a, D: DriveApi> IntoIterator for &'b Backups<'a, D> {
    type Item = Result<RemoteBackupEntry, DriveError>;
    type IntoIter = BackupIter<'b, D>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over [Backups]. Ends after the first error.
pub struct BackupIter<'b, D> {
    backups: &'b Backups<'b, D>,
    page: std::vec::IntoIter<RemoteBackupEntry>,
    /// Page to fetch next: `Some(None)` is the first page, [None] means done.
    pending: Option<Option<String>>,
}

impl<'b, D: DriveApi> Iterator for BackupIter<'b, D> {
    type Item = Result<RemoteBackupEntry, DriveError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.page.next() {
                if entry.name.starts_with(&self.backups.prefix) {
                    return Some(Ok(entry));
                }
                log::trace!(target: "drive::backups", "Skipping {}: prefix doesn't match", entry.name);
                continue;
            }

            let page_token = self.pending.take()?;
            log::debug!(target: "drive::backups", "Listing {} (page {page_token:?})", self.backups.query);
            match self.backups.drive.list_files(
                self.backups.session,
                &self.backups.query,
                page_token.as_deref(),
            ) {
                Ok(page) => {
                    self.pending = page.next_page_token.map(Some);
                    self.page = page.files.into_iter();
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Display, Error)]
/// Errors on deleting a single backup.
pub enum DeletionError {
    #[display("Backup not found: {_0}")]
    NotFound(#[error(ignore)] String),
    #[display("Permission denied: {_0}")]
    PermissionDenied(#[error(ignore)] String),
    #[display("Deletion failed: {_0}")]
    Other(DriveError),
}

impl From<DriveError> for DeletionError {
    fn from(e: DriveError) -> Self {
        match e {
            DriveError::Status {
                status: 404,
                message,
                ..
            } => DeletionError::NotFound(message),
            DriveError::Status {
                status: 401 | 403,
                message,
                ..
            } => DeletionError::PermissionDenied(message),
            other => DeletionError::Other(other),
        }
    }
}

/// Outcome of deleting several backups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletionReport {
    /// Deleted ids in request order.
    pub succeeded: Vec<String>,
    pub failed: BTreeMap<String, DeletionError>,
}

impl DeletionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Deletes every id independently. A failing deletion doesn't stop the others.
pub fn delete<D: DriveApi>(drive: &D, session: &Session, ids: &[String]) -> DeletionReport {
    let mut report = DeletionReport::default();

    for id in ids {
        if report.succeeded.contains(id) || report.failed.contains_key(id) {
            continue;
        }

        match drive.delete_file(session, id) {
            Ok(()) => {
                log::info!(target: "drive::backups", "Deleted backup {id}");
                report.succeeded.push(id.clone());
            }
            Err(e) => {
                let e = DeletionError::from(e);
                log::error!(target: "drive::backups", "Error deleting backup {id}: {e}");
                report.failed.insert(id.clone(), e);
            }
        }
    }

    report
}
