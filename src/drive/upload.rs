//! Upload of a merged backup archive.

use std::fs::{self, File};
use std::io;

use derive_more::{Display, Error};

use super::{DriveApi, DriveError, NewFile, RemoteBackupEntry, Session, UploadBody};
use crate::archive::BackupArtifact;
use crate::settings::UploadMode;

/// MIME type of uploaded backups.
pub const ARCHIVE_MIME_TYPE: &str = "application/zip";

/// Drive error reasons meaning the account has no space left.
const QUOTA_REASONS: [&str; 3] = [
    "storageQuotaExceeded",
    "quotaExceeded",
    "teamDriveFileLimitExceeded",
];

#[derive(Debug, Display, Error)]
/// Errors on uploading a backup. Local artifacts are kept on all of them.
pub enum UploadError {
    /// Drive couldn't be reached.
    #[display("Network failure during upload: {_0}")]
    NetworkFailure(#[error(ignore)] String),
    /// The Drive account is out of storage.
    #[display("Drive storage quota exceeded: {_0}")]
    QuotaExceeded(#[error(ignore)] String),
    /// The session was not accepted for the upload.
    #[display("Drive rejected the credentials ({status}): {message}")]
    AuthRejected { status: u16, message: String },
    /// Drive refused the upload for another reason.
    #[display("Drive rejected the upload ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The archive couldn't be read.
    #[display("Reading the archive failed: {_0}")]
    ReadArtifact(io::Error),
}

impl From<DriveError> for UploadError {
    fn from(e: DriveError) -> Self {
        match e {
            DriveError::Transport(message) | DriveError::Decode(message) => {
                UploadError::NetworkFailure(message)
            }
            DriveError::Status {
                reason: Some(reason),
                message,
                ..
            } if QUOTA_REASONS.contains(&reason.as_str()) => UploadError::QuotaExceeded(message),
            DriveError::Status {
                status: status @ (401 | 403),
                message,
                ..
            } => UploadError::AuthRejected { status, message },
            DriveError::Status {
                status, message, ..
            } => UploadError::Rejected { status, message },
        }
    }
}

/// Uploads the merged `artifact` into `folder`, named like the artifact.
pub fn upload<D: DriveApi>(
    drive: &D,
    session: &Session,
    artifact: &BackupArtifact,
    folder: &str,
    mode: UploadMode,
) -> Result<RemoteBackupEntry, UploadError> {
    let name = artifact.file_name();
    let body = match mode {
        UploadMode::Streaming => {
            let file = File::open(&artifact.path).map_err(UploadError::ReadArtifact)?;
            let len = file.metadata().map_err(UploadError::ReadArtifact)?.len();
            UploadBody::Stream { file, len }
        }
        UploadMode::Buffered => {
            UploadBody::Buffered(fs::read(&artifact.path).map_err(UploadError::ReadArtifact)?)
        }
    };
    log::info!(
        target: "drive::upload",
        "Uploading {name} ({} bytes, {mode}) into folder {folder}",
        body.len()
    );

    let entry = drive.create_file(
        session,
        &NewFile {
            name: &name,
            parent: folder,
            mime_type: ARCHIVE_MIME_TYPE,
        },
        body,
    )?;
    log::info!(target: "drive::upload", "Uploaded {} as {}", entry.name, entry.id);

    Ok(entry)
}
