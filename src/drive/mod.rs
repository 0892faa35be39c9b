//! Google Drive as backup destination.
//!
//! - [auth]: OAuth2 session handling.
//! - [upload]: Uploading merged archives.
//! - [backups]: Listing and deleting uploaded backups.
//! - [google]: HTTP implementation of [DriveApi] and [auth::TokenEndpoint].

pub mod auth;
pub mod backups;
pub mod google;
pub mod upload;

use std::fs::File;

use derive_more::{Display, Error};

pub use auth::{Authenticator, Session, Token};
pub use backups::{Backups, DeletionError, DeletionReport};
pub use google::{GoogleDrive, GoogleOAuth};
pub use upload::UploadError;

/// A file stored in Drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBackupEntry {
    pub id: String,
    pub name: String,
    pub parent_folder_id: Option<String>,
}

/// One page of a file listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilePage {
    pub files: Vec<RemoteBackupEntry>,
    /// Token of the following page, [None] on the last page.
    pub next_page_token: Option<String>,
}

/// Metadata of a file to create.
#[derive(Debug, Clone, Copy)]
pub struct NewFile<'a> {
    pub name: &'a str,
    pub parent: &'a str,
    pub mime_type: &'a str,
}

/// Content of a file to create.
#[derive(Debug)]
pub enum UploadBody {
    /// Streamed from the open file.
    Stream { file: File, len: u64 },
    /// Already in memory.
    Buffered(Vec<u8>),
}

impl UploadBody {
    pub fn len(&self) -> u64 {
        match self {
            UploadBody::Stream { len, .. } => *len,
            UploadBody::Buffered(data) => data.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Display, Error)]
/// Errors of Drive API calls.
pub enum DriveError {
    /// The request didn't get a response.
    #[display("Drive request failed: {_0}")]
    Transport(#[error(ignore)] String),
    /// Drive answered with an error status.
    #[display("Drive rejected the request with status {status}: {message}")]
    Status {
        status: u16,
        /// Machine readable reason, e.g. `storageQuotaExceeded`.
        reason: Option<String>,
        message: String,
    },
    /// The response was not understood.
    #[display("Unexpected Drive response: {_0}")]
    Decode(#[error(ignore)] String),
}

/// Operations on Drive used by the backups.
pub trait DriveApi {
    /// Creates a file with the given content.
    fn create_file(
        &self,
        session: &Session,
        file: &NewFile<'_>,
        body: UploadBody,
    ) -> Result<RemoteBackupEntry, DriveError>;

    /// Lists one page of files matching the Drive search `query`.
    fn list_files(
        &self,
        session: &Session,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<FilePage, DriveError>;

    /// Deletes the file permanently.
    fn delete_file(&self, session: &Session, id: &str) -> Result<(), DriveError>;
}
