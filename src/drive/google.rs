//! Google Drive v3 and Google OAuth2 over HTTP.

use std::io::Write;
use std::time::Duration;

use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use serde_json::json;
use url::Url;
use uuid::Uuid;

use super::auth::{ClientCredentials, OAuthError, Token, TokenEndpoint};
use super::{DriveApi, DriveError, FilePage, NewFile, RemoteBackupEntry, Session, UploadBody};

const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const FILE_FIELDS: &str = "id,name,parents";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,parents)";
const PAGE_SIZE: &str = "100";

#[derive(Debug, serde::Deserialize)]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    parents: Vec<String>,
}

impl From<DriveFile> for RemoteBackupEntry {
    fn from(file: DriveFile) -> Self {
        Self {
            id: file.id,
            name: file.name,
            parent_folder_id: file.parents.into_iter().next(),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, serde::Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct TokenErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

impl From<reqwest::Error> for DriveError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            DriveError::Decode(e.to_string())
        } else {
            DriveError::Transport(e.to_string())
        }
    }
}

impl From<reqwest::Error> for OAuthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            OAuthError::Decode(e.to_string())
        } else {
            OAuthError::Transport(e.to_string())
        }
    }
}

fn client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Drive v3 REST client.
#[derive(Debug, Clone)]
pub struct GoogleDrive {
    client: Client,
    upload_timeout: Duration,
}

impl GoogleDrive {
    /// `timeout` bounds API calls, `upload_timeout` the transfer of file content.
    pub fn new(timeout: Duration, upload_timeout: Duration) -> Result<Self, DriveError> {
        Ok(Self {
            client: client(timeout)?,
            upload_timeout,
        })
    }

    fn check(response: Response) -> Result<Response, DriveError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().unwrap_or_default();
        let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let reason = body.error.errors.into_iter().find_map(|e| e.reason);
        let message = if body.error.message.is_empty() {
            status.canonical_reason().unwrap_or("unknown").to_string()
        } else {
            body.error.message
        };
        log::debug!(target: "drive::google", "Drive answered {status}: {text}");

        Err(DriveError::Status {
            status: status.as_u16(),
            reason,
            message,
        })
    }

    fn send_file(request: RequestBuilder) -> Result<RemoteBackupEntry, DriveError> {
        let response = Self::check(request.send()?)?;
        let file: DriveFile = response.json()?;
        Ok(file.into())
    }

    fn file_url(id: &str) -> Result<Url, DriveError> {
        let mut url = Url::parse(FILES_URL).map_err(|e| DriveError::Decode(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| DriveError::Decode(format!("{FILES_URL} can't have path segments")))?
            .push(id);
        Ok(url)
    }

    /// Opens a resumable upload session and streams the file into it.
    fn upload_resumable(
        &self,
        session: &Session,
        file: &NewFile<'_>,
        content: std::fs::File,
        len: u64,
    ) -> Result<RemoteBackupEntry, DriveError> {
        let metadata = json!({ "name": file.name, "parents": [file.parent] });
        let response = self
            .client
            .post(UPLOAD_URL)
            .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
            .bearer_auth(session.access_token())
            .header("X-Upload-Content-Type", file.mime_type)
            .header("X-Upload-Content-Length", len)
            .json(&metadata)
            .send()?;
        let response = Self::check(response)?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DriveError::Decode("resumable upload without session URI".into()))?
            .to_string();
        log::trace!(target: "drive::google", "Resumable upload session: {location}");

        Self::send_file(
            self.client
                .put(location)
                .timeout(self.upload_timeout)
                .header(CONTENT_TYPE, file.mime_type)
                .body(Body::sized(content, len)),
        )
    }

    fn upload_multipart(
        &self,
        session: &Session,
        file: &NewFile<'_>,
        content: Vec<u8>,
    ) -> Result<RemoteBackupEntry, DriveError> {
        let boundary = format!("wp_drive_backup_{}", Uuid::new_v4().simple());
        let metadata = json!({ "name": file.name, "parents": [file.parent] });
        let body = multipart_related(&boundary, &metadata, file.mime_type, &content);

        Self::send_file(
            self.client
                .post(UPLOAD_URL)
                .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
                .timeout(self.upload_timeout)
                .bearer_auth(session.access_token())
                .header(CONTENT_TYPE, format!("multipart/related; boundary={boundary}"))
                .body(body),
        )
    }
}

/// Body of a `multipart/related` upload: JSON metadata followed by the content.
fn multipart_related(
    boundary: &str,
    metadata: &serde_json::Value,
    mime_type: &str,
    content: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 512);
    // writing into a Vec can't fail
    let _ = write!(
        body,
        "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
         --{boundary}\r\nContent-Type: {mime_type}\r\n\r\n"
    );
    body.extend_from_slice(content);
    let _ = write!(body, "\r\n--{boundary}--\r\n");
    body
}

impl DriveApi for GoogleDrive {
    fn create_file(
        &self,
        session: &Session,
        file: &NewFile<'_>,
        body: UploadBody,
    ) -> Result<RemoteBackupEntry, DriveError> {
        match body {
            UploadBody::Stream { file: content, len } => {
                self.upload_resumable(session, file, content, len)
            }
            UploadBody::Buffered(content) => self.upload_multipart(session, file, content),
        }
    }

    fn list_files(
        &self,
        session: &Session,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<FilePage, DriveError> {
        let mut params = vec![("q", query), ("fields", LIST_FIELDS), ("pageSize", PAGE_SIZE)];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let response = self
            .client
            .get(FILES_URL)
            .query(&params)
            .bearer_auth(session.access_token())
            .send()?;
        let list: FileList = Self::check(response)?.json()?;

        Ok(FilePage {
            files: list.files.into_iter().map(Into::into).collect(),
            next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    fn delete_file(&self, session: &Session, id: &str) -> Result<(), DriveError> {
        let response = self
            .client
            .delete(Self::file_url(id)?)
            .bearer_auth(session.access_token())
            .send()?;
        Self::check(response)?;
        Ok(())
    }
}

/// Google's OAuth2 token endpoint.
#[derive(Debug, Clone)]
pub struct GoogleOAuth {
    client: Client,
}

impl GoogleOAuth {
    pub fn new(timeout: Duration) -> Result<Self, OAuthError> {
        Ok(Self {
            client: client(timeout)?,
        })
    }

    fn request_token(&self, form: &[(&str, &str)]) -> Result<Token, OAuthError> {
        let response = self.client.post(TOKEN_URL).form(form).send()?;
        let status = response.status();
        if !status.is_success() {
            let body: TokenErrorBody = response.json().unwrap_or_default();
            return Err(OAuthError::Rejected {
                status: status.as_u16(),
                error: body.error,
                description: body.error_description,
            });
        }

        Ok(response.json()?)
    }
}

impl TokenEndpoint for GoogleOAuth {
    fn exchange_code(&self, client: &ClientCredentials, code: &str) -> Result<Token, OAuthError> {
        self.request_token(&[
            ("code", code),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
            ("redirect_uri", client.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
    }

    fn refresh(&self, client: &ClientCredentials, refresh_token: &str) -> Result<Token, OAuthError> {
        self.request_token(&[
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ])
    }
}
