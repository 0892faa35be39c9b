//! Persisted settings: Drive credentials, target folder and backup options.
//!
//! The settings live in a single TOML file managed by a [SettingsStore].
//! They are loaded once per command and written back explicitly through
//! [SettingsStore::save].

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use clap::ValueEnum;
use derive_more::{Display, Error, From};
use regex::Regex;

use crate::drive::auth::Token;

/// Prefix used for backup names when none is configured.
pub const DEFAULT_PREFIX: &str = "wp-backup";

/// Drive alias of the "My Drive" root folder.
pub const ROOT_FOLDER: &str = "root";

const MASK: &str = "********";

/// Settings of a single site.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    /// OAuth2 client id of the Google Cloud project.
    pub client_id: String,
    /// OAuth2 client secret of the Google Cloud project.
    pub client_secret: String,
    /// JSON encoded [Token] including its refresh token.
    pub access_token: String,
    /// Drive folder receiving the backups.
    pub folder_id: String,
    /// Name prefix of the backups, also used to filter the backup list.
    pub backup_prefix: String,
    /// Options of the backup run.
    pub options: Options,
}

/// How the merged archive is sent to Drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Display, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// Resumable upload session, the archive is streamed from disk.
    #[default]
    #[display("streaming")]
    Streaming,
    /// Single multipart request with the archive read into memory.
    #[display("buffered")]
    Buffered,
}

/// Options of a backup run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Options {
    /// Root directory of the WordPress installation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_root: Option<PathBuf>,
    /// Directory for temporary artifacts. Defaults to `<wp-content>/backups`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
    /// Paths relative to the site root left out of the file archive.
    pub exclude: Vec<String>,
    /// Redirect URI registered for the OAuth2 client.
    pub redirect_uri: String,
    pub upload_mode: UploadMode,
    /// Gzip the database dump before merging.
    pub compress_dump: bool,
    pub mysqldump: PathBuf,
    pub zip: PathBuf,
    pub dump_timeout_secs: u64,
    pub archive_timeout_secs: u64,
    /// Timeout of API calls.
    pub network_timeout_secs: u64,
    /// Timeout of transferring the archive.
    pub upload_timeout_secs: u64,
    /// Lifetime of the run-lock.
    pub lock_ttl_secs: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            site_root: None,
            staging_dir: None,
            exclude: vec![
                "wp-content/uploads".into(),
                "wp-content/cache".into(),
                "wp-content/backups".into(),
            ],
            redirect_uri: "http://localhost".into(),
            upload_mode: UploadMode::default(),
            compress_dump: false,
            mysqldump: "mysqldump".into(),
            zip: "zip".into(),
            dump_timeout_secs: 30 * 60,
            archive_timeout_secs: 60 * 60,
            network_timeout_secs: 60,
            upload_timeout_secs: 2 * 60 * 60,
            lock_ttl_secs: 4 * 60 * 60,
        }
    }
}

impl Options {
    pub fn dump_timeout(&self) -> Duration {
        Duration::from_secs(self.dump_timeout_secs)
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

impl Settings {
    pub fn has_client_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    /// Backup name prefix, [DEFAULT_PREFIX] if none is configured.
    pub fn effective_prefix(&self) -> &str {
        if self.backup_prefix.is_empty() {
            log::debug!(target: "settings", "No backup prefix configured, using {DEFAULT_PREFIX}");
            DEFAULT_PREFIX
        } else {
            &self.backup_prefix
        }
    }

    /// Drive folder of the backups, [ROOT_FOLDER] if none is configured.
    pub fn effective_folder(&self) -> &str {
        if self.folder_id.is_empty() {
            ROOT_FOLDER
        } else {
            &self.folder_id
        }
    }

    /// The stored token, [None] if there is none or it can't be read.
    pub fn token(&self) -> Option<Token> {
        if self.access_token.trim().is_empty() {
            return None;
        }

        match serde_json::from_str(&self.access_token) {
            Ok(token) => Some(token),
            Err(e) => {
                log::warn!(target: "settings", "Stored access token is unreadable, re-authentication required: {e}");
                None
            }
        }
    }

    pub fn set_token(&mut self, token: &Token) -> Result<(), SettingsError> {
        self.access_token = serde_json::to_string(token)?;
        Ok(())
    }

    /// Applies a [SettingsUpdate] after sanitizing its values.
    pub fn apply(&mut self, update: SettingsUpdate) -> Result<(), SettingsError> {
        if let Some(prefix) = update.backup_prefix {
            let prefix = sanitize_text_field(&prefix);
            if prefix.contains(['/', '\\']) {
                return Err(SettingsError::InvalidPrefix(prefix));
            }
            self.backup_prefix = prefix;
        }
        if let Some(client_id) = update.client_id {
            self.client_id = sanitize_text_field(&client_id);
        }
        if let Some(client_secret) = update.client_secret {
            self.client_secret = sanitize_text_field(&client_secret);
        }
        if let Some(folder_id) = update.folder_id {
            self.folder_id = sanitize_text_field(&folder_id);
        }
        if let Some(site_root) = update.site_root {
            self.options.site_root = Some(site_root);
        }
        if let Some(upload_mode) = update.upload_mode {
            self.options.upload_mode = upload_mode;
        }

        Ok(())
    }

    /// Copy with secrets replaced, suitable for printing.
    pub fn masked(&self) -> Self {
        let mask = |value: &str| {
            if value.is_empty() {
                String::new()
            } else {
                MASK.to_string()
            }
        };

        Self {
            client_secret: mask(&self.client_secret),
            access_token: mask(&self.access_token),
            ..self.clone()
        }
    }
}

/// Changes to [Settings]; [None] leaves a value untouched.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub folder_id: Option<String>,
    pub backup_prefix: Option<String>,
    pub site_root: Option<PathBuf>,
    pub upload_mode: Option<UploadMode>,
}

static TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Strips tags and control characters and collapses whitespace.
pub fn sanitize_text_field(value: &str) -> String {
    let without_tags = TAGS.replace_all(value, "");
    let printable: String = without_tags
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    WHITESPACE.replace_all(&printable, " ").trim().to_string()
}

#[derive(Debug, Display, Error, From)]
/// Errors on reading or writing [Settings].
pub enum SettingsError {
    /// Reading the settings file failed.
    #[display("Reading settings {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    /// Writing the settings file failed.
    #[display("Writing settings {} failed: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[from]
    #[display("Settings are malformed: {_0}")]
    Parse(toml::de::Error),
    #[from]
    #[display("Settings can't be serialized: {_0}")]
    Serialize(toml::ser::Error),
    #[from]
    #[display("Token can't be serialized: {_0}")]
    Token(serde_json::Error),
    /// A backup prefix must not contain path separators.
    #[display("Backup prefix must not contain path separators: {_0}")]
    InvalidPrefix(#[error(ignore)] String),
}

/// File backed storage of [Settings].
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_relative() {
            log::debug!(target: "settings", "Settings path is relative: {}", path.display());
        }

        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the settings file with empty values unless it exists.
    ///
    /// Returns whether the file was created.
    pub fn install(&self) -> Result<bool, SettingsError> {
        if self.path.exists() {
            log::debug!(target: "settings", "Settings {} already exist", self.path.display());
            return Ok(false);
        }

        self.save(&Settings::default())?;
        log::info!(target: "settings", "Installed settings at {}", self.path.display());
        Ok(true)
    }

    /// Deletes the settings file. Returns whether there was one.
    pub fn uninstall(&self) -> Result<bool, SettingsError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::info!(target: "settings", "Removed settings {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(SettingsError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }

    pub fn load(&self) -> Result<Settings, SettingsError> {
        let content = fs::read_to_string(&self.path).map_err(|source| SettingsError::Read {
            path: self.path.clone(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Loads the settings, installing defaults if there are none yet.
    pub fn load_or_install(&self) -> Result<Settings, SettingsError> {
        match self.load() {
            Err(SettingsError::Read { source, .. }) if source.kind() == ErrorKind::NotFound => {
                log::debug!(
                    target: "settings",
                    "Writing default settings to {} because they don't exist yet",
                    self.path.display()
                );
                self.install()?;
                Ok(Settings::default())
            }
            other => other,
        }
    }

    /// Writes the settings atomically.
    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let content = toml::to_string_pretty(settings)?;
        let write_err = |source| SettingsError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(format!(".{}.tmp", std::process::id()));
        let tmp_path = self.path.with_file_name(tmp_name);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            // credentials are only for the operator
            options.mode(0o600);
        }

        let result = options
            .open(&tmp_path)
            .and_then(|mut file| {
                file.write_all(content.as_bytes())?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp_path, &self.path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(write_err(e));
        }

        log::trace!(target: "settings", "Saved settings to {}", self.path.display());
        Ok(())
    }
}
