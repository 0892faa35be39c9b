//! Discovery of a WordPress installation on disk.

mod wp_config;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

pub use wp_config::{DbHost, DbParams, WpConfig};

const WP_CONFIG: &str = "wp-config.php";
const CONTENT_DIR: &str = "wp-content";
const BACKUP_DIR: &str = "backups";

#[derive(Debug, Display, Error)]
/// Errors on discovering the WordPress installation.
pub enum SiteError {
    /// The site root is not a directory.
    #[display("WordPress root is not a directory: {}", _0.display())]
    NotADirectory(#[error(ignore)] PathBuf),
    /// Neither the site root nor its parent contain `wp-config.php`.
    #[display("No wp-config.php found for WordPress root {}", _0.display())]
    ConfigNotFound(#[error(ignore)] PathBuf),
    #[display("Reading {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    /// A required constant is not defined in `wp-config.php`.
    #[display("wp-config.php doesn't define {_0}")]
    MissingDefine(#[error(ignore)] &'static str),
}

/// A WordPress installation.
#[derive(Debug, Clone)]
pub struct WordPress {
    root: PathBuf,
    config_path: PathBuf,
    config: WpConfig,
}

impl WordPress {
    /// Opens the installation at `root` and reads its `wp-config.php`.
    ///
    /// Like WordPress itself, `wp-config.php` may live one level above the root.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, SiteError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(SiteError::NotADirectory(root.to_path_buf()));
        }
        let root = fs::canonicalize(root).map_err(|source| SiteError::Read {
            path: root.to_path_buf(),
            source,
        })?;

        let config_path = [Some(root.as_path()), root.parent()]
            .into_iter()
            .flatten()
            .map(|dir| dir.join(WP_CONFIG))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| SiteError::ConfigNotFound(root.clone()))?;
        log::debug!(target: "wordpress", "Reading {}", config_path.display());

        let source = fs::read_to_string(&config_path).map_err(|source| SiteError::Read {
            path: config_path.clone(),
            source,
        })?;
        let config = WpConfig::parse(&source)?;

        Ok(Self {
            root,
            config_path,
            config,
        })
    }

    /// Absolute path of the installation.
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    pub fn config_path(&self) -> &Path {
        self.config_path.as_path()
    }

    pub fn db(&self) -> &DbParams {
        &self.config.db
    }

    /// `WP_CONTENT_DIR`, defaulting to `<root>/wp-content`.
    pub fn content_dir(&self) -> PathBuf {
        match &self.config.content_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.root.join(dir),
            None => self.root.join(CONTENT_DIR),
        }
    }

    /// Default directory for temporary backup artifacts.
    pub fn default_staging_dir(&self) -> PathBuf {
        self.content_dir().join(BACKUP_DIR)
    }
}
