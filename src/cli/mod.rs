use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::settings::{SettingsUpdate, UploadMode};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    /// Settings file holding credentials and backup options.
    #[arg(
        long,
        global = true,
        env = "WP_DRIVE_BACKUP_SETTINGS",
        default_value = "wp-drive-backup.toml"
    )]
    pub settings: PathBuf,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Create the settings file with empty values.
    Install,
    /// Delete the settings file including all credentials.
    Uninstall,
    /// Show or change the settings.
    #[command(subcommand)]
    Settings(SettingsAction),
    /// Connect to Google Drive.
    ///
    /// Without `--code` the consent URL is printed. Visit it and pass the
    /// `code` parameter of the redirect back with `--code`.
    Auth {
        /// Authorization code returned by the consent screen.
        #[arg(long)]
        code: Option<String>,
    },
    /// Backup the site database and files to Google Drive.
    Backup(BackupArgs),
    /// List the backups in the Drive folder.
    List,
    /// Delete backups from the Drive folder.
    Delete {
        /// Drive ids of the backups, see `list`.
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SettingsAction {
    /// Print the settings with secrets masked.
    Show,
    /// Change settings. Values are sanitized before they are saved.
    Set(SetArgs),
}

#[derive(Args, Debug, Default)]
pub struct SetArgs {
    /// OAuth2 client id.
    #[arg(long)]
    pub client_id: Option<String>,

    /// OAuth2 client secret.
    #[arg(long)]
    pub client_secret: Option<String>,

    /// Drive folder receiving the backups.
    #[arg(long)]
    pub folder_id: Option<String>,

    /// Name prefix of the backups.
    #[arg(long)]
    pub prefix: Option<String>,

    /// Root directory of the WordPress installation.
    #[arg(long)]
    pub site_root: Option<PathBuf>,

    /// How archives are uploaded.
    #[arg(long)]
    pub upload_mode: Option<UploadMode>,
}

impl From<SetArgs> for SettingsUpdate {
    fn from(args: SetArgs) -> Self {
        Self {
            client_id: args.client_id,
            client_secret: args.client_secret,
            folder_id: args.folder_id,
            backup_prefix: args.prefix,
            site_root: args.site_root,
            upload_mode: args.upload_mode,
        }
    }
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Root directory of the WordPress installation. Overrides the settings.
    #[arg(long, env = "WP_DRIVE_BACKUP_SITE_ROOT")]
    pub site_root: Option<PathBuf>,
}
