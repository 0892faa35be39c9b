use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use wp_drive_backup_lib::cli::{Action, BackupArgs, Cli, SettingsAction};
use wp_drive_backup_lib::drive::auth::AuthError;
use wp_drive_backup_lib::drive::{GoogleDrive, GoogleOAuth};
use wp_drive_backup_lib::orchestrator::{DeleteOutcome, ListError, Orchestrator, RunState};
use wp_drive_backup_lib::settings::{Settings, SettingsStore};
use wp_drive_backup_lib::util::process::SystemRunner;
use wp_drive_backup_lib::wordpress::WordPress;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    let store = SettingsStore::new(cli.settings);
    run(&store, cli.action)
}

fn run(store: &SettingsStore, action: Action) -> ExitCode {
    let action = match action {
        Action::Install => {
            return match store.install() {
                Ok(true) => ExitCode::SUCCESS,
                Ok(false) => {
                    log::info!("Settings {} already exist, kept them", store.path().display());
                    ExitCode::SUCCESS
                }
                Err(e) => fail(format_args!("Installing the settings failed: {e}")),
            }
        }
        Action::Uninstall => {
            return match store.uninstall() {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => fail(format_args!("Removing the settings failed: {e}")),
            }
        }
        action => action,
    };

    let mut settings = match store.load_or_install() {
        Ok(settings) => settings,
        Err(e) => return fail(format_args!("Reading the settings failed: {e}")),
    };

    let oauth = match GoogleOAuth::new(settings.options.network_timeout()) {
        Ok(oauth) => oauth,
        Err(e) => return fail(format_args!("Creating the HTTP client failed: {e}")),
    };
    let drive = match GoogleDrive::new(
        settings.options.network_timeout(),
        settings.options.upload_timeout(),
    ) {
        Ok(drive) => drive,
        Err(e) => return fail(format_args!("Creating the HTTP client failed: {e}")),
    };
    let orchestrator = Orchestrator::new(store, &drive, &oauth, &SystemRunner);

    match action {
        Action::Install | Action::Uninstall => ExitCode::SUCCESS,
        Action::Settings(SettingsAction::Show) => match toml::to_string_pretty(&settings.masked()) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => fail(format_args!("Printing the settings failed: {e}")),
        },
        Action::Settings(SettingsAction::Set(args)) => {
            let saved = settings
                .apply(args.into())
                .and_then(|()| store.save(&settings));
            match saved {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => fail(format_args!("Saving the settings failed: {e}")),
            }
        }
        Action::Auth { code } => match orchestrator.authenticate(&mut settings, code.as_deref()) {
            Ok(_) => {
                println!("Connected to Google Drive.");
                ExitCode::SUCCESS
            }
            Err(e) => auth_failure(&e),
        },
        Action::Backup(BackupArgs { site_root }) => {
            let Some(site_root) = site_root.or_else(|| settings.options.site_root.clone()) else {
                return fail(format_args!(
                    "No WordPress root configured, pass --site-root or set it in the settings"
                ));
            };
            backup(&orchestrator, &mut settings, site_root)
        }
        Action::List => match orchestrator.list_backups(&mut settings) {
            Ok(entries) if entries.is_empty() => {
                println!("No backups found.");
                ExitCode::SUCCESS
            }
            Ok(entries) => {
                for entry in entries {
                    println!("{}\t{}", entry.id, entry.name);
                }
                ExitCode::SUCCESS
            }
            Err(ListError::Auth(e)) => auth_failure(&e),
            Err(e) => fail(format_args!("Listing the backups failed: {e}")),
        },
        Action::Delete { ids } => match orchestrator.run_delete(&mut settings, &ids) {
            DeleteOutcome::Deleted(report) => {
                for id in &report.succeeded {
                    println!("Deleted {id}");
                }
                for (id, e) in &report.failed {
                    log::error!("Deleting {id} failed: {e}");
                }
                if report.is_complete() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                }
            }
            DeleteOutcome::AwaitingUserAuth { consent_url } => {
                println!("Connect to Google Drive first: {consent_url}");
                ExitCode::FAILURE
            }
            DeleteOutcome::Failed(e) => auth_failure(&e),
        },
    }
}

fn backup<D, O, R>(
    orchestrator: &Orchestrator<'_, D, O, R>,
    settings: &mut Settings,
    site_root: PathBuf,
) -> ExitCode
where
    D: wp_drive_backup_lib::drive::DriveApi,
    O: wp_drive_backup_lib::drive::auth::TokenEndpoint,
    R: wp_drive_backup_lib::util::process::CommandRunner,
{
    let site = match WordPress::new(&site_root) {
        Ok(site) => site,
        Err(e) => return fail(format_args!("Opening the WordPress site failed: {e}")),
    };

    let report = orchestrator.run_backup(settings, &site);
    log::debug!("Backup run went through: {:?}", report.history);

    match &report.state {
        RunState::Done => {
            if let Some(entry) = &report.uploaded {
                println!("Uploaded {} ({})", entry.name, entry.id);
            }
            ExitCode::SUCCESS
        }
        RunState::AwaitingUserAuth { consent_url } => {
            println!("Connect to Google Drive first: {consent_url}");
            ExitCode::FAILURE
        }
        state => {
            log::error!("Backup {state}");
            for path in &report.preserved {
                println!("Kept local artifact {}", path.display());
            }
            ExitCode::FAILURE
        }
    }
}

fn auth_failure(e: &AuthError) -> ExitCode {
    match e.consent_url() {
        Some(consent_url) => {
            if !matches!(e, AuthError::NotAuthenticated { .. }) {
                log::error!("{e}");
            }
            println!("Connect to Google Drive by visiting:\n{consent_url}");
            println!("Then run `auth --code <code>` with the code of the redirect.");
        }
        None => log::error!("{e}"),
    }
    ExitCode::FAILURE
}

fn fail(message: std::fmt::Arguments<'_>) -> ExitCode {
    log::error!("{message}");
    ExitCode::FAILURE
}
