use std::cell::{Cell, RefCell};
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use zip::ZipArchive;

use wp_drive_backup_lib::archive::BuildError;
use wp_drive_backup_lib::drive::auth::{AuthError, ClientCredentials, OAuthError, TokenEndpoint};
use wp_drive_backup_lib::drive::backups::DeletionError;
use wp_drive_backup_lib::drive::{
    DriveApi, DriveError, FilePage, NewFile, RemoteBackupEntry, Session, Token, UploadBody,
    UploadError,
};
use wp_drive_backup_lib::orchestrator::{
    DeleteOutcome, FailureReason, Orchestrator, RunState, Stage,
};
use wp_drive_backup_lib::settings::{Settings, SettingsStore, UploadMode};
use wp_drive_backup_lib::util::lock::{LockError, RunLock, LOCK_FILE};
use wp_drive_backup_lib::util::process::{
    CommandError, CommandOutput, CommandRunner, Invocation, Stdout,
};
use wp_drive_backup_lib::wordpress::WordPress;

const WP_CONFIG: &str = r#"<?php
define( 'DB_NAME', 'wordpress' );
define( 'DB_USER', 'wp' );
define( 'DB_PASSWORD', 's3cr3t' );
define( 'DB_HOST', 'localhost:3307' );
$table_prefix = 'wp_';
"#;

/// Pretends to be `mysqldump` and `zip`, writing small artifacts.
#[derive(Default)]
struct FakeRunner {
    dump_exit_code: i32,
    zip_exit_code: i32,
    calls: RefCell<Vec<String>>,
}

impl CommandRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        let program = invocation.program_name();
        self.calls.borrow_mut().push(program.clone());

        let exit_code = if program == "mysqldump" {
            if self.dump_exit_code == 0 {
                if let Stdout::File(path) | Stdout::Gzip(path) = &invocation.stdout {
                    fs::write(path, "-- MySQL dump\nCREATE TABLE wp_posts;\n").unwrap();
                }
            }
            self.dump_exit_code
        } else {
            if self.zip_exit_code == 0 {
                let dest = invocation
                    .args
                    .iter()
                    .find(|arg| arg.ends_with(".zip"))
                    .expect("zip destination");
                fs::write(dest, "site files").unwrap();
            }
            self.zip_exit_code
        };

        Ok(CommandOutput {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: match exit_code {
                0 => String::new(),
                _ if program == "mysqldump" => "mysqldump: Got error: 1045: Access denied".into(),
                _ => "zip error: Zip file structure invalid".into(),
            },
        })
    }
}

/// Drive folder kept in memory.
#[derive(Default)]
struct FakeDrive {
    files: RefCell<Vec<(RemoteBackupEntry, Vec<u8>)>>,
    upload_error: Option<DriveError>,
    calls: Cell<usize>,
}

impl FakeDrive {
    fn with_files(names: &[(&str, &str)]) -> Self {
        let drive = Self::default();
        for (id, name) in names {
            drive.files.borrow_mut().push((entry(id, name), Vec::new()));
        }
        drive
    }
}

fn entry(id: &str, name: &str) -> RemoteBackupEntry {
    RemoteBackupEntry {
        id: id.into(),
        name: name.into(),
        parent_folder_id: Some("folder-1".into()),
    }
}

impl DriveApi for FakeDrive {
    fn create_file(
        &self,
        _session: &Session,
        file: &NewFile<'_>,
        body: UploadBody,
    ) -> Result<RemoteBackupEntry, DriveError> {
        self.calls.set(self.calls.get() + 1);
        if let Some(e) = &self.upload_error {
            return Err(e.clone());
        }

        let content = match body {
            UploadBody::Stream { mut file, .. } => {
                let mut content = Vec::new();
                file.read_to_end(&mut content).unwrap();
                content
            }
            UploadBody::Buffered(content) => content,
        };
        let created = RemoteBackupEntry {
            id: format!("id-{}", self.files.borrow().len() + 1),
            name: file.name.to_string(),
            parent_folder_id: Some(file.parent.to_string()),
        };
        self.files.borrow_mut().push((created.clone(), content));
        Ok(created)
    }

    fn list_files(
        &self,
        _session: &Session,
        _query: &str,
        _page_token: Option<&str>,
    ) -> Result<FilePage, DriveError> {
        self.calls.set(self.calls.get() + 1);
        Ok(FilePage {
            files: self.files.borrow().iter().map(|(e, _)| e.clone()).collect(),
            next_page_token: None,
        })
    }

    fn delete_file(&self, _session: &Session, id: &str) -> Result<(), DriveError> {
        self.calls.set(self.calls.get() + 1);
        let mut files = self.files.borrow_mut();
        match files.iter().position(|(e, _)| e.id == id) {
            Some(index) => {
                files.remove(index);
                Ok(())
            }
            None => Err(DriveError::Status {
                status: 404,
                reason: Some("notFound".into()),
                message: format!("File not found: {id}"),
            }),
        }
    }
}

/// Token endpoint that is offline unless told how to answer refreshes.
#[derive(Default)]
struct FakeOAuth {
    calls: Cell<usize>,
    refresh_error: Option<OAuthError>,
}

impl TokenEndpoint for FakeOAuth {
    fn exchange_code(&self, _client: &ClientCredentials, _code: &str) -> Result<Token, OAuthError> {
        self.calls.set(self.calls.get() + 1);
        Err(OAuthError::Transport("offline".into()))
    }

    fn refresh(&self, _client: &ClientCredentials, _refresh_token: &str) -> Result<Token, OAuthError> {
        self.calls.set(self.calls.get() + 1);
        Err(self
            .refresh_error
            .clone()
            .unwrap_or_else(|| OAuthError::Transport("offline".into())))
    }
}

struct Fixture {
    _dir: TempDir,
    site: WordPress,
    staging_dir: PathBuf,
    store: SettingsStore,
    settings: Settings,
}

fn fixture(authenticated: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("htdocs");
    fs::create_dir_all(root.join("wp-content/uploads")).unwrap();
    fs::write(root.join("wp-config.php"), WP_CONFIG).unwrap();
    fs::write(root.join("index.php"), "<?php require 'wp-blog-header.php';").unwrap();
    let site = WordPress::new(&root).unwrap();

    let staging_dir = dir.path().join("staging");
    let store = SettingsStore::new(dir.path().join("settings.toml"));

    let mut settings = Settings {
        client_id: "client.apps.googleusercontent.com".into(),
        client_secret: "secret".into(),
        folder_id: "folder-1".into(),
        backup_prefix: "site1".into(),
        ..Settings::default()
    };
    settings.options.staging_dir = Some(staging_dir.clone());
    if authenticated {
        settings
            .set_token(&Token {
                access_token: "ya29.token".into(),
                refresh_token: Some("1//refresh".into()),
                expires_in: 3600,
                created: Utc::now().timestamp(),
                scope: None,
                token_type: "Bearer".into(),
            })
            .unwrap();
    }
    store.save(&settings).unwrap();

    Fixture {
        _dir: dir,
        site,
        staging_dir,
        store,
        settings,
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir).map_or(true, |mut entries| entries.next().is_none())
}

#[test]
fn backup_round_trip() {
    let mut fx = fixture(true);
    let (drive, oauth, runner) = (FakeDrive::default(), FakeOAuth::default(), FakeRunner::default());
    let orchestrator = Orchestrator::new(&fx.store, &drive, &oauth, &runner);

    let report = orchestrator.run_backup(&mut fx.settings, &fx.site);

    assert!(report.succeeded(), "{}", report.state);
    assert_eq!(
        report.history,
        [
            Stage::Idle,
            Stage::Authenticating,
            Stage::Building,
            Stage::Uploading,
            Stage::CleaningUp,
            Stage::Done,
        ]
    );
    assert!(report.preserved.is_empty());
    assert_eq!(*runner.calls.borrow(), ["mysqldump", "zip"]);
    assert_eq!(oauth.calls.get(), 0);

    let uploaded = report.uploaded.expect("uploaded entry");
    let name = uploaded.name.strip_prefix("site1_").unwrap().strip_suffix(".zip").unwrap();
    assert_eq!(name.len(), 14);
    assert!(name.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(uploaded.parent_folder_id.as_deref(), Some("folder-1"));

    // the uploaded archive holds dump and file archive side by side
    let content = drive.files.borrow()[0].1.clone();
    let archive = ZipArchive::new(Cursor::new(content)).unwrap();
    let mut entries: Vec<_> = archive.file_names().map(String::from).collect();
    entries.sort();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].starts_with("db_backup_") && entries[0].ends_with(".sql"));
    assert!(entries[1].starts_with("files_backup_") && entries[1].ends_with(".zip"));

    // the staging directory is left empty, including the run-lock
    assert!(dir_is_empty(&fx.staging_dir));

    let listed = orchestrator.list_backups(&mut fx.settings).unwrap();
    assert_eq!(listed, [uploaded]);
}

#[test]
fn buffered_upload_sends_the_same_archive() {
    let mut fx = fixture(true);
    fx.settings.options.upload_mode = UploadMode::Buffered;
    let (drive, oauth, runner) = (FakeDrive::default(), FakeOAuth::default(), FakeRunner::default());
    let orchestrator = Orchestrator::new(&fx.store, &drive, &oauth, &runner);

    let report = orchestrator.run_backup(&mut fx.settings, &fx.site);

    assert!(report.succeeded(), "{}", report.state);
    let files = drive.files.borrow();
    assert_eq!(files.len(), 1);
    assert!(ZipArchive::new(Cursor::new(files[0].1.clone())).is_ok());
}

#[test]
fn failed_dump_aborts_before_archiving() {
    let mut fx = fixture(true);
    let (drive, oauth, runner) = (
        FakeDrive::default(),
        FakeOAuth::default(),
        FakeRunner {
            dump_exit_code: 2,
            ..FakeRunner::default()
        },
    );
    let orchestrator = Orchestrator::new(&fx.store, &drive, &oauth, &runner);

    let report = orchestrator.run_backup(&mut fx.settings, &fx.site);

    match &report.state {
        RunState::Failed(FailureReason::Build(BuildError::DumpFailed(CommandError::ExitStatus {
            code,
            stderr,
            ..
        }))) => {
            assert_eq!(*code, Some(2));
            assert!(stderr.contains("Access denied"));
        }
        other => panic!("unexpected state: {other}"),
    }
    assert_eq!(report.history.last(), Some(&Stage::Failed));
    assert_eq!(*runner.calls.borrow(), ["mysqldump"]);
    assert_eq!(drive.calls.get(), 0);
    assert!(report.uploaded.is_none());
    assert!(report.preserved.is_empty(), "{:?}", report.preserved);
}

#[test]
fn failed_file_archive_keeps_the_dump() {
    let mut fx = fixture(true);
    let (drive, oauth, runner) = (
        FakeDrive::default(),
        FakeOAuth::default(),
        FakeRunner {
            zip_exit_code: 18,
            ..FakeRunner::default()
        },
    );
    let orchestrator = Orchestrator::new(&fx.store, &drive, &oauth, &runner);

    let report = orchestrator.run_backup(&mut fx.settings, &fx.site);

    match &report.state {
        RunState::Failed(FailureReason::Build(BuildError::ArchiveFailed(CommandError::ExitStatus {
            code,
            ..
        }))) => assert_eq!(*code, Some(18)),
        other => panic!("unexpected state: {other}"),
    }
    assert_eq!(
        report.history,
        [Stage::Idle, Stage::Authenticating, Stage::Building, Stage::Failed]
    );
    assert_eq!(*runner.calls.borrow(), ["mysqldump", "zip"]);
    assert_eq!(drive.calls.get(), 0);

    assert_eq!(report.preserved.len(), 1);
    let dump = &report.preserved[0];
    assert!(dump.is_file());
    let name = dump.file_name().unwrap().to_string_lossy();
    assert!(name.starts_with("db_backup_") && name.ends_with(".sql"), "{name}");
    assert!(!fx.staging_dir.join(LOCK_FILE).exists());
}

#[test]
fn revoked_grant_awaits_consent() {
    let mut fx = fixture(false);
    fx.settings
        .set_token(&Token {
            access_token: "ya29.expired".into(),
            refresh_token: Some("1//revoked".into()),
            expires_in: 3600,
            created: Utc::now().timestamp() - 7200,
            scope: None,
            token_type: "Bearer".into(),
        })
        .unwrap();
    let (drive, oauth, runner) = (
        FakeDrive::default(),
        FakeOAuth {
            refresh_error: Some(OAuthError::Rejected {
                status: 400,
                error: "invalid_grant".into(),
                description: "Token has been expired or revoked.".into(),
            }),
            ..FakeOAuth::default()
        },
        FakeRunner::default(),
    );
    let orchestrator = Orchestrator::new(&fx.store, &drive, &oauth, &runner);

    // asking again without a code keeps pointing at the consent screen
    for _ in 0..2 {
        let err = orchestrator.authenticate(&mut fx.settings, None).unwrap_err();
        assert!(matches!(err, AuthError::ConsentRevoked { .. }), "{err}");
        assert!(err.consent_url().is_some());
    }

    let report = orchestrator.run_backup(&mut fx.settings, &fx.site);
    assert!(
        matches!(report.state, RunState::AwaitingUserAuth { .. }),
        "{}",
        report.state
    );
    assert_eq!(
        report.history,
        [Stage::Idle, Stage::Authenticating, Stage::AwaitingUserAuth]
    );
    assert!(runner.calls.borrow().is_empty());

    let outcome = orchestrator.run_delete(&mut fx.settings, &["id-1".to_string()]);
    assert!(matches!(outcome, DeleteOutcome::AwaitingUserAuth { .. }));
    assert_eq!(drive.calls.get(), 0);
}

#[test]
fn missing_token_awaits_consent_without_network() {
    let mut fx = fixture(false);
    let (drive, oauth, runner) = (FakeDrive::default(), FakeOAuth::default(), FakeRunner::default());
    let orchestrator = Orchestrator::new(&fx.store, &drive, &oauth, &runner);

    let report = orchestrator.run_backup(&mut fx.settings, &fx.site);

    let RunState::AwaitingUserAuth { consent_url } = &report.state else {
        panic!("unexpected state: {}", report.state);
    };
    assert!(consent_url
        .query_pairs()
        .any(|(k, v)| k == "client_id" && v == "client.apps.googleusercontent.com"));
    assert_eq!(
        report.history,
        [Stage::Idle, Stage::Authenticating, Stage::AwaitingUserAuth]
    );
    assert_eq!(oauth.calls.get(), 0);
    assert_eq!(drive.calls.get(), 0);
    assert!(runner.calls.borrow().is_empty());
}

#[test]
fn failed_upload_preserves_artifacts() {
    let mut fx = fixture(true);
    let (drive, oauth, runner) = (
        FakeDrive {
            upload_error: Some(DriveError::Status {
                status: 403,
                reason: Some("storageQuotaExceeded".into()),
                message: "The user's Drive storage quota has been exceeded.".into(),
            }),
            ..FakeDrive::default()
        },
        FakeOAuth::default(),
        FakeRunner::default(),
    );
    let orchestrator = Orchestrator::new(&fx.store, &drive, &oauth, &runner);

    let report = orchestrator.run_backup(&mut fx.settings, &fx.site);

    assert!(
        matches!(
            report.state,
            RunState::Failed(FailureReason::Upload(UploadError::QuotaExceeded(_)))
        ),
        "{}",
        report.state
    );
    assert_eq!(report.preserved.len(), 3);
    assert!(report.preserved.iter().all(|path| path.is_file()));
    assert!(!fx.staging_dir.join(LOCK_FILE).exists());
}

#[test]
fn held_lock_refuses_second_run() {
    let mut fx = fixture(true);
    let _held = RunLock::acquire(&fx.staging_dir.join(LOCK_FILE), Duration::from_secs(600)).unwrap();
    let (drive, oauth, runner) = (FakeDrive::default(), FakeOAuth::default(), FakeRunner::default());
    let orchestrator = Orchestrator::new(&fx.store, &drive, &oauth, &runner);

    let report = orchestrator.run_backup(&mut fx.settings, &fx.site);

    assert!(
        matches!(
            report.state,
            RunState::Failed(FailureReason::Lock(LockError::Held { .. }))
        ),
        "{}",
        report.state
    );
    assert!(runner.calls.borrow().is_empty());
    assert_eq!(drive.calls.get(), 0);
}

#[test]
fn list_filters_by_prefix() {
    let mut fx = fixture(true);
    let drive = FakeDrive::with_files(&[
        ("id-1", "site1_20240101000000.zip"),
        ("id-2", "site2_20240101000000.zip"),
        ("id-3", "site1_20240102000000.zip"),
    ]);
    let (oauth, runner) = (FakeOAuth::default(), FakeRunner::default());
    let orchestrator = Orchestrator::new(&fx.store, &drive, &oauth, &runner);

    let listed = orchestrator.list_backups(&mut fx.settings).unwrap();

    let ids: Vec<_> = listed.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, ["id-1", "id-3"]);
}

#[test]
fn delete_reports_each_id() {
    let mut fx = fixture(true);
    let drive = FakeDrive::with_files(&[
        ("id-1", "site1_20240101000000.zip"),
        ("id-2", "site1_20240102000000.zip"),
    ]);
    let (oauth, runner) = (FakeOAuth::default(), FakeRunner::default());
    let orchestrator = Orchestrator::new(&fx.store, &drive, &oauth, &runner);

    let ids = ["id-1", "gone", "id-1"].map(String::from);
    let DeleteOutcome::Deleted(report) = orchestrator.run_delete(&mut fx.settings, &ids) else {
        panic!("expected a deletion report");
    };

    assert_eq!(report.succeeded, ["id-1"]);
    assert!(matches!(report.failed.get("gone"), Some(DeletionError::NotFound(_))));
    assert!(!report.is_complete());

    let remaining: Vec<_> = drive.files.borrow().iter().map(|(e, _)| e.id.clone()).collect();
    assert_eq!(remaining, ["id-2"]);
}

#[test]
fn delete_without_token_awaits_consent() {
    let mut fx = fixture(false);
    let (drive, oauth, runner) = (FakeDrive::default(), FakeOAuth::default(), FakeRunner::default());
    let orchestrator = Orchestrator::new(&fx.store, &drive, &oauth, &runner);

    let outcome = orchestrator.run_delete(&mut fx.settings, &["id-1".to_string()]);

    assert!(matches!(outcome, DeleteOutcome::AwaitingUserAuth { .. }));
    assert_eq!(drive.calls.get(), 0);
}
