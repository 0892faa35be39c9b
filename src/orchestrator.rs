//! Sequencing of backup and delete runs.
//!
//! A backup run moves through the states
//!
//! ```text
//! Idle -> Authenticating -> Building -> Uploading -> CleaningUp -> Done
//! ```
//!
//! ending early in [RunState::AwaitingUserAuth] if the operator has to grant
//! access first (no token stored, or the stored grant was revoked), or in [RunState::Failed] on the first error. Nothing is
//! retried. The run-lock is held from `Building` until the run ends.

use std::path::PathBuf;

use derive_more::{Display, Error, From};
use url::Url;

use crate::archive::{self, ArchiveBuilder, BuildError, RunId};
use crate::drive::auth::{AuthError, Authenticator, Session, TokenEndpoint};
use crate::drive::backups::{self, DeletionReport};
use crate::drive::upload::{self, UploadError};
use crate::drive::{DriveApi, DriveError, RemoteBackupEntry};
use crate::settings::{Settings, SettingsStore};
use crate::util::lock::{LockError, RunLock, LOCK_FILE};
use crate::util::process::CommandRunner;
use crate::wordpress::WordPress;

#[derive(Debug, Display, Error, From)]
/// Why a run failed.
pub enum FailureReason {
    #[from]
    #[display("authentication: {_0}")]
    Auth(AuthError),
    #[from]
    #[display("run-lock: {_0}")]
    Lock(LockError),
    #[from]
    #[display("build: {_0}")]
    Build(BuildError),
    #[from]
    #[display("upload: {_0}")]
    Upload(UploadError),
}

/// State of a backup run.
#[derive(Debug, Display)]
pub enum RunState {
    #[display("idle")]
    Idle,
    #[display("authenticating")]
    Authenticating,
    #[display("building")]
    Building,
    #[display("uploading")]
    Uploading,
    #[display("cleaning up")]
    CleaningUp,
    #[display("done")]
    Done,
    /// The operator has to grant access at the URL. Not an error.
    #[display("awaiting authorization at {consent_url}")]
    AwaitingUserAuth { consent_url: Url },
    #[display("failed ({_0})")]
    Failed(FailureReason),
}

impl RunState {
    pub fn stage(&self) -> Stage {
        match self {
            RunState::Idle => Stage::Idle,
            RunState::Authenticating => Stage::Authenticating,
            RunState::Building => Stage::Building,
            RunState::Uploading => Stage::Uploading,
            RunState::CleaningUp => Stage::CleaningUp,
            RunState::Done => Stage::Done,
            RunState::AwaitingUserAuth { .. } => Stage::AwaitingUserAuth,
            RunState::Failed(_) => Stage::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Done | RunState::AwaitingUserAuth { .. } | RunState::Failed(_)
        )
    }
}

/// [RunState] without payload, for the history of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stage {
    Idle,
    Authenticating,
    Building,
    Uploading,
    CleaningUp,
    Done,
    AwaitingUserAuth,
    Failed,
}

/// Outcome of a backup run.
#[derive(Debug)]
pub struct RunReport {
    /// The terminal state.
    pub state: RunState,
    /// Every state the run went through, including the terminal one.
    pub history: Vec<Stage>,
    pub uploaded: Option<RemoteBackupEntry>,
    /// Local artifacts kept for manual recovery.
    pub preserved: Vec<PathBuf>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.state, RunState::Done)
    }
}

/// Tracks the state of a single run.
struct Run {
    state: RunState,
    history: Vec<Stage>,
    uploaded: Option<RemoteBackupEntry>,
    preserved: Vec<PathBuf>,
}

impl Run {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            history: vec![Stage::Idle],
            uploaded: None,
            preserved: Vec::new(),
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(!self.state.is_terminal(), "{} is terminal", self.state);
        log::info!(target: "orchestrator", "{} -> {next}", self.state.stage());
        self.history.push(next.stage());
        self.state = next;
    }

    fn fail(mut self, reason: impl Into<FailureReason>) -> RunReport {
        let reason = reason.into();
        log::error!(target: "orchestrator", "Backup failed while {}: {reason}", self.state);
        for path in &self.preserved {
            log::warn!(target: "orchestrator", "Kept {} for manual recovery", path.display());
        }
        self.advance(RunState::Failed(reason));
        self.finish()
    }

    fn finish(self) -> RunReport {
        RunReport {
            state: self.state,
            history: self.history,
            uploaded: self.uploaded,
            preserved: self.preserved,
        }
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors on listing backups.
pub enum ListError {
    #[from]
    #[display("{_0}")]
    Auth(AuthError),
    #[from]
    #[display("{_0}")]
    Drive(DriveError),
}

/// Outcome of a delete run.
#[derive(Debug)]
pub enum DeleteOutcome {
    Deleted(DeletionReport),
    AwaitingUserAuth { consent_url: Url },
    Failed(AuthError),
}

/// Runs backup and delete requests against one settings store.
pub struct Orchestrator<'a, D, O, R> {
    store: &'a SettingsStore,
    drive: &'a D,
    oauth: &'a O,
    runner: &'a R,
}

impl<'a, D, O, R> Orchestrator<'a, D, O, R>
where
    D: DriveApi,
    O: TokenEndpoint,
    R: CommandRunner,
{
    pub fn new(store: &'a SettingsStore, drive: &'a D, oauth: &'a O, runner: &'a R) -> Self {
        Self {
            store,
            drive,
            oauth,
            runner,
        }
    }

    /// Establishes a session, exchanging `code` if given.
    pub fn authenticate(
        &self,
        settings: &mut Settings,
        code: Option<&str>,
    ) -> Result<Session, AuthError> {
        Authenticator::new(self.oauth, self.store).ensure_session(settings, code)
    }

    /// Backs up `site` and uploads the archive.
    pub fn run_backup(&self, settings: &mut Settings, site: &WordPress) -> RunReport {
        let mut run = Run::new();

        run.advance(RunState::Authenticating);
        let session = match self.authenticate(settings, None) {
            Ok(session) => session,
            Err(e) => match e.consent_url() {
                Some(consent_url) => {
                    run.advance(RunState::AwaitingUserAuth {
                        consent_url: consent_url.clone(),
                    });
                    return run.finish();
                }
                None => return run.fail(e),
            },
        };

        let prefix = settings.effective_prefix().to_string();
        let folder = settings.effective_folder().to_string();
        let options = &settings.options;
        let builder = ArchiveBuilder::new(site, options, &prefix, self.runner);
        let staging_dir = builder.staging_dir();

        // held until the run returns
        let _lock = match RunLock::acquire(&staging_dir.join(LOCK_FILE), options.lock_ttl()) {
            Ok(lock) => lock,
            Err(e) => return run.fail(e),
        };

        run.advance(RunState::Building);
        let run_id = RunId::new();
        let built = match builder.build(&run_id) {
            Ok(built) => built,
            Err(e) => {
                run.preserved = archive::leftovers(&staging_dir, &run_id);
                return run.fail(e);
            }
        };

        run.advance(RunState::Uploading);
        match upload::upload(self.drive, &session, &built.merged, &folder, options.upload_mode) {
            Ok(entry) => run.uploaded = Some(entry),
            Err(e) => {
                run.preserved = built.artifacts().map(|a| a.path.clone()).to_vec();
                return run.fail(e);
            }
        }

        run.advance(RunState::CleaningUp);
        for (path, e) in built.cleanup() {
            log::warn!(target: "orchestrator", "Couldn't remove {}: {e}", path.display());
            run.preserved.push(path);
        }

        run.advance(RunState::Done);
        run.finish()
    }

    /// Lists the backups of the configured folder and prefix.
    pub fn list_backups(
        &self,
        settings: &mut Settings,
    ) -> Result<Vec<RemoteBackupEntry>, ListError> {
        let session = self.authenticate(settings, None)?;
        let entries = backups::list(
            self.drive,
            &session,
            settings.effective_folder(),
            settings.effective_prefix(),
        )
        .fetch_all()?;
        log::debug!(target: "orchestrator", "Found {} backups", entries.len());
        Ok(entries)
    }

    /// Deletes the backups with the given ids.
    pub fn run_delete(&self, settings: &mut Settings, ids: &[String]) -> DeleteOutcome {
        match self.authenticate(settings, None) {
            Ok(session) => DeleteOutcome::Deleted(backups::delete(self.drive, &session, ids)),
            Err(e) => match e.consent_url() {
                Some(consent_url) => DeleteOutcome::AwaitingUserAuth {
                    consent_url: consent_url.clone(),
                },
                None => {
                    log::error!(target: "orchestrator", "Deleting backups failed: {e}");
                    DeleteOutcome::Failed(e)
                }
            },
        }
    }
}
