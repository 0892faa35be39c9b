//! Execution of external tools like `mysqldump` and `zip`.
//!
//! Every [Invocation] carries a timeout. A tool that doesn't finish in time
//! is killed and reported as [CommandError::TimedOut].

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use derive_more::{Display, Error};
use flate2::write::GzEncoder;
use flate2::Compression;
use wait_timeout::ChildExt;

/// Where the standard output of an [Invocation] goes.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Stdout {
    /// Collect stdout into [CommandOutput::stdout].
    #[default]
    Capture,
    /// Write stdout into a new file.
    File(PathBuf),
    /// Write stdout gzip compressed into a new file.
    Gzip(PathBuf),
}

/// A single call of an external program.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Additional environment. Values are never logged.
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub stdout: Stdout,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            stdout: Stdout::Capture,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn stdout(mut self, stdout: Stdout) -> Self {
        self.stdout = stdout;
        self
    }

    /// File name of the program, used in logs and errors.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        match &self.stdout {
            Stdout::Capture => Ok(()),
            Stdout::File(path) => write!(f, " > {}", path.display()),
            Stdout::Gzip(path) => write!(f, " | gzip > {}", path.display()),
        }
    }
}

/// Result of a finished [Invocation].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// Exit code, [None] if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout. Empty when stdout was redirected into a file.
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Display, Error)]
/// Errors on executing an external program.
pub enum CommandError {
    /// The program couldn't be started.
    #[display("Failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },
    /// The program ran longer than allowed and was killed.
    #[display("{program} did not finish within {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
    /// The program finished unsuccessfully.
    #[display("{program} exited with code {}: {stderr}", exit_code_text(*code))]
    ExitStatus {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    /// Relaying the output of the program failed.
    #[display("I/O error while running {program}: {source}")]
    Io { program: String, source: io::Error },
}

fn exit_code_text(code: Option<i32>) -> String {
    code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string())
}

/// Executes [Invocation]s.
pub trait CommandRunner {
    /// Runs the program to completion.
    ///
    /// A nonzero exit code is *not* an error here, see [run_checked](Self::run_checked).
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError>;

    /// Runs the program and treats a nonzero exit code as [CommandError::ExitStatus].
    fn run_checked(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        let output = self.run(invocation)?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::ExitStatus {
                program: invocation.program_name(),
                code: output.exit_code,
                stderr: output.stderr.trim_end().to_string(),
            })
        }
    }
}

/// Runs programs as child processes of the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        let program = invocation.program_name();
        log::trace!(target: "util::process", "Running: {invocation}");

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

        // drain both pipes concurrently, a full pipe would block the child
        let stdout_reader = child.stdout.take().map(|stdout| {
            let target = invocation.stdout.clone();
            thread::spawn(move || drain_stdout(stdout, &target))
        });
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf).map(|_| buf)
            })
        });

        let status = match child.wait_timeout(invocation.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                log::warn!(target: "util::process", "{program} timed out, killing it");
                let _ = child.kill();
                let _ = child.wait();
                let _ = join_reader(stdout_reader);
                let _ = join_reader(stderr_reader);
                return Err(CommandError::TimedOut {
                    program,
                    timeout: invocation.timeout,
                });
            }
            Err(source) => {
                let _ = child.kill();
                return Err(CommandError::Io { program, source });
            }
        };

        let stdout = join_reader(stdout_reader)
            .map_err(|source| CommandError::Io {
                program: program.clone(),
                source,
            })?
            .unwrap_or_default();
        let stderr = join_reader(stderr_reader)
            .map_err(|source| CommandError::Io {
                program: program.clone(),
                source,
            })?
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default();

        // relay stderr
        if !stderr.trim().is_empty() {
            log::warn!(target: "util::process", "{program}: {}", stderr.trim_end());
        }

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

fn drain_stdout(stdout: ChildStdout, target: &Stdout) -> io::Result<String> {
    let mut stdout = stdout;
    match target {
        Stdout::Capture => {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).into_owned())
        }
        Stdout::File(path) => {
            let mut file = File::create_new(path)?;
            io::copy(&mut stdout, &mut file)?;
            file.flush()?;
            Ok(String::new())
        }
        Stdout::Gzip(path) => {
            let file = File::create_new(path)?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            io::copy(&mut stdout, &mut encoder)?;
            encoder.finish()?;
            Ok(String::new())
        }
    }
}

fn join_reader<T>(reader: Option<JoinHandle<io::Result<T>>>) -> io::Result<Option<T>> {
    match reader {
        None => Ok(None),
        Some(handle) => handle
            .join()
            .map_err(|_| io::Error::other("output reader thread panicked"))?
            .map(Some),
    }
}

/// Returns `path` relative to `base` as a string with `/` separators.
pub fn relative_to(path: &Path, base: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
