//! External process invocation.
//!
//! Stages never spawn processes directly; they describe a [`CommandSpec`] and
//! hand it to a [`CommandRunner`]. Production code uses [`ProcessRunner`],
//! tests use [`crate::fakes::RecordingRunner`].

use crate::error::CommandError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Number of output lines kept in failure diagnostics.
const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// Description of a single process invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,

    /// Arguments, not including the program.
    pub args: Vec<String>,

    /// Extra environment variables for this invocation only.
    pub env: BTreeMap<String, String>,

    /// Working directory.
    pub cwd: Option<PathBuf>,

    /// Timeout in seconds (0 = no timeout).
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            timeout_secs: 0,
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
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(word: &str) -> String {
    if word.is_empty() || word.contains(char::is_whitespace) {
        format!("'{}'", word)
    } else {
        word.to_string()
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }

    /// The last lines of combined output, for error messages.
    pub fn diagnostics(&self) -> String {
        let combined = self.combined();
        let lines: Vec<&str> = combined.lines().collect();
        let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
        lines[start..].join("\n")
    }
}

/// Executes command specifications.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. A non-zero exit is not an error at
    /// this level; only spawn failures and timeouts are.
    async fn run(&self, cmd: &CommandSpec) -> std::result::Result<CommandOutput, CommandError>;
}

/// Runs commands as local child processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cmd: &CommandSpec) -> std::result::Result<CommandOutput, CommandError> {
        if cmd.program.is_empty() {
            return Err(CommandError::EmptyCommand);
        }

        debug!(command = %cmd, "Spawning process");
        let start = Instant::now();

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(&cmd.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| CommandError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        let waited = if cmd.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(cmd.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| CommandError::Timeout {
                program: cmd.program.clone(),
                secs: cmd.timeout_secs,
            })?
        } else {
            child.wait_with_output().await
        };
        let output = waited.map_err(|source| CommandError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Run a command and require a zero exit status.
///
/// Spawn failures, timeouts and non-zero exits are all turned into the
/// caller's error built by `on_failure`, which receives a description
/// including the tool's own diagnostics.
pub async fn run_checked<E, F>(
    runner: &dyn CommandRunner,
    cmd: &CommandSpec,
    on_failure: F,
) -> std::result::Result<CommandOutput, E>
where
    F: FnOnce(String) -> E,
{
    match runner.run(cmd).await {
        Ok(output) if output.success() => Ok(output),
        Ok(output) => Err(on_failure(format!(
            "`{}` exited with code {}\n{}",
            cmd,
            output.exit_code,
            output.diagnostics()
        ))),
        Err(e) => Err(on_failure(format!("`{}`: {}", cmd, e))),
    }
}
