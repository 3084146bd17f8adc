//! In-memory fakes for process execution (testing only)
//!
//! [`RecordingRunner`] never spawns anything. It records every command it is
//! asked to run and answers from a script of canned responses.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::CommandError;

#[derive(Debug, Clone)]
struct ScriptedResponse {
    needle: String,
    output: CommandOutput,
    once: bool,
    times_out: bool,
}

type Effect = Arc<dyn Fn(&CommandSpec) + Send + Sync>;

/// Command runner that records calls and replays scripted outputs.
///
/// A response matches when its needle is a substring of the rendered
/// command line. Later registrations take precedence, so a test can set a
/// broad default and then override a specific call. Unmatched commands
/// succeed with empty output. A response registered with
/// [`RecordingRunner::time_out_on`] fails with [`CommandError::Timeout`].
///
/// Effects stand in for what a real tool leaves on disk: every effect whose
/// needle matches runs before the response is returned.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<CommandSpec>>,
    responses: Mutex<Vec<ScriptedResponse>>,
    effects: Mutex<Vec<(String, Effect)>>,
}

impl fmt::Debug for RecordingRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingRunner")
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer matching commands with `exit_code` and `stdout`.
    pub fn on(&self, needle: &str, exit_code: i32, stdout: &str) -> &Self {
        self.push(needle, exit_code, stdout, "")
    }

    /// Fail matching commands with exit code 1 and `stderr`.
    pub fn fail_on(&self, needle: &str, stderr: &str) -> &Self {
        self.push(needle, 1, "", stderr)
    }

    /// Like [`RecordingRunner::on`], but only for the next matching command.
    pub fn on_once(&self, needle: &str, exit_code: i32, stdout: &str) -> &Self {
        self.push_response(needle, exit_code, stdout, "", true)
    }

    fn push(&self, needle: &str, exit_code: i32, stdout: &str, stderr: &str) -> &Self {
        self.push_response(needle, exit_code, stdout, stderr, false)
    }

    fn push_response(
        &self,
        needle: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
        once: bool,
    ) -> &Self {
        self.responses.lock().unwrap().push(ScriptedResponse {
            needle: needle.to_string(),
            output: CommandOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                duration_ms: 0,
            },
            once,
            times_out: false,
        });
        self
    }

    /// Matching commands time out instead of producing output.
    pub fn time_out_on(&self, needle: &str) -> &Self {
        self.push(needle, -1, "", "");
        if let Some(last) = self.responses.lock().unwrap().last_mut() {
            last.times_out = true;
        }
        self
    }

    /// Run `effect` whenever a matching command is executed.
    pub fn on_effect<F>(&self, needle: &str, effect: F) -> &Self
    where
        F: Fn(&CommandSpec) + Send + Sync + 'static,
    {
        self.effects
            .lock()
            .unwrap()
            .push((needle.to_string(), Arc::new(effect)));
        self
    }

    /// Every command received, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Rendered command lines, in order.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.to_string()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Whether any recorded command line contains `needle`.
    pub fn ran(&self, needle: &str) -> bool {
        self.command_lines().iter().any(|line| line.contains(needle))
    }

    /// Index of the first recorded command containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.command_lines()
            .iter()
            .position(|line| line.contains(needle))
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput, CommandError> {
        if cmd.program.is_empty() {
            return Err(CommandError::EmptyCommand);
        }
        let line = cmd.to_string();
        self.calls.lock().unwrap().push(cmd.clone());

        let effects: Vec<Effect> = self
            .effects
            .lock()
            .unwrap()
            .iter()
            .filter(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, effect)| effect.clone())
            .collect();
        for effect in effects {
            effect(cmd);
        }

        let mut responses = self.responses.lock().unwrap();
        let matched = responses.iter().rposition(|r| line.contains(&r.needle));
        if let Some(index) = matched {
            if responses[index].times_out {
                return Err(CommandError::Timeout {
                    program: cmd.program.clone(),
                    secs: cmd.timeout_secs,
                });
            }
        }
        let output = matched
            .map(|index| {
                if responses[index].once {
                    responses.remove(index).output
                } else {
                    responses[index].output.clone()
                }
            })
            .unwrap_or(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
            });
        Ok(output)
    }
}
