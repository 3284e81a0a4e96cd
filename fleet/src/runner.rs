//! Subprocess execution seam.
//!
//! The driver builds command lines; a `CommandRunner` executes them. The
//! production runner spawns real processes, the mock records invocations and
//! replays scripted outcomes so the reconciler can be exercised without a
//! cloud project.

use std::io;
use std::process::Command;
use std::sync::Mutex;

#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> CommandOutput {
        CommandOutput {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn err(code: i32, stderr: impl Into<String>) -> CommandOutput {
        CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, blocking until it exits. An `Err` means
    /// the process could not be spawned at all; a non-zero exit is a normal
    /// `CommandOutput`.
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Production runner backed by `std::process::Command`.
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Test double: records every invocation and pops pre-queued responses.
/// When the queue runs dry it answers with empty success.
pub struct MockRunner {
    responses: Mutex<Vec<CommandOutput>>,
    invocations: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new() -> Self {
        MockRunner {
            responses: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses(responses: Vec<CommandOutput>) -> Self {
        let mut reversed = responses;
        reversed.reverse();
        MockRunner {
            responses: Mutex::new(reversed),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.invocations.lock().unwrap().push(line);
        let response = self.responses.lock().unwrap().pop();
        Ok(response.unwrap_or_else(|| CommandOutput::ok("")))
    }
}
