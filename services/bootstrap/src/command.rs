//! External command execution.
//!
//! Network setup shells out to `ip`, `iptables` and `update-alternatives`.
//! Everything goes through [`CommandRunner`] so the setup can run against a
//! scripted runner in tests.

use std::io;
use std::process::Command;
#[cfg(any(test, feature = "testing"))]
use std::sync::Mutex;

use tracing::debug;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a program to completion and captures its output.
///
/// `Err` means the program could not be started at all; a program that ran
/// and failed is an `Ok` with a non-zero status.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        debug!(program = %program, args = ?args, "running command");

        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(any(test, feature = "testing"))]
type Scripted = Result<CommandOutput, io::ErrorKind>;

/// Scripted runner for tests, behind the `testing` feature.
///
/// Responses are matched by command-line prefix in registration order.
/// Unmatched commands succeed with empty output. Every call is recorded.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct RecordingRunner {
    rules: Vec<(Vec<String>, Scripted)>,
    calls: Mutex<Vec<Vec<String>>>,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `output`.
    pub fn respond(mut self, prefix: &[&str], output: CommandOutput) -> Self {
        self.rules.push((to_owned(prefix), Ok(output)));
        self
    }

    /// Fail to start commands starting with `prefix`.
    pub fn fail(mut self, prefix: &[&str], kind: io::ErrorKind) -> Self {
        self.rules.push((to_owned(prefix), Err(kind)));
        self
    }

    /// Every command line run so far, program first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of calls whose program is `program`.
    pub fn calls_to(&self, program: &str) -> usize {
        self.calls().iter().filter(|c| c[0] == program).count()
    }
}

#[cfg(any(test, feature = "testing"))]
fn to_owned(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(any(test, feature = "testing"))]
impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let mut line = vec![program.to_string()];
        line.extend(args.iter().map(|a| a.to_string()));

        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line.clone());

        let scripted = self
            .rules
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix))
            .map(|(_, response)| response.clone());

        match scripted {
            Some(Ok(output)) => Ok(output),
            Some(Err(kind)) => Err(io::Error::new(kind, format!("{program}: scripted failure"))),
            None => Ok(CommandOutput::ok("")),
        }
    }
}
