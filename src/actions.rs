//! Runs the shell commands attached to a device's transitions.

use std::future::Future;
use std::time::Duration;

use log::{debug, info};
use tokio::process::Command;

/// Result of running a single action command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded,
    /// Exited with a non-zero status. `code` is `None` when killed by a signal.
    Failed { code: Option<i32> },
    /// The command does not name an executable; nothing was spawned.
    NotExecutable,
    SpawnFailed(String),
    TimedOut,
}

/// Executes action commands. Each call resolves only once the command's
/// process has exited, so awaiting calls in turn keeps them strictly
/// sequential.
pub trait ActionRunner {
    fn run(&self, command: &str) -> impl Future<Output = ActionOutcome>;
}

/// Runs commands through `<shell> -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    timeout: Option<Duration>,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        ShellRunner {
            shell: shell.into(),
            timeout: None,
        }
    }

    /// Kill commands that run longer than `timeout`. Without one, a hung
    /// command stalls every later cycle.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SHELL)
    }
}

impl ActionRunner for ShellRunner {
    async fn run(&self, command: &str) -> ActionOutcome {
        let Some(program) = program_of(command) else {
            debug!("No program in {:?}", command);
            return ActionOutcome::NotExecutable;
        };
        if let Err(err) = which::which(&program) {
            debug!("Cannot resolve {:?}: {}", program, err);
            return ActionOutcome::NotExecutable;
        }

        info!("Launching: {}", command);
        let mut child = match Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => return ActionOutcome::SpawnFailed(err.to_string()),
        };

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    if let Err(err) = child.kill().await {
                        debug!("Failed to kill {:?}: {}", command, err);
                    }
                    return ActionOutcome::TimedOut;
                }
            },
            None => child.wait().await,
        };

        match status {
            Ok(status) if status.success() => ActionOutcome::Succeeded,
            Ok(status) => ActionOutcome::Failed {
                code: status.code(),
            },
            Err(err) => ActionOutcome::SpawnFailed(err.to_string()),
        }
    }
}

/// The program a command line starts, after shell quoting and any leading
/// `NAME=value` assignments. `None` for empty or unbalanced commands.
fn program_of(command: &str) -> Option<String> {
    let words = shell_words::split(command).ok()?;
    words.into_iter().find(|word| !is_assignment(word))
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}
