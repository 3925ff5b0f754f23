//! Running one logical command on one instance.
//!
//! A logical command is an attempt chain: the first attempt plus any retries caused
//! by transient connection failures. The chain ends in success, an accepted failure
//! (with `continue_on_error`), or a terminal error that aborts the run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{NimbusError, Result};
use crate::instance::Instance;
use crate::paths::resolve_under;
use crate::retry::{AttemptOutcome, ExecutionAttempt, RetryPolicy};
use crate::script::{CommandSource, ScriptLookup};
use crate::shell::{Invocation, Printer, RemoteShell, ShellExit, SSH_CONNECTION_FAILURE};
use crate::sync::{Cancellation, InputRelay};

/// Per-run options that apply to every command.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub continue_on_error: bool,
    pub env: BTreeMap<String, String>,
    /// Overrides every instance's user.
    pub user: Option<String>,
    /// Overrides every instance's key.
    pub ssh_key: Option<String>,
    pub shell: String,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            env: BTreeMap::new(),
            user: None,
            ssh_key: None,
            shell: "bash".to_string(),
        }
    }
}

/// A command that failed but was let through by `continue_on_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedCommand {
    pub instance: String,
    pub command: String,
    pub status: String,
}

impl fmt::Display for FailedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.instance, self.command, self.status)
    }
}

/// Result of one finished attempt chain.
#[derive(Debug, Clone, Default)]
pub struct ChainReport {
    pub attempts: Vec<ExecutionAttempt>,
    pub failure: Option<FailedCommand>,
}

pub struct RemoteExecutor {
    shell: Arc<dyn RemoteShell>,
    lookup: ScriptLookup,
    config_dir: PathBuf,
    policy: RetryPolicy,
    input: InputRelay,
}

impl RemoteExecutor {
    pub fn new(shell: Arc<dyn RemoteShell>, lookup: ScriptLookup, config_dir: PathBuf) -> Self {
        Self {
            shell,
            lookup,
            config_dir,
            policy: RetryPolicy::default(),
            input: InputRelay::detached(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_input(mut self, input: InputRelay) -> Self {
        self.input = input;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Resolves `token` to a script file or a literal inline command.
    pub fn resolve(&self, token: &str) -> CommandSource {
        self.lookup.resolve(token)
    }

    fn invocation(
        &self,
        instance: &Instance,
        source: CommandSource,
        options: &ExecOptions,
    ) -> Invocation {
        let ssh_key = match &options.ssh_key {
            Some(key) => resolve_under(&self.config_dir, key),
            None => instance.key_path(&self.config_dir),
        };
        Invocation {
            instance: instance.name.clone(),
            address: instance.address.clone(),
            port: instance.port,
            user: options.user.clone().unwrap_or_else(|| instance.user.clone()),
            ssh_key,
            env: options.env.clone(),
            shell: options.shell.clone(),
            source,
        }
    }

    /// Runs the attempt chain for one command.
    ///
    /// Returns `Err` only for terminal failures without `continue_on_error` and for
    /// cancellation; everything else is reported in the `ChainReport`.
    pub async fn execute(
        &self,
        instance: &Instance,
        token: &str,
        options: &ExecOptions,
        printer: &Printer,
        cancellation: &Cancellation,
    ) -> Result<ChainReport> {
        let source = self.resolve(token);
        let invocation = self.invocation(instance, source, options);
        let mut report = ChainReport::default();
        printer.line(&format!("=== run '{}' ===", token));

        let mut attempt_number = 1;
        let status = loop {
            if cancellation.is_cancelled() {
                return Err(NimbusError::Cancelled);
            }

            let outcome = match self
                .shell
                .run(&invocation, printer, &self.input, cancellation)
                .await
            {
                Ok(exit) => classify(exit),
                Err(NimbusError::Cancelled) => return Err(NimbusError::Cancelled),
                Err(error) => AttemptOutcome::TerminalFailure {
                    status: error.to_string(),
                },
            };
            report.attempts.push(ExecutionAttempt {
                instance: instance.name.clone(),
                command: token.to_string(),
                attempt_number,
                max_attempts: self.policy.max_attempts,
                outcome: outcome.clone(),
            });

            match outcome {
                AttemptOutcome::Succeeded => {
                    printer.line("=== done ===");
                    return Ok(report);
                }
                AttemptOutcome::RetryableFailure => {
                    match self.policy.next_attempt(attempt_number) {
                        Some(next) => {
                            printer.notice(&format!(
                                "Retrying ({} of {} attempts)...",
                                next, self.policy.max_attempts
                            ));
                            tokio::select! {
                                () = tokio::time::sleep(self.policy.backoff) => {}
                                () = cancellation.cancelled() => return Err(NimbusError::Cancelled),
                            }
                            attempt_number = next;
                        }
                        None => {
                            printer.notice("Giving up!");
                            break format!(
                                "connection failed after {} attempts",
                                self.policy.max_attempts
                            );
                        }
                    }
                }
                AttemptOutcome::TerminalFailure { status } => break status,
            }
        };

        if options.continue_on_error {
            printer.notice(&format!("=== failed ({}), continuing ===", status));
            report.failure = Some(FailedCommand {
                instance: instance.name.clone(),
                command: token.to_string(),
                status,
            });
            Ok(report)
        } else {
            printer.notice(&format!(
                "Command exited with a non-zero status ({}). Stopping execution...",
                status
            ));
            Err(NimbusError::TerminalExecution {
                instance: instance.name.clone(),
                command: token.to_string(),
                status,
            })
        }
    }
}

/// Maps a finished attempt onto the retry state machine.
pub fn classify(exit: ShellExit) -> AttemptOutcome {
    if exit.success() {
        AttemptOutcome::Succeeded
    } else if exit.code == Some(SSH_CONNECTION_FAILURE) && exit.transient {
        AttemptOutcome::RetryableFailure
    } else {
        AttemptOutcome::TerminalFailure {
            status: exit.describe(),
        }
    }
}
