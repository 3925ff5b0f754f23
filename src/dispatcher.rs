//! Sequencing attempt chains across a set of instances.
//!
//! Sequential mode drains a queue of instances one at a time. Parallel mode spawns one
//! task per instance; tasks report back over a channel and the first terminal failure
//! cancels the siblings.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::join_all;

use crate::error::{NimbusError, Result};
use crate::executor::{ChainReport, ExecOptions, FailedCommand, RemoteExecutor};
use crate::instance::Instance;
use crate::palette::{ColorSlot, Palette};
use crate::shell::Printer;
use crate::sync::Cancellation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Parallel,
    Sequential,
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub targets: Vec<Instance>,
    /// Tokens run on each instance in this order.
    pub commands: Vec<String>,
    pub mode: Mode,
    pub options: ExecOptions,
}

/// What a completed run did.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Failures accepted under `continue_on_error`, in completion order.
    pub failures: Vec<FailedCommand>,
    /// Attempts made across all instances and commands.
    pub attempts: usize,
}

impl RunReport {
    fn absorb(&mut self, chain: ChainReport) {
        self.attempts += chain.attempts.len();
        self.failures.extend(chain.failure);
    }
}

/// Drives a single run. `run` consumes the dispatcher, so a tripped `Cancellation`
/// never leaks into a later run; build a new dispatcher per run.
pub struct CommandDispatcher {
    executor: Arc<RemoteExecutor>,
    cancellation: Cancellation,
}

impl CommandDispatcher {
    pub fn new(executor: Arc<RemoteExecutor>) -> Self {
        Self {
            executor,
            cancellation: Cancellation::new(),
        }
    }

    /// Handle for cancelling the run from outside (e.g. on Ctrl-C).
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    pub async fn run(self, request: CommandRequest) -> Result<RunReport> {
        if request.targets.is_empty() {
            return Err(NimbusError::NotFound("(empty target set)".to_string()));
        }

        let mut palette = Palette::new();
        let slots = palette.assign(request.targets.len());
        let chains: VecDeque<(Instance, ColorSlot)> =
            request.targets.into_iter().zip(slots).collect();
        let commands: Arc<[String]> = request.commands.into();
        let options = Arc::new(request.options);

        match request.mode {
            Mode::Sequential => self.run_sequential(chains, &commands, &options).await,
            Mode::Parallel => self.run_parallel(chains, commands, options).await,
        }
    }

    async fn run_sequential(
        &self,
        mut queue: VecDeque<(Instance, ColorSlot)>,
        commands: &[String],
        options: &ExecOptions,
    ) -> Result<RunReport> {
        let mut report = RunReport::default();
        while let Some((instance, slot)) = queue.pop_front() {
            let chain = run_chain(
                &self.executor,
                &instance,
                slot,
                commands,
                options,
                &self.cancellation,
            )
            .await?;
            report.attempts += chain.attempts;
            report.failures.extend(chain.failures);
        }
        Ok(report)
    }

    async fn run_parallel(
        &self,
        chains: VecDeque<(Instance, ColorSlot)>,
        commands: Arc<[String]>,
        options: Arc<ExecOptions>,
    ) -> Result<RunReport> {
        // MPMC channel (used as MPSC) for chains to report their result.
        let (done_tx, done_rx) = flume::bounded(chains.len());

        let mut tasks = Vec::with_capacity(chains.len());
        for (instance, slot) in chains {
            let executor = Arc::clone(&self.executor);
            let commands = Arc::clone(&commands);
            let options = Arc::clone(&options);
            let cancellation = self.cancellation.clone();
            let done_tx = done_tx.clone();
            tasks.push(tokio::spawn(async move {
                let result =
                    run_chain(&executor, &instance, slot, &commands, &options, &cancellation)
                        .await;
                let _ = done_tx.send_async(result).await;
            }));
        }
        drop(done_tx);

        let mut report = RunReport::default();
        let mut first_error = None;
        // Ends once every task has reported and dropped its sender.
        while let Ok(result) = done_rx.recv_async().await {
            match result {
                Ok(chain) => {
                    report.attempts += chain.attempts;
                    report.failures.extend(chain.failures);
                }
                Err(NimbusError::Cancelled) => {}
                Err(error) => {
                    if first_error.is_none() {
                        eprintln!("[nimbus] {} Cancelling remaining instances.", error);
                        self.cancellation.cancel();
                        first_error = Some(error);
                    }
                }
            }
        }
        join_all(tasks).await;

        match first_error {
            Some(error) => Err(error),
            None if self.cancellation.is_cancelled() => Err(NimbusError::Cancelled),
            None => Ok(report),
        }
    }
}

/// Runs every command on one instance, strictly in order.
async fn run_chain(
    executor: &RemoteExecutor,
    instance: &Instance,
    slot: ColorSlot,
    commands: &[String],
    options: &ExecOptions,
    cancellation: &Cancellation,
) -> Result<RunReport> {
    let printer = Printer::new(instance, slot);
    let mut report = RunReport::default();
    for command in commands {
        let chain = executor
            .execute(instance, command, options, &printer, cancellation)
            .await?;
        report.absorb(chain);
    }
    Ok(report)
}
