//! End-to-end tests for dispatching commands across instances.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use nimbus_ssh::dispatcher::{CommandDispatcher, CommandRequest, Mode};
use nimbus_ssh::error::{NimbusError, Result};
use nimbus_ssh::executor::{ExecOptions, RemoteExecutor};
use nimbus_ssh::instance::{Instance, InstanceResolver, Inventory};
use nimbus_ssh::retry::RetryPolicy;
use nimbus_ssh::script::{CommandSource, ScriptLookup};
use nimbus_ssh::shell::{Invocation, Printer, RemoteShell, ShellExit};
use nimbus_ssh::sync::{Cancellation, InputRelay};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start(String, String),
    End(String, String),
    Cancelled(String),
}

/// Mock shell that replays scripted exits instead of connecting anywhere.
#[derive(Default)]
struct MockShell {
    /// Exits per instance, consumed in order. Instances without a script succeed.
    exits: Mutex<HashMap<String, VecDeque<ShellExit>>>,
    delays: HashMap<String, Duration>,
    events: Mutex<Vec<(Event, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

const OK: ShellExit = ShellExit {
    code: Some(0),
    transient: false,
};
const FAILED: ShellExit = ShellExit {
    code: Some(1),
    transient: false,
};
const UNREACHABLE: ShellExit = ShellExit {
    code: Some(255),
    transient: true,
};

impl MockShell {
    fn new() -> Self {
        Self::default()
    }

    fn with_exits(mut self, instance: &str, exits: &[ShellExit]) -> Self {
        self.exits
            .get_mut()
            .insert(instance.to_string(), exits.iter().copied().collect());
        self
    }

    fn with_delay(mut self, instance: &str, delay: Duration) -> Self {
        self.delays.insert(instance.to_string(), delay);
        self
    }

    async fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .await
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    async fn attempts(&self, instance: &str) -> usize {
        self.events()
            .await
            .iter()
            .filter(|event| matches!(event, Event::Start(name, _) if name == instance))
            .count()
    }
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn run(
        &self,
        invocation: &Invocation,
        printer: &Printer,
        _input: &InputRelay,
        cancellation: &Cancellation,
    ) -> Result<ShellExit> {
        let name = invocation.instance.clone();
        let command = invocation.source.to_string();
        self.events
            .lock()
            .await
            .push((Event::Start(name.clone(), command.clone()), Instant::now()));
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = self.delays.get(&name).copied().unwrap_or_default();
        let cancelled = tokio::select! {
            () = tokio::time::sleep(delay) => false,
            () = cancellation.cancelled() => true,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            self.events
                .lock()
                .await
                .push((Event::Cancelled(name), Instant::now()));
            return Err(NimbusError::Cancelled);
        }

        let exit = self
            .exits
            .lock()
            .await
            .get_mut(&name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(OK);
        if exit.transient {
            printer.error_line("ssh: connect to host 10.0.0.1 port 22: Operation timed out");
        }
        self.events
            .lock()
            .await
            .push((Event::End(name, command), Instant::now()));
        Ok(exit)
    }
}

fn instances(names: &[&str]) -> Vec<Instance> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| Instance::new(*name, format!("10.0.0.{}", i + 1)))
        .collect()
}

fn dispatcher(shell: Arc<MockShell>) -> CommandDispatcher {
    let lookup = ScriptLookup::new(
        PathBuf::from("/nonexistent/cwd"),
        &PathBuf::from("/nonexistent/config"),
        PathBuf::from("/nonexistent/bundled"),
    );
    let executor = RemoteExecutor::new(shell, lookup, PathBuf::from("/nonexistent/config"))
        .with_policy(RetryPolicy::new(3, Duration::from_secs(1)));
    CommandDispatcher::new(Arc::new(executor))
}

fn request(targets: Vec<Instance>, commands: &[&str], mode: Mode) -> CommandRequest {
    CommandRequest {
        targets,
        commands: commands.iter().map(|c| c.to_string()).collect(),
        mode,
        options: ExecOptions::default(),
    }
}

fn start(instance: &str, command: &str) -> Event {
    Event::Start(instance.into(), command.into())
}

fn end(instance: &str, command: &str) -> Event {
    Event::End(instance.into(), command.into())
}

#[tokio::test(start_paused = true)]
async fn test_sequential_runs_instances_one_after_another() {
    let shell = Arc::new(
        MockShell::new()
            .with_delay("a", Duration::from_millis(30))
            .with_delay("b", Duration::from_millis(10))
            .with_delay("c", Duration::from_millis(20)),
    );
    let report = dispatcher(shell.clone())
        .run(request(instances(&["a", "b", "c"]), &["uptime"], Mode::Sequential))
        .await
        .unwrap();

    assert_eq!(report.attempts, 3);
    assert!(report.failures.is_empty());
    assert_eq!(
        shell.events().await,
        vec![
            start("a", "uptime"),
            end("a", "uptime"),
            start("b", "uptime"),
            end("b", "uptime"),
            start("c", "uptime"),
            end("c", "uptime"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_parallel_commands_keep_their_order_per_instance() {
    let shell = Arc::new(
        MockShell::new()
            .with_delay("a", Duration::from_millis(50))
            .with_delay("b", Duration::from_millis(5)),
    );
    dispatcher(shell.clone())
        .run(request(
            instances(&["a", "b"]),
            &["first", "second"],
            Mode::Parallel,
        ))
        .await
        .unwrap();

    let events = shell.events().await;
    for name in ["a", "b"] {
        let position = |event: Event| events.iter().position(|e| *e == event).unwrap();
        assert!(position(end(name, "first")) < position(start(name, "second")));
    }
    // b's commands are not held back by a's slower ones.
    let position = |event: Event| events.iter().position(|e| *e == event).unwrap();
    assert!(position(end("b", "second")) < position(end("a", "first")));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_chains_run_concurrently() {
    let names = ["a", "b", "c"];
    let shell = names.iter().fold(MockShell::new(), |shell, name| {
        shell.with_delay(name, Duration::from_secs(1))
    });
    let shell = Arc::new(shell);

    let begin = Instant::now();
    dispatcher(shell.clone())
        .run(request(instances(&names), &["sleep 1"], Mode::Parallel))
        .await
        .unwrap();

    assert!(begin.elapsed() < Duration::from_secs(2));
    assert_eq!(shell.max_in_flight.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_until_success() {
    let shell = Arc::new(MockShell::new().with_exits("a", &[UNREACHABLE, UNREACHABLE, OK]));
    let report = dispatcher(shell.clone())
        .run(request(instances(&["a"]), &["uptime"], Mode::Sequential))
        .await
        .unwrap();

    assert_eq!(report.attempts, 3);
    assert!(report.failures.is_empty());
    assert_eq!(shell.attempts("a").await, 3);
}

#[tokio::test(start_paused = true)]
async fn test_retries_stop_at_max_attempts() {
    let shell = Arc::new(MockShell::new().with_exits("a", &[UNREACHABLE; 5]));
    let result = dispatcher(shell.clone())
        .run(request(instances(&["a", "b"]), &["uptime"], Mode::Sequential))
        .await;

    assert!(matches!(
        result,
        Err(NimbusError::TerminalExecution { instance, .. }) if instance == "a"
    ));
    assert_eq!(shell.attempts("a").await, 3);
    assert_eq!(shell.attempts("b").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exit_255_without_marker_is_not_retried() {
    let auth_failure = ShellExit {
        code: Some(255),
        transient: false,
    };
    let shell = Arc::new(MockShell::new().with_exits("a", &[auth_failure]));
    let result = dispatcher(shell.clone())
        .run(request(instances(&["a"]), &["uptime"], Mode::Sequential))
        .await;

    assert!(matches!(result, Err(NimbusError::TerminalExecution { .. })));
    assert_eq!(shell.attempts("a").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_failure_aborts_sequential_run() {
    let shell = Arc::new(MockShell::new().with_exits("b", &[FAILED]));
    let result = dispatcher(shell.clone())
        .run(request(
            instances(&["a", "b", "c"]),
            &["first", "second"],
            Mode::Sequential,
        ))
        .await;

    match result {
        Err(NimbusError::TerminalExecution {
            instance,
            command,
            status,
        }) => {
            assert_eq!(instance, "b");
            assert_eq!(command, "first");
            assert_eq!(status, "exit code 1");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(shell.attempts("b").await, 1);
    assert_eq!(shell.attempts("c").await, 0);
    assert!(!shell.events().await.contains(&start("b", "second")));
}

#[tokio::test(start_paused = true)]
async fn test_continue_on_error_records_failure_and_moves_on() {
    let shell = Arc::new(
        MockShell::new()
            .with_exits("b", &[FAILED])
            .with_exits("c", &[UNREACHABLE; 3]),
    );
    let mut request = request(
        instances(&["a", "b", "c"]),
        &["first", "second"],
        Mode::Sequential,
    );
    request.options.continue_on_error = true;

    let report = dispatcher(shell.clone()).run(request).await.unwrap();

    let failed: Vec<(&str, &str)> = report
        .failures
        .iter()
        .map(|f| (f.instance.as_str(), f.command.as_str()))
        .collect();
    assert_eq!(failed, [("b", "first"), ("c", "first")]);
    assert_eq!(report.failures[1].status, "connection failed after 3 attempts");
    // a: 2, b: 2, c: 3 for "first" (exhausted) + 1 for "second".
    assert_eq!(report.attempts, 8);
    assert!(shell.events().await.contains(&end("b", "second")));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_failure_cancels_siblings() {
    let shell = Arc::new(
        MockShell::new()
            .with_exits("a", &[FAILED])
            .with_delay("a", Duration::from_millis(10))
            .with_delay("b", Duration::from_secs(60))
            .with_delay("c", Duration::from_secs(60)),
    );
    let dispatcher = dispatcher(shell.clone());
    let cancellation = dispatcher.cancellation();

    let begin = Instant::now();
    let result = dispatcher
        .run(request(
            instances(&["a", "b", "c"]),
            &["first", "second"],
            Mode::Parallel,
        ))
        .await;

    assert!(matches!(
        result,
        Err(NimbusError::TerminalExecution { instance, .. }) if instance == "a"
    ));
    assert!(begin.elapsed() < Duration::from_secs(60));
    assert!(cancellation.is_cancelled());

    let events = shell.events().await;
    assert!(events.contains(&Event::Cancelled("b".into())));
    assert!(events.contains(&Event::Cancelled("c".into())));
    assert!(!events
        .iter()
        .any(|event| matches!(event, Event::Start(_, command) if command == "second")));
}

#[tokio::test(start_paused = true)]
async fn test_external_cancellation_stops_run() {
    let shell = Arc::new(MockShell::new().with_delay("a", Duration::from_secs(60)));
    let dispatcher = dispatcher(shell.clone());
    let cancellation = dispatcher.cancellation();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancellation.cancel();
    });

    let result = dispatcher
        .run(request(instances(&["a", "b"]), &["uptime"], Mode::Sequential))
        .await;

    assert!(matches!(result, Err(NimbusError::Cancelled)));
    assert_eq!(shell.attempts("b").await, 0);
}

#[tokio::test]
async fn test_failed_run_does_not_cancel_the_next_one() {
    let shell = Arc::new(MockShell::new().with_exits("a", &[FAILED]));
    let lookup = ScriptLookup::new(
        PathBuf::from("/nonexistent/cwd"),
        &PathBuf::from("/nonexistent/config"),
        PathBuf::from("/nonexistent/bundled"),
    );
    let executor = Arc::new(RemoteExecutor::new(
        shell.clone(),
        lookup,
        PathBuf::from("/nonexistent/config"),
    ));

    let failed = CommandDispatcher::new(Arc::clone(&executor))
        .run(request(instances(&["a", "b"]), &["uptime"], Mode::Parallel))
        .await;
    assert!(matches!(failed, Err(NimbusError::TerminalExecution { .. })));

    let report = CommandDispatcher::new(executor)
        .run(request(instances(&["a", "b"]), &["uptime"], Mode::Parallel))
        .await
        .unwrap();
    assert_eq!(report.attempts, 2);
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn test_empty_target_set_is_not_found() {
    let shell = Arc::new(MockShell::new());
    let result = dispatcher(shell.clone())
        .run(request(Vec::new(), &["uptime"], Mode::Parallel))
        .await;

    assert!(matches!(result, Err(NimbusError::NotFound(_))));
    assert!(shell.events().await.is_empty());
}

#[tokio::test]
async fn test_inventory_targets_receive_literal_commands() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "web:\n  - name: web.01\n    ip: 10.0.0.1\n  - 10.0.0.2\ndb:\n  - name: db.01\n    address: 10.0.1.1\n    port: 2222\n"
    )
    .unwrap();
    let inventory = Inventory::load(file.path()).unwrap();
    let targets = inventory.resolve("all").unwrap();

    let shell = Arc::new(MockShell::new());
    dispatcher(shell.clone())
        .run(request(
            targets,
            &["docker ps --format '{{.Names}}'"],
            Mode::Sequential,
        ))
        .await
        .unwrap();

    let started: Vec<(String, String)> = shell
        .events()
        .await
        .into_iter()
        .filter_map(|event| match event {
            Event::Start(instance, command) => Some((instance, command)),
            _ => None,
        })
        .collect();
    // Clusters by name, entries in file order.
    let command = "docker ps --format '{{.Names}}'".to_string();
    assert_eq!(
        started,
        [
            ("db.01".to_string(), command.clone()),
            ("web.01".to_string(), command.clone()),
            ("10.0.0.2".to_string(), command),
        ]
    );
}

#[tokio::test]
async fn test_script_files_are_preferred_over_inline() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("health"), "uptime\n").unwrap();
    let lookup = ScriptLookup::new(
        dir.path().to_path_buf(),
        &PathBuf::from("/nonexistent/config"),
        PathBuf::from("/nonexistent/bundled"),
    );
    let executor = RemoteExecutor::new(
        Arc::new(MockShell::new()),
        lookup,
        PathBuf::from("/nonexistent/config"),
    );

    assert_eq!(
        executor.resolve("health"),
        CommandSource::Script(dir.path().join("health"))
    );
    assert_eq!(
        executor.resolve("df -h"),
        CommandSource::Inline("df -h".into())
    );
}
