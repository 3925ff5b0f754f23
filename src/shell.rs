//! Remote shell boundary.
//!
//! One `RemoteShell::run` call is one attempt: a single `ssh` process whose output
//! is streamed line by line under the instance's colored prefix.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use colored::{ColoredString, Colorize};
use futures::future::join;
use itertools::Itertools;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::{NimbusError, Result};
use crate::instance::Instance;
use crate::palette::ColorSlot;
use crate::script::CommandSource;
use crate::sync::{Cancellation, InputRelay};

/// `ssh` exits with this code when the connection itself failed.
pub const SSH_CONNECTION_FAILURE: i32 = 255;

/// stderr signatures of connection failures worth retrying.
pub const TRANSIENT_MARKERS: [&str; 3] = ["Operation timed out", "No route to host", "Host is down"];

pub fn is_transient(line: &str) -> bool {
    TRANSIENT_MARKERS.iter().any(|marker| line.contains(marker))
}

/// Everything one attempt needs to reach its instance.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub instance: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub ssh_key: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Interpreter that runs the payload on the remote side.
    pub shell: String,
    pub source: CommandSource,
}

/// How the remote process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellExit {
    /// `None` if the process was killed by a signal.
    pub code: Option<i32>,
    /// Whether stderr contained one of `TRANSIENT_MARKERS`.
    pub transient: bool,
}

impl ShellExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "killed by signal".to_string(),
        }
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs one attempt to completion, or returns `NimbusError::Cancelled` if the
    /// run was cancelled while the attempt was in flight.
    async fn run(
        &self,
        invocation: &Invocation,
        printer: &Printer,
        input: &InputRelay,
        cancellation: &Cancellation,
    ) -> Result<ShellExit>;
}

/// Prefixes each output line with the colored instance name.
#[derive(Debug, Clone)]
pub struct Printer {
    label: ColoredString,
}

impl Printer {
    pub fn new(instance: &Instance, slot: ColorSlot) -> Self {
        Self {
            label: instance.prettify(slot.color()),
        }
    }

    pub fn line(&self, line: &str) {
        self.write(line.normal());
    }

    pub fn error_line(&self, line: &str) {
        self.write(line.bright_black());
    }

    pub fn notice(&self, line: &str) {
        self.write(line.red());
    }

    fn write(&self, line: ColoredString) {
        // Without the lock, lines from concurrent chains get mixed.
        let stdout = std::io::stdout();
        let mut guard = stdout.lock();
        let _ = writeln!(guard, "{} {}", self.label, line);
    }
}

/// Production shell: the system `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshShell {
    program: String,
}

impl SshShell {
    pub fn new() -> Self {
        Self {
            program: "ssh".to_string(),
        }
    }

    /// Uses a different `ssh`-compatible binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SshShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(
        &self,
        invocation: &Invocation,
        printer: &Printer,
        input: &InputRelay,
        cancellation: &Cancellation,
    ) -> Result<ShellExit> {
        let remote = remote_command(invocation).await?;
        log::debug!("{} ssh {:?}", invocation.instance, ssh_args(invocation, ""));

        let mut child = Command::new(&self.program)
            .args(ssh_args(invocation, &remote))
            .stdin(if input.is_live() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let forwarder = tokio::spawn(forward_input(input.subscribe(), child.stdin.take()));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = tokio::select! {
            result = async {
                let (_, transient) = join(pump(stdout, printer, false), pump(stderr, printer, true)).await;
                let status = child.wait().await?;
                Ok::<_, std::io::Error>(ShellExit { code: status.code(), transient })
            } => Some(result),
            () = cancellation.cancelled() => None,
        };
        forwarder.abort();

        match finished {
            Some(exit) => Ok(exit?),
            None => {
                let _ = child.kill().await;
                printer.notice("Cancelled.");
                Err(NimbusError::Cancelled)
            }
        }
    }
}

/// Seconds `ssh` waits for the TCP connection before giving up with exit 255.
pub const CONNECT_TIMEOUT: u64 = 10;

/// Arguments passed to `ssh`, ending with the remote command.
pub fn ssh_args(invocation: &Invocation, remote: &str) -> Vec<String> {
    vec![
        "-i".to_string(),
        invocation.ssh_key.display().to_string(),
        "-p".to_string(),
        invocation.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", CONNECT_TIMEOUT),
        format!("{}@{}", invocation.user, invocation.address),
        remote.to_string(),
    ]
}

/// The command line the remote login shell evaluates.
pub async fn remote_command(invocation: &Invocation) -> Result<String> {
    let body = match &invocation.source {
        CommandSource::Script(path) => tokio::fs::read_to_string(path).await?,
        CommandSource::Inline(command) => command.clone(),
    };
    Ok(format!(
        "{}{} -c {}",
        render_env(&invocation.env),
        invocation.shell,
        quote(&body)
    ))
}

/// `KEY="value" ` assignments, sorted by key.
pub fn render_env(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| {
            let escaped = value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('$', "\\$")
                .replace('`', "\\`");
            format!("{}=\"{}\" ", key, escaped)
        })
        .join("")
}

/// Single-quotes `value` for a POSIX shell.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

async fn forward_input(
    mut chunks: broadcast::Receiver<Arc<[u8]>>,
    stdin: Option<ChildStdin>,
) {
    let Some(mut stdin) = stdin else {
        return;
    };
    loop {
        match chunks.recv().await {
            Ok(chunk) => {
                if stdin.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

/// Prints every line of `stream`. Returns whether any line was a transient marker.
async fn pump<B: AsyncRead + Unpin>(stream: Option<B>, printer: &Printer, is_stderr: bool) -> bool {
    let Some(stream) = stream else {
        return false;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(reader.buffer().len());
    let mut transient = false;
    let mut after_cr = false;
    loop {
        // An error mid-stream ends the output; the exit status still decides the attempt.
        if read_until2(&mut reader, b'\r', b'\n', &mut buf).await.is_err() {
            break;
        }
        // An empty buffer means that EOF was reached.
        if buf.is_empty() {
            break;
        }
        // Second half of a CRLF.
        if after_cr && buf == b"\n" {
            after_cr = false;
            buf.clear();
            continue;
        }
        after_cr = buf.ends_with(b"\r");
        let decoded = String::from_utf8_lossy(&buf);
        let line = decoded.trim_end_matches(['\r', '\n']);
        if is_stderr {
            transient |= is_transient(line);
            printer.error_line(line);
        } else {
            printer.line(line);
        }
        buf.clear();
    }
    transient
}

/// Reads into `buf` until either delimiter (inclusive) or EOF.
async fn read_until2<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    delimiter1: u8,
    delimiter2: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if let Some(i) = memchr::memchr2(delimiter1, delimiter2, available) {
                buf.extend_from_slice(&available[..=i]);
                (true, i + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        if done || used == 0 {
            return Ok(());
        }
    }
}
