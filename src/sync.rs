//! Synchronization primitives shared by the chains of one run.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, watch};

/// Run-wide cancellation flag.
///
/// Tripped by the first terminal failure of a run (or by Ctrl-C). Chains check it
/// before starting new work and race it against running processes.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so this cannot fail while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards the invoking process's stdin to every live remote attempt.
#[derive(Debug, Clone)]
pub struct InputRelay {
    tx: broadcast::Sender<Arc<[u8]>>,
    live: bool,
}

impl InputRelay {
    /// Starts reading our stdin in the background.
    pub fn from_stdin() -> Self {
        let relay = Self {
            live: true,
            ..Self::detached()
        };
        let tx = relay.tx.clone();
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = vec![0u8; 4096];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    // No subscribers is fine; input typed between attempts is dropped.
                    Ok(n) => {
                        let _ = tx.send(Arc::from(&buf[..n]));
                    }
                }
            }
        });
        relay
    }

    /// A relay with no input source. Used by tests and non-interactive callers.
    pub fn detached() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx, live: false }
    }

    /// Whether remote processes should get a stdin pipe at all.
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<[u8]>> {
        self.tx.subscribe()
    }

    pub fn send(&self, chunk: &[u8]) {
        let _ = self.tx.send(Arc::from(chunk));
    }
}
