//! Long-running provider operations.
//!
//! The provider answers an asynchronous action with an operation id. The tracker polls
//! that id until the provider reports it done, publishing progress as it goes. If no
//! `done` arrives within the timeout, the operation is assumed to have succeeded: this
//! is logged as a warning and reported as `confirmed: false`.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{NimbusError, Result};
use crate::provider::client::ProviderClient;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            timeout: OPERATION_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    percentage: AtomicU8,
    finished: AtomicBool,
}

/// Pollable view of one operation's progress, shared with a display.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle(Arc<ProgressState>);

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percentage(&self) -> u8 {
        self.0.percentage.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::Acquire)
    }

    /// Raises the percentage. Never lowers it.
    fn advance(&self, percentage: u8) -> u8 {
        let percentage = percentage.min(100);
        self.0
            .percentage
            .fetch_max(percentage, Ordering::AcqRel)
            .max(percentage)
    }

    fn finish(&self) {
        self.0.finished.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Polling,
    Done,
    TimedOut,
}

/// Tracker-side record of an operation. Lives for one `track` call.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: u64,
    pub percentage: u8,
    pub state: OperationState,
    pub payload: Value,
}

impl Operation {
    fn new(id: u64) -> Self {
        Self {
            id,
            percentage: 0,
            state: OperationState::Pending,
            payload: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackOutcome {
    /// Last event payload received, or null if none arrived.
    pub payload: Value,
    /// False when completion was assumed after the timeout.
    pub confirmed: bool,
    /// Number of status queries issued.
    pub polls: u32,
}

pub struct OperationTracker {
    client: Arc<dyn ProviderClient>,
    config: TrackerConfig,
}

impl OperationTracker {
    pub fn new(client: Arc<dyn ProviderClient>) -> Self {
        Self {
            client,
            config: TrackerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn track(&self, id: u64) -> Result<TrackOutcome> {
        self.track_with(id, &ProgressHandle::new()).await
    }

    /// Tracks `id`, publishing progress to `progress`.
    pub async fn track_with(&self, id: u64, progress: &ProgressHandle) -> Result<TrackOutcome> {
        let mut operation = Operation::new(id);
        let mut polls = 0;

        let poll_loop = async {
            loop {
                operation.state = OperationState::Polling;
                polls += 1;
                let status = self.client.operation_status(id).await?;
                operation.percentage = progress.advance(status.percentage);
                operation.payload = status.payload;
                if status.done {
                    operation.state = OperationState::Done;
                    operation.percentage = progress.advance(100);
                    return Ok::<(), NimbusError>(());
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };
        let result = tokio::time::timeout(self.config.timeout, poll_loop).await;

        let outcome = match result {
            Ok(Ok(())) => {
                log::debug!("Operation {} done after {} polls", id, polls);
                Ok(TrackOutcome {
                    payload: operation.payload,
                    confirmed: true,
                    polls,
                })
            }
            Ok(Err(error)) => Err(error),
            Err(_) => {
                operation.state = OperationState::TimedOut;
                operation.percentage = progress.advance(100);
                log::warn!(
                    "Operation {} has not finished in {} minutes, assuming it finished successfully.",
                    id,
                    self.config.timeout.as_secs() / 60
                );
                Ok(TrackOutcome {
                    payload: operation.payload,
                    confirmed: false,
                    polls,
                })
            }
        };
        progress.finish();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::provider::client::OperationStatus;

    /// Replays a fixed list of statuses, then repeats the last one.
    struct Scripted {
        statuses: Mutex<VecDeque<(u8, bool)>>,
        seen: Mutex<Vec<u8>>,
    }

    impl Scripted {
        fn new(statuses: &[(u8, bool)]) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProviderClient for Scripted {
        async fn request(&self, _: &str, _: &[(&str, String)]) -> Result<Value> {
            unreachable!()
        }

        async fn operation_status(&self, id: u64) -> Result<OperationStatus> {
            let mut statuses = self.statuses.lock().unwrap();
            let (percentage, done) = if statuses.len() > 1 {
                statuses.pop_front().unwrap()
            } else {
                statuses[0]
            };
            self.seen.lock().unwrap().push(percentage);
            Ok(OperationStatus {
                percentage,
                done,
                payload: json!({ "id": id, "percentage": percentage }),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalizes_on_done() {
        let client = Scripted::new(&[(10, false), (45, false), (100, true)]);
        let tracker = OperationTracker::new(client.clone());
        let progress = ProgressHandle::new();

        let start = tokio::time::Instant::now();
        let outcome = tracker.track_with(42, &progress).await.unwrap();

        assert!(outcome.confirmed);
        assert_eq!(outcome.polls, 3);
        assert_eq!(outcome.payload["id"], 42);
        assert_eq!(progress.percentage(), 100);
        assert!(progress.is_finished());
        assert_eq!(start.elapsed(), POLL_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_percentage_never_decreases() {
        let client = Scripted::new(&[(50, false), (30, false), (60, false), (60, true)]);
        let tracker = OperationTracker::new(client.clone());
        let progress = ProgressHandle::new();

        let watcher = {
            let progress = progress.clone();
            tokio::spawn(async move {
                let mut observed = Vec::new();
                while !progress.is_finished() {
                    observed.push(progress.percentage());
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                observed
            })
        };
        tracker.track_with(1, &progress).await.unwrap();
        let observed = watcher.await.unwrap();

        assert_eq!(*client.seen.lock().unwrap(), vec![50, 30, 60, 60]);
        assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(observed.contains(&50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_assumes_success() {
        let client = Scripted::new(&[(20, false)]);
        let tracker = OperationTracker::new(client);
        let progress = ProgressHandle::new();

        let start = tokio::time::Instant::now();
        let outcome = tracker.track_with(5, &progress).await.unwrap();

        assert!(!outcome.confirmed);
        assert_eq!(progress.percentage(), 100);
        assert!(progress.is_finished());
        assert_eq!(outcome.payload["percentage"], 20);
        assert!(start.elapsed() >= OPERATION_TIMEOUT);
    }

    struct Failing;

    #[async_trait]
    impl ProviderClient for Failing {
        async fn request(&self, _: &str, _: &[(&str, String)]) -> Result<Value> {
            Err(NimbusError::Provider("Not Found".into()))
        }
    }

    #[tokio::test]
    async fn test_provider_error_aborts_tracking() {
        let tracker = OperationTracker::new(Arc::new(Failing));
        let progress = ProgressHandle::new();

        let result = tracker.track_with(3, &progress).await;

        assert!(matches!(result, Err(NimbusError::Provider(m)) if m == "Not Found"));
        assert!(progress.is_finished());
        assert_eq!(progress.percentage(), 0);
    }
}
