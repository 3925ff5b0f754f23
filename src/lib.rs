//! Nimbus: Fleet Command Runner and Cloud Provisioner.

// Command line arguments and configuration.
pub mod config;
// Configuration directory discovery.
pub mod paths;
// How to parse and represent instances and clusters.
pub mod instance;
// Persisted variables such as provider credentials.
pub mod variables;
// Command token resolution.
pub mod script;
// Remote shell boundary.
pub mod shell;
// Per-run output colors.
pub mod palette;
// Retry policy for connection failures.
pub mod retry;
// Synchronization primitives.
pub mod sync;
// Attempt chains for one command on one instance.
pub mod executor;
// Parallel and sequential dispatch across instances.
pub mod dispatcher;
// Cloud provider API, operation tracking and provisioning.
pub mod provider;
// File transfer with scp or rsync.
pub mod transfer;
// Terminal progress output.
pub mod progress;
// Error handling.
pub mod error;

pub use config::Config;
pub use dispatcher::{CommandDispatcher, CommandRequest, Mode, RunReport};
pub use error::NimbusError;
pub use executor::{ExecOptions, RemoteExecutor};
pub use instance::{Instance, InstanceResolver, Inventory};
pub use shell::{RemoteShell, SshShell};
