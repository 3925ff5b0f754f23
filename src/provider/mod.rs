//! Cloud provider integration.

pub mod client;
pub mod droplet;
pub mod operation;

pub use client::{HttpProviderClient, ProviderClient};
pub use droplet::Provisioner;
pub use operation::{OperationTracker, ProgressHandle, TrackOutcome};
