//! vbox-snapshotter: rotating snapshots for a VirtualBox machine
//!
//! This library drives the virtualization platform through the
//! [`VirtualBox`] trait. One run powers the machine on if needed, takes a
//! snapshot, restores the previous power state, prunes the oldest snapshots
//! beyond a retention count and reports what is left.

pub mod backend;
pub mod config;
pub mod error;
pub mod output;
pub mod retention;
pub mod session;
pub mod snapshotter;
pub mod tree;
pub mod types;

pub use backend::{Progress, VirtualBox};
pub use config::Config;
pub use error::{Error, Result};
pub use retention::{PruneBoundary, RetentionPolicy};
pub use snapshotter::{PruneOutcome, RunSummary, Snapshotter};
pub use types::{
    LaunchMode, LockType, MachineInfo, MachineState, SessionState, SnapshotId, SnapshotInfo,
    SnapshotNode,
};
