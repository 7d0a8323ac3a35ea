//! Typed errors for the store and the backup pipeline.
//!
//! Everything above these two components (job driver, engine, CLI) works in
//! `anyhow::Result` and attaches context as errors bubble up.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by [`crate::store::KvStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store was terminated (or never set up) and cannot be used.
    #[error("KVS state must be initialized")]
    NotInitialized,
}

/// Errors returned when handing a snapshot request to the backup pipeline.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The pipeline was shut down before it could accept the task.
    #[error("backup {path:?} (#{sequence}) rejected: pipeline is shutting down")]
    Closed { path: PathBuf, sequence: u32 },
}
