//! Concurrent batch executor for an in-memory key-value store.
//!
//! Job files (`*.job`) hold commands such as `WRITE`, `READ`, `DELETE`, `SHOW`,
//! `WAIT` and `BACKUP`. Every job runs on its own worker thread against one
//! shared store and writes its results to a matching `*.out` file.
//!
//! # Architecture
//!
//! Two independent limits are enforced with two different mechanisms:
//!
//! - **Job workers**: a bounded pool of at most `max_threads` OS threads. The
//!   dispatcher blocks on a completion channel when every slot is busy.
//! - **Backups**: a bounded FIFO of at most `max_backups` snapshot requests,
//!   drained by dedicated consumer threads. A worker issuing `BACKUP` only
//!   enqueues; it blocks solely when the queue is full.
//!
//! Shutdown runs in a fixed order: all workers are joined, then the backup
//! queue is drained and its consumers joined, then the store is torn down.
//!
//! # Modules
//!
//! - [`store`]: bucketed key-value table behind a reader/writer lock
//! - [`command`]: commands produced from job files
//! - [`parser`]: job-file syntax reader
//! - [`interpreter`]: executes commands and formats output records
//! - [`backup`]: bounded backup queue and its consumer threads
//! - [`scheduler`]: bounded worker pool
//! - [`job`]: job discovery and the per-job driver
//! - [`engine`]: wiring and shutdown order
//! - [`config`]: command-line arguments and validation

pub mod backup;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod interpreter;
pub mod job;
pub mod parser;
pub mod scheduler;
pub mod store;
