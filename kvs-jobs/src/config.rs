//! Command-line arguments and the validated run configuration.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};

/// Command-line arguments for `kvs-jobs`.
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Run batches of key-value jobs against a shared in-memory store"
)]
pub struct Args {
    /// Directory containing .job files, or a single .job file
    #[arg(value_hint = ValueHint::AnyPath)]
    pub target: PathBuf,

    /// Maximum number of jobs processed concurrently
    pub max_threads: usize,

    /// Maximum number of backups queued or being written at once
    pub max_backups: usize,

    /// Number of threads writing backup files
    #[arg(long, default_value_t = 1)]
    pub backup_workers: usize,
}

/// Validated settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub target: PathBuf,
    pub limits: Limits,
}

/// Concurrency limits, all strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_threads: NonZeroUsize,
    pub max_backups: NonZeroUsize,
    pub backup_workers: NonZeroUsize,
}

impl Limits {
    pub fn new(max_threads: usize, max_backups: usize, backup_workers: usize) -> Result<Self> {
        Ok(Self {
            max_threads: positive(max_threads, "max_threads")?,
            max_backups: positive(max_backups, "max_backups")?,
            backup_workers: positive(backup_workers, "backup_workers")?,
        })
    }
}

impl TryFrom<Args> for Config {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> Result<Self> {
        Ok(Self {
            limits: Limits::new(args.max_threads, args.max_backups, args.backup_workers)?,
            target: args.target,
        })
    }
}

fn positive(value: usize, name: &str) -> Result<NonZeroUsize> {
    NonZeroUsize::new(value)
        .with_context(|| format!("{name} must be a positive integer, got {value}"))
}
