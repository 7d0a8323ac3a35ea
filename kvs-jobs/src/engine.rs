//! Wires the store, the backup pipeline and the scheduler together and runs
//! them in the required shutdown order:
//!
//! 1. dispatch every job and join all workers,
//! 2. close the backup pipeline and join its consumers once the queue drains,
//! 3. terminate the store.

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use tracing::info;

use crate::backup::{BackupPipeline, PipelineReport};
use crate::config::{Config, Limits};
use crate::job::{JobDescriptor, discover_jobs, run_job};
use crate::scheduler::{Scheduler, SchedulerReport};
use crate::store::KvStore;

/// Shutdown steps, recorded in the order they complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    WorkersJoined,
    PipelineDrained,
    StoreTerminated,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub jobs: SchedulerReport,
    pub backups: PipelineReport,
    pub phases: Vec<ShutdownPhase>,
}

pub struct Engine {
    store: Arc<KvStore>,
    pipeline: BackupPipeline,
    scheduler: Scheduler,
}

impl Engine {
    /// Creates the store and starts the backup consumers.
    pub fn start(limits: Limits) -> Result<Self> {
        let store = Arc::new(KvStore::new());
        let pipeline = BackupPipeline::spawn(
            Arc::clone(&store),
            limits.max_backups,
            limits.backup_workers,
        )?;
        Ok(Self {
            store,
            pipeline,
            scheduler: Scheduler::new(limits.max_threads),
        })
    }

    pub fn store(&self) -> Arc<KvStore> {
        Arc::clone(&self.store)
    }

    /// Runs every job, then shuts everything down.
    pub fn run(self, jobs: Vec<JobDescriptor>) -> Result<RunSummary> {
        let Engine {
            store,
            pipeline,
            scheduler,
        } = self;
        let mut summary = RunSummary::default();

        info!(jobs = jobs.len(), max_threads = scheduler.max_threads(), "dispatching jobs");
        let backups = pipeline.handle();
        summary.jobs = scheduler.run(jobs, |_, job| run_job(job, &store, &backups).map(drop));
        summary.phases.push(ShutdownPhase::WorkersJoined);

        summary.backups = pipeline.shutdown();
        ensure!(
            summary.backups.remaining == 0,
            "{} backups were never written",
            summary.backups.remaining
        );
        summary.phases.push(ShutdownPhase::PipelineDrained);

        store.terminate().context("failed to tear down the store")?;
        summary.phases.push(ShutdownPhase::StoreTerminated);

        info!(
            completed = summary.jobs.completed,
            failed = summary.jobs.failed,
            backups_written = summary.backups.written,
            backups_failed = summary.backups.failed,
            "run finished"
        );
        Ok(summary)
    }
}

/// Discovers the jobs under `config.target` and runs them.
pub fn run(config: &Config) -> Result<RunSummary> {
    let jobs = discover_jobs(&config.target)?;
    Engine::start(config.limits)?.run(jobs)
}
