//! Bounded worker pool for job execution.
//!
//! The dispatcher owns `max_threads` slots. Each job is handed to a fresh,
//! named worker thread (`kvs-worker-<slot>`) bound to a free slot. When every
//! slot is busy the dispatcher blocks on a crossbeam completion channel until
//! a worker reports back, joins it and reuses its slot for the next job.
//!
//! After the last job is dispatched the scheduler waits for every outstanding
//! worker, so [`Scheduler::run`] never returns while a job can still touch the
//! store.

use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ScopedJoinHandle};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info, info_span, warn};

/// Pool slot a worker occupies while it runs a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSlot {
    pub index: usize,
}

/// Totals for one [`Scheduler::run`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerReport {
    pub completed: usize,
    pub failed: usize,
    /// Highest number of workers observed running a job at the same time.
    pub peak_active: usize,
}

enum Outcome {
    Completed,
    Failed(anyhow::Error),
    Panicked,
}

/// Message a worker sends on the completion channel right before it exits.
struct Completion {
    slot: usize,
    job: String,
    outcome: Outcome,
}

/// Counts workers currently inside a job and remembers the maximum.
#[derive(Default)]
struct ActivityGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ActivityGauge {
    fn enter(&self) -> ActiveGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a ActivityGauge);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    max_threads: usize,
}

impl Scheduler {
    pub fn new(max_threads: NonZeroUsize) -> Self {
        Self {
            max_threads: max_threads.get(),
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Runs `work` once per job on at most `max_threads` concurrent workers.
    ///
    /// A job that returns an error or panics is logged and counted as failed;
    /// the remaining jobs still run.
    pub fn run<I, T, F>(&self, jobs: I, work: F) -> SchedulerReport
    where
        I: IntoIterator<Item = T>,
        T: fmt::Display + Send,
        F: Fn(WorkerSlot, &T) -> Result<()> + Sync,
    {
        let gauge = ActivityGauge::default();
        let mut report = SchedulerReport::default();
        let (done_tx, done_rx) = unbounded::<Completion>();

        thread::scope(|scope| {
            let mut free: Vec<usize> = (0..self.max_threads).rev().collect();
            let mut workers: Vec<Option<ScopedJoinHandle<'_, ()>>> =
                (0..self.max_threads).map(|_| None).collect();

            for job in jobs {
                let slot = match free.pop() {
                    Some(slot) => slot,
                    None => match reclaim(&done_rx, &mut workers, &mut report) {
                        Some(slot) => slot,
                        None => break,
                    },
                };

                let label = job.to_string();
                let done_tx = done_tx.clone();
                let (work, gauge) = (&work, &gauge);
                let spawned = thread::Builder::new()
                    .name(format!("kvs-worker-{slot}"))
                    .spawn_scoped(scope, move || run_worker(slot, job, work, gauge, done_tx));

                match spawned {
                    Ok(handle) => {
                        debug!(slot, job = %label, "job dispatched");
                        workers[slot] = Some(handle);
                    }
                    Err(err) => {
                        error!(slot, job = %label, error = %err, "failed to spawn worker");
                        report.failed += 1;
                        free.push(slot);
                    }
                }
            }

            // Barrier: every dispatched worker has to report back.
            while workers.iter().any(Option::is_some) {
                if reclaim(&done_rx, &mut workers, &mut report).is_none() {
                    break;
                }
            }
        });

        report.peak_active = gauge.peak();
        info!(
            completed = report.completed,
            failed = report.failed,
            peak_active = report.peak_active,
            "all jobs finished"
        );
        report
    }
}

fn run_worker<T, F>(
    slot: usize,
    job: T,
    work: &F,
    gauge: &ActivityGauge,
    done_tx: Sender<Completion>,
)
where
    T: fmt::Display,
    F: Fn(WorkerSlot, &T) -> Result<()>,
{
    let label = job.to_string();
    let outcome = {
        let _active = gauge.enter();
        let _span = info_span!("worker", slot, job = %label).entered();
        match panic::catch_unwind(AssertUnwindSafe(|| work(WorkerSlot { index: slot }, &job))) {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(err)) => Outcome::Failed(err),
            Err(_) => Outcome::Panicked,
        }
    };
    // The dispatcher holds a sender too, so this only fails if it is gone.
    let _ = done_tx.send(Completion {
        slot,
        job: label,
        outcome,
    });
}

/// Blocks until a worker finishes, joins it and returns its free slot.
fn reclaim(
    done_rx: &Receiver<Completion>,
    workers: &mut [Option<ScopedJoinHandle<'_, ()>>],
    report: &mut SchedulerReport,
) -> Option<usize> {
    let done = done_rx.recv().ok()?;
    match done.outcome {
        Outcome::Completed => {
            report.completed += 1;
            info!(slot = done.slot, job = %done.job, "job completed");
        }
        Outcome::Failed(err) => {
            report.failed += 1;
            warn!(slot = done.slot, job = %done.job, error = ?err, "job failed");
        }
        Outcome::Panicked => {
            report.failed += 1;
            error!(slot = done.slot, job = %done.job, "job panicked");
        }
    }
    if let Some(handle) = workers[done.slot].take() {
        if handle.join().is_err() {
            error!(slot = done.slot, "worker thread panicked after reporting");
        }
    }
    Some(done.slot)
}
