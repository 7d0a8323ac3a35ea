//! Backup pipeline: a bounded FIFO of snapshot requests drained by dedicated
//! consumer threads.
//!
//! Job workers never write snapshot files themselves. A `BACKUP` command
//! pushes a [`BackupTask`] through a [`BackupHandle`] and moves on; one or
//! more consumer threads pop tasks in FIFO order, dump the store and mark the
//! task complete.
//!
//! # Capacity
//!
//! A task holds one of `capacity` slots from the moment it is pushed until
//! its consumer has finished writing the file. Queued plus in-progress
//! snapshots therefore never exceed the configured backup limit, and a
//! producer that finds every slot taken blocks until one frees up.
//!
//! # Shutdown
//!
//! [`BackupPipeline::shutdown`] closes the queue: producers stop blocking and
//! get [`BackupError::Closed`], consumers finish every task already queued and
//! then exit. The call returns once all consumers have been joined.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::error::BackupError;
use crate::store::KvStore;

/// A request to dump the store into `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTask {
    pub path: PathBuf,
    /// Per-job backup number, starting at 1.
    pub sequence: u32,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<BackupTask>,
    /// Queued tasks plus tasks currently being written.
    pending: usize,
    peak_pending: usize,
    closed: bool,
}

/// Bounded FIFO guarded by a mutex and two condition variables.
///
/// # Why hold a slot until `complete`?
///
/// The backup limit bounds how many snapshots exist in the system at once,
/// not just how many wait in line. If a slot were released on `pop`, a single
/// consumer could be writing one file while `capacity` more sat queued, each
/// holding a store snapshot once picked up. Counting a task as pending until
/// [`BackupQueue::complete`] keeps queued plus in-progress at or below
/// `capacity`.
///
/// # Why condition variables instead of a bounded channel?
///
/// A bounded channel frees its slot as soon as the receiver takes a message,
/// which is exactly the release point above that is too early. Closing also
/// has to wake producers parked on a full queue, which `close` does with one
/// `notify_all`.
pub struct BackupQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl BackupQueue {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity: capacity.get(),
            state: Mutex::new(QueueState::default()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a task, blocking while every slot is taken.
    ///
    /// Returns [`BackupError::Closed`] instead of blocking once the queue has
    /// been closed.
    pub fn push(&self, task: BackupTask) -> Result<(), BackupError> {
        let mut state = self
            .not_full
            .wait_while(self.lock(), |s| !s.closed && s.pending >= self.capacity)
            .unwrap_or_else(PoisonError::into_inner);

        if state.closed {
            return Err(BackupError::Closed {
                path: task.path,
                sequence: task.sequence,
            });
        }

        state.tasks.push_back(task);
        state.pending += 1;
        state.peak_pending = state.peak_pending.max(state.pending);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Takes the oldest task, blocking while the queue is empty and open.
    ///
    /// Returns `None` once the queue is closed and fully drained. The caller
    /// must call [`BackupQueue::complete`] after handling the task.
    pub fn pop(&self) -> Option<BackupTask> {
        let mut state = self
            .not_empty
            .wait_while(self.lock(), |s| !s.closed && s.tasks.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        state.tasks.pop_front()
    }

    /// Releases the slot held by a popped task.
    pub fn complete(&self) {
        let mut state = self.lock();
        state.pending = state.pending.saturating_sub(1);
        drop(state);
        self.not_full.notify_one();
    }

    /// Stops accepting tasks and wakes every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Tasks waiting to be picked up by a consumer.
    pub fn queued(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    /// Highest number of slots ever held at once.
    pub fn peak_pending(&self) -> usize {
        self.lock().peak_pending
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer side of the pipeline, cloned into every job worker.
#[derive(Clone)]
pub struct BackupHandle {
    queue: Arc<BackupQueue>,
}

impl BackupHandle {
    /// Producer handle for `queue`. Nothing drains the queue unless a
    /// consumer is attached, as [`BackupPipeline::spawn`] does.
    pub fn new(queue: Arc<BackupQueue>) -> Self {
        Self { queue }
    }

    /// Hands a snapshot request to the pipeline. Blocks the caller while the
    /// pipeline is at capacity.
    pub fn enqueue(&self, task: BackupTask) -> Result<(), BackupError> {
        debug!(path = %task.path.display(), sequence = task.sequence, "enqueueing backup");
        self.queue.push(task)
    }
}

/// Totals reported by [`BackupPipeline::shutdown`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub written: usize,
    pub failed: usize,
    pub peak_pending: usize,
    /// Tasks still queued after the consumers exited. Always zero unless a
    /// consumer thread panicked.
    pub remaining: usize,
}

#[derive(Debug, Default)]
struct ConsumerStats {
    written: usize,
    failed: usize,
}

/// Owns the queue and its consumer threads.
pub struct BackupPipeline {
    queue: Arc<BackupQueue>,
    consumers: Vec<JoinHandle<ConsumerStats>>,
}

impl BackupPipeline {
    /// Starts `consumers` threads draining a queue of `capacity` slots.
    pub fn spawn(
        store: Arc<KvStore>,
        capacity: NonZeroUsize,
        consumers: NonZeroUsize,
    ) -> Result<Self> {
        let queue = Arc::new(BackupQueue::new(capacity));
        let mut pipeline = Self {
            queue,
            consumers: Vec::with_capacity(consumers.get()),
        };

        for id in 0..consumers.get() {
            let queue = Arc::clone(&pipeline.queue);
            let store = Arc::clone(&store);
            let spawned = thread::Builder::new()
                .name(format!("kvs-backup-{id}"))
                .spawn(move || run_consumer(id, &queue, &store));
            match spawned {
                Ok(handle) => pipeline.consumers.push(handle),
                Err(err) => {
                    pipeline.shutdown();
                    return Err(err).context("failed to spawn backup consumer");
                }
            }
        }

        info!(capacity = capacity.get(), consumers = consumers.get(), "backup pipeline started");
        Ok(pipeline)
    }

    pub fn handle(&self) -> BackupHandle {
        BackupHandle::new(Arc::clone(&self.queue))
    }

    /// Closes the queue, waits for consumers to drain it and exit.
    pub fn shutdown(self) -> PipelineReport {
        self.queue.close();

        let mut report = PipelineReport::default();
        for handle in self.consumers {
            match handle.join() {
                Ok(stats) => {
                    report.written += stats.written;
                    report.failed += stats.failed;
                }
                Err(_) => error!("backup consumer panicked"),
            }
        }
        report.peak_pending = self.queue.peak_pending();
        report.remaining = self.queue.queued();
        if report.remaining > 0 {
            warn!(remaining = report.remaining, "backup tasks dropped at shutdown");
        }

        info!(
            written = report.written,
            failed = report.failed,
            peak_pending = report.peak_pending,
            "backup pipeline stopped"
        );
        report
    }
}

fn run_consumer(id: usize, queue: &BackupQueue, store: &KvStore) -> ConsumerStats {
    let mut stats = ConsumerStats::default();
    while let Some(task) = queue.pop() {
        match write_snapshot(store, &task.path) {
            Ok(entries) => {
                stats.written += 1;
                debug!(
                    consumer = id,
                    path = %task.path.display(),
                    sequence = task.sequence,
                    entries,
                    "backup written"
                );
            }
            Err(err) => {
                stats.failed += 1;
                error!(consumer = id, sequence = task.sequence, error = ?err, "backup failed");
            }
        }
        queue.complete();
    }
    debug!(consumer = id, "backup consumer exiting");
    stats
}

/// Dumps the store to `path` as `key=value` lines. Returns the entry count.
pub fn write_snapshot(store: &KvStore, path: &Path) -> Result<usize> {
    let entries = store.snapshot()?;
    let file = File::create(path)
        .with_context(|| format!("failed to create backup file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for (key, value) in &entries {
        writeln!(writer, "{key}={value}")?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write backup file {}", path.display()))?;
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    fn task(path: &str, sequence: u32) -> BackupTask {
        BackupTask {
            path: PathBuf::from(path),
            sequence,
        }
    }

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_queue_is_fifo() {
        let queue = BackupQueue::new(nz(3));
        queue.push(task("a", 1)).unwrap();
        queue.push(task("b", 1)).unwrap();
        queue.push(task("a", 2)).unwrap();

        assert_eq!(queue.pop(), Some(task("a", 1)));
        assert_eq!(queue.pop(), Some(task("b", 1)));
        assert_eq!(queue.pop(), Some(task("a", 2)));
        assert_eq!(queue.pending(), 3);
    }

    #[test]
    fn test_producer_blocks_until_slot_frees() {
        let queue = Arc::new(BackupQueue::new(nz(1)));
        queue.push(task("first", 1)).unwrap();

        let pushed = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                queue.push(task("second", 2)).unwrap();
                pushed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!pushed.load(Ordering::SeqCst), "push past capacity should block");

        // Popping alone does not free the slot; completing the write does.
        assert_eq!(queue.pop(), Some(task("first", 1)));
        thread::sleep(Duration::from_millis(50));
        assert!(!pushed.load(Ordering::SeqCst));

        queue.complete();
        producer.join().unwrap();
        assert!(pushed.load(Ordering::SeqCst));
        assert_eq!(queue.peak_pending(), 1);
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let queue = Arc::new(BackupQueue::new(nz(1)));
        queue.push(task("first", 1)).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(task("late", 2)))
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();

        let result = producer.join().unwrap();
        assert!(matches!(result, Err(BackupError::Closed { sequence: 2, .. })));
    }

    #[test]
    fn test_closed_queue_drains_before_ending() {
        let queue = BackupQueue::new(nz(2));
        queue.push(task("a", 1)).unwrap();
        queue.push(task("a", 2)).unwrap();
        queue.close();

        assert!(queue.push(task("a", 3)).is_err());
        assert_eq!(queue.pop(), Some(task("a", 1)));
        assert_eq!(queue.pop(), Some(task("a", 2)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_pipeline_writes_snapshot_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(KvStore::new());
        store.write(&[("b", "2"), ("a", "1")])?;

        let pipeline = BackupPipeline::spawn(Arc::clone(&store), nz(2), nz(1))?;
        let handle = pipeline.handle();
        let path = dir.path().join("job-1.bck");
        handle.enqueue(BackupTask {
            path: path.clone(),
            sequence: 1,
        })?;

        let report = pipeline.shutdown();
        assert_eq!(report.written, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.remaining, 0);
        assert_eq!(fs::read_to_string(path)?, "a=1\nb=2\n");

        // Store is still usable after the pipeline stops.
        assert!(store.is_initialized());
        Ok(())
    }

    #[test]
    fn test_failed_write_does_not_stop_consumer() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(KvStore::new());
        let pipeline = BackupPipeline::spawn(store, nz(1), nz(1))?;
        let handle = pipeline.handle();

        handle.enqueue(BackupTask {
            path: dir.path().join("missing-dir").join("x-1.bck"),
            sequence: 1,
        })?;
        handle.enqueue(BackupTask {
            path: dir.path().join("x-2.bck"),
            sequence: 2,
        })?;

        let report = pipeline.shutdown();
        assert_eq!(report.failed, 1);
        assert_eq!(report.written, 1);
        assert!(dir.path().join("x-2.bck").exists());
        Ok(())
    }

    #[test]
    fn test_many_producers_respect_capacity() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(KvStore::new());
        store.write(&[("k", "v")])?;
        let pipeline = BackupPipeline::spawn(store, nz(2), nz(3))?;

        let producers: Vec<_> = (0..6)
            .map(|job| {
                let handle = pipeline.handle();
                let base = dir.path().join(format!("job{job}"));
                thread::spawn(move || {
                    for sequence in 1..=5 {
                        let path = PathBuf::from(format!("{}-{sequence}.bck", base.display()));
                        handle.enqueue(BackupTask { path, sequence }).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let report = pipeline.shutdown();
        assert_eq!(report.written, 30);
        assert!(report.peak_pending <= 2, "peak {} over capacity", report.peak_pending);
        Ok(())
    }
}
