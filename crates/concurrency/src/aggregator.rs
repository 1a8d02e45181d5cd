//! Save aggregator: many concurrent adds, one persistence call per batch
//!
//! Producers enqueue `(key, fingerprints)` tasks on a bounded queue and block
//! when it is full. A single worker thread owns all mutation of the current
//! range: it gathers tasks into a batch, applies them in submission order,
//! calls the persistence callback once, and hands the callback's result to
//! every task in the batch.
//!
//! # Batching
//!
//! The worker waits `max(10ms, (100 - batch_len)ms)` for each next task, so
//! the first arrival gets about 100ms of coalescing and a batch of a hundred
//! flushes after 10ms of quiet. A batch never keeps collecting for more than
//! one second.
//!
//! # Thread Lifecycle
//!
//! `close()` drops the queue sender, lets the worker drain what is queued,
//! and joins it. A fatal error from the range (invalid timestamp, write into
//! a compacted segment) fails the batch without persisting it and stops the
//! worker; later submissions resolve to `Error::Closed`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tidemark_core::{Clock, Error, Fingerprint, Key, Result};
use tidemark_storage::Range;
use tracing::{debug, error};

/// Longest time a batch keeps collecting tasks.
pub const MAX_BATCH_WINDOW: Duration = Duration::from_secs(1);

/// Default bound of the task queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Persistence step invoked once per batch with the current range.
pub type SaveCallback = Arc<dyn Fn(&Arc<Range>) -> Result<()> + Send + Sync>;

/// How long to wait for the next task given the current batch size.
pub fn batch_deadline(batch_len: usize) -> Duration {
    let ms = 100u64.saturating_sub(batch_len as u64).max(10);
    Duration::from_millis(ms)
}

struct SaveTask {
    key: Key,
    fps: Vec<Fingerprint>,
    out: SyncSender<Result<()>>,
}

/// Completion of one submitted task.
#[must_use = "a save handle does nothing unless waited on"]
pub struct SaveHandle {
    rx: Receiver<Result<()>>,
}

impl SaveHandle {
    fn resolved(result: Result<()>) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        let _ = tx.send(result);
        SaveHandle { rx }
    }

    /// Block until the task's batch is persisted or rejected.
    pub fn wait(self) -> Result<()> {
        self.rx.recv().unwrap_or(Err(Error::Closed))
    }

    /// Wait at most `timeout`; `None` if the batch is still in flight.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Error::Closed)),
        }
    }

    /// Non-blocking poll.
    pub fn try_wait(&self) -> Option<Result<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::Closed)),
        }
    }
}

#[derive(Default)]
struct BatchStats {
    tasks: AtomicU64,
    batches: AtomicU64,
}

/// Coalesces concurrent adds into batched saves of one range.
pub struct SaveAggregator {
    sender: Mutex<Option<SyncSender<SaveTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    current: Arc<Range>,
    stats: Arc<BatchStats>,
    stopped: Arc<AtomicBool>,
}

impl SaveAggregator {
    /// Start a worker writing into `range` and persisting through `callback`.
    ///
    /// `capacity` bounds the task queue; producers block when it is full.
    pub fn new(
        range: Arc<Range>,
        clock: Arc<dyn Clock>,
        capacity: usize,
        callback: SaveCallback,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let stats = Arc::new(BatchStats::default());
        let stopped = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            rx,
            range: Arc::clone(&range),
            clock,
            callback,
            stats: Arc::clone(&stats),
            stopped: Arc::clone(&stopped),
        };
        let handle = thread::Builder::new()
            .name(format!("tidemark-saver-{:x}", range.start()))
            .spawn(move || worker.run())?;

        Ok(SaveAggregator {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            current: range,
            stats,
            stopped,
        })
    }

    /// The range this aggregator writes into.
    pub fn range(&self) -> &Arc<Range> {
        &self.current
    }

    /// Enqueue a task; blocks while the queue is full.
    pub fn add_async(&self, key: Key, fps: Vec<Fingerprint>) -> SaveHandle {
        let sender = match self.sender.lock().as_ref() {
            Some(s) => s.clone(),
            None => return SaveHandle::resolved(Err(Error::Closed)),
        };
        let (out, rx) = mpsc::sync_channel(1);
        if sender.send(SaveTask { key, fps, out }).is_err() {
            return SaveHandle::resolved(Err(Error::Closed));
        }
        SaveHandle { rx }
    }

    /// Enqueue a task and wait for its batch.
    pub fn add(&self, key: Key, fps: Vec<Fingerprint>) -> Result<()> {
        self.add_async(key, fps).wait()
    }

    /// Stop accepting tasks, drain the queue and join the worker. Idempotent.
    pub fn close(&self) {
        drop(self.sender.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(target: "tidemark::saver", start = self.current.start(), "save worker panicked");
            }
        }
    }

    /// True once the worker has exited.
    pub fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Average number of tasks per flushed batch.
    pub fn metrics(&self) -> f64 {
        let batches = self.stats.batches.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.stats.tasks.load(Ordering::Relaxed) as f64 / batches as f64
    }

    /// Number of batches flushed so far.
    pub fn batches(&self) -> u64 {
        self.stats.batches.load(Ordering::Relaxed)
    }
}

impl Drop for SaveAggregator {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SaveAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveAggregator")
            .field("range", &self.current.start())
            .field("batches", &self.batches())
            .field("avg_batch", &self.metrics())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Worker {
    rx: Receiver<SaveTask>,
    range: Arc<Range>,
    clock: Arc<dyn Clock>,
    callback: SaveCallback,
    stats: Arc<BatchStats>,
    stopped: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        loop {
            let (batch, disconnected) = self.next_batch();
            if !batch.is_empty() {
                if let Err(e) = self.flush(batch) {
                    error!(
                        target: "tidemark::saver",
                        start = self.range.start(),
                        error = %e,
                        "fatal error applying batch, stopping save worker"
                    );
                    break;
                }
            }
            if disconnected {
                break;
            }
        }
        self.stopped.store(true, Ordering::SeqCst);
        debug!(target: "tidemark::saver", start = self.range.start(), "save worker exited");
    }

    /// Collect one batch. The flag reports that the queue is closed and empty.
    fn next_batch(&self) -> (Vec<SaveTask>, bool) {
        let started = Instant::now();
        let mut tasks = Vec::new();
        loop {
            match self.rx.recv_timeout(batch_deadline(tasks.len())) {
                Ok(task) => {
                    tasks.push(task);
                    if started.elapsed() >= MAX_BATCH_WINDOW {
                        return (tasks, false);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return (tasks, false),
                Err(RecvTimeoutError::Disconnected) => return (tasks, true),
            }
        }
    }

    /// Apply `tasks` in order and persist. Only fatal errors are returned.
    fn flush(&self, mut tasks: Vec<SaveTask>) -> Result<()> {
        let mut accepted = tasks.len();
        for (i, task) in tasks.iter().enumerate() {
            match self.range.add(task.key, &task.fps, self.clock.unix()) {
                Ok(true) => {}
                Ok(false) => {
                    accepted = i;
                    break;
                }
                Err(e) => {
                    for t in &tasks {
                        let _ = t.out.send(Err(e.clone()));
                    }
                    return Err(e);
                }
            }
        }

        let rejected = tasks.split_off(accepted);
        for t in &rejected {
            let _ = t.out.send(Err(Error::RangeFull));
        }
        if tasks.is_empty() {
            debug!(
                target: "tidemark::saver",
                start = self.range.start(),
                rejected = rejected.len(),
                "range full, batch rejected"
            );
            return Ok(());
        }

        let result = (self.callback)(&self.range);
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .tasks
            .fetch_add(tasks.len() as u64, Ordering::Relaxed);
        debug!(
            target: "tidemark::saver",
            start = self.range.start(),
            size = tasks.len(),
            rejected = rejected.len(),
            ok = result.is_ok(),
            "batch flushed"
        );
        for t in tasks {
            let _ = t.out.send(result.clone());
        }
        Ok(())
    }
}
