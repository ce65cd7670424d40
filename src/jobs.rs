use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, warn};

use crate::codec;
use crate::entry::HistoryEntry;
use crate::UndoError;

pub const IO_WORKERS: usize = 4;

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// One unit of background disk work. Jobs targeting the same entry
/// serialize on the entry lock, not on queue order.
pub enum Job {
    /// Write the step file for an entry that has not been saved yet.
    SaveStep(Arc<HistoryEntry>),
    /// Populate an evicted entry's blob from its step file.
    WarmStepCache(Arc<HistoryEntry>),
    /// Populate user/command key data during manifest reconciliation.
    LoadStepKey(Arc<HistoryEntry>),
    /// Remove the step files for a pruned tail. Idempotent.
    DeleteSteps(Vec<u64>),
}

impl Job {
    pub fn run(&self, dir: &Path) -> crate::Result<()> {
        match self {
            Job::SaveStep(entry) => {
                let mut state = entry.lock()?;
                if !state.saved {
                    codec::write_step(
                        dir,
                        entry.timestamp(),
                        state.user_id,
                        &state.command,
                        &state.blob,
                    )?;
                    state.saved = true;
                }
                Ok(())
            }
            Job::WarmStepCache(entry) => {
                let mut state = entry.lock()?;
                if state.blob.is_empty() {
                    state.blob = codec::read_step_blob(dir, entry.timestamp())?;
                }
                Ok(())
            }
            Job::LoadStepKey(entry) => {
                let mut state = entry.lock()?;
                let key = codec::read_step_key(dir, entry.timestamp())?;
                if key.timestamp != entry.timestamp() {
                    warn!(
                        "step file for {} carries timestamp {}",
                        entry.timestamp(),
                        key.timestamp
                    );
                }
                state.user_id = key.user_id;
                state.command = key.command;
                Ok(())
            }
            Job::DeleteSteps(timestamps) => {
                for stamp in timestamps {
                    codec::remove_step(dir, *stamp)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Default)]
struct QueueInner {
    queue: VecDeque<Job>,
    in_flight: usize,
    done: bool,
}

/// FIFO job queue drained by a fixed pool of worker threads.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, job: Job) -> crate::Result<()> {
        let mut inner = self.lock()?;
        if inner.done {
            warn!("job dropped: queue is shut down");
            return Ok(());
        }
        inner.queue.push_back(job);
        self.cond.notify_one();
        Ok(())
    }

    // Blocks until every queued job has been dequeued and completed,
    // polling the condition variable on a 100 ms timeout.
    pub fn drain(&self) -> crate::Result<()> {
        let mut inner = self.lock()?;
        while !inner.queue.is_empty() || inner.in_flight > 0 {
            let (guard, _) = self
                .cond
                .wait_timeout(inner, DRAIN_POLL)
                .map_err(|e| UndoError::Lock(e.to_string()))?;
            inner = guard;
        }
        Ok(())
    }

    // Signals workers to exit once the queue is empty.
    pub fn shutdown(&self) -> crate::Result<()> {
        self.lock()?.done = true;
        self.cond.notify_all();
        Ok(())
    }

    fn lock(&self) -> crate::Result<MutexGuard<'_, QueueInner>> {
        self.inner
            .lock()
            .map_err(|e| UndoError::Lock(e.to_string()))
    }

    fn worker_loop(&self, dir: &Path) {
        loop {
            let job = {
                let mut inner = match self.lock() {
                    Ok(guard) => guard,
                    Err(e) => {
                        error!("I/O worker exiting: {}", e);
                        return;
                    }
                };
                loop {
                    if inner.done && inner.queue.is_empty() {
                        return;
                    }
                    if let Some(job) = inner.queue.pop_front() {
                        inner.in_flight += 1;
                        break job;
                    }
                    inner = match self.cond.wait(inner) {
                        Ok(guard) => guard,
                        Err(e) => {
                            error!("I/O worker exiting: {}", e);
                            return;
                        }
                    };
                }
            };

            if let Err(e) = job.run(dir) {
                error!("background I/O job failed: {}", e);
            }

            match self.lock() {
                Ok(mut inner) => {
                    inner.in_flight -= 1;
                    self.cond.notify_all();
                }
                Err(e) => {
                    error!("I/O worker exiting: {}", e);
                    return;
                }
            }
        }
    }
}

pub fn spawn_workers(queue: &Arc<JobQueue>, dir: PathBuf) -> crate::Result<Vec<JoinHandle<()>>> {
    let mut workers = Vec::with_capacity(IO_WORKERS);
    for i in 0..IO_WORKERS {
        let queue = Arc::clone(queue);
        let dir = dir.clone();
        let handle = std::thread::Builder::new()
            .name(format!("undo-io-{}", i))
            .spawn(move || queue.worker_loop(&dir))?;
        workers.push(handle);
    }
    Ok(workers)
}
