//! Generic fixed-size worker pool with round-robin distribution.
//!
//! A [`Master`] owns `K` long-lived threads, each with its own job queue. A
//! call to [`Master::execute`] builds one [`Worker`] per slot from a factory,
//! deals the items out round-robin (item `i` goes to worker `i % K`), runs all
//! workers concurrently and blocks until each has reported back. The partial
//! results, ordered by worker id, are handed to an aggregation closure.
//!
//! A worker that panics contributes no partial result. The barrier still
//! releases, so callers that need every worker to succeed should compare the
//! number of partial results with [`Master::worker_count`].

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default time [`Master::shutdown`] waits for pool threads to exit.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("worker pool needs at least one worker")]
    NoWorkers,
    #[error("worker pool has been shut down")]
    ShutDown,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// A unit of work that consumes items one at a time and produces one result
/// once its queue is drained.
pub trait Worker: Send + 'static {
    type Item: Send + 'static;
    type Output: Send + 'static;

    fn process(&mut self, item: Self::Item);

    fn finish(self) -> Self::Output;
}

/// Output of one worker, tagged with the slot it ran in.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult<T> {
    pub worker_id: usize,
    pub output: T,
}

pub struct Master {
    job_senders: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    exit_rx: Receiver<usize>,
    worker_count: usize,
    grace: Duration,
}

impl Master {
    /// Starts a pool of `workers` threads.
    ///
    /// # Errors
    ///
    /// Returns [`MasterError::NoWorkers`] for an empty pool, or
    /// [`MasterError::Spawn`] if the OS refuses to create a thread.
    pub fn new(workers: usize) -> Result<Self, MasterError> {
        if workers == 0 {
            return Err(MasterError::NoWorkers);
        }

        let (exit_tx, exit_rx) = channel::unbounded();
        let mut job_senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let (job_tx, job_rx) = channel::unbounded::<Job>();
            let exit_tx = exit_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("master-worker-{id}"))
                .spawn(move || {
                    for job in job_rx {
                        job();
                    }
                    let _ = exit_tx.send(id);
                })?;
            job_senders.push(job_tx);
            handles.push(handle);
        }

        debug!(workers, "Worker pool started");
        Ok(Self {
            job_senders,
            handles,
            exit_rx,
            worker_count: workers,
            grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Runs one batch of items across the pool and aggregates the results.
    ///
    /// `factory` is called once per worker slot, with the slot id, on the
    /// calling thread. Slots that receive no items still run and contribute
    /// whatever their worker produces when finished empty.
    ///
    /// # Errors
    ///
    /// Returns [`MasterError::ShutDown`] if the pool has already been shut down.
    pub fn execute<W, F, A, R>(
        &self,
        items: Vec<W::Item>,
        mut factory: F,
        aggregate: A,
    ) -> Result<R, MasterError>
    where
        W: Worker,
        F: FnMut(usize) -> W,
        A: FnOnce(Vec<PartialResult<W::Output>>) -> R,
    {
        if self.job_senders.is_empty() {
            return Err(MasterError::ShutDown);
        }

        let k = self.worker_count;
        let total_items = items.len();

        let (item_senders, item_receivers): (Vec<_>, Vec<_>) =
            (0..k).map(|_| channel::unbounded::<W::Item>()).unzip();
        for (i, item) in items.into_iter().enumerate() {
            // Receivers are alive until the jobs below consume them.
            let _ = item_senders[i % k].send(item);
        }
        drop(item_senders);

        let (done_tx, done_rx) = channel::bounded::<(usize, Option<W::Output>)>(k);

        for (worker_id, (items_rx, job_tx)) in
            item_receivers.into_iter().zip(&self.job_senders).enumerate()
        {
            let worker = factory(worker_id);
            let done_tx = done_tx.clone();
            let job: Job = Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
                    let mut worker = worker;
                    for item in items_rx {
                        worker.process(item);
                    }
                    worker.finish()
                }));
                let output = match outcome {
                    Ok(output) => Some(output),
                    Err(payload) => {
                        error!(
                            worker_id,
                            panic = panic_message(payload.as_ref()),
                            "Worker panicked, its partial result is lost"
                        );
                        None
                    }
                };
                let _ = done_tx.send((worker_id, output));
            });

            if job_tx.send(job).is_err() {
                // The pool thread is gone, so this slot will never report.
                warn!(worker_id, "Worker thread unavailable, skipping slot");
            }
        }
        drop(done_tx);

        // Every dispatched job reports exactly once. If a job is dropped
        // unrun its sender goes with it, which ends this loop early instead of
        // hanging.
        let mut partials = Vec::with_capacity(k);
        for _ in 0..k {
            match done_rx.recv() {
                Ok((worker_id, Some(output))) => partials.push(PartialResult { worker_id, output }),
                Ok((_, None)) => {}
                Err(_) => break,
            }
        }
        partials.sort_by_key(|p| p.worker_id);

        if partials.len() < k {
            warn!(
                completed = partials.len(),
                expected = k,
                "Not all workers produced a result"
            );
        }
        debug!(
            items = total_items,
            workers = k,
            completed = partials.len(),
            "Batch finished"
        );

        Ok(aggregate(partials))
    }

    /// Stops accepting work and waits up to the grace period for the pool
    /// threads to exit. Threads still running after that are detached.
    ///
    /// Returns `true` if every thread exited in time.
    pub fn shutdown(&mut self) -> bool {
        if self.job_senders.is_empty() && self.handles.is_empty() {
            return true;
        }
        self.job_senders.clear();

        let deadline = Instant::now() + self.grace;
        let mut exited = 0;
        while exited < self.handles.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.exit_rx.recv_timeout(remaining) {
                Ok(_) => exited += 1,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let handles = std::mem::take(&mut self.handles);
        if exited < handles.len() {
            warn!(
                exited,
                total = handles.len(),
                grace_secs = self.grace.as_secs_f64(),
                "Worker pool did not stop in time, detaching remaining threads"
            );
            return false;
        }

        for handle in handles {
            let _ = handle.join();
        }
        info!(workers = self.worker_count, "Worker pool shut down");
        true
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs a single batch on a private pool that is shut down afterwards.
///
/// # Errors
///
/// Fails if the pool cannot be created.
pub fn run_once<W, F, A, R>(
    workers: usize,
    items: Vec<W::Item>,
    factory: F,
    aggregate: A,
) -> Result<R, MasterError>
where
    W: Worker,
    F: FnMut(usize) -> W,
    A: FnOnce(Vec<PartialResult<W::Output>>) -> R,
{
    let mut master = Master::new(workers)?;
    let result = master.execute(items, factory, aggregate);
    master.shutdown();
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
