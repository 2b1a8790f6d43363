//! Fixed-size worker pool over a bounded queue. When the queue is full the submitting
//! thread runs the job itself, which throttles the producer to the workers' pace.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct PoolCounters {
    completed: AtomicUsize,
    caller_runs: AtomicUsize,
    panicked: AtomicUsize,
}

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    exits: Receiver<usize>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    pub fn new(num_threads: usize, queue_capacity: usize) -> Result<Self> {
        let num_threads = num_threads.max(1);
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = bounded(queue_capacity.max(1));
        let (exit_sender, exits) = bounded(num_threads);
        let counters = Arc::new(PoolCounters::default());

        let workers = (0..num_threads)
            .map(|index| {
                let receiver = receiver.clone();
                let exit_sender = exit_sender.clone();
                let counters = Arc::clone(&counters);
                thread::Builder::new()
                    .name(format!("worker-{}", index))
                    .spawn(move || {
                        for job in receiver {
                            run_job(job, &counters);
                        }
                        let _ = exit_sender.send(index);
                    })
                    .with_context(|| format!("Failed to spawn worker thread {}", index))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Started {} worker thread(s) with queue capacity {}", num_threads, queue_capacity);
        Ok(Self { sender: Some(sender), exits, workers, counters })
    }

    /// Queues `job`, or runs it on the calling thread when the queue is full.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let rejected = match &self.sender {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => None,
                Err(TrySendError::Full(job)) => {
                    self.counters.caller_runs.fetch_add(1, Ordering::Relaxed);
                    Some(job)
                }
                Err(TrySendError::Disconnected(job)) => Some(job),
            },
            None => Some(job),
        };
        if let Some(job) = rejected {
            run_job(job, &self.counters);
        }
    }

    /// Stops accepting work. Queued jobs still run.
    pub fn shutdown(&mut self) {
        self.sender.take();
    }

    /// Waits for all workers to exit, waking every `interval` to log progress.
    pub fn await_termination(mut self, interval: Duration) -> PoolReport {
        self.shutdown();
        let started = Instant::now();
        let mut exited = 0;
        while exited < self.workers.len() {
            match self.exits.recv_timeout(interval) {
                Ok(index) => {
                    exited += 1;
                    debug!("Worker {} exited ({}/{})", index, exited, self.workers.len());
                }
                Err(RecvTimeoutError::Timeout) => {
                    info!(
                        "Waiting for {} worker(s) to finish; {} task(s) completed after {:.0?}",
                        self.workers.len() - exited,
                        self.counters.completed.load(Ordering::Relaxed),
                        started.elapsed()
                    );
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Worker thread terminated abnormally");
            }
        }
        self.report()
    }

    pub fn report(&self) -> PoolReport {
        PoolReport {
            completed: self.counters.completed.load(Ordering::Relaxed),
            caller_runs: self.counters.caller_runs.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: usize,
    pub caller_runs: usize,
    pub panicked: usize,
}

fn run_job(job: Job, counters: &PoolCounters) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        counters.panicked.fetch_add(1, Ordering::Relaxed);
        error!("A task panicked; continuing with the remaining rows");
    }
    counters.completed.fetch_add(1, Ordering::Relaxed);
}
