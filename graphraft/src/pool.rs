//! Bounded worker pools
//!
//! A pool runs `core` long lived threads fed from a bounded queue. When the
//! queue is full it grows up to `max` threads, the extra ones exiting after
//! `keep_alive` of idleness. When that is not enough either, the pool's
//! [`RejectPolicy`] decides what happens to the job.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectPolicy {
    /// Fail the submission with `Error::Busy`
    Abort,
    /// Run the job on the submitting thread
    CallerRuns,
}

pub struct WorkerPool {
    name: String,
    max: usize,
    keep_alive: Duration,
    policy: RejectPolicy,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    live: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        name: &str,
        core: usize,
        max: usize,
        queue_size: usize,
        keep_alive: Duration,
        policy: RejectPolicy,
    ) -> Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue_size);
        let pool = WorkerPool {
            name: name.to_string(),
            max: max.max(core),
            keep_alive,
            policy,
            sender: Mutex::new(Some(sender)),
            receiver,
            live: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(Vec::new()),
        };
        for _ in 0..core {
            pool.live.fetch_add(1, Ordering::SeqCst);
            pool.spawn_worker(None, None)?;
        }
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> RejectPolicy {
        self.policy
    }

    /// Number of running worker threads
    pub fn threads(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let rejected = {
            let sender = self.sender.lock().unwrap();
            let sender = sender.as_ref().ok_or(Error::Stopped)?;
            match sender.try_send(Box::new(job)) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => return Err(Error::Stopped),
                Err(TrySendError::Full(job)) => job,
            }
        };

        let rejected = match self.grow(rejected)? {
            None => return Ok(()),
            Some(job) => job,
        };

        match self.policy {
            RejectPolicy::Abort => {
                log::debug!("worker pool {} is saturated, rejecting job", self.name);
                Err(Error::Busy)
            }
            RejectPolicy::CallerRuns => {
                log::debug!("worker pool {} is saturated, running job on caller", self.name);
                rejected();
                Ok(())
            }
        }
    }

    /// Starts an extra worker for `job` if the pool is below its maximum,
    /// otherwise hands the job back.
    fn grow(&self, job: Job) -> Result<Option<Job>> {
        let mut live = self.live.load(Ordering::SeqCst);
        loop {
            if live >= self.max {
                return Ok(Some(job));
            }
            match self
                .live
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(current) => live = current,
            }
        }
        self.spawn_worker(Some(job), Some(self.keep_alive))?;
        Ok(None)
    }

    /// Spawns a worker into a slot already counted in `live`
    fn spawn_worker(&self, first: Option<Job>, idle_timeout: Option<Duration>) -> Result<()> {
        let receiver = self.receiver.clone();
        let live = self.live.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.name, live.load(Ordering::SeqCst)))
            .spawn(move || {
                if let Some(job) = first {
                    job();
                }
                loop {
                    let job = match idle_timeout {
                        None => receiver.recv().ok(),
                        // idle or disconnected, either way the extra worker retires
                        Some(timeout) => receiver.recv_timeout(timeout).ok(),
                    };
                    match job {
                        Some(job) => job(),
                        None => break,
                    }
                }
                live.fetch_sub(1, Ordering::SeqCst);
            });
        match spawned {
            Ok(handle) => {
                let mut workers = self.workers.lock().unwrap();
                // retired extra workers
                workers.retain(|worker| !worker.is_finished());
                workers.push(handle);
                Ok(())
            }
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                Err(Error::Startup(format!(
                    "failed to spawn worker for pool {}: {}",
                    self.name, e
                )))
            }
        }
    }

    /// Stops accepting jobs and waits for queued and running jobs to finish.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        if self.sender.lock().unwrap().take().is_none() {
            return;
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                log::error!("a worker of pool {} panicked", self.name);
            }
        }
        log::info!("worker pool {} drained", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
