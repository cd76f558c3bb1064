//! CPU worker pool for inference and image work.
//!
//! Jobs travel over a crossbeam channel to a fixed set of OS threads so slow
//! model calls never occupy the async runtime.

use crate::error::{PipelineError, Result};
use crossbeam::channel::{self, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// `size == 0` means one worker per logical CPU.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        let size = if size == 0 { num_cpus::get() } else { size };
        let (tx, rx) = channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    for job in rx {
                        // A panicking job must not take the worker with it.
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::error!("Worker job panicked");
                        }
                    }
                })
                .map_err(|e| PipelineError::validation(format!("spawning worker thread: {e}")))?;
            workers.push(handle);
        }
        tracing::info!("Started worker pool '{}' with {} threads", name, size);

        Ok(Self {
            name: name.to_string(),
            sender: Some(tx),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job`; its return value arrives on the returned receiver.
    pub fn submit<F, T>(&self, job: F) -> Result<oneshot::Receiver<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| PipelineError::inference(format!("worker pool '{}' is shut down", self.name)))?;
        sender
            .send(Box::new(move || {
                let _ = tx.send(job());
            }))
            .map_err(|_| PipelineError::inference(format!("worker pool '{}' is shut down", self.name)))?;
        Ok(rx)
    }

    /// Run `job` on the pool and await its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(job)?
            .await
            .map_err(|_| PipelineError::inference("worker dropped the job before finishing"))?
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends each worker's receive loop.
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Worker thread in pool '{}' panicked", self.name);
            }
        }
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, max_attempts: u32) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent. Blocks the calling thread between attempts. Returns the
    /// outcome and the number of attempts made.
    pub fn retry_blocking<T>(&self, mut op: impl FnMut(u32) -> Result<T>) -> (Result<T>, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!("Attempt {} failed, retrying in {:?}: {}", attempt, delay, err);
                    thread::sleep(delay);
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }

    /// Async counterpart of [`Backoff::retry_blocking`].
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!("Attempt {} failed, retrying in {:?}: {}", attempt, delay, err);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }
}
