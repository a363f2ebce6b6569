//! FIFO task runners with a fixed cap on concurrently running tasks.
//!
//! A single dispatcher per executor pulls jobs off an unbounded queue in
//! submission order and only dequeues the next one once a semaphore slot is
//! free, so start order matches submission order while completion order is
//! unconstrained. Retries are never performed here.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("executor `{0}` is shut down")]
    Closed(&'static str),
    #[error("task panicked in executor `{0}`")]
    Panicked(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub waiting: usize,
    pub running: usize,
    pub concurrency: usize,
}

#[derive(Default)]
struct Counters {
    waiting: AtomicUsize,
    running: AtomicUsize,
}

/// Decrements `running` when the job finishes or unwinds, then frees the slot.
struct RunningSlot {
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.counters.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct BoundedExecutor {
    name: &'static str,
    concurrency: usize,
    queue: mpsc::UnboundedSender<Job>,
    counters: Arc<Counters>,
}

impl BoundedExecutor {
    /// Must be called inside a Tokio runtime; the dispatcher is spawned here.
    pub fn new(name: &'static str, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (queue, jobs) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        tokio::spawn(dispatch(
            name,
            jobs,
            Arc::new(Semaphore::new(concurrency)),
            Arc::clone(&counters),
        ));
        Self {
            name,
            concurrency,
            queue,
            counters,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn submit<F, T>(&self, task: F) -> Ticket<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let name = self.name;
        let job: Job = Box::pin(async move {
            let outcome = match std::panic::AssertUnwindSafe(task).catch_unwind().await {
                Ok(value) => Ok(value),
                Err(_) => {
                    error!(executor = name, "queued task panicked");
                    Err(ExecutorError::Panicked(name))
                }
            };
            // The submitter may have stopped listening.
            let _ = tx.send(outcome);
        });
        self.counters.waiting.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(job).is_err() {
            self.counters.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        Ticket { rx, name }
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            waiting: self.counters.waiting.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
            concurrency: self.concurrency,
        }
    }
}

async fn dispatch(
    name: &'static str,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    slots: Arc<Semaphore>,
    counters: Arc<Counters>,
) {
    while let Some(job) = jobs.recv().await {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        counters.waiting.fetch_sub(1, Ordering::SeqCst);
        counters.running.fetch_add(1, Ordering::SeqCst);
        let slot = RunningSlot {
            counters: Arc::clone(&counters),
            _permit: permit,
        };
        tokio::spawn(async move {
            let _slot = slot;
            job.await;
        });
    }
    debug!(executor = name, "executor queue closed");
}

/// Completion handle for a submitted task.
pub struct Ticket<T> {
    rx: oneshot::Receiver<Result<T, ExecutorError>>,
    name: &'static str,
}

impl<T> Future for Ticket<T> {
    type Output = Result<T, ExecutorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let name = self.name;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(ExecutorError::Closed(name))))
    }
}

/// Admits one task per inbound chat message.
#[derive(Clone)]
pub struct RequestExecutor(BoundedExecutor);

impl RequestExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self(BoundedExecutor::new("requests", concurrency))
    }

    pub fn submit<F, T>(&self, task: F) -> Ticket<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.0.submit(task)
    }

    pub fn stats(&self) -> ExecutorStats {
        self.0.stats()
    }
}

/// Serializes calls into the external fetch service.
#[derive(Clone)]
pub struct DownstreamExecutor(BoundedExecutor);

impl DownstreamExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self(BoundedExecutor::new("downstream", concurrency))
    }

    pub fn submit<F, T>(&self, task: F) -> Ticket<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.0.submit(task)
    }

    pub fn stats(&self) -> ExecutorStats {
        self.0.stats()
    }
}
