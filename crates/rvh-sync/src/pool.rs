//! Bounded worker pools with an explicit overflow policy.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// What `submit` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    Reject,
    /// The submitter runs the task itself and waits for it.
    RunInline,
    /// The submitter waits for a free queue slot.
    Block,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::Reject => "reject",
            OverflowPolicy::RunInline => "run-inline",
            OverflowPolicy::Block => "block",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(OverflowPolicy::Reject),
            "run-inline" | "run_inline" | "inline" => Ok(OverflowPolicy::RunInline),
            "block" => Ok(OverflowPolicy::Block),
            other => Err(format!("unknown overflow policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    RanInline,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool {pool} is saturated (queue capacity {capacity})")]
    Saturated { pool: String, capacity: usize },
    #[error("worker pool {pool} is shut down")]
    Closed { pool: String },
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub name: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

/// N worker tasks draining one bounded queue. Every task runs in its own
/// spawned tokio task, so a panic is logged and the worker keeps going.
pub struct WorkerPool {
    name: Arc<str>,
    capacity: usize,
    overflow: OverflowPolicy,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("overflow", &self.overflow)
            .finish()
    }
}

impl WorkerPool {
    /// Must be called from within a tokio runtime.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<Task>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let name: Arc<str> = Arc::from(config.name.as_str());

        let workers = (0..config.workers.max(1))
            .map(|index| tokio::spawn(worker_loop(name.clone(), index, rx.clone())))
            .collect();

        Self {
            name,
            capacity,
            overflow: config.overflow,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    pub async fn submit<F>(&self, task: F) -> Result<Admission, PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| self.closed())?;

        let task: Task = Box::pin(task);
        match sender.try_send(task) {
            Ok(()) => Ok(Admission::Queued),
            Err(TrySendError::Closed(_)) => Err(self.closed()),
            Err(TrySendError::Full(task)) => match self.overflow {
                OverflowPolicy::Reject => {
                    warn!(pool = %self.name, capacity = self.capacity, "queue full, rejecting task");
                    Err(PoolError::Saturated {
                        pool: self.name.to_string(),
                        capacity: self.capacity,
                    })
                }
                OverflowPolicy::RunInline => {
                    debug!(pool = %self.name, "queue full, running task inline");
                    run_contained(&self.name, task).await;
                    Ok(Admission::RanInline)
                }
                OverflowPolicy::Block => {
                    sender.send(task).await.map_err(|_| self.closed())?;
                    Ok(Admission::Queued)
                }
            },
        }
    }

    /// Stops accepting work, lets queued tasks drain, then waits for the workers.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in workers {
            if let Err(err) = handle.await {
                warn!(pool = %self.name, error = %err, "worker ended abnormally");
            }
        }
        debug!(pool = %self.name, "pool shut down");
    }

    fn closed(&self) -> PoolError {
        PoolError::Closed {
            pool: self.name.to_string(),
        }
    }
}

async fn worker_loop(
    pool: Arc<str>,
    index: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };
        run_contained(&pool, task).await;
    }
    debug!(pool = %pool, worker = index, "worker stopped");
}

async fn run_contained(pool: &str, task: Task) {
    if let Err(err) = tokio::spawn(task).await {
        if err.is_panic() {
            error!(pool, "task panicked");
        } else {
            warn!(pool, error = %err, "task cancelled");
        }
    }
}
