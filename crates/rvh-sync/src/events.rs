//! Best-effort progress events.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const EVENT_QUEUE_CAPACITY: usize = 2000;
pub const EVENT_OFFER_TIMEOUT: Duration = Duration::from_millis(50);

/// Never fails and never blocks the caller for long; dropped events are only logged.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, message: String);
}

/// Writes events straight to `tracing` on the caller's task.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn record(&self, message: String) {
        info!(target: "rvh::events", "{message}");
    }
}

/// Queues events on a bounded channel drained by a background task.
#[derive(Debug, Clone)]
pub struct AsyncEventLogger {
    tx: mpsc::Sender<String>,
    offer_timeout: Duration,
}

impl AsyncEventLogger {
    pub fn start() -> (Self, JoinHandle<()>) {
        Self::with_capacity(EVENT_QUEUE_CAPACITY, EVENT_OFFER_TIMEOUT)
    }

    /// The drain task exits once every clone of the logger is dropped.
    pub fn with_capacity(capacity: usize, offer_timeout: Duration) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
        let drain = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                info!(target: "rvh::events", "{message}");
            }
            info!(target: "rvh::events", "event logger stopped");
        });
        (Self { tx, offer_timeout }, drain)
    }
}

#[async_trait]
impl EventSink for AsyncEventLogger {
    async fn record(&self, message: String) {
        match self.tx.send_timeout(message, self.offer_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(message)) => {
                warn!(target: "rvh::events", dropped = %message, "event queue full");
            }
            Err(SendTimeoutError::Closed(message)) => {
                warn!(target: "rvh::events", dropped = %message, "event queue closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_without_blocking_the_caller() {
        let (tx, rx) = mpsc::channel::<String>(1);
        let logger = AsyncEventLogger {
            tx,
            offer_timeout: Duration::from_millis(10),
        };
        logger.record("first".into()).await;

        let started = tokio::time::Instant::now();
        logger.record("second".into()).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(rx);
    }

    #[tokio::test]
    async fn drain_task_ends_when_logger_dropped() {
        let (logger, drain) = AsyncEventLogger::with_capacity(8, EVENT_OFFER_TIMEOUT);
        logger.record("job created".into()).await;
        drop(logger);
        drain.await.unwrap();
    }
}
