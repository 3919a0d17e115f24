//! Process-wide consume loop.
//!
//! A single receiver long-polls the queue and fans messages out to a bounded
//! pool of handler tasks. Each message is acknowledged individually after its
//! handler succeeds; a failed handler simply leaves its message to become
//! visible again, so one bad message never blocks its batch siblings.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::metrics::WorkerMetrics;
use crate::queue::{QueueMessage, SqsQueue};
use crate::utils::retry_with_backoff;

/// How long in-flight handlers get to finish after a shutdown signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Pause after a failed receive before polling again.
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(1);

const ACK_BACKOFF: [Duration; 2] = [Duration::from_millis(100), Duration::from_millis(200)];

pub struct Consumer {
    queue: SqsQueue,
    coordinator: Arc<Coordinator>,
    metrics: Arc<WorkerMetrics>,
    concurrency: usize,
}

impl Consumer {
    pub fn new(
        queue: SqsQueue,
        coordinator: Arc<Coordinator>,
        metrics: Arc<WorkerMetrics>,
        concurrency: usize,
    ) -> Self {
        Self { queue, coordinator, metrics, concurrency }
    }

    /// Receive and dispatch until a shutdown signal arrives, then drain.
    ///
    /// Returns `true` when all in-flight handlers completed within the drain
    /// deadline; `false` means handlers were aborted and the process should
    /// exit non-zero.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> bool {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handlers: JoinSet<()> = JoinSet::new();

        info!(concurrency = self.concurrency, "consumer started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, no further receives");
                    break;
                }
                Some(result) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!("handler panicked: {e}, shutting down");
                            break;
                        }
                    }
                }
                received = self.queue.receive() => {
                    match received {
                        Ok(messages) => {
                            for message in messages {
                                self.spawn_handler(&mut handlers, semaphore.clone(), message);
                            }
                        }
                        Err(e) => {
                            error!("receive failed: {e}");
                            sleep(RECEIVE_ERROR_PAUSE).await;
                        }
                    }
                }
            }
        }

        self.drain(handlers).await
    }

    fn spawn_handler(
        &self,
        handlers: &mut JoinSet<()>,
        semaphore: Arc<Semaphore>,
        message: QueueMessage,
    ) {
        let coordinator = self.coordinator.clone();
        let queue = self.queue.clone();
        let metrics = self.metrics.clone();

        handlers.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let QueueMessage { message_id, receipt_handle, body } = message;

            match coordinator.handle(&body).await {
                Ok(outcome) => {
                    metrics.record_processed();
                    debug!(message_id = %message_id, ?outcome, "message handled");

                    let acked = retry_with_backoff("ack message", &ACK_BACKOFF, || {
                        queue.ack(&receipt_handle)
                    })
                    .await;
                    if let Err(e) = acked {
                        // The message will redeliver and hit the idempotent
                        // skip path; nothing to do beyond counting it.
                        metrics.record_ack_failure();
                        warn!(message_id = %message_id, "ack failed, message will redeliver: {e}");
                    }
                }
                Err(e) => {
                    metrics.record_failed();
                    warn!(message_id = %message_id, "handler failed, leaving message for redelivery: {e}");
                }
            }
        });
    }

    async fn drain(&self, mut handlers: JoinSet<()>) -> bool {
        if handlers.is_empty() {
            return true;
        }

        info!("waiting for {} in-flight handlers", handlers.len());
        let drained = tokio::time::timeout(DRAIN_DEADLINE, async {
            while let Some(result) = handlers.join_next().await {
                if let Err(e) = result {
                    error!("handler failed during drain: {e}");
                }
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!("all in-flight handlers completed");
                true
            }
            Err(_) => {
                error!("drain deadline exceeded, aborting {} handlers", handlers.len());
                handlers.abort_all();
                false
            }
        }
    }
}
