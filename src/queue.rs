//! SQS adapter: long-poll receive and per-message acknowledge.
//!
//! Retry bookkeeping lives in the queue itself: a message that is received
//! but never deleted becomes visible again after the visibility timeout, and
//! the queue's redrive policy moves it to the dead-letter queue after the
//! configured receive count. Nothing here tracks attempts.

use aws_sdk_sqs::types::Message;

use crate::config::Config;
use crate::error::WorkerError;

/// One received message, reduced to what the handler needs.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// SQS-backed work queue.
#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    batch_size: i32,
    wait_time_seconds: i32,
    visibility_timeout: i32,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client, config: &Config) -> Self {
        Self {
            client,
            queue_url: config.queue_url.clone(),
            batch_size: config.batch_size as i32,
            wait_time_seconds: config.wait_time_seconds,
            visibility_timeout: config.visibility_timeout,
        }
    }

    /// Long-poll for up to `batch_size` messages. Returns an empty vec when
    /// the poll times out with nothing to do.
    pub async fn receive(&self) -> Result<Vec<QueueMessage>, WorkerError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(self.batch_size)
            .wait_time_seconds(self.wait_time_seconds)
            .visibility_timeout(self.visibility_timeout)
            .send()
            .await
            .map_err(|e| WorkerError::Queue(format!("ReceiveMessage: {e}")))?;

        Ok(response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(reduce_message)
            .collect())
    }

    /// Acknowledge (delete) a handled message.
    pub async fn ack(&self, receipt_handle: &str) -> Result<(), WorkerError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| WorkerError::Queue(format!("DeleteMessage: {e}")))?;
        Ok(())
    }
}

/// Drop messages missing an id, handle, or body rather than crash the loop.
fn reduce_message(message: Message) -> Option<QueueMessage> {
    let message_id = message.message_id.clone()?;
    let receipt_handle = message.receipt_handle.clone()?;
    let body = message.body.clone()?;
    Some(QueueMessage { message_id, receipt_handle, body })
}
