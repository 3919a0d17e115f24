//! # Screenshot Worker
//!
//! A horizontally-scaled worker that consumes screenshot-capture requests
//! from SQS, renders each URL with headless Chrome, uploads the image to S3,
//! and records the outcome in DynamoDB.
//!
//! Many worker processes compete over the same logical requests under
//! at-least-once delivery. The coordinator turns that into exactly-once
//! *effect* without a distributed lock:
//!
//! - every request has a four-state record (`processing` →
//!   `consumerProcessing` → `success` | `failed`) in a strongly-consistent
//!   store, and workers skip requests another live worker has claimed;
//! - a claim older than ten minutes is presumed orphaned and taken over;
//! - object keys are a pure function of the request, and status writes are
//!   idempotent, so the rare double render converges to the same state.
//!
//! The queue's visibility timeout and dead-letter redrive policy provide the
//! outer retry loop; the worker never tracks attempt counts itself.

/// Environment-driven configuration
pub mod config;

/// Error taxonomy
pub mod error;

/// Request lifecycle coordination: the per-message state machine
pub mod coordinator;

/// Request records in DynamoDB
pub mod record_store;

/// Captured images in S3
pub mod object_store;

/// Headless-Chrome rendering with a crash-recoverable engine handle
pub mod renderer;

/// SQS receive/ack
pub mod queue;

/// Consume loop and graceful shutdown
pub mod worker;

/// Liveness endpoint
pub mod health;

/// Pipeline instrumentation
pub mod metrics;

/// URL normalization and retry helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use config::{Config, Viewport};
pub use coordinator::{CaptureMessage, Coordinator, Outcome};
pub use error::WorkerError;
pub use metrics::WorkerMetrics;
pub use object_store::{derive_key, ObjectStore, S3ObjectStore};
pub use queue::{QueueMessage, SqsQueue};
pub use record_store::{
    DynamoRecordStore, ImageFormat, RecordStore, RequestRecord, RequestStatus, StatusPatch,
};
pub use renderer::{ChromeRenderer, Render, RenderRequest};
pub use worker::Consumer;
