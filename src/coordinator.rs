//! The per-message state machine.
//!
//! Many workers compete over the same logical requests under at-least-once
//! delivery. Correctness rests on three mechanisms rather than a distributed
//! lock: the `consumerProcessing` + staleness check as an optimistic skip,
//! deterministic object keys so racing uploads land on the same key, and
//! idempotent status writes so repeated finalization converges. Occasional
//! double work is accepted by design.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Viewport, MAX_HEIGHT, MAX_WIDTH, MIN_HEIGHT, MIN_WIDTH};
use crate::error::WorkerError;
use crate::metrics::WorkerMetrics;
use crate::object_store::{current_utc_date, derive_key, ObjectStore};
use crate::record_store::{
    ImageFormat, RecordStore, RequestRecord, RequestStatus, StatusPatch,
};
use crate::renderer::{Render, RenderRequest};
use crate::utils::normalize_url;

/// A `consumerProcessing` record untouched for longer than this is presumed
/// orphaned by a dead worker and may be taken over.
const T_STALE_SECS: i64 = 10 * 60;

/// Backoff for in-place retries on throttled record-store calls. Everything
/// else rides the queue's redelivery and dead-letter policy.
const STORE_BACKOFF: [Duration; 3] =
    [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];

/// Inbound queue message. Unknown fields are ignored; everything except
/// `url` and `requestId` is optional and defaulted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMessage {
    pub url: Option<String>,
    pub request_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<ImageFormat>,
    pub quality: Option<u8>,
    pub full_page: Option<bool>,
}

/// A message after validation, normalization, and defaulting.
#[derive(Debug, Clone)]
struct ValidatedRequest {
    id: Uuid,
    url: String,
    width: u32,
    height: u32,
    format: ImageFormat,
    quality: u8,
    full_page: bool,
}

/// How a handled message was disposed of. All variants acknowledge; a `Nack`
/// is an `Err` from [`Coordinator::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Rendered, uploaded, record finalized as `success`.
    Completed,
    /// The record was already terminal `success`; redundant delivery.
    AlreadySucceeded,
    /// Another live worker holds the claim; the owner will finish.
    InFlight,
}

/// Coordinates one message through the request lifecycle.
pub struct Coordinator {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    renderer: Arc<dyn Render>,
    default_viewport: Viewport,
    metrics: Arc<WorkerMetrics>,
}

impl Coordinator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        renderer: Arc<dyn Render>,
        default_viewport: Viewport,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self { records, objects, renderer, default_viewport, metrics }
    }

    /// Drive one message to an `Outcome` (caller acks) or an error (caller
    /// leaves the message for redelivery).
    pub async fn handle(&self, body: &str) -> Result<Outcome, WorkerError> {
        let request = self.validate(body)?;
        let record = self.read_or_create(&request).await?;

        match record.status {
            RequestStatus::Success => {
                debug!(request_id = %request.id, "record already succeeded, acking duplicate");
                self.metrics.record_skip();
                return Ok(Outcome::AlreadySucceeded);
            }
            RequestStatus::ConsumerProcessing if !is_stale(&record, Utc::now()) => {
                info!(
                    request_id = %request.id,
                    updated_at = %record.updated_at,
                    "request claimed by a live worker, skipping"
                );
                self.metrics.record_skip();
                return Ok(Outcome::InFlight);
            }
            RequestStatus::ConsumerProcessing => {
                warn!(
                    request_id = %request.id,
                    updated_at = %record.updated_at,
                    "claim is stale, taking over"
                );
                self.metrics.record_takeover();
            }
            // A failed record is retriable via redelivery; processing is the
            // normal first delivery. Both proceed to claim.
            RequestStatus::Failed | RequestStatus::Processing => {}
        }

        self.claim(&request).await?;

        match self.render_and_upload(&request).await {
            Ok((object_url, object_key)) => {
                self.with_store_retry("finalize success", || {
                    self.records.update_status(
                        request.id,
                        RequestStatus::Success,
                        StatusPatch::success(object_url.clone(), object_key.clone()),
                    )
                })
                .await?;

                info!(request_id = %request.id, object_key = %object_key, "capture complete");
                Ok(Outcome::Completed)
            }
            Err(primary) => {
                // Record the failure for the status read path; a secondary
                // failure here must not mask the primary error.
                if let Err(secondary) = self
                    .with_store_retry("record failure", || {
                        self.records.update_status(
                            request.id,
                            RequestStatus::Failed,
                            StatusPatch::failure(primary.to_string()),
                        )
                    })
                    .await
                {
                    error!(
                        request_id = %request.id,
                        "failed to record failure ({secondary}) after error: {primary}"
                    );
                }
                Err(primary)
            }
        }
    }

    /// Step 1: parse, validate required fields, normalize the URL, apply
    /// defaults, clamp ranged values.
    fn validate(&self, body: &str) -> Result<ValidatedRequest, WorkerError> {
        let message: CaptureMessage = serde_json::from_str(body)?;

        let url = message
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| WorkerError::Malformed("missing url".into()))?
            .to_string();

        let raw_id = message
            .request_id
            .ok_or_else(|| WorkerError::Malformed("missing requestId".into()))?;
        let id = Uuid::parse_str(&raw_id)
            .map_err(|_| WorkerError::Malformed(format!("requestId is not a UUID: {raw_id}")))?;

        Ok(ValidatedRequest {
            id,
            url: normalize_url(&url),
            width: message
                .width
                .unwrap_or(self.default_viewport.width)
                .clamp(MIN_WIDTH, MAX_WIDTH),
            height: message
                .height
                .unwrap_or(self.default_viewport.height)
                .clamp(MIN_HEIGHT, MAX_HEIGHT),
            format: message.format.unwrap_or(ImageFormat::Png),
            quality: message.quality.unwrap_or(80).min(100),
            full_page: message.full_page.unwrap_or(false),
        })
    }

    /// Step 2: read the record; create it when absent (older enqueuers do
    /// not pre-write), swallowing a lost creation race.
    async fn read_or_create(&self, request: &ValidatedRequest) -> Result<RequestRecord, WorkerError> {
        if let Some(record) = self
            .with_store_retry("read record", || self.records.get(request.id))
            .await?
        {
            return Ok(record);
        }

        warn!(request_id = %request.id, "no record for message, creating one");
        let record = new_record(request);
        match self.records.create(&record, true).await {
            Ok(()) => Ok(record),
            Err(WorkerError::AlreadyExists(_)) => self
                .with_store_retry("re-read record", || self.records.get(request.id))
                .await?
                .ok_or_else(|| {
                    WorkerError::NotFound(format!("record {} vanished after create race", request.id))
                }),
            Err(e) => Err(e),
        }
    }

    /// Step 3: claim the request. Unconditional on the current status so a
    /// stale takeover can succeed, but the write refreshes `updatedAt` and
    /// staleness is measured from the new owner.
    async fn claim(&self, request: &ValidatedRequest) -> Result<(), WorkerError> {
        self.with_store_retry("claim record", || {
            self.records.update_status(
                request.id,
                RequestStatus::ConsumerProcessing,
                StatusPatch::claim(request.width, request.height, request.format),
            )
        })
        .await
    }

    /// Steps 4–5: render the page and upload under the deterministic key.
    async fn render_and_upload(
        &self,
        request: &ValidatedRequest,
    ) -> Result<(String, String), WorkerError> {
        let render_request = RenderRequest {
            url: request.url.clone(),
            width: request.width,
            height: request.height,
            format: request.format,
            quality: request.quality,
            full_page: request.full_page,
        };

        let started = Instant::now();
        let bytes = self.renderer.render(&render_request).await?;
        self.metrics.record_render(started.elapsed());

        let key = derive_key(&request.url, request.id, request.format, current_utc_date());
        let object_url = self
            .objects
            .put(&key, bytes, request.format.content_type())
            .await?;

        Ok((object_url, key))
    }

    /// Retry a record-store call in place on throttling; all other errors
    /// surface immediately and ride the queue's outer retry loop.
    async fn with_store_retry<T, F, Fut>(&self, name: &str, mut call: F) -> Result<T, WorkerError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, WorkerError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e) if e.is_retryable() && attempt < STORE_BACKOFF.len() => {
                    warn!("{name} throttled (attempt {}): {e}", attempt + 1);
                    tokio::time::sleep(STORE_BACKOFF[attempt]).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn new_record(request: &ValidatedRequest) -> RequestRecord {
    let now = Utc::now();
    RequestRecord {
        id: request.id,
        url: request.url.clone(),
        status: RequestStatus::Processing,
        width: request.width,
        height: request.height,
        format: request.format,
        quality: request.quality,
        full_page: request.full_page,
        object_url: None,
        object_key: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    }
}

fn is_stale(record: &RequestRecord, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(record.updated_at) > chrono::Duration::seconds(T_STALE_SECS)
}
