//! Coordinator scenarios driven end-to-end over in-memory fakes.
//!
//! The fakes mirror the adapter contracts: conditional create, unconditional
//! status update with a refreshed `updatedAt`, overwriting puts under
//! deterministic keys. Failure injection covers the render, upload, and
//! throttling paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::Viewport;
use crate::coordinator::{Coordinator, Outcome};
use crate::error::WorkerError;
use crate::metrics::WorkerMetrics;
use crate::object_store::ObjectStore;
use crate::record_store::{ImageFormat, RecordStore, RequestRecord, RequestStatus, StatusPatch};
use crate::renderer::{Render, RenderRequest};

#[derive(Default)]
struct MemoryRecordStore {
    records: Mutex<HashMap<Uuid, RequestRecord>>,
    /// Number of upcoming calls that fail with `Throttled`.
    throttled_calls: AtomicUsize,
}

impl MemoryRecordStore {
    async fn insert(&self, record: RequestRecord) {
        self.records.lock().await.insert(record.id, record);
    }

    async fn snapshot(&self, id: Uuid) -> Option<RequestRecord> {
        self.records.lock().await.get(&id).cloned()
    }

    fn throttle_next(&self, calls: usize) {
        self.throttled_calls.store(calls, Ordering::SeqCst);
    }

    fn check_throttle(&self) -> Result<(), WorkerError> {
        if self
            .throttled_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(WorkerError::Throttled("injected".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: &RequestRecord, only_if_absent: bool) -> Result<(), WorkerError> {
        self.check_throttle()?;
        let mut records = self.records.lock().await;
        if only_if_absent && records.contains_key(&record.id) {
            return Err(WorkerError::AlreadyExists(record.id.to_string()));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RequestRecord>, WorkerError> {
        self.check_throttle()?;
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        patch: StatusPatch,
    ) -> Result<(), WorkerError> {
        self.check_throttle()?;
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| WorkerError::RecordStore(format!("no record {id}")))?;

        record.status = status;
        record.updated_at = Utc::now();
        if let Some(object_url) = patch.object_url {
            record.object_url = Some(object_url);
        }
        if let Some(object_key) = patch.object_key {
            record.object_key = Some(object_key);
        }
        if let Some(error_message) = patch.error_message {
            record.error_message = Some(error_message);
        }
        if let Some(width) = patch.width {
            record.width = width;
        }
        if let Some(height) = patch.height {
            record.height = height;
        }
        if let Some(format) = patch.format {
            record.format = format;
        }
        Ok(())
    }

    async fn query_by_status(
        &self,
        status: RequestStatus,
        limit: i32,
    ) -> Result<Vec<RequestRecord>, WorkerError> {
        let records = self.records.lock().await;
        let mut matching: Vec<_> = records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit as usize);
        Ok(matching)
    }
}

#[derive(Default)]
struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    fail: AtomicBool,
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String, WorkerError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::Upload("injected upload failure".into()));
        }
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(format!("https://bucket.s3.us-east-1.amazonaws.com/{key}"))
    }
}

#[derive(Default)]
struct FakeRenderer {
    renders: AtomicUsize,
    fail: AtomicBool,
    delay: Option<Duration>,
}

#[async_trait]
impl Render for FakeRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, WorkerError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::Render(format!("navigation to {} failed", request.url)));
        }
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn close(&self) {}
}

struct Harness {
    records: Arc<MemoryRecordStore>,
    objects: Arc<MemoryObjectStore>,
    renderer: Arc<FakeRenderer>,
    coordinator: Arc<Coordinator>,
}

fn harness() -> Harness {
    let records = Arc::new(MemoryRecordStore::default());
    let objects = Arc::new(MemoryObjectStore::default());
    let renderer = Arc::new(FakeRenderer::default());
    let coordinator = Arc::new(Coordinator::new(
        records.clone(),
        objects.clone(),
        renderer.clone(),
        Viewport::default(),
        Arc::new(WorkerMetrics::new()),
    ));
    Harness { records, objects, renderer, coordinator }
}

fn pending_record(id: Uuid, status: RequestStatus, updated_minutes_ago: i64) -> RequestRecord {
    let now = Utc::now();
    RequestRecord {
        id,
        url: "https://example.com".to_string(),
        status,
        width: 1920,
        height: 1080,
        format: ImageFormat::Png,
        quality: 80,
        full_page: false,
        object_url: None,
        object_key: None,
        error_message: None,
        created_at: now - chrono::Duration::minutes(updated_minutes_ago),
        updated_at: now - chrono::Duration::minutes(updated_minutes_ago),
    }
}

fn body_for(id: Uuid) -> String {
    format!(r#"{{"url": "example.com", "requestId": "{id}"}}"#)
}

#[tokio::test]
async fn completes_first_delivery() {
    let h = harness();
    let id = Uuid::new_v4();
    h.records.insert(pending_record(id, RequestStatus::Processing, 0)).await;

    let outcome = h.coordinator.handle(&body_for(id)).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let record = h.records.snapshot(id).await.unwrap();
    assert_eq!(record.status, RequestStatus::Success);
    let key = record.object_key.unwrap();
    assert!(key.starts_with("screenshots/"));
    assert!(key.ends_with(&format!("{id}_example_com.png")));
    assert!(record.object_url.unwrap().ends_with(&key));
    assert!(record.error_message.is_none());

    assert_eq!(h.renderer.renders.load(Ordering::SeqCst), 1);
    assert!(h.objects.objects.lock().await.contains_key(&key));
}

#[tokio::test]
async fn creates_record_when_absent() {
    let h = harness();
    let id = Uuid::new_v4();

    let outcome = h.coordinator.handle(&body_for(id)).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let record = h.records.snapshot(id).await.unwrap();
    assert_eq!(record.status, RequestStatus::Success);
    assert_eq!(record.url, "https://example.com");
}

#[tokio::test]
async fn acks_duplicate_after_success() {
    let h = harness();
    let id = Uuid::new_v4();
    let mut record = pending_record(id, RequestStatus::Success, 5);
    record.object_url = Some("https://bucket.s3.us-east-1.amazonaws.com/u".to_string());
    record.object_key = Some("u".to_string());
    let before = record.clone();
    h.records.insert(record).await;

    let outcome = h.coordinator.handle(&body_for(id)).await.unwrap();
    assert_eq!(outcome, Outcome::AlreadySucceeded);

    // No render, no upload, record untouched
    assert_eq!(h.renderer.renders.load(Ordering::SeqCst), 0);
    assert_eq!(h.objects.puts.load(Ordering::SeqCst), 0);
    assert_eq!(h.records.snapshot(id).await.unwrap(), before);
}

#[tokio::test]
async fn skips_request_claimed_by_live_worker() {
    let h = harness();
    let id = Uuid::new_v4();
    h.records
        .insert(pending_record(id, RequestStatus::ConsumerProcessing, 2))
        .await;

    let outcome = h.coordinator.handle(&body_for(id)).await.unwrap();
    assert_eq!(outcome, Outcome::InFlight);

    assert_eq!(h.renderer.renders.load(Ordering::SeqCst), 0);
    let record = h.records.snapshot(id).await.unwrap();
    assert_eq!(record.status, RequestStatus::ConsumerProcessing);
}

#[tokio::test]
async fn takes_over_stale_claim() {
    let h = harness();
    let id = Uuid::new_v4();
    h.records
        .insert(pending_record(id, RequestStatus::ConsumerProcessing, 15))
        .await;

    let outcome = h.coordinator.handle(&body_for(id)).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let record = h.records.snapshot(id).await.unwrap();
    assert_eq!(record.status, RequestStatus::Success);
    assert_eq!(h.renderer.renders.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_record_is_retried_on_redelivery() {
    let h = harness();
    let id = Uuid::new_v4();
    let mut record = pending_record(id, RequestStatus::Failed, 5);
    record.error_message = Some("navigation to https://example.com failed".to_string());
    h.records.insert(record).await;

    let outcome = h.coordinator.handle(&body_for(id)).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(
        h.records.snapshot(id).await.unwrap().status,
        RequestStatus::Success
    );
}

#[tokio::test]
async fn render_failure_writes_failed_record_and_nacks() {
    let h = harness();
    let id = Uuid::new_v4();
    h.records.insert(pending_record(id, RequestStatus::Processing, 0)).await;
    h.renderer.fail.store(true, Ordering::SeqCst);

    let err = h.coordinator.handle(&body_for(id)).await.unwrap_err();
    assert!(matches!(err, WorkerError::Render(_)));

    let record = h.records.snapshot(id).await.unwrap();
    assert_eq!(record.status, RequestStatus::Failed);
    assert!(record.error_message.unwrap().contains("navigation"));
    assert!(record.object_url.is_none());
    assert!(h.objects.objects.lock().await.is_empty());
}

#[tokio::test]
async fn upload_failure_writes_failed_record_and_nacks() {
    let h = harness();
    let id = Uuid::new_v4();
    h.records.insert(pending_record(id, RequestStatus::Processing, 0)).await;
    h.objects.fail.store(true, Ordering::SeqCst);

    let err = h.coordinator.handle(&body_for(id)).await.unwrap_err();
    assert!(matches!(err, WorkerError::Upload(_)));

    let record = h.records.snapshot(id).await.unwrap();
    assert_eq!(record.status, RequestStatus::Failed);
    assert!(record.error_message.is_some());
}

#[tokio::test]
async fn malformed_messages_nack_without_touching_stores() {
    let h = harness();

    for body in [
        "not json at all",
        r#"{"requestId": "6f9619ff-8b86-4d01-b42d-00cf4fc964ff"}"#,
        r#"{"url": "example.com"}"#,
        r#"{"url": "   ", "requestId": "6f9619ff-8b86-4d01-b42d-00cf4fc964ff"}"#,
        r#"{"url": "example.com", "requestId": "not-a-uuid"}"#,
    ] {
        let err = h.coordinator.handle(body).await.unwrap_err();
        assert!(matches!(err, WorkerError::Malformed(_)), "body: {body}");
    }

    assert!(h.records.records.lock().await.is_empty());
    assert_eq!(h.renderer.renders.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_duplicate_deliveries_converge() {
    let h = harness();
    let id = Uuid::new_v4();
    // Slow render keeps the first handler in flight while the second runs.
    let renderer = Arc::new(FakeRenderer {
        delay: Some(Duration::from_millis(200)),
        ..Default::default()
    });
    let coordinator = Arc::new(Coordinator::new(
        h.records.clone(),
        h.objects.clone(),
        renderer.clone(),
        Viewport::default(),
        Arc::new(WorkerMetrics::new()),
    ));

    let body = body_for(id);
    let (first, second) = tokio::join!(coordinator.handle(&body), coordinator.handle(&body));

    first.unwrap();
    second.unwrap();

    let record = h.records.snapshot(id).await.unwrap();
    assert_eq!(record.status, RequestStatus::Success);

    // Both deliveries may have rendered, but the deterministic key means at
    // most one object exists.
    let renders = renderer.renders.load(Ordering::SeqCst);
    assert!((1..=2).contains(&renders));
    assert_eq!(h.objects.objects.lock().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn throttled_store_calls_are_retried_in_place() {
    let h = harness();
    let id = Uuid::new_v4();
    h.records.insert(pending_record(id, RequestStatus::Processing, 0)).await;
    h.records.throttle_next(2);

    let outcome = h.coordinator.handle(&body_for(id)).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(
        h.records.snapshot(id).await.unwrap().status,
        RequestStatus::Success
    );
}

#[tokio::test]
async fn message_defaults_and_clamping() {
    let h = harness();
    let id = Uuid::new_v4();
    let body = format!(
        r#"{{"url": "example.com", "requestId": "{id}", "width": 9999, "height": 50}}"#
    );

    h.coordinator.handle(&body).await.unwrap();

    let record = h.records.snapshot(id).await.unwrap();
    // Requested viewport clamps to the supported bounds
    assert_eq!(record.width, 3840);
    assert_eq!(record.height, 100);
    assert_eq!(record.format, ImageFormat::Png);
}

#[tokio::test]
async fn claim_refreshes_updated_at_for_takeover_accounting() {
    let h = harness();
    let id = Uuid::new_v4();
    h.records
        .insert(pending_record(id, RequestStatus::ConsumerProcessing, 15))
        .await;
    let stale_updated_at = h.records.snapshot(id).await.unwrap().updated_at;

    h.coordinator.handle(&body_for(id)).await.unwrap();

    let record = h.records.snapshot(id).await.unwrap();
    assert!(record.updated_at > stale_updated_at);
}

#[tokio::test]
async fn query_by_status_orders_newest_first() {
    let h = harness();
    let older = pending_record(Uuid::new_v4(), RequestStatus::Processing, 30);
    let newer = pending_record(Uuid::new_v4(), RequestStatus::Processing, 1);
    let done = pending_record(Uuid::new_v4(), RequestStatus::Success, 2);
    h.records.insert(older.clone()).await;
    h.records.insert(newer.clone()).await;
    h.records.insert(done).await;

    let listed = h
        .records
        .query_by_status(RequestStatus::Processing, 10)
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, newer.id);
    assert_eq!(listed[1].id, older.id);
}
