//! Per-request record model and the DynamoDB adapter behind it.
//!
//! The record store is the synchronization medium between workers: all
//! cross-worker coordination happens through conditional creates and status
//! writes on the record keyed by `requestId`.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::ProvideErrorMetadata;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkerError;

/// Secondary index over `(status, createdAt)`.
const STATUS_INDEX: &str = "status-createdAt-index";

/// Lifecycle state of a capture request.
///
/// `Processing` is written by the enqueuer, `ConsumerProcessing` marks an
/// active claim, and `Success`/`Failed` are terminal for the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Processing,
    ConsumerProcessing,
    Success,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Processing => "processing",
            RequestStatus::ConsumerProcessing => "consumerProcessing",
            RequestStatus::Success => "success",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, WorkerError> {
        match s {
            "processing" => Ok(RequestStatus::Processing),
            "consumerProcessing" => Ok(RequestStatus::ConsumerProcessing),
            "success" => Ok(RequestStatus::Success),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(WorkerError::RecordStore(format!("unknown status value: {other}"))),
        }
    }
}

/// Output image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn parse(s: &str) -> Result<Self, WorkerError> {
        match s {
            "png" => Ok(ImageFormat::Png),
            "jpeg" => Ok(ImageFormat::Jpeg),
            other => Err(WorkerError::RecordStore(format!("unknown format value: {other}"))),
        }
    }
}

/// The per-request record keyed by `requestId`.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub id: Uuid,
    pub url: String,
    pub status: RequestStatus,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub quality: u8,
    pub full_page: bool,
    pub object_url: Option<String>,
    pub object_key: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a status update may set alongside `status` and `updatedAt`.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub object_url: Option<String>,
    pub object_key: Option<String>,
    pub error_message: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<ImageFormat>,
}

impl StatusPatch {
    /// Patch applied when a worker claims a request.
    pub fn claim(width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            format: Some(format),
            ..Default::default()
        }
    }

    /// Patch applied on successful upload.
    pub fn success(object_url: String, object_key: String) -> Self {
        Self {
            object_url: Some(object_url),
            object_key: Some(object_key),
            ..Default::default()
        }
    }

    /// Patch applied on the failure path.
    pub fn failure(error_message: String) -> Self {
        Self { error_message: Some(error_message), ..Default::default() }
    }
}

/// Capability surface over the record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a record. With `only_if_absent` the insert is conditional on
    /// the primary key not existing and fails with `AlreadyExists` otherwise.
    async fn create(&self, record: &RequestRecord, only_if_absent: bool) -> Result<(), WorkerError>;

    async fn get(&self, id: Uuid) -> Result<Option<RequestRecord>, WorkerError>;

    /// Set `status`, refresh `updatedAt`, and apply `patch` in one atomic
    /// write. Deliberately unconditional on the current status: stale
    /// takeover must be able to re-claim a `consumerProcessing` record.
    async fn update_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        patch: StatusPatch,
    ) -> Result<(), WorkerError>;

    /// Records in `status`, newest first.
    async fn query_by_status(
        &self,
        status: RequestStatus,
        limit: i32,
    ) -> Result<Vec<RequestRecord>, WorkerError>;
}

/// DynamoDB-backed record store.
#[derive(Debug, Clone)]
pub struct DynamoRecordStore {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoRecordStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: String) -> Self {
        Self { client, table_name }
    }
}

#[async_trait]
impl RecordStore for DynamoRecordStore {
    async fn create(&self, record: &RequestRecord, only_if_absent: bool) -> Result<(), WorkerError> {
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(record_to_item(record)));

        if only_if_absent {
            request = request.condition_expression("attribute_not_exists(id)");
        }

        request
            .send()
            .await
            .map_err(|e| map_sdk_error("PutItem", record.id, e))?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RequestRecord>, WorkerError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("id", AttributeValue::S(id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| map_sdk_error("GetItem", id, e))?;

        response.item.map(|item| item_to_record(&item)).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        patch: StatusPatch,
    ) -> Result<(), WorkerError> {
        let now = Utc::now();
        let mut assignments = vec!["#status = :status".to_string(), "#updatedAt = :updatedAt".to_string()];
        let mut names: HashMap<String, String> = HashMap::from([
            ("#status".to_string(), "status".to_string()),
            ("#updatedAt".to_string(), "updatedAt".to_string()),
        ]);
        let mut values: HashMap<String, AttributeValue> = HashMap::from([
            (":status".to_string(), AttributeValue::S(status.as_str().to_string())),
            (":updatedAt".to_string(), AttributeValue::S(format_timestamp(now))),
        ]);

        let mut set_field = |field: &str, value: AttributeValue| {
            assignments.push(format!("#{field} = :{field}"));
            names.insert(format!("#{field}"), field.to_string());
            values.insert(format!(":{field}"), value);
        };

        if let Some(object_url) = patch.object_url {
            set_field("objectUrl", AttributeValue::S(object_url));
        }
        if let Some(object_key) = patch.object_key {
            set_field("objectKey", AttributeValue::S(object_key));
        }
        if let Some(error_message) = patch.error_message {
            set_field("errorMessage", AttributeValue::S(error_message));
        }
        if let Some(width) = patch.width {
            set_field("width", AttributeValue::N(width.to_string()));
        }
        if let Some(height) = patch.height {
            set_field("height", AttributeValue::N(height.to_string()));
        }
        if let Some(format) = patch.format {
            set_field("format", AttributeValue::S(format.as_str().to_string()));
        }

        self.client
            .update_item()
            .table_name(&self.table_name)
            .key("id", AttributeValue::S(id.to_string()))
            .update_expression(format!("SET {}", assignments.join(", ")))
            .set_expression_attribute_names(Some(names))
            .set_expression_attribute_values(Some(values))
            .send()
            .await
            .map_err(|e| map_sdk_error("UpdateItem", id, e))?;

        Ok(())
    }

    async fn query_by_status(
        &self,
        status: RequestStatus,
        limit: i32,
    ) -> Result<Vec<RequestRecord>, WorkerError> {
        let response = self
            .client
            .query()
            .table_name(&self.table_name)
            .index_name(STATUS_INDEX)
            .key_condition_expression("#status = :status")
            .expression_attribute_names("#status", "status")
            .expression_attribute_values(":status", AttributeValue::S(status.as_str().to_string()))
            .scan_index_forward(false)
            .limit(limit)
            .send()
            .await
            .map_err(|e| {
                WorkerError::RecordStore(format!("Query on {STATUS_INDEX} failed: {e}"))
            })?;

        response
            .items
            .unwrap_or_default()
            .iter()
            .map(item_to_record)
            .collect()
    }
}

/// Classify an AWS SDK error into the worker taxonomy by service error code.
fn map_sdk_error<E>(operation: &str, id: Uuid, err: aws_sdk_dynamodb::error::SdkError<E>) -> WorkerError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match err.code() {
        Some("ConditionalCheckFailedException") => WorkerError::AlreadyExists(id.to_string()),
        Some("ResourceNotFoundException") => {
            WorkerError::RecordStore(format!("{operation}: table not found: {err:?}"))
        }
        Some("ProvisionedThroughputExceededException")
        | Some("ThrottlingException")
        | Some("RequestLimitExceeded") => WorkerError::Throttled(format!("{operation} for {id}")),
        _ => WorkerError::RecordStore(format!("{operation} for {id} failed: {err:?}")),
    }
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, WorkerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WorkerError::RecordStore(format!("bad timestamp {raw}: {e}")))
}

fn record_to_item(record: &RequestRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::from([
        ("id".to_string(), AttributeValue::S(record.id.to_string())),
        ("url".to_string(), AttributeValue::S(record.url.clone())),
        ("status".to_string(), AttributeValue::S(record.status.as_str().to_string())),
        ("width".to_string(), AttributeValue::N(record.width.to_string())),
        ("height".to_string(), AttributeValue::N(record.height.to_string())),
        ("format".to_string(), AttributeValue::S(record.format.as_str().to_string())),
        ("quality".to_string(), AttributeValue::N(record.quality.to_string())),
        ("fullPage".to_string(), AttributeValue::Bool(record.full_page)),
        ("createdAt".to_string(), AttributeValue::S(format_timestamp(record.created_at))),
        ("updatedAt".to_string(), AttributeValue::S(format_timestamp(record.updated_at))),
    ]);

    if let Some(object_url) = &record.object_url {
        item.insert("objectUrl".to_string(), AttributeValue::S(object_url.clone()));
    }
    if let Some(object_key) = &record.object_key {
        item.insert("objectKey".to_string(), AttributeValue::S(object_key.clone()));
    }
    if let Some(error_message) = &record.error_message {
        item.insert("errorMessage".to_string(), AttributeValue::S(error_message.clone()));
    }

    item
}

fn item_to_record(item: &HashMap<String, AttributeValue>) -> Result<RequestRecord, WorkerError> {
    Ok(RequestRecord {
        id: Uuid::parse_str(get_s(item, "id")?)
            .map_err(|e| WorkerError::RecordStore(format!("bad record id: {e}")))?,
        url: get_s(item, "url")?.to_string(),
        status: RequestStatus::parse(get_s(item, "status")?)?,
        width: get_n(item, "width")?,
        height: get_n(item, "height")?,
        format: ImageFormat::parse(get_s(item, "format")?)?,
        quality: get_n(item, "quality")?,
        full_page: item
            .get("fullPage")
            .and_then(|v| v.as_bool().ok().copied())
            .unwrap_or(false),
        object_url: opt_s(item, "objectUrl"),
        object_key: opt_s(item, "objectKey"),
        error_message: opt_s(item, "errorMessage"),
        created_at: parse_timestamp(get_s(item, "createdAt")?)?,
        updated_at: parse_timestamp(get_s(item, "updatedAt")?)?,
    })
}

fn get_s<'a>(item: &'a HashMap<String, AttributeValue>, name: &str) -> Result<&'a str, WorkerError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .map(|s| s.as_str())
        .ok_or_else(|| WorkerError::RecordStore(format!("missing string attribute {name}")))
}

fn opt_s(item: &HashMap<String, AttributeValue>, name: &str) -> Option<String> {
    item.get(name).and_then(|v| v.as_s().ok()).cloned()
}

fn get_n<T: std::str::FromStr>(
    item: &HashMap<String, AttributeValue>,
    name: &str,
) -> Result<T, WorkerError> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| WorkerError::RecordStore(format!("missing numeric attribute {name}")))
}
