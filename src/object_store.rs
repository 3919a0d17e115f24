//! S3 adapter and deterministic key derivation.
//!
//! A repeated `put` under the same key overwrites, which is safe here: the
//! key is a pure function of the request, so two workers racing on the same
//! request write equivalent payloads to the same place.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{NaiveDate, Utc};
use tracing::debug;

use crate::error::WorkerError;
use crate::record_store::ImageFormat;
use crate::utils::sanitize_url_component;

/// Derive the object key for a capture:
/// `screenshots/YYYY-MM-DD/<requestId>_<sanitized-url>.<format>`.
///
/// Pure in all inputs; callers pass the current UTC date at upload time.
pub fn derive_key(url: &str, request_id: uuid::Uuid, format: ImageFormat, date: NaiveDate) -> String {
    format!(
        "screenshots/{}/{}_{}.{}",
        date.format("%Y-%m-%d"),
        request_id,
        sanitize_url_component(url),
        format.as_str()
    )
}

/// Capability surface over the object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return the public object URL.
    /// Idempotent: a second put under the same key overwrites.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, WorkerError>;
}

/// S3-backed object store.
///
/// The object URL is derived from bucket, region, and key, so nothing about
/// the upload needs to be persisted here.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    region: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String, region: String) -> Self {
        Self { client, bucket, region }
    }

    fn object_url(&self, key: &str) -> String {
        format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, WorkerError> {
        let size = bytes.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                WorkerError::Upload(format!("PutObject bucket={} key={key}: {e}", self.bucket))
            })?;

        debug!(key, size, "uploaded object");
        Ok(self.object_url(key))
    }
}

/// Today's UTC date, for key derivation at upload time.
pub fn current_utc_date() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_derive_key_format() {
        let id = Uuid::parse_str("6f9619ff-8b86-4d01-b42d-00cf4fc964ff").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();

        let key = derive_key("https://example.com", id, ImageFormat::Png, date);
        assert_eq!(
            key,
            "screenshots/2024-01-15/6f9619ff-8b86-4d01-b42d-00cf4fc964ff_example_com.png"
        );
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let id = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

        let a = derive_key("https://example.com/page?x=1", id, ImageFormat::Jpeg, date);
        let b = derive_key("https://example.com/page?x=1", id, ImageFormat::Jpeg, date);
        assert_eq!(a, b);
        assert!(a.ends_with(".jpeg"));
        assert!(a.starts_with("screenshots/2024-06-01/"));
    }

    #[test]
    fn test_derive_key_truncates_long_urls() {
        let id = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let long_url = format!("https://example.com/{}", "segment/".repeat(30));

        let key = derive_key(&long_url, id, ImageFormat::Png, date);
        let component = key
            .rsplit('/')
            .next()
            .unwrap()
            .trim_end_matches(".png")
            .split_once('_')
            .unwrap()
            .1;
        assert!(component.len() <= 50);
    }

    #[test]
    fn test_object_url_shape() {
        // Constructing the client is cheap and makes no network calls.
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .build();
        let store = S3ObjectStore::new(
            aws_sdk_s3::Client::from_conf(conf),
            "shots".to_string(),
            "eu-west-1".to_string(),
        );
        assert_eq!(
            store.object_url("screenshots/2024-01-15/a_b.png"),
            "https://shots.s3.eu-west-1.amazonaws.com/screenshots/2024-01-15/a_b.png"
        );
    }
}
