//! Environment-driven configuration.
//!
//! The worker is a daemon: every knob comes from the environment, with the
//! defaults the deployment expects. `Config::from_env` fails fast on missing
//! required values so a misconfigured pod dies at startup instead of pulling
//! messages it cannot process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

/// Browser viewport used when a message does not carry its own dimensions.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Viewport {
    /// Width in pixels (default: 1920)
    pub width: u32,
    /// Height in pixels (default: 1080)
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { width: 1920, height: 1080 }
    }
}

/// Bounds accepted for requested viewports; out-of-range values clamp.
pub const MIN_WIDTH: u32 = 100;
pub const MAX_WIDTH: u32 = 3840;
pub const MIN_HEIGHT: u32 = 100;
pub const MAX_HEIGHT: u32 = 2160;

#[derive(Debug, Clone)]
pub struct Config {
    /// AWS region, used for client construction and public object URLs.
    pub aws_region: String,
    /// URL of the SQS queue delivering capture requests.
    pub queue_url: String,
    /// S3 bucket receiving captured images.
    pub bucket_name: String,
    /// DynamoDB table holding per-request records.
    pub table_name: String,

    /// Messages fetched per receive; also the handler concurrency bound (default: 5).
    pub batch_size: usize,
    /// SQS visibility timeout in seconds (default: 300).
    pub visibility_timeout: i32,
    /// SQS long-poll wait in seconds (default: 20).
    pub wait_time_seconds: i32,

    /// Default viewport for messages that omit dimensions.
    pub viewport: Viewport,
    /// Hard per-render timeout (default: 30s).
    pub screenshot_timeout: Duration,

    /// tracing filter directive (default: "info").
    pub log_level: String,
    /// Bind port for the health endpoint (default: 8080).
    pub health_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, WorkerError> {
        let config = Self {
            aws_region: require("AWS_REGION")?,
            queue_url: require("SQS_QUEUE_URL")?,
            bucket_name: require("S3_BUCKET_NAME")?,
            table_name: require("DYNAMODB_TABLE_NAME")?,
            batch_size: parse_or("SQS_BATCH_SIZE", 5)?,
            visibility_timeout: parse_or("SQS_VISIBILITY_TIMEOUT", 300)?,
            wait_time_seconds: parse_or("SQS_WAIT_TIME_SECONDS", 20)?,
            viewport: Viewport {
                width: parse_or("SCREENSHOT_WIDTH", 1920)?,
                height: parse_or("SCREENSHOT_HEIGHT", 1080)?,
            },
            screenshot_timeout: Duration::from_millis(parse_or("SCREENSHOT_TIMEOUT", 30_000)?),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            health_port: parse_or("HEALTH_PORT", 8080)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), WorkerError> {
        if self.batch_size == 0 {
            return Err(WorkerError::Config("SQS_BATCH_SIZE must be greater than 0".into()));
        }
        if self.screenshot_timeout.is_zero() {
            return Err(WorkerError::Config("SCREENSHOT_TIMEOUT must be greater than 0".into()));
        }
        if !(MIN_WIDTH..=MAX_WIDTH).contains(&self.viewport.width) {
            return Err(WorkerError::Config(format!(
                "SCREENSHOT_WIDTH must be within {MIN_WIDTH}..={MAX_WIDTH}"
            )));
        }
        if !(MIN_HEIGHT..=MAX_HEIGHT).contains(&self.viewport.height) {
            return Err(WorkerError::Config(format!(
                "SCREENSHOT_HEIGHT must be within {MIN_HEIGHT}..={MAX_HEIGHT}"
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    /// Test configuration; production always goes through `from_env`.
    fn default() -> Self {
        Self {
            aws_region: "us-east-1".to_string(),
            queue_url: String::new(),
            bucket_name: String::new(),
            table_name: String::new(),
            batch_size: 5,
            visibility_timeout: 300,
            wait_time_seconds: 20,
            viewport: Viewport::default(),
            screenshot_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
            health_port: 8080,
        }
    }
}

fn require(name: &str) -> Result<String, WorkerError> {
    std::env::var(name)
        .map_err(|_| WorkerError::Config(format!("missing required environment variable {name}")))
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, WorkerError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| WorkerError::Config(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(default),
    }
}
