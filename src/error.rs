use thiserror::Error;

/// Error taxonomy for the worker.
///
/// Kinds map to dispositions: `Malformed` is nacked so the dead-letter queue
/// eventually absorbs it, `AlreadyExists` is swallowed by the coordinator,
/// `Throttled` is retried in place, `Render`/`Upload` write a failed record
/// and nack, and `BrowserLaunch`/`Config` are fatal for the process.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record store throttled: {0}")]
    Throttled(String),

    #[error("record store error: {0}")]
    RecordStore(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("render timed out after {0:?}")]
    RenderTimeout(std::time::Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    /// Whether an in-place retry with backoff is worthwhile before nacking.
    /// Only record-store throttling qualifies; the queue's redelivery and
    /// dead-letter policy are the outer retry loop for everything else.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkerError::Throttled(_))
    }

    /// Errors that should take the process down rather than nack a message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::BrowserLaunch(_) | WorkerError::Config(_))
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Malformed(err.to_string())
    }
}
