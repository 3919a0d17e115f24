use std::time::Duration;

use tracing::{error, warn};

/// Normalize a target URL before rendering or key derivation.
///
/// Trims surrounding whitespace and prepends `https://` when no HTTP scheme
/// is present, so bare hostnames like `example.com` are renderable.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Reduce a URL to an object-key-safe component: scheme stripped, every
/// non-alphanumeric character replaced by `_`, truncated to 50 characters.
pub fn sanitize_url_component(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    without_scheme
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(50)
        .collect()
}

/// Retry an async operation with bounded backoff.
///
/// `delays` drives both the attempt count (len + 1) and the sleep before each
/// retry. The final error is returned unchanged.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    delays: &[Duration],
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = delays.len() + 1;
    for (attempt, delay) in delays.iter().enumerate() {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    operation_name,
                    attempt + 1,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(*delay).await;
            }
        }
    }

    operation().await.map_err(|e| {
        error!("{} failed after {} attempts: {}", operation_name, max_attempts, e);
        e
    })
}
