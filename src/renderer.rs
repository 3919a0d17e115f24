//! Headless-Chrome rendering behind a reusable, crash-recoverable engine
//! handle.
//!
//! A single browser process is shared by all concurrent renders. Before each
//! render the handle is probed with a cheap metadata call; a dead engine is
//! torn down and relaunched under a write lock, while healthy-path renders
//! only take the read lock and never serialize on each other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::WorkerError;
use crate::record_store::ImageFormat;
use crate::utils::normalize_url;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/120.0.0.0 Safari/537.36";

/// Delays between engine launch attempts.
const LAUNCH_BACKOFF: [Duration; 3] =
    [Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(6)];

/// Settle time after navigation for late dynamic content.
const POST_NAVIGATION_WAIT: Duration = Duration::from_secs(2);

/// One render job, already normalized and defaulted by the coordinator.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub quality: u8,
    pub full_page: bool,
}

/// Capability surface over the renderer.
#[async_trait]
pub trait Render: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, WorkerError>;

    async fn close(&self);
}

/// A launched browser plus the task draining its CDP event stream.
struct Engine {
    browser: Arc<Mutex<Browser>>,
    handler: JoinHandle<()>,
}

impl Engine {
    async fn launch(config: &Config) -> Result<Self, WorkerError> {
        let browser_config = build_browser_config(config);

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| WorkerError::BrowserLaunch(e.to_string()))?;

        // The handler implements Stream and must be polled for the browser
        // connection to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler event error: {e}");
                }
            }
            debug!("CDP handler stream ended");
        });

        Ok(Self { browser: Arc::new(Mutex::new(browser)), handler: handler_task })
    }

    async fn launch_with_retry(config: &Config) -> Result<Self, WorkerError> {
        let mut last_error = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO)
            .chain(LAUNCH_BACKOFF)
            .enumerate()
        {
            sleep(delay).await;
            match Self::launch(config).await {
                Ok(engine) => {
                    info!("browser engine launched (attempt {})", attempt + 1);
                    return Ok(engine);
                }
                Err(e) => {
                    warn!("browser launch attempt {} failed: {e}", attempt + 1);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| WorkerError::BrowserLaunch("no launch attempt ran".into())))
    }

    /// Cheap liveness probe: the event task must still be running and the
    /// browser must answer a metadata call.
    async fn is_alive(&self) -> bool {
        if self.handler.is_finished() {
            return false;
        }
        self.browser.lock().await.version().await.is_ok()
    }

    async fn shutdown(self) {
        let _ = self.browser.lock().await.close().await;
        self.handler.abort();
    }
}

/// Process-wide renderer over a singleton Chrome engine.
pub struct ChromeRenderer {
    engine: RwLock<Option<Engine>>,
    config: Config,
}

impl ChromeRenderer {
    pub fn new(config: Config) -> Self {
        Self { engine: RwLock::new(None), config }
    }

    /// Launch the engine eagerly so a broken Chrome install fails the
    /// process at startup instead of on the first message.
    pub async fn warm(&self) -> Result<(), WorkerError> {
        self.ensure_engine().await.map(|_| ())
    }

    /// Return a live browser handle, relaunching the engine if the current
    /// one fails its probe. Only the relaunch path takes the write lock.
    async fn ensure_engine(&self) -> Result<Arc<Mutex<Browser>>, WorkerError> {
        {
            let guard = self.engine.read().await;
            if let Some(engine) = guard.as_ref() {
                if engine.is_alive().await {
                    return Ok(engine.browser.clone());
                }
            }
        }

        let mut guard = self.engine.write().await;
        // Another handler may have relaunched while we waited for the lock.
        if let Some(engine) = guard.as_ref() {
            if engine.is_alive().await {
                return Ok(engine.browser.clone());
            }
        }

        if let Some(stale) = guard.take() {
            warn!("browser engine unresponsive, relaunching");
            stale.shutdown().await;
        }

        let engine = Engine::launch_with_retry(&self.config).await?;
        let browser = engine.browser.clone();
        *guard = Some(engine);
        Ok(browser)
    }

    async fn capture(&self, page: &Page, request: &RenderRequest) -> Result<Vec<u8>, WorkerError> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(request.width as i64)
            .height(request.height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(WorkerError::Render)?;
        page.execute(metrics)
            .await
            .map_err(|e| WorkerError::Render(format!("set viewport: {e}")))?;

        page.set_user_agent(USER_AGENT)
            .await
            .map_err(|e| WorkerError::Render(format!("set user agent: {e}")))?;

        let url = normalize_url(&request.url);
        page.goto(url.clone())
            .await
            .map_err(|e| WorkerError::Render(format!("navigate to {url}: {e}")))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| WorkerError::Render(format!("wait for {url}: {e}")))?;

        sleep(POST_NAVIGATION_WAIT).await;

        let mut params = ScreenshotParams::builder()
            .format(match request.format {
                ImageFormat::Png => CaptureScreenshotFormat::Png,
                ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
            })
            .full_page(request.full_page);
        if request.format == ImageFormat::Jpeg {
            params = params.quality(i64::from(request.quality));
        }

        page.screenshot(params.build())
            .await
            .map_err(|e| WorkerError::Render(format!("capture: {e}")))
    }
}

#[async_trait]
impl Render for ChromeRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, WorkerError> {
        let browser = self.ensure_engine().await?;

        // new_page serializes briefly on the engine handle; page operations
        // afterwards run concurrently across handlers.
        let page = browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| WorkerError::Render(format!("new page: {e}")))?;

        let result = match timeout(self.config.screenshot_timeout, self.capture(&page, request)).await
        {
            Ok(result) => result,
            Err(_) => Err(WorkerError::RenderTimeout(self.config.screenshot_timeout)),
        };

        // The page is closed on every exit path, success or not.
        if let Err(e) = page.close().await {
            debug!("closing page after render: {e}");
        }

        result
    }

    async fn close(&self) {
        if let Some(engine) = self.engine.write().await.take() {
            engine.shutdown().await;
        }
    }
}

fn build_browser_config(config: &Config) -> BrowserConfig {
    BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .args(chrome_args())
        .build()
        // Builder failure means no auto-detected Chrome; fall back to the
        // container install path and let launch report the real error.
        .unwrap_or_else(|_| BrowserConfig::with_executable("/usr/bin/chromium"))
}

fn chrome_args() -> Vec<String> {
    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--no-first-run".to_string(),
        "--disable-sync".to_string(),
        "--hide-scrollbars".to_string(),
        format!("--user-data-dir=/tmp/screenshot-worker-{}", std::process::id()),
    ]
}
