//! Renderer session contract + WebDriver-backed browser sessions.

use std::time::Duration;

use async_trait::async_trait;
use fantoccini::error::CmdError;
use fantoccini::{Client, ClientBuilder, Locator};
use rand::Rng;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "pricewatch-render";

const IDENTITY_POOL: &[&str] = &[
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36 Edg/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:126.0) Gecko/20100101 Firefox/126.0",
];

/// Pick a desktop browser identity string for a new session.
pub fn random_identity() -> String {
    let i = rand::rng().random_range(0..IDENTITY_POOL.len());
    IDENTITY_POOL[i].to_string()
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub headless: bool,
    /// Fixed identity string; `None` draws a fresh one per session.
    pub identity: Option<String>,
    pub disable_images: bool,
    pub disable_gpu: bool,
    pub no_sandbox: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            identity: None,
            disable_images: true,
            disable_gpu: true,
            no_sandbox: true,
        }
    }
}

impl SessionConfig {
    pub fn browser_args(&self, identity: &str) -> Vec<String> {
        let mut args = Vec::new();
        if self.headless {
            args.push("--headless=new".to_string());
        }
        args.push(format!("--user-agent={identity}"));
        if self.disable_images {
            args.push("--blink-settings=imagesEnabled=false".to_string());
        }
        if self.disable_gpu {
            args.push("--disable-gpu".to_string());
        }
        if self.no_sandbox {
            args.push("--no-sandbox".to_string());
            args.push("--disable-dev-shm-usage".to_string());
        }
        args
    }

    fn resolve_identity(&self) -> String {
        self.identity.clone().unwrap_or_else(random_identity)
    }
}

/// Randomized pause after navigation, drawn uniformly from `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelay {
    min: Duration,
    max: Duration,
}

impl Default for SettleDelay {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(6))
    }
}

impl SettleDelay {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self) -> Duration {
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        if lo == hi {
            return self.min;
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("renderer session failed to start: {0}")]
    Start(String),
    #[error("navigation to {locator} failed: {reason}")]
    Navigation { locator: String, reason: String },
    #[error("timed out after {after:?} waiting for `{selector}`")]
    WaitTimeout { selector: String, after: Duration },
    #[error("renderer command failed: {0}")]
    Command(String),
    #[error("renderer session already closed")]
    Closed,
}

/// Opens renderer sessions. One session is opened per run.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn open(&self, config: &SessionConfig) -> Result<Box<dyn RendererSession>, SessionError>;
}

/// Exclusively owned handle to one live rendering engine.
#[async_trait]
pub trait RendererSession: Send {
    /// Load `locator`, then hold for `settle` before the page is read.
    async fn navigate(&mut self, locator: &str, settle: Duration) -> Result<(), SessionError>;

    /// Block until an element matching the CSS `selector` exists, or `timeout` elapses.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError>;

    async fn page_source(&mut self) -> Result<String, SessionError>;

    /// Release the engine. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Chrome driven over the WebDriver protocol.
#[derive(Debug, Clone)]
pub struct WebDriverRenderer {
    webdriver_url: String,
}

impl WebDriverRenderer {
    pub fn new(webdriver_url: impl Into<String>) -> Self {
        Self {
            webdriver_url: webdriver_url.into(),
        }
    }

    pub fn capabilities(config: &SessionConfig, identity: &str) -> JsonMap<String, JsonValue> {
        let mut caps = JsonMap::new();
        caps.insert("browserName".to_string(), json!("chrome"));
        caps.insert(
            "goog:chromeOptions".to_string(),
            json!({ "args": config.browser_args(identity) }),
        );
        caps
    }
}

#[async_trait]
impl Renderer for WebDriverRenderer {
    async fn open(&self, config: &SessionConfig) -> Result<Box<dyn RendererSession>, SessionError> {
        let identity = config.resolve_identity();
        let mut builder = ClientBuilder::native();
        builder.capabilities(Self::capabilities(config, &identity));
        let client = builder
            .connect(&self.webdriver_url)
            .await
            .map_err(|e| SessionError::Start(e.to_string()))?;
        info!(webdriver = %self.webdriver_url, identity = %identity, "renderer session opened");
        Ok(Box::new(WebDriverSession {
            client: Some(client),
        }))
    }
}

pub struct WebDriverSession {
    client: Option<Client>,
}

impl WebDriverSession {
    fn client(&self) -> Result<&Client, SessionError> {
        self.client.as_ref().ok_or(SessionError::Closed)
    }
}

#[async_trait]
impl RendererSession for WebDriverSession {
    async fn navigate(&mut self, locator: &str, settle: Duration) -> Result<(), SessionError> {
        self.client()?
            .goto(locator)
            .await
            .map_err(|e| SessionError::Navigation {
                locator: locator.to_string(),
                reason: e.to_string(),
            })?;
        debug!(locator, settle_ms = settle.as_millis() as u64, "settling after navigation");
        tokio::time::sleep(settle).await;
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        match self
            .client()?
            .wait()
            .at_most(timeout)
            .for_element(Locator::Css(selector))
            .await
        {
            Ok(_) => Ok(()),
            Err(CmdError::WaitTimeout) => Err(SessionError::WaitTimeout {
                selector: selector.to_string(),
                after: timeout,
            }),
            Err(err) => Err(SessionError::Command(err.to_string())),
        }
    }

    async fn page_source(&mut self) -> Result<String, SessionError> {
        self.client()?
            .source()
            .await
            .map_err(|e| SessionError::Command(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        client
            .close()
            .await
            .map_err(|e| SessionError::Command(e.to_string()))?;
        info!("renderer session closed");
        Ok(())
    }
}
