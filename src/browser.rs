//! Browser automation capability.
//!
//! The rest of the crate only sees [`BrowserSession`]: open a URL, read the
//! rendered page, look elements up by CSS selector, click one. The real
//! implementation drives a Chromium instance over CDP via chromiumoxide; tests
//! use a scripted fixture that serves canned HTML.

use crate::config::BrowserSettings;
use crate::error::{CollectError, Result};
use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One live browser tab.
///
/// Exactly one session exists per run. It is passed explicitly to whoever
/// fetches pages and must be closed by its owner.
#[async_trait]
pub trait BrowserSession: Send {
    /// Navigate to `url` and wait for the load event.
    async fn open(&mut self, url: &str) -> Result<()>;

    /// Rendered HTML of the current page.
    async fn page_text(&mut self) -> Result<String>;

    /// Text of every element matching `selector` on the current page.
    async fn find_all(&mut self, selector: &str) -> Result<Vec<String>>;

    /// Click the first element matching `selector`.
    ///
    /// May return before whatever the click triggers has rendered.
    async fn click(&mut self, selector: &str) -> Result<()>;

    /// Shut the browser down. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// Headless Chromium session
pub struct ChromeSession {
    browser: Option<Browser>,
    page: Page,
    handler: JoinHandle<()>,
}

impl ChromeSession {
    /// Launch a browser and open a blank tab.
    pub async fn launch(settings: &BrowserSettings) -> Result<Self> {
        info!(headless = settings.headless, "Launching browser");

        let mut builder = BrowserConfig::builder()
            .request_timeout(settings.page_timeout())
            .args(vec!["--disable-gpu", "--no-sandbox", "--disable-dev-shm-usage"]);
        builder = if settings.headless {
            builder.new_headless_mode()
        } else {
            builder.with_head()
        };
        if let Some(path) = &settings.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| CollectError::Config(format!("Invalid browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
            error!("Failed to launch browser: {}", e);
            CollectError::Browser(format!("launch failed: {}", e))
        })?;

        // CDP events have to be drained for the connection to make progress.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser.new_page("about:blank").await?;
        debug!("Browser ready");

        Ok(Self {
            browser: Some(browser),
            page,
            handler,
        })
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn open(&mut self, url: &str) -> Result<()> {
        debug!(url, "Navigating");
        self.page.goto(url).await.map_err(|e| match CollectError::from(e) {
            CollectError::Browser(msg) => CollectError::fetch(url, msg),
            other => other,
        })?;
        Ok(())
    }

    async fn page_text(&mut self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    async fn find_all(&mut self, selector: &str) -> Result<Vec<String>> {
        let elements = match self.page.find_elements(selector).await {
            Ok(elements) => elements,
            Err(e) => match CollectError::from(e) {
                // CDP reports "no node found" as an error; for us it is an empty match.
                CollectError::Browser(_) => return Ok(Vec::new()),
                fatal => return Err(fatal),
            },
        };
        let mut texts = Vec::with_capacity(elements.len());
        for element in elements {
            if let Some(text) = element.inner_text().await? {
                texts.push(text.trim().to_string());
            }
        }
        Ok(texts)
    }

    async fn click(&mut self, selector: &str) -> Result<()> {
        let element = self.page.find_element(selector).await?;
        element.click().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut browser) = self.browser.take() else {
            return Ok(());
        };
        info!("Closing browser");
        if let Err(e) = browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        if let Err(e) = browser.wait().await {
            warn!("Waiting for browser exit failed: {}", e);
        }
        self.handler.abort();
        Ok(())
    }
}
