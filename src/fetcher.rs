//! Page Fetcher.
//!
//! Wraps a [`BrowserSession`] with the run's timeout, politeness delay and
//! optional wait condition. Every page load is awaited to completion before
//! the next one is issued. No retries: a page that does not load within the
//! timeout is a [`CollectError::Fetch`].

use crate::browser::BrowserSession;
use crate::config::BrowserSettings;
use crate::error::{CollectError, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Sequential page loader over one browser session
pub struct PageFetcher<S: BrowserSession> {
    session: S,
    timeout: Duration,
    poll_interval: Duration,
    delay: Duration,
    loads: usize,
}

impl<S: BrowserSession> PageFetcher<S> {
    pub fn new(session: S, settings: &BrowserSettings) -> Self {
        Self {
            session,
            timeout: settings.page_timeout(),
            poll_interval: settings.poll_interval(),
            delay: settings.request_delay(),
            loads: 0,
        }
    }

    /// Number of page loads issued so far
    pub fn loads(&self) -> usize {
        self.loads
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Load `url` and return its rendered content.
    ///
    /// When `wait_for` is set the page only counts as loaded once an element
    /// matching it is present.
    pub async fn fetch(&mut self, url: &str, wait_for: Option<&str>) -> Result<String> {
        self.pause().await;
        self.loads += 1;
        debug!(url, load = self.loads, "Fetching page");

        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.session.open(url)).await {
            Ok(result) => result?,
            Err(_) => return Err(CollectError::fetch(url, format!("timed out after {:?}", timeout))),
        }
        self.settle(url, wait_for).await
    }

    /// Whether the current page shows a "next page" control.
    pub async fn has_next_page(&mut self, next_selector: &str) -> Result<bool> {
        Ok(!self.session.find_all(next_selector).await?.is_empty())
    }

    /// Activate the "next page" control and return the new page's content.
    ///
    /// A click returns before the page it triggers has rendered, so the page
    /// only counts as loaded once its content differs from the page the
    /// control was clicked on.
    pub async fn next_page(&mut self, next_selector: &str, wait_for: Option<&str>) -> Result<String> {
        let before = self.session.page_text().await?;
        self.pause().await;
        self.loads += 1;
        debug!(control = next_selector, load = self.loads, "Following next page");

        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.session.click(next_selector)).await {
            Ok(result) => result.map_err(|e| match e {
                CollectError::Browser(msg) => CollectError::fetch(next_selector, msg),
                other => other,
            })?,
            Err(_) => {
                return Err(CollectError::fetch(
                    next_selector,
                    format!("timed out after {:?}", timeout),
                ))
            }
        }
        self.await_change(next_selector, &before).await?;
        self.settle(next_selector, wait_for).await
    }

    /// Text of every element matching `selector` on the current page.
    pub async fn find_all(&mut self, selector: &str) -> Result<Vec<String>> {
        self.session.find_all(selector).await
    }

    /// Close the underlying session.
    pub async fn close(&mut self) -> Result<()> {
        self.session.close().await
    }

    async fn await_change(&mut self, what: &str, before: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if self.session.page_text().await? != before {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(page = what, "Page unchanged after following next control");
                return Err(CollectError::fetch(
                    what,
                    format!("page unchanged {:?} after click", self.timeout),
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn settle(&mut self, what: &str, wait_for: Option<&str>) -> Result<String> {
        if let Some(selector) = wait_for {
            let deadline = tokio::time::Instant::now() + self.timeout;
            loop {
                if !self.session.find_all(selector).await?.is_empty() {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(page = what, selector, "Wait condition never satisfied");
                    return Err(CollectError::fetch(
                        what,
                        format!("'{}' not present after {:?}", selector, self.timeout),
                    ));
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        self.session.page_text().await
    }

    /// Politeness delay before a load; zero before the first one.
    fn pause(&self) -> tokio::time::Sleep {
        if self.loads == 0 || self.delay.is_zero() {
            return tokio::time::sleep(Duration::ZERO);
        }
        let jitter = rand::random::<u64>() % (self.delay.as_millis() as u64 / 2 + 1);
        tokio::time::sleep(self.delay + Duration::from_millis(jitter))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::browser::fixture::{result_page, FixtureSession};

    /// Settings with no delays, for tests.
    pub fn fast_settings() -> BrowserSettings {
        BrowserSettings {
            page_timeout_secs: 1,
            poll_interval_millis: 10,
            request_delay_millis: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_returns_page_text() -> Result<()> {
        let session = FixtureSession::new().with_site("u", vec![result_page(&["1"], false)]);
        let mut fetcher = PageFetcher::new(session, &fast_settings());
        let text = fetcher.fetch("u", None).await?;
        assert!(text.contains("docsum-pmid"));
        assert!(!fetcher.has_next_page("button.next-page").await?);
        assert_eq!(fetcher.loads(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_url_is_fetch_error() {
        let mut fetcher = PageFetcher::new(FixtureSession::new(), &fast_settings());
        let err = fetcher.fetch("missing", None).await.expect_err("should fail");
        assert!(matches!(err, CollectError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_unmet_wait_condition_times_out() {
        let session = FixtureSession::new().with_site("u", vec![result_page(&[], false)]);
        let mut fetcher = PageFetcher::new(session, &fast_settings());
        let err = fetcher
            .fetch("u", Some("span.docsum-pmid"))
            .await
            .expect_err("wait condition cannot be met");
        assert!(matches!(err, CollectError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_next_page_advances() -> Result<()> {
        let session = FixtureSession::new().with_site(
            "u",
            vec![result_page(&["1"], true), result_page(&["2"], false)],
        );
        let mut fetcher = PageFetcher::new(session, &fast_settings());
        fetcher.fetch("u", None).await?;
        assert!(fetcher.has_next_page("button.next-page").await?);
        let text = fetcher.next_page("button.next-page", Some("span.docsum-pmid")).await?;
        assert!(text.contains(">2<"));
        assert_eq!(fetcher.find_all("span.docsum-pmid").await?, vec!["2"]);
        fetcher.close().await?;
        assert!(fetcher.session().closed);
        Ok(())
    }

    #[tokio::test]
    async fn test_next_page_waits_for_click_to_render() -> Result<()> {
        let mut session = FixtureSession::new().with_site(
            "u",
            vec![result_page(&["1"], true), result_page(&["2"], false)],
        );
        session.click_settles_after = 3;
        let mut fetcher = PageFetcher::new(session, &fast_settings());
        fetcher.fetch("u", None).await?;

        let text = fetcher.next_page("button.next-page", None).await?;
        assert!(text.contains(">2<"));
        assert!(!text.contains(">1<"));
        assert!(fetcher.session().reads() >= 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_click_that_changes_nothing_is_fetch_error() {
        let page = result_page(&["1"], true);
        let session = FixtureSession::new().with_site("u", vec![page.clone(), page]);
        let mut fetcher = PageFetcher::new(session, &fast_settings());
        fetcher.fetch("u", None).await.expect("first page loads");

        let err = fetcher
            .next_page("button.next-page", None)
            .await
            .expect_err("unchanged page");
        assert!(matches!(err, CollectError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_hanging_load_times_out() {
        let mut session = FixtureSession::new().with_site("u", vec![result_page(&["1"], false)]);
        session.hang_at_load = Some(1);
        let mut fetcher = PageFetcher::new(session, &fast_settings());

        let err = fetcher.fetch("u", None).await.expect_err("load never finishes");
        assert!(matches!(err, CollectError::Fetch { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_fetch_futures_are_send_without_sync_session() {
        fn assert_send<F: Send>(_: F) {}
        let mut settings = fast_settings();
        settings.request_delay_millis = 50;
        let mut fetcher = PageFetcher::new(FixtureSession::new(), &settings);
        assert_send(fetcher.fetch("u", None));
        assert_send(fetcher.next_page("button.next-page", None));
    }
}
