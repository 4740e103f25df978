//! Pagination Driver.
//!
//! Walks every review query's result pages in turn:
//!
//! ```text
//! Start --fetch page 1--> HasNextPage(n) --ids found && next control--> HasNextPage(n+1)
//!                                   \--otherwise--> Done
//! ```
//!
//! Page boundaries are detected only from the presence of the "next" control.
//! Every fetched page is persisted before its identifiers are extracted. A
//! fetch failure ends that query early and the batch moves on; losing the
//! browser session ends the batch.

use crate::browser::BrowserSession;
use crate::config::{list_files, SearchPageStructure};
use crate::error::{CollectError, Result};
use crate::extract::{HtmlIdentifierExtractor, IdentifierExtractor, OvidXmlExtractor, RecordId};
use crate::fetcher::PageFetcher;
use crate::reviews::ReviewQuery;
use chrono::Local;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Where a query's pagination is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Start,
    /// Page `n` (1-based) is next to fetch
    HasNextPage(u32),
    Done,
}

/// How a query's pagination ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    Complete,
    /// Stopped early on a fetch failure; pages fetched so far are kept
    Incomplete(String),
    /// Never started because the batch aborted first
    NotAttempted,
}

/// Outcome of paginating one query
#[derive(Debug, Clone)]
pub struct QueryHarvest {
    pub topic_id: String,
    pub pages_fetched: usize,
    /// Identifiers in page order; duplicates are kept
    pub identifiers: Vec<RecordId>,
    /// Pages that could not be parsed and counted as empty
    pub unparsed_pages: Vec<usize>,
    pub status: QueryStatus,
}

impl QueryHarvest {
    fn new(topic_id: &str) -> Self {
        Self {
            topic_id: topic_id.to_string(),
            pages_fetched: 0,
            identifiers: Vec::new(),
            unparsed_pages: Vec::new(),
            status: QueryStatus::Complete,
        }
    }
}

/// Outcome of paginating a whole batch
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub harvests: Vec<QueryHarvest>,
    /// Set when the session was lost and the batch aborted
    pub aborted: Option<String>,
}

impl BatchReport {
    pub fn complete(&self) -> impl Iterator<Item = &QueryHarvest> {
        self.harvests
            .iter()
            .filter(|h| h.status == QueryStatus::Complete)
    }

    pub fn incomplete(&self) -> impl Iterator<Item = &QueryHarvest> {
        self.harvests
            .iter()
            .filter(|h| matches!(h.status, QueryStatus::Incomplete(_)))
    }

    pub fn not_attempted(&self) -> impl Iterator<Item = &QueryHarvest> {
        self.harvests
            .iter()
            .filter(|h| h.status == QueryStatus::NotAttempted)
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<10} | {:<12} | {:<8} | {:<8} | status",
            "topic", "identifiers", "pages", "unparsed"
        )?;
        for h in &self.harvests {
            let status = match &h.status {
                QueryStatus::Complete => "complete".to_string(),
                QueryStatus::Incomplete(reason) => format!("incomplete ({})", reason),
                QueryStatus::NotAttempted => "not attempted".to_string(),
            };
            writeln!(
                f,
                "{:<10} | {:<12} | {:<8} | {:<8} | {}",
                h.topic_id,
                h.identifiers.len(),
                h.pages_fetched,
                h.unparsed_pages.len(),
                status
            )?;
        }
        writeln!(
            f,
            "complete: {}, incomplete: {}, not attempted: {}",
            self.complete().count(),
            self.incomplete().count(),
            self.not_attempted().count()
        )?;
        if let Some(reason) = &self.aborted {
            writeln!(f, "batch aborted: {}", reason)?;
        }
        Ok(())
    }
}

/// Raw page file for page `n` of a topic
pub fn raw_page_path(topic_dir: &Path, page: usize) -> PathBuf {
    topic_dir.join(format!("page_{:03}.html", page))
}

/// Page number of a raw page file name (`page_012.html` -> 12).
pub fn raw_page_number(name: &str) -> Option<usize> {
    name.strip_prefix("page_")?.strip_suffix(".html")?.parse().ok()
}

/// Identifiers recomputed from a topic's stored raw files
#[derive(Debug, Default)]
pub struct RawExtraction {
    pub identifiers: Vec<RecordId>,
    pub files: usize,
    /// Files that could not be parsed and were skipped
    pub unparsed: Vec<String>,
}

/// Re-run extraction over everything stored in `topic_dir`.
///
/// Result pages are read in page-number order. Ovid `.xml` exports are
/// merged and ordered by record index across all files, then follow the
/// result-page identifiers.
pub fn reextract(
    topic_dir: &Path,
    html: &HtmlIdentifierExtractor,
    ovid: &OvidXmlExtractor,
) -> Result<RawExtraction> {
    let mut pages = Vec::new();
    let mut exports = Vec::new();
    for name in list_files(topic_dir)? {
        if name.ends_with(".xml") {
            exports.push(name);
        } else {
            pages.push(name);
        }
    }
    pages.sort_by(|a, b| {
        let key = |n: &str| raw_page_number(n).unwrap_or(usize::MAX);
        key(a).cmp(&key(b)).then_with(|| a.cmp(b))
    });

    let mut out = RawExtraction {
        files: pages.len() + exports.len(),
        ..Default::default()
    };

    for name in pages {
        let raw = std::fs::read_to_string(topic_dir.join(&name))?;
        match html.extract(&raw) {
            Ok(ids) => out.identifiers.extend(ids),
            Err(e) => {
                warn!(file = %name, error = %e, "Unparseable raw page");
                out.unparsed.push(name);
            }
        }
    }

    let mut records: Vec<(u64, RecordId)> = Vec::new();
    for name in exports {
        let raw = std::fs::read_to_string(topic_dir.join(&name))?;
        match ovid.records(&raw) {
            Ok(found) => records.extend(found),
            Err(e) => {
                warn!(file = %name, error = %e, "Unparseable export");
                out.unparsed.push(name);
            }
        }
    }
    records.sort_by_key(|(index, _)| *index);
    out.identifiers.extend(records.into_iter().map(|(_, id)| id));

    Ok(out)
}

/// Drives pagination for a batch of review queries over one fetcher.
pub struct PaginationDriver<'a, S: BrowserSession, E: IdentifierExtractor> {
    fetcher: &'a mut PageFetcher<S>,
    extractor: &'a E,
    structure: &'a SearchPageStructure,
    raw_dir: PathBuf,
    failure_log: Option<PathBuf>,
}

impl<'a, S: BrowserSession, E: IdentifierExtractor> PaginationDriver<'a, S, E> {
    /// Raw pages are written to `raw_dir/<topic>/page_NNN.html`.
    pub fn new(
        fetcher: &'a mut PageFetcher<S>,
        extractor: &'a E,
        structure: &'a SearchPageStructure,
        raw_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            structure,
            raw_dir: raw_dir.into(),
            failure_log: None,
        }
    }

    /// Also append failed queries to a plain-text log.
    pub fn with_failure_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.failure_log = Some(path.into());
        self
    }

    /// Paginate every query in order.
    ///
    /// Only I/O errors on the output directory are returned as `Err`. Fetch
    /// failures mark the query incomplete; a lost session marks every
    /// remaining query not attempted.
    pub async fn run(&mut self, reviews: &[ReviewQuery]) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        for (i, review) in reviews.iter().enumerate() {
            info!(topic = %review.topic_id, "Processing systematic review");
            match self.harvest(review).await {
                Ok(harvest) => report.harvests.push(harvest),
                Err((mut harvest, CollectError::SessionLost(reason))) => {
                    error!(topic = %review.topic_id, %reason, "Browser session lost, aborting batch");
                    harvest.status = QueryStatus::Incomplete(format!("session lost: {}", reason));
                    self.log_failure(review, &reason);
                    report.harvests.push(harvest);
                    report.harvests.extend(reviews[i + 1..].iter().map(|r| QueryHarvest {
                        status: QueryStatus::NotAttempted,
                        ..QueryHarvest::new(&r.topic_id)
                    }));
                    report.aborted = Some(reason);
                    break;
                }
                Err((_, other)) => return Err(other),
            }
        }

        Ok(report)
    }

    /// Paginate one query to `Done`.
    ///
    /// On a fatal error the partial harvest comes back alongside it.
    pub async fn harvest(
        &mut self,
        review: &ReviewQuery,
    ) -> std::result::Result<QueryHarvest, (QueryHarvest, CollectError)> {
        let mut harvest = QueryHarvest::new(&review.topic_id);
        let topic_dir = self.raw_dir.join(&review.topic_id);
        if let Err(e) = std::fs::create_dir_all(&topic_dir) {
            return Err((harvest, e.into()));
        }

        let url = self.structure.search_url(&review.query);
        let wait_for = self.structure.wait_for.as_deref();
        let next = self.structure.next_selector.as_str();
        let mut state = PageState::Start;

        while state != PageState::Done {
            let fetched = match state {
                PageState::Start => {
                    state = PageState::HasNextPage(1);
                    self.fetcher.fetch(&url, wait_for).await
                }
                PageState::HasNextPage(_) => self.fetcher.next_page(next, wait_for).await,
                PageState::Done => break,
            };
            let PageState::HasNextPage(page) = state else {
                break;
            };

            let text = match fetched {
                Ok(text) => text,
                Err(e) if e.is_fatal() => return Err((harvest, e)),
                Err(e) => {
                    warn!(topic = %review.topic_id, page, error = %e, "Fetch failed, query incomplete");
                    self.log_failure(review, &e.to_string());
                    harvest.status = QueryStatus::Incomplete(e.to_string());
                    break;
                }
            };

            harvest.pages_fetched += 1;
            if let Err(e) = std::fs::write(raw_page_path(&topic_dir, page as usize), &text) {
                return Err((harvest, e.into()));
            }

            let ids = match self.extractor.extract(&text) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(topic = %review.topic_id, page, error = %e, "Unparseable page, counted as empty");
                    harvest.unparsed_pages.push(page as usize);
                    Vec::new()
                }
            };
            info!(topic = %review.topic_id, page, count = ids.len(), "Extracted identifiers");

            let has_next = if ids.is_empty() {
                false
            } else {
                match self.fetcher.has_next_page(next).await {
                    Ok(has_next) => has_next,
                    Err(e) if e.is_fatal() => return Err((harvest, e)),
                    Err(e) => {
                        warn!(topic = %review.topic_id, page, error = %e, "Next control lookup failed");
                        false
                    }
                }
            };
            harvest.identifiers.extend(ids);

            state = if has_next {
                PageState::HasNextPage(page + 1)
            } else {
                PageState::Done
            };
        }

        info!(
            topic = %review.topic_id,
            pages = harvest.pages_fetched,
            identifiers = harvest.identifiers.len(),
            "Query done"
        );
        Ok(harvest)
    }

    fn log_failure(&self, review: &ReviewQuery, message: &str) {
        let Some(path) = &self.failure_log else {
            return;
        };
        let entry = format!(
            "{}\n\n\ntopic id: {} \n\nsearch query:\n {} \n\nerror msg: \n {} \n\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            review.topic_id,
            review.query,
            message
        );
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if let Err(e) = written {
            warn!("Failed to write failure log {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::{result_page, FixtureSession};
    use crate::config::list_files;
    use crate::extract::HtmlIdentifierExtractor;
    use crate::fetcher::tests::fast_settings;
    use tempfile::TempDir;

    fn review(topic: &str, query: &str) -> ReviewQuery {
        ReviewQuery {
            topic_id: topic.to_string(),
            review_url: format!("https://example.org/{}", topic),
            query: query.to_string(),
            date_range: String::new(),
        }
    }

    fn url(query: &str) -> String {
        SearchPageStructure::default().search_url(query)
    }

    struct Harness {
        temp: TempDir,
        structure: SearchPageStructure,
        extractor: HtmlIdentifierExtractor,
    }

    impl Harness {
        fn new() -> Self {
            let structure = SearchPageStructure::default();
            let extractor = HtmlIdentifierExtractor::new(&structure).expect("default selector");
            Self {
                temp: TempDir::new().expect("tempdir"),
                structure,
                extractor,
            }
        }

        async fn run(
            &self,
            session: FixtureSession,
            reviews: &[ReviewQuery],
        ) -> Result<(BatchReport, PageFetcher<FixtureSession>)> {
            let mut fetcher = PageFetcher::new(session, &fast_settings());
            let report = PaginationDriver::new(
                &mut fetcher,
                &self.extractor,
                &self.structure,
                self.temp.path(),
            )
            .with_failure_log(self.temp.path().join("log.txt"))
            .run(reviews)
            .await?;
            Ok((report, fetcher))
        }
    }

    #[tokio::test]
    async fn test_three_pages_then_done() -> Result<()> {
        let harness = Harness::new();
        let session = FixtureSession::new().with_site(
            &url("dementia"),
            vec![
                result_page(&["111", "222"], true),
                result_page(&["333"], true),
                result_page(&[], true),
            ],
        );
        let (report, fetcher) = harness.run(session, &[review("CD007394", "dementia")]).await?;

        let harvest = &report.harvests[0];
        assert_eq!(harvest.status, QueryStatus::Complete);
        assert_eq!(harvest.identifiers, vec!["111", "222", "333"]);
        assert_eq!(harvest.pages_fetched, 3);
        assert_eq!(fetcher.loads(), 3);
        assert_eq!(list_files(&harness.temp.path().join("CD007394"))?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_k_pages_without_next_control() -> Result<()> {
        let harness = Harness::new();
        let session = FixtureSession::new().with_site(
            &url("q"),
            vec![
                result_page(&["1"], true),
                result_page(&["2"], true),
                result_page(&["3"], true),
                result_page(&["4"], false),
            ],
        );
        let (report, fetcher) = harness.run(session, &[review("t", "q")]).await?;
        assert_eq!(fetcher.loads(), 4);
        assert_eq!(report.harvests[0].pages_fetched, 4);
        assert_eq!(report.harvests[0].status, QueryStatus::Complete);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_partial_and_continues() -> Result<()> {
        let harness = Harness::new();
        let mut session = FixtureSession::new()
            .with_site(
                &url("a"),
                vec![result_page(&["1", "2"], true), result_page(&["3"], false)],
            )
            .with_site(&url("b"), vec![result_page(&["9"], false)]);
        session.fail_at_load = Some(2);

        let (report, _) = harness
            .run(session, &[review("A", "a"), review("B", "b")])
            .await?;

        assert!(matches!(report.harvests[0].status, QueryStatus::Incomplete(_)));
        assert_eq!(report.harvests[0].identifiers, vec!["1", "2"]);
        assert_eq!(report.harvests[1].status, QueryStatus::Complete);
        assert_eq!(report.harvests[1].identifiers, vec!["9"]);
        assert!(report.aborted.is_none());

        let log = std::fs::read_to_string(harness.temp.path().join("log.txt"))?;
        assert!(log.contains("topic id: A"));
        Ok(())
    }

    #[tokio::test]
    async fn test_session_loss_aborts_batch() -> Result<()> {
        let harness = Harness::new();
        let mut session = FixtureSession::new()
            .with_site(&url("a"), vec![result_page(&["1"], false)])
            .with_site(&url("b"), vec![result_page(&["2"], false)])
            .with_site(&url("c"), vec![result_page(&["3"], false)]);
        session.lose_at_load = Some(2);

        let reviews = [review("A", "a"), review("B", "b"), review("C", "c")];
        let (report, _) = harness.run(session, &reviews).await?;

        assert_eq!(report.harvests.len(), 3);
        assert_eq!(report.harvests[0].status, QueryStatus::Complete);
        assert!(matches!(report.harvests[1].status, QueryStatus::Incomplete(_)));
        assert_eq!(report.harvests[2].status, QueryStatus::NotAttempted);
        assert!(report.aborted.is_some());
        assert!(report.to_string().contains("not attempted: 1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unparseable_page_counts_as_empty() -> Result<()> {
        let harness = Harness::new();
        let session = FixtureSession::new()
            .with_site(&url("q"), vec!["Service Unavailable".to_string()]);
        let (report, _) = harness.run(session, &[review("t", "q")]).await?;
        let harvest = &report.harvests[0];
        assert_eq!(harvest.status, QueryStatus::Complete);
        assert!(harvest.identifiers.is_empty());
        assert_eq!(harvest.unparsed_pages, vec![1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_rendering_pages_are_not_read_twice() -> Result<()> {
        let harness = Harness::new();
        let mut session = FixtureSession::new().with_site(
            &url("dementia"),
            vec![
                result_page(&["111", "222"], true),
                result_page(&["333"], true),
                result_page(&[], false),
            ],
        );
        session.click_settles_after = 2;
        let (report, fetcher) = harness.run(session, &[review("CD007394", "dementia")]).await?;

        assert_eq!(report.harvests[0].identifiers, vec!["111", "222", "333"]);
        assert_eq!(fetcher.loads(), 3);
        Ok(())
    }

    fn ovid_export(records: &[(u64, &str)]) -> String {
        let body: String = records
            .iter()
            .map(|(index, id)| {
                format!(
                    r#"<record index="Record {}"><F L="Unique Identifier"><D>{}</D></F></record>"#,
                    index, id
                )
            })
            .collect();
        format!("<citations>{}</citations>", body)
    }

    #[test]
    fn test_reextract_orders_exports_across_files() -> Result<()> {
        let temp = TempDir::new()?;
        std::fs::write(
            temp.path().join("citations(1).xml"),
            ovid_export(&[(501, "501"), (502, "502")]),
        )?;
        std::fs::write(
            temp.path().join("citations.xml"),
            ovid_export(&[(2, "2"), (1, "1")]),
        )?;

        let html = HtmlIdentifierExtractor::new(&SearchPageStructure::default())?;
        let extraction = reextract(temp.path(), &html, &OvidXmlExtractor::new(None))?;
        assert_eq!(extraction.identifiers, vec!["1", "2", "501", "502"]);
        assert_eq!(extraction.files, 2);
        Ok(())
    }

    #[test]
    fn test_reextract_reads_pages_in_page_number_order() -> Result<()> {
        let temp = TempDir::new()?;
        std::fs::write(raw_page_path(temp.path(), 1000), result_page(&["c"], false))?;
        std::fs::write(raw_page_path(temp.path(), 101), result_page(&["b"], true))?;
        std::fs::write(raw_page_path(temp.path(), 2), result_page(&["a"], true))?;
        std::fs::write(temp.path().join("page_999.html"), "Service Unavailable")?;

        let html = HtmlIdentifierExtractor::new(&SearchPageStructure::default())?;
        let extraction = reextract(temp.path(), &html, &OvidXmlExtractor::new(None))?;
        assert_eq!(extraction.identifiers, vec!["a", "b", "c"]);
        assert_eq!(extraction.unparsed, vec!["page_999.html"]);
        assert_eq!(raw_page_number("page_1000.html"), Some(1000));
        assert_eq!(raw_page_number("notes.txt"), None);
        Ok(())
    }
}
