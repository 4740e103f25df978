//! Per-Identifier Downloader.
//!
//! Fetches one detail record (title or abstract) per identifier, strictly in
//! input order and one at a time. A record that cannot be retrieved is kept
//! as a missing entry so the output stays aligned with the input; only a
//! lost browser session stops the batch.

use crate::browser::BrowserSession;
use crate::config::DetailPageStructure;
use crate::error::{CollectError, Result};
use crate::extract::RecordId;
use crate::fetcher::PageFetcher;
use crate::reviews::ReviewQuery;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Which detail to download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetailKind {
    Title,
    Abstract,
}

impl DetailKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DetailKind::Title => "title",
            DetailKind::Abstract => "abstract",
        }
    }
}

impl fmt::Display for DetailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetailKind {
    type Err = CollectError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "title" => Ok(DetailKind::Title),
            "abstract" => Ok(DetailKind::Abstract),
            other => Err(CollectError::Validation(format!("unknown detail kind '{}'", other))),
        }
    }
}

/// Anything that can look up one detail for one identifier.
///
/// `Ok(None)` means the record has no such detail.
#[async_trait]
pub trait DetailSource: Send {
    async fn fetch_detail(&mut self, id: &str, kind: DetailKind) -> Result<Option<String>>;
}

/// One identifier's detail; `text` is `None` for a missing detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailEntry {
    pub id: RecordId,
    pub text: Option<String>,
}

impl DetailEntry {
    pub fn is_missing(&self) -> bool {
        self.text.is_none()
    }
}

/// Details for a list of identifiers, in the list's order
#[derive(Debug, Clone)]
pub struct DetailBatch {
    pub kind: DetailKind,
    pub entries: Vec<DetailEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DetailRow {
    id: String,
    status: String,
    text: String,
}

impl DetailBatch {
    pub fn missing(&self) -> impl Iterator<Item = &DetailEntry> {
        self.entries.iter().filter(|e| e.is_missing())
    }

    /// Identifier -> text lookup over found entries.
    pub fn lookup(&self) -> HashMap<&str, &str> {
        self.entries
            .iter()
            .filter_map(|e| e.text.as_deref().map(|t| (e.id.as_str(), t)))
            .collect()
    }

    /// Write as CSV with columns `id,status,text`.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        for entry in &self.entries {
            wtr.serialize(DetailRow {
                id: entry.id.clone(),
                status: if entry.is_missing() { "missing" } else { "found" }.to_string(),
                text: entry.text.clone().unwrap_or_default(),
            })?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Read a batch back, or `None` when it was never downloaded.
    pub fn read_optional(path: &Path, kind: DetailKind) -> Result<Option<Self>> {
        if !path.exists() {
            warn!(?path, %kind, "No downloaded details");
            return Ok(None);
        }
        Self::read_csv(path, kind).map(Some)
    }

    pub fn read_csv(path: &Path, kind: DetailKind) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut entries = Vec::new();
        for row in reader.deserialize() {
            let row: DetailRow = row?;
            entries.push(DetailEntry {
                id: row.id,
                text: (row.status == "found").then_some(row.text),
            });
        }
        Ok(Self { kind, entries })
    }
}

/// Download one detail per identifier, sequentially and in order.
pub async fn download_details<D: DetailSource + ?Sized>(
    source: &mut D,
    ids: &[RecordId],
    kind: DetailKind,
) -> Result<DetailBatch> {
    info!(count = ids.len(), %kind, "Downloading details");
    let mut entries = Vec::with_capacity(ids.len());

    for id in ids {
        let text = match source.fetch_detail(id, kind).await {
            Ok(Some(text)) => Some(text),
            Ok(None) => {
                debug!(id = %id, %kind, "No detail for identifier");
                None
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(id = %id, %kind, error = %e, "Detail fetch failed");
                None
            }
        };
        entries.push(DetailEntry {
            id: id.clone(),
            text,
        });
    }

    let batch = DetailBatch { kind, entries };
    let missing = batch.missing().count();
    info!(total = ids.len(), missing, %kind, "Detail download complete");
    Ok(batch)
}

/// Reads details from each record's page through the browser.
pub struct BrowserDetailSource<'a, S: BrowserSession> {
    fetcher: &'a mut PageFetcher<S>,
    structure: DetailPageStructure,
}

impl<'a, S: BrowserSession> BrowserDetailSource<'a, S> {
    pub fn new(fetcher: &'a mut PageFetcher<S>, structure: DetailPageStructure) -> Self {
        Self { fetcher, structure }
    }

    fn selector(&self, kind: DetailKind) -> &str {
        match kind {
            DetailKind::Title => &self.structure.title_selector,
            DetailKind::Abstract => &self.structure.abstract_selector,
        }
    }
}

#[async_trait]
impl<'a, S: BrowserSession> DetailSource for BrowserDetailSource<'a, S> {
    async fn fetch_detail(&mut self, id: &str, kind: DetailKind) -> Result<Option<String>> {
        let url = self.structure.detail_url(id);
        self.fetcher.fetch(&url, None).await?;
        let selector = self.selector(kind).to_string();
        let parts: Vec<String> = self
            .fetcher
            .find_all(&selector)
            .await?
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        Ok((!parts.is_empty()).then(|| parts.join("\n")))
    }
}

/// Title of every review's landing page, as `(topic id, title)` in review
/// order. A title that cannot be found is left empty.
pub async fn download_review_titles<S: BrowserSession>(
    fetcher: &mut PageFetcher<S>,
    reviews: &[ReviewQuery],
    title_selector: &str,
) -> Result<Vec<(String, String)>> {
    // Review URLs are complete already.
    let structure = DetailPageStructure {
        url_template: "{id}".to_string(),
        title_selector: title_selector.to_string(),
        ..Default::default()
    };
    let urls: Vec<RecordId> = reviews.iter().map(|r| r.review_url.clone()).collect();

    let mut source = BrowserDetailSource::new(fetcher, structure);
    let batch = download_details(&mut source, &urls, DetailKind::Title).await?;

    Ok(reviews
        .iter()
        .zip(batch.entries)
        .map(|(review, entry)| {
            if entry.is_missing() {
                warn!(topic = %review.topic_id, "Review title not found");
            }
            (review.topic_id.clone(), entry.text.unwrap_or_default())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::FixtureSession;
    use crate::fetcher::tests::fast_settings;
    use tempfile::TempDir;

    fn article(title: &str, paragraphs: &[&str]) -> String {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<p>{}</p>", p))
            .collect();
        format!(
            r#"<html><h1 class="heading-title">{}</h1><div class="abstract-content">{}</div></html>"#,
            title, body
        )
    }

    fn detail_url(id: &str) -> String {
        DetailPageStructure::default().detail_url(id)
    }

    fn ids(list: &[&str]) -> Vec<RecordId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_missing_abstract_keeps_position() -> Result<()> {
        let session = FixtureSession::new()
            .with_site(&detail_url("111"), vec![article("One", &["Background.", "Results."])])
            .with_site(&detail_url("222"), vec![article("Two", &[])])
            .with_site(&detail_url("333"), vec![article("Three", &["Only."])]);
        let mut fetcher = PageFetcher::new(session, &fast_settings());
        let mut source = BrowserDetailSource::new(&mut fetcher, DetailPageStructure::default());

        let batch =
            download_details(&mut source, &ids(&["111", "222", "333"]), DetailKind::Abstract).await?;

        let order: Vec<&str> = batch.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["111", "222", "333"]);
        assert_eq!(batch.entries[0].text.as_deref(), Some("Background.\nResults."));
        assert!(batch.entries[1].is_missing());
        assert_eq!(batch.missing().count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_failure_is_missing_not_abort() -> Result<()> {
        let session = FixtureSession::new()
            .with_site(&detail_url("2"), vec![article("Two", &["x"])]);
        let mut fetcher = PageFetcher::new(session, &fast_settings());
        let mut source = BrowserDetailSource::new(&mut fetcher, DetailPageStructure::default());

        let batch = download_details(&mut source, &ids(&["1", "2"]), DetailKind::Title).await?;
        assert!(batch.entries[0].is_missing());
        assert_eq!(batch.entries[1].text.as_deref(), Some("Two"));
        Ok(())
    }

    #[tokio::test]
    async fn test_session_loss_aborts() {
        let mut session = FixtureSession::new()
            .with_site(&detail_url("1"), vec![article("One", &[])]);
        session.lose_at_load = Some(1);
        let mut fetcher = PageFetcher::new(session, &fast_settings());
        let mut source = BrowserDetailSource::new(&mut fetcher, DetailPageStructure::default());

        let result = download_details(&mut source, &ids(&["1", "2"]), DetailKind::Title).await;
        assert!(matches!(result, Err(CollectError::SessionLost(_))));
    }

    #[test]
    fn test_csv_preserves_missing() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("t.abstract.csv");
        let batch = DetailBatch {
            kind: DetailKind::Abstract,
            entries: vec![
                DetailEntry { id: "1".into(), text: Some("a, \"quoted\"\nline".into()) },
                DetailEntry { id: "2".into(), text: None },
                DetailEntry { id: "3".into(), text: Some(String::new()) },
            ],
        };
        batch.write_csv(&path)?;
        let loaded = DetailBatch::read_csv(&path, DetailKind::Abstract)?;
        assert_eq!(loaded.entries, batch.entries);
        Ok(())
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("abstract".parse::<DetailKind>().ok(), Some(DetailKind::Abstract));
        assert!("body".parse::<DetailKind>().is_err());
    }

    #[tokio::test]
    async fn test_review_titles_follow_review_order() -> Result<()> {
        let review = |topic: &str| ReviewQuery {
            topic_id: topic.to_string(),
            review_url: format!("https://reviews.example/{}", topic),
            query: "q".to_string(),
            date_range: String::new(),
        };
        let landing = |title: &str| {
            format!(r#"<html><h1 class="article-header__title"> {} </h1></html>"#, title)
        };
        let session = FixtureSession::new()
            .with_site("https://reviews.example/1", vec![landing("Screening for dementia")])
            .with_site("https://reviews.example/3", vec![landing("Donepezil")]);
        let mut fetcher = PageFetcher::new(session, &fast_settings());

        let titles = download_review_titles(
            &mut fetcher,
            &[review("1"), review("2"), review("3")],
            "h1.article-header__title",
        )
        .await?;

        assert_eq!(
            titles,
            vec![
                ("1".to_string(), "Screening for dementia".to_string()),
                ("2".to_string(), String::new()),
                ("3".to_string(), "Donepezil".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_read_optional_missing_file() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("none.title.csv");
        assert!(DetailBatch::read_optional(&path, DetailKind::Title)?.is_none());
        Ok(())
    }
}
