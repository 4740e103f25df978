//! Review queries and their side inputs.
//!
//! Three hand-made files drive a collection run: the review list, the
//! relevance index produced by the medical experts, and the review title file
//! written by `fetch-titles`.

use crate::error::{CollectError, OptionExt, Result};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

/// Separator between topic id and title in `title.txt`
const TITLE_SEPARATOR: &str = "|||";

static REVIEW_DOI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CD\d+").expect("valid review DOI regex"));

static DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("valid digits regex"));

/// One systematic review used as a search and evaluation unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewQuery {
    pub topic_id: String,
    pub review_url: String,
    /// Boolean search query, one clause per line
    pub query: String,
    /// Date window like `20000101-20150101`; empty means no window
    #[serde(default)]
    pub date_range: String,
}

impl ReviewQuery {
    /// Cochrane review DOI (`CD` number) taken from the review URL.
    pub fn review_doi(&self) -> Result<String> {
        review_doi(&self.review_url)
    }

    /// Parse `date_range` into its exclusive lower and upper bounds.
    pub fn date_window(&self) -> Result<Option<DateWindow>> {
        if self.date_range.trim().is_empty() {
            return Ok(None);
        }
        let bounds: Vec<&str> = DIGITS_RE
            .find_iter(&self.date_range)
            .map(|m| m.as_str())
            .collect();
        if bounds.len() != 2 {
            return Err(CollectError::Validation(format!(
                "topic {}: date range '{}' must hold two YYYYMMDD dates",
                self.topic_id, self.date_range
            )));
        }
        Ok(Some(DateWindow {
            start: parse_yyyymmdd(bounds[0])?,
            end: parse_yyyymmdd(bounds[1])?,
        }))
    }
}

/// Exclusive date window used to filter exported records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date > self.start && date < self.end
    }
}

pub fn parse_yyyymmdd(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y%m%d")
        .map_err(|e| CollectError::Parse(format!("bad date '{}': {}", s, e)))
}

/// Extract the `CD` number from a review URL or DOI string.
pub fn review_doi(text: &str) -> Result<String> {
    REVIEW_DOI_RE
        .find(text)
        .map(|m| m.as_str().to_string())
        .ok_or_parse(&format!("no review DOI in '{}'", text))
}

/// Trim every line and drop blank ones.
pub fn normalize_query(query: &str) -> String {
    query
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read the review list CSV.
pub fn read_reviews(path: &Path) -> Result<Vec<ReviewQuery>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut reviews = Vec::new();
    for row in reader.deserialize() {
        let mut review: ReviewQuery = row?;
        review.topic_id = review.topic_id.trim().to_string();
        review.review_url = review.review_url.trim().to_string();
        review.query = normalize_query(&review.query);
        reviews.push(review);
    }
    info!(count = reviews.len(), "Loaded reviews from {:?}", path);
    Ok(reviews)
}

/// Which qrel a relevance index is read for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrelKind {
    /// Abstract level: included and excluded references both count as relevant
    Abstract,
    /// Document level: only included references count as relevant
    Document,
}

impl QrelKind {
    fn judge(self, ref_type: &str) -> Option<u8> {
        match (self, ref_type) {
            (_, "included") => Some(1),
            (QrelKind::Abstract, "excluded") => Some(1),
            (QrelKind::Document, "excluded") => Some(0),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RelevanceRow {
    review_doi: String,
    pubmed_id: String,
    ref_type: String,
}

/// Relevance judgments keyed by review DOI, then identifier.
#[derive(Debug, Default, Clone)]
pub struct Judgments {
    by_review: HashMap<String, HashMap<String, u8>>,
}

impl Judgments {
    /// Judgment for one identifier; unjudged identifiers are not relevant.
    pub fn get(&self, review_doi: &str, id: &str) -> u8 {
        self.by_review
            .get(review_doi)
            .and_then(|m| m.get(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn insert(&mut self, review_doi: &str, id: &str, judgment: u8) {
        self.by_review
            .entry(review_doi.to_string())
            .or_default()
            .insert(id.to_string(), judgment);
    }

    pub fn len(&self) -> usize {
        self.by_review.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read the relevance index CSV for one qrel kind.
pub fn read_relevance(path: &Path, kind: QrelKind) -> Result<Judgments> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut judgments = Judgments::default();
    for row in reader.deserialize() {
        let row: RelevanceRow = row?;
        let Some(judgment) = kind.judge(row.ref_type.trim()) else {
            debug!(ref_type = %row.ref_type, "Skipping unjudged reference");
            continue;
        };
        let doi = review_doi(&row.review_doi)?;
        judgments.insert(&doi, row.pubmed_id.trim(), judgment);
    }
    info!(count = judgments.len(), ?kind, "Loaded relevance judgments");
    Ok(judgments)
}

/// Write review titles as `<topic> ||| <title>` lines.
pub fn write_titles(path: &Path, titles: &[(String, String)]) -> Result<()> {
    let body: String = titles
        .iter()
        .map(|(topic, title)| format!("{} {} {} \n", topic, TITLE_SEPARATOR, title))
        .collect();
    std::fs::write(path, body)?;
    Ok(())
}

/// Read `title.txt` back into a topic -> title map.
pub fn read_titles(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    let mut titles = HashMap::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match line.split_once(TITLE_SEPARATOR) {
            Some((topic, title)) => {
                titles.insert(topic.trim().to_string(), title.trim().to_string());
            }
            None => warn!(line, "Malformed title line"),
        }
    }
    Ok(titles)
}

/// Read one identifier per line, in file order.
pub fn read_pids(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

pub fn write_pids(path: &Path, pids: &[String]) -> Result<()> {
    let body: String = pids.iter().map(|p| format!("{}\n", p)).collect();
    std::fs::write(path, body)?;
    Ok(())
}
