//! Identifier extraction from raw result pages.
//!
//! Two page formats are understood: rendered HTML search result pages, read
//! with CSS selectors, and Ovid citation exports in XML. An extractor returns
//! an empty list when a page simply has no results; it only fails when the
//! input cannot be recognised at all.

use crate::config::SearchPageStructure;
use crate::error::{CollectError, Result};
use crate::reviews::{parse_yyyymmdd, DateWindow};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::LazyLock;
use tracing::debug;

/// Opaque record identifier (a PubMed ID in practice)
pub type RecordId = String;

static INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("valid index regex"));

/// Turns one raw page into the identifiers it lists, in page order.
///
/// Extraction is pure, so a sequence can always be recomputed from the
/// persisted raw page.
pub trait IdentifierExtractor {
    fn extract(&self, raw: &str) -> Result<Vec<RecordId>>;
}

/// CSS-selector extractor for HTML result pages
pub struct HtmlIdentifierExtractor {
    selector: Selector,
    attr: Option<String>,
}

impl HtmlIdentifierExtractor {
    pub fn new(structure: &SearchPageStructure) -> Result<Self> {
        let selector = Selector::parse(&structure.identifier_selector).map_err(|e| {
            CollectError::Config(format!(
                "Invalid identifier selector '{}': {}",
                structure.identifier_selector, e
            ))
        })?;
        Ok(Self {
            selector,
            attr: structure.identifier_attr.clone(),
        })
    }
}

impl IdentifierExtractor for HtmlIdentifierExtractor {
    fn extract(&self, raw: &str) -> Result<Vec<RecordId>> {
        if !raw.trim_start().starts_with('<') {
            return Err(CollectError::Parse("page is not an HTML document".to_string()));
        }
        let document = Html::parse_document(raw);
        let ids = document
            .select(&self.selector)
            .filter_map(|el| match &self.attr {
                Some(attr) => el.value().attr(attr).map(|v| v.trim().to_string()),
                None => Some(el.text().collect::<String>().trim().to_string()),
            })
            .filter(|id| !id.is_empty())
            .collect();
        Ok(ids)
    }
}

/// Extractor for Ovid XML citation exports.
///
/// Each `<record index="N">` carries fields `<F L="label"><D>value</D></F>`.
/// Records created outside the date window are dropped; the rest are
/// returned ordered by record index.
#[derive(Debug, Default)]
pub struct OvidXmlExtractor {
    window: Option<DateWindow>,
}

#[derive(Debug, Default)]
struct OvidRecord {
    index: u64,
    unique_id: String,
    created: String,
}

impl OvidXmlExtractor {
    pub fn new(window: Option<DateWindow>) -> Self {
        Self { window }
    }

    fn keep(&self, record: &OvidRecord) -> Result<bool> {
        let Some(window) = self.window else {
            return Ok(true);
        };
        if record.created.is_empty() {
            return Ok(false);
        }
        Ok(window.contains(parse_yyyymmdd(&record.created)?))
    }
}

impl OvidXmlExtractor {
    /// Kept records as `(record index, identifier)`, ordered by index.
    ///
    /// A topic exported in several files is ordered by merging these pairs
    /// across files and sorting once.
    pub fn records(&self, raw: &str) -> Result<Vec<(u64, RecordId)>> {
        let mut reader = Reader::from_str(raw);
        reader.config_mut().trim_text(true);

        let mut records: Vec<OvidRecord> = Vec::new();
        let mut current: Option<OvidRecord> = None;
        let mut label = String::new();
        let mut in_value = false;
        let mut saw_root = false;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    saw_root = true;
                    match e.name().as_ref() {
                        b"record" => {
                            let index = e
                                .try_get_attribute("index")
                                .map_err(|e| CollectError::Parse(e.to_string()))?
                                .map(|a| String::from_utf8_lossy(&a.value).to_string())
                                .and_then(|v| INDEX_RE.find(&v).map(|m| m.as_str().to_string()))
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(records.len() as u64 + 1);
                            current = Some(OvidRecord {
                                index,
                                ..Default::default()
                            });
                        }
                        b"F" => {
                            label = e
                                .try_get_attribute("L")
                                .map_err(|e| CollectError::Parse(e.to_string()))?
                                .map(|a| String::from_utf8_lossy(&a.value).to_string())
                                .unwrap_or_default();
                        }
                        b"D" => in_value = true,
                        _ => {}
                    }
                }
                Event::Text(t) if in_value => {
                    let text = t
                        .unescape()
                        .map_err(|e| CollectError::Parse(e.to_string()))?
                        .to_string();
                    if let Some(record) = current.as_mut() {
                        match label.as_str() {
                            "Unique Identifier" => record.unique_id = text,
                            "Date Created" => record.created = text,
                            _ => {}
                        }
                    }
                }
                Event::End(e) => match e.name().as_ref() {
                    b"D" => in_value = false,
                    b"F" => label.clear(),
                    b"record" => {
                        if let Some(record) = current.take() {
                            if record.unique_id.is_empty() {
                                debug!(index = record.index, "Record without identifier");
                            } else if self.keep(&record)? {
                                records.push(record);
                            } else {
                                debug!(
                                    index = record.index,
                                    created = %record.created,
                                    "Record outside date window"
                                );
                            }
                        }
                    }
                    _ => {}
                },
                Event::Empty(_) => saw_root = true,
                Event::Eof => break,
                _ => {}
            }
        }

        if !saw_root {
            return Err(CollectError::Parse("export has no XML elements".to_string()));
        }

        records.sort_by_key(|r| r.index);
        Ok(records.into_iter().map(|r| (r.index, r.unique_id)).collect())
    }
}

impl IdentifierExtractor for OvidXmlExtractor {
    fn extract(&self, raw: &str) -> Result<Vec<RecordId>> {
        Ok(self.records(raw)?.into_iter().map(|(_, id)| id).collect())
    }
}

/// Keep the first occurrence of every identifier, preserving order.
pub fn dedup_preserving_order(ids: &[RecordId]) -> Vec<RecordId> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}
