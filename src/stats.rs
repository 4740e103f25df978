//! Statistics Reporter.
//!
//! Reads release files back and summarises them: per-topic document and
//! relevance counts, and per-query identifier counts across the release.
//! Never modifies its inputs.

use crate::config::list_files;
use crate::error::{CollectError, Result};
use regex::Regex;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{info, warn};

static TREC_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<DOC>.*?<TEXT>(.*?)</TEXT>.*?</DOC>").expect("valid TREC regex")
});

/// One qrel line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrelLine {
    pub topic: String,
    pub iteration: String,
    pub document: String,
    pub relevancy: u8,
}

/// Parse whitespace-separated `TOPIC ITERATION DOCUMENT RELEVANCY` lines.
pub fn parse_qrels(text: &str) -> Result<Vec<QrelLine>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [topic, iteration, document, relevancy] = fields.as_slice() else {
                return Err(CollectError::Parse(format!("bad qrel line '{}'", line)));
            };
            let relevancy = relevancy
                .parse::<u8>()
                .map_err(|_| CollectError::Parse(format!("bad relevancy in '{}'", line)))?;
            Ok(QrelLine {
                topic: topic.to_string(),
                iteration: iteration.to_string(),
                document: document.to_string(),
                relevancy,
            })
        })
        .collect()
}

/// Number of TREC-text records whose `<TEXT>` field is empty.
pub fn count_missing_text(trectext: &str) -> usize {
    TREC_TEXT_RE
        .captures_iter(trectext)
        .filter(|c| c.get(1).map_or(true, |m| m.as_str().trim().is_empty()))
        .count()
}

/// Counts for one topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicStats {
    /// Release file name (the topic id)
    pub file: String,
    /// Review DOI from the qrel's first column
    pub topic: String,
    pub total: usize,
    pub abs_relevant: usize,
    pub doc_relevant: usize,
    /// Identifiers whose abstract is missing in the TREC-text release
    pub missing_detail: usize,
}

/// Summary over a whole release
#[derive(Debug, Clone, Default)]
pub struct StatsReport {
    pub topics: Vec<TopicStats>,
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

impl StatsReport {
    pub fn queries(&self) -> usize {
        self.topics.len()
    }

    pub fn total(&self) -> usize {
        self.topics.iter().map(|t| t.total).sum()
    }

    pub fn min(&self) -> Option<usize> {
        self.topics.iter().map(|t| t.total).min()
    }

    pub fn max(&self) -> Option<usize> {
        self.topics.iter().map(|t| t.total).max()
    }

    /// Mean identifiers per query
    pub fn mean(&self) -> Option<f64> {
        (!self.topics.is_empty()).then(|| self.total() as f64 / self.queries() as f64)
    }

    pub fn missing_detail(&self) -> usize {
        self.topics.iter().map(|t| t.missing_detail).sum()
    }

    /// Plain-text summary: the per-topic table, a total line, then the
    /// per-query aggregates.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<10} | {:<10} | {:<10} | {:<10} | {:<10} | {:<10} | {:<10}",
            "file name", "topic", "# total doc", "# abs rel", "# doc rel", "% abs rel", "% doc rel"
        );
        for t in &self.topics {
            let _ = writeln!(
                out,
                "{:<10} | {:<10} | {:<10} | {:<10} | {:<10} | {:<10.2} | {:<10.2}",
                t.file,
                t.topic,
                t.total,
                t.abs_relevant,
                t.doc_relevant,
                percent(t.abs_relevant, t.total),
                percent(t.doc_relevant, t.total)
            );
        }

        let total = self.total();
        let abs: usize = self.topics.iter().map(|t| t.abs_relevant).sum();
        let doc: usize = self.topics.iter().map(|t| t.doc_relevant).sum();
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<10} | {:<10} | {:<10} | {:<10} | {:<10} | {:<10.2} | {:<10.2}",
            "total",
            " ",
            total,
            abs,
            doc,
            percent(abs, total),
            percent(doc, total)
        );

        let _ = writeln!(out);
        let _ = writeln!(out, "queries: {}", self.queries());
        match (self.min(), self.max(), self.mean()) {
            (Some(min), Some(max), Some(mean)) => {
                let _ = writeln!(
                    out,
                    "identifiers per query: total={} min={} max={} mean={:.2}",
                    total, min, max, mean
                );
            }
            _ => {
                let _ = writeln!(out, "identifiers per query: total=0");
            }
        }
        let _ = writeln!(out, "identifiers with missing detail: {}", self.missing_detail());
        out
    }
}

/// Build the report from the abstract and document qrel directories, plus
/// the TREC-text directory when present.
///
/// Topics are taken from the abstract qrel directory.
pub fn collect(abs_dir: &Path, doc_dir: &Path, trectext_dir: &Path) -> Result<StatsReport> {
    let mut report = StatsReport::default();

    for file in list_files(abs_dir)? {
        let abs = parse_qrels(&std::fs::read_to_string(abs_dir.join(&file))?)?;
        let doc_path = doc_dir.join(&file);
        let doc = if doc_path.exists() {
            parse_qrels(&std::fs::read_to_string(&doc_path)?)?
        } else {
            warn!(file = %file, "No document-level qrel");
            Vec::new()
        };
        let trec_path = trectext_dir.join(&file);
        let missing_detail = if trec_path.exists() {
            count_missing_text(&std::fs::read_to_string(&trec_path)?)
        } else {
            0
        };

        report.topics.push(TopicStats {
            topic: abs.first().map(|l| l.topic.clone()).unwrap_or_default(),
            file,
            total: abs.len(),
            abs_relevant: abs.iter().filter(|l| l.relevancy == 1).count(),
            doc_relevant: doc.iter().filter(|l| l.relevancy == 1).count(),
            missing_detail,
        });
    }

    info!(
        queries = report.queries(),
        total = report.total(),
        "Statistics collected"
    );
    Ok(report)
}
