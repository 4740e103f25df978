//! NCBI E-utilities detail source.
//!
//! Fetches PubMed records through `efetch.fcgi` and serves titles and
//! abstracts from them. Records are requested in chunks and cached, so a
//! title pass followed by an abstract pass costs one request per chunk.

use crate::config::EutilsSettings;
use crate::details::{DetailKind, DetailSource};
use crate::error::{CollectError, Result};
use crate::extract::RecordId;
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// One parsed `<PubmedArticle>`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubmedArticle {
    pub pmid: String,
    pub title: String,
    /// `AbstractText` paragraphs joined by newlines; empty when absent
    pub abstract_text: String,
}

/// efetch client with a per-run article cache
pub struct EutilsClient {
    client: reqwest::Client,
    settings: EutilsSettings,
    delay: Duration,
    cache: HashMap<String, PubmedArticle>,
    /// Identifiers already requested, found or not
    requested: std::collections::HashSet<String>,
}

impl EutilsClient {
    pub fn new(settings: EutilsSettings, delay: Duration) -> Result<Self> {
        Url::parse(&settings.base_url)
            .map_err(|e| CollectError::Config(format!("Invalid efetch URL: {}", e)))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("tarcollect/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CollectError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            settings,
            delay,
            cache: HashMap::new(),
            requested: Default::default(),
        })
    }

    /// Fetch and cache every identifier not requested yet, chunk by chunk.
    ///
    /// A failed chunk is logged and skipped; its identifiers then resolve as
    /// missing.
    pub async fn prefetch(&mut self, ids: &[RecordId]) -> Result<()> {
        let pending: Vec<RecordId> = ids
            .iter()
            .filter(|id| !self.requested.contains(id.as_str()))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), chunk = self.settings.chunk_size, "Prefetching PubMed records");

        for (block, chunk) in pending.chunks(self.settings.chunk_size).enumerate() {
            if block > 0 {
                tokio::time::sleep(self.delay).await;
            }
            match self.efetch(chunk).await {
                Ok(articles) => {
                    debug!(block, requested = chunk.len(), found = articles.len(), "efetch chunk");
                    for article in articles {
                        self.cache.insert(article.pmid.clone(), article);
                    }
                }
                Err(e) => warn!(block, error = %e, "efetch chunk failed"),
            }
            self.requested.extend(chunk.iter().cloned());
        }
        Ok(())
    }

    async fn efetch(&self, ids: &[RecordId]) -> Result<Vec<PubmedArticle>> {
        let mut params = vec![
            ("db", "pubmed".to_string()),
            ("id", ids.join(",")),
            ("rettype", "xml".to_string()),
            ("retmode", "xml".to_string()),
        ];
        if let Some(key) = &self.settings.api_key {
            params.push(("api_key", key.clone()));
        }

        let response = self
            .client
            .get(&self.settings.base_url)
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollectError::Api {
                code: status.as_u16() as i32,
                message: format!("efetch error: {}", status),
            });
        }

        let xml = response.text().await?;
        parse_pubmed_xml(&xml)
    }
}

#[async_trait]
impl DetailSource for EutilsClient {
    async fn fetch_detail(&mut self, id: &str, kind: DetailKind) -> Result<Option<String>> {
        if !self.requested.contains(id) {
            self.prefetch(&[id.to_string()]).await?;
        }
        let Some(article) = self.cache.get(id) else {
            return Ok(None);
        };
        let text = match kind {
            DetailKind::Title => &article.title,
            DetailKind::Abstract => &article.abstract_text,
        };
        Ok((!text.is_empty()).then(|| text.clone()))
    }
}

/// Parse an efetch `<PubmedArticleSet>` response.
///
/// Text inside inline markup (`<i>`, `<sup>`, ...) is kept; only the tags go.
pub fn parse_pubmed_xml(xml: &str) -> Result<Vec<PubmedArticle>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut articles = Vec::new();
    let mut current: Option<PubmedArticle> = None;
    let mut paragraphs: Vec<String> = Vec::new();
    let mut in_pmid = false;
    let mut in_title = false;
    let mut in_abstract = false;
    // PMIDs also appear in comment corrections; the citation's own comes first.
    let mut citation_depth = 0usize;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"PubmedArticle" => {
                    current = Some(PubmedArticle::default());
                    paragraphs.clear();
                }
                b"MedlineCitation" => citation_depth += 1,
                b"PMID" => {
                    in_pmid = citation_depth > 0
                        && current.as_ref().is_some_and(|a| a.pmid.is_empty());
                }
                b"ArticleTitle" => in_title = true,
                b"AbstractText" => {
                    in_abstract = true;
                    paragraphs.push(String::new());
                }
                _ => {}
            },
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| CollectError::Parse(e.to_string()))?;
                if let Some(article) = current.as_mut() {
                    if in_pmid {
                        article.pmid.push_str(text.trim());
                    } else if in_title {
                        article.title.push_str(&text);
                    } else if in_abstract {
                        if let Some(p) = paragraphs.last_mut() {
                            p.push_str(&text);
                        }
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"PMID" => in_pmid = false,
                b"ArticleTitle" => in_title = false,
                b"AbstractText" => in_abstract = false,
                b"MedlineCitation" => citation_depth = citation_depth.saturating_sub(1),
                b"PubmedArticle" => {
                    if let Some(mut article) = current.take() {
                        article.title = article.title.trim().to_string();
                        article.abstract_text = paragraphs
                            .iter()
                            .map(|p| p.trim())
                            .filter(|p| !p.is_empty())
                            .collect::<Vec<_>>()
                            .join("\n");
                        if article.pmid.is_empty() {
                            warn!("Skipping PubmedArticle without PMID");
                        } else {
                            articles.push(article);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(articles)
}
