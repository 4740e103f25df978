//! Pipeline configuration and on-disk layout.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. The file is JSON and is looked up at `--config`, then
//! `~/.tarcollect.json`.

use crate::error::{CollectError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Default PubMed search page. `{query}` is replaced with the URL-encoded query.
pub const DEFAULT_SEARCH_URL: &str = "https://pubmed.ncbi.nlm.nih.gov/?term={query}&size=200";

/// Default PubMed article page. `{id}` is replaced with the identifier.
pub const DEFAULT_DETAIL_URL: &str = "https://pubmed.ncbi.nlm.nih.gov/{id}/";

/// NCBI E-utilities efetch endpoint
pub const DEFAULT_EFETCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

/// Default config file path: `~/.tarcollect.json`
fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".tarcollect.json"))
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of every file the pipeline reads and writes
    pub data_dir: PathBuf,
    /// Review list CSV (`topic_id,review_url,query,date_range`)
    pub reviews_file: PathBuf,
    /// Relevance index CSV (`review_doi,pubmed_id,ref_type`)
    pub relevance_file: PathBuf,
    pub browser: BrowserSettings,
    pub search: SearchPageStructure,
    pub detail: DetailPageStructure,
    /// Title element on a review's landing page
    pub review_title_selector: String,
    pub eutils: EutilsSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            reviews_file: PathBuf::from("reviews.csv"),
            relevance_file: PathBuf::from("relevance_index.csv"),
            browser: BrowserSettings::default(),
            search: SearchPageStructure::default(),
            detail: DetailPageStructure::default(),
            review_title_selector: "h1.article-header__title".to_string(),
            eutils: EutilsSettings::default(),
        }
    }
}

/// Browser launch and page-load settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    /// Chrome/Chromium binary; autodetected when unset
    pub chrome_executable: Option<PathBuf>,
    /// Upper bound for a page load plus its wait condition
    pub page_timeout_secs: u64,
    /// Poll interval while waiting for a wait condition
    pub poll_interval_millis: u64,
    /// Pause between consecutive requests (a random jitter of up to half is added)
    pub request_delay_millis: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_executable: None,
            page_timeout_secs: 120,
            poll_interval_millis: 2000,
            request_delay_millis: 1000,
        }
    }
}

impl BrowserSettings {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_millis)
    }
}

/// How to drive and read a paginated search result page
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchPageStructure {
    pub url_template: String,
    /// Elements carrying one record identifier each
    pub identifier_selector: String,
    /// Read the identifier from this attribute instead of the element text
    pub identifier_attr: Option<String>,
    /// The "next page" control; its absence ends pagination
    pub next_selector: String,
    /// Element that must be present before a page counts as loaded
    pub wait_for: Option<String>,
}

impl Default for SearchPageStructure {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_SEARCH_URL.to_string(),
            identifier_selector: "span.docsum-pmid".to_string(),
            identifier_attr: None,
            next_selector: "button.next-page".to_string(),
            wait_for: None,
        }
    }
}

impl SearchPageStructure {
    /// First result page for a query.
    pub fn search_url(&self, query: &str) -> String {
        self.url_template
            .replace("{query}", &urlencoding::encode(query))
    }
}

/// Where title and abstract live on a per-record page
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailPageStructure {
    pub url_template: String,
    pub title_selector: String,
    pub abstract_selector: String,
}

impl Default for DetailPageStructure {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_DETAIL_URL.to_string(),
            title_selector: "h1.heading-title".to_string(),
            abstract_selector: "div.abstract-content p".to_string(),
        }
    }
}

impl DetailPageStructure {
    pub fn detail_url(&self, id: &str) -> String {
        self.url_template.replace("{id}", id)
    }
}

/// NCBI E-utilities settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EutilsSettings {
    pub base_url: String,
    /// Identifiers per efetch request
    pub chunk_size: usize,
    pub api_key: Option<String>,
}

impl Default for EutilsSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_EFETCH_URL.to_string(),
            chunk_size: 500,
            api_key: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from an explicit path, the default path, or defaults.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => match default_config_path() {
                Some(p) if p.exists() => Self::from_file(&p),
                _ => {
                    debug!("No config file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CollectError::Config(format!("Cannot read config {:?}: {}", path, e))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        info!("Loaded config from {:?}", path);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.search.url_template.contains("{query}") {
            return Err(CollectError::Config(
                "search.url_template must contain {query}".to_string(),
            ));
        }
        if !self.detail.url_template.contains("{id}") {
            return Err(CollectError::Config(
                "detail.url_template must contain {id}".to_string(),
            ));
        }
        if self.eutils.chunk_size == 0 {
            return Err(CollectError::Config(
                "eutils.chunk_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.data_dir)
    }
}

/// Directory layout under the data directory
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Raw result pages, one subdirectory per topic
    pub fn download_pids_dir(&self) -> PathBuf {
        self.root.join("download_pids")
    }

    pub fn raw_topic_dir(&self, topic_id: &str) -> PathBuf {
        self.download_pids_dir().join(topic_id)
    }

    /// Extracted identifiers, one file per topic
    pub fn pids_dir(&self) -> PathBuf {
        self.root.join("pids")
    }

    pub fn pids_file(&self, topic_id: &str) -> PathBuf {
        self.pids_dir().join(topic_id)
    }

    pub fn title_file(&self) -> PathBuf {
        self.root.join("title.txt")
    }

    pub fn topic_dir(&self) -> PathBuf {
        self.root.join("topic")
    }

    pub fn doc_qrel_dir(&self) -> PathBuf {
        self.root.join("doc_qrel")
    }

    pub fn abs_qrel_dir(&self) -> PathBuf {
        self.root.join("abs_qrel")
    }

    pub fn details_dir(&self) -> PathBuf {
        self.root.join("details")
    }

    /// `details/<topic>.<kind>.csv`
    pub fn details_file(&self, topic_id: &str, kind: &str) -> PathBuf {
        self.details_dir().join(format!("{}.{}.csv", topic_id, kind))
    }

    pub fn trectext_dir(&self) -> PathBuf {
        self.root.join("trectext")
    }

    pub fn stats_file(&self) -> PathBuf {
        self.root.join("statistics.txt")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("log.txt")
    }

    /// Create every output directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.download_pids_dir(),
            self.pids_dir(),
            self.topic_dir(),
            self.doc_qrel_dir(),
            self.abs_qrel_dir(),
            self.details_dir(),
            self.trectext_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Non-hidden file names in a directory, sorted.
pub fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !dir.exists() {
        return Ok(names);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Subdirectory names in a directory, sorted.
pub fn list_dirs(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !dir.exists() {
        return Ok(names);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}
