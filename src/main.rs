//! tarcollect - TAR test collection builder
//!
//! Collects candidate PubMed identifiers for a list of systematic reviews,
//! downloads their titles and abstracts, and writes topic, qrel and
//! TREC-text release files.
//!
//! ## Usage
//!
//! ```bash
//! tarcollect --config collect.json run
//! tarcollect fetch-details --kind abstract --source eutils
//! tarcollect release abs
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tarcollect::browser::{BrowserSession, ChromeSession};
use tarcollect::config::{Layout, PipelineConfig};
use tarcollect::details::{
    download_details, download_review_titles, BrowserDetailSource, DetailBatch, DetailKind, DetailSource,
};
use tarcollect::eutils::EutilsClient;
use tarcollect::extract::{dedup_preserving_order, HtmlIdentifierExtractor, OvidXmlExtractor, RecordId};
use tarcollect::fetcher::PageFetcher;
use tarcollect::pagination::{reextract, PaginationDriver, QueryStatus};
use tarcollect::release::{render_qrels, render_topic, render_topic_trectext, write_release, TopicRecord};
use tarcollect::reviews::{read_pids, read_relevance, read_reviews, read_titles, write_pids, write_titles, QrelKind, ReviewQuery};
use tarcollect::stats;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Build a TAR test collection from systematic reviews
#[derive(Parser)]
#[command(name = "tarcollect")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to ~/.tarcollect.json when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory from the config
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Paginate every review's search results and store identifiers
    FetchPids,

    /// Recompute identifier files from the stored raw pages
    ExtractPids,

    /// Download review titles into title.txt
    FetchTitles,

    /// Write topic or qrel release files
    Release {
        #[arg(value_enum)]
        target: ReleaseTarget,
    },

    /// Download titles and/or abstracts for every identifier
    FetchDetails {
        #[arg(long, value_enum, default_value = "all")]
        kind: KindArg,

        #[arg(long, value_enum, default_value = "browser")]
        source: SourceArg,
    },

    /// Write TREC-text release files from downloaded details
    Trectext,

    /// Summarise the release into statistics.txt
    Stats,

    /// Run every stage in order
    Run {
        /// Where titles and abstracts come from
        #[arg(long, value_enum, default_value = "browser")]
        source: SourceArg,
    },
}

impl Commands {
    /// Whether the command reads the review list.
    fn needs_reviews(&self) -> bool {
        !matches!(self, Commands::Stats)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ReleaseTarget {
    Topic,
    Abs,
    Doc,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Title,
    Abstract,
    All,
}

impl KindArg {
    fn kinds(self) -> Vec<DetailKind> {
        match self {
            KindArg::Title => vec![DetailKind::Title],
            KindArg::Abstract => vec![DetailKind::Abstract],
            KindArg::All => vec![DetailKind::Title, DetailKind::Abstract],
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    Browser,
    Eutils,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_json);

    let mut config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    let layout = config.layout();
    layout.ensure_dirs().context("Failed to create data directories")?;

    println!("Data directory: {}", config.data_dir.display());

    if !cli.command.needs_reviews() {
        return write_stats(&layout);
    }
    let reviews = read_reviews(&config.reviews_file)
        .with_context(|| format!("Failed to read review list {:?}", config.reviews_file))?;
    println!("Reviews: {}", reviews.len());

    match cli.command {
        Commands::FetchPids => {
            let mut fetcher = launch(&config).await?;
            let outcome = fetch_pids(&config, &reviews, &mut fetcher).await;
            finish(&mut fetcher, outcome).await
        }
        Commands::ExtractPids => extract_pids(&config, &reviews),
        Commands::FetchTitles => {
            let mut fetcher = launch(&config).await?;
            let outcome = fetch_titles(&config, &reviews, &mut fetcher).await;
            finish(&mut fetcher, outcome).await
        }
        Commands::Release { target } => release(&config, &reviews, target),
        Commands::FetchDetails { kind, source } => {
            fetch_details(&config, &reviews, &kind.kinds(), source).await
        }
        Commands::Trectext => trectext(&config, &reviews),
        Commands::Stats => write_stats(&layout),
        Commands::Run { source } => run_all(&config, &reviews, source).await,
    }
}

fn init_logging(debug: bool, json: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if json {
        fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .init();
    }
}

// ============================================================================
// Browser lifecycle
// ============================================================================

async fn launch(config: &PipelineConfig) -> Result<PageFetcher<ChromeSession>> {
    let session = ChromeSession::launch(&config.browser)
        .await
        .context("Failed to launch browser")?;
    Ok(PageFetcher::new(session, &config.browser))
}

/// Close the browser, then hand back whatever the stage produced.
async fn finish<S: BrowserSession, T>(fetcher: &mut PageFetcher<S>, outcome: Result<T>) -> Result<T> {
    if let Err(e) = fetcher.close().await {
        warn!("Browser close failed: {}", e);
    }
    outcome
}

// ============================================================================
// Stages
// ============================================================================

async fn run_all(config: &PipelineConfig, reviews: &[ReviewQuery], source: SourceArg) -> Result<()> {
    let layout = config.layout();

    let mut fetcher = launch(config).await?;
    let outcome: Result<()> = async {
        println!("\n--- Stage 1: Search result pagination ---");
        fetch_pids(config, reviews, &mut fetcher).await?;

        println!("\n--- Stage 2: Review titles ---");
        fetch_titles(config, reviews, &mut fetcher).await?;

        println!("\n--- Stage 3: Topic and qrel release ---");
        for target in [ReleaseTarget::Topic, ReleaseTarget::Abs, ReleaseTarget::Doc] {
            release(config, reviews, target)?;
        }

        println!("\n--- Stage 4: Titles and abstracts ---");
        let kinds = KindArg::All.kinds();
        match source {
            SourceArg::Browser => {
                let mut detail = BrowserDetailSource::new(&mut fetcher, config.detail.clone());
                download_all(&mut detail, &layout, reviews, &kinds).await
            }
            SourceArg::Eutils => eutils_details(config, reviews, &kinds).await,
        }
    }
    .await;
    finish(&mut fetcher, outcome).await?;

    println!("\n--- Stage 5: TREC-text release ---");
    trectext(config, reviews)?;

    println!("\n--- Stage 6: Statistics ---");
    write_stats(&layout)
}

async fn fetch_pids<S: BrowserSession>(
    config: &PipelineConfig,
    reviews: &[ReviewQuery],
    fetcher: &mut PageFetcher<S>,
) -> Result<()> {
    let layout = config.layout();
    let extractor = HtmlIdentifierExtractor::new(&config.search)?;

    let report = PaginationDriver::new(fetcher, &extractor, &config.search, layout.download_pids_dir())
        .with_failure_log(layout.log_file())
        .run(reviews)
        .await?;

    for harvest in report
        .harvests
        .iter()
        .filter(|h| h.status != QueryStatus::NotAttempted)
    {
        write_pids(&layout.pids_file(&harvest.topic_id), &harvest.identifiers)?;
    }

    println!("{}", report);
    if let Some(reason) = &report.aborted {
        anyhow::bail!("Pagination aborted: {}", reason);
    }
    Ok(())
}

fn extract_pids(config: &PipelineConfig, reviews: &[ReviewQuery]) -> Result<()> {
    let layout = config.layout();
    let html = HtmlIdentifierExtractor::new(&config.search)?;

    for review in reviews {
        let ovid = OvidXmlExtractor::new(review.date_window()?);
        let extraction = reextract(&layout.raw_topic_dir(&review.topic_id), &html, &ovid)
            .with_context(|| format!("Failed to re-extract topic {}", review.topic_id))?;
        if extraction.files == 0 {
            warn!(topic = %review.topic_id, "No raw pages stored");
            continue;
        }

        write_pids(&layout.pids_file(&review.topic_id), &extraction.identifiers)?;
        println!(
            "{}: {} identifiers from {} files ({} unparseable)",
            review.topic_id,
            extraction.identifiers.len(),
            extraction.files,
            extraction.unparsed.len()
        );
    }
    Ok(())
}

async fn fetch_titles<S: BrowserSession>(
    config: &PipelineConfig,
    reviews: &[ReviewQuery],
    fetcher: &mut PageFetcher<S>,
) -> Result<()> {
    let titles = download_review_titles(fetcher, reviews, &config.review_title_selector).await?;
    let found = titles.iter().filter(|(_, title)| !title.is_empty()).count();

    let path = config.layout().title_file();
    write_titles(&path, &titles)?;
    println!("Titles: {} / {} found -> {}", found, titles.len(), path.display());
    Ok(())
}

/// Deduplicated identifiers for a topic, or `None` when it has none stored.
fn topic_pids(layout: &Layout, topic_id: &str) -> Result<Option<Vec<RecordId>>> {
    let path = layout.pids_file(topic_id);
    if !path.exists() {
        warn!(topic = topic_id, "No identifier file, skipping");
        return Ok(None);
    }
    Ok(Some(dedup_preserving_order(&read_pids(&path)?)))
}

fn release(config: &PipelineConfig, reviews: &[ReviewQuery], target: ReleaseTarget) -> Result<()> {
    let layout = config.layout();
    let mut written = 0;

    match target {
        ReleaseTarget::Topic => {
            let titles = read_titles(&layout.title_file())
                .context("Failed to read title.txt, run fetch-titles first")?;
            for review in reviews {
                let Some(pids) = topic_pids(&layout, &review.topic_id)? else {
                    continue;
                };
                let doi = review.review_doi()?;
                let title = titles.get(&review.topic_id).map(String::as_str).unwrap_or_default();
                let text = render_topic(&TopicRecord {
                    review_doi: &doi,
                    title,
                    query: &review.query,
                    pids: &pids,
                });
                write_release(&layout.topic_dir().join(&review.topic_id), &text)?;
                written += 1;
            }
        }
        ReleaseTarget::Abs | ReleaseTarget::Doc => {
            let (kind, dir) = match target {
                ReleaseTarget::Abs => (QrelKind::Abstract, layout.abs_qrel_dir()),
                _ => (QrelKind::Document, layout.doc_qrel_dir()),
            };
            let judgments = read_relevance(&config.relevance_file, kind)
                .with_context(|| format!("Failed to read relevance index {:?}", config.relevance_file))?;
            for review in reviews {
                let Some(pids) = topic_pids(&layout, &review.topic_id)? else {
                    continue;
                };
                let doi = review.review_doi()?;
                write_release(&dir.join(&review.topic_id), &render_qrels(&doi, &pids, &judgments))?;
                written += 1;
            }
        }
    }

    info!(written, "Release files written");
    println!("Wrote {} release files", written);
    Ok(())
}

async fn fetch_details(
    config: &PipelineConfig,
    reviews: &[ReviewQuery],
    kinds: &[DetailKind],
    source: SourceArg,
) -> Result<()> {
    match source {
        SourceArg::Browser => {
            let mut fetcher = launch(config).await?;
            let outcome = {
                let mut detail = BrowserDetailSource::new(&mut fetcher, config.detail.clone());
                download_all(&mut detail, &config.layout(), reviews, kinds).await
            };
            finish(&mut fetcher, outcome).await
        }
        SourceArg::Eutils => eutils_details(config, reviews, kinds).await,
    }
}

async fn eutils_details(config: &PipelineConfig, reviews: &[ReviewQuery], kinds: &[DetailKind]) -> Result<()> {
    let layout = config.layout();
    let mut client = EutilsClient::new(config.eutils.clone(), config.browser.request_delay())?;

    let mut all: Vec<RecordId> = Vec::new();
    for review in reviews {
        if let Some(pids) = topic_pids(&layout, &review.topic_id)? {
            all.extend(pids);
        }
    }
    client.prefetch(&dedup_preserving_order(&all)).await?;

    download_all(&mut client, &layout, reviews, kinds).await
}

async fn download_all<D: DetailSource + ?Sized>(
    source: &mut D,
    layout: &Layout,
    reviews: &[ReviewQuery],
    kinds: &[DetailKind],
) -> Result<()> {
    for review in reviews {
        let Some(pids) = topic_pids(layout, &review.topic_id)? else {
            continue;
        };
        for &kind in kinds {
            let batch = download_details(source, &pids, kind).await?;
            batch.write_csv(&layout.details_file(&review.topic_id, kind.as_str()))?;
            println!(
                "{} {}: {} / {} found",
                review.topic_id,
                kind,
                pids.len() - batch.missing().count(),
                pids.len()
            );
        }
    }
    Ok(())
}

fn trectext(config: &PipelineConfig, reviews: &[ReviewQuery]) -> Result<()> {
    let layout = config.layout();
    let mut written = 0;

    for review in reviews {
        let Some(pids) = topic_pids(&layout, &review.topic_id)? else {
            continue;
        };
        let titles = DetailBatch::read_optional(
            &layout.details_file(&review.topic_id, DetailKind::Title.as_str()),
            DetailKind::Title,
        )?;
        let abstracts = DetailBatch::read_optional(
            &layout.details_file(&review.topic_id, DetailKind::Abstract.as_str()),
            DetailKind::Abstract,
        )?;

        let text = render_topic_trectext(&pids, titles.as_ref(), abstracts.as_ref());
        write_release(&layout.trectext_dir().join(&review.topic_id), &text)?;
        written += 1;
    }

    println!("Wrote {} TREC-text files", written);
    Ok(())
}

fn write_stats(layout: &Layout) -> Result<()> {
    let report = stats::collect(&layout.abs_qrel_dir(), &layout.doc_qrel_dir(), &layout.trectext_dir())?;
    let text = report.render();
    std::fs::write(layout.stats_file(), &text).context("Failed to write statistics")?;
    println!("{}", text);
    Ok(())
}
