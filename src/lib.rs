//! # tarcollect
//!
//! Data collection pipeline for technology-assisted review (TAR) test
//! collections built from systematic reviews.
//!
//! ## Modules
//!
//! - [`browser`] - Browser session capability and the Chromium implementation
//! - [`fetcher`] - Sequential page loading with timeout and politeness delay
//! - [`extract`] - Identifier extraction from HTML result pages and Ovid XML
//! - [`pagination`] - Per-query pagination driver and batch report
//! - [`details`] - Per-identifier title/abstract download
//! - [`eutils`] - NCBI E-utilities detail source
//! - [`release`] - Topic, qrel and TREC-text renderers
//! - [`stats`] - Release statistics
//! - [`reviews`] - Review list, relevance index and title file
//! - [`config`] - Configuration and data directory layout
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tarcollect::browser::ChromeSession;
//! use tarcollect::config::PipelineConfig;
//! use tarcollect::extract::HtmlIdentifierExtractor;
//! use tarcollect::fetcher::PageFetcher;
//! use tarcollect::pagination::PaginationDriver;
//! use tarcollect::reviews::read_reviews;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::default();
//!     let reviews = read_reviews(&config.reviews_file)?;
//!     let extractor = HtmlIdentifierExtractor::new(&config.search)?;
//!
//!     let session = ChromeSession::launch(&config.browser).await?;
//!     let mut fetcher = PageFetcher::new(session, &config.browser);
//!     let report = PaginationDriver::new(
//!         &mut fetcher,
//!         &extractor,
//!         &config.search,
//!         config.layout().download_pids_dir(),
//!     )
//!     .run(&reviews)
//!     .await;
//!     fetcher.close().await?;
//!
//!     println!("{}", report?);
//!     Ok(())
//! }
//! ```

pub mod browser;
pub mod config;
pub mod details;
pub mod error;
pub mod eutils;
pub mod extract;
pub mod fetcher;
pub mod pagination;
pub mod release;
pub mod reviews;
pub mod stats;

pub use error::{CollectError, Result};
