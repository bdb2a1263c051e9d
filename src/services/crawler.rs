//! Schema crawler service interface.
//!
//! Crawl triggering is fire-and-forget: a crawl already running for the
//! same target is reported as such and treated as success by callers.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::CrawlerError;

/// Result of a crawl start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlStart {
    Started,
    AlreadyRunning,
}

/// Client for the external schema-crawling service.
#[async_trait]
pub trait SchemaCrawler: Send + Sync {
    /// Start the named crawler.
    async fn start_crawl(&self, name: &str) -> Result<CrawlStart, CrawlerError>;
}

/// In-memory crawler that tracks running crawls and counts starts.
#[derive(Default)]
pub struct MemoryCrawler {
    running: Mutex<HashSet<String>>,
    starts: Mutex<Vec<String>>,
}

impl MemoryCrawler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of crawls actually started (excluding already-running hits).
    pub async fn start_count(&self, name: &str) -> usize {
        let starts = self.starts.lock().await;
        starts.iter().filter(|n| n.as_str() == name).count()
    }

    /// Mark a crawl as finished so it can be started again.
    pub async fn finish_crawl(&self, name: &str) {
        self.running.lock().await.remove(name);
    }
}

#[async_trait]
impl SchemaCrawler for MemoryCrawler {
    async fn start_crawl(&self, name: &str) -> Result<CrawlStart, CrawlerError> {
        let mut running = self.running.lock().await;
        if !running.insert(name.to_string()) {
            info!(crawler = name, "Crawler is already running");
            return Ok(CrawlStart::AlreadyRunning);
        }
        info!(crawler = name, "Starting crawler");
        self.starts.lock().await.push(name.to_string());
        Ok(CrawlStart::Started)
    }
}
