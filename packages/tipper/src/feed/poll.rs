//! Polling mention source.
//!
//! Issues one bounded recent-search query per cycle. The first cycle runs
//! immediately; later cycles wait for the interval, measured from the moment
//! the coordinator asks for the next batch, so a new cycle never starts while
//! the previous one is still being processed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::x_api::{SearchPage, XClient};
use super::{FeedError, Mention, MentionSource};

/// Default spacing between search cycles
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default page size for one search cycle
pub const DEFAULT_MAX_RESULTS: u32 = 10;

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub query: String,
    pub max_results: u32,
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            query: String::new(),
            max_results: DEFAULT_MAX_RESULTS,
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }
}

/// One search cycle
#[async_trait]
pub trait SearchMentions: Send + Sync {
    async fn search(
        &self,
        query: &str,
        max_results: u32,
        since_id: Option<&str>,
    ) -> Result<SearchPage, FeedError>;
}

#[async_trait]
impl SearchMentions for XClient {
    async fn search(
        &self,
        query: &str,
        max_results: u32,
        since_id: Option<&str>,
    ) -> Result<SearchPage, FeedError> {
        self.search_recent(query, max_results, since_id).await
    }
}

/// Mention source that polls a search endpoint on a fixed interval
pub struct PollingSource {
    searcher: Arc<dyn SearchMentions>,
    config: PollConfig,
    ticker: Interval,
    since_id: Option<String>,
    cycles: u64,
}

impl PollingSource {
    pub fn new(searcher: Arc<dyn SearchMentions>, config: PollConfig) -> Self {
        let mut ticker = interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            searcher,
            config,
            ticker,
            since_id: None,
            cycles: 0,
        }
    }

    /// Newest id seen so far
    pub fn since_id(&self) -> Option<&str> {
        self.since_id.as_deref()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    async fn run_cycle(&mut self) -> Vec<Mention> {
        self.cycles += 1;
        let result = self
            .searcher
            .search(&self.config.query, self.config.max_results, self.since_id.as_deref())
            .await;

        match result {
            Ok(page) => {
                if let Some(newest) = page.newest_id {
                    self.since_id = Some(newest);
                }
                if page.mentions.is_empty() {
                    debug!("No new mentions found");
                } else {
                    info!(count = page.mentions.len(), "Found mentions to process");
                }
                page.mentions
            }
            Err(e) => {
                error!(error = %e, "Error checking mentions");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl MentionSource for PollingSource {
    async fn next_batch(&mut self) -> Option<Vec<Mention>> {
        self.ticker.tick().await;
        Some(self.run_cycle().await)
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}
