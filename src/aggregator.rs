use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::cache::Refresh;
use crate::config::Source;
use crate::fetcher::{FeedFetcher, FetchError, FetchedFeed};
use crate::model::NewsItem;

/// Default cap on the size of an aggregated result.
pub const MAX_ITEMS: usize = 250;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("all {0} sources failed")]
    AllSourcesFailed(usize),
}

/// Outcome of one aggregation run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunReport {
    pub items: Vec<NewsItem>,
    pub succeeded: usize,
    pub failed: usize,
}

/// Fans out one fetch per source and merges the results.
pub struct Aggregator {
    fetcher: Arc<dyn FeedFetcher>,
    sources: Arc<[Source]>,
    timeout: Duration,
    max_items: usize,
}

impl Aggregator {
    pub fn new(
        fetcher: Arc<dyn FeedFetcher>,
        sources: Vec<Source>,
        timeout: Duration,
        max_items: usize,
    ) -> Self {
        Self {
            fetcher,
            sources: sources.into(),
            timeout,
            max_items,
        }
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub async fn run(&self) -> Vec<NewsItem> {
        self.run_report().await.items
    }

    /// Fetch every source concurrently, each within the per-source timeout.
    ///
    /// Results are merged in source declaration order whatever order the
    /// fetches complete in, so the output does not depend on network timing.
    pub async fn run_report(&self) -> RunReport {
        let tasks = self.sources.iter().cloned().map(|source| {
            let fetcher = Arc::clone(&self.fetcher);
            let timeout = self.timeout;
            tokio::spawn(async move { fetch_within(fetcher.as_ref(), &source, timeout).await })
        });
        let results = join_all(tasks).await;

        let mut report = RunReport::default();
        let mut batches = Vec::with_capacity(self.sources.len());

        for (source, result) in self.sources.iter().zip(results) {
            match result {
                Ok(Ok(fetched)) => {
                    info!(
                        "Fetched {} items from '{}' ({} incomplete entries skipped)",
                        fetched.items.len(),
                        source.name,
                        fetched.dropped
                    );
                    report.succeeded += 1;
                    batches.push(fetched.items);
                }
                Ok(Err(e)) => {
                    log_fetch_failure(source, &e);
                    report.failed += 1;
                }
                Err(e) => {
                    error!("Fetch task for '{}' aborted: {}", source.name, e);
                    report.failed += 1;
                }
            }
        }

        report.items = merge(batches, self.max_items);

        info!(
            "Aggregated {} items from {} sources ({} failed)",
            report.items.len(),
            self.sources.len(),
            report.failed
        );

        report
    }
}

#[async_trait]
impl Refresh for Aggregator {
    async fn refresh(&self) -> anyhow::Result<Vec<NewsItem>> {
        let report = self.run_report().await;
        if report.succeeded == 0 && report.failed > 0 {
            return Err(AggregateError::AllSourcesFailed(report.failed).into());
        }
        Ok(report.items)
    }
}

async fn fetch_within(
    fetcher: &dyn FeedFetcher,
    source: &Source,
    timeout: Duration,
) -> Result<FetchedFeed, FetchError> {
    match tokio::time::timeout(timeout, fetcher.fetch(source)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(timeout)),
    }
}

fn log_fetch_failure(source: &Source, err: &FetchError) {
    match err {
        FetchError::Request(_) => error!(
            source = %source.name,
            kind = err.kind(),
            "Failed to fetch source: {}",
            err
        ),
        _ => warn!(
            source = %source.name,
            kind = err.kind(),
            "Skipping source: {}",
            err
        ),
    }
}

/// Merge per-source batches into one result.
///
/// The first occurrence of each url wins, walking batches in the given order.
/// Survivors are sorted newest first; the sort is stable, so items with equal
/// timestamps keep their merged order. Only the newest `max_items` are kept.
pub fn merge(batches: impl IntoIterator<Item = Vec<NewsItem>>, max_items: usize) -> Vec<NewsItem> {
    let mut seen = HashSet::new();
    let mut items: Vec<NewsItem> = batches
        .into_iter()
        .flatten()
        .filter(|item| seen.insert(item.url.clone()))
        .collect();

    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    items.truncate(max_items);
    items
}
