//! Time-bounded cache over the latest aggregation result.
//!
//! The cache holds one [`CacheEntry`] behind an `Arc` that is swapped whole on
//! every successful refresh, so readers never see a partially written entry and
//! never wait on a refresh in progress. Concurrent callers that need a refresh
//! share a single in-flight run.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::model::NewsItem;

/// Produces a fresh item list for the cache.
#[async_trait]
pub trait Refresh: Send + Sync + 'static {
    async fn refresh(&self) -> anyhow::Result<Vec<NewsItem>>;
}

/// The last successful aggregation. `fetched_at` is `None` until the first one.
#[derive(Debug, Default)]
pub struct CacheEntry {
    pub items: Vec<NewsItem>,
    pub fetched_at: Option<Instant>,
}

impl CacheEntry {
    pub fn age(&self) -> Option<Duration> {
        self.fetched_at.map(|at| at.elapsed())
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age().is_some_and(|age| age < ttl)
    }
}

type InFlight = Shared<BoxFuture<'static, Arc<CacheEntry>>>;

pub struct Cache<R> {
    inner: Arc<Inner<R>>,
}

struct Inner<R> {
    refresher: R,
    ttl: Duration,
    entry: RwLock<Arc<CacheEntry>>,
    in_flight: Mutex<Option<InFlight>>,
}

impl<R> Clone for Cache<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Refresh> Cache<R> {
    /// Create an empty cache; the first `get` always refreshes.
    pub fn new(refresher: R, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                refresher,
                ttl,
                entry: RwLock::new(Arc::new(CacheEntry::default())),
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn refresher(&self) -> &R {
        &self.inner.refresher
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// The stored entry, without triggering a refresh.
    pub fn snapshot(&self) -> Arc<CacheEntry> {
        self.inner.current()
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight().is_some()
    }

    /// Store `items` as the current entry, stamped now.
    pub fn replace(&self, items: Vec<NewsItem>) -> Arc<CacheEntry> {
        self.inner.replace(items)
    }

    /// Return the cached entry, refreshing first when it is stale or `force` is set.
    ///
    /// A refresh that fails leaves the previous entry in place and that entry is
    /// returned. Callers arriving while a refresh is running, forced or not,
    /// wait for that run instead of starting their own.
    pub async fn get(&self, force: bool) -> Arc<CacheEntry> {
        if !force {
            let current = self.inner.current();
            if current.is_fresh(self.inner.ttl) {
                debug!("Serving {} cached items", current.items.len());
                return current;
            }
        }

        let refresh = {
            let mut in_flight = self.inner.in_flight();
            let existing = in_flight.clone();
            if let Some(refresh) = existing {
                debug!("Joining in-flight refresh");
                refresh
            } else {
                // a refresh may have finished between the first check and the lock
                if !force {
                    let current = self.inner.current();
                    if current.is_fresh(self.inner.ttl) {
                        return current;
                    }
                }
                let refresh = self.start_refresh();
                *in_flight = Some(refresh.clone());
                refresh
            }
        };

        refresh.await
    }

    fn start_refresh(&self) -> InFlight {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move {
                let _guard = InFlightGuard(Arc::clone(&inner));
                inner.refresh_entry().await
            }
        });

        async move {
            match task.await {
                Ok(entry) => entry,
                Err(e) => {
                    error!("Cache refresh task aborted: {}", e);
                    inner.current()
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl<R> Inner<R> {
    fn current(&self) -> Arc<CacheEntry> {
        let entry = self.entry.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&entry)
    }

    fn replace(&self, items: Vec<NewsItem>) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            items,
            fetched_at: Some(Instant::now()),
        });
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&entry);
        entry
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Refresh> Inner<R> {
    async fn refresh_entry(&self) -> Arc<CacheEntry> {
        match self.refresher.refresh().await {
            Ok(items) => {
                let entry = self.replace(items);
                info!("Cache refreshed with {} items", entry.items.len());
                entry
            }
            Err(e) => {
                let current = self.current();
                warn!(
                    "Refresh failed, keeping {} cached items: {:#}",
                    current.items.len(),
                    e
                );
                current
            }
        }
    }
}

/// Clears the in-flight slot when the refresh task ends, including by panic.
struct InFlightGuard<R>(Arc<Inner<R>>);

impl<R> Drop for InFlightGuard<R> {
    fn drop(&mut self) {
        *self.0.in_flight() = None;
    }
}
