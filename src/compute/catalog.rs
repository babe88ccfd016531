//! Time-bounded cache of the provider catalog.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::template::Catalog;

#[derive(Debug)]
struct CachedCatalog {
    fetched_at: Instant,
    catalog: Catalog,
}

/// Holds the last catalog snapshot for `ttl`.
///
/// Concurrent callers that miss the cache wait for a single load instead of
/// each hitting the provider.
#[derive(Debug)]
pub struct CatalogCache {
    ttl: Duration,
    slot: Mutex<Option<CachedCatalog>>,
}

impl CatalogCache {
    /// Creates an empty cache. A zero `ttl` disables caching.
    #[must_use]
    pub const fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::const_new(None),
        }
    }

    /// Returns the cached catalog, calling `load` when it is missing or
    /// stale.
    ///
    /// # Errors
    ///
    /// Propagates the error from `load`; the previous snapshot, if any, is
    /// kept for the next call to retry against.
    pub async fn get_or_load<E, F, Fut>(&self, load: F) -> Result<Catalog, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Catalog, E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
        {
            return Ok(cached.catalog.clone());
        }
        let catalog = load().await?;
        *slot = Some(CachedCatalog {
            fetched_at: Instant::now(),
            catalog: catalog.clone(),
        });
        Ok(catalog)
    }

    /// Drops the cached snapshot.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}
