//! Geocode engine: orchestrates the resolution pipeline.
//!
//! Resolve flow: normalize → cache → coalesce → (cache re-check →
//! rate limit → provider under deadline, with retries) → cache write.
//! Distance flow: resolve both addresses concurrently → haversine.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::distance;
use crate::location::cache::ResolutionCache;
use crate::location::coalesce::RequestCoalescer;
use crate::location::normalize::AddressNormalizer;
use crate::location::providers::GeocodeProvider;
use crate::location::rate_limit::RateLimiter;
use crate::location::retry::RetryController;
use crate::location::types::{Address, Coordinate, GeocodeError, NormalizedKey, ProviderError, ResolutionEntry};
use parking_lot::RwLock;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct Inner {
    normalizer: AddressNormalizer,
    provider: Arc<dyn GeocodeProvider>,
    cache: ResolutionCache,
    limiter: RateLimiter,
    retry: RetryController,
    coalescer: RequestCoalescer<ResolutionEntry>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    provider_timeout: Duration,
    /// Reason for the last fatal provider failure; blocks provider calls until resumed.
    halted: RwLock<Option<String>>,
}

/// The public façade. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct GeocodeEngine {
    inner: Arc<Inner>,
}

impl GeocodeEngine {
    pub fn new(config: &EngineConfig, provider: Arc<dyn GeocodeProvider>) -> Self {
        Self::with_clock(config, provider, Arc::new(SystemClock))
    }

    /// Create an engine with a specific clock (for testing).
    pub fn with_clock(config: &EngineConfig, provider: Arc<dyn GeocodeProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                normalizer: AddressNormalizer::with_abbreviations(config.abbreviations()),
                provider,
                cache: ResolutionCache::new(config.cache.capacity),
                limiter: RateLimiter::new(config.rate_limit_settings()),
                retry: RetryController::new(config.retry_policy()),
                coalescer: RequestCoalescer::new(),
                clock,
                ttl: config.cache_ttl(),
                provider_timeout: config.provider_timeout(),
                halted: RwLock::new(None),
            }),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.inner.provider.name()
    }

    pub fn normalize(&self, address: &Address) -> Result<NormalizedKey, GeocodeError> {
        self.inner.normalizer.normalize(address)
    }

    /// Resolve an address to a coordinate.
    pub async fn resolve(&self, address: &Address) -> Result<Coordinate, GeocodeError> {
        Ok(self.resolve_entry(address).await?.coordinate)
    }

    /// Resolve an address, returning the full cache entry with provider metadata.
    pub async fn resolve_entry(&self, address: &Address) -> Result<ResolutionEntry, GeocodeError> {
        let key = self.inner.normalizer.normalize(address)?;

        if let Some(entry) = self.inner.cache.get(&key, self.inner.clock.now()) {
            tracing::debug!(%key, "cache hit");
            return Ok(entry);
        }
        if let Some(reason) = self.halted() {
            return Err(GeocodeError::Fatal(reason));
        }

        let lookup = Self::lookup(Arc::clone(&self.inner), key.clone());
        self.inner.coalescer.resolve_once(&key, move || lookup).await
    }

    /// Great-circle distance in meters between two addresses.
    pub async fn distance_between(&self, a: &Address, b: &Address) -> Result<f64, GeocodeError> {
        let (from, to) = tokio::try_join!(self.resolve(a), self.resolve(b))?;
        distance::distance(&from, &to)
    }

    /// Reason provider calls are suspended after a fatal failure, if any.
    pub fn halted(&self) -> Option<String> {
        self.inner.halted.read().clone()
    }

    /// Allow provider calls again after the cause of a fatal failure is fixed.
    pub fn resume(&self) {
        if self.inner.halted.write().take().is_some() {
            tracing::info!("provider calls resumed");
        }
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.inner.cache
    }

    /// Warm the cache from a snapshot file, dropping keys this engine's
    /// normalizer would not produce.
    pub fn load_snapshot(&self, path: &Path) -> io::Result<usize> {
        self.inner
            .cache
            .load_snapshot(path, self.inner.clock.now(), &self.inner.normalizer)
    }

    pub fn save_snapshot(&self, path: &Path) -> io::Result<usize> {
        self.inner.cache.save_snapshot(path, self.inner.clock.now())
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.clock.now()
    }

    /// Lookups currently in flight, by distinct key.
    pub fn in_flight(&self) -> usize {
        self.inner.coalescer.in_flight()
    }

    /// The single provider resolution run by the coalescing leader.
    fn lookup(inner: Arc<Inner>, key: NormalizedKey) -> impl Future<Output = Result<ResolutionEntry, GeocodeError>> + Send + 'static {
        async move {
            // A lookup for this key may have completed between our cache miss and leadership
            if let Some(entry) = inner.cache.get_uncounted(&key, inner.clock.now()) {
                return Ok(entry);
            }

            let result = inner
                .retry
                .run(&key, |attempt| {
                    let inner = Arc::clone(&inner);
                    let key = key.clone();
                    async move {
                        let _permit = match inner.limiter.acquire().await {
                            Ok(permit) => permit,
                            Err(e) => return Err(e),
                        };
                        tracing::debug!(%key, attempt, provider = inner.provider.name(), "provider lookup");
                        match tokio::time::timeout(inner.provider_timeout, inner.provider.lookup(&key)).await {
                            Ok(outcome) => Ok(outcome),
                            Err(_) => Ok(Err(ProviderError::Timeout(inner.provider_timeout))),
                        }
                    }
                })
                .await;

            match result {
                Ok(geocoded) => {
                    let entry = ResolutionEntry::new(key, geocoded, inner.clock.now(), inner.ttl);
                    tracing::info!(
                        key = %entry.key,
                        lat = entry.coordinate.lat,
                        lon = entry.coordinate.lon,
                        precision = %entry.coordinate.precision,
                        "resolved"
                    );
                    inner.cache.put(entry.clone());
                    Ok(entry)
                }
                Err(GeocodeError::Fatal(reason)) => {
                    tracing::error!(%key, %reason, "fatal provider failure, suspending provider calls");
                    *inner.halted.write() = Some(reason.clone());
                    Err(GeocodeError::Fatal(reason))
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "resolution failed");
                    Err(e)
                }
            }
        }
    }
}
