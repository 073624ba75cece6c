//! Nisab threshold and Zakat rate math, plus the price-source seam.
//!
//! The threshold is a metal-weight equivalent: 87.48g of gold or
//! 612.36g of silver, priced in the record's currency. The price source
//! is injected; the service provides an HTTP implementation and a
//! static fallback so a dead price API degrades to documented numbers
//! instead of a silent zero.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::models::NisabBasis;

/// Grams of gold that define Nisab.
pub const GOLD_NISAB_GRAMS: f64 = 87.48;
/// Grams of silver that define Nisab.
pub const SILVER_NISAB_GRAMS: f64 = 612.36;
/// Zakat rate applied to zakatable wealth.
pub const ZAKAT_RATE: f64 = 0.025;

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("price source unavailable: {0}")]
    Unavailable(String),

    #[error("price source returned an invalid price: {0}")]
    Invalid(f64),
}

pub fn grams_required(basis: NisabBasis) -> f64 {
    match basis {
        NisabBasis::Gold => GOLD_NISAB_GRAMS,
        NisabBasis::Silver => SILVER_NISAB_GRAMS,
    }
}

/// Round to 2 decimal places (currency cents).
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Nisab threshold for a basis at a given price per gram.
pub fn threshold(price_per_gram: f64, basis: NisabBasis) -> f64 {
    round2(price_per_gram * grams_required(basis))
}

/// Zakat due on a zakatable wealth figure.
pub fn zakat_due(zakatable_wealth: f64) -> f64 {
    round2(zakatable_wealth * ZAKAT_RATE)
}

/// Source of current precious-metal prices.
#[async_trait]
pub trait MetalPriceSource: Send + Sync {
    /// Current price per gram of the basis metal, in `currency`.
    async fn price_per_gram(&self, basis: NisabBasis, currency: &str)
        -> Result<f64, PriceError>;
}

/// Fixed prices. Used directly in tests and as the configured fallback
/// when the live source fails.
#[derive(Debug, Clone, Copy)]
pub struct StaticPrices {
    pub gold_per_gram: f64,
    pub silver_per_gram: f64,
}

impl StaticPrices {
    pub fn price(&self, basis: NisabBasis) -> f64 {
        match basis {
            NisabBasis::Gold => self.gold_per_gram,
            NisabBasis::Silver => self.silver_per_gram,
        }
    }
}

#[async_trait]
impl MetalPriceSource for StaticPrices {
    async fn price_per_gram(
        &self,
        basis: NisabBasis,
        _currency: &str,
    ) -> Result<f64, PriceError> {
        Ok(self.price(basis))
    }
}

struct CachedPrice {
    price: f64,
    fetched_at: Instant,
}

/// TTL cache over a live price source with a static fallback.
///
/// An explicit, injected struct: TTL and invalidation are visible at
/// the call site, not hidden in package-level state. Fallback prices
/// are returned on source failure but never cached, so the next call
/// retries the live source.
pub struct CachedPriceSource<S: MetalPriceSource> {
    inner: S,
    ttl: Duration,
    fallback: StaticPrices,
    cache: Mutex<HashMap<(NisabBasis, String), CachedPrice>>,
}

impl<S: MetalPriceSource> CachedPriceSource<S> {
    pub fn new(inner: S, ttl: Duration, fallback: StaticPrices) -> Self {
        Self {
            inner,
            ttl,
            fallback,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Drop all cached prices; the next lookup hits the live source.
    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }
}

#[async_trait]
impl<S: MetalPriceSource> MetalPriceSource for CachedPriceSource<S> {
    async fn price_per_gram(
        &self,
        basis: NisabBasis,
        currency: &str,
    ) -> Result<f64, PriceError> {
        let cache_key = (basis, currency.to_string());
        {
            let cache = self.cache.lock();
            if let Some(hit) = cache.get(&cache_key) {
                if hit.fetched_at.elapsed() < self.ttl {
                    return Ok(hit.price);
                }
            }
        }

        match self.inner.price_per_gram(basis, currency).await {
            Ok(price) if price > 0.0 => {
                self.cache.lock().insert(
                    cache_key,
                    CachedPrice {
                        price,
                        fetched_at: Instant::now(),
                    },
                );
                Ok(price)
            }
            Ok(price) => {
                warn!(%basis, price, "price source returned a non-positive price, using fallback");
                Ok(self.fallback.price(basis))
            }
            Err(err) => {
                warn!(%basis, error = %err, "price source failed, using fallback");
                Ok(self.fallback.price(basis))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn threshold_math() {
        // 87.48g of gold at 65/g
        assert_eq!(threshold(65.0, NisabBasis::Gold), 5686.2);
        assert_eq!(threshold(1.0, NisabBasis::Silver), 612.36);
    }

    #[test]
    fn zakat_rate_rounding() {
        assert_eq!(zakat_due(10000.0), 250.0);
        assert_eq!(zakat_due(5686.0), 142.15);
        assert_eq!(zakat_due(0.0), 0.0);
    }

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MetalPriceSource for CountingSource {
        async fn price_per_gram(
            &self,
            _basis: NisabBasis,
            _currency: &str,
        ) -> Result<f64, PriceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(PriceError::Unavailable("down".into()))
            } else {
                Ok(64.0)
            }
        }
    }

    fn fallback() -> StaticPrices {
        StaticPrices {
            gold_per_gram: 75.0,
            silver_per_gram: 0.95,
        }
    }

    #[tokio::test]
    async fn cache_serves_within_ttl() {
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let cached = CachedPriceSource::new(source, Duration::from_secs(60), fallback());
        assert_eq!(
            cached.price_per_gram(NisabBasis::Gold, "USD").await.unwrap(),
            64.0
        );
        assert_eq!(
            cached.price_per_gram(NisabBasis::Gold, "USD").await.unwrap(),
            64.0
        );
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 1);

        cached.invalidate();
        cached.price_per_gram(NisabBasis::Gold, "USD").await.unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fallback_on_failure_is_not_cached() {
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        let cached = CachedPriceSource::new(source, Duration::from_secs(60), fallback());
        assert_eq!(
            cached.price_per_gram(NisabBasis::Gold, "USD").await.unwrap(),
            75.0
        );
        assert_eq!(
            cached.price_per_gram(NisabBasis::Silver, "USD").await.unwrap(),
            0.95
        );
        // every call retried the live source
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }
}
