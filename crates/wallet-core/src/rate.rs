use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::Mutex;

use crate::error::WalletError;
use crate::provider::RateSource;

/// Remembers the last BCH/USD quote for a fixed time.
pub struct ExchangeRateCache {
    source: Arc<dyn RateSource>,
    ttl: Duration,
    cached: Mutex<Option<(f64, Instant)>>,
}

impl ExchangeRateCache {
    pub fn new(source: Arc<dyn RateSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// USD per BCH, refreshed from the source once the cached quote expires.
    pub async fn usd_rate(&self) -> Result<f64, WalletError> {
        let mut cached = self.cached.lock().await;
        if let Some((rate, fetched)) = *cached {
            if fetched.elapsed() < self.ttl {
                return Ok(rate);
            }
        }
        let rate = self
            .source
            .usd_per_bch()
            .await
            .map_err(|e| WalletError::RateUnavailable(e.to_string()))?;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(WalletError::RateUnavailable(format!("bad quote {rate}")));
        }
        debug!("refreshed BCH/USD rate: {rate}");
        *cached = Some((rate, Instant::now()));
        Ok(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SourceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingRates {
        calls: AtomicU64,
        rate: f64,
    }

    #[async_trait]
    impl RateSource for CountingRates {
        async fn usd_per_bch(&self) -> Result<f64, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rate)
        }
    }

    fn source(rate: f64) -> Arc<CountingRates> {
        Arc::new(CountingRates {
            calls: AtomicU64::new(0),
            rate,
        })
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let rates = source(250.0);
        let cache = ExchangeRateCache::new(rates.clone(), Duration::from_secs(60));
        assert_eq!(cache.usd_rate().await.unwrap(), 250.0);
        assert_eq!(cache.usd_rate().await.unwrap(), 250.0);
        assert_eq!(rates.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refetches_when_expired() {
        let rates = source(250.0);
        let cache = ExchangeRateCache::new(rates.clone(), Duration::ZERO);
        cache.usd_rate().await.unwrap();
        cache.usd_rate().await.unwrap();
        assert_eq!(rates.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejects_nonsense_quotes() {
        let cache = ExchangeRateCache::new(source(0.0), Duration::from_secs(60));
        assert!(matches!(
            cache.usd_rate().await,
            Err(WalletError::RateUnavailable(_))
        ));
    }
}
