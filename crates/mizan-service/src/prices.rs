//! HTTP metal-price client.
//!
//! Wrapped in a [`CachedPriceSource`] by the caller so a slow or dead
//! price API can never stall the sweep: requests carry a bounded
//! timeout and failures degrade to the configured fallback prices.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mizan_core::models::NisabBasis;
use mizan_core::nisab::{CachedPriceSource, MetalPriceSource, PriceError, StaticPrices};
use serde::Deserialize;

use crate::config::PriceSettings;

pub struct HttpPriceClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price_per_gram: f64,
}

impl HttpPriceClient {
    pub fn new(settings: &PriceSettings) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("mizan-service/0.1")
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: settings.api_base_url.clone(),
        }
    }
}

#[async_trait]
impl MetalPriceSource for HttpPriceClient {
    async fn price_per_gram(
        &self,
        basis: NisabBasis,
        currency: &str,
    ) -> Result<f64, PriceError> {
        let metal = match basis {
            NisabBasis::Gold => "gold",
            NisabBasis::Silver => "silver",
        };
        let url = format!(
            "{}/v1/metals/{}/price?currency={}",
            self.base_url, metal, currency
        );
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PriceError::Unavailable(e.to_string()))?;
        if !res.status().is_success() {
            return Err(PriceError::Unavailable(format!(
                "price fetch failed with status {}",
                res.status()
            )));
        }
        let body: PriceResponse = res
            .json()
            .await
            .map_err(|e| PriceError::Unavailable(e.to_string()))?;
        if body.price_per_gram <= 0.0 {
            return Err(PriceError::Invalid(body.price_per_gram));
        }
        Ok(body.price_per_gram)
    }
}

/// Live client behind the TTL cache with configured fallbacks.
pub fn build_price_source(settings: &PriceSettings) -> Arc<CachedPriceSource<HttpPriceClient>> {
    Arc::new(CachedPriceSource::new(
        HttpPriceClient::new(settings),
        Duration::from_secs(settings.cache_ttl_secs),
        StaticPrices {
            gold_per_gram: settings.fallback_gold_per_gram,
            silver_per_gram: settings.fallback_silver_per_gram,
        },
    ))
}
