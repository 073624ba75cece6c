use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSettings {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    /// Fallback price per gram when the live source fails. Never zero:
    /// a dead price API must degrade to a documented number, not
    /// silently disable threshold detection.
    pub fallback_gold_per_gram: f64,
    pub fallback_silver_per_gram: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSettings {
    pub interval_secs: u64,
    /// Overall bound for one sweep. Exceeding it aborts the run; state
    /// stays consistent because each user's work is one committed
    /// transaction.
    pub run_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub price: PriceSettings,
    pub sweep: SweepSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            price: PriceSettings {
                api_base_url: "https://api.metals.dev".into(),
                request_timeout_secs: 10,
                cache_ttl_secs: 600,
                fallback_gold_per_gram: 75.0,
                fallback_silver_per_gram: 0.95,
            },
            sweep: SweepSettings {
                interval_secs: 3600,
                run_timeout_secs: 600,
                max_attempts: 3,
                retry_delay_secs: 30,
            },
        }
    }
}

pub fn load_or_default(path: &Path) -> anyhow::Result<ServiceConfig> {
    if path.exists() {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    } else {
        Ok(ServiceConfig::default())
    }
}

pub fn save(path: &Path, config: &ServiceConfig) -> anyhow::Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data)?;
    Ok(())
}
