//! Wealth aggregation over the asset ledger.
//!
//! Single source of truth for "current wealth": both the real-time path
//! and the reconciliation sweep compute it here, from the same indexed
//! query, so neither path can drift on a cached figure the other never
//! sees. Read-only; callers pass their own connection so aggregation
//! can run inside an open transaction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::CoreError;
use crate::models::{AssetRow, AssetSnapshot, SnapshotAsset};

/// Point-in-time wealth figures for one owner.
#[derive(Debug, Clone, PartialEq)]
pub struct WealthSummary {
    /// Sum of raw asset values.
    pub gross: f64,
    /// Sum of value * modifier over active assets.
    pub zakatable: f64,
    /// Zakatable wealth per asset category.
    pub by_category: BTreeMap<String, f64>,
}

pub async fn active_assets(
    conn: &mut SqliteConnection,
    owner_id: &str,
) -> Result<Vec<AssetRow>, CoreError> {
    let rows = sqlx::query_as::<_, AssetRow>(
        "SELECT * FROM assets WHERE owner_id = ? AND active = TRUE ORDER BY created_at",
    )
    .bind(owner_id)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

pub fn summarize(assets: &[AssetRow]) -> WealthSummary {
    let mut summary = WealthSummary {
        gross: 0.0,
        zakatable: 0.0,
        by_category: BTreeMap::new(),
    };
    for asset in assets {
        let zakatable = asset.value * asset.zakatable_modifier;
        summary.gross += asset.value;
        summary.zakatable += zakatable;
        *summary.by_category.entry(asset.category.clone()).or_insert(0.0) += zakatable;
    }
    summary
}

/// Current wealth for one owner.
pub async fn total_wealth(
    conn: &mut SqliteConnection,
    owner_id: &str,
) -> Result<WealthSummary, CoreError> {
    let assets = active_assets(conn, owner_id).await?;
    Ok(summarize(&assets))
}

/// Capture the breakdown that backs a new holding period. Totals are
/// recomputed from the snapshot's own entries so the stored blob is
/// internally consistent whatever happens to the live ledger later.
pub fn build_snapshot(assets: &[AssetRow], captured_at: DateTime<Utc>) -> AssetSnapshot {
    let entries: Vec<SnapshotAsset> = assets
        .iter()
        .map(|a| SnapshotAsset {
            id: a.id.clone(),
            name: a.name.clone(),
            category: a.category.clone(),
            value: a.value,
            modifier: a.zakatable_modifier,
            zakatable_value: a.value * a.zakatable_modifier,
        })
        .collect();
    let total_wealth = entries.iter().map(|e| e.value).sum();
    let zakatable_wealth = entries.iter().map(|e| e.zakatable_value).sum();
    AssetSnapshot {
        captured_at,
        assets: entries,
        total_wealth,
        zakatable_wealth,
    }
}
