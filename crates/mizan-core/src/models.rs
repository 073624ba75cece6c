//! Database row models and core enums — these map to/from SQL rows.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::nisab;

/// Length of the Hawl holding period. The lunar year is treated as a
/// fixed 354-day window; calendar conversion is out of scope.
pub const HAWL_DAYS: i64 = 354;

/// Which metal defines the Nisab threshold for a record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NisabBasis {
    Gold,
    Silver,
}

impl NisabBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            NisabBasis::Gold => "GOLD",
            NisabBasis::Silver => "SILVER",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "GOLD" => Ok(NisabBasis::Gold),
            "SILVER" => Ok(NisabBasis::Silver),
            other => Err(CoreError::InvalidBasis(other.to_string())),
        }
    }
}

impl std::fmt::Display for NisabBasis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outer lifecycle status of a record. Re-finalizing an UNLOCKED record
/// returns it to FINALIZED; there is no separate refinalized status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Draft,
    Finalized,
    Unlocked,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Draft => "DRAFT",
            RecordStatus::Finalized => "FINALIZED",
            RecordStatus::Unlocked => "UNLOCKED",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived Hawl sub-state. Not stored as a column: NOT_STARTED/ACTIVE/
/// COMPLETE fall out of the date stamps, and INTERRUPTED is the outcome
/// of an evaluation pass (the DRAFT is removed, see the engine's
/// interruption policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HawlState {
    NotStarted,
    Active,
    Interrupted,
    Complete,
}

/// Audit trail event types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    Created,
    NisabAchieved,
    HawlInterrupted,
    Edited,
    Finalized,
    Unlocked,
    Refinalized,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Created => "CREATED",
            AuditEventType::NisabAchieved => "NISAB_ACHIEVED",
            AuditEventType::HawlInterrupted => "HAWL_INTERRUPTED",
            AuditEventType::Edited => "EDITED",
            AuditEventType::Finalized => "FINALIZED",
            AuditEventType::Unlocked => "UNLOCKED",
            AuditEventType::Refinalized => "REFINALIZED",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssetRow {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub category: String,
    pub value: f64,
    /// 0–1, the zakatable share of the nominal value.
    pub zakatable_modifier: f64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NisabYearRecordRow {
    pub id: String,
    pub owner_id: String,
    pub basis: NisabBasis,
    pub status: RecordStatus,
    pub currency: String,
    /// Threshold frozen when the period began. Never recalculated.
    pub nisab_threshold_at_start: f64,
    pub hawl_start_date: Option<DateTime<Utc>>,
    pub hawl_completion_date: Option<DateTime<Utc>>,
    pub hawl_completed_at: Option<DateTime<Utc>>,
    pub total_wealth: f64,
    pub zakatable_wealth: f64,
    pub zakat_amount: Option<f64>,
    /// Base64 AEAD ciphertext of the AssetSnapshot JSON.
    pub snapshot_enc: String,
    /// Encrypted unlock reason (vault-encrypted), set on unlock.
    pub unlock_reason_enc: Option<String>,
    pub notes: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NisabYearRecordRow {
    pub fn hawl_state(&self) -> HawlState {
        if self.hawl_completed_at.is_some() {
            HawlState::Complete
        } else if self.hawl_start_date.is_none() {
            HawlState::NotStarted
        } else {
            HawlState::Active
        }
    }

    /// Live progress for an active record. None until Hawl has started.
    pub fn progress(&self, current_zakatable: f64, now: DateTime<Utc>) -> Option<HawlProgress> {
        let start = self.hawl_start_date?;
        let completion = self
            .hawl_completion_date
            .unwrap_or(start + Duration::days(HAWL_DAYS));
        let days_elapsed = (now - start).num_days().max(0);
        let days_remaining = (completion - now).num_days().max(0);
        let percent_complete =
            nisab::round2((days_elapsed as f64 / HAWL_DAYS as f64 * 100.0).min(100.0));
        let percent_of_threshold = if self.nisab_threshold_at_start > 0.0 {
            nisab::round2(current_zakatable / self.nisab_threshold_at_start * 100.0)
        } else {
            0.0
        };
        Some(HawlProgress {
            days_elapsed,
            days_remaining,
            percent_complete,
            percent_of_threshold,
            estimated_zakat: nisab::zakat_due(current_zakatable),
        })
    }
}

/// Point-in-time capture of one asset inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotAsset {
    pub id: String,
    pub name: String,
    pub category: String,
    pub value: f64,
    pub modifier: f64,
    pub zakatable_value: f64,
}

/// Immutable asset breakdown captured when a holding period begins.
/// Always encrypted before it reaches the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSnapshot {
    pub captured_at: DateTime<Utc>,
    pub assets: Vec<SnapshotAsset>,
    pub total_wealth: f64,
    pub zakatable_wealth: f64,
}

/// Live Hawl progress, shaped for the HTTP layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HawlProgress {
    pub days_elapsed: i64,
    pub days_remaining: i64,
    pub percent_complete: f64,
    pub percent_of_threshold: f64,
    pub estimated_zakat: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditTrailRow {
    pub seq: i64,
    pub id: String,
    pub record_id: String,
    pub actor_id: String,
    pub event_type: AuditEventType,
    pub reason_enc: Option<String>,
    pub changes_enc: Option<String>,
    pub before_state_enc: Option<String>,
    pub after_state_enc: Option<String>,
    pub interruption_enc: Option<String>,
    pub created_at: DateTime<Utc>,
}
