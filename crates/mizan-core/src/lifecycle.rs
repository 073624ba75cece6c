//! Record lifecycle manager: the outer status machine.
//!
//! DRAFT → FINALIZED → UNLOCKED → FINALIZED. Status only ever changes
//! through `finalize` and `unlock`; a direct write to the status field
//! is rejected no matter what state the record is in. Every mutation
//! verifies ownership first and commits its audit entry in the same
//! transaction as the change it records.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditDetails, AuditTrail};
use crate::error::{CoreError, MIN_UNLOCK_REASON_LEN};
use crate::models::{
    AssetSnapshot, AuditEventType, HawlProgress, NisabBasis, NisabYearRecordRow, RecordStatus,
    HAWL_DAYS,
};
use crate::engine::COMPLETION_TOLERANCE_DAYS;
use crate::nisab::{self, MetalPriceSource};
use crate::store::{ListFilter, Store, REASON_AAD, SNAPSHOT_AAD};
use crate::wealth;

/// Parameters for a manually created record. Hawl does not start at
/// creation; the state machine stamps the start date once wealth holds
/// at or above the frozen threshold.
#[derive(Debug, Clone, Default)]
pub struct NewRecord {
    /// Overrides the user's configured basis when set.
    pub basis: Option<NisabBasis>,
    pub notes: Option<String>,
}

/// Caller-editable fields. The `status` field is here so a request body
/// that tries to write it is rejected explicitly instead of silently
/// dropped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordUpdate {
    pub notes: Option<String>,
    pub status: Option<String>,
}

#[derive(Clone)]
pub struct RecordService {
    store: Store,
    audit: AuditTrail,
    prices: Arc<dyn MetalPriceSource>,
}

impl RecordService {
    pub fn new(store: Store, prices: Arc<dyn MetalPriceSource>) -> Self {
        let audit = AuditTrail::new(store.clone());
        Self {
            store,
            audit,
            prices,
        }
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Create a DRAFT record for the owner, freezing the threshold at
    /// today's price and capturing the asset snapshot.
    pub async fn create(
        &self,
        owner_id: &str,
        actor_id: &str,
        req: NewRecord,
    ) -> Result<NisabYearRecordRow, CoreError> {
        let (default_basis, currency) = self.store.user_settings(owner_id).await?;
        let basis = req.basis.unwrap_or(default_basis);
        let price = self.prices.price_per_gram(basis, &currency).await?;
        let threshold = nisab::threshold(price, basis);
        let now = Utc::now();

        let mut tx = self.store.pool.begin().await?;
        let assets = wealth::active_assets(&mut tx, owner_id).await?;
        let summary = wealth::summarize(&assets);
        let snapshot = wealth::build_snapshot(&assets, now);
        let snapshot_enc = self
            .store
            .encrypt_value(&serde_json::to_vec(&snapshot)?, SNAPSHOT_AAD)
            .await?;

        let row = NisabYearRecordRow {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            basis,
            status: RecordStatus::Draft,
            currency,
            nisab_threshold_at_start: threshold,
            hawl_start_date: None,
            hawl_completion_date: None,
            hawl_completed_at: None,
            total_wealth: summary.gross,
            zakatable_wealth: summary.zakatable,
            zakat_amount: None,
            snapshot_enc,
            unlock_reason_enc: None,
            notes: req.notes,
            finalized_at: None,
            unlocked_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_record(&mut tx, &row).await?;
        self.audit
            .record_in(
                &mut tx,
                actor_id,
                AuditEventType::Created,
                &row.id,
                AuditDetails {
                    after_state: Some(serde_json::to_value(&row)?),
                    ..Default::default()
                },
            )
            .await?;
        tx.commit().await?;
        info!(owner = owner_id, record = %row.id, "record created");
        Ok(row)
    }

    pub async fn get(
        &self,
        owner_id: &str,
        record_id: &str,
    ) -> Result<NisabYearRecordRow, CoreError> {
        let mut conn = self.store.pool.acquire().await?;
        self.load_owned(&mut conn, owner_id, record_id).await
    }

    pub async fn list(
        &self,
        owner_id: &str,
        filter: &ListFilter,
    ) -> Result<Vec<NisabYearRecordRow>, CoreError> {
        self.store.list_records(owner_id, filter).await
    }

    /// Edit caller-editable fields. Legal only while DRAFT or UNLOCKED.
    pub async fn update(
        &self,
        owner_id: &str,
        actor_id: &str,
        record_id: &str,
        update: RecordUpdate,
    ) -> Result<NisabYearRecordRow, CoreError> {
        if update.status.is_some() {
            return Err(CoreError::StatusFieldWrite);
        }

        let mut tx = self.store.pool.begin().await?;
        let mut record = self.load_owned(&mut tx, owner_id, record_id).await?;
        if !matches!(record.status, RecordStatus::Draft | RecordStatus::Unlocked) {
            return Err(CoreError::NotEditable(record.status));
        }

        let before = serde_json::to_value(&record)?;
        if let Some(notes) = update.notes {
            record.notes = Some(notes);
        }
        record.updated_at = Utc::now();
        self.store.update_record(&mut tx, &record).await?;
        self.audit
            .record_in(
                &mut tx,
                actor_id,
                AuditEventType::Edited,
                &record.id,
                AuditDetails {
                    changes_summary: Some("record fields edited".to_string()),
                    before_state: Some(before),
                    after_state: Some(serde_json::to_value(&record)?),
                    ..Default::default()
                },
            )
            .await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Finalize a DRAFT (or re-finalize an UNLOCKED record). Requires a
    /// started and complete Hawl unless `override_hawl` is set.
    /// Recomputes wealth and the snapshot from the live ledger and
    /// writes the final Zakat amount.
    pub async fn finalize(
        &self,
        owner_id: &str,
        actor_id: &str,
        record_id: &str,
        override_hawl: bool,
    ) -> Result<NisabYearRecordRow, CoreError> {
        let now = Utc::now();
        let mut tx = self.store.pool.begin().await?;
        let mut record = self.load_owned(&mut tx, owner_id, record_id).await?;

        let event = match record.status {
            RecordStatus::Draft => AuditEventType::Finalized,
            RecordStatus::Unlocked => AuditEventType::Refinalized,
            RecordStatus::Finalized => {
                return Err(CoreError::NotFinalizable(record.status));
            }
        };

        let start = record
            .hawl_start_date
            .ok_or_else(|| CoreError::HawlNotStarted(record.id.clone()))?;
        let completion = record
            .hawl_completion_date
            .unwrap_or(start + Duration::days(HAWL_DAYS));
        let complete = record.hawl_completed_at.is_some()
            || now >= completion - Duration::days(COMPLETION_TOLERANCE_DAYS);
        if !complete && !override_hawl {
            return Err(CoreError::HawlIncomplete { completion });
        }

        let before = serde_json::to_value(&record)?;
        let assets = wealth::active_assets(&mut tx, owner_id).await?;
        let summary = wealth::summarize(&assets);
        let snapshot = wealth::build_snapshot(&assets, now);
        record.snapshot_enc = self
            .store
            .encrypt_value(&serde_json::to_vec(&snapshot)?, SNAPSHOT_AAD)
            .await?;
        record.total_wealth = summary.gross;
        record.zakatable_wealth = summary.zakatable;
        record.zakat_amount = Some(nisab::zakat_due(summary.zakatable));
        if complete && record.hawl_completed_at.is_none() {
            record.hawl_completed_at = Some(now);
        }
        record.status = RecordStatus::Finalized;
        record.finalized_at = Some(now);
        record.updated_at = now;
        self.store.update_record(&mut tx, &record).await?;
        self.audit
            .record_in(
                &mut tx,
                actor_id,
                event,
                &record.id,
                AuditDetails {
                    changes_summary: Some(format!(
                        "record finalized; zakat due {:.2} {}",
                        record.zakat_amount.unwrap_or(0.0),
                        record.currency
                    )),
                    before_state: Some(before),
                    after_state: Some(serde_json::to_value(&record)?),
                    ..Default::default()
                },
            )
            .await?;
        tx.commit().await?;
        info!(owner = owner_id, record = %record.id, event = %event, "record finalized");
        Ok(record)
    }

    /// Unlock a FINALIZED record for correction. The reason is
    /// mandatory, at least ten characters, and stored encrypted.
    pub async fn unlock(
        &self,
        owner_id: &str,
        actor_id: &str,
        record_id: &str,
        reason: &str,
    ) -> Result<NisabYearRecordRow, CoreError> {
        if reason.len() < MIN_UNLOCK_REASON_LEN {
            return Err(CoreError::ReasonTooShort {
                min: MIN_UNLOCK_REASON_LEN,
                got: reason.len(),
            });
        }

        let now = Utc::now();
        let mut tx = self.store.pool.begin().await?;
        let mut record = self.load_owned(&mut tx, owner_id, record_id).await?;
        if record.status != RecordStatus::Finalized {
            return Err(CoreError::NotFinalized(record.status));
        }

        let before = serde_json::to_value(&record)?;
        record.unlock_reason_enc = Some(
            self.store
                .encrypt_value(reason.as_bytes(), REASON_AAD)
                .await?,
        );
        record.status = RecordStatus::Unlocked;
        record.unlocked_at = Some(now);
        record.updated_at = now;
        self.store.update_record(&mut tx, &record).await?;
        self.audit
            .record_in(
                &mut tx,
                actor_id,
                AuditEventType::Unlocked,
                &record.id,
                AuditDetails {
                    reason: Some(reason.to_string()),
                    before_state: Some(before),
                    after_state: Some(serde_json::to_value(&record)?),
                    ..Default::default()
                },
            )
            .await?;
        tx.commit().await?;
        info!(owner = owner_id, record = %record.id, "record unlocked");
        Ok(record)
    }

    /// Delete a DRAFT. Finalized history is permanent.
    pub async fn delete(
        &self,
        owner_id: &str,
        actor_id: &str,
        record_id: &str,
    ) -> Result<(), CoreError> {
        let mut tx = self.store.pool.begin().await?;
        let record = self.load_owned(&mut tx, owner_id, record_id).await?;
        if record.status != RecordStatus::Draft {
            return Err(CoreError::NotDraft(record.status));
        }
        self.audit
            .record_in(
                &mut tx,
                actor_id,
                AuditEventType::Edited,
                &record.id,
                AuditDetails {
                    changes_summary: Some("draft record deleted by owner".to_string()),
                    before_state: Some(serde_json::to_value(&record)?),
                    after_state: Some(json!(null)),
                    ..Default::default()
                },
            )
            .await?;
        self.store.delete_record(&mut tx, &record.id).await?;
        tx.commit().await?;
        info!(owner = owner_id, record = record_id, "draft deleted");
        Ok(())
    }

    /// Live Hawl progress against the record's frozen threshold.
    /// None until Hawl has started.
    pub async fn progress(
        &self,
        owner_id: &str,
        record_id: &str,
    ) -> Result<Option<HawlProgress>, CoreError> {
        let mut conn = self.store.pool.acquire().await?;
        let record = self.load_owned(&mut conn, owner_id, record_id).await?;
        let summary = wealth::total_wealth(&mut conn, owner_id).await?;
        Ok(record.progress(summary.zakatable, Utc::now()))
    }

    /// Decrypt the stored asset breakdown.
    pub async fn snapshot(
        &self,
        owner_id: &str,
        record_id: &str,
    ) -> Result<AssetSnapshot, CoreError> {
        let record = self.get(owner_id, record_id).await?;
        let bytes = self
            .store
            .decrypt_value(&record.snapshot_enc, SNAPSHOT_AAD)
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn load_owned(
        &self,
        conn: &mut SqliteConnection,
        owner_id: &str,
        record_id: &str,
    ) -> Result<NisabYearRecordRow, CoreError> {
        let record = self
            .store
            .record_by_id(conn, record_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(record_id.to_string()))?;
        if record.owner_id != owner_id {
            return Err(CoreError::NotOwner(record_id.to_string()));
        }
        Ok(record)
    }
}
