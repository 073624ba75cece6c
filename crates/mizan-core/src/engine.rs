//! The Hawl state machine.
//!
//! Both mutation paths — the synchronous handler fired on asset changes
//! and the periodic reconciliation sweep — collapse onto
//! [`HawlEngine::run`]: one transactional evaluate-and-apply function
//! keyed by owner. The read-decide-write sequence runs inside a single
//! transaction, and the partial unique index on (owner, DRAFT) makes
//! duplicate creation impossible even if two writers race past the
//! read.
//!
//! The price fetch happens before the transaction opens; no network
//! I/O runs while the write window is held.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditDetails, AuditTrail};
use crate::error::CoreError;
use crate::models::{
    AuditEventType, NisabYearRecordRow, RecordStatus, HAWL_DAYS,
};
use crate::nisab::{self, MetalPriceSource};
use crate::store::{Store, SNAPSHOT_AAD};
use crate::wealth;

/// A Hawl is treated as complete within this many days of the formal
/// completion date.
pub const COMPLETION_TOLERANCE_DAYS: i64 = 5;

/// Recorded wealth within this distance of the freshly computed figure
/// is considered consistent (absorbs floating noise).
pub const RECONCILE_WEALTH_TOLERANCE: f64 = 1.0;

/// What happens to a DRAFT whose wealth falls below its frozen
/// threshold. Deleting discards the 354-day clock and the prior
/// snapshot; the full pre-deletion record is preserved in the encrypted
/// interruption payload of the HAWL_INTERRUPTED audit entry, so the
/// trail stays recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionPolicy {
    DeleteRecord,
}

pub const INTERRUPTION_POLICY: InterruptionPolicy = InterruptionPolicy::DeleteRecord;

/// Actor id stamped on audit entries written by the sweep.
pub const RECONCILIATION_ACTOR: &str = "system:reconciliation";

#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    NoAction,
    DraftCreated { record_id: String },
    HawlStarted { record_id: String },
    HawlCompleted { record_id: String },
    Interrupted { record_id: String },
}

#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub owner_id: String,
    pub outcome: EvaluationOutcome,
    /// True when the pre-step overwrote a drifted wealth figure.
    pub reconciled: bool,
    pub zakatable_wealth: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepError {
    pub owner_id: String,
    pub message: String,
}

/// Result summary of one reconciliation sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub users_processed: usize,
    pub reconciled: usize,
    pub achieved: usize,
    pub interrupted: usize,
    pub completed: usize,
    pub errors: Vec<SweepError>,
}

pub struct HawlEngine {
    store: Store,
    audit: AuditTrail,
    prices: Arc<dyn MetalPriceSource>,
}

impl HawlEngine {
    pub fn new(store: Store, prices: Arc<dyn MetalPriceSource>) -> Self {
        let audit = AuditTrail::new(store.clone());
        Self {
            store,
            audit,
            prices,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Real-time path: called synchronously after an asset mutation.
    pub async fn evaluate(
        &self,
        owner_id: &str,
        actor_id: &str,
    ) -> Result<EvaluationReport, CoreError> {
        self.run(owner_id, actor_id, false).await
    }

    /// Reconciliation path: same rules plus the drift-repair pre-step.
    pub async fn reconcile(
        &self,
        owner_id: &str,
        actor_id: &str,
    ) -> Result<EvaluationReport, CoreError> {
        self.run(owner_id, actor_id, true).await
    }

    async fn run(
        &self,
        owner_id: &str,
        actor_id: &str,
        reconcile: bool,
    ) -> Result<EvaluationReport, CoreError> {
        let (basis, currency) = self.store.user_settings(owner_id).await?;
        let price = self.prices.price_per_gram(basis, &currency).await?;
        let current_threshold = nisab::threshold(price, basis);
        let now = Utc::now();

        let mut tx = self.store.pool.begin().await?;
        let assets = wealth::active_assets(&mut tx, owner_id).await?;
        let summary = wealth::summarize(&assets);
        let draft = self.store.draft_for_owner(&mut tx, owner_id).await?;

        let mut reconciled = false;
        let mut recorded_wealth_before = None;
        let draft = match draft {
            Some(mut d) => {
                recorded_wealth_before = Some(d.zakatable_wealth);
                if reconcile
                    && (d.zakatable_wealth - summary.zakatable).abs()
                        > RECONCILE_WEALTH_TOLERANCE
                {
                    debug!(
                        owner = owner_id,
                        recorded = d.zakatable_wealth,
                        actual = summary.zakatable,
                        "repairing drifted wealth figure"
                    );
                    d.total_wealth = summary.gross;
                    d.zakatable_wealth = summary.zakatable;
                    d.updated_at = now;
                    self.store.update_record(&mut tx, &d).await?;
                    reconciled = true;
                }
                Some(d)
            }
            None => None,
        };

        let outcome = match draft {
            None => {
                if !assets.is_empty() && summary.zakatable >= current_threshold {
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
                        currency: currency.clone(),
                        nisab_threshold_at_start: current_threshold,
                        hawl_start_date: Some(now),
                        hawl_completion_date: Some(now + Duration::days(HAWL_DAYS)),
                        hawl_completed_at: None,
                        total_wealth: summary.gross,
                        zakatable_wealth: summary.zakatable,
                        zakat_amount: None,
                        snapshot_enc,
                        unlock_reason_enc: None,
                        notes: None,
                        finalized_at: None,
                        unlocked_at: None,
                        created_at: now,
                        updated_at: now,
                    };
                    match self.store.insert_record(&mut tx, &row).await {
                        Ok(()) => {
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
                            self.audit
                                .record_in(
                                    &mut tx,
                                    actor_id,
                                    AuditEventType::NisabAchieved,
                                    &row.id,
                                    AuditDetails {
                                        changes_summary: Some(format!(
                                            "zakatable wealth {:.2} {} reached nisab threshold {:.2}",
                                            summary.zakatable, currency, current_threshold
                                        )),
                                        after_state: Some(json!({
                                            "zakatable_wealth": summary.zakatable,
                                            "threshold": current_threshold,
                                            "basis": basis,
                                        })),
                                        ..Default::default()
                                    },
                                )
                                .await?;
                            info!(owner = owner_id, record = %row.id, "nisab achieved, hawl started");
                            EvaluationOutcome::DraftCreated {
                                record_id: row.id.clone(),
                            }
                        }
                        Err(err) if err.is_duplicate_draft() => {
                            // the other writer won; its DRAFT stands
                            warn!(owner = owner_id, "concurrent draft creation detected, yielding");
                            tx.rollback().await?;
                            return Ok(EvaluationReport {
                                owner_id: owner_id.to_string(),
                                outcome: EvaluationOutcome::NoAction,
                                reconciled: false,
                                zakatable_wealth: summary.zakatable,
                                threshold: current_threshold,
                            });
                        }
                        Err(err) => return Err(err),
                    }
                } else {
                    EvaluationOutcome::NoAction
                }
            }
            Some(mut d) => {
                if summary.zakatable < d.nisab_threshold_at_start {
                    // Hawl interrupted. Policy: delete the DRAFT; the
                    // full record rides along in the encrypted
                    // interruption payload.
                    debug_assert_eq!(INTERRUPTION_POLICY, InterruptionPolicy::DeleteRecord);
                    self.audit
                        .record_in(
                            &mut tx,
                            actor_id,
                            AuditEventType::HawlInterrupted,
                            &d.id,
                            AuditDetails {
                                changes_summary: Some(format!(
                                    "zakatable wealth fell to {:.2}, below frozen threshold {:.2}",
                                    summary.zakatable, d.nisab_threshold_at_start
                                )),
                                interruption: Some(json!({
                                    "recorded_wealth": recorded_wealth_before,
                                    "current_wealth": summary.zakatable,
                                    "threshold": d.nisab_threshold_at_start,
                                    "record": serde_json::to_value(&d)?,
                                })),
                                ..Default::default()
                            },
                        )
                        .await?;
                    self.store.delete_record(&mut tx, &d.id).await?;
                    info!(owner = owner_id, record = %d.id, "hawl interrupted, draft removed");
                    EvaluationOutcome::Interrupted { record_id: d.id }
                } else if d.hawl_start_date.is_none() {
                    d.hawl_start_date = Some(now);
                    d.hawl_completion_date = Some(now + Duration::days(HAWL_DAYS));
                    d.total_wealth = summary.gross;
                    d.zakatable_wealth = summary.zakatable;
                    d.updated_at = now;
                    self.store.update_record(&mut tx, &d).await?;
                    self.audit
                        .record_in(
                            &mut tx,
                            actor_id,
                            AuditEventType::NisabAchieved,
                            &d.id,
                            AuditDetails {
                                changes_summary: Some(format!(
                                    "zakatable wealth {:.2} {} reached nisab threshold {:.2}",
                                    summary.zakatable, d.currency, d.nisab_threshold_at_start
                                )),
                                after_state: Some(serde_json::to_value(&d)?),
                                ..Default::default()
                            },
                        )
                        .await?;
                    info!(owner = owner_id, record = %d.id, "hawl started on existing draft");
                    EvaluationOutcome::HawlStarted { record_id: d.id }
                } else if d.hawl_completed_at.is_none()
                    && d.hawl_completion_date.is_some_and(|completion| {
                        now >= completion - Duration::days(COMPLETION_TOLERANCE_DAYS)
                    })
                {
                    // completion is a sub-state stamp, not a status
                    // change; finalization stays an explicit user action
                    d.hawl_completed_at = Some(now);
                    d.updated_at = now;
                    self.store.update_record(&mut tx, &d).await?;
                    info!(owner = owner_id, record = %d.id, "hawl period complete");
                    EvaluationOutcome::HawlCompleted { record_id: d.id }
                } else {
                    EvaluationOutcome::NoAction
                }
            }
        };

        tx.commit().await?;
        Ok(EvaluationReport {
            owner_id: owner_id.to_string(),
            outcome,
            reconciled,
            zakatable_wealth: summary.zakatable,
            threshold: current_threshold,
        })
    }

    /// One reconciliation pass over every known user. Per-user failures
    /// are recorded and do not stop the sweep.
    pub async fn run_sweep(&self, actor_id: &str) -> Result<SweepSummary, CoreError> {
        let owners = self.store.distinct_owner_ids().await?;
        let mut summary = SweepSummary::default();
        for owner_id in owners {
            summary.users_processed += 1;
            match self.reconcile(&owner_id, actor_id).await {
                Ok(report) => {
                    if report.reconciled {
                        summary.reconciled += 1;
                    }
                    match report.outcome {
                        EvaluationOutcome::DraftCreated { .. }
                        | EvaluationOutcome::HawlStarted { .. } => summary.achieved += 1,
                        EvaluationOutcome::Interrupted { .. } => summary.interrupted += 1,
                        EvaluationOutcome::HawlCompleted { .. } => summary.completed += 1,
                        EvaluationOutcome::NoAction => {}
                    }
                }
                Err(err) => {
                    warn!(owner = %owner_id, error = %err, "reconciliation failed for user");
                    summary.errors.push(SweepError {
                        owner_id,
                        message: err.to_string(),
                    });
                }
            }
        }
        info!(
            users = summary.users_processed,
            reconciled = summary.reconciled,
            achieved = summary.achieved,
            interrupted = summary.interrupted,
            completed = summary.completed,
            errors = summary.errors.len(),
            "reconciliation sweep finished"
        );
        Ok(summary)
    }
}
