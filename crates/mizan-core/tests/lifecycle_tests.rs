//! Integration tests for the record lifecycle manager and audit trail.
//!
//! Tests cover:
//!  1. Manual creation and deferred Hawl start
//!  2. Update rules (notes, status-field rejection, ownership)
//!  3. Finalization (completion gate, override, zakat math)
//!  4. Unlock / re-finalize cycle
//!  5. Deletion rules
//!  6. Snapshot round-trip and at-rest opacity
//!  7. Progress reporting
//!  8. Audit integrity findings

use std::sync::Arc;

use chrono::{Duration, Utc};
use mizan_core::engine::{EvaluationOutcome, HawlEngine};
use mizan_core::error::CoreError;
use mizan_core::lifecycle::{NewRecord, RecordService, RecordUpdate};
use mizan_core::models::{AuditEventType, HawlState, NisabYearRecordRow, RecordStatus, HAWL_DAYS};
use mizan_core::nisab::{self, StaticPrices};
use mizan_core::store::{ListFilter, Store};
use mizan_core::vault::Vault;
use tempfile::tempdir;

const OWNER: &str = "user-1";
const GOLD_PER_GRAM: f64 = 65.0;

async fn open_store(dir: &std::path::Path) -> Store {
    let vault = Vault::new();
    vault.unlock_with_key([9u8; 32]).await;
    Store::open(&dir.join("mizan.db"), vault).await.unwrap()
}

fn prices() -> Arc<StaticPrices> {
    Arc::new(StaticPrices {
        gold_per_gram: GOLD_PER_GRAM,
        silver_per_gram: 0.85,
    })
}

fn service(store: &Store) -> RecordService {
    RecordService::new(store.clone(), prices())
}

fn engine(store: &Store) -> HawlEngine {
    HawlEngine::new(store.clone(), prices())
}

async fn insert_asset(store: &Store, id: &str, value: f64, modifier: f64) {
    sqlx::query(
        "INSERT INTO assets (id, owner_id, name, category, value, zakatable_modifier, active, created_at) \
         VALUES (?, ?, ?, 'CASH', ?, ?, TRUE, ?)",
    )
    .bind(id)
    .bind(OWNER)
    .bind(id)
    .bind(value)
    .bind(modifier)
    .bind(Utc::now())
    .execute(&store.pool)
    .await
    .unwrap();
}

/// Shift a record's Hawl window back so completion already passed.
async fn backdate_hawl(store: &Store, record_id: &str, days_ago: i64) {
    let start = Utc::now() - Duration::days(days_ago);
    sqlx::query(
        "UPDATE nisab_year_records SET hawl_start_date = ?, hawl_completion_date = ? WHERE id = ?",
    )
    .bind(start)
    .bind(start + Duration::days(HAWL_DAYS))
    .bind(record_id)
    .execute(&store.pool)
    .await
    .unwrap();
}

/// Create a finalized record: draft via the engine, window backdated
/// past completion, then finalized.
async fn finalized_record(store: &Store) -> NisabYearRecordRow {
    insert_asset(store, "cash", 8000.0, 1.0).await;
    let report = engine(store).evaluate(OWNER, OWNER).await.unwrap();
    let record_id = match report.outcome {
        EvaluationOutcome::DraftCreated { record_id } => record_id,
        other => panic!("expected DraftCreated, got {other:?}"),
    };
    backdate_hawl(store, &record_id, HAWL_DAYS + 1).await;
    service(store)
        .finalize(OWNER, OWNER, &record_id, false)
        .await
        .unwrap()
}

// ─── Test 1: Manual creation ────────────────────────────────────────────────

#[tokio::test]
async fn manual_draft_starts_hawl_only_when_threshold_holds() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let service = service(&store);
    insert_asset(&store, "cash", 6000.0, 1.0).await;

    let record = service
        .create(OWNER, OWNER, NewRecord::default())
        .await
        .unwrap();
    assert_eq!(record.status, RecordStatus::Draft);
    assert_eq!(record.hawl_state(), HawlState::NotStarted);
    assert!(record.hawl_start_date.is_none());

    // finalizing before the clock even started is a state error
    let err = service.finalize(OWNER, OWNER, &record.id, true).await.unwrap_err();
    assert!(matches!(err, CoreError::HawlNotStarted(_)), "got {err:?}");

    // the next state-machine pass stamps the start
    let report = engine(&store).evaluate(OWNER, OWNER).await.unwrap();
    assert_eq!(
        report.outcome,
        EvaluationOutcome::HawlStarted {
            record_id: record.id.clone()
        }
    );
    let record = service.get(OWNER, &record.id).await.unwrap();
    assert_eq!(record.hawl_state(), HawlState::Active);
}

#[tokio::test]
async fn second_manual_draft_is_rejected() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let service = service(&store);
    insert_asset(&store, "cash", 6000.0, 1.0).await;

    service.create(OWNER, OWNER, NewRecord::default()).await.unwrap();
    let err = service
        .create(OWNER, OWNER, NewRecord::default())
        .await
        .unwrap_err();
    assert!(err.is_duplicate_draft(), "got {err:?}");
}

// ─── Test 2: Updates ────────────────────────────────────────────────────────

#[tokio::test]
async fn update_edits_notes_and_audits() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let service = service(&store);
    insert_asset(&store, "cash", 6000.0, 1.0).await;
    let record = service.create(OWNER, OWNER, NewRecord::default()).await.unwrap();

    let updated = service
        .update(
            OWNER,
            OWNER,
            &record.id,
            RecordUpdate {
                notes: Some("adjusted after salary review".into()),
                status: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.notes.as_deref(), Some("adjusted after salary review"));

    let events: Vec<AuditEventType> = service
        .audit()
        .rows_for(&record.id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.event_type)
        .collect();
    assert_eq!(events, vec![AuditEventType::Created, AuditEventType::Edited]);
}

#[tokio::test]
async fn status_field_writes_are_always_rejected() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let service = service(&store);
    insert_asset(&store, "cash", 6000.0, 1.0).await;
    let record = service.create(OWNER, OWNER, NewRecord::default()).await.unwrap();

    // on a DRAFT
    let err = service
        .update(
            OWNER,
            OWNER,
            &record.id,
            RecordUpdate {
                notes: None,
                status: Some("FINALIZED".into()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StatusFieldWrite), "got {err:?}");
    let reloaded = service.get(OWNER, &record.id).await.unwrap();
    assert_eq!(reloaded.status, RecordStatus::Draft);
}

#[tokio::test]
async fn finalized_records_reject_edits() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let record = finalized_record(&store).await;
    let service = service(&store);

    let err = service
        .update(
            OWNER,
            OWNER,
            &record.id,
            RecordUpdate {
                notes: Some("should not land".into()),
                status: None,
            },
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, CoreError::NotEditable(RecordStatus::Finalized)),
        "got {err:?}"
    );

    // the status field is rejected here too, before any state check
    let err = service
        .update(
            OWNER,
            OWNER,
            &record.id,
            RecordUpdate {
                notes: None,
                status: Some("DRAFT".into()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StatusFieldWrite), "got {err:?}");
}

#[tokio::test]
async fn ownership_is_enforced_on_every_operation() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let service = service(&store);
    insert_asset(&store, "cash", 6000.0, 1.0).await;
    let record = service.create(OWNER, OWNER, NewRecord::default()).await.unwrap();

    let err = service.get("intruder", &record.id).await.unwrap_err();
    assert!(matches!(err, CoreError::NotOwner(_)), "got {err:?}");
    let err = service
        .update("intruder", "intruder", &record.id, RecordUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotOwner(_)), "got {err:?}");
    let err = service
        .delete("intruder", "intruder", &record.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotOwner(_)), "got {err:?}");
}

// ─── Test 3: Finalization ───────────────────────────────────────────────────

#[tokio::test]
async fn finalize_before_completion_needs_override() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let service = service(&store);
    insert_asset(&store, "cash", 6000.0, 1.0).await;

    let report = engine(&store).evaluate(OWNER, OWNER).await.unwrap();
    let record_id = match report.outcome {
        EvaluationOutcome::DraftCreated { record_id } => record_id,
        other => panic!("expected DraftCreated, got {other:?}"),
    };

    let err = service.finalize(OWNER, OWNER, &record_id, false).await.unwrap_err();
    assert!(matches!(err, CoreError::HawlIncomplete { .. }), "got {err:?}");

    let record = service.finalize(OWNER, OWNER, &record_id, true).await.unwrap();
    assert_eq!(record.status, RecordStatus::Finalized);
    assert!(record.finalized_at.is_some());
}

#[tokio::test]
async fn finalize_after_completion_computes_zakat() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let service = service(&store);
    insert_asset(&store, "cash", 6000.0, 1.0).await;
    insert_asset(&store, "shares", 2000.0, 0.5).await;

    let report = engine(&store).evaluate(OWNER, OWNER).await.unwrap();
    let record_id = match report.outcome {
        EvaluationOutcome::DraftCreated { record_id } => record_id,
        other => panic!("expected DraftCreated, got {other:?}"),
    };
    // completion passed yesterday
    backdate_hawl(&store, &record_id, HAWL_DAYS + 1).await;

    let record = service.finalize(OWNER, OWNER, &record_id, false).await.unwrap();
    assert_eq!(record.status, RecordStatus::Finalized);
    assert_eq!(record.zakatable_wealth, 7000.0);
    assert_eq!(record.zakat_amount, Some(nisab::zakat_due(7000.0)));
    assert_eq!(record.zakat_amount, Some(175.0));
    assert_eq!(record.hawl_state(), HawlState::Complete);
}

// ─── Test 4: Unlock / re-finalize ───────────────────────────────────────────

#[tokio::test]
async fn unlock_rejects_non_finalized_records() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let service = service(&store);
    insert_asset(&store, "cash", 6000.0, 1.0).await;
    let record = service.create(OWNER, OWNER, NewRecord::default()).await.unwrap();

    let err = service
        .unlock(OWNER, OWNER, &record.id, "correcting a typo in notes")
        .await
        .unwrap_err();
    assert!(
        matches!(err, CoreError::NotFinalized(RecordStatus::Draft)),
        "got {err:?}"
    );
    assert!(err.to_string().contains("Only FINALIZED records can be unlocked"));
}

#[tokio::test]
async fn unlock_requires_a_substantial_reason() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let record = finalized_record(&store).await;
    let service = service(&store);

    let err = service.unlock(OWNER, OWNER, &record.id, "typo").await.unwrap_err();
    assert!(
        matches!(err, CoreError::ReasonTooShort { min: 10, got: 4 }),
        "got {err:?}"
    );

    let unlocked = service
        .unlock(OWNER, OWNER, &record.id, "missed an asset sale in March")
        .await
        .unwrap();
    assert_eq!(unlocked.status, RecordStatus::Unlocked);
    assert!(unlocked.unlocked_at.is_some());

    // the stored reason is ciphertext that decrypts back
    let enc = unlocked.unlock_reason_enc.as_deref().unwrap();
    assert!(!enc.contains("asset sale"));
    let plain = store
        .decrypt_value(enc, mizan_core::store::REASON_AAD)
        .await
        .unwrap();
    assert_eq!(plain, b"missed an asset sale in March");
}

#[tokio::test]
async fn refinalize_returns_to_finalized_with_clean_trail() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let record = finalized_record(&store).await;
    let service = service(&store);

    service
        .unlock(OWNER, OWNER, &record.id, "missed an asset sale in March")
        .await
        .unwrap();
    service
        .update(
            OWNER,
            OWNER,
            &record.id,
            RecordUpdate {
                notes: Some("corrected".into()),
                status: None,
            },
        )
        .await
        .unwrap();
    let refinalized = service.finalize(OWNER, OWNER, &record.id, false).await.unwrap();
    assert_eq!(refinalized.status, RecordStatus::Finalized);

    let events: Vec<AuditEventType> = service
        .audit()
        .rows_for(&record.id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.event_type)
        .collect();
    assert_eq!(
        events,
        vec![
            AuditEventType::Created,
            AuditEventType::NisabAchieved,
            AuditEventType::Finalized,
            AuditEventType::Unlocked,
            AuditEventType::Edited,
            AuditEventType::Refinalized,
        ]
    );
    let report = service.audit().integrity_check(&record.id).await.unwrap();
    assert!(report.is_clean(), "unexpected findings: {:?}", report.findings);
}

// ─── Test 5: Deletion ───────────────────────────────────────────────────────

#[tokio::test]
async fn only_drafts_can_be_deleted() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let record = finalized_record(&store).await;
    let service = service(&store);

    let err = service.delete(OWNER, OWNER, &record.id).await.unwrap_err();
    assert!(
        matches!(err, CoreError::NotDraft(RecordStatus::Finalized)),
        "got {err:?}"
    );

    let draft = service.create(OWNER, OWNER, NewRecord::default()).await.unwrap();
    service.delete(OWNER, OWNER, &draft.id).await.unwrap();
    let err = service.get(OWNER, &draft.id).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)), "got {err:?}");
}

// ─── Test 6: Snapshot ───────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_roundtrip_and_internal_consistency() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let service = service(&store);
    insert_asset(&store, "cash", 6000.0, 1.0).await;
    insert_asset(&store, "shares", 2000.0, 0.5).await;

    let record = service.create(OWNER, OWNER, NewRecord::default()).await.unwrap();

    // opaque at rest
    assert!(!record.snapshot_enc.contains("cash"));
    assert!(!record.snapshot_enc.contains("zakatable"));

    let snapshot = service.snapshot(OWNER, &record.id).await.unwrap();
    assert_eq!(snapshot.assets.len(), 2);
    let total: f64 = snapshot.assets.iter().map(|a| a.value).sum();
    let zakatable: f64 = snapshot.assets.iter().map(|a| a.zakatable_value).sum();
    assert_eq!(snapshot.total_wealth, total);
    assert_eq!(snapshot.zakatable_wealth, zakatable);
    assert_eq!(snapshot.total_wealth, 8000.0);
    assert_eq!(snapshot.zakatable_wealth, 7000.0);
}

// ─── Test 7: Progress ───────────────────────────────────────────────────────

#[tokio::test]
async fn progress_reflects_elapsed_days_and_estimate() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let service = service(&store);
    insert_asset(&store, "cash", 6000.0, 1.0).await;

    let report = engine(&store).evaluate(OWNER, OWNER).await.unwrap();
    let record_id = match report.outcome {
        EvaluationOutcome::DraftCreated { record_id } => record_id,
        other => panic!("expected DraftCreated, got {other:?}"),
    };
    backdate_hawl(&store, &record_id, 100).await;

    let progress = service.progress(OWNER, &record_id).await.unwrap().unwrap();
    assert_eq!(progress.days_elapsed, 100);
    assert_eq!(progress.days_remaining, HAWL_DAYS - 100);
    assert_eq!(progress.estimated_zakat, 150.0);
    assert!(progress.percent_of_threshold > 100.0);
}

// ─── Test 8: Audit integrity ────────────────────────────────────────────────

#[tokio::test]
async fn integrity_check_flags_suspicious_transition() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let record = finalized_record(&store).await;
    let service = service(&store);

    // simulate a rogue writer appending an edit to a finalized trail
    service
        .audit()
        .record(
            "rogue-writer",
            AuditEventType::Edited,
            &record.id,
            Default::default(),
        )
        .await
        .unwrap();

    let report = service.audit().integrity_check(&record.id).await.unwrap();
    assert_eq!(report.findings.len(), 1);
    assert!(matches!(
        report.findings[0],
        mizan_core::audit::IntegrityFinding::SuspiciousTransition {
            from: AuditEventType::Finalized,
            to: AuditEventType::Edited,
            ..
        }
    ));
}

#[tokio::test]
async fn integrity_check_flags_rewound_timestamps() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let record = finalized_record(&store).await;
    let service = service(&store);

    // tamper: rewind the last entry's clock by an hour
    sqlx::query(
        "UPDATE audit_trail SET created_at = ? WHERE record_id = ? \
         AND seq = (SELECT MAX(seq) FROM audit_trail WHERE record_id = ?)",
    )
    .bind(Utc::now() - Duration::hours(1))
    .bind(&record.id)
    .bind(&record.id)
    .execute(&store.pool)
    .await
    .unwrap();

    let report = service.audit().integrity_check(&record.id).await.unwrap();
    assert!(report
        .findings
        .iter()
        .any(|f| matches!(
            f,
            mizan_core::audit::IntegrityFinding::NonMonotonicTimestamp { .. }
        )));
}

// ─── Listing ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn list_filters_by_status_and_date() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let record = finalized_record(&store).await;
    let service = service(&store);
    service.create(OWNER, OWNER, NewRecord::default()).await.unwrap();

    let all = service.list(OWNER, &ListFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let finalized = service
        .list(
            OWNER,
            &ListFilter {
                status: Some(RecordStatus::Finalized),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].id, record.id);

    let none = service
        .list(
            OWNER,
            &ListFilter {
                created_to: Some(Utc::now() - Duration::days(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(none.is_empty());
}
