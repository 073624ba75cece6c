//! Append-only audit trail with encrypted payloads.
//!
//! Entries are created strictly in response to a state transition and
//! are never updated or deleted. Each sensitive payload field is
//! encrypted independently: one undecryptable field (legacy data, key
//! rotation accidents) must not block reading the rest of the entry.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;
use tracing::warn;
use uuid::Uuid;

use crate::error::{CoreError, MIN_UNLOCK_REASON_LEN};
use crate::models::{AuditEventType, AuditTrailRow};
use crate::store::{Store, AUDIT_AAD};

/// Optional payloads attached to an audit entry.
#[derive(Debug, Clone, Default)]
pub struct AuditDetails {
    pub reason: Option<String>,
    pub changes_summary: Option<String>,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub interruption: Option<Value>,
}

/// Decrypted view of an entry. Payload fields decode independently;
/// a field that fails to decrypt reads as None.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub seq: i64,
    pub id: String,
    pub record_id: String,
    pub actor_id: String,
    pub event_type: AuditEventType,
    pub created_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub changes_summary: Option<String>,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub interruption: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityFinding {
    /// Entry timestamp precedes the one written before it.
    NonMonotonicTimestamp {
        seq: i64,
        prev: DateTime<Utc>,
        current: DateTime<Utc>,
    },
    /// Consecutive event types outside the allowed-transition table.
    SuspiciousTransition {
        seq: i64,
        from: AuditEventType,
        to: AuditEventType,
    },
}

/// Result of an integrity pass. Findings are reported, never thrown.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub record_id: String,
    pub entries_checked: usize,
    pub findings: Vec<IntegrityFinding>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Which event may directly follow which in one record's trail.
/// `HAWL_INTERRUPTED` is terminal: the DRAFT is gone afterwards.
fn transition_allowed(prev: AuditEventType, next: AuditEventType) -> bool {
    use AuditEventType::*;
    match prev {
        Created => matches!(next, NisabAchieved | Edited | HawlInterrupted | Finalized),
        NisabAchieved => matches!(next, Edited | HawlInterrupted | Finalized),
        Edited => matches!(next, Edited | NisabAchieved | HawlInterrupted | Finalized | Refinalized),
        HawlInterrupted => false,
        Finalized => matches!(next, Unlocked),
        Unlocked => matches!(next, Edited | Refinalized),
        Refinalized => matches!(next, Unlocked),
    }
}

#[derive(Clone)]
pub struct AuditTrail {
    store: Store,
}

impl AuditTrail {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append an entry on its own connection.
    pub async fn record(
        &self,
        actor_id: &str,
        event_type: AuditEventType,
        record_id: &str,
        details: AuditDetails,
    ) -> Result<AuditTrailRow, CoreError> {
        let mut conn = self.store.pool.acquire().await?;
        self.record_in(&mut conn, actor_id, event_type, record_id, details)
            .await
    }

    /// Append an entry inside the caller's transaction, so the entry
    /// commits or rolls back together with the transition it records.
    pub async fn record_in(
        &self,
        conn: &mut SqliteConnection,
        actor_id: &str,
        event_type: AuditEventType,
        record_id: &str,
        details: AuditDetails,
    ) -> Result<AuditTrailRow, CoreError> {
        if event_type == AuditEventType::Unlocked {
            let len = details.reason.as_deref().map(str::len).unwrap_or(0);
            if len < MIN_UNLOCK_REASON_LEN {
                return Err(CoreError::ReasonTooShort {
                    min: MIN_UNLOCK_REASON_LEN,
                    got: len,
                });
            }
        }

        let reason_enc = self.encrypt_opt_str(details.reason.as_deref()).await?;
        let changes_enc = self
            .encrypt_opt_str(details.changes_summary.as_deref())
            .await?;
        let before_state_enc = self.encrypt_opt_json(details.before_state.as_ref()).await?;
        let after_state_enc = self.encrypt_opt_json(details.after_state.as_ref()).await?;
        let interruption_enc = self.encrypt_opt_json(details.interruption.as_ref()).await?;

        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO audit_trail (\
                id, record_id, actor_id, event_type, reason_enc, changes_enc, \
                before_state_enc, after_state_enc, interruption_enc, created_at\
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(record_id)
        .bind(actor_id)
        .bind(event_type)
        .bind(&reason_enc)
        .bind(&changes_enc)
        .bind(&before_state_enc)
        .bind(&after_state_enc)
        .bind(&interruption_enc)
        .bind(created_at)
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query_as::<_, AuditTrailRow>("SELECT * FROM audit_trail WHERE id = ?")
            .bind(&id)
            .fetch_one(conn)
            .await?;
        Ok(row)
    }

    /// Raw (still-encrypted) rows for one record, in write order.
    pub async fn rows_for(&self, record_id: &str) -> Result<Vec<AuditTrailRow>, CoreError> {
        let rows = sqlx::query_as::<_, AuditTrailRow>(
            "SELECT * FROM audit_trail WHERE record_id = ? ORDER BY seq",
        )
        .bind(record_id)
        .fetch_all(&self.store.pool)
        .await?;
        Ok(rows)
    }

    /// Decrypted entries for one record, in write order.
    pub async fn entries_for(&self, record_id: &str) -> Result<Vec<AuditEntry>, CoreError> {
        let rows = self.rows_for(record_id).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(self.decrypt_entry(row).await);
        }
        Ok(entries)
    }

    /// Walk one record's trail and flag chronology violations and
    /// transitions outside the allowed table. Findings are data, not
    /// errors.
    pub async fn integrity_check(&self, record_id: &str) -> Result<IntegrityReport, CoreError> {
        let rows = self.rows_for(record_id).await?;
        let mut findings = Vec::new();
        for pair in rows.windows(2) {
            let (prev, current) = (&pair[0], &pair[1]);
            if current.created_at < prev.created_at {
                findings.push(IntegrityFinding::NonMonotonicTimestamp {
                    seq: current.seq,
                    prev: prev.created_at,
                    current: current.created_at,
                });
            }
            if !transition_allowed(prev.event_type, current.event_type) {
                findings.push(IntegrityFinding::SuspiciousTransition {
                    seq: current.seq,
                    from: prev.event_type,
                    to: current.event_type,
                });
            }
        }
        Ok(IntegrityReport {
            record_id: record_id.to_string(),
            entries_checked: rows.len(),
            findings,
        })
    }

    async fn encrypt_opt_str(&self, value: Option<&str>) -> Result<Option<String>, CoreError> {
        match value {
            Some(v) => Ok(Some(self.store.encrypt_value(v.as_bytes(), AUDIT_AAD).await?)),
            None => Ok(None),
        }
    }

    async fn encrypt_opt_json(&self, value: Option<&Value>) -> Result<Option<String>, CoreError> {
        match value {
            Some(v) => {
                let bytes = serde_json::to_vec(v)?;
                Ok(Some(self.store.encrypt_value(&bytes, AUDIT_AAD).await?))
            }
            None => Ok(None),
        }
    }

    async fn decrypt_entry(&self, row: AuditTrailRow) -> AuditEntry {
        AuditEntry {
            reason: self.decrypt_str_field(&row, row.reason_enc.as_deref(), "reason").await,
            changes_summary: self
                .decrypt_str_field(&row, row.changes_enc.as_deref(), "changes_summary")
                .await,
            before_state: self
                .decrypt_json_field(&row, row.before_state_enc.as_deref(), "before_state")
                .await,
            after_state: self
                .decrypt_json_field(&row, row.after_state_enc.as_deref(), "after_state")
                .await,
            interruption: self
                .decrypt_json_field(&row, row.interruption_enc.as_deref(), "interruption")
                .await,
            seq: row.seq,
            id: row.id,
            record_id: row.record_id,
            actor_id: row.actor_id,
            event_type: row.event_type,
            created_at: row.created_at,
        }
    }

    async fn decrypt_str_field(
        &self,
        row: &AuditTrailRow,
        ciphertext: Option<&str>,
        field: &str,
    ) -> Option<String> {
        let ct = ciphertext?;
        match self.store.decrypt_value(ct, AUDIT_AAD).await {
            Ok(bytes) => String::from_utf8(bytes).ok(),
            Err(err) => {
                warn!(entry = %row.id, field, error = %err, "audit field failed to decrypt");
                None
            }
        }
    }

    async fn decrypt_json_field(
        &self,
        row: &AuditTrailRow,
        ciphertext: Option<&str>,
        field: &str,
    ) -> Option<Value> {
        let ct = ciphertext?;
        match self.store.decrypt_value(ct, AUDIT_AAD).await {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(err) => {
                warn!(entry = %row.id, field, error = %err, "audit field failed to decrypt");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AuditEventType::*;

    #[test]
    fn allowed_transitions() {
        assert!(transition_allowed(Created, NisabAchieved));
        assert!(transition_allowed(NisabAchieved, HawlInterrupted));
        assert!(transition_allowed(NisabAchieved, Finalized));
        assert!(transition_allowed(Finalized, Unlocked));
        assert!(transition_allowed(Unlocked, Edited));
        assert!(transition_allowed(Unlocked, Refinalized));
        assert!(transition_allowed(Edited, Refinalized));
        assert!(transition_allowed(Refinalized, Unlocked));
    }

    #[test]
    fn suspicious_transitions() {
        // a finalized record must be unlocked before edits
        assert!(!transition_allowed(Finalized, Edited));
        assert!(!transition_allowed(Finalized, Finalized));
        // interruption removes the record; nothing may follow
        assert!(!transition_allowed(HawlInterrupted, Edited));
        assert!(!transition_allowed(HawlInterrupted, NisabAchieved));
        // achievement cannot repeat without an edit in between
        assert!(!transition_allowed(NisabAchieved, NisabAchieved));
        assert!(!transition_allowed(Created, Refinalized));
    }
}
