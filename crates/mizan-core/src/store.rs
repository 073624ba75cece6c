//! Store abstraction over SQLite via sqlx.
//!
//! WAL journal mode and foreign-key enforcement are configured at
//! connection time, not inside a migration: SQLite forbids changing
//! `journal_mode` inside a transaction and sqlx wraps every migration
//! in one.
//!
//! Encrypted columns only ever see base64 AEAD ciphertext; plaintext
//! never crosses this boundary.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::error::CoreError;
use crate::models::{NisabBasis, NisabYearRecordRow, RecordStatus};
use crate::vault::Vault;

/// AAD for the encrypted asset snapshot column.
pub const SNAPSHOT_AAD: &[u8] = b"mizan-snapshot-v1";
/// AAD for encrypted audit trail payload columns.
pub const AUDIT_AAD: &[u8] = b"mizan-audit-v1";
/// AAD for the encrypted unlock reason on a record.
pub const REASON_AAD: &[u8] = b"mizan-reason-v1";

/// Filters for listing records.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<RecordStatus>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

/// Central store handle.  Cheap to clone (Arc internally).
#[derive(Clone)]
pub struct Store {
    pub pool: SqlitePool,
    pub vault: Vault,
}

impl Store {
    /// Open (or create) the SQLite database at `db_path`.
    /// Runs all pending migrations automatically.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, CoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| CoreError::Database(sqlx::Error::Migrate(Box::new(e))))?;

        Ok(Self { pool, vault })
    }

    // ── Encryption helpers ──────────────────────────────────────────────

    /// Encrypt a plaintext value with the vault key.
    pub async fn encrypt_value(&self, plaintext: &[u8], aad: &[u8]) -> Result<String, CoreError> {
        let aad = aad.to_vec();
        let plaintext = plaintext.to_vec();
        self.vault
            .with_key(move |key| {
                let ct = crate::crypto::encrypt(key, &plaintext, &aad)?;
                Ok(URL_SAFE_NO_PAD.encode(ct))
            })
            .await
    }

    /// Decrypt a vault-encrypted value.
    pub async fn decrypt_value(&self, b64: &str, aad: &[u8]) -> Result<Vec<u8>, CoreError> {
        let ct = URL_SAFE_NO_PAD
            .decode(b64)
            .map_err(crate::crypto::CryptoError::Base64Decode)?;
        let aad = aad.to_vec();
        self.vault
            .with_key(move |key| {
                let pt = crate::crypto::decrypt(key, &ct, &aad)?;
                Ok(pt.to_vec())
            })
            .await
    }

    // ── User settings ───────────────────────────────────────────────────

    /// Preferred basis and currency for a user; GOLD/USD when unset.
    pub async fn user_settings(&self, owner_id: &str) -> Result<(NisabBasis, String), CoreError> {
        let row: Option<(NisabBasis, String)> =
            sqlx::query_as("SELECT basis, currency FROM user_settings WHERE owner_id = ?")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.unwrap_or((NisabBasis::Gold, "USD".to_string())))
    }

    pub async fn set_user_settings(
        &self,
        owner_id: &str,
        basis: NisabBasis,
        currency: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO user_settings (owner_id, basis, currency) VALUES (?, ?, ?) \
             ON CONFLICT(owner_id) DO UPDATE SET basis = excluded.basis, currency = excluded.currency",
        )
        .bind(owner_id)
        .bind(basis)
        .bind(currency)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every user the reconciliation sweep must visit: anyone with
    /// assets or an existing record.
    pub async fn distinct_owner_ids(&self) -> Result<Vec<String>, CoreError> {
        let owners: Vec<String> = sqlx::query_scalar(
            "SELECT owner_id FROM assets UNION SELECT owner_id FROM nisab_year_records ORDER BY owner_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(owners)
    }

    // ── Record rows ─────────────────────────────────────────────────────

    pub async fn insert_record(
        &self,
        conn: &mut SqliteConnection,
        row: &NisabYearRecordRow,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO nisab_year_records (\
                id, owner_id, basis, status, currency, nisab_threshold_at_start, \
                hawl_start_date, hawl_completion_date, hawl_completed_at, \
                total_wealth, zakatable_wealth, zakat_amount, snapshot_enc, \
                unlock_reason_enc, notes, finalized_at, unlocked_at, created_at, updated_at\
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.owner_id)
        .bind(row.basis)
        .bind(row.status)
        .bind(&row.currency)
        .bind(row.nisab_threshold_at_start)
        .bind(row.hawl_start_date)
        .bind(row.hawl_completion_date)
        .bind(row.hawl_completed_at)
        .bind(row.total_wealth)
        .bind(row.zakatable_wealth)
        .bind(row.zakat_amount)
        .bind(&row.snapshot_enc)
        .bind(&row.unlock_reason_enc)
        .bind(&row.notes)
        .bind(row.finalized_at)
        .bind(row.unlocked_at)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(conn)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) {
                    return CoreError::DuplicateDraft(row.owner_id.clone());
                }
            }
            CoreError::Database(e)
        })?;
        Ok(())
    }

    /// The owner's current DRAFT, read inside the caller's transaction.
    pub async fn draft_for_owner(
        &self,
        conn: &mut SqliteConnection,
        owner_id: &str,
    ) -> Result<Option<NisabYearRecordRow>, CoreError> {
        let row = sqlx::query_as::<_, NisabYearRecordRow>(
            "SELECT * FROM nisab_year_records WHERE owner_id = ? AND status = 'DRAFT'",
        )
        .bind(owner_id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    pub async fn record_by_id(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<Option<NisabYearRecordRow>, CoreError> {
        let row = sqlx::query_as::<_, NisabYearRecordRow>(
            "SELECT * FROM nisab_year_records WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    pub async fn get_record(&self, id: &str) -> Result<Option<NisabYearRecordRow>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        self.record_by_id(&mut conn, id).await
    }

    pub async fn list_records(
        &self,
        owner_id: &str,
        filter: &ListFilter,
    ) -> Result<Vec<NisabYearRecordRow>, CoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM nisab_year_records WHERE owner_id = ");
        qb.push_bind(owner_id);
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status);
        }
        if let Some(from) = filter.created_from {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.created_to {
            qb.push(" AND created_at <= ").push_bind(to);
        }
        qb.push(" ORDER BY created_at DESC");
        let rows = qb
            .build_query_as::<NisabYearRecordRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Write the mutable columns of a record back. The identity columns
    /// and `nisab_threshold_at_start` are immutable by construction:
    /// this statement never touches them.
    pub async fn update_record(
        &self,
        conn: &mut SqliteConnection,
        row: &NisabYearRecordRow,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE nisab_year_records SET \
                status = ?, hawl_start_date = ?, hawl_completion_date = ?, \
                hawl_completed_at = ?, total_wealth = ?, zakatable_wealth = ?, \
                zakat_amount = ?, snapshot_enc = ?, unlock_reason_enc = ?, \
                notes = ?, finalized_at = ?, unlocked_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(row.status)
        .bind(row.hawl_start_date)
        .bind(row.hawl_completion_date)
        .bind(row.hawl_completed_at)
        .bind(row.total_wealth)
        .bind(row.zakatable_wealth)
        .bind(row.zakat_amount)
        .bind(&row.snapshot_enc)
        .bind(&row.unlock_reason_enc)
        .bind(&row.notes)
        .bind(row.finalized_at)
        .bind(row.unlocked_at)
        .bind(row.updated_at)
        .bind(&row.id)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn delete_record(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM nisab_year_records WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }
}
