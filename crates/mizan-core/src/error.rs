use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::models::RecordStatus;
use crate::nisab::PriceError;

/// Unlock reasons shorter than this are rejected.
pub const MIN_UNLOCK_REASON_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Vault is locked — unlock with password first")]
    VaultLocked,

    #[error("Price source error: {0}")]
    Price(#[from] PriceError),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record {0} does not belong to the requesting user")]
    NotOwner(String),

    #[error("A DRAFT record already exists for user {0}")]
    DuplicateDraft(String),

    #[error("Unknown nisab basis: {0}")]
    InvalidBasis(String),

    #[error("Unknown record status: {0}")]
    InvalidStatus(String),

    #[error("Unknown audit event type: {0}")]
    InvalidEventType(String),

    #[error("Only DRAFT or UNLOCKED records can be edited (record is {0})")]
    NotEditable(RecordStatus),

    #[error("Only DRAFT records can be deleted (record is {0})")]
    NotDraft(RecordStatus),

    #[error("Only FINALIZED records can be unlocked (record is {0})")]
    NotFinalized(RecordStatus),

    #[error("Only DRAFT or UNLOCKED records can be finalized (record is {0})")]
    NotFinalizable(RecordStatus),

    #[error("Hawl has not started for record {0}")]
    HawlNotStarted(String),

    #[error("Hawl is not complete until {completion}; pass the override to finalize early")]
    HawlIncomplete { completion: DateTime<Utc> },

    #[error("The status field cannot be written directly; use finalize or unlock")]
    StatusFieldWrite,

    #[error("Unlock reason must be at least {min} characters (got {got})")]
    ReasonTooShort { min: usize, got: usize },
}

impl CoreError {
    /// True for errors caused by a concurrent writer winning the race on
    /// the one-DRAFT-per-owner index.
    pub fn is_duplicate_draft(&self) -> bool {
        match self {
            CoreError::DuplicateDraft(_) => true,
            CoreError::Database(sqlx::Error::Database(db)) => {
                matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
            }
            _ => false,
        }
    }
}
