//! mizan-core — Nisab threshold and Hawl holding-period tracking.
//!
//! The core is a library: an HTTP layer (out of scope here) drives the
//! record lifecycle, and a service binary runs the reconciliation
//! sweep. Two independent writers — the synchronous asset-mutation
//! handler and the hourly sweep — funnel through one transactional
//! evaluate-and-apply function so they can never disagree about a
//! user's DRAFT record.
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt.  We use application-level
//! encryption:
//! - Sensitive columns (asset snapshots, audit payloads, unlock
//!   reasons) are stored as XChaCha20-Poly1305 ciphertext,
//!   base64-encoded.
//! - The vault key is derived from the service password via Argon2id
//!   and held in memory only while the service runs.
//! - Non-sensitive metadata (timestamps, owner IDs, statuses, wealth
//!   totals) is stored in plaintext to allow efficient queries.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on first open.

pub mod audit;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod nisab;
pub mod store;
pub mod vault;
pub mod wealth;

pub use audit::AuditTrail;
pub use engine::HawlEngine;
pub use error::CoreError;
pub use lifecycle::RecordService;
pub use store::Store;
pub use vault::Vault;
