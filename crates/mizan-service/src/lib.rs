//! mizan-service — configuration, price client and the reconciliation
//! loop. The binary in `main.rs` wires these together; the modules are
//! exposed so integration tests can drive them directly.

pub mod config;
pub mod job;
pub mod prices;
