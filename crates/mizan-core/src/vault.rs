//! Vault: in-memory key material for at-rest field encryption.
//!
//! The vault holds the 32-byte column encryption key in memory. The
//! service unlocks it once at startup from a password and the stored
//! salt; tests unlock it with a raw key. Locking zeroizes the key.

use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use crate::crypto::{self, CryptoError};
use crate::error::CoreError;

#[derive(ZeroizeOnDrop)]
struct VaultInner {
    key: [u8; 32],
}

/// Thread-safe vault handle.  Clone to share across tasks.
#[derive(Clone)]
pub struct Vault {
    inner: Arc<RwLock<Option<VaultInner>>>,
}

impl Vault {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Unlock with a password and the deployment salt. Call once before
    /// any store read/write that touches encrypted columns.
    pub async fn unlock(&self, password: &[u8], salt: &[u8]) -> Result<(), CryptoError> {
        let key = crypto::derive_key(password, salt)?;
        let mut guard = self.inner.write().await;
        *guard = Some(VaultInner { key: *key });
        Ok(())
    }

    /// Unlock with an existing 32-byte key (tests, key files).
    pub async fn unlock_with_key(&self, key: [u8; 32]) {
        let mut guard = self.inner.write().await;
        *guard = Some(VaultInner { key });
    }

    /// Lock the vault — zeroizes the key.
    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.read().await.is_none()
    }

    /// Access the raw key for an encrypt/decrypt operation.
    /// Returns Err if the vault is locked.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, CoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, CoreError>,
    {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(inner) => f(&inner.key),
            None => Err(CoreError::VaultLocked),
        }
    }
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locked_vault_rejects_access() {
        let vault = Vault::new();
        assert!(vault.is_locked().await);
        let res = vault.with_key(|_| Ok(())).await;
        assert!(matches!(res, Err(CoreError::VaultLocked)));
    }

    #[tokio::test]
    async fn unlock_and_lock() {
        let vault = Vault::new();
        vault.unlock_with_key([7u8; 32]).await;
        assert!(!vault.is_locked().await);
        let key_byte = vault.with_key(|k| Ok(k[0])).await.unwrap();
        assert_eq!(key_byte, 7);
        vault.lock().await;
        assert!(vault.is_locked().await);
    }

    #[tokio::test]
    async fn unlock_from_password() {
        let vault = Vault::new();
        let salt = crypto::generate_salt();
        vault.unlock(b"correct horse battery staple", &salt).await.unwrap();
        assert!(!vault.is_locked().await);
    }
}
