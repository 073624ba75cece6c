//! Authenticated encryption for at-rest fields.
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes (random).  Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ nonce (24 bytes) | ciphertext + tag ]
//!
//! Every encrypted column carries its own domain-separation AAD string so
//! a snapshot blob can never be replayed as an audit payload.

use argon2::{Argon2, Params};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    XChaCha20Poly1305,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64MB
pub const KDF_PARALLELISM: u32 = 4;
pub const DERIVED_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed")]
    AeadDecrypt,

    #[error("Base64 decode failed: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Key derivation failed: {0}")]
    Kdf(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Encrypt `plaintext` with a 32-byte key, prepending a random 24-byte nonce.
/// `aad` — additional associated data (authenticated but not encrypted).
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;

    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, chacha20poly1305::aead::Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(24 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < 24 {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(24);
    let nonce = chacha20poly1305::XNonce::from_slice(nonce_bytes);

    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;

    let plaintext = cipher
        .decrypt(nonce, chacha20poly1305::aead::Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

/// Derive a 32-byte vault key from a password and a stored salt (Argon2id).
pub fn derive_key(password: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let params = Params::new(
        KDF_MEMORY_COST,
        KDF_TIME_COST,
        KDF_PARALLELISM,
        Some(DERIVED_KEY_LEN),
    )
    .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let argon = Argon2::from(params);
    let mut key = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(password, salt, key.as_mut())
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(key)
}

/// Fresh random salt for a new deployment. Stored beside the database
/// (not secret).
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        let mut k = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut k);
        k
    }

    #[test]
    fn roundtrip() {
        let k = key();
        let ct = encrypt(&k, b"zakatable wealth snapshot", b"test-aad").unwrap();
        let pt = decrypt(&k, &ct, b"test-aad").unwrap();
        assert_eq!(&pt[..], b"zakatable wealth snapshot");
    }

    #[test]
    fn wrong_aad_fails() {
        let k = key();
        let ct = encrypt(&k, b"payload", b"aad-one").unwrap();
        assert!(decrypt(&k, &ct, b"aad-two").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let k = key();
        let mut ct = encrypt(&k, b"payload", b"aad").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xff;
        assert!(decrypt(&k, &ct, b"aad").is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let ct = encrypt(&key(), b"payload", b"aad").unwrap();
        assert!(decrypt(&key(), &ct, b"aad").is_err());
    }

    #[test]
    fn derive_key_is_deterministic() {
        let salt = generate_salt();
        let a = derive_key(b"pw", &salt).unwrap();
        let b = derive_key(b"pw", &salt).unwrap();
        assert_eq!(&a[..], &b[..]);
        let c = derive_key(b"other", &salt).unwrap();
        assert_ne!(&a[..], &c[..]);
    }
}
