//! Cryptographic utilities for wgctl
//!
//! Provides at-rest field encryption (AES-256-GCM), password hashing
//! (Argon2id), bearer-token hashing (SHA-256) and constant-time comparison.

use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// AES-256 key size for at-rest encryption
pub const DB_KEY_LEN: usize = 32;

/// AES-GCM nonce size, prefixed to every ciphertext
pub const NONCE_LEN: usize = 12;

/// Password salt size
pub const SALT_LEN: usize = 16;

/// Random bytes in a session or API-key token
pub const TOKEN_LEN: usize = 32;

/// Argon2 output length
pub const PASSWORD_HASH_LEN: usize = 32;

/// Ciphertext of a secret field, laid out as `nonce || ciphertext || tag`.
///
/// Only [`FieldCipher::decrypt`] turns this back into plaintext.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedSecret(Vec<u8>);

impl EncryptedSecret {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedSecret({} bytes)", self.0.len())
    }
}

/// Symmetric cipher for the WireGuard secret columns
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FieldCipher(..)")
    }
}

impl FieldCipher {
    /// Build a cipher from a raw 32-byte key
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != DB_KEY_LEN {
            return Err(Error::Crypto(format!(
                "database key must be {} bytes, got {}",
                DB_KEY_LEN,
                key.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Build a cipher from a base64-encoded key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| Error::Crypto(format!("database key is not base64: {}", e)))?,
        );
        Self::new(&key)
    }

    /// Generate a fresh random database key
    pub fn generate_key() -> Zeroizing<[u8; DB_KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; DB_KEY_LEN]);
        OsRng.fill_bytes(key.as_mut());
        key
    }

    /// Encrypt with a random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedSecret> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self.cipher.encrypt(nonce, plaintext)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(EncryptedSecret(out))
    }

    /// Decrypt and authenticate
    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<Zeroizing<Vec<u8>>> {
        if secret.0.len() < NONCE_LEN {
            return Err(Error::Crypto("ciphertext shorter than nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = secret.0.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)?;
        Ok(Zeroizing::new(plaintext))
    }
}

/// Argon2 tuned for the build: production defaults, cheap parameters in tests.
fn argon2_instance() -> Argon2<'static> {
    #[cfg(test)]
    {
        use argon2::{Algorithm, Params, Version};
        match Params::new(1024, 1, 1, Some(PASSWORD_HASH_LEN)) {
            Ok(params) => Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
            Err(_) => Argon2::default(),
        }
    }

    #[cfg(not(test))]
    {
        Argon2::default()
    }
}

/// Generate a random password salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Slow salted hash for passwords
pub fn hash_password(password: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; PASSWORD_HASH_LEN];
    argon2_instance()
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| Error::Crypto(format!("password hashing failed: {}", e)))?;
    Ok(out)
}

/// Recompute the password hash and compare in constant time
pub fn verify_password(password: &[u8], salt: &[u8], expected: &[u8]) -> Result<bool> {
    let computed = hash_password(password, salt)?;
    Ok(constant_time_eq(&computed, expected))
}

/// Full-length comparison with no early exit on the first differing byte
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Generate a random bearer token
pub fn generate_token() -> Zeroizing<Vec<u8>> {
    let mut token = Zeroizing::new(vec![0u8; TOKEN_LEN]);
    OsRng.fill_bytes(token.as_mut_slice());
    token
}

/// Encode a token for transport in a cookie or header
pub fn encode_token(token: &[u8]) -> String {
    URL_SAFE.encode(token)
}

/// Decode a presented token
pub fn decode_token(encoded: &str) -> Result<Zeroizing<Vec<u8>>> {
    let bytes = URL_SAFE
        .decode(encoded.trim())
        .map_err(|_| Error::Auth("token is not url-safe base64".to_string()))?;
    Ok(Zeroizing::new(bytes))
}

/// Fast hash for high-entropy tokens
pub fn hash_token(token: &[u8]) -> Vec<u8> {
    Sha256::digest(token).to_vec()
}
