//! WireGuard key material

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Length of every WireGuard key (private, public, pre-shared)
pub const KEY_LEN: usize = 32;

/// A 32-byte WireGuard key in its canonical base64 text form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WgKey([u8; KEY_LEN]);

impl WgKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Base64 encoding as used by `wg(8)`
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Derive the public key for this private key
    pub fn public_key(&self) -> WgKey {
        let secret = StaticSecret::from(self.0);
        WgKey(*PublicKey::from(&secret).as_bytes())
    }
}

impl FromStr for WgKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut decoded = STANDARD
            .decode(s.trim())
            .map_err(|e| Error::Validation(format!("malformed WireGuard key: {}", e)))?;
        if decoded.len() != KEY_LEN {
            let len = decoded.len();
            decoded.zeroize();
            return Err(Error::Validation(format!(
                "WireGuard key must be {} bytes, got {}",
                KEY_LEN, len
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(key))
    }
}

impl fmt::Display for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

// Only a short prefix, since the same type carries private keys
impl fmt::Debug for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_base64();
        write!(f, "WgKey({}...)", &encoded[..6])
    }
}

impl Serialize for WgKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for WgKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Generated WireGuard key pair
#[derive(Clone)]
pub struct WgKeyPair {
    pub private_key: WgKey,
    pub public_key: WgKey,
}

impl fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key.to_base64())
            .finish_non_exhaustive()
    }
}

impl WgKeyPair {
    /// Generate a clamped X25519 private key and its public key
    pub fn generate() -> Self {
        let mut private_key_bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut private_key_bytes);

        private_key_bytes[0] &= 248;
        private_key_bytes[31] &= 127;
        private_key_bytes[31] |= 64;

        let private_key = WgKey(private_key_bytes);
        private_key_bytes.zeroize();

        Self {
            public_key: private_key.public_key(),
            private_key,
        }
    }
}

/// Generate a random pre-shared key
pub fn generate_preshared_key() -> WgKey {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    WgKey(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = WgKeyPair::generate();
        assert_eq!(kp.private_key.to_base64().len(), 44);
        assert_eq!(kp.public_key, kp.private_key.public_key());
        assert_ne!(kp.private_key, kp.public_key);
    }

    #[test]
    fn test_key_parse_display() {
        let key = generate_preshared_key();
        let parsed: WgKey = key.to_base64().parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.to_string(), key.to_base64());
    }

    #[test]
    fn test_malformed_key_rejected() {
        assert!("not-a-key".parse::<WgKey>().is_err());
        // valid base64, wrong length
        assert!("AAAA".parse::<WgKey>().is_err());
    }

    #[test]
    fn test_debug_does_not_print_full_key() {
        let kp = WgKeyPair::generate();
        let printed = format!("{:?}", kp.private_key);
        assert!(!printed.contains(&kp.private_key.to_base64()));
    }
}
