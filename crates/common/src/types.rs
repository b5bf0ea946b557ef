//! Core types for wgctl

use crate::crypto::EncryptedSecret;
use crate::keys::WgKey;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Peers
// ============================================================================

/// Category of tunnel client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerType {
    /// Interactive client (laptop, phone)
    #[serde(rename = "wg-client")]
    WgClient,
    /// Site gateway advertising networks behind it
    #[serde(rename = "tbm-client")]
    TbmClient,
}

impl Default for PeerType {
    fn default() -> Self {
        Self::WgClient
    }
}

impl std::fmt::Display for PeerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WgClient => write!(f, "wg-client"),
            Self::TbmClient => write!(f, "tbm-client"),
        }
    }
}

impl std::str::FromStr for PeerType {
    type Err = crate::Error;
    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "wg-client" => Ok(Self::WgClient),
            "tbm-client" => Ok(Self::TbmClient),
            _ => Err(crate::Error::Validation(format!("unknown peer type: {}", s))),
        }
    }
}

/// A peer as persisted. Secret fields stay encrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub uuid: Uuid,
    pub hostname: String,
    pub enabled: bool,
    pub peer_type: PeerType,
    pub attributes: Vec<String>,
    pub public_key: String,
    pub private_key: EncryptedSecret,
    pub preshared_key: EncryptedSecret,
    pub keepalive_secs: u32,
    /// Address of the client's own interface, informational
    pub local_tun_address: Option<Ipv4Addr>,
    /// Tunnel address the controller routes to; unique across peers
    pub remote_tun_address: Ipv4Addr,
    pub remote_subnets: Vec<Ipv4Network>,
    pub allowed_subnets: Vec<Ipv4Network>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PeerRecord {
    /// Public projection with optional runtime statistics
    pub fn view(&self, stats: Option<PeerStats>) -> PeerView {
        PeerView {
            uuid: self.uuid,
            hostname: self.hostname.clone(),
            enabled: self.enabled,
            peer_type: self.peer_type,
            attributes: self.attributes.clone(),
            public_key: self.public_key.clone(),
            keepalive_secs: self.keepalive_secs,
            local_tun_address: self.local_tun_address,
            remote_tun_address: self.remote_tun_address,
            remote_subnets: self.remote_subnets.clone(),
            allowed_subnets: self.allowed_subnets.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            stats,
        }
    }
}

/// Plaintext input for creating a peer
#[derive(Clone, Serialize, Deserialize)]
pub struct NewPeer {
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    pub hostname: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub peer_type: PeerType,
    #[serde(default)]
    pub attributes: Vec<String>,
    pub private_key: WgKey,
    pub public_key: WgKey,
    pub preshared_key: WgKey,
    #[serde(default)]
    pub keepalive_secs: u32,
    #[serde(default)]
    pub local_tun_address: Option<Ipv4Addr>,
    pub remote_tun_address: Ipv4Addr,
    #[serde(default)]
    pub remote_subnets: Vec<Ipv4Network>,
    #[serde(default)]
    pub allowed_subnets: Vec<Ipv4Network>,
}

fn default_enabled() -> bool {
    true
}

impl std::fmt::Debug for NewPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewPeer")
            .field("uuid", &self.uuid)
            .field("hostname", &self.hostname)
            .field("public_key", &self.public_key.to_base64())
            .field("remote_tun_address", &self.remote_tun_address)
            .finish_non_exhaustive()
    }
}

/// Partial update of a peer; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub hostname: Option<String>,
    pub enabled: Option<bool>,
    pub peer_type: Option<PeerType>,
    pub attributes: Option<Vec<String>>,
    pub private_key: Option<WgKey>,
    pub public_key: Option<WgKey>,
    pub preshared_key: Option<WgKey>,
    pub keepalive_secs: Option<u32>,
    pub local_tun_address: Option<Ipv4Addr>,
    pub remote_tun_address: Option<Ipv4Addr>,
    pub remote_subnets: Option<Vec<Ipv4Network>>,
    pub allowed_subnets: Option<Vec<Ipv4Network>>,
}

/// Runtime counters read from the tunnel device, never persisted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStats {
    pub transmit_bytes: u64,
    pub receive_bytes: u64,
    /// Unix seconds of the latest handshake
    pub last_handshake: Option<i64>,
    pub last_endpoint: Option<String>,
}

/// Peer as returned to API clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerView {
    pub uuid: Uuid,
    pub hostname: String,
    pub enabled: bool,
    pub peer_type: PeerType,
    pub attributes: Vec<String>,
    pub public_key: String,
    pub keepalive_secs: u32,
    pub local_tun_address: Option<Ipv4Addr>,
    pub remote_tun_address: Ipv4Addr,
    pub remote_subnets: Vec<Ipv4Network>,
    pub allowed_subnets: Vec<Ipv4Network>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<PeerStats>,
}

/// Decrypted key material of one peer. Dropped as soon as it is used.
#[derive(Clone)]
pub struct PeerSecrets {
    pub private_key: WgKey,
    pub preshared_key: WgKey,
}

impl std::fmt::Debug for PeerSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PeerSecrets(..)")
    }
}

// ============================================================================
// Accounts and credentials
// ============================================================================

/// Operator role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    Admin,
    User,
}

impl Default for AccountRole {
    fn default() -> Self {
        Self::User
    }
}

impl std::fmt::Display for AccountRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::User => write!(f, "user"),
        }
    }
}

impl std::str::FromStr for AccountRole {
    type Err = crate::Error;
    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            _ => Err(crate::Error::Validation(format!("unknown role: {}", s))),
        }
    }
}

/// Human operator identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub role: AccountRole,
    pub failed_attempts: u32,
    pub last_active: Option<i64>,
}

/// Stored password material for an account
#[derive(Clone)]
pub struct PasswordHash {
    pub hash: Vec<u8>,
    pub salt: Vec<u8>,
}

impl std::fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordHash(..)")
    }
}

/// Authenticated account session, keyed by token hash
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token_hash: Vec<u8>,
    pub email: String,
    /// Absolute expiry in unix milliseconds
    pub expires_at: i64,
}

impl Session {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Machine credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub uuid: Uuid,
    pub name: String,
    /// Absolute expiry in unix milliseconds; zero means never
    pub expires_at: i64,
    pub attributes: Vec<String>,
}

impl ApiKey {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at != 0 && self.expires_at <= now_ms
    }
}
