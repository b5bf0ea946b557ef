//! Error types for wgctl

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using wgctl Error
pub type Result<T> = std::result::Result<T, Error>;

/// wgctl error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Address space exhausted in {cidr} after {probes} probes")]
    AddressSpaceExhausted { cidr: String, probes: usize },

    #[error("Device sync failed: {0}")]
    DeviceSync(String),

    #[error("Route sync failed: {0}")]
    RouteSync(String),

    #[error("DNS sync failed: {0}")]
    DnsSync(String),

    /// The reason is for logs only and must never reach a client.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Client {0} is not registered on the push bus")]
    ClientNotRegistered(Uuid),

    #[error("Push queue for client {0} is full")]
    PushQueueFull(Uuid),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &str, id: impl ToString) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// True when the underlying store rejected a write on a UNIQUE or
    /// PRIMARY KEY constraint.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Error::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

impl From<aes_gcm::Error> for Error {
    fn from(_: aes_gcm::Error) -> Self {
        // aead errors are opaque by construction
        Error::Crypto("authenticated encryption failure".to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Validation(format!("invalid base64: {}", e))
    }
}

impl From<ipnetwork::IpNetworkError> for Error {
    fn from(e: ipnetwork::IpNetworkError) -> Self {
        Error::Validation(format!("invalid network: {}", e))
    }
}
