//! wgctl Common Library
//!
//! Shared types, key handling, at-rest encryption, address allocation and
//! persistence for the wgctl controller.

pub mod allocator;
pub mod crypto;
pub mod db;
pub mod error;
pub mod keys;
pub mod types;

// Re-export commonly used types
pub use allocator::allocate_address;
pub use crypto::{EncryptedSecret, FieldCipher};
pub use db::Database;
pub use error::{Error, Result};
pub use keys::{WgKey, WgKeyPair};
pub use types::*;

/// wgctl version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_store_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/wgctl")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}
