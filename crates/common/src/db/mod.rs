//! SQLite store for peers, accounts, sessions and API keys
//!
//! The store is the only authoritative state in the controller. The two
//! WireGuard secret columns are sealed with the database's [`FieldCipher`];
//! credentials are stored as one-way hashes.

mod accounts;
mod api_keys;
mod peers;

use crate::crypto::FieldCipher;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    cipher: FieldCipher,
}

impl Database {
    /// Expose the underlying connection for maintenance queries
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Cipher used for the secret peer columns
    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>, cipher: FieldCipher) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            cipher,
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory(cipher: FieldCipher) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            cipher,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Peers table
            CREATE TABLE IF NOT EXISTS peers (
                uuid TEXT PRIMARY KEY,
                hostname TEXT NOT NULL UNIQUE,
                enabled INTEGER NOT NULL DEFAULT 1,
                peer_type TEXT NOT NULL,
                attributes TEXT NOT NULL DEFAULT '[]',
                public_key TEXT NOT NULL UNIQUE,
                private_key BLOB NOT NULL,
                preshared_key BLOB NOT NULL,
                keepalive_secs INTEGER NOT NULL DEFAULT 0,
                local_tun_address TEXT,
                remote_tun_address TEXT NOT NULL UNIQUE,
                remote_subnets TEXT NOT NULL DEFAULT '[]',
                allowed_subnets TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Operator accounts
            CREATE TABLE IF NOT EXISTS accounts (
                email TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                password_hash BLOB NOT NULL,
                password_salt BLOB NOT NULL,
                failed_attempts INTEGER NOT NULL DEFAULT 0,
                last_active INTEGER
            );

            -- Sessions, keyed by token hash
            CREATE TABLE IF NOT EXISTS sessions (
                token_hash BLOB PRIMARY KEY,
                email TEXT NOT NULL REFERENCES accounts(email) ON DELETE CASCADE,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_email ON sessions(email);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);

            -- API keys
            CREATE TABLE IF NOT EXISTS api_keys (
                uuid TEXT PRIMARY KEY,
                token_hash BLOB NOT NULL UNIQUE,
                name TEXT NOT NULL,
                expires_at INTEGER NOT NULL DEFAULT 0,
                attributes TEXT NOT NULL DEFAULT '[]'
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

/// Map a UNIQUE/PRIMARY KEY violation to `AlreadyExists`, naming the
/// offending column when SQLite reports it.
fn map_conflict(err: rusqlite::Error, kind: &str, id: &str) -> Error {
    let err = Error::from(err);
    if !err.is_constraint_violation() {
        return err;
    }
    let column = match &err {
        Error::Database(rusqlite::Error::SqliteFailure(_, Some(msg))) => msg
            .rsplit_once('.')
            .map(|(_, column)| column.to_string()),
        _ => None,
    };
    match column {
        Some(column) => Error::already_exists(kind, format!("{} ({})", id, column)),
        None => Error::already_exists(kind, id),
    }
}

/// Conversion failure for a column that does not parse into its domain type
fn conversion_error(column: &str, detail: impl std::fmt::Display) -> Error {
    Error::Internal(format!("corrupt value in column {}: {}", column, detail))
}

#[cfg(test)]
pub(crate) fn test_db() -> Database {
    let key = FieldCipher::generate_key();
    Database::open_memory(FieldCipher::new(&key[..]).unwrap()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let key = FieldCipher::generate_key();

        let db = Database::open(&path, FieldCipher::new(&key[..]).unwrap()).unwrap();
        drop(db);

        // Reopening runs the idempotent schema again
        let db = Database::open(&path, FieldCipher::new(&key[..]).unwrap()).unwrap();
        assert!(db.list_peers().unwrap().is_empty());
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let db = test_db();
        let conn = db.connection();
        let conn = conn.lock();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }
}
