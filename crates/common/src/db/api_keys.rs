//! API key persistence

use super::{conversion_error, map_conflict, Database};
use crate::types::ApiKey;
use crate::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

type ApiKeyRow = (String, String, i64, String);

fn api_key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKeyRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn parse_api_key(raw: ApiKeyRow) -> Result<ApiKey> {
    let (uuid, name, expires_at, attributes) = raw;
    Ok(ApiKey {
        uuid: Uuid::parse_str(&uuid).map_err(|e| conversion_error("uuid", e))?,
        name,
        expires_at,
        attributes: serde_json::from_str(&attributes)?,
    })
}

impl Database {
    // ========================================================================
    // API key operations
    // ========================================================================

    /// Store an API key under the hash of its token
    pub fn insert_api_key(&self, key: &ApiKey, token_hash: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO api_keys (uuid, token_hash, name, expires_at, attributes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.uuid.to_string(),
                token_hash,
                key.name,
                key.expires_at,
                serde_json::to_string(&key.attributes)?,
            ],
        )
        .map_err(|e| map_conflict(e, "api key", &key.uuid.to_string()))?;
        debug!("Inserted API key {} ({})", key.name, key.uuid);
        Ok(())
    }

    /// Look up an API key by token hash
    pub fn get_api_key_by_hash(&self, token_hash: &[u8]) -> Result<Option<ApiKey>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT uuid, name, expires_at, attributes FROM api_keys WHERE token_hash = ?1",
                params![token_hash],
                api_key_from_row,
            )
            .optional()?;
        raw.map(parse_api_key).transpose()
    }

    pub fn get_api_key(&self, uuid: Uuid) -> Result<Option<ApiKey>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT uuid, name, expires_at, attributes FROM api_keys WHERE uuid = ?1",
                params![uuid.to_string()],
                api_key_from_row,
            )
            .optional()?;
        raw.map(parse_api_key).transpose()
    }

    pub fn list_api_keys(&self) -> Result<Vec<ApiKey>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare("SELECT uuid, name, expires_at, attributes FROM api_keys ORDER BY name")?;
            let rows = stmt
                .query_map([], api_key_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(parse_api_key).collect()
    }

    /// Update name, expiry and attributes. The token hash never changes.
    pub fn update_api_key(&self, key: &ApiKey) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE api_keys SET name = ?1, expires_at = ?2, attributes = ?3 WHERE uuid = ?4",
            params![
                key.name,
                key.expires_at,
                serde_json::to_string(&key.attributes)?,
                key.uuid.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("api key", key.uuid));
        }
        Ok(())
    }

    pub fn delete_api_key(&self, uuid: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM api_keys WHERE uuid = ?1",
            params![uuid.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("api key", uuid));
        }
        Ok(())
    }
}
