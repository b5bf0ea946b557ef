//! Peer persistence

use super::{conversion_error, map_conflict, Database};
use crate::crypto::EncryptedSecret;
use crate::keys::{WgKey, KEY_LEN};
use crate::types::{now_millis, NewPeer, PeerRecord, PeerSecrets, PeerUpdate};
use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::debug;
use uuid::Uuid;

const PEER_COLUMNS: &str = "uuid, hostname, enabled, peer_type, attributes, public_key, \
     private_key, preshared_key, keepalive_secs, local_tun_address, remote_tun_address, \
     remote_subnets, allowed_subnets, created_at, updated_at";

/// Raw row as stored
struct PeerRow {
    uuid: String,
    hostname: String,
    enabled: bool,
    peer_type: String,
    attributes: String,
    public_key: String,
    private_key: Vec<u8>,
    preshared_key: Vec<u8>,
    keepalive_secs: u32,
    local_tun_address: Option<String>,
    remote_tun_address: String,
    remote_subnets: String,
    allowed_subnets: String,
    created_at: i64,
    updated_at: i64,
}

impl PeerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get(0)?,
            hostname: row.get(1)?,
            enabled: row.get(2)?,
            peer_type: row.get(3)?,
            attributes: row.get(4)?,
            public_key: row.get(5)?,
            private_key: row.get(6)?,
            preshared_key: row.get(7)?,
            keepalive_secs: row.get(8)?,
            local_tun_address: row.get(9)?,
            remote_tun_address: row.get(10)?,
            remote_subnets: row.get(11)?,
            allowed_subnets: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn parse(self) -> Result<PeerRecord> {
        Ok(PeerRecord {
            uuid: Uuid::parse_str(&self.uuid).map_err(|e| conversion_error("uuid", e))?,
            hostname: self.hostname,
            enabled: self.enabled,
            peer_type: self.peer_type.parse()?,
            attributes: serde_json::from_str(&self.attributes)?,
            public_key: self.public_key,
            private_key: EncryptedSecret::from_bytes(self.private_key),
            preshared_key: EncryptedSecret::from_bytes(self.preshared_key),
            keepalive_secs: self.keepalive_secs,
            local_tun_address: self
                .local_tun_address
                .map(|a| a.parse::<Ipv4Addr>())
                .transpose()
                .map_err(|e| conversion_error("local_tun_address", e))?,
            remote_tun_address: self
                .remote_tun_address
                .parse()
                .map_err(|e| conversion_error("remote_tun_address", e))?,
            remote_subnets: serde_json::from_str(&self.remote_subnets)?,
            allowed_subnets: serde_json::from_str(&self.allowed_subnets)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn subnets_json(subnets: &[Ipv4Network]) -> Result<String> {
    Ok(serde_json::to_string(subnets)?)
}

impl Database {
    // ========================================================================
    // Peer operations
    // ========================================================================

    /// Insert a new peer. Fails with `AlreadyExists` on a duplicate uuid,
    /// hostname, public key or tunnel address; never overwrites.
    pub fn insert_peer(&self, peer: &NewPeer) -> Result<PeerRecord> {
        let private_key = self.cipher.encrypt(peer.private_key.as_bytes())?;
        let preshared_key = self.cipher.encrypt(peer.preshared_key.as_bytes())?;
        let now = now_millis();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO peers ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                PEER_COLUMNS
            ),
            params![
                peer.uuid.to_string(),
                peer.hostname,
                peer.enabled,
                peer.peer_type.to_string(),
                serde_json::to_string(&peer.attributes)?,
                peer.public_key.to_base64(),
                private_key.as_bytes(),
                preshared_key.as_bytes(),
                peer.keepalive_secs,
                peer.local_tun_address.map(|a| a.to_string()),
                peer.remote_tun_address.to_string(),
                subnets_json(&peer.remote_subnets)?,
                subnets_json(&peer.allowed_subnets)?,
                now,
                now,
            ],
        )
        .map_err(|e| map_conflict(e, "peer", &peer.hostname))?;
        tx.commit()?;

        debug!("Inserted peer {} ({})", peer.hostname, peer.uuid);

        Ok(PeerRecord {
            uuid: peer.uuid,
            hostname: peer.hostname.clone(),
            enabled: peer.enabled,
            peer_type: peer.peer_type,
            attributes: peer.attributes.clone(),
            public_key: peer.public_key.to_base64(),
            private_key,
            preshared_key,
            keepalive_secs: peer.keepalive_secs,
            local_tun_address: peer.local_tun_address,
            remote_tun_address: peer.remote_tun_address,
            remote_subnets: peer.remote_subnets.clone(),
            allowed_subnets: peer.allowed_subnets.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a peer by uuid
    pub fn get_peer(&self, uuid: Uuid) -> Result<Option<PeerRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM peers WHERE uuid = ?1", PEER_COLUMNS),
                params![uuid.to_string()],
                PeerRow::from_row,
            )
            .optional()?;
        row.map(PeerRow::parse).transpose()
    }

    /// List all peers, enabled or not
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM peers ORDER BY created_at, hostname",
                PEER_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], PeerRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(PeerRow::parse).collect()
    }

    /// Apply a partial update inside one transaction and return the new record
    pub fn update_peer(&self, uuid: Uuid, update: &PeerUpdate) -> Result<PeerRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let current = tx
            .query_row(
                &format!("SELECT {} FROM peers WHERE uuid = ?1", PEER_COLUMNS),
                params![uuid.to_string()],
                PeerRow::from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("peer", uuid))?
            .parse()?;

        let mut peer = current;
        if let Some(hostname) = &update.hostname {
            peer.hostname = hostname.clone();
        }
        if let Some(enabled) = update.enabled {
            peer.enabled = enabled;
        }
        if let Some(peer_type) = update.peer_type {
            peer.peer_type = peer_type;
        }
        if let Some(attributes) = &update.attributes {
            peer.attributes = attributes.clone();
        }
        if let Some(public_key) = &update.public_key {
            peer.public_key = public_key.to_base64();
        }
        if let Some(private_key) = &update.private_key {
            peer.private_key = self.cipher.encrypt(private_key.as_bytes())?;
        }
        if let Some(preshared_key) = &update.preshared_key {
            peer.preshared_key = self.cipher.encrypt(preshared_key.as_bytes())?;
        }
        if let Some(keepalive) = update.keepalive_secs {
            peer.keepalive_secs = keepalive;
        }
        if let Some(addr) = update.local_tun_address {
            peer.local_tun_address = Some(addr);
        }
        if let Some(addr) = update.remote_tun_address {
            peer.remote_tun_address = addr;
        }
        if let Some(subnets) = &update.remote_subnets {
            peer.remote_subnets = subnets.clone();
        }
        if let Some(subnets) = &update.allowed_subnets {
            peer.allowed_subnets = subnets.clone();
        }
        peer.updated_at = now_millis();

        tx.execute(
            "UPDATE peers SET hostname = ?1, enabled = ?2, peer_type = ?3, attributes = ?4,
                public_key = ?5, private_key = ?6, preshared_key = ?7, keepalive_secs = ?8,
                local_tun_address = ?9, remote_tun_address = ?10, remote_subnets = ?11,
                allowed_subnets = ?12, updated_at = ?13
             WHERE uuid = ?14",
            params![
                peer.hostname,
                peer.enabled,
                peer.peer_type.to_string(),
                serde_json::to_string(&peer.attributes)?,
                peer.public_key,
                peer.private_key.as_bytes(),
                peer.preshared_key.as_bytes(),
                peer.keepalive_secs,
                peer.local_tun_address.map(|a| a.to_string()),
                peer.remote_tun_address.to_string(),
                subnets_json(&peer.remote_subnets)?,
                subnets_json(&peer.allowed_subnets)?,
                peer.updated_at,
                uuid.to_string(),
            ],
        )
        .map_err(|e| map_conflict(e, "peer", &peer.hostname))?;
        tx.commit()?;

        debug!("Updated peer {} ({})", peer.hostname, peer.uuid);
        Ok(peer)
    }

    /// Delete a peer and return the removed record
    pub fn delete_peer(&self, uuid: Uuid) -> Result<PeerRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let peer = tx
            .query_row(
                &format!("SELECT {} FROM peers WHERE uuid = ?1", PEER_COLUMNS),
                params![uuid.to_string()],
                PeerRow::from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("peer", uuid))?
            .parse()?;

        tx.execute("DELETE FROM peers WHERE uuid = ?1", params![uuid.to_string()])?;
        tx.commit()?;

        debug!("Deleted peer {} ({})", peer.hostname, peer.uuid);
        Ok(peer)
    }

    /// Tunnel addresses held by any peer, enabled or not
    pub fn used_tunnel_addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT remote_tun_address FROM peers")?;
        let addrs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        addrs
            .into_iter()
            .map(|a| {
                a.parse::<Ipv4Addr>()
                    .map_err(|e| conversion_error("remote_tun_address", e))
            })
            .collect()
    }

    /// Decrypt the secret key material of a peer
    pub fn decrypt_peer_secrets(&self, peer: &PeerRecord) -> Result<PeerSecrets> {
        Ok(PeerSecrets {
            private_key: self.decrypt_key(&peer.private_key)?,
            preshared_key: self.decrypt_key(&peer.preshared_key)?,
        })
    }

    /// Decrypt only the pre-shared key, as needed by device sync
    pub fn decrypt_preshared_key(&self, peer: &PeerRecord) -> Result<WgKey> {
        self.decrypt_key(&peer.preshared_key)
    }

    fn decrypt_key(&self, sealed: &EncryptedSecret) -> Result<WgKey> {
        let plaintext = self.cipher.decrypt(sealed)?;
        if plaintext.len() != KEY_LEN {
            return Err(Error::Crypto(format!(
                "decrypted key is {} bytes, expected {}",
                plaintext.len(),
                KEY_LEN
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&plaintext);
        Ok(WgKey::from_bytes(key))
    }
}

#[cfg(test)]
pub(crate) fn sample_peer(hostname: &str, address: [u8; 4]) -> NewPeer {
    use crate::keys::{generate_preshared_key, WgKeyPair};
    use crate::types::PeerType;

    let kp = WgKeyPair::generate();
    NewPeer {
        uuid: Uuid::new_v4(),
        hostname: hostname.to_string(),
        enabled: true,
        peer_type: PeerType::WgClient,
        attributes: vec![],
        private_key: kp.private_key,
        public_key: kp.public_key,
        preshared_key: generate_preshared_key(),
        keepalive_secs: 25,
        local_tun_address: None,
        remote_tun_address: Ipv4Addr::from(address),
        remote_subnets: vec![],
        allowed_subnets: vec![],
    }
}
