//! In-memory host fakes shared by the daemon tests

use crate::alerts::{Alert, AlertSink};
use crate::device::{DevicePeer, DevicePeerConfig, TunnelDevice};
use crate::dns::{DnsRecord, DnsWriter};
use crate::routes::{Route, RouteTable};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;
use wgctl_common::crypto::FieldCipher;
use wgctl_common::keys::generate_preshared_key;
use wgctl_common::{Database, Error, NewPeer, PeerType, Result, WgKey, WgKeyPair};

pub fn test_db() -> Database {
    let key = FieldCipher::generate_key();
    Database::open_memory(FieldCipher::new(&key[..]).unwrap()).unwrap()
}

pub fn sample_peer(hostname: &str, address: [u8; 4]) -> NewPeer {
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

// ============================================================================
// Device
// ============================================================================

#[derive(Default)]
pub struct MemoryDevice {
    peers: Mutex<HashMap<WgKey, DevicePeerConfig>>,
    handshakes: Mutex<HashMap<WgKey, i64>>,
    unreachable: AtomicBool,
    apply_delay: Mutex<Option<Duration>>,
    apply_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryDevice {
    pub fn config(&self, key: &WgKey) -> Option<DevicePeerConfig> {
        self.peers.lock().get(key).cloned()
    }

    /// Installed configs sorted by public key
    pub fn snapshot(&self) -> Vec<DevicePeerConfig> {
        let mut peers: Vec<_> = self.peers.lock().values().cloned().collect();
        peers.sort_by_key(|p| p.public_key.to_base64());
        peers
    }

    pub fn install(&self, config: DevicePeerConfig) {
        self.peers.lock().insert(config.public_key, config);
    }

    pub fn set_handshake(&self, key: WgKey, unix_secs: i64) {
        self.handshakes.lock().insert(key, unix_secs);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        *self.apply_delay.lock() = Some(delay);
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_applies(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::DeviceSync("device wg0 does not exist".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelDevice for MemoryDevice {
    async fn peers(&self) -> Result<Vec<DevicePeer>> {
        self.check()?;
        let handshakes = self.handshakes.lock().clone();
        Ok(self
            .peers
            .lock()
            .values()
            .map(|c| DevicePeer {
                public_key: c.public_key,
                preshared_key: Some(c.preshared_key),
                endpoint: Some("203.0.113.10:51820".to_string()),
                allowed_ips: c.allowed_ips.clone(),
                last_handshake: handshakes.get(&c.public_key).copied(),
                rx_bytes: 100,
                tx_bytes: 200,
                keepalive_secs: c.keepalive_secs,
            })
            .collect())
    }

    async fn apply(&self, peers: &[DevicePeerConfig]) -> Result<()> {
        self.check()?;
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.apply_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut installed = self.peers.lock();
        for peer in peers {
            installed.insert(peer.public_key, peer.clone());
        }
        drop(installed);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, public_keys: &[WgKey]) -> Result<()> {
        self.check()?;
        let mut installed = self.peers.lock();
        for key in public_keys {
            installed.remove(key);
        }
        Ok(())
    }
}

// ============================================================================
// Routes
// ============================================================================

#[derive(Default)]
pub struct MemoryRoutes {
    routes: Mutex<Vec<Route>>,
    rejected: Mutex<HashSet<Ipv4Network>>,
}

impl MemoryRoutes {
    pub fn install(&self, route: Route) {
        self.routes.lock().push(route);
    }

    /// Make adds for `destination` fail
    pub fn reject(&self, destination: Ipv4Network) {
        self.rejected.lock().insert(destination);
    }

    pub fn owned(&self, protocol: u8) -> Vec<Route> {
        let mut routes: Vec<_> = self
            .routes
            .lock()
            .iter()
            .filter(|r| r.protocol == protocol)
            .copied()
            .collect();
        routes.sort();
        routes
    }

    pub fn all(&self) -> Vec<Route> {
        let mut routes = self.routes.lock().clone();
        routes.sort();
        routes
    }
}

#[async_trait]
impl RouteTable for MemoryRoutes {
    async fn list(&self, protocol: u8) -> Result<Vec<Route>> {
        Ok(self.owned(protocol))
    }

    async fn add(&self, route: &Route) -> Result<()> {
        if self.rejected.lock().contains(&route.destination) {
            return Err(Error::RouteSync(format!("{}: Nexthop has invalid gateway", route)));
        }
        let mut routes = self.routes.lock();
        if routes.iter().any(|r| r.destination == route.destination) {
            return Err(Error::RouteSync(format!("{}: File exists", route)));
        }
        routes.push(*route);
        Ok(())
    }

    async fn delete(&self, route: &Route) -> Result<()> {
        let mut routes = self.routes.lock();
        let before = routes.len();
        routes.retain(|r| r != route);
        if routes.len() == before {
            return Err(Error::RouteSync(format!("{}: No such process", route)));
        }
        Ok(())
    }
}

// ============================================================================
// DNS
// ============================================================================

#[derive(Default)]
pub struct MemoryDns {
    records: Mutex<Vec<DnsRecord>>,
    reloads: AtomicUsize,
}

impl MemoryDns {
    pub fn records(&self) -> Vec<DnsRecord> {
        self.records.lock().clone()
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsWriter for MemoryDns {
    async fn write(&self, records: &[DnsRecord]) -> Result<()> {
        *self.records.lock() = records.to_vec();
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for RecordingAlerts {
    fn notify(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}
