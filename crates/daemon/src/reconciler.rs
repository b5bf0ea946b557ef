//! Reconciliation engine
//!
//! Converges the tunnel device, the host routing table and the resolver to
//! the peers in the store. Every pass re-reads the store; nothing observed
//! on the host is ever treated as authoritative.

use crate::config::{ControllerConfig, DisabledPeerDns};
use crate::device::{DevicePeer, DevicePeerConfig, TunnelDevice};
use crate::dns::{is_valid_hostname, DnsRecord, DnsWriter};
use crate::routes::{Route, RouteTable};
use ipnetwork::Ipv4Network;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wgctl_common::{Database, Error, PeerRecord, PeerStats, Result, WgKey};

/// Settings the reconciler needs from the controller configuration
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub server_cidr: Ipv4Network,
    pub server_address: Ipv4Addr,
    pub server_hostname: String,
    pub route_protocol: u8,
    pub disabled_peers: DisabledPeerDns,
}

impl ReconcileSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            server_cidr: config.network.server_cidr,
            server_address: config.network.server_address(),
            server_hostname: config.network.server_hostname.clone(),
            route_protocol: config.network.route_protocol,
            disabled_peers: config.dns.disabled_peers,
        }
    }
}

/// Outcome of a device sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSyncReport {
    pub applied: usize,
    pub pruned: usize,
}

/// Outcome of a route sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSyncReport {
    pub removed: usize,
    pub installed: usize,
}

/// Outcome of a DNS sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsSyncReport {
    pub records: usize,
    pub skipped: usize,
}

/// Independent results of the three sub-syncs of one pass
#[derive(Debug)]
pub struct ReconcileReport {
    pub device: Result<DeviceSyncReport>,
    pub routes: Result<RouteSyncReport>,
    pub dns: Result<DnsSyncReport>,
}

impl ReconcileReport {
    pub fn is_ok(&self) -> bool {
        self.device.is_ok() && self.routes.is_ok() && self.dns.is_ok()
    }

    fn log(&self) {
        match &self.device {
            Ok(r) => debug!("Device sync: {} applied, {} pruned", r.applied, r.pruned),
            Err(e) => warn!("Device sync failed: {}", e),
        }
        match &self.routes {
            Ok(r) => debug!("Route sync: {} removed, {} installed", r.removed, r.installed),
            Err(e) => warn!("Route sync failed: {}", e),
        }
        match &self.dns {
            Ok(r) => debug!("DNS sync: {} records, {} skipped", r.records, r.skipped),
            Err(e) => warn!("DNS sync failed: {}", e),
        }
    }
}

/// Types of drift between the store and the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    /// Enabled peer missing from the device
    Missing,
    /// Device peer with no enabled store record
    Unexpected,
    /// Allowed IPs, pre-shared key or keep-alive differ
    ConfigMismatch,
}

/// Drift report
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub public_key: String,
    pub hostname: Option<String>,
    pub drift_type: DriftType,
    pub message: String,
}

/// Reconciler that ensures host state matches the store
pub struct Reconciler {
    db: Database,
    device: Arc<dyn TunnelDevice>,
    routes: Arc<dyn RouteTable>,
    dns: Arc<dyn DnsWriter>,
    settings: ReconcileSettings,
    /// Serialises passes so two writes cannot interleave their syncs
    pass_lock: Mutex<()>,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(
        db: Database,
        device: Arc<dyn TunnelDevice>,
        routes: Arc<dyn RouteTable>,
        dns: Arc<dyn DnsWriter>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            db,
            device,
            routes,
            dns,
            settings,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Run periodic reconciliation until cancelled
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        info!("Reconciler started, resync every {:?}", interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already ran a pass
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.reconcile().await;
                    if !report.is_ok() {
                        warn!("Periodic reconciliation finished with errors");
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// One full pass: device then routes, with DNS alongside
    pub async fn reconcile(&self) -> ReconcileReport {
        let _guard = self.pass_lock.lock().await;

        let tunnel = async {
            let device = self.sync_device().await;
            let routes = self.sync_routes().await;
            (device, routes)
        };
        let ((device, routes), dns) = tokio::join!(tunnel, self.sync_dns());

        let report = ReconcileReport {
            device,
            routes,
            dns,
        };
        report.log();
        report
    }

    // ========================================================================
    // Device
    // ========================================================================

    /// Converge the device peer set. Every configuration is built before
    /// anything is applied; one bad key aborts the pass with the device
    /// untouched.
    pub async fn sync_device(&self) -> Result<DeviceSyncReport> {
        let peers = self.db.list_peers()?;

        let desired = peers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| self.device_config(p))
            .collect::<Result<Vec<_>>>()?;

        let current = self.device.peers().await.map_err(device_error)?;

        self.device.apply(&desired).await.map_err(device_error)?;

        let wanted: HashSet<WgKey> = desired.iter().map(|c| c.public_key).collect();
        let stale: Vec<WgKey> = current
            .iter()
            .map(|p| p.public_key)
            .filter(|key| !wanted.contains(key))
            .collect();

        if !stale.is_empty() {
            self.device.remove(&stale).await.map_err(device_error)?;
            info!("Pruned {} stale peers from the device", stale.len());
        }

        Ok(DeviceSyncReport {
            applied: desired.len(),
            pruned: stale.len(),
        })
    }

    /// Device configuration for one peer
    fn device_config(&self, peer: &PeerRecord) -> Result<DevicePeerConfig> {
        let public_key: WgKey = peer.public_key.parse().map_err(|e| {
            Error::DeviceSync(format!("peer {} has a malformed public key: {}", peer.hostname, e))
        })?;
        let preshared_key = self.db.decrypt_preshared_key(peer).map_err(|e| {
            Error::DeviceSync(format!(
                "peer {} has an unreadable pre-shared key: {}",
                peer.hostname, e
            ))
        })?;

        Ok(DevicePeerConfig {
            public_key,
            preshared_key,
            keepalive_secs: peer.keepalive_secs,
            allowed_ips: allowed_ips(peer),
        })
    }

    // ========================================================================
    // Routes
    // ========================================================================

    /// Replace every controller-owned route. A bad peer is logged and
    /// skipped; the collected failures are returned once all peers ran.
    pub async fn sync_routes(&self) -> Result<RouteSyncReport> {
        let peers = self.db.list_peers()?;
        let protocol = self.settings.route_protocol;
        let owned = self.routes.list(protocol).await.map_err(route_error)?;

        let mut report = RouteSyncReport::default();
        let mut failures = Vec::new();

        for route in &owned {
            match self.routes.delete(route).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!("Failed to delete route {}: {}", route, e);
                    failures.push(format!("delete {}: {}", route, e));
                }
            }
        }

        for peer in peers.iter().filter(|p| p.enabled) {
            if let Err(e) = self.check_gateway(peer) {
                warn!("Skipping routes for {}: {}", peer.hostname, e);
                failures.push(e.to_string());
                continue;
            }

            for subnet in &peer.remote_subnets {
                if overlaps(*subnet, self.settings.server_cidr) {
                    warn!(
                        "Skipping route {} for {}: overlaps the tunnel network",
                        subnet, peer.hostname
                    );
                    failures.push(format!("{}: {} overlaps tunnel network", peer.hostname, subnet));
                    continue;
                }

                let route = Route {
                    destination: *subnet,
                    gateway: peer.remote_tun_address,
                    protocol,
                };
                match self.routes.add(&route).await {
                    Ok(()) => report.installed += 1,
                    Err(e) => {
                        warn!("Failed to add route {} for {}: {}", route, peer.hostname, e);
                        failures.push(format!("{}: {}", peer.hostname, e));
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(Error::RouteSync(failures.join("; ")))
        }
    }

    fn check_gateway(&self, peer: &PeerRecord) -> Result<()> {
        let cidr = self.settings.server_cidr;
        let gateway = peer.remote_tun_address;
        if !cidr.contains(gateway) || gateway == cidr.network() || gateway == cidr.broadcast() {
            return Err(Error::RouteSync(format!(
                "{}: gateway {} is not a host in {}",
                peer.hostname, gateway, cidr
            )));
        }
        Ok(())
    }

    // ========================================================================
    // DNS
    // ========================================================================

    /// Rewrite every record from scratch and reload the resolver
    pub async fn sync_dns(&self) -> Result<DnsSyncReport> {
        let peers = self.db.list_peers()?;
        let (records, skipped) = self.dns_records(&peers);

        self.dns.write(&records).await.map_err(dns_error)?;
        self.dns.reload().await.map_err(dns_error)?;

        Ok(DnsSyncReport {
            records: records.len(),
            skipped,
        })
    }

    fn dns_records(&self, peers: &[PeerRecord]) -> (Vec<DnsRecord>, usize) {
        let mut records = vec![DnsRecord::new(
            self.settings.server_hostname.clone(),
            self.settings.server_address,
        )];
        let mut skipped = 0;

        for peer in peers {
            let published = match self.settings.disabled_peers {
                DisabledPeerDns::Remove => peer.enabled,
                DisabledPeerDns::Retain => true,
            };
            if !published {
                continue;
            }
            if !is_valid_hostname(&peer.hostname)
                || peer.hostname.eq_ignore_ascii_case(&self.settings.server_hostname)
            {
                warn!("Skipping DNS record for unusable hostname {:?}", peer.hostname);
                skipped += 1;
                continue;
            }
            records.push(DnsRecord::new(peer.hostname.clone(), peer.remote_tun_address));
        }

        (records, skipped)
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Runtime counters keyed by base64 public key
    pub async fn runtime_stats(&self) -> Result<HashMap<String, PeerStats>> {
        let peers = self.device.peers().await?;
        Ok(peers
            .into_iter()
            .map(|p| (p.public_key.to_base64(), stats_of(&p)))
            .collect())
    }

    /// Compare the device with the store without changing anything
    pub async fn detect_drift(&self) -> Result<Vec<DriftReport>> {
        let peers = self.db.list_peers()?;
        let current: HashMap<WgKey, DevicePeer> = self
            .device
            .peers()
            .await?
            .into_iter()
            .map(|p| (p.public_key, p))
            .collect();

        let mut reports = Vec::new();
        let mut wanted = HashSet::new();

        for peer in peers.iter().filter(|p| p.enabled) {
            let desired = match self.device_config(peer) {
                Ok(desired) => desired,
                Err(e) => {
                    reports.push(DriftReport {
                        public_key: peer.public_key.clone(),
                        hostname: Some(peer.hostname.clone()),
                        drift_type: DriftType::ConfigMismatch,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            wanted.insert(desired.public_key);

            match current.get(&desired.public_key) {
                None => reports.push(DriftReport {
                    public_key: peer.public_key.clone(),
                    hostname: Some(peer.hostname.clone()),
                    drift_type: DriftType::Missing,
                    message: "peer is not installed on the device".to_string(),
                }),
                Some(installed) => {
                    if let Some(message) = config_difference(&desired, installed) {
                        reports.push(DriftReport {
                            public_key: peer.public_key.clone(),
                            hostname: Some(peer.hostname.clone()),
                            drift_type: DriftType::ConfigMismatch,
                            message,
                        });
                    }
                }
            }
        }

        for key in current.keys().filter(|k| !wanted.contains(*k)) {
            reports.push(DriftReport {
                public_key: key.to_base64(),
                hostname: None,
                drift_type: DriftType::Unexpected,
                message: "device peer has no enabled store record".to_string(),
            });
        }

        Ok(reports)
    }
}

/// Remote subnets plus the peer's own /32, without duplicates
pub fn allowed_ips(peer: &PeerRecord) -> Vec<Ipv4Network> {
    let mut allowed = peer.remote_subnets.clone();
    let host = Ipv4Network::from(peer.remote_tun_address);
    allowed.push(host);

    let mut seen = HashSet::new();
    allowed.retain(|net| seen.insert(*net));
    allowed
}

pub fn stats_of(peer: &DevicePeer) -> PeerStats {
    PeerStats {
        transmit_bytes: peer.tx_bytes,
        receive_bytes: peer.rx_bytes,
        last_handshake: peer.last_handshake,
        last_endpoint: peer.endpoint_ip(),
    }
}

fn config_difference(desired: &DevicePeerConfig, installed: &DevicePeer) -> Option<String> {
    let mut want: Vec<_> = desired.allowed_ips.clone();
    let mut have: Vec<_> = installed.allowed_ips.clone();
    want.sort();
    have.sort();

    if want != have {
        return Some(format!("allowed IPs {:?}, expected {:?}", have, want));
    }
    if installed.preshared_key != Some(desired.preshared_key) {
        return Some("pre-shared key differs".to_string());
    }
    if installed.keepalive_secs != desired.keepalive_secs {
        return Some(format!(
            "keep-alive {}s, expected {}s",
            installed.keepalive_secs, desired.keepalive_secs
        ));
    }
    None
}

fn overlaps(a: Ipv4Network, b: Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

fn is_sync_error(e: &Error) -> bool {
    matches!(
        e,
        Error::DeviceSync(_) | Error::RouteSync(_) | Error::DnsSync(_)
    )
}

fn device_error(e: Error) -> Error {
    if is_sync_error(&e) {
        e
    } else {
        Error::DeviceSync(e.to_string())
    }
}

fn route_error(e: Error) -> Error {
    if is_sync_error(&e) {
        e
    } else {
        Error::RouteSync(e.to_string())
    }
}

fn dns_error(e: Error) -> Error {
    if is_sync_error(&e) {
        e
    } else {
        Error::DnsSync(e.to_string())
    }
}
