//! Peer liveness monitor
//!
//! Probes every enabled peer once per cycle and alerts only when a peer's
//! state flips. The first observation of a peer is recorded silently.

use crate::alerts::{Alert, AlertSink};
use crate::command::run_tool;
use crate::config::{LivenessConfig, ProbeStrategy};
use crate::device::TunnelDevice;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wgctl_common::{Database, PeerRecord, Result};

/// Decides whether peers are reachable
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, peer: &PeerRecord) -> bool;

    /// Probe all peers concurrently; results are in input order
    async fn probe_all(&self, peers: &[PeerRecord]) -> Vec<bool> {
        join_all(peers.iter().map(|peer| self.probe(peer))).await
    }
}

/// ICMP echo through the system `ping` binary
pub struct PingProbe {
    count: u32,
    timeout: Duration,
}

impl PingProbe {
    pub fn new(count: u32, timeout: Duration) -> Self {
        Self {
            count: count.max(1),
            timeout,
        }
    }
}

#[async_trait]
impl LivenessProbe for PingProbe {
    async fn probe(&self, peer: &PeerRecord) -> bool {
        let count = self.count.to_string();
        let wait = self.timeout.as_secs().max(1).to_string();
        let address = peer.remote_tun_address.to_string();
        let deadline = self.timeout * (self.count + 1);

        let ping = run_tool(
            "ping",
            ["-c", count.as_str(), "-W", wait.as_str(), address.as_str()],
        );
        match tokio::time::timeout(deadline, ping).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Ping to {} failed: {}", peer.hostname, e);
                false
            }
            Err(_) => {
                debug!("Ping to {} timed out", peer.hostname);
                false
            }
        }
    }
}

/// Online while the device saw a handshake recently
pub struct HandshakeProbe {
    device: Arc<dyn TunnelDevice>,
    freshness: Duration,
}

impl HandshakeProbe {
    pub fn new(device: Arc<dyn TunnelDevice>, freshness: Duration) -> Self {
        Self { device, freshness }
    }

    async fn handshakes(&self) -> HashMap<String, i64> {
        match self.device.peers().await {
            Ok(peers) => peers
                .into_iter()
                .filter_map(|p| p.last_handshake.map(|t| (p.public_key.to_base64(), t)))
                .collect(),
            Err(e) => {
                warn!("Cannot read handshakes from device: {}", e);
                HashMap::new()
            }
        }
    }

    fn is_fresh(&self, handshakes: &HashMap<String, i64>, peer: &PeerRecord) -> bool {
        let now = chrono::Utc::now().timestamp();
        handshakes
            .get(&peer.public_key)
            .map(|t| now.saturating_sub(*t) <= self.freshness.as_secs() as i64)
            .unwrap_or(false)
    }
}

#[async_trait]
impl LivenessProbe for HandshakeProbe {
    async fn probe(&self, peer: &PeerRecord) -> bool {
        let handshakes = self.handshakes().await;
        self.is_fresh(&handshakes, peer)
    }

    async fn probe_all(&self, peers: &[PeerRecord]) -> Vec<bool> {
        let handshakes = self.handshakes().await;
        peers.iter().map(|p| self.is_fresh(&handshakes, p)).collect()
    }
}

/// Build the probe selected by configuration
pub fn probe_from_config(config: &LivenessConfig, device: Arc<dyn TunnelDevice>) -> Arc<dyn LivenessProbe> {
    match config.strategy {
        ProbeStrategy::Ping => Arc::new(PingProbe::new(
            config.probe_count,
            Duration::from_secs(config.probe_timeout_secs),
        )),
        ProbeStrategy::Handshake => Arc::new(HandshakeProbe::new(
            device,
            Duration::from_secs(config.handshake_freshness_secs),
        )),
    }
}

/// Edge-triggered peer state tracker
pub struct LivenessMonitor {
    db: Database,
    probe: Arc<dyn LivenessProbe>,
    alerts: Arc<dyn AlertSink>,
    states: DashMap<Uuid, bool>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(
        db: Database,
        probe: Arc<dyn LivenessProbe>,
        alerts: Arc<dyn AlertSink>,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            probe,
            alerts,
            states: DashMap::new(),
            interval,
        }
    }

    /// Last known state of a peer
    pub fn state(&self, uuid: Uuid) -> Option<bool> {
        self.states.get(&uuid).map(|s| *s)
    }

    /// Probe every enabled peer once; returns the number of alerts fired
    pub async fn run_cycle(&self) -> Result<usize> {
        let peers: Vec<PeerRecord> = self
            .db
            .list_peers()?
            .into_iter()
            .filter(|p| p.enabled)
            .collect();

        let results = self.probe.probe_all(&peers).await;

        let mut fired = 0;
        for (peer, online) in peers.iter().zip(results) {
            if let Some(alert) = self.observe(peer, online) {
                self.alerts.notify(alert);
                fired += 1;
            }
        }

        let present: HashSet<Uuid> = peers.iter().map(|p| p.uuid).collect();
        self.states.retain(|uuid, _| present.contains(uuid));

        Ok(fired)
    }

    fn observe(&self, peer: &PeerRecord, online: bool) -> Option<Alert> {
        let previous = self.states.insert(peer.uuid, online)?;
        if previous == online {
            return None;
        }

        let hostname = peer.hostname.clone();
        let address = peer.remote_tun_address;
        Some(if online {
            Alert::PeerOnline { hostname, address }
        } else {
            Alert::PeerOffline { hostname, address }
        })
    }

    /// Run cycles until cancelled. A cycle starts no sooner than one
    /// interval after the previous one started.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Liveness monitor started, interval {:?}", self.interval);

        loop {
            let started = Instant::now();

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.run_cycle() => match result {
                    Ok(fired) if fired > 0 => debug!("Liveness cycle fired {} alerts", fired),
                    Ok(_) => {}
                    Err(e) => warn!("Liveness cycle failed: {}", e),
                },
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(started + self.interval) => {}
            }
        }

        info!("Liveness monitor stopped");
    }
}
