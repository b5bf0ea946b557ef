//! Controller state shared by the API and background tasks
//!
//! Every peer write goes store first, then a reconciliation pass, then a
//! push notification to the affected client. Sync failures are logged and
//! never fail the write; the periodic resync repairs them.

use crate::alerts::{Alert, AlertSink};
use crate::auth::AuthService;
use crate::config::ControllerConfig;
use crate::device::TunnelDevice;
use crate::dns::{is_valid_hostname, DnsWriter};
use crate::liveness::{probe_from_config, LivenessMonitor};
use crate::pushbus::{PushBus, PushMessage};
use crate::reconciler::{DriftReport, ReconcileReport, ReconcileSettings, Reconciler};
use crate::routes::RouteTable;
use ipnetwork::Ipv4Network;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wgctl_common::allocator::allocate_address;
use wgctl_common::keys::generate_preshared_key;
use wgctl_common::{
    Account, AccountRole, Database, Error, NewPeer, PeerRecord, PeerUpdate, PeerView, Result,
    WgKey, WgKeyPair,
};

/// Largest keep-alive interval the kernel accepts
const MAX_KEEPALIVE_SECS: u32 = 65535;

/// Host-facing implementations the controller drives
pub struct HostInterfaces {
    pub device: Arc<dyn TunnelDevice>,
    pub routes: Arc<dyn RouteTable>,
    pub dns: Arc<dyn DnsWriter>,
}

/// Freshly generated material for a new peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerInit {
    pub uuid: Uuid,
    pub private_key: WgKey,
    pub public_key: WgKey,
    pub preshared_key: WgKey,
    pub remote_tun_address: Ipv4Addr,
    pub server_cidr: Ipv4Network,
}

/// What a client needs to dial the controller
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub public_key: String,
    pub public_endpoint: String,
    pub name_servers: Vec<Ipv4Addr>,
    pub netmask: Ipv4Addr,
    pub server_internal_ip: Ipv4Addr,
}

/// Outcome of one reconciliation pass as reported to operators
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub device: Option<String>,
    pub routes: Option<String>,
    pub dns: Option<String>,
}

impl SyncSummary {
    fn from_report(report: &ReconcileReport) -> Self {
        fn error_text<T>(result: &Result<T>) -> Option<String> {
            result.as_ref().err().map(|e| e.to_string())
        }
        Self {
            device: error_text(&report.device),
            routes: error_text(&report.routes),
            dns: error_text(&report.dns),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.device.is_none() && self.routes.is_none() && self.dns.is_none()
    }
}

/// Health of the controller
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub device_reachable: bool,
    pub drift: Vec<DriftReport>,
}

/// Controller
pub struct Controller {
    config: ControllerConfig,
    db: Database,
    reconciler: Arc<Reconciler>,
    push: Arc<PushBus>,
    auth: Arc<AuthService>,
    alerts: Arc<dyn AlertSink>,
    device: Arc<dyn TunnelDevice>,
    server_public_key: WgKey,
    master_admin: Option<String>,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        db: Database,
        host: HostInterfaces,
        alerts: Arc<dyn AlertSink>,
        server_public_key: WgKey,
        master_admin: Option<String>,
    ) -> Self {
        let reconciler = Reconciler::new(
            db.clone(),
            host.device.clone(),
            host.routes,
            host.dns,
            ReconcileSettings::from_config(&config),
        );
        let push = PushBus::new(
            config.push.queue_capacity,
            config.push.poll_timeout(),
            config.push.client_expiry(),
        );
        let auth = AuthService::new(db.clone(), &config.auth);

        Self {
            config,
            db,
            reconciler: Arc::new(reconciler),
            push: Arc::new(push),
            auth: Arc::new(auth),
            alerts,
            device: host.device,
            server_public_key,
            master_admin,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn push(&self) -> &PushBus {
        &self.push
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Cancelled on shutdown; stops background loops and open polls
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Spawn the periodic resync, push-bus GC, session GC and liveness loops
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let cancel = &self.shutdown;
        let mut handles = Vec::new();

        if self.config.resync_interval_secs > 0 {
            let reconciler = self.reconciler.clone();
            let interval = std::time::Duration::from_secs(self.config.resync_interval_secs);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                reconciler.run(interval, cancel).await
            }));
        }

        {
            let push = self.push.clone();
            let interval = self.config.push.gc_interval();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { push.run_gc(interval, cancel).await }));
        }

        {
            let auth = self.auth.clone();
            let interval = self.config.auth.session_gc_interval();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                auth.run_session_gc(interval, cancel).await
            }));
        }

        if self.config.liveness.enabled {
            let monitor = LivenessMonitor::new(
                self.db.clone(),
                probe_from_config(&self.config.liveness, self.device.clone()),
                self.alerts.clone(),
                self.config.liveness.interval(),
            );
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { monitor.run(cancel).await }));
        }

        handles
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// All peers with runtime counters where the device knows them
    pub async fn list_peers(&self) -> Result<Vec<PeerView>> {
        let peers = self.db.list_peers()?;
        let mut stats = match self.reconciler.runtime_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Cannot read peer statistics: {}", e);
                Default::default()
            }
        };
        Ok(peers
            .iter()
            .map(|p| p.view(stats.remove(&p.public_key)))
            .collect())
    }

    pub async fn get_peer(&self, uuid: Uuid) -> Result<PeerView> {
        let peer = self.find_peer(uuid)?;
        let stats = self
            .reconciler
            .runtime_stats()
            .await
            .ok()
            .and_then(|mut stats| stats.remove(&peer.public_key));
        Ok(peer.view(stats))
    }

    /// Generate keys, a UUID and the next free tunnel address
    pub fn init_peer(&self) -> Result<PeerInit> {
        let keys = WgKeyPair::generate();
        let mut used = self.db.used_tunnel_addresses()?;
        used.insert(self.config.network.server_address());
        let remote_tun_address = allocate_address(&used, self.config.network.server_cidr)?;

        Ok(PeerInit {
            uuid: Uuid::new_v4(),
            private_key: keys.private_key,
            public_key: keys.public_key,
            preshared_key: generate_preshared_key(),
            remote_tun_address,
            server_cidr: self.config.network.server_cidr,
        })
    }

    pub async fn create_peer(&self, peer: NewPeer) -> Result<PeerView> {
        self.validate_peer(
            &peer.hostname,
            peer.remote_tun_address,
            &peer.remote_subnets,
            peer.keepalive_secs,
        )?;
        if peer.private_key.public_key() != peer.public_key {
            return Err(Error::Validation(
                "public key does not match private key".to_string(),
            ));
        }

        let record = self.db.insert_peer(&peer)?;
        info!("Created peer {} ({})", record.hostname, record.uuid);

        self.alerts.notify(Alert::PeerCreated {
            hostname: record.hostname.clone(),
            address: record.remote_tun_address,
        });
        self.after_write(&record, "created").await;
        Ok(record.view(None))
    }

    pub async fn update_peer(&self, uuid: Uuid, update: PeerUpdate) -> Result<PeerView> {
        let current = self.find_peer(uuid)?;
        self.validate_peer(
            update.hostname.as_deref().unwrap_or(&current.hostname),
            update.remote_tun_address.unwrap_or(current.remote_tun_address),
            update.remote_subnets.as_deref().unwrap_or(&current.remote_subnets),
            update.keepalive_secs.unwrap_or(current.keepalive_secs),
        )?;
        if let (Some(private), Some(public)) = (&update.private_key, &update.public_key) {
            if private.public_key() != *public {
                return Err(Error::Validation(
                    "public key does not match private key".to_string(),
                ));
            }
        }

        let record = self.db.update_peer(uuid, &update)?;
        info!("Updated peer {} ({})", record.hostname, record.uuid);
        self.after_write(&record, "updated").await;
        Ok(record.view(None))
    }

    pub async fn delete_peer(&self, uuid: Uuid) -> Result<PeerView> {
        let record = self.db.delete_peer(uuid)?;
        info!("Deleted peer {} ({})", record.hostname, record.uuid);
        self.after_write(&record, "deleted").await;
        Ok(record.view(None))
    }

    fn find_peer(&self, uuid: Uuid) -> Result<PeerRecord> {
        self.db
            .get_peer(uuid)?
            .ok_or_else(|| Error::not_found("peer", uuid))
    }

    fn validate_peer(
        &self,
        hostname: &str,
        address: Ipv4Addr,
        subnets: &[Ipv4Network],
        keepalive_secs: u32,
    ) -> Result<()> {
        if !is_valid_hostname(hostname) {
            return Err(Error::Validation(format!("invalid hostname: {:?}", hostname)));
        }
        if hostname.eq_ignore_ascii_case(&self.config.network.server_hostname) {
            return Err(Error::Validation(format!(
                "hostname {} is reserved for the controller",
                hostname
            )));
        }

        let cidr = self.config.network.server_cidr;
        if !cidr.contains(address) || address == cidr.network() || address == cidr.broadcast() {
            return Err(Error::Validation(format!(
                "tunnel address {} is not a host address in {}",
                address, cidr
            )));
        }
        if address == self.config.network.server_address() {
            return Err(Error::Validation(format!(
                "tunnel address {} belongs to the controller",
                address
            )));
        }

        for subnet in subnets {
            if subnet.contains(cidr.network()) || cidr.contains(subnet.network()) {
                return Err(Error::Validation(format!(
                    "subnet {} overlaps the tunnel network {}",
                    subnet, cidr
                )));
            }
        }

        if keepalive_secs > MAX_KEEPALIVE_SECS {
            return Err(Error::Validation(format!(
                "keep-alive must not exceed {} seconds",
                MAX_KEEPALIVE_SECS
            )));
        }
        Ok(())
    }

    /// Converge the host and tell the peer's client about the change
    async fn after_write(&self, record: &PeerRecord, change: &str) {
        let report = self.reconciler.reconcile().await;
        if !report.is_ok() {
            warn!(
                "Reconciliation after {} peer {} incomplete",
                change, record.hostname
            );
        }

        let message = PushMessage::peer_config(change, record.view(None));
        match self.push.publish(record.uuid, message) {
            Ok(()) => debug!("Notified {} of {} configuration", record.hostname, change),
            Err(Error::ClientNotRegistered(_)) => {
                debug!("{} is not polling, skipping notification", record.hostname)
            }
            Err(e) => warn!("Failed to notify {}: {}", record.hostname, e),
        }
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        self.db.list_accounts()
    }

    pub fn create_account(&self, email: &str, role: AccountRole, password: &str) -> Result<Account> {
        self.auth.create_account(email, role, password)
    }

    pub fn update_account_role(&self, email: &str, role: AccountRole) -> Result<Account> {
        if self.is_master_admin(email) && role != AccountRole::Admin {
            return Err(Error::Validation(
                "the master admin account cannot be demoted".to_string(),
            ));
        }
        self.db.update_account_role(email, role)
    }

    pub fn delete_account(&self, email: &str) -> Result<()> {
        if self.is_master_admin(email) {
            return Err(Error::Validation(
                "the master admin account cannot be deleted".to_string(),
            ));
        }
        self.db.delete_account(email)?;
        info!("Deleted account {}", email);
        Ok(())
    }

    fn is_master_admin(&self, email: &str) -> bool {
        self.master_admin
            .as_deref()
            .map(|admin| admin.eq_ignore_ascii_case(email))
            .unwrap_or(false)
    }

    // ========================================================================
    // Server
    // ========================================================================

    pub fn server_info(&self) -> ServerInfo {
        let network = &self.config.network;
        let server_address = network.server_address();
        let mut name_servers = vec![server_address];
        name_servers.extend(network.upstream_dns.iter().copied());

        ServerInfo {
            public_key: self.server_public_key.to_base64(),
            public_endpoint: format!("{}:{}", network.public_host, network.listen_port),
            name_servers,
            netmask: network.server_cidr.mask(),
            server_internal_ip: server_address,
        }
    }

    /// Operator-triggered reconciliation
    pub async fn resync(&self) -> SyncSummary {
        let report = self.reconciler.reconcile().await;
        SyncSummary::from_report(&report)
    }

    pub async fn health(&self) -> Health {
        match self.reconciler.detect_drift().await {
            Ok(drift) => Health {
                status: if drift.is_empty() { "ok" } else { "drift" },
                device_reachable: true,
                drift,
            },
            Err(e) => {
                warn!("Health check cannot read the device: {}", e);
                Health {
                    status: "degraded",
                    device_reachable: false,
                    drift: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pushbus::PollOutcome;
    use crate::testing::{sample_peer, test_db, MemoryDevice, MemoryDns, MemoryRoutes, RecordingAlerts};

    pub(crate) struct Fixture {
        pub controller: Arc<Controller>,
        pub device: Arc<MemoryDevice>,
        pub routes: Arc<MemoryRoutes>,
        pub alerts: Arc<RecordingAlerts>,
    }

    pub(crate) const ADMIN_EMAIL: &str = "admin@example.com";
    pub(crate) const ADMIN_PASSWORD: &str = "correct horse";

    pub(crate) fn fixture() -> Fixture {
        let device = Arc::new(MemoryDevice::default());
        let routes = Arc::new(MemoryRoutes::default());
        let alerts = Arc::new(RecordingAlerts::default());
        let host = HostInterfaces {
            device: device.clone(),
            routes: routes.clone(),
            dns: Arc::new(MemoryDns::default()),
        };
        let controller = Controller::new(
            ControllerConfig::default(),
            test_db(),
            host,
            alerts.clone(),
            WgKeyPair::generate().public_key,
            Some(ADMIN_EMAIL.to_string()),
        );
        controller
            .auth()
            .bootstrap_admin(ADMIN_EMAIL, ADMIN_PASSWORD)
            .unwrap();

        Fixture {
            controller: Arc::new(controller),
            device,
            routes,
            alerts,
        }
    }

    #[tokio::test]
    async fn test_create_peer_converges_and_alerts() {
        let f = fixture();
        let mut new = sample_peer("gateway-1", [172, 19, 0, 3]);
        new.remote_subnets = vec!["10.0.5.0/24".parse().unwrap()];

        let view = f.controller.create_peer(new.clone()).await.unwrap();
        assert_eq!(view.hostname, "gateway-1");
        assert!(f.device.config(&new.public_key).is_some());
        assert_eq!(f.routes.owned(171).len(), 1);
        assert!(matches!(
            f.alerts.alerts().as_slice(),
            [Alert::PeerCreated { hostname, .. }] if hostname == "gateway-1"
        ));

        let listed = f.controller.list_peers().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].stats.as_ref().map(|s| s.transmit_bytes), Some(200));
    }

    #[tokio::test]
    async fn test_update_notifies_polling_client() {
        let f = fixture();
        let new = sample_peer("laptop", [172, 19, 0, 4]);
        f.controller.create_peer(new.clone()).await.unwrap();

        // Register the client as a poller
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            f.controller.push().poll(new.uuid, &cancel).await,
            PollOutcome::Cancelled
        );

        f.controller
            .update_peer(
                new.uuid,
                PeerUpdate {
                    keepalive_secs: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        match f.controller.push().poll(new.uuid, &CancellationToken::new()).await {
            PollOutcome::Message(m) => {
                assert_eq!(m.data, "updated");
                assert_eq!(m.config.unwrap().keepalive_secs, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.device.config(&new.public_key).unwrap().keepalive_secs, 10);
    }

    #[tokio::test]
    async fn test_write_succeeds_when_device_down() {
        let f = fixture();
        f.device.set_unreachable(true);
        let new = sample_peer("laptop", [172, 19, 0, 4]);
        f.controller.create_peer(new.clone()).await.unwrap();
        assert!(f.controller.db().get_peer(new.uuid).unwrap().is_some());

        let health = f.controller.health().await;
        assert!(!health.device_reachable);

        f.device.set_unreachable(false);
        let summary = f.controller.resync().await;
        assert!(summary.is_ok(), "{:?}", summary);
        assert!(f.device.config(&new.public_key).is_some());
        assert_eq!(f.controller.health().await.status, "ok");
    }

    #[tokio::test]
    async fn test_peer_validation() {
        let f = fixture();

        let outside = sample_peer("laptop", [10, 9, 9, 9]);
        assert!(matches!(f.controller.create_peer(outside).await, Err(Error::Validation(_))));

        let server = sample_peer("laptop", [172, 19, 0, 254]);
        assert!(matches!(f.controller.create_peer(server).await, Err(Error::Validation(_))));

        let bad_name = sample_peer("bad name", [172, 19, 0, 4]);
        assert!(matches!(f.controller.create_peer(bad_name).await, Err(Error::Validation(_))));

        let mut overlapping = sample_peer("laptop", [172, 19, 0, 4]);
        overlapping.remote_subnets = vec!["172.19.0.0/25".parse().unwrap()];
        assert!(matches!(f.controller.create_peer(overlapping).await, Err(Error::Validation(_))));

        let mut mismatched = sample_peer("laptop", [172, 19, 0, 4]);
        mismatched.public_key = WgKeyPair::generate().public_key;
        assert!(matches!(f.controller.create_peer(mismatched).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_duplicate_address_conflicts() {
        let f = fixture();
        f.controller
            .create_peer(sample_peer("a", [172, 19, 0, 4]))
            .await
            .unwrap();
        assert!(matches!(
            f.controller.create_peer(sample_peer("b", [172, 19, 0, 4])).await,
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_init_peer_skips_used_addresses() {
        let f = fixture();
        f.controller
            .create_peer(sample_peer("a", [172, 19, 0, 1]))
            .await
            .unwrap();

        let init = f.controller.init_peer().unwrap();
        assert_eq!(init.remote_tun_address, Ipv4Addr::new(172, 19, 0, 2));
        assert_eq!(init.private_key.public_key(), init.public_key);
    }

    #[tokio::test]
    async fn test_delete_peer() {
        let f = fixture();
        let new = sample_peer("laptop", [172, 19, 0, 4]);
        f.controller.create_peer(new.clone()).await.unwrap();
        f.controller.delete_peer(new.uuid).await.unwrap();

        assert!(f.device.config(&new.public_key).is_none());
        assert!(matches!(
            f.controller.get_peer(new.uuid).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_master_admin_protected() {
        let f = fixture();
        assert!(matches!(
            f.controller.delete_account(ADMIN_EMAIL),
            Err(Error::Validation(_))
        ));
        assert!(f
            .controller
            .update_account_role(ADMIN_EMAIL, AccountRole::User)
            .is_err());

        f.controller
            .create_account("ops@example.com", AccountRole::User, "ops password")
            .unwrap();
        f.controller.delete_account("ops@example.com").unwrap();
    }

    #[test]
    fn test_server_info() {
        let f = fixture();
        let info = f.controller.server_info();
        assert_eq!(info.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(info.server_internal_ip, Ipv4Addr::new(172, 19, 0, 254));
        assert_eq!(info.name_servers[0], Ipv4Addr::new(172, 19, 0, 254));
        assert_eq!(info.public_endpoint, "localhost:51820");
    }
}
