//! Controller configuration

use anyhow::bail;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use wgctl_common::allocator::{highest_usable, is_private_network};

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// State directory path
    pub store_path: PathBuf,

    /// Control API listen address
    pub api_listen: String,

    /// Seconds between unconditional reconciliation passes, 0 disables
    pub resync_interval_secs: u64,

    /// Tunnel network configuration
    pub network: NetworkConfig,

    /// Resolver configuration
    pub dns: DnsConfig,

    /// Credential and session configuration
    pub auth: AuthConfig,

    /// Long-poll push bus configuration
    pub push: PushConfig,

    /// Liveness monitor configuration
    pub liveness: LivenessConfig,

    /// Alert delivery configuration
    pub alerts: AlertConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            store_path: wgctl_common::default_store_path(),
            api_listen: "0.0.0.0:8081".to_string(),
            resync_interval_secs: 300,
            network: NetworkConfig::default(),
            dns: DnsConfig::default(),
            auth: AuthConfig::default(),
            push: PushConfig::default(),
            liveness: LivenessConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

/// Tunnel network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Kernel WireGuard interface
    pub interface: String,

    /// WireGuard UDP port
    pub listen_port: u16,

    /// Block tunnel addresses are allocated from; must be private
    pub server_cidr: Ipv4Network,

    /// Controller's own tunnel address, defaults to the highest host address
    pub server_address: Option<Ipv4Addr>,

    /// Name the controller publishes for itself in DNS
    pub server_hostname: String,

    /// Host clients dial, reported in server info
    pub public_host: String,

    /// Resolvers handed to clients after the controller itself
    pub upstream_dns: Vec<Ipv4Addr>,

    /// Route protocol number marking controller-owned routes
    pub route_protocol: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            listen_port: 51820,
            server_cidr: Ipv4Network::new(Ipv4Addr::new(172, 19, 0, 0), 24)
                .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::new(172, 19, 0, 0))),
            server_address: None,
            server_hostname: "wg-controller".to_string(),
            public_host: "localhost".to_string(),
            upstream_dns: vec![Ipv4Addr::new(8, 8, 8, 8)],
            route_protocol: 171,
        }
    }
}

impl NetworkConfig {
    /// Effective controller tunnel address
    pub fn server_address(&self) -> Ipv4Addr {
        self.server_address
            .unwrap_or_else(|| highest_usable(self.server_cidr))
    }
}

/// What happens to DNS records of disabled peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisabledPeerDns {
    /// Disabled peers drop out of DNS together with device and routes
    Remove,
    /// Disabled peers keep resolving to their reserved tunnel address
    Retain,
}

impl Default for DisabledPeerDns {
    fn default() -> Self {
        Self::Remove
    }
}

/// Resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// dnsmasq address file, rewritten on every sync
    pub hosts_file: PathBuf,

    /// dnsmasq pid file, signalled with SIGHUP to reload
    pub pid_file: PathBuf,

    pub disabled_peers: DisabledPeerDns,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            hosts_file: PathBuf::from("/etc/wg-dnsmasq.conf"),
            pid_file: PathBuf::from("/var/run/dnsmasq.pid"),
            disabled_peers: DisabledPeerDns::default(),
        }
    }
}

/// Credential and session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub session_ttl_secs: u64,

    /// Failed logins after which an account is suspended
    pub max_failed_attempts: u32,

    pub session_gc_interval_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 12 * 60 * 60,
            max_failed_attempts: 5,
            session_gc_interval_secs: 60 * 60,
        }
    }
}

impl AuthConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn session_gc_interval(&self) -> Duration {
        Duration::from_secs(self.session_gc_interval_secs)
    }
}

/// Long-poll push bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub queue_capacity: usize,
    pub poll_timeout_secs: u64,
    pub gc_interval_secs: u64,
    /// Queues idle for longer than this are reclaimed
    pub client_expiry_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 50,
            poll_timeout_secs: 10,
            gc_interval_secs: 10,
            client_expiry_secs: 60,
        }
    }
}

impl PushConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn client_expiry(&self) -> Duration {
        Duration::from_secs(self.client_expiry_secs)
    }
}

/// How the liveness monitor decides a peer is online
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategy {
    /// ICMP echo to the peer's tunnel address
    Ping,
    /// Recent WireGuard handshake on the device
    Handshake,
}

/// Liveness monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub enabled: bool,
    pub strategy: ProbeStrategy,
    /// Minimum time between the starts of two cycles
    pub interval_secs: u64,
    pub probe_count: u32,
    pub probe_timeout_secs: u64,
    pub handshake_freshness_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: ProbeStrategy::Ping,
            interval_secs: 15,
            probe_count: 3,
            probe_timeout_secs: 2,
            handshake_freshness_secs: 60,
        }
    }
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Alert delivery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Incoming-webhook URL; alerts are only logged when unset
    pub webhook_url: Option<String>,

    /// Link included in alert payloads
    pub dashboard_url: Option<String>,
}

impl ControllerConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        let cidr = self.network.server_cidr;
        if !is_private_network(cidr) {
            bail!("server CIDR {} is not a private network", cidr);
        }
        if cidr.prefix() > 30 {
            bail!("server CIDR {} leaves no room for peers", cidr);
        }

        let server = self.network.server_address();
        if !cidr.contains(server) || server == cidr.network() || server == cidr.broadcast() {
            bail!("server address {} is not a host address in {}", server, cidr);
        }

        // 0-4 are reserved by the kernel (unspec, redirect, kernel, boot, static)
        if self.network.route_protocol <= 4 {
            bail!(
                "route protocol {} is reserved by the kernel",
                self.network.route_protocol
            );
        }

        if self.push.queue_capacity == 0 {
            bail!("push queue capacity must be at least 1");
        }
        if self.liveness.interval_secs == 0 {
            bail!("liveness interval must be at least one second");
        }
        if let Some(url) = &self.alerts.webhook_url {
            if !url.starts_with("https://") {
                bail!("alert webhook must be an https URL");
            }
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }
}
