//! Kernel WireGuard device access
//!
//! The reconciler talks to the device only through [`TunnelDevice`]. The
//! production implementation drives `wg(8)`; key material is handed over in
//! private temporary files, never on the command line.

use crate::command::run_tool;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use wgctl_common::{Error, Result, WgKey};

/// Desired configuration of one device peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePeerConfig {
    pub public_key: WgKey,
    pub preshared_key: WgKey,
    /// Zero disables persistent keep-alive
    pub keepalive_secs: u32,
    pub allowed_ips: Vec<Ipv4Network>,
}

/// A peer as currently installed on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePeer {
    pub public_key: WgKey,
    pub preshared_key: Option<WgKey>,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<Ipv4Network>,
    /// Unix seconds, `None` if the peer never completed a handshake
    pub last_handshake: Option<i64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub keepalive_secs: u32,
}

impl DevicePeer {
    /// Endpoint address without the port
    pub fn endpoint_ip(&self) -> Option<String> {
        let endpoint = self.endpoint.as_deref()?;
        endpoint
            .rsplit_once(':')
            .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']').to_string())
    }
}

/// Kernel tunnel device
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Current device peers with runtime counters
    async fn peers(&self) -> Result<Vec<DevicePeer>>;

    /// Create or update the given peers. Peers not mentioned are left alone;
    /// the allowed-IP set of each mentioned peer is replaced.
    async fn apply(&self, peers: &[DevicePeerConfig]) -> Result<()>;

    /// Remove peers by public key
    async fn remove(&self, public_keys: &[WgKey]) -> Result<()>;
}

/// [`TunnelDevice`] backed by the `wg` command line tool
pub struct WgCommandDevice {
    interface: String,
    wg_binary: PathBuf,
}

impl WgCommandDevice {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            wg_binary: PathBuf::from("wg"),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Set the interface private key and listen port
    pub async fn configure(&self, private_key: &WgKey, listen_port: u16) -> Result<()> {
        let key_file = key_file(private_key)?;
        let port = listen_port.to_string();
        let args = [
            "set",
            self.interface.as_str(),
            "listen-port",
            port.as_str(),
            "private-key",
            path_str(&key_file)?,
        ];
        self.wg(args).await?;

        info!(
            "Configured {} on port {} with public key {}",
            self.interface,
            listen_port,
            private_key.public_key()
        );
        Ok(())
    }

    async fn wg<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let program = self.wg_binary.to_string_lossy();
        run_tool(&program, args).await.map_err(Error::DeviceSync)
    }
}

fn key_file(key: &WgKey) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "{}", key.to_base64())?;
    file.flush()?;
    Ok(file)
}

fn path_str(file: &NamedTempFile) -> Result<&str> {
    file.path()
        .to_str()
        .ok_or_else(|| Error::DeviceSync("temporary key path is not UTF-8".to_string()))
}

#[async_trait]
impl TunnelDevice for WgCommandDevice {
    async fn peers(&self) -> Result<Vec<DevicePeer>> {
        let dump = self.wg(["show", self.interface.as_str(), "dump"]).await?;
        parse_dump(&dump)
    }

    async fn apply(&self, peers: &[DevicePeerConfig]) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }

        // Key files must outlive the command
        let mut key_files = Vec::with_capacity(peers.len());
        let mut args: Vec<String> = vec!["set".to_string(), self.interface.clone()];

        for peer in peers {
            let file = key_file(&peer.preshared_key)?;
            let allowed_ips = peer
                .allowed_ips
                .iter()
                .map(|net| net.to_string())
                .collect::<Vec<_>>()
                .join(",");

            args.push("peer".to_string());
            args.push(peer.public_key.to_base64());
            args.push("preshared-key".to_string());
            args.push(path_str(&file)?.to_string());
            args.push("persistent-keepalive".to_string());
            args.push(match peer.keepalive_secs {
                0 => "off".to_string(),
                secs => secs.to_string(),
            });
            args.push("allowed-ips".to_string());
            args.push(allowed_ips);

            key_files.push(file);
        }

        self.wg(&args).await?;
        debug!("Applied {} peers to {}", peers.len(), self.interface);
        Ok(())
    }

    async fn remove(&self, public_keys: &[WgKey]) -> Result<()> {
        if public_keys.is_empty() {
            return Ok(());
        }

        let mut args: Vec<String> = vec!["set".to_string(), self.interface.clone()];
        for key in public_keys {
            args.push("peer".to_string());
            args.push(key.to_base64());
            args.push("remove".to_string());
        }

        self.wg(&args).await?;
        debug!("Removed {} peers from {}", public_keys.len(), self.interface);
        Ok(())
    }
}

/// Parse the output of `wg show <interface> dump`.
///
/// The first line describes the interface; each following line is one peer:
/// public key, pre-shared key, endpoint, allowed IPs, latest handshake,
/// rx bytes, tx bytes, persistent keep-alive, tab separated.
pub fn parse_dump(dump: &str) -> Result<Vec<DevicePeer>> {
    let mut peers = Vec::new();

    for (index, line) in dump.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(Error::DeviceSync(format!(
                "unexpected dump line {}: {} fields",
                index + 1,
                fields.len()
            )));
        }

        let optional = |value: &str| match value {
            "(none)" | "" => None,
            other => Some(other.to_string()),
        };
        let number = |value: &str, name: &str| {
            value
                .parse::<u64>()
                .map_err(|e| Error::DeviceSync(format!("bad {} {:?}: {}", name, value, e)))
        };

        let public_key: WgKey = fields[0]
            .parse()
            .map_err(|e| Error::DeviceSync(format!("bad public key in dump: {}", e)))?;
        let preshared_key = optional(fields[1])
            .map(|k| k.parse::<WgKey>())
            .transpose()
            .map_err(|e| Error::DeviceSync(format!("bad preshared key in dump: {}", e)))?;

        // IPv6 entries are not managed by the controller
        let allowed_ips = fields[3]
            .split(',')
            .filter_map(|net| net.trim().parse::<Ipv4Network>().ok())
            .collect();

        let handshake = number(fields[4], "handshake")?;

        peers.push(DevicePeer {
            public_key,
            preshared_key,
            endpoint: optional(fields[2]),
            allowed_ips,
            last_handshake: (handshake > 0).then_some(handshake as i64),
            rx_bytes: number(fields[5], "rx bytes")?,
            tx_bytes: number(fields[6], "tx bytes")?,
            keepalive_secs: match fields[7] {
                "off" => 0,
                value => number(value, "keepalive")? as u32,
            },
        });
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgctl_common::WgKeyPair;

    #[test]
    fn test_parse_dump() {
        let iface = WgKeyPair::generate();
        let a = WgKeyPair::generate().public_key;
        let b = WgKeyPair::generate().public_key;
        let psk = wgctl_common::keys::generate_preshared_key();

        let dump = format!(
            "{}\t{}\t51820\toff\n\
             {}\t{}\t203.0.113.7:41414\t10.0.5.0/24,172.19.0.3/32\t1700000000\t1024\t2048\t25\n\
             {}\t(none)\t(none)\t172.19.0.4/32,fd00::4/128\t0\t0\t0\toff\n",
            iface.private_key, iface.public_key, a, psk, b
        );

        let peers = parse_dump(&dump).unwrap();
        assert_eq!(peers.len(), 2);

        assert_eq!(peers[0].public_key, a);
        assert_eq!(peers[0].preshared_key, Some(psk));
        assert_eq!(peers[0].endpoint_ip().as_deref(), Some("203.0.113.7"));
        assert_eq!(
            peers[0].allowed_ips,
            vec![
                "10.0.5.0/24".parse::<Ipv4Network>().unwrap(),
                "172.19.0.3/32".parse().unwrap()
            ]
        );
        assert_eq!(peers[0].last_handshake, Some(1_700_000_000));
        assert_eq!((peers[0].rx_bytes, peers[0].tx_bytes), (1024, 2048));
        assert_eq!(peers[0].keepalive_secs, 25);

        assert_eq!(peers[1].preshared_key, None);
        assert_eq!(peers[1].endpoint, None);
        assert_eq!(peers[1].last_handshake, None);
        assert_eq!(peers[1].allowed_ips.len(), 1);
        assert_eq!(peers[1].keepalive_secs, 0);
    }

    #[test]
    fn test_parse_dump_interface_only() {
        let iface = WgKeyPair::generate();
        let dump = format!("{}\t{}\t51820\toff\n", iface.private_key, iface.public_key);
        assert!(parse_dump(&dump).unwrap().is_empty());
    }

    #[test]
    fn test_parse_dump_truncated_line() {
        let dump = "header\nonly\ttwo\n";
        assert!(matches!(parse_dump(dump), Err(Error::DeviceSync(_))));
    }

    #[test]
    fn test_ipv6_endpoint_ip() {
        let peer = DevicePeer {
            public_key: WgKeyPair::generate().public_key,
            preshared_key: None,
            endpoint: Some("[2001:db8::1]:51820".to_string()),
            allowed_ips: vec![],
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            keepalive_secs: 0,
        };
        assert_eq!(peer.endpoint_ip().as_deref(), Some("2001:db8::1"));
    }

    #[test]
    fn test_key_file_contents() {
        let key = wgctl_common::keys::generate_preshared_key();
        let file = key_file(&key).unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(contents.trim(), key.to_base64());
    }
}
