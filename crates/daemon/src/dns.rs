//! Resolver record publishing
//!
//! Records are written as a dnsmasq `address=` file which is replaced
//! atomically on every sync and followed by a SIGHUP to the resolver.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt::Write as _;
use std::io::Write as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use wgctl_common::{Error, Result};

/// Hostname to address mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub hostname: String,
    pub address: Ipv4Addr,
}

impl DnsRecord {
    pub fn new(hostname: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            hostname: hostname.into(),
            address,
        }
    }
}

/// Resolver configuration writer
#[async_trait]
pub trait DnsWriter: Send + Sync {
    /// Replace the full record set
    async fn write(&self, records: &[DnsRecord]) -> Result<()>;

    /// Ask the resolver to re-read its records
    async fn reload(&self) -> Result<()>;
}

/// [`DnsWriter`] for dnsmasq
#[derive(Debug, Clone)]
pub struct DnsmasqWriter {
    hosts_file: PathBuf,
    pid_file: PathBuf,
}

impl DnsmasqWriter {
    pub fn new(hosts_file: impl Into<PathBuf>, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            hosts_file: hosts_file.into(),
            pid_file: pid_file.into(),
        }
    }
}

#[async_trait]
impl DnsWriter for DnsmasqWriter {
    async fn write(&self, records: &[DnsRecord]) -> Result<()> {
        let contents = render_records(records);
        let path = self.hosts_file.clone();

        tokio::task::spawn_blocking(move || replace_file(&path, contents.as_bytes()))
            .await
            .map_err(|e| Error::DnsSync(format!("writer task failed: {}", e)))??;

        debug!(
            "Wrote {} DNS records to {:?}",
            records.len(),
            self.hosts_file
        );
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let raw = tokio::fs::read_to_string(&self.pid_file)
            .await
            .map_err(|e| Error::DnsSync(format!("cannot read {:?}: {}", self.pid_file, e)))?;
        let pid: i32 = raw
            .trim()
            .parse()
            .map_err(|e| Error::DnsSync(format!("bad pid in {:?}: {}", self.pid_file, e)))?;

        kill(Pid::from_raw(pid), Signal::SIGHUP)
            .map_err(|e| Error::DnsSync(format!("SIGHUP to dnsmasq ({}) failed: {}", pid, e)))?;

        debug!("Sent SIGHUP to dnsmasq ({})", pid);
        Ok(())
    }
}

/// Write through a sibling temporary file and rename over the target so the
/// resolver never reads a half-written file.
fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut file = NamedTempFile::new_in(dir)
        .map_err(|e| Error::DnsSync(format!("cannot create temp file in {:?}: {}", dir, e)))?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path)
        .map_err(|e| Error::DnsSync(format!("cannot replace {:?}: {}", path, e.error)))?;
    Ok(())
}

/// Render records in dnsmasq `address=/name/ip` form
pub fn render_records(records: &[DnsRecord]) -> String {
    let mut out = String::new();
    for record in records {
        let _ = writeln!(out, "address=/{}/{}", record.hostname, record.address);
    }
    out
}

/// RFC 1123 host name check
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_records() {
        let records = vec![
            DnsRecord::new("wg-controller", Ipv4Addr::new(172, 19, 0, 254)),
            DnsRecord::new("gateway-1", Ipv4Addr::new(172, 19, 0, 3)),
        ];
        assert_eq!(
            render_records(&records),
            "address=/wg-controller/172.19.0.254\naddress=/gateway-1/172.19.0.3\n"
        );
    }

    #[test]
    fn test_hostname_validation() {
        assert!(is_valid_hostname("gateway-1"));
        assert!(is_valid_hostname("site.example"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("-bad"));
        assert!(!is_valid_hostname("has/slash"));
        assert!(!is_valid_hostname("under_score"));
        assert!(!is_valid_hostname(&"a".repeat(64)));
    }

    #[tokio::test]
    async fn test_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("wg-dnsmasq.conf");
        std::fs::write(&hosts, "address=/stale/10.0.0.1\n").unwrap();

        let writer = DnsmasqWriter::new(&hosts, dir.path().join("dnsmasq.pid"));
        writer
            .write(&[DnsRecord::new("fresh", Ipv4Addr::new(172, 19, 0, 5))])
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&hosts).unwrap();
        assert_eq!(contents, "address=/fresh/172.19.0.5\n");
    }

    #[tokio::test]
    async fn test_reload_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DnsmasqWriter::new(dir.path().join("hosts"), dir.path().join("missing.pid"));
        assert!(matches!(writer.reload().await, Err(Error::DnsSync(_))));
    }
}
