//! Operator alerts
//!
//! Delivery is fire-and-forget: a failed webhook is logged and never
//! retried, and never blocks the caller.

use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Event worth telling an operator about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    PeerOnline { hostname: String, address: Ipv4Addr },
    PeerOffline { hostname: String, address: Ipv4Addr },
    PeerCreated { hostname: String, address: Ipv4Addr },
}

impl Alert {
    pub fn event(&self) -> &'static str {
        match self {
            Alert::PeerOnline { .. } => "peer_online",
            Alert::PeerOffline { .. } => "peer_offline",
            Alert::PeerCreated { .. } => "peer_created",
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::PeerOnline { hostname, address } => {
                write!(f, "Peer {} ({}) is online", hostname, address)
            }
            Alert::PeerOffline { hostname, address } => {
                write!(f, "Peer {} ({}) is offline", hostname, address)
            }
            Alert::PeerCreated { hostname, address } => {
                write!(f, "Peer {} created with address {}", hostname, address)
            }
        }
    }
}

/// Alert destination
pub trait AlertSink: Send + Sync {
    /// Deliver `alert` without blocking the caller
    fn notify(&self, alert: Alert);
}

/// Writes alerts to the log only
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: Alert) {
        info!(event = alert.event(), "{}", alert);
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
}

/// Posts alerts as JSON to an incoming-webhook URL
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
    dashboard_url: Option<String>,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, dashboard_url: Option<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            dashboard_url,
        })
    }

    fn payload(&self, alert: &Alert) -> serde_json::Value {
        let payload = WebhookPayload {
            event: alert.event(),
            message: alert.to_string(),
            url: self.dashboard_url.as_deref(),
        };
        serde_json::to_value(payload).unwrap_or_default()
    }
}

impl AlertSink for WebhookAlertSink {
    fn notify(&self, alert: Alert) {
        info!(event = alert.event(), "{}", alert);

        let request = self.client.post(self.url.as_str()).json(&self.payload(&alert));
        tokio::spawn(async move {
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => debug!("Delivered {} alert", alert.event()),
                Err(e) => warn!("Failed to deliver {} alert: {}", alert.event(), e),
            }
        });
    }
}
