//! Host routing table access
//!
//! Every route the controller installs carries its protocol number, and only
//! routes carrying that number are ever listed for deletion. Routes added by
//! an operator are invisible to the reconciler.

use crate::command::run_tool;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, warn};
use wgctl_common::{Error, Result};

/// A static route owned by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    pub destination: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub protocol: u8,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} proto {}",
            self.destination, self.gateway, self.protocol
        )
    }
}

/// Host routing table
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Routes tagged with `protocol`
    async fn list(&self, protocol: u8) -> Result<Vec<Route>>;

    async fn add(&self, route: &Route) -> Result<()>;

    async fn delete(&self, route: &Route) -> Result<()>;
}

/// [`RouteTable`] backed by iproute2
#[derive(Debug, Clone, Default)]
pub struct IpRouteTable;

impl IpRouteTable {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RouteTable for IpRouteTable {
    async fn list(&self, protocol: u8) -> Result<Vec<Route>> {
        let proto = protocol.to_string();
        let output = run_tool("ip", ["-4", "route", "show", "proto", proto.as_str()])
            .await
            .map_err(Error::RouteSync)?;
        Ok(parse_routes(&output, protocol))
    }

    async fn add(&self, route: &Route) -> Result<()> {
        route_command("add", route).await?;
        debug!("Added route {}", route);
        Ok(())
    }

    async fn delete(&self, route: &Route) -> Result<()> {
        route_command("del", route).await?;
        debug!("Deleted route {}", route);
        Ok(())
    }
}

async fn route_command(action: &str, route: &Route) -> Result<()> {
    let destination = route.destination.to_string();
    let gateway = route.gateway.to_string();
    let proto = route.protocol.to_string();
    run_tool(
        "ip",
        [
            "-4",
            "route",
            action,
            destination.as_str(),
            "via",
            gateway.as_str(),
            "proto",
            proto.as_str(),
        ],
    )
    .await
    .map_err(|e| Error::RouteSync(format!("{}: {}", route, e)))?;
    Ok(())
}

/// Parse `ip -4 route show proto N` output. Lines without a gateway are
/// skipped since the controller only installs gateway routes.
pub fn parse_routes(output: &str, protocol: u8) -> Vec<Route> {
    let mut routes = Vec::new();

    for line in output.lines() {
        let mut words = line.split_whitespace();
        let Some(destination) = words.next() else {
            continue;
        };

        let destination = if destination.contains('/') {
            destination.parse::<Ipv4Network>()
        } else {
            destination
                .parse::<Ipv4Addr>()
                .map_err(|_| ipnetwork::IpNetworkError::InvalidAddr(destination.to_string()))
                .and_then(|addr| Ipv4Network::new(addr, 32))
        };
        let Ok(destination) = destination else {
            warn!("Skipping unparsable route line: {}", line);
            continue;
        };

        let gateway = words
            .skip_while(|w| *w != "via")
            .nth(1)
            .and_then(|gw| gw.parse::<Ipv4Addr>().ok());

        match gateway {
            Some(gateway) => routes.push(Route {
                destination,
                gateway,
                protocol,
            }),
            None => debug!("Ignoring route without gateway: {}", line),
        }
    }

    routes
}
