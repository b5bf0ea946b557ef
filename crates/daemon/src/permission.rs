//! Permissions and capabilities
//!
//! A permission is `<verb>-<resource>`, derived from the HTTP method and the
//! first path segment after the API prefix. Accounts get permissions through
//! their role; API keys carry them directly as attributes.

use axum::http::Method;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use wgctl_common::{AccountRole, Error, Result};

/// Prefix every controlled route lives under
pub const API_PREFIX: &str = "/api/v1/";

/// Blanket capability for machine peers polling their own configuration
pub const WG_CLIENT_CAPABILITY: &str = "wg-client";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Read,
    Write,
    Delete,
}

impl Verb {
    pub fn from_method(method: &Method) -> Option<Self> {
        match *method {
            Method::GET | Method::HEAD => Some(Self::Read),
            Method::POST | Method::PUT | Method::PATCH => Some(Self::Write),
            Method::DELETE => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Peers,
    Accounts,
    ApiKeys,
    ServerInfo,
    Poll,
    Resync,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Peers => "peers",
            Self::Accounts => "accounts",
            Self::ApiKeys => "apikeys",
            Self::ServerInfo => "serverinfo",
            Self::Poll => "poll",
            Self::Resync => "resync",
        }
    }

    /// Resource named by the first segment after [`API_PREFIX`]
    pub fn from_path(path: &str) -> Option<Self> {
        let rest = path.strip_prefix(API_PREFIX)?;
        let segment = rest.split('/').next().unwrap_or_default();
        segment.parse().ok()
    }
}

impl FromStr for Resource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "peers" => Ok(Self::Peers),
            "accounts" => Ok(Self::Accounts),
            "apikeys" => Ok(Self::ApiKeys),
            "serverinfo" => Ok(Self::ServerInfo),
            "poll" => Ok(Self::Poll),
            "resync" => Ok(Self::Resync),
            _ => Err(Error::Validation(format!("unknown resource: {}", s))),
        }
    }
}

/// Permission required by one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Permission {
    pub verb: Verb,
    pub resource: Resource,
}

impl Permission {
    pub fn new(verb: Verb, resource: Resource) -> Self {
        Self { verb, resource }
    }

    /// Permission for a request, `None` for routes outside the API
    pub fn for_request(method: &Method, path: &str) -> Option<Self> {
        Some(Self {
            verb: Verb::from_method(method)?,
            resource: Resource::from_path(path)?,
        })
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.verb.as_str(), self.resource.as_str())
    }
}

/// One entry of an API key's attribute set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// Exactly one permission, e.g. `read-peers`
    Exact(String),
    /// Read-only access to peers, polling and server info
    WgClient,
}

impl Capability {
    pub fn parse(attribute: &str) -> Self {
        match attribute {
            WG_CLIENT_CAPABILITY => Self::WgClient,
            other => Self::Exact(other.to_string()),
        }
    }

    pub fn grants(&self, permission: &Permission) -> bool {
        match self {
            Self::Exact(name) => *name == permission.to_string(),
            Self::WgClient => {
                permission.verb == Verb::Read
                    && matches!(
                        permission.resource,
                        Resource::Peers | Resource::Poll | Resource::ServerInfo
                    )
            }
        }
    }
}

/// Whether an API key with `attributes` may perform `permission`
pub fn attributes_grant(attributes: &[String], permission: &Permission) -> bool {
    attributes
        .iter()
        .map(|a| Capability::parse(a))
        .any(|c| c.grants(permission))
}

/// Role to permission policy for accounts
pub struct RolePolicy {
    role_permissions: HashMap<AccountRole, HashSet<String>>,
}

impl RolePolicy {
    pub fn new() -> Self {
        let mut role_permissions = HashMap::new();
        role_permissions.insert(AccountRole::Admin, HashSet::from(["*".to_string()]));
        role_permissions.insert(
            AccountRole::User,
            HashSet::from([
                "read-peers".to_string(),
                "read-serverinfo".to_string(),
                "read-poll".to_string(),
            ]),
        );
        Self { role_permissions }
    }

    /// Check if `role` holds `permission`
    pub fn has_permission(&self, role: AccountRole, permission: &Permission) -> bool {
        let Some(perms) = self.role_permissions.get(&role) else {
            return false;
        };
        if perms.contains("*") {
            return true;
        }
        // Resource wildcard, e.g. "*-peers"
        if perms.contains(&format!("*-{}", permission.resource.as_str())) {
            return true;
        }
        perms.contains(&permission.to_string())
    }
}

impl Default for RolePolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perm(method: Method, path: &str) -> Permission {
        Permission::for_request(&method, path).unwrap()
    }

    #[test]
    fn test_permission_from_request() {
        assert_eq!(perm(Method::GET, "/api/v1/peers").to_string(), "read-peers");
        assert_eq!(perm(Method::PUT, "/api/v1/peers/:uuid").to_string(), "write-peers");
        assert_eq!(perm(Method::PATCH, "/api/v1/accounts/:email/password").to_string(), "write-accounts");
        assert_eq!(perm(Method::DELETE, "/api/v1/apikeys/:uuid").to_string(), "delete-apikeys");
        assert_eq!(perm(Method::POST, "/api/v1/resync").to_string(), "write-resync");
        assert!(Permission::for_request(&Method::GET, "/api/v1/unknown").is_none());
        assert!(Permission::for_request(&Method::GET, "/metrics").is_none());
        assert!(Permission::for_request(&Method::OPTIONS, "/api/v1/peers").is_none());
    }

    #[test]
    fn test_exact_capability() {
        let attrs = vec!["read-peers".to_string()];
        assert!(attributes_grant(&attrs, &perm(Method::GET, "/api/v1/peers")));
        assert!(!attributes_grant(&attrs, &perm(Method::PUT, "/api/v1/peers/:uuid")));
        assert!(!attributes_grant(&attrs, &perm(Method::GET, "/api/v1/accounts")));
    }

    #[test]
    fn test_wg_client_capability() {
        let attrs = vec![WG_CLIENT_CAPABILITY.to_string()];
        assert!(attributes_grant(&attrs, &perm(Method::GET, "/api/v1/peers")));
        assert!(attributes_grant(&attrs, &perm(Method::GET, "/api/v1/poll")));
        assert!(attributes_grant(&attrs, &perm(Method::GET, "/api/v1/serverinfo")));
        assert!(!attributes_grant(&attrs, &perm(Method::PUT, "/api/v1/peers/:uuid")));
        assert!(!attributes_grant(&attrs, &perm(Method::DELETE, "/api/v1/accounts/:email")));
        assert!(!attributes_grant(&attrs, &perm(Method::GET, "/api/v1/apikeys")));
    }

    #[test]
    fn test_empty_attributes_grant_nothing() {
        assert!(!attributes_grant(&[], &perm(Method::GET, "/api/v1/peers")));
    }

    #[test]
    fn test_role_policy() {
        let policy = RolePolicy::new();
        assert!(policy.has_permission(AccountRole::Admin, &perm(Method::DELETE, "/api/v1/accounts/:email")));
        assert!(policy.has_permission(AccountRole::User, &perm(Method::GET, "/api/v1/peers")));
        assert!(policy.has_permission(AccountRole::User, &perm(Method::GET, "/api/v1/poll")));
        assert!(!policy.has_permission(AccountRole::User, &perm(Method::PUT, "/api/v1/peers/:uuid")));
        assert!(!policy.has_permission(AccountRole::User, &perm(Method::GET, "/api/v1/accounts")));
    }
}
