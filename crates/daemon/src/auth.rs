//! Credential and session engine
//!
//! Passwords are stored as salted Argon2id hashes. Session and API key
//! tokens are random 32-byte values; only their SHA-256 digest is stored,
//! so a leaked database does not yield usable credentials.

use crate::config::AuthConfig;
use crate::permission::{attributes_grant, Capability, Permission, RolePolicy};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wgctl_common::crypto::{
    decode_token, encode_token, generate_salt, generate_token, hash_password, hash_token,
    verify_password,
};
use wgctl_common::{
    now_millis, Account, AccountRole, ApiKey, Database, Error, PasswordHash, Result, Session,
};

const MIN_PASSWORD_LEN: usize = 8;

/// Authenticated caller of a control operation
#[derive(Debug, Clone, PartialEq)]
pub enum Principal {
    Account(Account),
    ApiKey(ApiKey),
}

impl Principal {
    /// Name used in logs
    pub fn name(&self) -> String {
        match self {
            Principal::Account(account) => account.email.clone(),
            Principal::ApiKey(key) => format!("api key {}", key.name),
        }
    }
}

/// Freshly issued session token. The raw token is only ever held here.
#[derive(Clone)]
pub struct SessionToken {
    pub token: String,
    pub email: String,
    pub expires_at: i64,
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("email", &self.email)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Credential engine gating every control operation
pub struct AuthService {
    db: Database,
    policy: RolePolicy,
    session_ttl: Duration,
    max_failed_attempts: u32,
}

impl AuthService {
    pub fn new(db: Database, config: &AuthConfig) -> Self {
        Self {
            db,
            policy: RolePolicy::new(),
            session_ttl: config.session_ttl(),
            max_failed_attempts: config.max_failed_attempts,
        }
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    /// Salt and hash a new password
    pub fn hash_new_password(password: &str) -> Result<PasswordHash> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(Error::Validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        let salt = generate_salt();
        let hash = hash_password(password.as_bytes(), &salt)?;
        Ok(PasswordHash {
            hash,
            salt: salt.to_vec(),
        })
    }

    /// Replace all admin accounts with the configured master admin
    pub fn bootstrap_admin(&self, email: &str, password: &str) -> Result<()> {
        validate_email(email)?;
        let password = Self::hash_new_password(password)?;
        self.db.replace_admin(email, &password)?;
        info!("Bootstrapped admin account {}", email);
        Ok(())
    }

    pub fn create_account(&self, email: &str, role: AccountRole, password: &str) -> Result<Account> {
        validate_email(email)?;
        let password = Self::hash_new_password(password)?;
        let account = self.db.insert_account(email, role, &password)?;
        info!("Created {} account {}", role, email);
        Ok(account)
    }

    /// Set a new password and revoke every session of the account
    pub fn change_password(&self, email: &str, password: &str) -> Result<usize> {
        let password = Self::hash_new_password(password)?;
        let revoked = self.db.set_password(email, &password)?;
        info!("Password changed for {}, {} sessions revoked", email, revoked);
        Ok(revoked)
    }

    /// Lift a login suspension
    pub fn unlock(&self, email: &str) -> Result<()> {
        self.db.reset_failed_attempts(email)?;
        info!("Unlocked account {}", email);
        Ok(())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Verify a password and open a session
    pub fn login(&self, email: &str, password: &str) -> Result<SessionToken> {
        let Some(account) = self.db.get_account(email)? else {
            // Spend the same hashing time as a real check
            let _ = hash_password(password.as_bytes(), &generate_salt());
            return Err(Error::Auth(format!("unknown account {}", email)));
        };

        // Reserve the attempt first so concurrent guesses cannot all pass
        // the limit check before any of them is counted
        let Some(attempts) = self
            .db
            .reserve_login_attempt(&account.email, self.max_failed_attempts)?
        else {
            return Err(Error::Auth(format!("account {} is suspended", email)));
        };

        let stored = self
            .db
            .get_password_hash(email)?
            .ok_or_else(|| Error::Auth(format!("account {} has no password", email)))?;

        if !verify_password(password.as_bytes(), &stored.salt, &stored.hash)? {
            if attempts >= self.max_failed_attempts {
                warn!("Account {} suspended after {} failed logins", email, attempts);
            }
            return Err(Error::Auth(format!("wrong password for {}", email)));
        }

        self.db.reset_failed_attempts(email)?;

        let token = generate_token();
        let now = now_millis();
        let expires_at = now + self.session_ttl.as_millis() as i64;
        self.db.create_session(&Session {
            token_hash: hash_token(&token),
            email: email.to_string(),
            expires_at,
        })?;
        self.db.touch_account(email, now)?;

        info!("Account {} logged in", email);
        Ok(SessionToken {
            token: encode_token(&token),
            email: email.to_string(),
            expires_at,
        })
    }

    /// Resolve a session token to its account
    pub fn check_session(&self, token: &str) -> Result<Account> {
        let token = decode_token(token)?;
        let token_hash = hash_token(&token);

        let session = self
            .db
            .get_session(&token_hash)?
            .ok_or_else(|| Error::Auth("unknown session".to_string()))?;

        let now = now_millis();
        if session.is_expired(now) {
            self.db.delete_session(&token_hash)?;
            return Err(Error::Auth(format!("session of {} expired", session.email)));
        }

        let account = self
            .db
            .get_account(&session.email)?
            .ok_or_else(|| Error::Auth(format!("session owner {} is gone", session.email)))?;
        self.db.touch_account(&account.email, now)?;
        Ok(account)
    }

    /// Close a session; unknown tokens are not an error
    pub fn logout(&self, token: &str) -> Result<bool> {
        let token = decode_token(token)?;
        let removed = self.db.delete_session(&hash_token(&token))?;
        if removed {
            debug!("Session closed");
        }
        Ok(removed)
    }

    /// Drop expired sessions
    pub fn collect_expired_sessions(&self) -> Result<usize> {
        self.db.delete_expired_sessions(now_millis())
    }

    /// Run the expired-session sweep until cancelled
    pub async fn run_session_gc(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.collect_expired_sessions() {
                    Ok(0) => {}
                    Ok(n) => info!("Removed {} expired sessions", n),
                    Err(e) => warn!("Failed to remove expired sessions: {}", e),
                },
            }
        }
    }

    // ========================================================================
    // API keys
    // ========================================================================

    /// Store a key under the hash of `token`
    pub fn create_api_key(&self, key: &ApiKey, token: &str) -> Result<()> {
        if key.name.trim().is_empty() {
            return Err(Error::Validation("api key name is required".to_string()));
        }
        validate_attributes(&key.attributes)?;

        let token = decode_token(token)
            .map_err(|_| Error::Validation("token is not url-safe base64".to_string()))?;
        if token.len() < wgctl_common::crypto::TOKEN_LEN {
            return Err(Error::Validation(format!(
                "token must be at least {} bytes",
                wgctl_common::crypto::TOKEN_LEN
            )));
        }

        self.db.insert_api_key(key, &hash_token(&token))?;
        info!("Created API key {} ({})", key.name, key.uuid);
        Ok(())
    }

    /// Update name, expiry and attributes of a key
    pub fn update_api_key(&self, key: &ApiKey) -> Result<()> {
        validate_attributes(&key.attributes)?;
        self.db.update_api_key(key)
    }

    pub fn delete_api_key(&self, uuid: Uuid) -> Result<()> {
        self.db.delete_api_key(uuid)?;
        info!("Deleted API key {}", uuid);
        Ok(())
    }

    /// Resolve an API key and check it carries `permission`
    pub fn check_api_key(&self, token: &str, permission: &Permission) -> Result<ApiKey> {
        let token = decode_token(token)?;
        let key = self
            .db
            .get_api_key_by_hash(&hash_token(&token))?
            .ok_or_else(|| Error::Auth("unknown api key".to_string()))?;

        if key.is_expired(now_millis()) {
            return Err(Error::Auth(format!("api key {} expired", key.name)));
        }
        if !attributes_grant(&key.attributes, permission) {
            return Err(Error::Auth(format!(
                "api key {} lacks {}",
                key.name, permission
            )));
        }
        Ok(key)
    }

    // ========================================================================
    // Authorization
    // ========================================================================

    /// Check that an account's role allows `permission`
    pub fn authorize_account(&self, account: &Account, permission: &Permission) -> Result<()> {
        if self.policy.has_permission(account.role, permission) {
            Ok(())
        } else {
            Err(Error::Auth(format!(
                "{} ({}) lacks {}",
                account.email, account.role, permission
            )))
        }
    }
}

fn validate_email(email: &str) -> Result<()> {
    let valid = email
        .split_once('@')
        .map(|(local, domain)| !local.is_empty() && !domain.is_empty())
        .unwrap_or(false);
    if !valid || email.chars().any(char::is_whitespace) {
        return Err(Error::Validation(format!("invalid email address: {}", email)));
    }
    Ok(())
}

fn validate_attributes(attributes: &[String]) -> Result<()> {
    for attribute in attributes {
        if let Capability::Exact(name) = Capability::parse(attribute) {
            let known = name
                .split_once('-')
                .map(|(verb, resource)| {
                    matches!(verb, "read" | "write" | "delete")
                        && resource.parse::<crate::permission::Resource>().is_ok()
                })
                .unwrap_or(false);
            if !known {
                return Err(Error::Validation(format!("unknown capability: {}", name)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{Resource, Verb, WG_CLIENT_CAPABILITY};
    use crate::testing::test_db;

    const EMAIL: &str = "admin@example.com";
    const PASSWORD: &str = "correct horse";

    fn service() -> AuthService {
        let auth = AuthService::new(test_db(), &AuthConfig::default());
        auth.bootstrap_admin(EMAIL, PASSWORD).unwrap();
        auth
    }

    fn read_peers() -> Permission {
        Permission::new(Verb::Read, Resource::Peers)
    }

    #[test]
    fn test_login_and_session() {
        let auth = service();
        let session = auth.login(EMAIL, PASSWORD).unwrap();
        assert!(session.expires_at > now_millis());

        let account = auth.check_session(&session.token).unwrap();
        assert_eq!(account.email, EMAIL);
        assert!(account.last_active.is_some());

        assert!(auth.logout(&session.token).unwrap());
        assert!(matches!(auth.check_session(&session.token), Err(Error::Auth(_))));
    }

    #[test]
    fn test_session_ttl_is_twelve_hours() {
        let auth = service();
        let before = now_millis();
        let session = auth.login(EMAIL, PASSWORD).unwrap();
        let ttl = session.expires_at - before;
        assert!((12 * 3600 * 1000..=12 * 3600 * 1000 + 5_000).contains(&ttl));
    }

    #[test]
    fn test_wrong_password_rejected() {
        let auth = service();
        assert!(matches!(auth.login(EMAIL, "wrong password"), Err(Error::Auth(_))));
        assert!(matches!(auth.login("nobody@example.com", PASSWORD), Err(Error::Auth(_))));
    }

    #[test]
    fn test_suspension_after_five_failures() {
        let auth = service();
        for _ in 0..4 {
            assert!(auth.login(EMAIL, "wrong password").is_err());
        }
        // Success below the limit resets the counter
        auth.login(EMAIL, PASSWORD).unwrap();
        assert_eq!(auth.db.get_account(EMAIL).unwrap().unwrap().failed_attempts, 0);

        for _ in 0..5 {
            assert!(auth.login(EMAIL, "wrong password").is_err());
        }
        assert!(matches!(auth.login(EMAIL, PASSWORD), Err(Error::Auth(_))));

        auth.unlock(EMAIL).unwrap();
        auth.login(EMAIL, PASSWORD).unwrap();
    }

    #[test]
    fn test_concurrent_guesses_bounded_by_limit() {
        let auth = service();
        let barrier = std::sync::Barrier::new(32);

        std::thread::scope(|scope| {
            for _ in 0..32 {
                scope.spawn(|| {
                    barrier.wait();
                    assert!(auth.login(EMAIL, "wrong password").is_err());
                });
            }
        });

        let account = auth.db.get_account(EMAIL).unwrap().unwrap();
        assert_eq!(account.failed_attempts, 5);
        assert!(matches!(auth.login(EMAIL, PASSWORD), Err(Error::Auth(_))));
    }

    #[test]
    fn test_correct_password_in_burst_cannot_reopen_suspended_account() {
        let auth = service();
        for _ in 0..5 {
            assert!(auth.login(EMAIL, "wrong password").is_err());
        }

        let barrier = std::sync::Barrier::new(8);
        std::thread::scope(|scope| {
            for i in 0..8 {
                let barrier = &barrier;
                let auth = &auth;
                scope.spawn(move || {
                    barrier.wait();
                    let password = if i == 0 { PASSWORD } else { "wrong password" };
                    assert!(auth.login(EMAIL, password).is_err());
                });
            }
        });
        assert_eq!(auth.db.get_account(EMAIL).unwrap().unwrap().failed_attempts, 5);
    }

    #[test]
    fn test_tampered_token_rejected() {
        let auth = service();
        let session = auth.login(EMAIL, PASSWORD).unwrap();
        let raw = decode_token(&session.token).unwrap();

        for i in 0..raw.len() {
            let mut tampered = raw.to_vec();
            tampered[i] ^= 0x01;
            assert!(auth.check_session(&encode_token(&tampered)).is_err());
        }
        assert!(auth.check_session("not base64!").is_err());
    }

    #[test]
    fn test_expired_session_rejected() {
        let auth = service();
        let token = generate_token();
        auth.db
            .create_session(&Session {
                token_hash: hash_token(&token),
                email: EMAIL.to_string(),
                expires_at: now_millis() - 1,
            })
            .unwrap();

        assert!(matches!(
            auth.check_session(&encode_token(&token)),
            Err(Error::Auth(_))
        ));
        assert_eq!(auth.collect_expired_sessions().unwrap(), 0);
    }

    #[test]
    fn test_change_password_revokes_sessions() {
        let auth = service();
        let session = auth.login(EMAIL, PASSWORD).unwrap();

        assert_eq!(auth.change_password(EMAIL, "battery staple").unwrap(), 1);
        assert!(auth.check_session(&session.token).is_err());
        assert!(auth.login(EMAIL, PASSWORD).is_err());
        auth.login(EMAIL, "battery staple").unwrap();
    }

    #[test]
    fn test_short_password_rejected() {
        let auth = service();
        assert!(matches!(
            auth.create_account("user@example.com", AccountRole::User, "short"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_api_key_capabilities() {
        let auth = service();
        let token = encode_token(&generate_token());
        let key = ApiKey {
            uuid: Uuid::new_v4(),
            name: "reader".to_string(),
            expires_at: 0,
            attributes: vec!["read-peers".to_string()],
        };
        auth.create_api_key(&key, &token).unwrap();

        assert_eq!(auth.check_api_key(&token, &read_peers()).unwrap(), key);
        assert!(matches!(
            auth.check_api_key(&token, &Permission::new(Verb::Write, Resource::Peers)),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_wg_client_api_key() {
        let auth = service();
        let token = encode_token(&generate_token());
        let key = ApiKey {
            uuid: Uuid::new_v4(),
            name: "gateway".to_string(),
            expires_at: 0,
            attributes: vec![WG_CLIENT_CAPABILITY.to_string()],
        };
        auth.create_api_key(&key, &token).unwrap();

        assert!(auth.check_api_key(&token, &read_peers()).is_ok());
        assert!(auth
            .check_api_key(&token, &Permission::new(Verb::Read, Resource::Poll))
            .is_ok());
        assert!(auth
            .check_api_key(&token, &Permission::new(Verb::Delete, Resource::Accounts))
            .is_err());
    }

    #[test]
    fn test_expired_api_key_rejected() {
        let auth = service();
        let token = encode_token(&generate_token());
        let key = ApiKey {
            uuid: Uuid::new_v4(),
            name: "old".to_string(),
            expires_at: now_millis() - 1,
            attributes: vec!["read-peers".to_string()],
        };
        auth.create_api_key(&key, &token).unwrap();
        assert!(matches!(
            auth.check_api_key(&token, &read_peers()),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_unknown_capability_rejected() {
        let auth = service();
        let key = ApiKey {
            uuid: Uuid::new_v4(),
            name: "typo".to_string(),
            expires_at: 0,
            attributes: vec!["raed-peers".to_string()],
        };
        assert!(matches!(
            auth.create_api_key(&key, &encode_token(&generate_token())),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_account_role_authorization() {
        let auth = service();
        let user = auth
            .create_account("user@example.com", AccountRole::User, "user password")
            .unwrap();
        let admin = auth.db.get_account(EMAIL).unwrap().unwrap();
        let write_peers = Permission::new(Verb::Write, Resource::Peers);

        assert!(auth.authorize_account(&user, &read_peers()).is_ok());
        assert!(auth.authorize_account(&user, &write_peers).is_err());
        assert!(auth.authorize_account(&admin, &write_peers).is_ok());
    }

    #[test]
    fn test_bootstrap_replaces_previous_admin() {
        let auth = service();
        auth.bootstrap_admin("new-admin@example.com", PASSWORD).unwrap();
        assert!(auth.db.get_account(EMAIL).unwrap().is_none());
        auth.login("new-admin@example.com", PASSWORD).unwrap();
    }
}
