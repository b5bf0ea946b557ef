//! Account and session persistence

use super::{map_conflict, Database};
use crate::types::{Account, AccountRole, PasswordHash, Session};
use crate::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, u32, Option<i64>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn parse_account(raw: (String, String, u32, Option<i64>)) -> Result<Account> {
    let (email, role, failed_attempts, last_active) = raw;
    Ok(Account {
        email,
        role: role.parse()?,
        failed_attempts,
        last_active,
    })
}

impl Database {
    // ========================================================================
    // Account operations
    // ========================================================================

    /// Create an account with its password hash
    pub fn insert_account(&self, email: &str, role: AccountRole, password: &PasswordHash) -> Result<Account> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO accounts (email, role, password_hash, password_salt, failed_attempts)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![email, role.to_string(), password.hash, password.salt],
        )
        .map_err(|e| map_conflict(e, "account", email))?;

        debug!("Inserted account {}", email);
        Ok(Account {
            email: email.to_string(),
            role,
            failed_attempts: 0,
            last_active: None,
        })
    }

    /// Get an account by email
    pub fn get_account(&self, email: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT email, role, failed_attempts, last_active FROM accounts WHERE email = ?1",
                params![email],
                account_from_row,
            )
            .optional()?;
        raw.map(parse_account).transpose()
    }

    /// List all accounts
    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT email, role, failed_attempts, last_active FROM accounts ORDER BY email",
            )?;
            let rows = stmt
                .query_map([], account_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(parse_account).collect()
    }

    /// Stored password hash and salt for an account
    pub fn get_password_hash(&self, email: &str) -> Result<Option<PasswordHash>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT password_hash, password_salt FROM accounts WHERE email = ?1",
                params![email],
                |row| {
                    Ok(PasswordHash {
                        hash: row.get(0)?,
                        salt: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    /// Change an account's role
    pub fn update_account_role(&self, email: &str, role: AccountRole) -> Result<Account> {
        {
            let conn = self.conn.lock();
            let changed = conn.execute(
                "UPDATE accounts SET role = ?1 WHERE email = ?2",
                params![role.to_string(), email],
            )?;
            if changed == 0 {
                return Err(Error::not_found("account", email));
            }
        }
        self.get_account(email)?
            .ok_or_else(|| Error::not_found("account", email))
    }

    /// Replace the password and drop every session of the account in one
    /// transaction. Returns the number of sessions removed.
    pub fn set_password(&self, email: &str, password: &PasswordHash) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE accounts SET password_hash = ?1, password_salt = ?2 WHERE email = ?3",
            params![password.hash, password.salt, email],
        )?;
        if changed == 0 {
            return Err(Error::not_found("account", email));
        }
        let sessions = tx.execute("DELETE FROM sessions WHERE email = ?1", params![email])?;
        tx.commit()?;

        debug!("Password changed for {}, {} sessions revoked", email, sessions);
        Ok(sessions)
    }

    /// Count a login attempt against the failure limit before the password
    /// is checked. Returns the new counter, or `None` once the account has
    /// reached `limit`. A successful login gives the attempt back through
    /// [`Database::reset_failed_attempts`].
    pub fn reserve_login_attempt(&self, email: &str, limit: u32) -> Result<Option<u32>> {
        let conn = self.conn.lock();
        let attempts = conn
            .query_row(
                "UPDATE accounts SET failed_attempts = failed_attempts + 1
                 WHERE email = ?1 AND failed_attempts < ?2 RETURNING failed_attempts",
                params![email, limit],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempts)
    }

    /// Reset the failed-login counter
    pub fn reset_failed_attempts(&self, email: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE accounts SET failed_attempts = 0 WHERE email = ?1",
            params![email],
        )?;
        if changed == 0 {
            return Err(Error::not_found("account", email));
        }
        Ok(())
    }

    /// Record account activity
    pub fn touch_account(&self, email: &str, now_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE accounts SET last_active = ?1 WHERE email = ?2",
            params![now_ms, email],
        )?;
        Ok(())
    }

    /// Delete an account and its sessions
    pub fn delete_account(&self, email: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sessions WHERE email = ?1", params![email])?;
        let changed = tx.execute("DELETE FROM accounts WHERE email = ?1", params![email])?;
        if changed == 0 {
            return Err(Error::not_found("account", email));
        }
        tx.commit()?;
        debug!("Deleted account {}", email);
        Ok(())
    }

    /// Replace every admin account with a single one
    pub fn replace_admin(&self, email: &str, password: &PasswordHash) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM sessions WHERE email IN (SELECT email FROM accounts WHERE role = 'admin' OR email = ?1)",
            params![email],
        )?;
        tx.execute(
            "DELETE FROM accounts WHERE role = 'admin' OR email = ?1",
            params![email],
        )?;
        tx.execute(
            "INSERT INTO accounts (email, role, password_hash, password_salt, failed_attempts)
             VALUES (?1, 'admin', ?2, ?3, 0)",
            params![email, password.hash, password.salt],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Session operations
    // ========================================================================

    pub fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token_hash, email, expires_at) VALUES (?1, ?2, ?3)",
            params![session.token_hash, session.email, session.expires_at],
        )
        .map_err(|e| map_conflict(e, "session", &session.email))?;
        Ok(())
    }

    pub fn get_session(&self, token_hash: &[u8]) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT token_hash, email, expires_at FROM sessions WHERE token_hash = ?1",
                params![token_hash],
                |row| {
                    Ok(Session {
                        token_hash: row.get(0)?,
                        email: row.get(1)?,
                        expires_at: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// Returns true if a session was removed
    pub fn delete_session(&self, token_hash: &[u8]) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            params![token_hash],
        )?;
        Ok(changed > 0)
    }

    /// Remove every session that expired at or before `now_ms`
    pub fn delete_expired_sessions(&self, now_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![now_ms],
        )?;
        Ok(count)
    }
}
