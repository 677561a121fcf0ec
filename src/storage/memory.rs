//! In-memory implementations of the store seams. The persistence engine is
//! an external collaborator behind [`UserStore`] and [`RefreshTokenStore`];
//! these twins back the integration tests and local development without a
//! database. Each operation runs under one mutex, which gives the same
//! atomicity the Postgres implementations get from row locks.

use crate::domain::auth::RefreshTokenRecord;
use crate::domain::user::{Role, User};
use crate::error::{AppError, Result};
use crate::storage::{RefreshTokenStore, UserStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryUserStore {
    inner: Mutex<UserTable>,
}

#[derive(Debug, Default)]
struct UserTable {
    rows: HashMap<i64, User>,
    next_id: i64,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test fixture hook: inserts a fully-formed user and returns it.
    pub fn insert_user(
        &self,
        email: &str,
        name: &str,
        password_hash: Option<String>,
        role: Role,
        is_verified: bool,
    ) -> User {
        let mut table = self.inner.lock().expect("user table poisoned");
        table.next_id += 1;
        let user = User {
            id: table.next_id,
            email: email.to_lowercase(),
            name: name.to_string(),
            password_hash,
            role,
            is_verified,
            password_setup_token: None,
            password_setup_expires_at: None,
            password_reset_token: None,
            password_reset_expires_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        table.rows.insert(user.id, user.clone());
        user
    }

    fn with_user<F: FnOnce(&mut User)>(&self, id: i64, f: F) -> Option<User> {
        let mut table = self.inner.lock().expect("user table poisoned");
        let user = table.rows.get_mut(&id)?;
        f(user);
        Some(user.clone())
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, email: &str, name: &str) -> Result<User> {
        let mut table = self.inner.lock().expect("user table poisoned");
        if table.rows.values().any(|u| u.email.eq_ignore_ascii_case(email)) {
            return Err(AppError::Conflict("email is already registered".to_string()));
        }
        table.next_id += 1;
        let user = User {
            id: table.next_id,
            email: email.to_lowercase(),
            name: name.to_string(),
            password_hash: None,
            role: Role::User,
            is_verified: false,
            password_setup_token: None,
            password_setup_expires_at: None,
            password_reset_token: None,
            password_reset_expires_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        table.rows.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        let table = self.inner.lock().expect("user table poisoned");
        Ok(table.rows.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let table = self.inner.lock().expect("user table poisoned");
        Ok(table.rows.values().find(|u| u.email.eq_ignore_ascii_case(email)).cloned())
    }

    async fn mark_verified(&self, id: i64) -> Result<Option<User>> {
        Ok(self.with_user(id, |u| u.is_verified = true))
    }

    async fn set_setup_token(&self, id: i64, token: &str, expires_at: OffsetDateTime) -> Result<()> {
        self.with_user(id, |u| {
            u.password_setup_token = Some(token.to_string());
            u.password_setup_expires_at = Some(expires_at);
        });
        Ok(())
    }

    async fn set_reset_token(&self, id: i64, token: &str, expires_at: OffsetDateTime) -> Result<()> {
        self.with_user(id, |u| {
            u.password_reset_token = Some(token.to_string());
            u.password_reset_expires_at = Some(expires_at);
        });
        Ok(())
    }

    async fn take_setup_token(&self, token: &str) -> Result<Option<User>> {
        let mut table = self.inner.lock().expect("user table poisoned");
        let Some(user) = table.rows.values_mut().find(|u| u.password_setup_token.as_deref() == Some(token))
        else {
            return Ok(None);
        };
        let snapshot = user.clone();
        user.password_setup_token = None;
        user.password_setup_expires_at = None;
        Ok(Some(snapshot))
    }

    async fn take_reset_token(&self, token: &str) -> Result<Option<User>> {
        let mut table = self.inner.lock().expect("user table poisoned");
        let Some(user) = table.rows.values_mut().find(|u| u.password_reset_token.as_deref() == Some(token))
        else {
            return Ok(None);
        };
        let snapshot = user.clone();
        user.password_reset_token = None;
        user.password_reset_expires_at = None;
        Ok(Some(snapshot))
    }

    async fn set_password(&self, id: i64, password_hash: &str) -> Result<()> {
        self.with_user(id, |u| u.password_hash = Some(password_hash.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRefreshTokenStore {
    inner: Mutex<HashMap<Uuid, RefreshTokenRecord>>,
}

impl MemoryRefreshTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test fixture hook: counts live (non-revoked, non-expired) records for
    /// a user.
    #[must_use]
    pub fn live_count_for_user(&self, user_id: i64) -> usize {
        let rows = self.inner.lock().expect("ledger poisoned");
        rows.values().filter(|r| r.user_id == user_id && !r.revoked && !r.is_expired()).count()
    }

    /// Test fixture hook: ids of all records owned by a user.
    #[must_use]
    pub fn record_ids_for_user(&self, user_id: i64) -> Vec<Uuid> {
        let rows = self.inner.lock().expect("ledger poisoned");
        rows.values().filter(|r| r.user_id == user_id).map(|r| r.id).collect()
    }

    /// Test fixture hook: force a record's expiry into the past.
    pub fn force_expire(&self, token_id: Uuid) {
        let mut rows = self.inner.lock().expect("ledger poisoned");
        if let Some(record) = rows.get_mut(&token_id) {
            record.expires_at = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        }
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    async fn create(&self, record: RefreshTokenRecord) -> Result<RefreshTokenRecord> {
        let mut rows = self.inner.lock().expect("ledger poisoned");
        rows.insert(record.id, record.clone());
        Ok(record)
    }

    async fn consume_and_rotate(
        &self,
        token_id: Uuid,
        user_id: i64,
        replacement: RefreshTokenRecord,
    ) -> Result<RefreshTokenRecord> {
        // The whole consumption runs under the table lock, so two racing
        // callers serialize and the loser finds the record gone.
        let mut rows = self.inner.lock().expect("ledger poisoned");

        let Some(record) = rows.get(&token_id) else {
            return Err(AppError::TokenNotFound);
        };
        if record.user_id != user_id {
            return Err(AppError::TokenNotFound);
        }

        if record.revoked {
            let now = OffsetDateTime::now_utc();
            for other in rows.values_mut().filter(|r| r.user_id == user_id && !r.revoked) {
                other.revoked = true;
                other.revoked_at = Some(now);
            }
            return Err(AppError::TokenRevoked);
        }

        if record.is_expired() {
            rows.remove(&token_id);
            return Err(AppError::TokenExpired);
        }

        rows.remove(&token_id);
        rows.insert(replacement.id, replacement.clone());
        Ok(replacement)
    }

    async fn revoke(&self, token_id: Uuid) -> Result<()> {
        let mut rows = self.inner.lock().expect("ledger poisoned");
        if let Some(record) = rows.get_mut(&token_id)
            && !record.revoked
        {
            record.revoked = true;
            record.revoked_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn revoke_all_for_user(&self, user_id: i64) -> Result<u64> {
        let mut rows = self.inner.lock().expect("ledger poisoned");
        let now = OffsetDateTime::now_utc();
        let mut revoked = 0;
        for record in rows.values_mut().filter(|r| r.user_id == user_id && !r.revoked) {
            record.revoked = true;
            record.revoked_at = Some(now);
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn find_by_id(&self, token_id: Uuid) -> Result<Option<RefreshTokenRecord>> {
        let rows = self.inner.lock().expect("ledger poisoned");
        Ok(rows.get(&token_id).cloned())
    }

    async fn delete_expired(&self) -> Result<u64> {
        let mut rows = self.inner.lock().expect("ledger poisoned");
        let before = rows.len();
        rows.retain(|_, r| !r.is_expired());
        Ok((before - rows.len()) as u64)
    }
}
