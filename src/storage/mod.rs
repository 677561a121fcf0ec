use crate::domain::auth::RefreshTokenRecord;
use crate::domain::user::User;
use crate::error::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

pub mod memory;
pub mod refresh_token_repo;
pub mod user_repo;

pub type DbPool = Pool<Postgres>;

/// Initializes the database connection pool.
///
/// # Errors
/// Returns `sqlx::Error` if the connection fails.
pub async fn init_pool(database_url: &str) -> std::result::Result<DbPool, sqlx::Error> {
    PgPoolOptions::new().max_connections(20).connect(database_url).await
}

/// Identity store. Emails are compared case-insensitively; callers pass
/// them already normalized to lowercase.
#[async_trait]
pub trait UserStore: Send + Sync + std::fmt::Debug {
    /// Fails with `Conflict` if the email is already registered.
    async fn create(&self, email: &str, name: &str) -> Result<User>;

    async fn find_by_id(&self, id: i64) -> Result<Option<User>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Returns the updated user, or `None` if the id does not exist.
    async fn mark_verified(&self, id: i64) -> Result<Option<User>>;

    async fn set_setup_token(&self, id: i64, token: &str, expires_at: OffsetDateTime) -> Result<()>;

    async fn set_reset_token(&self, id: i64, token: &str, expires_at: OffsetDateTime) -> Result<()>;

    /// Atomically clears the setup-token slot iff it holds `token`, returning
    /// the user as it was before the clear. Single-use by construction: a
    /// second call with the same string finds nothing.
    async fn take_setup_token(&self, token: &str) -> Result<Option<User>>;

    /// Reset-token counterpart of [`Self::take_setup_token`].
    async fn take_reset_token(&self, token: &str) -> Result<Option<User>>;

    async fn set_password(&self, id: i64, password_hash: &str) -> Result<()>;
}

/// Refresh-token ledger: single-use, revocable session records with replay
/// detection. Record ids are generated by the caller (UUIDv4) so the signed
/// token can embed its own record id before the insert.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync + std::fmt::Debug {
    async fn create(&self, record: RefreshTokenRecord) -> Result<RefreshTokenRecord>;

    /// The correctness-critical single-use consumption. As one atomic unit:
    /// missing record fails `TokenNotFound`; a revoked record is a replay
    /// signal, revoking every other live record for the user and failing
    /// `TokenRevoked`; an expired record is deleted and fails `TokenExpired`;
    /// otherwise the record is deleted and `replacement` inserted. Two
    /// concurrent calls for the same id cannot both succeed: the loser
    /// observes `TokenNotFound` or `TokenRevoked`.
    async fn consume_and_rotate(
        &self,
        token_id: Uuid,
        user_id: i64,
        replacement: RefreshTokenRecord,
    ) -> Result<RefreshTokenRecord>;

    /// Marks the record revoked; idempotent, missing ids are ignored.
    async fn revoke(&self, token_id: Uuid) -> Result<()>;

    /// Revokes every non-revoked record owned by the user; idempotent.
    /// Returns the number of records revoked.
    async fn revoke_all_for_user(&self, user_id: i64) -> Result<u64>;

    async fn find_by_id(&self, token_id: Uuid) -> Result<Option<RefreshTokenRecord>>;

    /// Sweeps naturally-expired records. Returns the number deleted.
    async fn delete_expired(&self) -> Result<u64>;
}
