use crate::domain::user::User;
use crate::error::{AppError, Result};
use crate::storage::{DbPool, UserStore};
use async_trait::async_trait;
use time::OffsetDateTime;

const USER_COLUMNS: &str = "id, email, name, password_hash, role, is_verified, \
     password_setup_token, password_setup_expires_at, \
     password_reset_token, password_reset_expires_at, created_at";

#[derive(Clone)]
pub struct PgUserStore {
    pool: DbPool,
}

impl std::fmt::Debug for PgUserStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgUserStore").finish_non_exhaustive()
    }
}

impl PgUserStore {
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, email: &str, name: &str) -> Result<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (email, name) VALUES ($1, $2) RETURNING {USER_COLUMNS}"
        ))
        .bind(email)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict("email is already registered".to_string())
            }
            _ => AppError::Database(e),
        })?;

        Ok(user)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let user =
            sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"))
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(user)
    }

    async fn mark_verified(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET is_verified = TRUE WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn set_setup_token(&self, id: i64, token: &str, expires_at: OffsetDateTime) -> Result<()> {
        sqlx::query("UPDATE users SET password_setup_token = $2, password_setup_expires_at = $3 WHERE id = $1")
            .bind(id)
            .bind(token)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_reset_token(&self, id: i64, token: &str, expires_at: OffsetDateTime) -> Result<()> {
        sqlx::query("UPDATE users SET password_reset_token = $2, password_reset_expires_at = $3 WHERE id = $1")
            .bind(id)
            .bind(token)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn take_setup_token(&self, token: &str) -> Result<Option<User>> {
        // RETURNING on the UPDATE would report the already-nulled columns.
        // The outer SELECT runs on the pre-update snapshot, so it still sees
        // the old expiry; the consumed token itself comes back via the bind.
        let user = sqlx::query_as::<_, User>(
            "WITH consumed AS (
                 UPDATE users
                 SET password_setup_token = NULL, password_setup_expires_at = NULL
                 WHERE password_setup_token = $1
                 RETURNING id
             )
             SELECT u.id, u.email, u.name, u.password_hash, u.role, u.is_verified,
                    $1 AS password_setup_token,
                    u.password_setup_expires_at,
                    u.password_reset_token, u.password_reset_expires_at, u.created_at
             FROM users u JOIN consumed c ON c.id = u.id",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn take_reset_token(&self, token: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "WITH consumed AS (
                 UPDATE users
                 SET password_reset_token = NULL, password_reset_expires_at = NULL
                 WHERE password_reset_token = $1
                 RETURNING id
             )
             SELECT u.id, u.email, u.name, u.password_hash, u.role, u.is_verified,
                    u.password_setup_token, u.password_setup_expires_at,
                    $1 AS password_reset_token,
                    u.password_reset_expires_at, u.created_at
             FROM users u JOIN consumed c ON c.id = u.id",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn set_password(&self, id: i64, password_hash: &str) -> Result<()> {
        sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
