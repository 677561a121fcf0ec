use crate::domain::auth::RefreshTokenRecord;
use crate::error::{AppError, Result};
use crate::storage::{DbPool, RefreshTokenStore};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

const RECORD_COLUMNS: &str =
    "id, user_id, token, expires_at, revoked, revoked_at, ip_address, user_agent, created_at";

#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: DbPool,
}

impl std::fmt::Debug for PgRefreshTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgRefreshTokenStore").finish_non_exhaustive()
    }
}

impl PgRefreshTokenStore {
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(
        executor: &mut sqlx::PgConnection,
        record: &RefreshTokenRecord,
    ) -> Result<RefreshTokenRecord> {
        let inserted = sqlx::query_as::<_, RefreshTokenRecord>(&format!(
            "INSERT INTO refresh_tokens
                 (id, user_id, token, expires_at, revoked, revoked_at, ip_address, user_agent, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.token)
        .bind(record.expires_at)
        .bind(record.revoked)
        .bind(record.revoked_at)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(record.created_at)
        .fetch_one(executor)
        .await?;
        Ok(inserted)
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn create(&self, record: RefreshTokenRecord) -> Result<RefreshTokenRecord> {
        let mut conn = self.pool.acquire().await?;
        Self::insert(&mut conn, &record).await
    }

    async fn consume_and_rotate(
        &self,
        token_id: Uuid,
        user_id: i64,
        replacement: RefreshTokenRecord,
    ) -> Result<RefreshTokenRecord> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent rotations of the same record;
        // SKIP LOCKED turns the losing caller into a NotFound, never a
        // duplicated session.
        let row = sqlx::query_as::<_, RefreshTokenRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM refresh_tokens WHERE id = $1 FOR UPDATE SKIP LOCKED"
        ))
        .bind(token_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(record) = row else {
            return Err(AppError::TokenNotFound);
        };

        // A record owned by someone else is indistinguishable from a
        // missing one, to avoid cross-user probing.
        if record.user_id != user_id {
            return Err(AppError::TokenNotFound);
        }

        if record.revoked {
            // Replay signal: a previously-revoked token came back, so the
            // whole device set for this user is treated as compromised.
            sqlx::query(
                "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now()
                 WHERE user_id = $1 AND revoked = FALSE",
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Err(AppError::TokenRevoked);
        }

        if record.is_expired() {
            sqlx::query("DELETE FROM refresh_tokens WHERE id = $1").bind(token_id).execute(&mut *tx).await?;
            tx.commit().await?;
            return Err(AppError::TokenExpired);
        }

        sqlx::query("DELETE FROM refresh_tokens WHERE id = $1").bind(token_id).execute(&mut *tx).await?;
        let new_record = Self::insert(&mut *tx, &replacement).await?;
        tx.commit().await?;

        Ok(new_record)
    }

    async fn revoke(&self, token_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now() WHERE id = $1 AND revoked = FALSE",
        )
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_all_for_user(&self, user_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now()
             WHERE user_id = $1 AND revoked = FALSE",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_by_id(&self, token_id: Uuid) -> Result<Option<RefreshTokenRecord>> {
        let record = sqlx::query_as::<_, RefreshTokenRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM refresh_tokens WHERE id = $1"
        ))
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn delete_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < $1")
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
