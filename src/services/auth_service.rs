use crate::config::AuthConfig;
use crate::domain::auth::{OpaqueToken, Password, RefreshTokenRecord};
use crate::domain::auth_session::AuthSession;
use crate::domain::user::{SafeUser, User};
use crate::error::{AppError, Result};
use crate::services::mailer::Mailer;
use crate::services::token_service::TokenService;
use crate::storage::{RefreshTokenStore, UserStore};
use opentelemetry::{global, metrics::Counter};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone)]
struct Metrics {
    login_total: Counter<u64>,
    refresh_total: Counter<u64>,
    logout_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("reportdesk-server");
        Self {
            login_total: meter
                .u64_counter("auth_login_total")
                .with_description("Total number of successful login attempts")
                .build(),
            refresh_total: meter
                .u64_counter("auth_refresh_total")
                .with_description("Total number of successful token rotations")
                .build(),
            logout_total: meter
                .u64_counter("auth_logout_total")
                .with_description("Total number of successful logout attempts")
                .build(),
        }
    }
}

/// Authenticated caller identity, attached to the request context by the
/// guard. The role comes from the live user record, not the signed claim.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: i64,
    pub email: String,
    pub role: crate::domain::user::Role,
    pub is_verified: bool,
}

/// Result of admin verification. `email_sent` is surfaced so an admin can
/// retry the notification; a failed send never rolls back the verification.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub user: SafeUser,
    pub email_sent: bool,
}

/// Orchestrates the session lifecycle: registration, admin verification,
/// password setup/reset, login, refresh rotation and revocation.
#[derive(Clone)]
pub struct AuthService {
    config: AuthConfig,
    users: Arc<dyn UserStore>,
    ledger: Arc<dyn RefreshTokenStore>,
    codec: TokenService,
    mailer: Arc<dyn Mailer>,
    metrics: Metrics,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService").finish_non_exhaustive()
    }
}

impl AuthService {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        users: Arc<dyn UserStore>,
        ledger: Arc<dyn RefreshTokenStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let codec = TokenService::new(&config);
        Self { config, users, ledger, codec, mailer, metrics: Metrics::new() }
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    pub async fn register(&self, email: &str, name: &str) -> Result<SafeUser> {
        let email = normalize_email(email)?;
        if name.trim().is_empty() {
            return Err(AppError::Validation("name must not be empty".to_string()));
        }

        // Created unverified with no password; an admin verifies the account
        // and the user sets a password through the setup token flow.
        let user = self.users.create(&email, name.trim()).await?;
        tracing::info!(user_id = user.id, "User registered");
        Ok(user.into())
    }

    /// Admin-driven verification: marks the account verified, issues a
    /// 24-hour setup token and emails it. Email delivery is best-effort.
    #[tracing::instrument(skip(self), err(level = "warn"))]
    pub async fn verify_user(&self, user_id: i64) -> Result<VerifyOutcome> {
        let user = self.users.mark_verified(user_id).await?.ok_or(AppError::NotFound)?;

        let token = OpaqueToken::generate();
        let expires_at = OffsetDateTime::now_utc() + time::Duration::hours(self.config.setup_token_ttl_hours);
        self.users.set_setup_token(user.id, &token, expires_at).await?;

        let email_sent = match self
            .mailer
            .send(
                &user.email,
                "Set up your Reportdesk password",
                &format!("<p>Your account is verified. Use this token to set a password: {token}</p>"),
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(user_id = user.id, error = %e, "Setup email delivery failed");
                false
            }
        };

        Ok(VerifyOutcome { user: user.into(), email_sent })
    }

    #[tracing::instrument(
        skip(self, password),
        fields(user_id = tracing::field::Empty),
        err(level = "warn")
    )]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        ip_address: Option<IpAddr>,
        user_agent: Option<String>,
    ) -> Result<(AuthSession, SafeUser)> {
        let email = normalize_email(email)?;

        let Some(user) = self.users.find_by_email(&email).await? else {
            tracing::debug!("Login failed: user not found");
            // Burn a verification against a throwaway hash so this branch
            // costs the same as a wrong-password attempt.
            let _ = self.verify_password(password.to_string(), DUMMY_HASH.to_string()).await;
            return Err(self.uniform_failure().await);
        };

        tracing::Span::current().record("user_id", user.id);

        // Verification and password-setup states are not secret-dependent,
        // so they are allowed to be distinguishable from bad credentials.
        if !user.is_verified {
            return Err(AppError::AccountNotVerified);
        }
        let Some(hash) = user.password_hash.clone() else {
            return Err(AppError::PasswordNotSet);
        };

        if !self.verify_password(password.to_string(), hash).await? {
            tracing::debug!("Login failed: invalid password");
            return Err(self.uniform_failure().await);
        }

        let session = self.create_session(&user, ip_address, user_agent).await?;
        self.metrics.login_total.add(1, &[]);
        Ok((session, user.into()))
    }

    #[tracing::instrument(
        skip(self, refresh_token),
        fields(user_id = tracing::field::Empty),
        err(level = "warn")
    )]
    pub async fn refresh(
        &self,
        refresh_token: &str,
        ip_address: Option<IpAddr>,
        user_agent: Option<String>,
    ) -> Result<AuthSession> {
        let claims = self.codec.verify_refresh(refresh_token).map_err(|e| {
            tracing::debug!(error = %e, "Refresh token failed verification");
            AppError::InvalidToken
        })?;

        tracing::Span::current().record("user_id", claims.sub);

        // The replacement record and its signed token are minted before the
        // atomic swap so the id exists the moment the token is handed out.
        let new_id = Uuid::new_v4();
        let new_token = self.codec.issue_refresh(claims.sub, &claims.email, new_id)?;
        let replacement = self.new_record(new_id, claims.sub, new_token.clone(), ip_address, user_agent);

        self.ledger.consume_and_rotate(claims.tid, claims.sub, replacement).await?;

        let (access_token, expires_at) = self.codec.issue_access(claims.sub, &claims.email)?;
        self.metrics.refresh_total.add(1, &[]);
        tracing::info!("Tokens rotated successfully");

        Ok(AuthSession {
            access_token,
            refresh_token: new_token,
            expires_at,
            refresh_max_age_secs: self.codec.refresh_ttl_secs(),
        })
    }

    /// Best-effort revocation: an absent or invalid token never fails the
    /// logout, the caller's cookies are cleared regardless.
    #[tracing::instrument(skip(self, refresh_token))]
    pub async fn logout(&self, refresh_token: Option<&str>) {
        if let Some(token) = refresh_token
            && let Ok(claims) = self.codec.verify_refresh(token)
        {
            if let Err(e) = self.ledger.revoke(claims.tid).await {
                tracing::warn!(error = %e, "Logout revocation failed");
            } else {
                self.metrics.logout_total.add(1, &[]);
            }
        }
    }

    #[tracing::instrument(skip(self), err(level = "warn"))]
    pub async fn logout_all(&self, user_id: i64) -> Result<u64> {
        let revoked = self.ledger.revoke_all_for_user(user_id).await?;
        self.metrics.logout_total.add(1, &[]);
        tracing::info!(revoked, "All sessions revoked");
        Ok(revoked)
    }

    /// Consumes a setup token and stores the first password. Does not touch
    /// the ledger: no sessions can exist before the first password.
    #[tracing::instrument(skip(self, token, new_password), err(level = "warn"))]
    pub async fn setup_password(&self, token: &str, new_password: &str) -> Result<SafeUser> {
        validate_password(new_password)?;

        let user = self.users.take_setup_token(token).await?.ok_or(AppError::InvalidToken)?;
        if token_expired(user.password_setup_expires_at) {
            // The slot was already cleared by the take; the expiry just
            // downgrades the outcome.
            return Err(AppError::TokenExpired);
        }
        if !user.is_verified {
            return Err(AppError::AccountNotVerified);
        }

        let hash = self.hash_password(new_password.to_string()).await?;
        self.users.set_password(user.id, &hash).await?;
        tracing::info!(user_id = user.id, "Password set via setup token");
        Ok(user.into())
    }

    /// Always succeeds with the same outcome whether or not the email maps
    /// to an account; the actual work happens on a detached task so response
    /// timing carries no signal either.
    #[tracing::instrument(skip(self))]
    pub async fn forgot_password(&self, email: &str) -> Result<()> {
        let email = normalize_email(email)?;

        let users = Arc::clone(&self.users);
        let mailer = Arc::clone(&self.mailer);
        let ttl = time::Duration::minutes(self.config.reset_token_ttl_mins);
        tokio::spawn(async move {
            let user = match users.find_by_email(&email).await {
                Ok(Some(user)) if user.is_verified => user,
                Ok(_) => return,
                Err(e) => {
                    tracing::error!(error = %e, "Forgot-password lookup failed");
                    return;
                }
            };

            let token = OpaqueToken::generate();
            let expires_at = OffsetDateTime::now_utc() + ttl;
            if let Err(e) = users.set_reset_token(user.id, &token, expires_at).await {
                tracing::error!(error = %e, "Failed to store reset token");
                return;
            }

            if let Err(e) = mailer
                .send(
                    &user.email,
                    "Reset your Reportdesk password",
                    &format!("<p>Use this token to reset your password: {token}</p>"),
                )
                .await
            {
                tracing::warn!(user_id = user.id, error = %e, "Reset email delivery failed");
            }
        });

        Ok(())
    }

    /// Consumes a reset token, stores the new password and revokes every
    /// live session for the user (forced re-login everywhere).
    #[tracing::instrument(skip(self, token, new_password), err(level = "warn"))]
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<SafeUser> {
        validate_password(new_password)?;

        let user = self.users.take_reset_token(token).await?.ok_or(AppError::InvalidToken)?;
        if token_expired(user.password_reset_expires_at) {
            return Err(AppError::TokenExpired);
        }
        if !user.is_verified {
            return Err(AppError::AccountNotVerified);
        }

        let hash = self.hash_password(new_password.to_string()).await?;
        self.users.set_password(user.id, &hash).await?;

        let revoked = self.ledger.revoke_all_for_user(user.id).await?;
        tracing::info!(user_id = user.id, revoked, "Password reset; sessions revoked");
        Ok(user.into())
    }

    pub async fn current_user(&self, user_id: i64) -> Result<SafeUser> {
        let user = self.users.find_by_id(user_id).await?.ok_or(AppError::NotFound)?;
        Ok(user.into())
    }

    /// Guard entry point: cheap unverified-expiry pre-check, signature
    /// verification, then a live lookup so deleted users are rejected and
    /// the attached role is current.
    pub async fn authenticate(&self, access_token: &str) -> Result<CurrentUser> {
        if TokenService::is_expired_unverified(access_token) {
            return Err(AppError::InvalidToken);
        }

        let claims = self.codec.verify_access(access_token)?;
        let user = self.users.find_by_id(claims.sub).await?.ok_or(AppError::InvalidToken)?;

        Ok(CurrentUser { id: user.id, email: user.email, role: user.role, is_verified: user.is_verified })
    }

    /// Security-sensitive role check: always re-reads the live record rather
    /// than trusting the short-lived claim.
    pub async fn ensure_admin(&self, user_id: i64) -> Result<()> {
        let user = self.users.find_by_id(user_id).await?.ok_or(AppError::InvalidToken)?;
        if user.is_admin() { Ok(()) } else { Err(AppError::Forbidden) }
    }

    pub async fn ensure_verified(&self, user_id: i64) -> Result<()> {
        let user = self.users.find_by_id(user_id).await?.ok_or(AppError::InvalidToken)?;
        if user.is_verified { Ok(()) } else { Err(AppError::AccountNotVerified) }
    }

    async fn create_session(
        &self,
        user: &User,
        ip_address: Option<IpAddr>,
        user_agent: Option<String>,
    ) -> Result<AuthSession> {
        let record_id = Uuid::new_v4();
        let refresh_token = self.codec.issue_refresh(user.id, &user.email, record_id)?;
        let record = self.new_record(record_id, user.id, refresh_token.clone(), ip_address, user_agent);
        self.ledger.create(record).await?;

        let (access_token, expires_at) = self.codec.issue_access(user.id, &user.email)?;

        Ok(AuthSession {
            access_token,
            refresh_token,
            expires_at,
            refresh_max_age_secs: self.codec.refresh_ttl_secs(),
        })
    }

    fn new_record(
        &self,
        id: Uuid,
        user_id: i64,
        token: String,
        ip_address: Option<IpAddr>,
        user_agent: Option<String>,
    ) -> RefreshTokenRecord {
        RefreshTokenRecord {
            id,
            user_id,
            token,
            expires_at: OffsetDateTime::now_utc() + time::Duration::seconds(self.codec.refresh_ttl_secs()),
            revoked: false,
            revoked_at: None,
            ip_address: ip_address.map(|ip| ip.to_string()),
            user_agent,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Every credential-failure branch goes through the same fixed delay so
    /// "no such user" and "wrong password" are not statistically separable.
    async fn uniform_failure(&self) -> AppError {
        if self.config.login_failure_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.login_failure_delay_ms)).await;
        }
        AppError::InvalidCredentials
    }

    async fn hash_password(&self, password: String) -> Result<String> {
        tokio::task::spawn_blocking(move || Password::hash(&password)).await.map_err(|_| AppError::Internal)?
    }

    async fn verify_password(&self, password: String, hash: String) -> Result<bool> {
        tokio::task::spawn_blocking(move || Password::verify(&password, &hash))
            .await
            .map_err(|_| AppError::Internal)?
    }
}

/// Canonical address form. Rate-limit keys must use the same form as the
/// store lookups, or padded spellings of one address get separate buckets.
#[must_use]
pub fn canonical_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn normalize_email(email: &str) -> Result<String> {
    let email = canonical_email(email);
    if email.is_empty() || email.len() > 254 || !email.contains('@') {
        return Err(AppError::Validation("a valid email address is required".to_string()));
    }
    Ok(email)
}

// Argon2id hash of an arbitrary string, with the same cost parameters as
// `Password::hash` produces. Verified on the unknown-user login branch.
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$gZiV/M1gPc22ElAH/Jh1Hw$CWOrkoo7oJBQ/iyh7uJ0LO2aLEfrHwTWllSAxT0zRno";

fn validate_password(password: &str) -> Result<()> {
    if password.len() < 8 {
        return Err(AppError::Validation("password must be at least 8 characters".to_string()));
    }
    Ok(())
}

fn token_expired(expires_at: Option<OffsetDateTime>) -> bool {
    expires_at.is_none_or(|at| at < OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mailer::LogMailer;
    use crate::storage::memory::{MemoryRefreshTokenStore, MemoryUserStore};

    fn test_config() -> AuthConfig {
        AuthConfig {
            access_token_secret: "access_secret".to_string(),
            refresh_token_secret: "refresh_secret".to_string(),
            access_token_ttl_secs: 900,
            refresh_token_ttl_days: 7,
            issuer: "reportdesk".to_string(),
            audience: "reportdesk-api".to_string(),
            setup_token_ttl_hours: 24,
            reset_token_ttl_mins: 60,
            login_failure_delay_ms: 0,
            cookie_domain: None,
            cookie_secure: false,
            token_cleanup_interval_secs: 0,
        }
    }

    fn service() -> (AuthService, Arc<MemoryUserStore>, Arc<MemoryRefreshTokenStore>) {
        let users = Arc::new(MemoryUserStore::new());
        let ledger = Arc::new(MemoryRefreshTokenStore::new());
        let svc = AuthService::new(
            test_config(),
            Arc::clone(&users) as Arc<dyn UserStore>,
            Arc::clone(&ledger) as Arc<dyn RefreshTokenStore>,
            Arc::new(LogMailer),
        );
        (svc, users, ledger)
    }

    async fn verified_user_with_password(
        svc: &AuthService,
        users: &MemoryUserStore,
        email: &str,
    ) -> SafeUser {
        let user = svc.register(email, "Test User").await.unwrap();
        let outcome = svc.verify_user(user.id).await.unwrap();
        let stored = users.find_by_email(email).await.unwrap().unwrap();
        let token = stored.password_setup_token.unwrap();
        svc.setup_password(&token, "Passw0rd123").await.unwrap();
        outcome.user
    }

    #[tokio::test]
    async fn test_full_lifecycle_register_verify_setup_login() {
        let (svc, users, _) = service();
        verified_user_with_password(&svc, &users, "a@x.com").await;

        let (session, user) = svc.login("a@x.com", "Passw0rd123", None, None).await.unwrap();
        assert_eq!(user.email, "a@x.com");
        assert!(!session.access_token.is_empty());
        assert!(!session.refresh_token.is_empty());
    }

    #[tokio::test]
    async fn test_login_state_machine_gates() {
        let (svc, users, _) = service();
        let registered = svc.register("b@x.com", "B").await.unwrap();

        // Registered-Unverified
        let err = svc.login("b@x.com", "whatever123", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::AccountNotVerified));

        // Verified-NoPassword
        svc.verify_user(registered.id).await.unwrap();
        let err = svc.login("b@x.com", "whatever123", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::PasswordNotSet));

        // Unknown user and wrong password are the same error
        let stored = users.find_by_email("b@x.com").await.unwrap().unwrap();
        svc.setup_password(&stored.password_setup_token.unwrap(), "Passw0rd123").await.unwrap();
        let wrong = svc.login("b@x.com", "wrong_password", None, None).await.unwrap_err();
        let missing = svc.login("ghost@x.com", "wrong_password", None, None).await.unwrap_err();
        assert!(matches!(wrong, AppError::InvalidCredentials));
        assert!(matches!(missing, AppError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_setup_token_is_single_use() {
        let (svc, users, _) = service();
        let user = svc.register("c@x.com", "C").await.unwrap();
        svc.verify_user(user.id).await.unwrap();
        let token = users.find_by_email("c@x.com").await.unwrap().unwrap().password_setup_token.unwrap();

        svc.setup_password(&token, "Passw0rd123").await.unwrap();
        let err = svc.setup_password(&token, "Another123").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));
    }

    #[tokio::test]
    async fn test_rotation_chain_leaves_single_record() {
        let (svc, users, ledger) = service();
        verified_user_with_password(&svc, &users, "d@x.com").await;
        let (session, user) = svc.login("d@x.com", "Passw0rd123", None, None).await.unwrap();

        let mut refresh_token = session.refresh_token;
        for _ in 0..4 {
            let next = svc.refresh(&refresh_token, None, None).await.unwrap();
            refresh_token = next.refresh_token;
        }

        assert_eq!(ledger.live_count_for_user(user.id), 1);

        // The consumed links of the chain are gone.
        let err = svc.refresh(&session.access_token, None, None).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_winner() {
        let (svc, users, ledger) = service();
        verified_user_with_password(&svc, &users, "e@x.com").await;
        let (session, user) = svc.login("e@x.com", "Passw0rd123", None, None).await.unwrap();

        let (left, right) = tokio::join!(
            svc.refresh(&session.refresh_token, None, None),
            svc.refresh(&session.refresh_token, None, None)
        );

        let successes = [&left, &right].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "exactly one concurrent rotation may win");

        let loser = if left.is_err() { left.unwrap_err() } else { right.unwrap_err() };
        assert!(matches!(loser, AppError::TokenNotFound | AppError::TokenRevoked));
        assert_eq!(ledger.live_count_for_user(user.id), 1);
    }

    #[tokio::test]
    async fn test_reset_password_revokes_all_sessions() {
        let (svc, users, ledger) = service();
        verified_user_with_password(&svc, &users, "f@x.com").await;
        for _ in 0..3 {
            svc.login("f@x.com", "Passw0rd123", None, None).await.unwrap();
        }
        let user = users.find_by_email("f@x.com").await.unwrap().unwrap();
        assert_eq!(ledger.live_count_for_user(user.id), 3);

        svc.forgot_password("f@x.com").await.unwrap();
        // Reset issuance runs on a detached task.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let token = users.find_by_email("f@x.com").await.unwrap().unwrap().password_reset_token.unwrap();

        svc.reset_password(&token, "NewPassw0rd1").await.unwrap();
        assert_eq!(ledger.live_count_for_user(user.id), 0);

        let (session, _) = svc.login("f@x.com", "NewPassw0rd1", None, None).await.unwrap();
        assert!(!session.access_token.is_empty());
    }

    #[tokio::test]
    async fn test_failure_branches_cost_the_same() {
        let (svc, users, _) = service();
        verified_user_with_password(&svc, &users, "t@x.com").await;

        let mut wrong = Duration::ZERO;
        let mut unknown = Duration::ZERO;
        for _ in 0..5 {
            let started = std::time::Instant::now();
            let _ = svc.login("t@x.com", "wrong_password", None, None).await;
            wrong += started.elapsed();

            let started = std::time::Instant::now();
            let _ = svc.login("ghost@x.com", "wrong_password", None, None).await;
            unknown += started.elapsed();
        }

        // With the artificial delay disabled, both branches are dominated by
        // the hash verification; the unknown-user branch must pay it too.
        assert!(unknown * 2 >= wrong, "unknown-user branch too fast: {unknown:?} vs {wrong:?}");
    }

    #[test]
    fn test_canonical_email_trims_and_lowercases() {
        assert_eq!(canonical_email("  Buyer@X.com "), "buyer@x.com");
        assert_eq!(canonical_email("buyer@x.com"), "buyer@x.com");
    }

    #[tokio::test]
    async fn test_logout_is_best_effort() {
        let (svc, _, _) = service();
        // None, garbage and unknown tokens all come back clean.
        svc.logout(None).await;
        svc.logout(Some("garbage")).await;
    }

    #[tokio::test]
    async fn test_authenticate_rejects_deleted_user_token() {
        let (svc, users, _) = service();
        verified_user_with_password(&svc, &users, "g@x.com").await;
        let (session, _) = svc.login("g@x.com", "Passw0rd123", None, None).await.unwrap();

        let current = svc.authenticate(&session.access_token).await.unwrap();
        assert_eq!(current.email, "g@x.com");

        let err = svc.authenticate("garbage").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));
    }

    #[tokio::test]
    async fn test_admin_guard_checks_live_record() {
        let (svc, users, _) = service();
        let admin = users.insert_user(
            "admin@x.com",
            "Admin",
            Some(Password::hash("Passw0rd123").unwrap()),
            crate::domain::user::Role::Admin,
            true,
        );
        svc.ensure_admin(admin.id).await.unwrap();

        let plain = users.insert_user("plain@x.com", "Plain", None, crate::domain::user::Role::User, true);
        let err = svc.ensure_admin(plain.id).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden));
    }
}
