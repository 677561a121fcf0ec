use crate::config::AuthConfig;
use crate::domain::auth::{AccessClaims, RefreshClaims};
use crate::error::{AppError, Result};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Distinguished verification failure kinds. Callers collapse these to a
/// generic 401 at the protocol boundary; the kinds exist for logging and
/// for the guard's fast-path decisions.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("token malformed")]
    Malformed,
    #[error("token verification failed")]
    VerificationFailed,
}

impl From<TokenError> for AppError {
    fn from(_: TokenError) -> Self {
        Self::InvalidToken
    }
}

/// Outcome of the non-failing verification used on optional-auth paths.
#[derive(Debug, Clone)]
pub struct SafeVerification {
    pub valid: bool,
    pub claims: Option<AccessClaims>,
    pub error: Option<TokenError>,
}

/// Signs and verifies the two token kinds. Each kind has its own secret so
/// compromise of one cannot forge the other; both carry issuer and audience
/// claims which are checked on every verification.
#[derive(Clone)]
pub struct TokenService {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    issuer: String,
    audience: String,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService").field("issuer", &self.issuer).finish_non_exhaustive()
    }
}

impl TokenService {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(config.access_token_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access_token_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_token_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_token_secret.as_bytes()),
            access_ttl_secs: i64::try_from(config.access_token_ttl_secs).unwrap_or(900),
            refresh_ttl_secs: config.refresh_token_ttl_days * 24 * 3600,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
        }
    }

    #[must_use]
    pub const fn access_ttl_secs(&self) -> i64 {
        self.access_ttl_secs
    }

    #[must_use]
    pub const fn refresh_ttl_secs(&self) -> i64 {
        self.refresh_ttl_secs
    }

    pub fn issue_access(&self, user_id: i64, email: &str) -> Result<(String, i64)> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let exp = now + self.access_ttl_secs;
        let claims = AccessClaims {
            sub: user_id,
            email: email.to_string(),
            iat: now,
            exp,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.access_encoding).map_err(|_| AppError::Internal)?;
        Ok((token, exp))
    }

    /// `token_id` is the ledger record id the token will be bound to; it must
    /// exist (or be inserted in the same logical step) before the signed
    /// string is handed to a client.
    pub fn issue_refresh(&self, user_id: i64, email: &str, token_id: Uuid) -> Result<String> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = RefreshClaims {
            sub: user_id,
            email: email.to_string(),
            tid: token_id,
            jti: Uuid::new_v4(),
            iat: now,
            exp: now + self.refresh_ttl_secs,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        encode(&Header::default(), &claims, &self.refresh_encoding).map_err(|_| AppError::Internal)
    }

    pub fn verify_access(&self, token: &str) -> std::result::Result<AccessClaims, TokenError> {
        decode::<AccessClaims>(token, &self.access_decoding, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| map_jwt_error(&e))
    }

    pub fn verify_refresh(&self, token: &str) -> std::result::Result<RefreshClaims, TokenError> {
        // `tid` is a required field of RefreshClaims, so a refresh token
        // missing it fails deserialization and lands on Malformed.
        decode::<RefreshClaims>(token, &self.refresh_decoding, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| map_jwt_error(&e))
    }

    /// Non-failing verification for optional-auth paths.
    #[must_use]
    pub fn verify_access_safe(&self, token: &str) -> SafeVerification {
        match self.verify_access(token) {
            Ok(claims) => SafeVerification { valid: true, claims: Some(claims), error: None },
            Err(e) => SafeVerification { valid: false, claims: None, error: Some(e) },
        }
    }

    /// Decode-only expiry read, no signature check. Only usable as a
    /// fast-path pre-check; never as an authorization decision.
    #[must_use]
    pub fn peek_expiry(token: &str) -> Option<i64> {
        #[derive(Deserialize)]
        struct ExpOnly {
            exp: i64,
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        decode::<ExpOnly>(token, &DecodingKey::from_secret(&[]), &validation).ok().map(|data| data.claims.exp)
    }

    #[must_use]
    pub fn is_expired_unverified(token: &str) -> bool {
        Self::peek_expiry(token).is_some_and(|exp| exp < OffsetDateTime::now_utc().unix_timestamp())
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation
    }
}

fn map_jwt_error(err: &jsonwebtoken::errors::Error) -> TokenError {
    match err.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::ImmatureSignature => TokenError::NotYetValid,
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidIssuer
        | ErrorKind::InvalidAudience
        | ErrorKind::InvalidAlgorithm => TokenError::VerificationFailed,
        _ => TokenError::Malformed,
    }
}
