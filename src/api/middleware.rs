use crate::api::AppState;
use crate::api::cookies::ACCESS_COOKIE;
use crate::error::AppError;
use crate::services::auth_service::CurrentUser;
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, HeaderValue, Request, header, request::Parts},
};
use std::net::{IpAddr, SocketAddr};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

/// Authenticated request identity. Prefers the Authorization header, falls
/// back to the access cookie; the underlying check always confirms the user
/// still exists so the attached role is live.
#[derive(Debug, Clone)]
pub struct AuthUser(pub CurrentUser);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .or_else(|| cookie_value(&parts.headers, ACCESS_COOKIE))
            .ok_or(AppError::InvalidToken)?;

        let current = state.auth_service.authenticate(&token).await?;
        Ok(Self(current))
    }
}

/// Admin-gated identity. Role is re-checked against the live user record;
/// the signed claim alone is never enough for admin actions.
#[derive(Debug, Clone)]
pub struct AdminUser(pub CurrentUser);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let AuthUser(current) = AuthUser::from_request_parts(parts, state).await?;
        state.auth_service.ensure_admin(current.id).await?;
        Ok(Self(current))
    }
}

/// Identity for endpoints that require a verified account, checked live.
#[derive(Debug, Clone)]
pub struct VerifiedUser(pub CurrentUser);

impl FromRequestParts<AppState> for VerifiedUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let AuthUser(current) = AuthUser::from_request_parts(parts, state).await?;
        state.auth_service.ensure_verified(current.id).await?;
        Ok(Self(current))
    }
}

/// Client metadata recorded on ledger records and used for rate-limit keys.
/// Extraction never fails; both fields are best-effort.
#[derive(Debug, Clone)]
pub struct ClientMeta {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

impl FromRequestParts<AppState> for ClientMeta {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| addr.ip());
        let ip = peer.map(|peer_ip| identify_client_ip(&parts.headers, peer_ip, state));
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(std::string::ToString::to_string);

        Ok(Self { ip, user_agent })
    }
}

/// Walks X-Forwarded-For right to left past trusted proxies, the same way
/// the reverse proxy chain appends entries.
fn identify_client_ip(headers: &HeaderMap, peer_addr: IpAddr, state: &AppState) -> IpAddr {
    let trusted = &state.config.server.trusted_proxies;
    let is_trusted = |ip: &IpAddr| trusted.iter().any(|net| net.contains(*ip));

    if !is_trusted(&peer_addr) {
        return peer_addr;
    }

    let xff = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());

    if let Some(xff_val) = xff
        && let Some(real_ip) =
            xff_val.rsplit(',').filter_map(|s| s.trim().parse::<IpAddr>().ok()).find(|ip| !is_trusted(ip))
    {
        return real_ip;
    }

    peer_addr
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token.to_string()) }
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(header::COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        if let Some((key, val)) = pair.trim().split_once('=')
            && key.trim() == name
        {
            return Some(val.trim().to_string());
        }
    }
    None
}

/// Reuses an inbound `x-request-id` when present, otherwise mints a UUID.
#[derive(Clone, Copy, Debug, Default)]
pub struct MakeRequestUuidOrHeader;

impl MakeRequestId for MakeRequestUuidOrHeader {
    fn make_request_id<B>(&mut self, request: &Request<B>) -> Option<RequestId> {
        if let Some(id) = request.headers().get("x-request-id") {
            return Some(RequestId::new(id.clone()));
        }
        let id = Uuid::new_v4().to_string();
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi".to_string()));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_cookie_value_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("other=1; reportdesk_refresh=tok123; reportdesk_access=acc456"),
        );
        assert_eq!(cookie_value(&headers, "reportdesk_refresh"), Some("tok123".to_string()));
        assert_eq!(cookie_value(&headers, "reportdesk_access"), Some("acc456".to_string()));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
