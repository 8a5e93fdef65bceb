//! Request middleware: bearer-token guard, client address resolution,
//! registration rate limiting and error-envelope path stamping.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;

use identity::Claims;

use crate::error::{ApiError, ErrorBody};
use crate::state::AppState;

/// Registration attempts allowed per client address per window.
const REGISTRATION_LIMIT: u32 = 5;
const REGISTRATION_WINDOW: Duration = Duration::from_secs(3600);

/// Client address resolved for the request. `None` when neither a forwarded
/// header nor a peer address is available (only happens in tests).
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub Option<IpAddr>);

/// Best client-address guess: the first `X-Forwarded-For` hop when present,
/// otherwise the connection's peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return Some(ip);
            }
        }
    }
    peer.map(|addr| addr.ip())
}

/// Resolve the client address once and stash it in request extensions so
/// handlers and the rate limiter agree on it.
pub async fn attach_client_ip(mut request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), peer);
    request.extensions_mut().insert(ClientIp(ip));
    next.run(request).await
}

/// Extract and validate the access token from the Authorization header.
/// On success, injects `Claims` into request extensions for use by handlers.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing authorization header".to_string()))?;

    let token = header.strip_prefix("Bearer ").ok_or_else(|| {
        ApiError::Unauthorized(
            "Invalid authorization format, expected 'Bearer <token>'".to_string(),
        )
    })?;

    let claims = match state.jwt.decode(token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(error = %e, "Token validation failed");
            return Err(ApiError::Unauthorized("Invalid or expired token".to_string()));
        }
    };

    tracing::debug!(username = %claims.sub, "Authenticated request");
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

/// Check a single required authority against validated claims.
pub fn require_authority(claims: &Claims, authority: &str) -> Result<(), ApiError> {
    if claims.has_authority(authority) {
        return Ok(());
    }
    Err(ApiError::Forbidden(format!(
        "Requires the {} authority",
        authority
    )))
}

/// Check that the claims carry at least one of the given authorities.
pub fn require_any_authority(claims: &Claims, required: &[&str]) -> Result<(), ApiError> {
    if claims.has_any_authority(required) {
        return Ok(());
    }
    Err(ApiError::Forbidden(format!(
        "Requires one of the following authorities: {}",
        required.join(", ")
    )))
}

/// Fixed-window registration counter keyed by client address.
///
/// A window starts on the first attempt from an address and counts attempts
/// until it expires; attempts over the limit are rejected but do not extend
/// the window.
pub struct RegistrationLimiter {
    windows: DashMap<IpAddr, (Instant, u32)>,
    limit: u32,
    window: Duration,
}

impl RegistrationLimiter {
    pub fn new() -> Self {
        Self::with_limits(REGISTRATION_LIMIT, REGISTRATION_WINDOW)
    }

    pub fn with_limits(limit: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window,
        }
    }

    /// Count one attempt. Returns false when the address is over its limit
    /// for the current window.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 1);
            return true;
        }
        if entry.1 >= self.limit {
            return false;
        }
        entry.1 += 1;
        true
    }
}

impl Default for RegistrationLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject registration attempts over the per-address limit before any
/// account logic runs. Requests without a resolvable address pass through;
/// in production the peer address always resolves.
pub async fn limit_registration(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(ClientIp(Some(ip))) = request.extensions().get::<ClientIp>() {
        if !state.registration_limiter.check(*ip) {
            tracing::warn!(ip = %ip, "Registration rate limit exceeded");
            return Err(ApiError::RateLimited);
        }
    }
    Ok(next.run(request).await)
}

/// Outermost layer: rebuild error envelopes with the request path filled in.
pub async fn stamp_error_path(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let mut response = next.run(request).await;
    if let Some(envelope) = response.extensions_mut().remove::<ErrorBody>() {
        let status = response.status();
        let stamped = ErrorBody { path, ..envelope };
        return (status, Json(stamped)).into_response();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use crate::error::ApiResult;

    fn headers_with_forwarded(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(value));
        headers
    }

    fn peer() -> SocketAddr {
        "10.1.2.3:4567".parse().unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let headers = headers_with_forwarded("203.0.113.9, 10.0.0.1");
        assert_eq!(
            client_ip(&headers, Some(peer())),
            Some("203.0.113.9".parse().unwrap())
        );
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        assert_eq!(
            client_ip(&HeaderMap::new(), Some(peer())),
            Some("10.1.2.3".parse().unwrap())
        );

        let garbage = headers_with_forwarded("not-an-address");
        assert_eq!(
            client_ip(&garbage, Some(peer())),
            Some("10.1.2.3".parse().unwrap())
        );

        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_limiter_counts_to_the_limit() {
        let limiter = RegistrationLimiter::with_limits(3, Duration::from_secs(60));
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
        assert!(!limiter.check(ip));

        // A different address has its own window.
        let other: IpAddr = "203.0.113.10".parse().unwrap();
        assert!(limiter.check(other));
    }

    #[tokio::test]
    async fn test_limiter_window_resets() {
        let limiter = RegistrationLimiter::with_limits(1, Duration::from_millis(50));
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.check(ip));
    }

    #[test]
    fn test_require_authority() {
        let claims = Claims::new("alice", vec!["USER_READ".to_string()], 900);

        assert!(require_authority(&claims, "USER_READ").is_ok());
        let err = require_authority(&claims, "USER_DELETE").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

        assert!(require_any_authority(&claims, &["SYSTEM_MANAGE", "USER_READ"]).is_ok());
        assert!(require_any_authority(&claims, &["SYSTEM_MANAGE"]).is_err());
    }

    async fn failing_handler() -> ApiResult<Json<()>> {
        Err(ApiError::NotFound("Account not found".to_string()))
    }

    #[tokio::test]
    async fn test_error_envelope_path_is_stamped() {
        let app = Router::new()
            .route("/api/v1/users/{id}", get(failing_handler))
            .layer(axum::middleware::from_fn(stamp_error_path));

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/v1/users/123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.path, "/api/v1/users/123");
        assert_eq!(body.error, "NOT_FOUND");
        assert_eq!(body.message, "Account not found");
    }
}
