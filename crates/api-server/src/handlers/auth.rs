//! Authentication handlers: login, token refresh, self-registration and
//! the current-principal endpoint.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use identity::authority::Resource;
use identity::password::verify_password;
use identity::{Actor, AuditAction, Claims, NewAccount, Principal, User};

use crate::error::{ApiError, ApiResult};
use crate::handlers::users::{validate_account_fields, UserResponse};
use crate::middleware::ClientIp;
use crate::state::AppState;

/// Single message for every login failure, so responses do not reveal
/// whether an account exists or why it was rejected.
const INVALID_CREDENTIALS: &str = "Invalid username or password";

/// Login request.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    /// Extends the refresh token lifetime from 7 to 30 days.
    #[serde(default)]
    pub remember_me: bool,
}

/// Token pair issued on login, registration and refresh.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Always "Bearer".
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    pub user: UserResponse,
}

/// Self-registration request.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// The authenticated principal with its resolved authorities.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub user: UserResponse,
    /// Effective authorities from direct and group roles, sorted.
    pub authorities: Vec<String>,
}

fn account_actor(user: &User, ip: Option<IpAddr>) -> Actor {
    let actor = Actor::account(user.id, &user.username);
    match ip {
        Some(ip) => actor.with_ip(ip),
        None => actor,
    }
}

/// Record a failed login attempt and produce the uniform rejection. The
/// attempted username goes into the audit metadata, never the response.
fn login_rejected(
    state: &AppState,
    username: &str,
    ip: Option<IpAddr>,
    reason: &str,
) -> ApiError {
    let actor = match ip {
        Some(ip) => Actor::system().with_ip(ip),
        None => Actor::system(),
    };
    state.audit.record(
        &actor,
        AuditAction::LoginFailed,
        Resource::System,
        None,
        json!({ "username": username, "reason": reason }),
    );
    ApiError::Unauthorized(INVALID_CREDENTIALS.to_string())
}

fn auth_response(
    state: &AppState,
    principal: &Principal,
    remember_me: bool,
) -> ApiResult<AuthResponse> {
    let authorities = principal.authorities_vec();
    let access_token = state
        .jwt
        .issue_access_token(principal.username(), authorities.clone())?;
    let refresh_token = state
        .jwt
        .issue_refresh_token(principal.username(), authorities, remember_me)?;
    Ok(AuthResponse {
        access_token,
        refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: state.jwt.access_ttl_secs(),
        user: UserResponse::from_parts(
            principal.user().clone(),
            principal.direct_roles().to_vec(),
        ),
    })
}

/// Authenticate with username and password.
#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = AuthResponse),
        (status = 401, description = "Invalid username or password"),
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let grants = match state.users.load_grants_by_username(&req.username).await? {
        Some(grants) => grants,
        None => return Err(login_rejected(&state, &req.username, ip, "unknown_account")),
    };
    let principal = Principal::from_grants(grants);

    if !verify_password(&req.password, &principal.user().password_hash) {
        return Err(login_rejected(&state, &req.username, ip, "bad_password"));
    }
    if !principal.can_authenticate() {
        return Err(login_rejected(&state, &req.username, ip, "account_unusable"));
    }

    let response = auth_response(&state, &principal, req.remember_me)?;
    state.audit.record(
        &account_actor(principal.user(), ip),
        AuditAction::Login,
        Resource::System,
        Some(principal.user().id.to_string()),
        json!({ "username": principal.username(), "rememberMe": req.remember_me }),
    );
    tracing::info!(username = %principal.username(), "Login succeeded");
    Ok(Json(response))
}

/// Exchange a refresh token for a fresh access token.
///
/// Authorities are re-read from storage so role changes since login take
/// effect; the refresh token itself is returned unchanged.
#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    responses(
        (status = 200, description = "New access token", body = AuthResponse),
        (status = 401, description = "Invalid or expired refresh token"),
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    headers: HeaderMap,
) -> ApiResult<Json<AuthResponse>> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("Missing authorization header".to_string()))?;

    let subject = state
        .jwt
        .extract_subject(token)
        .map_err(|_| ApiError::Unauthorized("Invalid or expired token".to_string()))?;

    let grants = state
        .users
        .load_grants_by_username(&subject)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid or expired token".to_string()))?;
    let principal = Principal::from_grants(grants);
    if !principal.can_authenticate() {
        return Err(ApiError::Unauthorized("Invalid or expired token".to_string()));
    }

    let access_token = state
        .jwt
        .issue_access_token(principal.username(), principal.authorities_vec())?;
    state.audit.record(
        &account_actor(principal.user(), ip),
        AuditAction::TokenRefresh,
        Resource::System,
        Some(principal.user().id.to_string()),
        json!({ "username": principal.username() }),
    );

    Ok(Json(AuthResponse {
        access_token,
        refresh_token: token.to_string(),
        token_type: "Bearer".to_string(),
        expires_in: state.jwt.access_ttl_secs(),
        user: UserResponse::from_parts(
            principal.user().clone(),
            principal.direct_roles().to_vec(),
        ),
    }))
}

/// Register a new account and sign it in.
#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created and signed in", body = AuthResponse),
        (status = 400, description = "Validation failed"),
        (status = 409, description = "Username or email already in use"),
        (status = 429, description = "Too many registrations from this address"),
    ),
    tag = "auth"
)]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    validate_account_fields(Some(&req.username), Some(&req.email), Some(&req.password))?;

    let user = state
        .lifecycle
        .register(
            ip,
            NewAccount {
                username: req.username,
                email: req.email,
                password: req.password,
                role_ids: None,
            },
        )
        .await?;

    // Reload for the full grant set; registration just assigned the
    // default role.
    let grants = state
        .users
        .load_grants_by_username(&user.username)
        .await?
        .ok_or_else(|| ApiError::Internal("Registered account not found".to_string()))?;
    let principal = Principal::from_grants(grants);

    let response = auth_response(&state, &principal, false)?;
    tracing::info!(username = %principal.username(), "Account registered");
    Ok((StatusCode::CREATED, Json(response)))
}

/// Return the authenticated account with its effective authorities.
#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    responses(
        (status = 200, description = "The authenticated principal", body = MeResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn me(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<MeResponse>> {
    let grants = state
        .users
        .load_grants_by_username(&claims.sub)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid or expired token".to_string()))?;
    let principal = Principal::from_grants(grants);

    Ok(Json(MeResponse {
        authorities: principal.authorities_vec(),
        user: UserResponse::from_parts(
            principal.user().clone(),
            principal.direct_roles().to_vec(),
        ),
    }))
}
