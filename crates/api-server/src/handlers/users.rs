//! Account administration handlers: listing, CRUD, the soft-delete /
//! restore / purge lifecycle and the bulk operations.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use identity::authority::authorities;
use identity::{AccountUpdate, Actor, Claims, NewAccount, Role, User, UserQuery};

use crate::error::{ApiError, ApiResult};
use crate::middleware::{require_authority, ClientIp};
use crate::state::AppState;

/// Role reference embedded in account responses.
#[derive(Debug, Serialize, ToSchema)]
pub struct RoleSummary {
    pub id: Uuid,
    pub name: String,
}

impl From<Role> for RoleSummary {
    fn from(role: Role) -> Self {
        Self {
            id: role.id,
            name: role.name,
        }
    }
}

/// Account representation returned by the API. Credential hashes never
/// leave the server.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub enabled: bool,
    /// Soft-deletion timestamp; present only on deleted accounts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Directly assigned roles.
    pub roles: Vec<RoleSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserResponse {
    pub fn from_parts(user: User, roles: Vec<Role>) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            enabled: user.enabled,
            deleted_at: user.deleted_at,
            roles: roles.into_iter().map(RoleSummary::from).collect(),
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// Query parameters for the account listing.
#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct ListUsersParams {
    /// Substring match on username or email.
    pub search: Option<String>,
    /// Filter by direct role name.
    pub role: Option<String>,
    /// Filter by enabled flag.
    pub enabled: Option<bool>,
    /// Include soft-deleted accounts.
    #[serde(default)]
    pub show_deleted: bool,
    /// 1-based page number.
    #[serde(default = "default_page")]
    pub page: u32,
    /// Page size, capped at 100.
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

pub(crate) fn default_page() -> u32 {
    1
}

pub(crate) fn default_per_page() -> u32 {
    20
}

/// One page of accounts.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserPage {
    pub items: Vec<UserResponse>,
    /// Total matches across all pages.
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Create account request.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    /// Initial password (min 8 characters).
    pub password: String,
    /// Direct role assignments; defaults to the USER role when omitted.
    #[serde(default)]
    pub role_ids: Option<Vec<Uuid>>,
}

/// Update account request. Omitted fields are left unchanged.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// New password (min 8 characters), re-hashed on update.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Replacement for the whole direct role set.
    #[serde(default)]
    pub role_ids: Option<Vec<Uuid>>,
}

/// Bulk soft-delete request.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BulkDeleteRequest {
    pub user_ids: Vec<Uuid>,
}

/// Bulk soft-delete result.
#[derive(Debug, Serialize, ToSchema)]
pub struct BulkDeleteResponse {
    /// Accounts soft-deleted; the batch is all-or-nothing.
    pub deleted: u64,
}

/// Bulk enable/disable request.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BulkStatusRequest {
    pub user_ids: Vec<Uuid>,
    pub enabled: bool,
}

/// Bulk enable/disable result.
#[derive(Debug, Serialize, ToSchema)]
pub struct BulkStatusResponse {
    /// Accounts whose enabled flag actually changed.
    pub modified: u64,
}

/// Field-level validation shared by registration and the admin surface.
/// Partial updates pass `None` for fields they do not touch.
pub(crate) fn validate_account_fields(
    username: Option<&str>,
    email: Option<&str>,
    password: Option<&str>,
) -> Result<(), ApiError> {
    let mut errors = HashMap::new();
    if let Some(username) = username {
        if username.trim().len() < 3 {
            errors.insert(
                "username".to_string(),
                "Username must be at least 3 characters".to_string(),
            );
        }
    }
    if let Some(email) = email {
        if !email.contains('@') || email.len() < 5 {
            errors.insert("email".to_string(), "Invalid email address".to_string());
        }
    }
    if let Some(password) = password {
        if password.len() < 8 {
            errors.insert(
                "password".to_string(),
                "Password must be at least 8 characters".to_string(),
            );
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::Validation(errors))
    }
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(value).map_err(|_| ApiError::BadRequest("Invalid id format".to_string()))
}

/// Resolve the acting account for audit attribution. The token subject is
/// looked up so the entry carries the account id; if the actor's own
/// account disappeared mid-session the entry keeps the name from the token.
pub(crate) async fn actor_from_claims(
    state: &AppState,
    claims: &Claims,
    ip: Option<IpAddr>,
) -> Result<Actor, ApiError> {
    let actor = match state.users.find_active_by_username(&claims.sub).await? {
        Some(user) => Actor::account(user.id, &user.username),
        None => Actor {
            id: None,
            name: claims.sub.clone(),
            ip: None,
        },
    };
    Ok(match ip {
        Some(ip) => actor.with_ip(ip),
        None => actor,
    })
}

async fn roles_of(state: &AppState, id: Uuid) -> Result<Vec<Role>, ApiError> {
    let mut map = state.lifecycle.roles_of(&[id]).await?;
    Ok(map.remove(&id).unwrap_or_default())
}

/// List accounts with filters and pagination.
#[utoipa::path(
    get,
    path = "/api/v1/users",
    params(ListUsersParams),
    responses(
        (status = 200, description = "One page of accounts, newest first", body = UserPage),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Missing USER_READ"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Query(params): Query<ListUsersParams>,
) -> ApiResult<Json<UserPage>> {
    require_authority(&claims, authorities::USER_READ)?;

    let query = UserQuery {
        search: params.search,
        role: params.role,
        enabled: params.enabled,
        show_deleted: params.show_deleted,
        page: params.page.max(1),
        per_page: params.per_page.clamp(1, 100),
    };
    let page = state.lifecycle.list(&query).await?;

    let ids: Vec<Uuid> = page.items.iter().map(|user| user.id).collect();
    let mut roles_by_user = state.lifecycle.roles_of(&ids).await?;

    let items = page
        .items
        .into_iter()
        .map(|user| {
            let roles = roles_by_user.remove(&user.id).unwrap_or_default();
            UserResponse::from_parts(user, roles)
        })
        .collect();

    Ok(Json(UserPage {
        items,
        total: page.total,
        page: page.page,
        per_page: page.per_page,
    }))
}

/// Create an account.
#[utoipa::path(
    post,
    path = "/api/v1/users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "Account created", body = UserResponse),
        (status = 400, description = "Validation failed"),
        (status = 403, description = "Missing USER_CREATE"),
        (status = 404, description = "A requested role does not exist"),
        (status = 409, description = "Username or email already in use"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<UserResponse>)> {
    require_authority(&claims, authorities::USER_CREATE)?;
    validate_account_fields(Some(&req.username), Some(&req.email), Some(&req.password))?;

    let actor = actor_from_claims(&state, &claims, ip).await?;
    let user = state
        .lifecycle
        .create(
            &actor,
            NewAccount {
                username: req.username,
                email: req.email,
                password: req.password,
                role_ids: req.role_ids,
            },
        )
        .await?;

    let roles = roles_of(&state, user.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(UserResponse::from_parts(user, roles)),
    ))
}

/// Fetch one account by id, soft-deleted included.
#[utoipa::path(
    get,
    path = "/api/v1/users/{id}",
    params(("id" = String, Path, description = "Account id")),
    responses(
        (status = 200, description = "The account", body = UserResponse),
        (status = 403, description = "Missing USER_READ"),
        (status = 404, description = "Account not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> ApiResult<Json<UserResponse>> {
    require_authority(&claims, authorities::USER_READ)?;
    let id = parse_uuid(&id)?;

    let user = state.lifecycle.get(id).await?;
    let roles = roles_of(&state, id).await?;
    Ok(Json(UserResponse::from_parts(user, roles)))
}

/// Fetch one active account by username.
#[utoipa::path(
    get,
    path = "/api/v1/users/username/{username}",
    params(("username" = String, Path, description = "Account username")),
    responses(
        (status = 200, description = "The account", body = UserResponse),
        (status = 403, description = "Missing USER_READ"),
        (status = 404, description = "Account not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn get_user_by_username(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(username): Path<String>,
) -> ApiResult<Json<UserResponse>> {
    require_authority(&claims, authorities::USER_READ)?;

    let user = state.lifecycle.get_by_username(&username).await?;
    let roles = roles_of(&state, user.id).await?;
    Ok(Json(UserResponse::from_parts(user, roles)))
}

/// Update an account.
#[utoipa::path(
    put,
    path = "/api/v1/users/{id}",
    params(("id" = String, Path, description = "Account id")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "The updated account", body = UserResponse),
        (status = 400, description = "Validation failed"),
        (status = 403, description = "Missing USER_UPDATE"),
        (status = 404, description = "Account or role not found"),
        (status = 409, description = "Duplicate identity or deleted account"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult<Json<UserResponse>> {
    require_authority(&claims, authorities::USER_UPDATE)?;
    let id = parse_uuid(&id)?;
    validate_account_fields(
        req.username.as_deref(),
        req.email.as_deref(),
        req.password.as_deref(),
    )?;

    let actor = actor_from_claims(&state, &claims, ip).await?;
    let user = state
        .lifecycle
        .update(
            &actor,
            id,
            AccountUpdate {
                username: req.username,
                email: req.email,
                password: req.password,
                enabled: req.enabled,
                role_ids: req.role_ids,
            },
        )
        .await?;

    let roles = roles_of(&state, id).await?;
    Ok(Json(UserResponse::from_parts(user, roles)))
}

/// Soft-delete one account.
#[utoipa::path(
    delete,
    path = "/api/v1/users/{id}",
    params(("id" = String, Path, description = "Account id")),
    responses(
        (status = 204, description = "Account soft-deleted"),
        (status = 403, description = "Missing USER_DELETE"),
        (status = 404, description = "Account not found or already deleted"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    require_authority(&claims, authorities::USER_DELETE)?;
    let id = parse_uuid(&id)?;

    let actor = actor_from_claims(&state, &claims, ip).await?;
    state.lifecycle.soft_delete(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Restore a soft-deleted account.
#[utoipa::path(
    post,
    path = "/api/v1/users/{id}/restore",
    params(("id" = String, Path, description = "Account id")),
    responses(
        (status = 200, description = "The restored account", body = UserResponse),
        (status = 403, description = "Missing USER_DELETE"),
        (status = 404, description = "Account not found or not deleted"),
        (status = 409, description = "Username or email reclaimed by another account"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn restore_user(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
) -> ApiResult<Json<UserResponse>> {
    require_authority(&claims, authorities::USER_DELETE)?;
    let id = parse_uuid(&id)?;

    let actor = actor_from_claims(&state, &claims, ip).await?;
    let user = state.lifecycle.restore(&actor, id).await?;
    let roles = roles_of(&state, id).await?;
    Ok(Json(UserResponse::from_parts(user, roles)))
}

/// Permanently remove a soft-deleted account.
#[utoipa::path(
    delete,
    path = "/api/v1/users/{id}/purge",
    params(("id" = String, Path, description = "Account id")),
    responses(
        (status = 204, description = "Account permanently removed"),
        (status = 403, description = "Missing USER_DELETE"),
        (status = 404, description = "Account not found or not soft-deleted"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn purge_user(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    require_authority(&claims, authorities::USER_DELETE)?;
    let id = parse_uuid(&id)?;

    let actor = actor_from_claims(&state, &claims, ip).await?;
    state.lifecycle.purge(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Soft-delete a batch of accounts, all-or-nothing.
///
/// The batch fails if any id is unknown or already deleted, and if it would
/// remove every remaining enabled administrator.
#[utoipa::path(
    post,
    path = "/api/v1/users/bulk/delete",
    request_body = BulkDeleteRequest,
    responses(
        (status = 200, description = "Batch soft-deleted", body = BulkDeleteResponse),
        (status = 403, description = "Missing USER_DELETE"),
        (status = 404, description = "An id was unknown or already deleted"),
        (status = 409, description = "Batch would remove the last administrator"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn bulk_delete_users(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(req): Json<BulkDeleteRequest>,
) -> ApiResult<Json<BulkDeleteResponse>> {
    require_authority(&claims, authorities::USER_DELETE)?;

    let actor = actor_from_claims(&state, &claims, ip).await?;
    let deleted = state.lifecycle.bulk_soft_delete(&actor, &req.user_ids).await?;
    Ok(Json(BulkDeleteResponse { deleted }))
}

/// Enable or disable a batch of accounts.
///
/// Ids that do not resolve to a non-deleted account are skipped silently;
/// the response carries the number of accounts actually modified.
#[utoipa::path(
    post,
    path = "/api/v1/users/bulk/status",
    request_body = BulkStatusRequest,
    responses(
        (status = 200, description = "Batch processed", body = BulkStatusResponse),
        (status = 403, description = "Missing USER_UPDATE"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn bulk_set_status(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(req): Json<BulkStatusRequest>,
) -> ApiResult<Json<BulkStatusResponse>> {
    require_authority(&claims, authorities::USER_UPDATE)?;

    let actor = actor_from_claims(&state, &claims, ip).await?;
    let modified = state
        .lifecycle
        .set_enabled_bulk(&actor, &req.user_ids, req.enabled)
        .await?;
    Ok(Json(BulkStatusResponse { modified }))
}
