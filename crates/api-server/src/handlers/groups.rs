//! Group administration handlers. Groups grant their roles to every
//! member; all group endpoints require SYSTEM_MANAGE.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use identity::authority::authorities;
use identity::{Claims, GroupDetail, GroupUpdate};

use crate::error::{ApiError, ApiResult};
use crate::handlers::users::{actor_from_claims, parse_uuid, RoleSummary};
use crate::middleware::{require_authority, ClientIp};
use crate::state::AppState;

/// Group with its granted roles and member ids.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupResponse {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Roles granted to every member.
    pub roles: Vec<RoleSummary>,
    pub member_ids: Vec<Uuid>,
}

impl From<GroupDetail> for GroupResponse {
    fn from(detail: GroupDetail) -> Self {
        Self {
            id: detail.group.id,
            name: detail.group.name,
            description: detail.group.description,
            roles: detail.roles.into_iter().map(RoleSummary::from).collect(),
            member_ids: detail.member_ids,
        }
    }
}

/// Create group request.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Roles the group grants; may be empty.
    #[serde(default)]
    pub role_ids: Vec<Uuid>,
}

/// Update group request. Omitted fields are left unchanged.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGroupRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Replacement for the whole granted role set.
    #[serde(default)]
    pub role_ids: Option<Vec<Uuid>>,
}

/// Membership assignment request.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssignMembersRequest {
    pub user_ids: Vec<Uuid>,
}

fn validate_group_name(name: &str) -> Result<(), ApiError> {
    if name.trim().is_empty() {
        let mut errors = HashMap::new();
        errors.insert("name".to_string(), "Group name must not be empty".to_string());
        return Err(ApiError::Validation(errors));
    }
    Ok(())
}

/// List all groups.
#[utoipa::path(
    get,
    path = "/api/v1/groups",
    responses(
        (status = 200, description = "All groups", body = [GroupResponse]),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Missing SYSTEM_MANAGE"),
    ),
    security(("bearer_auth" = [])),
    tag = "groups"
)]
pub async fn list_groups(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<GroupResponse>>> {
    require_authority(&claims, authorities::SYSTEM_MANAGE)?;

    let groups = state.groups.list().await?;
    Ok(Json(groups.into_iter().map(GroupResponse::from).collect()))
}

/// Create a group.
#[utoipa::path(
    post,
    path = "/api/v1/groups",
    request_body = CreateGroupRequest,
    responses(
        (status = 201, description = "Group created", body = GroupResponse),
        (status = 400, description = "Validation failed"),
        (status = 403, description = "Missing SYSTEM_MANAGE"),
        (status = 404, description = "A requested role does not exist"),
        (status = 409, description = "Group name already in use"),
    ),
    security(("bearer_auth" = [])),
    tag = "groups"
)]
pub async fn create_group(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<(StatusCode, Json<GroupResponse>)> {
    require_authority(&claims, authorities::SYSTEM_MANAGE)?;
    validate_group_name(&req.name)?;

    let actor = actor_from_claims(&state, &claims, ip).await?;
    let detail = state
        .groups
        .create(&actor, req.name.trim(), req.description, &req.role_ids)
        .await?;
    Ok((StatusCode::CREATED, Json(GroupResponse::from(detail))))
}

/// Fetch one group.
#[utoipa::path(
    get,
    path = "/api/v1/groups/{id}",
    params(("id" = String, Path, description = "Group id")),
    responses(
        (status = 200, description = "The group", body = GroupResponse),
        (status = 403, description = "Missing SYSTEM_MANAGE"),
        (status = 404, description = "Group not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "groups"
)]
pub async fn get_group(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> ApiResult<Json<GroupResponse>> {
    require_authority(&claims, authorities::SYSTEM_MANAGE)?;
    let id = parse_uuid(&id)?;

    let detail = state.groups.get(id).await?;
    Ok(Json(GroupResponse::from(detail)))
}

/// Update a group.
#[utoipa::path(
    put,
    path = "/api/v1/groups/{id}",
    params(("id" = String, Path, description = "Group id")),
    request_body = UpdateGroupRequest,
    responses(
        (status = 200, description = "The updated group", body = GroupResponse),
        (status = 400, description = "Validation failed"),
        (status = 403, description = "Missing SYSTEM_MANAGE"),
        (status = 404, description = "Group or role not found"),
        (status = 409, description = "Group name already in use"),
    ),
    security(("bearer_auth" = [])),
    tag = "groups"
)]
pub async fn update_group(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
    Json(req): Json<UpdateGroupRequest>,
) -> ApiResult<Json<GroupResponse>> {
    require_authority(&claims, authorities::SYSTEM_MANAGE)?;
    let id = parse_uuid(&id)?;
    if let Some(name) = &req.name {
        validate_group_name(name)?;
    }

    let actor = actor_from_claims(&state, &claims, ip).await?;
    let detail = state
        .groups
        .update(
            &actor,
            id,
            GroupUpdate {
                name: req.name.map(|name| name.trim().to_string()),
                description: req.description,
                role_ids: req.role_ids,
            },
        )
        .await?;
    Ok(Json(GroupResponse::from(detail)))
}

/// Delete a group. Fails while the group still has members.
#[utoipa::path(
    delete,
    path = "/api/v1/groups/{id}",
    params(("id" = String, Path, description = "Group id")),
    responses(
        (status = 204, description = "Group deleted"),
        (status = 403, description = "Missing SYSTEM_MANAGE"),
        (status = 404, description = "Group not found"),
        (status = 409, description = "Group still has members"),
    ),
    security(("bearer_auth" = [])),
    tag = "groups"
)]
pub async fn delete_group(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    require_authority(&claims, authorities::SYSTEM_MANAGE)?;
    let id = parse_uuid(&id)?;

    let actor = actor_from_claims(&state, &claims, ip).await?;
    state.groups.delete(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Add accounts to a group. Existing members are ignored.
#[utoipa::path(
    post,
    path = "/api/v1/groups/{id}/users",
    params(("id" = String, Path, description = "Group id")),
    request_body = AssignMembersRequest,
    responses(
        (status = 200, description = "The group with updated membership", body = GroupResponse),
        (status = 403, description = "Missing SYSTEM_MANAGE"),
        (status = 404, description = "Group or account not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "groups"
)]
pub async fn assign_members(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
    Json(req): Json<AssignMembersRequest>,
) -> ApiResult<Json<GroupResponse>> {
    require_authority(&claims, authorities::SYSTEM_MANAGE)?;
    let id = parse_uuid(&id)?;

    let actor = actor_from_claims(&state, &claims, ip).await?;
    state.groups.assign_members(&actor, id, &req.user_ids).await?;

    let detail = state.groups.get(id).await?;
    Ok(Json(GroupResponse::from(detail)))
}

/// Remove one account from a group.
#[utoipa::path(
    delete,
    path = "/api/v1/groups/{id}/users/{user_id}",
    params(
        ("id" = String, Path, description = "Group id"),
        ("user_id" = String, Path, description = "Account id"),
    ),
    responses(
        (status = 204, description = "Member removed"),
        (status = 403, description = "Missing SYSTEM_MANAGE"),
        (status = 404, description = "Group not found or account not a member"),
    ),
    security(("bearer_auth" = [])),
    tag = "groups"
)]
pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path((id, user_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    require_authority(&claims, authorities::SYSTEM_MANAGE)?;
    let id = parse_uuid(&id)?;
    let user_id = parse_uuid(&user_id)?;

    let actor = actor_from_claims(&state, &claims, ip).await?;
    state.groups.remove_member(&actor, id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
