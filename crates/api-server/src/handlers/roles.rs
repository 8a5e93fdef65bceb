//! Role catalog handler.

use std::sync::Arc;

use axum::extract::State;
use axum::{Extension, Json};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use identity::authority::authorities;
use identity::{Claims, Permission, Role};

use crate::error::ApiResult;
use crate::middleware::require_authority;
use crate::state::AppState;

/// Permission grant as exposed by the API.
#[derive(Debug, Serialize, ToSchema)]
pub struct PermissionResponse {
    pub id: Uuid,
    /// Resource the grant applies to, e.g. "USER".
    pub resource: String,
    /// Action allowed on the resource, e.g. "READ".
    pub action: String,
    /// Combined authority string, e.g. "USER_READ".
    pub authority: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<Permission> for PermissionResponse {
    fn from(permission: Permission) -> Self {
        Self {
            id: permission.id,
            resource: permission.resource.as_str().to_string(),
            action: permission.action.as_str().to_string(),
            authority: permission.authority(),
            description: permission.description,
        }
    }
}

/// Role with its permission grants.
#[derive(Debug, Serialize, ToSchema)]
pub struct RoleResponse {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub permissions: Vec<PermissionResponse>,
}

impl From<Role> for RoleResponse {
    fn from(role: Role) -> Self {
        Self {
            id: role.id,
            name: role.name,
            description: role.description,
            permissions: role
                .permissions
                .into_iter()
                .map(PermissionResponse::from)
                .collect(),
        }
    }
}

/// List all roles with their permissions.
#[utoipa::path(
    get,
    path = "/api/v1/roles",
    responses(
        (status = 200, description = "All roles", body = [RoleResponse]),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Missing ROLE_READ"),
    ),
    security(("bearer_auth" = [])),
    tag = "roles"
)]
pub async fn list_roles(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<RoleResponse>>> {
    require_authority(&claims, authorities::ROLE_READ)?;

    let roles = state.roles.list_roles().await?;
    Ok(Json(roles.into_iter().map(RoleResponse::from).collect()))
}
