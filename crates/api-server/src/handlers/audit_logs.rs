//! Audit trail handler, read-only.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use identity::authority::authorities;
use identity::{AuditAction, AuditEvent, AuditQuery, Claims};

use crate::error::ApiResult;
use crate::handlers::users::{default_page, default_per_page};
use crate::middleware::require_any_authority;
use crate::state::AppState;

/// Query parameters for the audit trail.
#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogParams {
    /// Filter by action, e.g. "login_failed" or "user_deleted".
    pub action: Option<String>,
    /// Filter by acting account name, exact match.
    pub actor_name: Option<String>,
    /// 1-based page number.
    #[serde(default = "default_page")]
    pub page: u32,
    /// Page size, capped at 100.
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

/// One audit trail entry.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogResponse {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// Absent for system-attributed events such as failed logins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<Uuid>,
    pub actor_name: String,
    pub action: String,
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub ip_address: Option<IpAddr>,
}

impl From<AuditEvent> for AuditLogResponse {
    fn from(event: AuditEvent) -> Self {
        Self {
            id: event.id,
            timestamp: event.timestamp,
            actor_id: event.actor_id,
            actor_name: event.actor_name,
            action: event.action.as_str().to_string(),
            resource: event.resource,
            resource_id: event.resource_id,
            metadata: event.metadata,
            ip_address: event.ip_address,
        }
    }
}

/// One page of audit entries, newest first.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogPage {
    pub items: Vec<AuditLogResponse>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// List audit entries, newest first.
#[utoipa::path(
    get,
    path = "/api/v1/audit-logs",
    params(AuditLogParams),
    responses(
        (status = 200, description = "One page of audit entries", body = AuditLogPage),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Requires SYSTEM_MANAGE or USER_READ"),
    ),
    security(("bearer_auth" = [])),
    tag = "audit"
)]
pub async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Query(params): Query<AuditLogParams>,
) -> ApiResult<Json<AuditLogPage>> {
    require_any_authority(
        &claims,
        &[authorities::SYSTEM_MANAGE, authorities::USER_READ],
    )?;

    let page = params.page.max(1);
    let per_page = params.per_page.clamp(1, 100);

    let mut query = AuditQuery::new()
        .limit(per_page)
        .offset((page - 1) * per_page);
    if let Some(action) = &params.action {
        query = query.action(AuditAction::parse(action));
    }
    if let Some(actor_name) = &params.actor_name {
        query = query.actor(actor_name.clone());
    }

    let events = state.audit.query(&query).await?;
    let total = state.audit.count(&query).await?;

    Ok(Json(AuditLogPage {
        items: events.into_iter().map(AuditLogResponse::from).collect(),
        total,
        page,
        per_page,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity::Actor;

    #[test]
    fn test_audit_params_defaults() {
        let params: AuditLogParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.page, 1);
        assert_eq!(params.per_page, 20);
        assert!(params.action.is_none());

        let params: AuditLogParams =
            serde_json::from_str(r#"{"action":"login_failed","actorName":"alice"}"#).unwrap();
        assert_eq!(params.action.as_deref(), Some("login_failed"));
        assert_eq!(params.actor_name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_audit_entry_wire_shape() {
        let actor = Actor::system();
        let event = AuditEvent {
            id: 7,
            timestamp: Utc::now(),
            actor_id: actor.id,
            actor_name: actor.name.clone(),
            action: AuditAction::LoginFailed,
            resource: "SYSTEM".to_string(),
            resource_id: None,
            metadata: serde_json::json!({ "username": "ghost" }),
            ip_address: None,
        };
        let json = serde_json::to_value(AuditLogResponse::from(event)).unwrap();

        assert_eq!(json["id"], 7);
        assert_eq!(json["action"], "login_failed");
        assert_eq!(json["actorName"], "SYSTEM");
        assert_eq!(json["metadata"]["username"], "ghost");
        // System events carry no account id or address.
        assert!(json.get("actorId").is_none());
        assert!(json.get("ipAddress").is_none());
    }
}
