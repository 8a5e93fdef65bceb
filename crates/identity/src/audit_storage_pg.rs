//! PostgreSQL storage backend for the audit trail.

use std::net::IpAddr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditQuery, AuditStorage};

/// PostgreSQL-backed audit storage.
pub struct PostgresAuditStorage {
    pool: PgPool,
}

impl PostgresAuditStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Database row for audit entries.
#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: i64,
    timestamp: DateTime<Utc>,
    actor_id: Option<Uuid>,
    actor_name: String,
    action: String,
    resource: String,
    resource_id: Option<String>,
    metadata: Option<serde_json::Value>,
    ip_address: Option<String>,
}

impl AuditRow {
    fn into_event(self) -> AuditEvent {
        let action = AuditAction::parse(&self.action);
        let ip_address = self.ip_address.and_then(|s| s.parse::<IpAddr>().ok());

        AuditEvent {
            id: self.id,
            timestamp: self.timestamp,
            actor_id: self.actor_id,
            actor_name: self.actor_name,
            action,
            resource: self.resource,
            resource_id: self.resource_id,
            metadata: self.metadata.unwrap_or(serde_json::Value::Null),
            ip_address,
        }
    }
}

#[async_trait::async_trait]
impl AuditStorage for PostgresAuditStorage {
    async fn store(&self, event: &AuditEvent) -> Result<i64> {
        let ip_str = event.ip_address.map(|ip| ip.to_string());

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO audit_logs (timestamp, actor_id, actor_name, action, resource, resource_id, metadata, ip_address)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8::inet)
            RETURNING id
            "#,
        )
        .bind(event.timestamp)
        .bind(event.actor_id)
        .bind(&event.actor_name)
        .bind(event.action.as_str())
        .bind(&event.resource)
        .bind(&event.resource_id)
        .bind(&event.metadata)
        .bind(&ip_str)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        // Build dynamic query with filters
        let mut sql = String::from(
            r#"
            SELECT id, timestamp, actor_id, actor_name, action, resource,
                   resource_id, metadata, ip_address::text
            FROM audit_logs
            WHERE 1=1
            "#,
        );

        let mut param_count = 0;

        if query.action.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND action = ${}", param_count));
        }

        if query.actor_name.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND actor_name = ${}", param_count));
        }

        sql.push_str(" ORDER BY timestamp DESC, id DESC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${}", param_count));
        }

        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${}", param_count));
        }

        let mut query_builder = sqlx::query_as::<_, AuditRow>(&sql);

        if let Some(ref action) = query.action {
            query_builder = query_builder.bind(action.as_str().to_string());
        }

        if let Some(ref actor_name) = query.actor_name {
            query_builder = query_builder.bind(actor_name);
        }

        if let Some(limit) = query.limit {
            query_builder = query_builder.bind(limit as i64);
        }

        if let Some(offset) = query.offset {
            query_builder = query_builder.bind(offset as i64);
        }

        let rows = query_builder.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|r| r.into_event()).collect())
    }

    async fn count(&self, query: &AuditQuery) -> Result<u64> {
        let mut sql = String::from("SELECT COUNT(*) FROM audit_logs WHERE 1=1");

        let mut param_count = 0;

        if query.action.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND action = ${}", param_count));
        }

        if query.actor_name.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND actor_name = ${}", param_count));
        }

        let _ = param_count;

        let mut query_builder = sqlx::query_as::<_, (i64,)>(&sql);

        if let Some(ref action) = query.action {
            query_builder = query_builder.bind(action.as_str().to_string());
        }

        if let Some(ref actor_name) = query.actor_name {
            query_builder = query_builder.bind(actor_name);
        }

        let (count,) = query_builder.fetch_one(&self.pool).await?;

        Ok(count as u64)
    }
}
