//! Audit trail for security-relevant actions.
//!
//! Recording is fire-and-forget: `AuditLogger::record` hands the entry to a
//! bounded queue consumed by a dedicated task, so persistence never adds
//! latency to (or fails) the operation that triggered it. Entries are
//! append-only once emitted.

use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::authority::Resource;

/// Actor name recorded when no authenticated principal is present.
pub const SYSTEM_ACTOR: &str = "SYSTEM";

/// Queue capacity for the async dispatch channel. A full queue drops the
/// incoming event rather than blocking the caller.
const QUEUE_CAPACITY: usize = 10_000;

/// Types of auditable actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Authentication
    Login,
    LoginFailed,
    TokenRefresh,
    UserRegistered,

    // Account lifecycle
    UserCreated,
    UserUpdated,
    UserDeleted,
    UserRestored,
    UserPurged,
    UsersBulkDeleted,
    UsersStatusChanged,

    // Groups
    GroupCreated,
    GroupUpdated,
    GroupDeleted,
    GroupMembersAssigned,
    GroupMemberRemoved,

    // Other
    Custom(String),
}

impl AuditAction {
    /// Stable string form used in storage and query filters.
    pub fn as_str(&self) -> &str {
        match self {
            AuditAction::Login => "login",
            AuditAction::LoginFailed => "login_failed",
            AuditAction::TokenRefresh => "token_refresh",
            AuditAction::UserRegistered => "user_registered",
            AuditAction::UserCreated => "user_created",
            AuditAction::UserUpdated => "user_updated",
            AuditAction::UserDeleted => "user_deleted",
            AuditAction::UserRestored => "user_restored",
            AuditAction::UserPurged => "user_purged",
            AuditAction::UsersBulkDeleted => "users_bulk_deleted",
            AuditAction::UsersStatusChanged => "users_status_changed",
            AuditAction::GroupCreated => "group_created",
            AuditAction::GroupUpdated => "group_updated",
            AuditAction::GroupDeleted => "group_deleted",
            AuditAction::GroupMembersAssigned => "group_members_assigned",
            AuditAction::GroupMemberRemoved => "group_member_removed",
            AuditAction::Custom(s) => s,
        }
    }

    /// Parse the stable string form. Unknown strings become `Custom` so
    /// entries written by newer versions still read back.
    pub fn parse(value: &str) -> AuditAction {
        match value {
            "login" => AuditAction::Login,
            "login_failed" => AuditAction::LoginFailed,
            "token_refresh" => AuditAction::TokenRefresh,
            "user_registered" => AuditAction::UserRegistered,
            "user_created" => AuditAction::UserCreated,
            "user_updated" => AuditAction::UserUpdated,
            "user_deleted" => AuditAction::UserDeleted,
            "user_restored" => AuditAction::UserRestored,
            "user_purged" => AuditAction::UserPurged,
            "users_bulk_deleted" => AuditAction::UsersBulkDeleted,
            "users_status_changed" => AuditAction::UsersStatusChanged,
            "group_created" => AuditAction::GroupCreated,
            "group_updated" => AuditAction::GroupUpdated,
            "group_deleted" => AuditAction::GroupDeleted,
            "group_members_assigned" => AuditAction::GroupMembersAssigned,
            "group_member_removed" => AuditAction::GroupMemberRemoved,
            other => AuditAction::Custom(other.to_string()),
        }
    }
}

/// The acting principal stamped onto an audit entry.
///
/// Passed explicitly into every recording call instead of being read from
/// ambient state; the SYSTEM fallback is a constructor, not a hidden global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    /// Account id; `None` for system-initiated actions.
    pub id: Option<Uuid>,
    /// Display name; `SYSTEM` for system-initiated actions.
    pub name: String,
    /// Source IP of the triggering request, when known.
    pub ip: Option<IpAddr>,
}

impl Actor {
    /// The sentinel identity for actions without an authenticated principal.
    pub fn system() -> Self {
        Self {
            id: None,
            name: SYSTEM_ACTOR.to_string(),
            ip: None,
        }
    }

    /// An authenticated account.
    pub fn account(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            name: name.into(),
            ip: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }
}

impl Default for Actor {
    fn default() -> Self {
        Self::system()
    }
}

/// An audit entry. Immutable once stored; never updated or deleted by
/// application logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Acting account id, if any.
    pub actor_id: Option<Uuid>,
    /// Acting account name, or `SYSTEM`.
    pub actor_name: String,
    /// What happened.
    pub action: AuditAction,
    /// Resource kind that was affected.
    pub resource: String,
    /// Identifier of the affected entity, if one applies.
    pub resource_id: Option<String>,
    /// Free-form details about the action.
    pub metadata: serde_json::Value,
    /// Source IP of the triggering request.
    pub ip_address: Option<IpAddr>,
}

/// Storage backend for audit entries.
#[async_trait::async_trait]
pub trait AuditStorage: Send + Sync {
    /// Persist an entry, returning its assigned id.
    async fn store(&self, event: &AuditEvent) -> Result<i64>;

    /// Query entries, newest first.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>>;

    /// Count entries matching the query's filters.
    async fn count(&self, query: &AuditQuery) -> Result<u64>;
}

/// Filters and paging for the audit listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub action: Option<AuditAction>,
    pub actor_name: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn actor(mut self, actor_name: impl Into<String>) -> Self {
        self.actor_name = Some(actor_name.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// In-memory audit storage for testing.
pub struct MemoryAuditStorage {
    events: Arc<tokio::sync::RwLock<Vec<AuditEvent>>>,
    next_id: Arc<AtomicI64>,
}

impl MemoryAuditStorage {
    pub fn new() -> Self {
        Self {
            events: Arc::new(tokio::sync::RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }
}

impl Default for MemoryAuditStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AuditStorage for MemoryAuditStorage {
    async fn store(&self, event: &AuditEvent) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = event.clone();
        stored.id = id;

        let mut events = self.events.write().await;
        events.push(stored);

        Ok(id)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let events = self.events.read().await;

        let mut filtered: Vec<_> = events
            .iter()
            .filter(|e| {
                if let Some(ref action) = query.action {
                    if &e.action != action {
                        return false;
                    }
                }
                if let Some(ref actor) = query.actor_name {
                    if &e.actor_name != actor {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        // Newest first; insertion order is not guaranteed under concurrency.
        filtered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));

        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.unwrap_or(100) as usize;

        Ok(filtered.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self, query: &AuditQuery) -> Result<u64> {
        let events = self.events.read().await;

        let count = events
            .iter()
            .filter(|e| {
                if let Some(ref action) = query.action {
                    if &e.action != action {
                        return false;
                    }
                }
                if let Some(ref actor) = query.actor_name {
                    if &e.actor_name != actor {
                        return false;
                    }
                }
                true
            })
            .count();

        Ok(count as u64)
    }
}

/// Audit logger service.
///
/// Owns the bounded dispatch queue and its consumer task. Storage failures
/// are logged and never retried; entries are best-effort, not transactional
/// with the action they describe.
pub struct AuditLogger {
    storage: Arc<dyn AuditStorage>,
    tx: mpsc::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
}

impl AuditLogger {
    /// Create a new audit logger and spawn its consumer task.
    pub fn new(storage: Arc<dyn AuditStorage>) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(QUEUE_CAPACITY);

        let sink = storage.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.store(&event).await {
                    tracing::error!(
                        error = %e,
                        action = %event.action.as_str(),
                        "Failed to store audit event"
                    );
                }
            }
        });

        Self {
            storage,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a security-relevant action (non-blocking).
    pub fn record(
        &self,
        actor: &Actor,
        action: AuditAction,
        resource: Resource,
        resource_id: Option<String>,
        metadata: serde_json::Value,
    ) {
        let event = AuditEvent {
            id: 0, // Set by storage
            timestamp: Utc::now(),
            actor_id: actor.id,
            actor_name: actor.name.clone(),
            action,
            resource: resource.as_str().to_string(),
            resource_id,
            metadata,
            ip_address: actor.ip,
        };
        self.log(event);
    }

    /// Queue a prepared event without blocking. A full queue drops the event
    /// and increments the drop counter.
    pub fn log(&self, event: AuditEvent) {
        if self.tx.try_send(event).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped_total = total, "Audit queue full, event dropped");
        }
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Query stored entries, newest first.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        self.storage.query(query).await
    }

    /// Count entries matching the query's filters.
    pub async fn count(&self, query: &AuditQuery) -> Result<u64> {
        self.storage.count(query).await
    }
}
