//! Shared application state.

use std::sync::Arc;

use sqlx::PgPool;

use identity::{
    AccountLifecycle, AuditLogger, AuditStorage, GroupManager, GroupStore, JwtAuth, JwtConfig,
    PostgresAuditStorage, PostgresDirectory, RoleStore, UserStore,
};

use crate::middleware::RegistrationLimiter;

/// Application state shared across all request handlers.
pub struct AppState {
    /// Database connection pool (health checks and readiness pings).
    pub pool: PgPool,
    /// Token issuance and validation.
    pub jwt: Arc<JwtAuth>,
    /// Account storage, shared with the lifecycle service.
    pub users: Arc<dyn UserStore>,
    /// Role catalog storage.
    pub roles: Arc<dyn RoleStore>,
    /// Asynchronous audit trail.
    pub audit: Arc<AuditLogger>,
    /// Account lifecycle service.
    pub lifecycle: AccountLifecycle,
    /// Group management service.
    pub groups: GroupManager,
    /// Fixed-window registration limiter.
    pub registration_limiter: RegistrationLimiter,
}

impl AppState {
    /// Wire the identity services over the Postgres-backed stores.
    pub fn new(pool: PgPool, jwt_config: JwtConfig) -> Self {
        let directory = Arc::new(PostgresDirectory::new(pool.clone()));
        let users: Arc<dyn UserStore> = directory.clone();
        let roles: Arc<dyn RoleStore> = directory.clone();
        let group_store: Arc<dyn GroupStore> = directory;

        let audit_storage: Arc<dyn AuditStorage> =
            Arc::new(PostgresAuditStorage::new(pool.clone()));
        let audit = Arc::new(AuditLogger::new(audit_storage));

        let lifecycle = AccountLifecycle::new(users.clone(), roles.clone(), audit.clone());
        let groups = GroupManager::new(users.clone(), group_store, roles.clone(), audit.clone());

        Self {
            pool,
            jwt: Arc::new(JwtAuth::new(jwt_config)),
            users,
            roles,
            audit,
            lifecycle,
            groups,
            registration_limiter: RegistrationLimiter::new(),
        }
    }

    /// Convert to Arc for sharing across handlers.
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}
