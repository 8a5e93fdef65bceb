//! Identity and Access
//!
//! Accounts, roles, groups and permissions; JWT issuance and validation;
//! the soft-delete/restore/purge account lifecycle; and the asynchronous
//! audit trail.

pub mod audit;
pub mod audit_storage_pg;
pub mod authority;
pub mod error;
pub mod jwt;
pub mod lifecycle;
pub mod model;
pub mod password;
pub mod principal;
pub mod store;
pub mod store_pg;

pub use audit::{Actor, AuditAction, AuditEvent, AuditLogger, AuditQuery, AuditStorage};
pub use audit_storage_pg::PostgresAuditStorage;
pub use authority::{resolve_authorities, Action, Resource, ADMIN_ROLE, DEFAULT_ROLE};
pub use error::{IdentityError, IdentityResult};
pub use jwt::{Claims, JwtAuth, JwtConfig};
pub use lifecycle::{
    AccountLifecycle, AccountUpdate, GroupDetail, GroupManager, GroupUpdate, NewAccount,
};
pub use model::{AccountGrants, DefaultRoles, Group, GroupGrants, Permission, Role, User};
pub use principal::Principal;
pub use store::{GroupStore, MemoryDirectory, Page, RoleStore, UserQuery, UserStore};
pub use store_pg::PostgresDirectory;
