//! Core identity entities: accounts, roles, groups, permissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::authority::{Action, Resource};

/// A permission identified by a (resource, action) pair.
///
/// The authority string consumed by access checks is derived from the pair
/// (`USER_MANAGE`), never stored independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub resource: Resource,
    pub action: Action,
    pub description: Option<String>,
}

impl Permission {
    pub fn new(resource: Resource, action: Action) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource,
            action,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The flat authority string for this permission, e.g. `USER_MANAGE`.
    pub fn authority(&self) -> String {
        format!("{}_{}", self.resource.as_str(), self.action.as_str())
    }
}

/// A named set of permissions, shared many-to-many with accounts and groups.
#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub permissions: Vec<Permission>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            permissions: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }
}

/// A named collection of accounts that grants its roles to every member.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A stored account.
///
/// `deleted_at` is the soft-delete marker: a set timestamp removes the
/// account from every active-only lookup while keeping the row restorable.
/// Username and email are unique among non-deleted accounts only.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub enabled: bool,
    pub account_expired: bool,
    pub account_locked: bool,
    pub credentials_expired: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            email: email.into(),
            password_hash: password_hash.into(),
            enabled: true,
            account_expired: false,
            account_locked: false,
            credentials_expired: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// An account joined with everything the permission resolver needs: its
/// directly-assigned roles and, per group membership, the group's roles.
/// Stores produce this in a fixed number of queries (no per-role fetches).
#[derive(Debug, Clone)]
pub struct AccountGrants {
    pub user: User,
    pub roles: Vec<Role>,
    pub groups: Vec<GroupGrants>,
}

/// One group membership with the roles that group carries.
#[derive(Debug, Clone)]
pub struct GroupGrants {
    pub group: Group,
    pub roles: Vec<Role>,
}

/// Built-in roles seeded on first start.
pub struct DefaultRoles;

impl DefaultRoles {
    /// Administrator: every permission in the catalog.
    pub fn admin() -> Role {
        let mut role = Role::new(crate::authority::ADMIN_ROLE)
            .with_description("Full administrative access");
        for resource in Resource::ALL {
            for action in Action::ALL {
                role.permissions.push(Permission::new(resource, action));
            }
        }
        role
    }

    /// Regular user: role membership only, no standalone permissions.
    pub fn user() -> Role {
        Role::new(crate::authority::DEFAULT_ROLE).with_description("Regular user")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_authority_string() {
        let permission = Permission::new(Resource::User, Action::Manage);
        assert_eq!(permission.authority(), "USER_MANAGE");

        let permission = Permission::new(Resource::System, Action::Read);
        assert_eq!(permission.authority(), "SYSTEM_READ");
    }

    #[test]
    fn test_new_user_defaults() {
        let user = User::new("alice", "alice@x.com", "hash");
        assert!(user.enabled);
        assert!(!user.account_expired);
        assert!(!user.account_locked);
        assert!(!user.credentials_expired);
        assert!(!user.is_deleted());
    }

    #[test]
    fn test_default_admin_covers_catalog() {
        let admin = DefaultRoles::admin();
        assert_eq!(admin.name, "ADMIN");
        assert_eq!(
            admin.permissions.len(),
            Resource::ALL.len() * Action::ALL.len()
        );

        let user = DefaultRoles::user();
        assert_eq!(user.name, "USER");
        assert!(user.permissions.is_empty());
    }
}
