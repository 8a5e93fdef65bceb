//! Authority resolution.
//!
//! Flattens an account's role/group graph into the set of authority strings
//! consulted by access checks: `ROLE_<name>` per role plus one
//! `<RESOURCE>_<ACTION>` string per permission. The walk is two fixed hops
//! (account to roles and groups, group to roles), so it is plain iteration
//! rather than graph traversal.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::model::{AccountGrants, Role};

/// Prefix for role-derived authority strings.
pub const ROLE_PREFIX: &str = "ROLE_";

/// Name of the administrator role protected by the last-admin invariant.
pub const ADMIN_ROLE: &str = "ADMIN";

/// Role assigned to accounts created without an explicit role set.
pub const DEFAULT_ROLE: &str = "USER";

/// Resources that permissions can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resource {
    User,
    Role,
    Permission,
    Group,
    System,
}

impl Resource {
    pub const ALL: [Resource; 5] = [
        Resource::User,
        Resource::Role,
        Resource::Permission,
        Resource::Group,
        Resource::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::User => "USER",
            Resource::Role => "ROLE",
            Resource::Permission => "PERMISSION",
            Resource::Group => "GROUP",
            Resource::System => "SYSTEM",
        }
    }

    pub fn parse(value: &str) -> Option<Resource> {
        match value {
            "USER" => Some(Resource::User),
            "ROLE" => Some(Resource::Role),
            "PERMISSION" => Some(Resource::Permission),
            "GROUP" => Some(Resource::Group),
            "SYSTEM" => Some(Resource::System),
            _ => None,
        }
    }
}

/// Actions that permissions can grant on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    Manage,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Read,
        Action::Create,
        Action::Update,
        Action::Delete,
        Action::Manage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "READ",
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
            Action::Manage => "MANAGE",
        }
    }

    pub fn parse(value: &str) -> Option<Action> {
        match value {
            "READ" => Some(Action::Read),
            "CREATE" => Some(Action::Create),
            "UPDATE" => Some(Action::Update),
            "DELETE" => Some(Action::Delete),
            "MANAGE" => Some(Action::Manage),
            _ => None,
        }
    }
}

/// Authority strings required by the administrative endpoints.
pub mod authorities {
    pub const USER_READ: &str = "USER_READ";
    pub const USER_CREATE: &str = "USER_CREATE";
    pub const USER_UPDATE: &str = "USER_UPDATE";
    pub const USER_DELETE: &str = "USER_DELETE";
    pub const ROLE_READ: &str = "ROLE_READ";
    pub const SYSTEM_MANAGE: &str = "SYSTEM_MANAGE";
}

/// Compute the full authority set granted to an account.
///
/// Union of the direct roles and of every role reachable through a group
/// membership. Duplicates collapse; an account with no roles and no groups
/// resolves to the empty set, which is a valid state rather than an error.
pub fn resolve_authorities(grants: &AccountGrants) -> HashSet<String> {
    let mut resolved = HashSet::new();

    for role in &grants.roles {
        collect_role(role, &mut resolved);
    }
    for membership in &grants.groups {
        for role in &membership.roles {
            collect_role(role, &mut resolved);
        }
    }

    resolved
}

fn collect_role(role: &Role, out: &mut HashSet<String>) {
    out.insert(format!("{}{}", ROLE_PREFIX, role.name));
    for permission in &role.permissions {
        out.insert(permission.authority());
    }
}
