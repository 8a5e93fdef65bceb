//! Authenticated account view.

use std::collections::HashSet;

use crate::authority::resolve_authorities;
use crate::model::{AccountGrants, GroupGrants, Role, User};

/// An account together with its resolved authority set.
///
/// Built once per authentication or refresh so handlers check authorities
/// against a flat set instead of re-walking roles and groups.
#[derive(Debug, Clone)]
pub struct Principal {
    grants: AccountGrants,
    authorities: HashSet<String>,
}

impl Principal {
    pub fn from_grants(grants: AccountGrants) -> Self {
        let authorities = resolve_authorities(&grants);
        Self { grants, authorities }
    }

    pub fn user(&self) -> &User {
        &self.grants.user
    }

    pub fn username(&self) -> &str {
        &self.grants.user.username
    }

    pub fn direct_roles(&self) -> &[Role] {
        &self.grants.roles
    }

    pub fn groups(&self) -> &[GroupGrants] {
        &self.grants.groups
    }

    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.contains(authority)
    }

    /// Authorities in a stable order, as embedded in issued tokens.
    pub fn authorities_vec(&self) -> Vec<String> {
        let mut authorities: Vec<String> = self.authorities.iter().cloned().collect();
        authorities.sort();
        authorities
    }

    /// Whether the account may log in or refresh a session. Every status
    /// flag must be clear and the account must not be soft-deleted.
    pub fn can_authenticate(&self) -> bool {
        let user = &self.grants.user;
        user.enabled
            && !user.account_expired
            && !user.account_locked
            && !user.credentials_expired
            && !user.is_deleted()
    }
}
