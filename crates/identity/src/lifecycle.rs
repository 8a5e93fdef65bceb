//! Account lifecycle and group management services.
//!
//! `AccountLifecycle` owns the create / soft-delete / restore / purge state
//! machine (`ACTIVE -> SOFT_DELETED -> RESTORED | PURGED`) and the last-admin
//! invariant on bulk deletion. `GroupManager` owns group CRUD and the
//! bidirectional membership relation. Both record every mutation on the audit
//! trail; audit failures never surface to callers.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::{Actor, AuditAction, AuditLogger};
use crate::authority::{Resource, DEFAULT_ROLE};
use crate::error::{IdentityError, IdentityResult};
use crate::model::{Group, Role, User};
use crate::password::hash_password;
use crate::store::{GroupStore, Page, RoleStore, UserQuery, UserStore};

/// Input for account creation.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub password: String,
    /// Direct role assignments; `None` falls back to the default role.
    pub role_ids: Option<Vec<Uuid>>,
}

/// Partial update of an account. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub enabled: Option<bool>,
    pub role_ids: Option<Vec<Uuid>>,
}

/// Account lifecycle service.
pub struct AccountLifecycle {
    users: Arc<dyn UserStore>,
    roles: Arc<dyn RoleStore>,
    audit: Arc<AuditLogger>,
    // Serializes the admin-count check against the deletion it guards;
    // without it two concurrent bulk deletes could jointly remove every
    // administrator while each passes the check on a stale count.
    bulk_delete_lock: Mutex<()>,
}

impl AccountLifecycle {
    pub fn new(
        users: Arc<dyn UserStore>,
        roles: Arc<dyn RoleStore>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            users,
            roles,
            audit,
            bulk_delete_lock: Mutex::new(()),
        }
    }

    /// Create an account on behalf of an administrator.
    pub async fn create(&self, actor: &Actor, new: NewAccount) -> IdentityResult<User> {
        let (user, role_names) = self.insert_account(new).await?;
        self.audit.record(
            actor,
            AuditAction::UserCreated,
            Resource::User,
            Some(user.id.to_string()),
            json!({ "username": user.username, "email": user.email, "roles": role_names }),
        );
        Ok(user)
    }

    /// Self-service registration. Always lands on the default role; the
    /// audit entry is attributed to the account that registered itself.
    pub async fn register(&self, ip: Option<IpAddr>, new: NewAccount) -> IdentityResult<User> {
        let forced = NewAccount {
            role_ids: None,
            ..new
        };
        let (user, _) = self.insert_account(forced).await?;

        let mut actor = Actor::account(user.id, &user.username);
        if let Some(ip) = ip {
            actor = actor.with_ip(ip);
        }
        self.audit.record(
            &actor,
            AuditAction::UserRegistered,
            Resource::User,
            Some(user.id.to_string()),
            json!({ "username": user.username, "email": user.email }),
        );
        Ok(user)
    }

    async fn insert_account(&self, new: NewAccount) -> IdentityResult<(User, Vec<String>)> {
        if self
            .users
            .find_active_by_username(&new.username)
            .await?
            .is_some()
        {
            return Err(IdentityError::DuplicateIdentity(
                "Username is already in use".to_string(),
            ));
        }
        if self.users.find_active_by_email(&new.email).await?.is_some() {
            return Err(IdentityError::DuplicateIdentity(
                "Email is already in use".to_string(),
            ));
        }

        let roles = self.resolve_roles(new.role_ids.as_deref()).await?;
        let role_ids: Vec<Uuid> = roles.iter().map(|r| r.id).collect();
        let role_names: Vec<String> = roles.iter().map(|r| r.name.clone()).collect();

        let password_hash = hash_password(&new.password)?;
        let user = User::new(new.username, new.email, password_hash);
        self.users.insert_user(&user, &role_ids).await?;

        tracing::info!(user_id = %user.id, username = %user.username, "Account created");
        Ok((user, role_names))
    }

    /// Resolve requested role ids, or the default role when none are given.
    /// Any id that does not exist fails the whole request.
    async fn resolve_roles(&self, role_ids: Option<&[Uuid]>) -> IdentityResult<Vec<Role>> {
        match role_ids {
            Some(ids) => {
                let unique = dedup(ids);
                let roles = self.roles.find_roles_by_ids(&unique).await?;
                if roles.len() != unique.len() {
                    return Err(IdentityError::NotFound(
                        "One or more roles do not exist".to_string(),
                    ));
                }
                Ok(roles)
            }
            None => {
                let role = self.roles.find_role_by_name(DEFAULT_ROLE).await?.ok_or_else(|| {
                    IdentityError::NotFound(format!("Default role {DEFAULT_ROLE} is not provisioned"))
                })?;
                Ok(vec![role])
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> IdentityResult<User> {
        self.users
            .find_by_id(id)
            .await?
            .ok_or_else(|| IdentityError::NotFound("Account not found".to_string()))
    }

    /// Lookup by username, excluding soft-deleted accounts.
    pub async fn get_by_username(&self, username: &str) -> IdentityResult<User> {
        self.users
            .find_active_by_username(username)
            .await?
            .ok_or_else(|| IdentityError::NotFound("Account not found".to_string()))
    }

    pub async fn list(&self, query: &UserQuery) -> IdentityResult<Page<User>> {
        Ok(self.users.search(query).await?)
    }

    /// Direct roles for a set of accounts, used to decorate listings.
    pub async fn roles_of(
        &self,
        ids: &[Uuid],
    ) -> IdentityResult<std::collections::HashMap<Uuid, Vec<Role>>> {
        Ok(self.users.roles_for_users(ids).await?)
    }

    pub async fn update(
        &self,
        actor: &Actor,
        id: Uuid,
        update: AccountUpdate,
    ) -> IdentityResult<User> {
        let mut user = self.get(id).await?;
        if user.is_deleted() {
            return Err(IdentityError::InvalidState(
                "Cannot update a deleted account".to_string(),
            ));
        }

        let mut changed: Vec<&str> = Vec::new();

        if let Some(username) = update.username {
            if username != user.username {
                if let Some(other) = self.users.find_active_by_username(&username).await? {
                    if other.id != id {
                        return Err(IdentityError::DuplicateIdentity(
                            "Username is already in use".to_string(),
                        ));
                    }
                }
                user.username = username;
                changed.push("username");
            }
        }

        if let Some(email) = update.email {
            if email != user.email {
                if let Some(other) = self.users.find_active_by_email(&email).await? {
                    if other.id != id {
                        return Err(IdentityError::DuplicateIdentity(
                            "Email is already in use".to_string(),
                        ));
                    }
                }
                user.email = email;
                changed.push("email");
            }
        }

        if let Some(password) = update.password {
            user.password_hash = hash_password(&password)?;
            changed.push("password");
        }

        if let Some(enabled) = update.enabled {
            if enabled != user.enabled {
                user.enabled = enabled;
                changed.push("enabled");
            }
        }

        // Validate the replacement role set before any write happens.
        let new_role_ids = match update.role_ids {
            Some(ids) => {
                let roles = self.resolve_roles(Some(&ids)).await?;
                changed.push("roles");
                Some(roles.into_iter().map(|r| r.id).collect::<Vec<_>>())
            }
            None => None,
        };

        if changed.is_empty() {
            return Ok(user);
        }

        user.updated_at = Utc::now();
        self.users.update_user(&user).await?;
        if let Some(role_ids) = new_role_ids {
            self.users.replace_roles(id, &role_ids).await?;
        }

        self.audit.record(
            actor,
            AuditAction::UserUpdated,
            Resource::User,
            Some(id.to_string()),
            json!({ "username": user.username, "fields": changed }),
        );
        Ok(user)
    }

    /// Soft-delete one account. Already-deleted and unknown targets both
    /// fail; the last-admin invariant applies to bulk deletion only.
    pub async fn soft_delete(&self, actor: &Actor, id: Uuid) -> IdentityResult<()> {
        let user = self.get(id).await?;
        if user.is_deleted() {
            return Err(IdentityError::NotFound(
                "Account is already deleted".to_string(),
            ));
        }

        let modified = self.users.mark_deleted(&[id], Utc::now()).await?;
        if modified == 0 {
            return Err(IdentityError::NotFound("Account not found".to_string()));
        }

        tracing::info!(user_id = %id, username = %user.username, "Account soft-deleted");
        self.audit.record(
            actor,
            AuditAction::UserDeleted,
            Resource::User,
            Some(id.to_string()),
            json!({ "username": user.username }),
        );
        Ok(())
    }

    /// Soft-delete a batch, all-or-nothing.
    ///
    /// Fails NotFound if any id is unknown or already deleted. Fails
    /// InvalidState if the batch would remove every enabled administrator.
    /// The check and the deletion run under one lock so concurrent batches
    /// cannot jointly empty the administrator set.
    pub async fn bulk_soft_delete(&self, actor: &Actor, ids: &[Uuid]) -> IdentityResult<u64> {
        let unique = dedup(ids);
        if unique.is_empty() {
            return Ok(0);
        }

        let _guard = self.bulk_delete_lock.lock().await;

        let found = self.users.find_by_ids(&unique).await?;
        if found.len() != unique.len() || found.iter().any(|u| u.is_deleted()) {
            return Err(IdentityError::NotFound(
                "One or more accounts were not found or are already deleted".to_string(),
            ));
        }

        let admins = self.users.active_admin_ids().await?;
        if !admins.is_empty() {
            let in_batch = unique.iter().filter(|id| admins.contains(id)).count();
            if in_batch >= admins.len() {
                return Err(IdentityError::InvalidState(
                    "Cannot delete the last administrator account".to_string(),
                ));
            }
        }

        let modified = self.users.mark_deleted(&unique, Utc::now()).await?;

        tracing::info!(count = modified, "Accounts soft-deleted in bulk");
        self.audit.record(
            actor,
            AuditAction::UsersBulkDeleted,
            Resource::User,
            None,
            json!({
                "userIds": unique.iter().map(Uuid::to_string).collect::<Vec<_>>(),
                "count": modified,
            }),
        );
        Ok(modified)
    }

    /// Clear the deletion marker. Only soft-deleted accounts can be
    /// restored; a username or email claimed by a newer account since the
    /// deletion blocks the restore.
    pub async fn restore(&self, actor: &Actor, id: Uuid) -> IdentityResult<User> {
        let user = self.get(id).await?;
        if !user.is_deleted() {
            return Err(IdentityError::NotFound(
                "Account is not deleted".to_string(),
            ));
        }

        if self
            .users
            .find_active_by_username(&user.username)
            .await?
            .is_some()
        {
            return Err(IdentityError::DuplicateIdentity(
                "Username has been taken by another account".to_string(),
            ));
        }
        if self
            .users
            .find_active_by_email(&user.email)
            .await?
            .is_some()
        {
            return Err(IdentityError::DuplicateIdentity(
                "Email has been taken by another account".to_string(),
            ));
        }

        if !self.users.clear_deleted(id).await? {
            return Err(IdentityError::NotFound("Account not found".to_string()));
        }

        tracing::info!(user_id = %id, username = %user.username, "Account restored");
        self.audit.record(
            actor,
            AuditAction::UserRestored,
            Resource::User,
            Some(id.to_string()),
            json!({ "username": user.username }),
        );
        self.get(id).await
    }

    /// Permanently remove a soft-deleted account. Active accounts cannot be
    /// purged; delete first.
    pub async fn purge(&self, actor: &Actor, id: Uuid) -> IdentityResult<()> {
        let user = self.get(id).await?;
        if !user.is_deleted() {
            return Err(IdentityError::NotFound(
                "Only soft-deleted accounts can be purged".to_string(),
            ));
        }

        if !self.users.purge(id).await? {
            return Err(IdentityError::NotFound("Account not found".to_string()));
        }

        tracing::info!(user_id = %id, username = %user.username, "Account purged");
        self.audit.record(
            actor,
            AuditAction::UserPurged,
            Resource::User,
            Some(id.to_string()),
            json!({ "username": user.username }),
        );
        Ok(())
    }

    /// Enable or disable a batch. Ids that do not resolve to a non-deleted
    /// account are skipped without error; returns the count modified.
    pub async fn set_enabled_bulk(
        &self,
        actor: &Actor,
        ids: &[Uuid],
        enabled: bool,
    ) -> IdentityResult<u64> {
        let unique = dedup(ids);
        if unique.is_empty() {
            return Ok(0);
        }

        let modified = self.users.set_enabled(&unique, enabled).await?;
        if modified > 0 {
            tracing::info!(count = modified, enabled, "Account status changed in bulk");
            self.audit.record(
                actor,
                AuditAction::UsersStatusChanged,
                Resource::User,
                None,
                json!({
                    "userIds": unique.iter().map(Uuid::to_string).collect::<Vec<_>>(),
                    "enabled": enabled,
                    "modified": modified,
                }),
            );
        }
        Ok(modified)
    }
}

/// A group with its granted roles and current member ids.
#[derive(Debug, Clone)]
pub struct GroupDetail {
    pub group: Group,
    pub roles: Vec<Role>,
    pub member_ids: Vec<Uuid>,
}

/// Partial update of a group. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub role_ids: Option<Vec<Uuid>>,
}

/// Group management service.
pub struct GroupManager {
    users: Arc<dyn UserStore>,
    groups: Arc<dyn GroupStore>,
    roles: Arc<dyn RoleStore>,
    audit: Arc<AuditLogger>,
}

impl GroupManager {
    pub fn new(
        users: Arc<dyn UserStore>,
        groups: Arc<dyn GroupStore>,
        roles: Arc<dyn RoleStore>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            users,
            groups,
            roles,
            audit,
        }
    }

    pub async fn create(
        &self,
        actor: &Actor,
        name: &str,
        description: Option<String>,
        role_ids: &[Uuid],
    ) -> IdentityResult<GroupDetail> {
        if self.groups.find_group_by_name(name).await?.is_some() {
            return Err(IdentityError::DuplicateIdentity(
                "Group name is already in use".to_string(),
            ));
        }

        let unique = dedup(role_ids);
        let roles = self.resolve_roles(&unique).await?;

        let mut group = Group::new(name);
        if let Some(description) = description {
            group = group.with_description(description);
        }
        self.groups.insert_group(&group, &unique).await?;

        tracing::info!(group_id = %group.id, name = %group.name, "Group created");
        self.audit.record(
            actor,
            AuditAction::GroupCreated,
            Resource::Group,
            Some(group.id.to_string()),
            json!({ "name": group.name }),
        );

        Ok(GroupDetail {
            group,
            roles,
            member_ids: Vec::new(),
        })
    }

    async fn resolve_roles(&self, ids: &[Uuid]) -> IdentityResult<Vec<Role>> {
        let roles = self.roles.find_roles_by_ids(ids).await?;
        if roles.len() != ids.len() {
            return Err(IdentityError::NotFound(
                "One or more roles do not exist".to_string(),
            ));
        }
        Ok(roles)
    }

    pub async fn get(&self, id: Uuid) -> IdentityResult<GroupDetail> {
        let group = self
            .groups
            .find_group(id)
            .await?
            .ok_or_else(|| IdentityError::NotFound("Group not found".to_string()))?;
        self.detail(group).await
    }

    pub async fn list(&self) -> IdentityResult<Vec<GroupDetail>> {
        let groups = self.groups.list_groups().await?;
        let mut details = Vec::with_capacity(groups.len());
        for group in groups {
            details.push(self.detail(group).await?);
        }
        Ok(details)
    }

    async fn detail(&self, group: Group) -> IdentityResult<GroupDetail> {
        let roles = self.groups.group_roles(group.id).await?;
        let member_ids = self.groups.group_member_ids(group.id).await?;
        Ok(GroupDetail {
            group,
            roles,
            member_ids,
        })
    }

    pub async fn update(
        &self,
        actor: &Actor,
        id: Uuid,
        update: GroupUpdate,
    ) -> IdentityResult<GroupDetail> {
        let mut group = self
            .groups
            .find_group(id)
            .await?
            .ok_or_else(|| IdentityError::NotFound("Group not found".to_string()))?;

        let mut changed: Vec<&str> = Vec::new();

        if let Some(name) = update.name {
            if name != group.name {
                if let Some(other) = self.groups.find_group_by_name(&name).await? {
                    if other.id != id {
                        return Err(IdentityError::DuplicateIdentity(
                            "Group name is already in use".to_string(),
                        ));
                    }
                }
                group.name = name;
                changed.push("name");
            }
        }

        if let Some(description) = update.description {
            group.description = Some(description);
            changed.push("description");
        }

        let new_role_ids = match update.role_ids {
            Some(ids) => {
                let unique = dedup(&ids);
                self.resolve_roles(&unique).await?;
                changed.push("roles");
                Some(unique)
            }
            None => None,
        };

        if !changed.is_empty() {
            self.groups
                .update_group(&group, new_role_ids.as_deref())
                .await?;
            self.audit.record(
                actor,
                AuditAction::GroupUpdated,
                Resource::Group,
                Some(id.to_string()),
                json!({ "name": group.name, "fields": changed }),
            );
        }

        self.detail(group).await
    }

    /// Delete an empty group. Groups that still have members cannot be
    /// deleted; remove the members first.
    pub async fn delete(&self, actor: &Actor, id: Uuid) -> IdentityResult<()> {
        let group = self
            .groups
            .find_group(id)
            .await?
            .ok_or_else(|| IdentityError::NotFound("Group not found".to_string()))?;

        let members = self.groups.group_member_ids(id).await?;
        if !members.is_empty() {
            return Err(IdentityError::InvalidState(
                "Group still has members".to_string(),
            ));
        }

        if !self.groups.delete_group(id).await? {
            return Err(IdentityError::NotFound("Group not found".to_string()));
        }

        tracing::info!(group_id = %id, name = %group.name, "Group deleted");
        self.audit.record(
            actor,
            AuditAction::GroupDeleted,
            Resource::Group,
            Some(id.to_string()),
            json!({ "name": group.name }),
        );
        Ok(())
    }

    /// Add accounts to a group. Every id must resolve to a non-deleted
    /// account or the whole request fails. Returns the count newly added;
    /// existing members are skipped.
    pub async fn assign_members(
        &self,
        actor: &Actor,
        group_id: Uuid,
        user_ids: &[Uuid],
    ) -> IdentityResult<u64> {
        let group = self
            .groups
            .find_group(group_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound("Group not found".to_string()))?;

        let unique = dedup(user_ids);
        if unique.is_empty() {
            return Ok(0);
        }

        let found = self.users.find_by_ids(&unique).await?;
        if found.len() != unique.len() || found.iter().any(|u| u.is_deleted()) {
            return Err(IdentityError::NotFound(
                "One or more accounts were not found".to_string(),
            ));
        }

        let added = self.groups.add_members(group_id, &unique).await?;
        if added > 0 {
            self.audit.record(
                actor,
                AuditAction::GroupMembersAssigned,
                Resource::Group,
                Some(group_id.to_string()),
                json!({
                    "name": group.name,
                    "userIds": unique.iter().map(Uuid::to_string).collect::<Vec<_>>(),
                    "added": added,
                }),
            );
        }
        Ok(added)
    }

    /// Remove one account from a group.
    pub async fn remove_member(
        &self,
        actor: &Actor,
        group_id: Uuid,
        user_id: Uuid,
    ) -> IdentityResult<()> {
        let group = self
            .groups
            .find_group(group_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound("Group not found".to_string()))?;

        if !self.groups.remove_member(group_id, user_id).await? {
            return Err(IdentityError::NotFound(
                "Account is not a member of this group".to_string(),
            ));
        }

        self.audit.record(
            actor,
            AuditAction::GroupMemberRemoved,
            Resource::Group,
            Some(group_id.to_string()),
            json!({ "name": group.name, "userId": user_id.to_string() }),
        );
        Ok(())
    }
}

fn dedup(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
