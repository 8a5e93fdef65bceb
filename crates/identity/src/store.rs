//! Persistence traits for accounts, roles and groups, plus the in-memory
//! directory used by tests.
//!
//! The traits expose the eager-fetch variants the permission resolver needs
//! (`load_grants_by_username` returns the account with its roles, groups and
//! permissions in one call) so no backend is tempted into per-role round
//! trips. Group membership is bidirectional; both directions are mutated only
//! through the store's membership entry points, never independently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{AccountGrants, Group, GroupGrants, Permission, Role, User};

/// Filters and paging for the administrative account listing.
#[derive(Debug, Clone)]
pub struct UserQuery {
    /// Substring match on username or email.
    pub search: Option<String>,
    /// Direct role name.
    pub role: Option<String>,
    pub enabled: Option<bool>,
    /// Include soft-deleted accounts.
    pub show_deleted: bool,
    /// 1-based page number.
    pub page: u32,
    pub per_page: u32,
}

impl Default for UserQuery {
    fn default() -> Self {
        Self {
            search: None,
            role: None,
            enabled: None,
            show_deleted: false,
            page: 1,
            per_page: 20,
        }
    }
}

impl UserQuery {
    pub fn offset(&self) -> u32 {
        self.page.saturating_sub(1).saturating_mul(self.per_page)
    }
}

/// One page of results plus the total match count.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Account storage.
#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
    /// Insert an account with its direct role assignments.
    async fn insert_user(&self, user: &User, role_ids: &[Uuid]) -> Result<()>;

    /// Overwrite the stored account row.
    async fn update_user(&self, user: &User) -> Result<()>;

    /// Replace the account's direct role set.
    async fn replace_roles(&self, user_id: Uuid, role_ids: &[Uuid]) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>>;

    /// Lookup by username, excluding soft-deleted accounts.
    async fn find_active_by_username(&self, username: &str) -> Result<Option<User>>;

    /// Lookup by email, excluding soft-deleted accounts.
    async fn find_active_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Load a non-deleted account together with its direct roles, its group
    /// memberships and each group's roles, permissions included.
    async fn load_grants_by_username(&self, username: &str) -> Result<Option<AccountGrants>>;

    /// Direct roles for a set of accounts, batched.
    async fn roles_for_users(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Role>>>;

    /// Paginated listing, newest accounts first.
    async fn search(&self, query: &UserQuery) -> Result<Page<User>>;

    /// Ids of every enabled, non-deleted account holding the administrator
    /// role, directly or through a group.
    async fn active_admin_ids(&self) -> Result<HashSet<Uuid>>;

    /// Set the deletion timestamp on rows that are not already deleted.
    /// Returns the number of rows modified.
    async fn mark_deleted(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<u64>;

    /// Clear the deletion timestamp, only if it is currently set.
    async fn clear_deleted(&self, id: Uuid) -> Result<bool>;

    /// Set the enabled flag on non-deleted rows; missing or deleted ids are
    /// skipped. Returns the number of rows matched.
    async fn set_enabled(&self, ids: &[Uuid], enabled: bool) -> Result<u64>;

    /// Permanently remove a soft-deleted account and its memberships.
    async fn purge(&self, id: Uuid) -> Result<bool>;
}

/// Role and permission storage. Roles are shared reference data.
#[async_trait::async_trait]
pub trait RoleStore: Send + Sync {
    /// Insert a role and link its permissions.
    async fn insert_role(&self, role: &Role) -> Result<()>;

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>>;

    async fn find_roles_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Role>>;

    async fn list_roles(&self) -> Result<Vec<Role>>;

    async fn list_permissions(&self) -> Result<Vec<Permission>>;

    /// Insert a permission; inserting an existing (resource, action) pair is
    /// a no-op so catalog seeding stays idempotent.
    async fn insert_permission(&self, permission: &Permission) -> Result<()>;
}

/// Group storage, including the bidirectional membership relation.
#[async_trait::async_trait]
pub trait GroupStore: Send + Sync {
    async fn insert_group(&self, group: &Group, role_ids: &[Uuid]) -> Result<()>;

    /// Update name/description; `role_ids` of `Some` replaces the role set.
    async fn update_group(&self, group: &Group, role_ids: Option<&[Uuid]>) -> Result<()>;

    async fn delete_group(&self, id: Uuid) -> Result<bool>;

    async fn find_group(&self, id: Uuid) -> Result<Option<Group>>;

    async fn find_group_by_name(&self, name: &str) -> Result<Option<Group>>;

    async fn list_groups(&self) -> Result<Vec<Group>>;

    async fn group_roles(&self, id: Uuid) -> Result<Vec<Role>>;

    async fn group_member_ids(&self, id: Uuid) -> Result<Vec<Uuid>>;

    /// Add accounts to a group, keeping both directions of the relation
    /// consistent. Existing members are skipped; returns the number added.
    async fn add_members(&self, group_id: Uuid, user_ids: &[Uuid]) -> Result<u64>;

    /// Remove one account from a group. Returns false if it was not a member.
    async fn remove_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool>;
}

#[derive(Default)]
struct DirectoryInner {
    users: HashMap<Uuid, User>,
    user_roles: HashMap<Uuid, Vec<Uuid>>,
    // account -> group ids; the mirror of group_members.
    user_groups: HashMap<Uuid, HashSet<Uuid>>,
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    groups: HashMap<Uuid, Group>,
    group_roles: HashMap<Uuid, Vec<Uuid>>,
    // group -> member ids; the mirror of user_groups.
    group_members: HashMap<Uuid, HashSet<Uuid>>,
}

impl DirectoryInner {
    fn roles_by_ids(&self, ids: &[Uuid]) -> Vec<Role> {
        ids.iter()
            .filter_map(|id| self.roles.get(id).cloned())
            .collect()
    }

    fn direct_roles(&self, user_id: Uuid) -> Vec<Role> {
        self.user_roles
            .get(&user_id)
            .map(|ids| self.roles_by_ids(ids))
            .unwrap_or_default()
    }

    fn grants_for(&self, user: &User) -> AccountGrants {
        let roles = self.direct_roles(user.id);
        let groups = self
            .user_groups
            .get(&user.id)
            .map(|group_ids| {
                let mut memberships: Vec<GroupGrants> = group_ids
                    .iter()
                    .filter_map(|gid| self.groups.get(gid).cloned())
                    .map(|group| {
                        let roles = self
                            .group_roles
                            .get(&group.id)
                            .map(|ids| self.roles_by_ids(ids))
                            .unwrap_or_default();
                        GroupGrants { group, roles }
                    })
                    .collect();
                memberships.sort_by(|a, b| a.group.name.cmp(&b.group.name));
                memberships
            })
            .unwrap_or_default();

        AccountGrants {
            user: user.clone(),
            roles,
            groups,
        }
    }

    fn is_active_admin(&self, user: &User) -> bool {
        if !user.enabled || user.is_deleted() {
            return false;
        }
        let admin = crate::authority::ADMIN_ROLE;
        let direct = self
            .direct_roles(user.id)
            .iter()
            .any(|role| role.name == admin);
        if direct {
            return true;
        }
        self.user_groups
            .get(&user.id)
            .map(|group_ids| {
                group_ids.iter().any(|gid| {
                    self.group_roles
                        .get(gid)
                        .map(|ids| self.roles_by_ids(ids).iter().any(|r| r.name == admin))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }
}

/// In-memory directory implementing all three store traits.
///
/// Backs the lifecycle, resolver and handler tests; a single lock keeps the
/// two membership maps consistent.
pub struct MemoryDirectory {
    inner: Arc<RwLock<DirectoryInner>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(DirectoryInner::default())),
        }
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl UserStore for MemoryDirectory {
    async fn insert_user(&self, user: &User, role_ids: &[Uuid]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.user_roles.insert(user.id, role_ids.to_vec());
        inner.user_groups.entry(user.id).or_default();
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn replace_roles(&self, user_id: Uuid, role_ids: &[Uuid]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.user_roles.insert(user_id, role_ids.to_vec());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner.users.get(&id).cloned())
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.users.get(id).cloned())
            .collect())
    }

    async fn find_active_by_username(&self, username: &str) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| !u.is_deleted() && u.username == username)
            .cloned())
    }

    async fn find_active_by_email(&self, email: &str) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| !u.is_deleted() && u.email == email)
            .cloned())
    }

    async fn load_grants_by_username(&self, username: &str) -> Result<Option<AccountGrants>> {
        let inner = self.inner.read().await;
        let user = inner
            .users
            .values()
            .find(|u| !u.is_deleted() && u.username == username);
        Ok(user.map(|u| inner.grants_for(u)))
    }

    async fn roles_for_users(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Role>>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .map(|id| (*id, inner.direct_roles(*id)))
            .collect())
    }

    async fn search(&self, query: &UserQuery) -> Result<Page<User>> {
        let inner = self.inner.read().await;
        let needle = query.search.as_ref().map(|s| s.to_lowercase());

        let mut matches: Vec<&User> = inner
            .users
            .values()
            .filter(|u| {
                if !query.show_deleted && u.is_deleted() {
                    return false;
                }
                if let Some(enabled) = query.enabled {
                    if u.enabled != enabled {
                        return false;
                    }
                }
                if let Some(ref needle) = needle {
                    let hit = u.username.to_lowercase().contains(needle)
                        || u.email.to_lowercase().contains(needle);
                    if !hit {
                        return false;
                    }
                }
                if let Some(ref role) = query.role {
                    let held = inner.direct_roles(u.id).iter().any(|r| &r.name == role);
                    if !held {
                        return false;
                    }
                }
                true
            })
            .collect();

        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matches.len() as u64;
        let items = matches
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.per_page as usize)
            .cloned()
            .collect();

        Ok(Page {
            items,
            total,
            page: query.page,
            per_page: query.per_page,
        })
    }

    async fn active_admin_ids(&self) -> Result<HashSet<Uuid>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .filter(|u| inner.is_active_admin(u))
            .map(|u| u.id)
            .collect())
    }

    async fn mark_deleted(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut modified = 0;
        for id in ids {
            if let Some(user) = inner.users.get_mut(id) {
                if user.deleted_at.is_none() {
                    user.deleted_at = Some(at);
                    user.updated_at = at;
                    modified += 1;
                }
            }
        }
        Ok(modified)
    }

    async fn clear_deleted(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if let Some(user) = inner.users.get_mut(&id) {
            if user.deleted_at.is_some() {
                user.deleted_at = None;
                user.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn set_enabled(&self, ids: &[Uuid], enabled: bool) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut modified = 0;
        for id in ids {
            if let Some(user) = inner.users.get_mut(id) {
                if user.deleted_at.is_none() {
                    user.enabled = enabled;
                    user.updated_at = Utc::now();
                    modified += 1;
                }
            }
        }
        Ok(modified)
    }

    async fn purge(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let deleted = match inner.users.get(&id) {
            Some(user) if user.is_deleted() => true,
            _ => false,
        };
        if !deleted {
            return Ok(false);
        }
        inner.users.remove(&id);
        inner.user_roles.remove(&id);
        // Drop the membership from both directions.
        if let Some(group_ids) = inner.user_groups.remove(&id) {
            for gid in group_ids {
                if let Some(members) = inner.group_members.get_mut(&gid) {
                    members.remove(&id);
                }
            }
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl RoleStore for MemoryDirectory {
    async fn insert_role(&self, role: &Role) -> Result<()> {
        let mut inner = self.inner.write().await;
        for permission in &role.permissions {
            inner.permissions.insert(permission.id, permission.clone());
        }
        inner.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        let inner = self.inner.read().await;
        Ok(inner.roles.values().find(|r| r.name == name).cloned())
    }

    async fn find_roles_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Role>> {
        let inner = self.inner.read().await;
        Ok(inner.roles_by_ids(ids))
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let inner = self.inner.read().await;
        let mut roles: Vec<Role> = inner.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>> {
        let inner = self.inner.read().await;
        let mut permissions: Vec<Permission> = inner.permissions.values().cloned().collect();
        permissions.sort_by_key(|p| p.authority());
        Ok(permissions)
    }

    async fn insert_permission(&self, permission: &Permission) -> Result<()> {
        let mut inner = self.inner.write().await;
        let exists = inner
            .permissions
            .values()
            .any(|p| p.resource == permission.resource && p.action == permission.action);
        if !exists {
            inner.permissions.insert(permission.id, permission.clone());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl GroupStore for MemoryDirectory {
    async fn insert_group(&self, group: &Group, role_ids: &[Uuid]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.group_roles.insert(group.id, role_ids.to_vec());
        inner.group_members.entry(group.id).or_default();
        inner.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn update_group(&self, group: &Group, role_ids: Option<&[Uuid]>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.groups.insert(group.id, group.clone());
        if let Some(role_ids) = role_ids {
            inner.group_roles.insert(group.id, role_ids.to_vec());
        }
        Ok(())
    }

    async fn delete_group(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.groups.remove(&id).is_none() {
            return Ok(false);
        }
        inner.group_roles.remove(&id);
        if let Some(members) = inner.group_members.remove(&id) {
            for uid in members {
                if let Some(groups) = inner.user_groups.get_mut(&uid) {
                    groups.remove(&id);
                }
            }
        }
        Ok(true)
    }

    async fn find_group(&self, id: Uuid) -> Result<Option<Group>> {
        let inner = self.inner.read().await;
        Ok(inner.groups.get(&id).cloned())
    }

    async fn find_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        let inner = self.inner.read().await;
        Ok(inner.groups.values().find(|g| g.name == name).cloned())
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        let inner = self.inner.read().await;
        let mut groups: Vec<Group> = inner.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn group_roles(&self, id: Uuid) -> Result<Vec<Role>> {
        let inner = self.inner.read().await;
        Ok(inner
            .group_roles
            .get(&id)
            .map(|ids| inner.roles_by_ids(ids))
            .unwrap_or_default())
    }

    async fn group_member_ids(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let inner = self.inner.read().await;
        let mut ids: Vec<Uuid> = inner
            .group_members
            .get(&id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn add_members(&self, group_id: Uuid, user_ids: &[Uuid]) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut added = 0;
        for uid in user_ids {
            let new = inner
                .group_members
                .entry(group_id)
                .or_default()
                .insert(*uid);
            if new {
                inner.user_groups.entry(*uid).or_default().insert(group_id);
                added += 1;
            }
        }
        Ok(added)
    }

    async fn remove_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .group_members
            .get_mut(&group_id)
            .map(|members| members.remove(&user_id))
            .unwrap_or(false);
        if removed {
            if let Some(groups) = inner.user_groups.get_mut(&user_id) {
                groups.remove(&group_id);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{Action, Resource};
    use crate::model::Permission;

    fn directory() -> MemoryDirectory {
        MemoryDirectory::new()
    }

    async fn add_user(dir: &MemoryDirectory, username: &str, role_ids: &[Uuid]) -> User {
        let user = User::new(username, format!("{username}@x.com"), "hash");
        dir.insert_user(&user, role_ids).await.unwrap();
        user
    }

    #[tokio::test]
    async fn test_active_lookups_exclude_soft_deleted() {
        let dir = directory();
        let user = add_user(&dir, "alice", &[]).await;

        assert!(dir.find_active_by_username("alice").await.unwrap().is_some());

        dir.mark_deleted(&[user.id], Utc::now()).await.unwrap();
        assert!(dir.find_active_by_username("alice").await.unwrap().is_none());
        assert!(dir
            .find_active_by_email("alice@x.com")
            .await
            .unwrap()
            .is_none());

        // The username is free again; a new account may claim it.
        let replacement = add_user(&dir, "alice", &[]).await;
        let found = dir.find_active_by_username("alice").await.unwrap().unwrap();
        assert_eq!(found.id, replacement.id);
    }

    #[tokio::test]
    async fn test_grants_include_group_roles() {
        let dir = directory();

        let admin = Role::new("ADMIN")
            .with_permission(Permission::new(Resource::User, Action::Manage));
        let user_role = Role::new("USER");
        dir.insert_role(&admin).await.unwrap();
        dir.insert_role(&user_role).await.unwrap();

        let alice = add_user(&dir, "alice", &[user_role.id]).await;

        let group = Group::new("ops");
        dir.insert_group(&group, &[admin.id]).await.unwrap();
        dir.add_members(group.id, &[alice.id]).await.unwrap();

        let grants = dir
            .load_grants_by_username("alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grants.roles.len(), 1);
        assert_eq!(grants.roles[0].name, "USER");
        assert_eq!(grants.groups.len(), 1);
        assert_eq!(grants.groups[0].roles[0].name, "ADMIN");
        assert_eq!(grants.groups[0].roles[0].permissions.len(), 1);
    }

    #[tokio::test]
    async fn test_membership_stays_consistent_through_purge() {
        let dir = directory();
        let alice = add_user(&dir, "alice", &[]).await;
        let group = Group::new("ops");
        dir.insert_group(&group, &[]).await.unwrap();

        assert_eq!(dir.add_members(group.id, &[alice.id]).await.unwrap(), 1);
        // Re-adding is a no-op.
        assert_eq!(dir.add_members(group.id, &[alice.id]).await.unwrap(), 0);
        assert_eq!(dir.group_member_ids(group.id).await.unwrap(), vec![alice.id]);

        dir.mark_deleted(&[alice.id], Utc::now()).await.unwrap();
        assert!(dir.purge(alice.id).await.unwrap());
        assert!(dir.group_member_ids(group.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_refuses_active_rows() {
        let dir = directory();
        let alice = add_user(&dir, "alice", &[]).await;

        assert!(!dir.purge(alice.id).await.unwrap());
        assert!(dir.find_by_id(alice.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_admin_ids_cover_group_granted_admins() {
        let dir = directory();
        let admin_role = Role::new("ADMIN");
        dir.insert_role(&admin_role).await.unwrap();

        let direct = add_user(&dir, "root", &[admin_role.id]).await;
        let via_group = add_user(&dir, "ops-lead", &[]).await;
        let mut disabled = User::new("off", "off@x.com", "hash");
        disabled.enabled = false;
        dir.insert_user(&disabled, &[admin_role.id]).await.unwrap();

        let group = Group::new("admins");
        dir.insert_group(&group, &[admin_role.id]).await.unwrap();
        dir.add_members(group.id, &[via_group.id]).await.unwrap();

        let admins = dir.active_admin_ids().await.unwrap();
        assert!(admins.contains(&direct.id));
        assert!(admins.contains(&via_group.id));
        // Disabled accounts do not count toward the admin population.
        assert!(!admins.contains(&disabled.id));
    }

    #[tokio::test]
    async fn test_set_enabled_skips_deleted_and_missing() {
        let dir = directory();
        let alice = add_user(&dir, "alice", &[]).await;
        let bob = add_user(&dir, "bob", &[]).await;
        dir.mark_deleted(&[bob.id], Utc::now()).await.unwrap();

        let modified = dir
            .set_enabled(&[alice.id, bob.id, Uuid::new_v4()], false)
            .await
            .unwrap();
        assert_eq!(modified, 1);
        assert!(!dir.find_by_id(alice.id).await.unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_search_filters_and_pagination() {
        let dir = directory();
        let role = Role::new("USER");
        dir.insert_role(&role).await.unwrap();

        for i in 0..5 {
            let mut user = User::new(format!("user{i}"), format!("user{i}@x.com"), "hash");
            // Spread creation times so ordering is deterministic.
            user.created_at = Utc::now() - chrono::Duration::seconds(i);
            dir.insert_user(&user, &[role.id]).await.unwrap();
        }
        let mut ghost = User::new("ghost", "ghost@x.com", "hash");
        ghost.deleted_at = Some(Utc::now());
        dir.insert_user(&ghost, &[]).await.unwrap();

        let page = dir
            .search(&UserQuery {
                per_page: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].username, "user0");

        let page2 = dir
            .search(&UserQuery {
                page: 3,
                per_page: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page2.items.len(), 1);

        let with_deleted = dir
            .search(&UserQuery {
                show_deleted: true,
                per_page: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(with_deleted.total, 6);

        let by_search = dir
            .search(&UserQuery {
                search: Some("USER3".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_search.total, 1);
        assert_eq!(by_search.items[0].username, "user3");

        let by_role = dir
            .search(&UserQuery {
                role: Some("USER".to_string()),
                per_page: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_role.total, 5);
    }

    #[tokio::test]
    async fn test_permission_seeding_is_idempotent() {
        let dir = directory();
        let permission = Permission::new(Resource::User, Action::Read);
        dir.insert_permission(&permission).await.unwrap();
        dir.insert_permission(&Permission::new(Resource::User, Action::Read))
            .await
            .unwrap();

        assert_eq!(dir.list_permissions().await.unwrap().len(), 1);
    }
}
