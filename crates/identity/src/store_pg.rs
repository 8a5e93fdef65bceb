//! PostgreSQL directory backing the account, role and group stores.
//!
//! Uniqueness of username/email among non-deleted accounts is enforced by
//! partial unique indexes (`WHERE deleted_at IS NULL`); lifecycle updates
//! scope their `WHERE` clauses the same way so a raced statement matches
//! zero rows instead of resurrecting or double-deleting.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::authority::{Action, Resource, ADMIN_ROLE};
use crate::model::{AccountGrants, Group, GroupGrants, Permission, Role, User};
use crate::store::{GroupStore, Page, RoleStore, UserQuery, UserStore};

/// PostgreSQL-backed implementation of the directory stores.
pub struct PostgresDirectory {
    pool: PgPool,
}

impl PostgresDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = "id, username, email, password_hash, enabled, \
     account_expired, account_locked, credentials_expired, \
     deleted_at, created_at, updated_at";

/// Database row for accounts.
#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    email: String,
    password_hash: String,
    enabled: bool,
    account_expired: bool,
    account_locked: bool,
    credentials_expired: bool,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    fn into_user(self) -> User {
        User {
            id: self.id,
            username: self.username,
            email: self.email,
            password_hash: self.password_hash,
            enabled: self.enabled,
            account_expired: self.account_expired,
            account_locked: self.account_locked,
            credentials_expired: self.credentials_expired,
            deleted_at: self.deleted_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// One row of a roles-with-permissions join. Permission columns are null
/// for roles without any.
#[derive(Debug, sqlx::FromRow)]
struct RolePermissionRow {
    role_id: Uuid,
    role_name: String,
    role_description: Option<String>,
    permission_id: Option<Uuid>,
    resource: Option<String>,
    action: Option<String>,
    permission_description: Option<String>,
}

/// One row of the group-grants join for a single account. Role and
/// permission columns are null for groups without roles.
#[derive(Debug, sqlx::FromRow)]
struct GroupRoleRow {
    group_id: Uuid,
    group_name: String,
    group_description: Option<String>,
    role_id: Option<Uuid>,
    role_name: Option<String>,
    role_description: Option<String>,
    permission_id: Option<Uuid>,
    resource: Option<String>,
    action: Option<String>,
    permission_description: Option<String>,
}

fn parse_permission(
    id: Uuid,
    resource: &str,
    action: &str,
    description: Option<String>,
) -> Option<Permission> {
    let resource = match Resource::parse(resource) {
        Some(r) => r,
        None => {
            tracing::warn!(resource, "Skipping permission with unknown resource");
            return None;
        }
    };
    let action = match Action::parse(action) {
        Some(a) => a,
        None => {
            tracing::warn!(action, "Skipping permission with unknown action");
            return None;
        }
    };
    Some(Permission {
        id,
        resource,
        action,
        description,
    })
}

/// Fold a roles-with-permissions join back into `Role` values, preserving
/// the row order of first appearance.
fn fold_roles(rows: Vec<RolePermissionRow>) -> Vec<Role> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut by_id: HashMap<Uuid, Role> = HashMap::new();

    for row in rows {
        let role = by_id.entry(row.role_id).or_insert_with(|| {
            order.push(row.role_id);
            Role {
                id: row.role_id,
                name: row.role_name.clone(),
                description: row.role_description.clone(),
                permissions: Vec::new(),
            }
        });
        if let (Some(id), Some(resource), Some(action)) =
            (row.permission_id, row.resource, row.action)
        {
            if let Some(permission) =
                parse_permission(id, &resource, &action, row.permission_description)
            {
                role.permissions.push(permission);
            }
        }
    }

    order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
}

/// Fold the group-grants join into per-group memberships.
fn fold_group_grants(rows: Vec<GroupRoleRow>) -> Vec<GroupGrants> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut by_id: HashMap<Uuid, GroupGrants> = HashMap::new();

    for row in rows {
        let grants = by_id.entry(row.group_id).or_insert_with(|| {
            order.push(row.group_id);
            GroupGrants {
                group: Group {
                    id: row.group_id,
                    name: row.group_name.clone(),
                    description: row.group_description.clone(),
                },
                roles: Vec::new(),
            }
        });
        let (role_id, role_name) = match (row.role_id, row.role_name) {
            (Some(id), Some(name)) => (id, name),
            _ => continue,
        };
        let role = match grants.roles.iter_mut().find(|r| r.id == role_id) {
            Some(role) => role,
            None => {
                grants.roles.push(Role {
                    id: role_id,
                    name: role_name,
                    description: row.role_description.clone(),
                    permissions: Vec::new(),
                });
                grants.roles.last_mut().unwrap()
            }
        };
        if let (Some(id), Some(resource), Some(action)) =
            (row.permission_id, row.resource, row.action)
        {
            if let Some(permission) =
                parse_permission(id, &resource, &action, row.permission_description)
            {
                role.permissions.push(permission);
            }
        }
    }

    order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
}

/// Build the WHERE clause for the account listing. Returns the SQL fragment
/// and the number of `$n` parameters it expects, in bind order: search
/// pattern, enabled, role name.
fn user_filter_sql(query: &UserQuery) -> (String, u32) {
    let mut sql = String::from(" FROM users WHERE 1=1");
    let mut param_count = 0;

    if !query.show_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    if query.search.is_some() {
        param_count += 1;
        sql.push_str(&format!(
            " AND (username ILIKE ${0} OR email ILIKE ${0})",
            param_count
        ));
    }
    if query.enabled.is_some() {
        param_count += 1;
        sql.push_str(&format!(" AND enabled = ${}", param_count));
    }
    if query.role.is_some() {
        param_count += 1;
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM user_roles ur \
             JOIN roles r ON r.id = ur.role_id \
             WHERE ur.user_id = users.id AND r.name = ${})",
            param_count
        ));
    }

    (sql, param_count)
}

#[async_trait::async_trait]
impl UserStore for PostgresDirectory {
    async fn insert_user(&self, user: &User, role_ids: &[Uuid]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO users (
                id, username, email, password_hash, enabled,
                account_expired, account_locked, credentials_expired,
                deleted_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.enabled)
        .bind(user.account_expired)
        .bind(user.account_locked)
        .bind(user.credentials_expired)
        .bind(user.deleted_at)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *tx)
        .await?;

        if !role_ids.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO user_roles (user_id, role_id)
                SELECT $1, unnest($2::uuid[])
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(user.id)
            .bind(role_ids.to_vec())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users SET
                username = $2, email = $3, password_hash = $4, enabled = $5,
                account_expired = $6, account_locked = $7,
                credentials_expired = $8, deleted_at = $9, updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.enabled)
        .bind(user.account_expired)
        .bind(user.account_locked)
        .bind(user.credentials_expired)
        .bind(user.deleted_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_roles(&self, user_id: Uuid, role_ids: &[Uuid]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM user_roles WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        if !role_ids.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO user_roles (user_id, role_id)
                SELECT $1, unnest($2::uuid[])
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(user_id)
            .bind(role_ids.to_vec())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(UserRow::into_user))
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>> {
        let rows: Vec<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ANY($1)"))
                .bind(ids.to_vec())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(UserRow::into_user).collect())
    }

    async fn find_active_by_username(&self, username: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 AND deleted_at IS NULL"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRow::into_user))
    }

    async fn find_active_by_email(&self, email: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND deleted_at IS NULL"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRow::into_user))
    }

    async fn load_grants_by_username(&self, username: &str) -> Result<Option<AccountGrants>> {
        let user = match self.find_active_by_username(username).await? {
            Some(user) => user,
            None => return Ok(None),
        };

        // Fixed number of queries per login: account, direct roles, groups.
        let role_rows: Vec<RolePermissionRow> = sqlx::query_as(
            r#"
            SELECT r.id AS role_id, r.name AS role_name,
                   r.description AS role_description,
                   p.id AS permission_id, p.resource, p.action,
                   p.description AS permission_description
            FROM user_roles ur
            JOIN roles r ON r.id = ur.role_id
            LEFT JOIN role_permissions rp ON rp.role_id = r.id
            LEFT JOIN permissions p ON p.id = rp.permission_id
            WHERE ur.user_id = $1
            ORDER BY r.name
            "#,
        )
        .bind(user.id)
        .fetch_all(&self.pool)
        .await?;

        let group_rows: Vec<GroupRoleRow> = sqlx::query_as(
            r#"
            SELECT g.id AS group_id, g.name AS group_name,
                   g.description AS group_description,
                   r.id AS role_id, r.name AS role_name,
                   r.description AS role_description,
                   p.id AS permission_id, p.resource, p.action,
                   p.description AS permission_description
            FROM group_members gm
            JOIN groups g ON g.id = gm.group_id
            LEFT JOIN group_roles gr ON gr.group_id = g.id
            LEFT JOIN roles r ON r.id = gr.role_id
            LEFT JOIN role_permissions rp ON rp.role_id = r.id
            LEFT JOIN permissions p ON p.id = rp.permission_id
            WHERE gm.user_id = $1
            ORDER BY g.name, r.name
            "#,
        )
        .bind(user.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(AccountGrants {
            user,
            roles: fold_roles(role_rows),
            groups: fold_group_grants(group_rows),
        }))
    }

    async fn roles_for_users(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Role>>> {
        #[derive(Debug, sqlx::FromRow)]
        struct UserRolePermissionRow {
            user_id: Uuid,
            role_id: Uuid,
            role_name: String,
            role_description: Option<String>,
            permission_id: Option<Uuid>,
            resource: Option<String>,
            action: Option<String>,
            permission_description: Option<String>,
        }

        let rows: Vec<UserRolePermissionRow> = sqlx::query_as(
            r#"
            SELECT ur.user_id, r.id AS role_id, r.name AS role_name,
                   r.description AS role_description,
                   p.id AS permission_id, p.resource, p.action,
                   p.description AS permission_description
            FROM user_roles ur
            JOIN roles r ON r.id = ur.role_id
            LEFT JOIN role_permissions rp ON rp.role_id = r.id
            LEFT JOIN permissions p ON p.id = rp.permission_id
            WHERE ur.user_id = ANY($1)
            ORDER BY ur.user_id, r.name
            "#,
        )
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<Uuid, Vec<RolePermissionRow>> = HashMap::new();
        for row in rows {
            grouped.entry(row.user_id).or_default().push(RolePermissionRow {
                role_id: row.role_id,
                role_name: row.role_name,
                role_description: row.role_description,
                permission_id: row.permission_id,
                resource: row.resource,
                action: row.action,
                permission_description: row.permission_description,
            });
        }

        let mut result: HashMap<Uuid, Vec<Role>> = grouped
            .into_iter()
            .map(|(user_id, rows)| (user_id, fold_roles(rows)))
            .collect();
        for id in ids {
            result.entry(*id).or_default();
        }
        Ok(result)
    }

    async fn search(&self, query: &UserQuery) -> Result<Page<User>> {
        let (filter, mut param_count) = user_filter_sql(query);
        let pattern = query.search.as_ref().map(|s| format!("%{s}%"));

        let count_sql = format!("SELECT COUNT(*){filter}");
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        if let Some(ref pattern) = pattern {
            count_query = count_query.bind(pattern);
        }
        if let Some(enabled) = query.enabled {
            count_query = count_query.bind(enabled);
        }
        if let Some(ref role) = query.role {
            count_query = count_query.bind(role);
        }
        let (total,) = count_query.fetch_one(&self.pool).await?;

        let page_sql = format!(
            "SELECT {USER_COLUMNS}{filter} ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
            param_count + 1,
            param_count + 2
        );
        param_count += 2;
        let _ = param_count;

        let mut page_query = sqlx::query_as::<_, UserRow>(&page_sql);
        if let Some(ref pattern) = pattern {
            page_query = page_query.bind(pattern);
        }
        if let Some(enabled) = query.enabled {
            page_query = page_query.bind(enabled);
        }
        if let Some(ref role) = query.role {
            page_query = page_query.bind(role);
        }
        let rows = page_query
            .bind(query.per_page as i64)
            .bind(query.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            items: rows.into_iter().map(UserRow::into_user).collect(),
            total: total as u64,
            page: query.page,
            per_page: query.per_page,
        })
    }

    async fn active_admin_ids(&self) -> Result<HashSet<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT u.id
            FROM users u
            WHERE u.enabled = TRUE
              AND u.deleted_at IS NULL
              AND (
                EXISTS (
                    SELECT 1 FROM user_roles ur
                    JOIN roles r ON r.id = ur.role_id
                    WHERE ur.user_id = u.id AND r.name = $1
                )
                OR EXISTS (
                    SELECT 1 FROM group_members gm
                    JOIN group_roles gr ON gr.group_id = gm.group_id
                    JOIN roles r ON r.id = gr.role_id
                    WHERE gm.user_id = u.id AND r.name = $1
                )
              )
            "#,
        )
        .bind(ADMIN_ROLE)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn mark_deleted(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE users SET deleted_at = $1, updated_at = $1
            WHERE id = ANY($2) AND deleted_at IS NULL
            "#,
        )
        .bind(at)
        .bind(ids.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_deleted(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users SET deleted_at = NULL, updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NOT NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_enabled(&self, ids: &[Uuid], enabled: bool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE users SET enabled = $1, updated_at = NOW()
            WHERE id = ANY($2) AND deleted_at IS NULL
            "#,
        )
        .bind(enabled)
        .bind(ids.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge(&self, id: Uuid) -> Result<bool> {
        // Memberships and role links go with the row via FK cascade.
        let result = sqlx::query("DELETE FROM users WHERE id = $1 AND deleted_at IS NOT NULL")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl RoleStore for PostgresDirectory {
    async fn insert_role(&self, role: &Role) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO roles (id, name, description) VALUES ($1, $2, $3)")
            .bind(role.id)
            .bind(&role.name)
            .bind(&role.description)
            .execute(&mut *tx)
            .await?;

        for permission in &role.permissions {
            // Reuse the existing permission row when the pair is already
            // in the catalog; the no-op update makes RETURNING yield its id.
            let (permission_id,): (Uuid,) = sqlx::query_as(
                r#"
                INSERT INTO permissions (id, resource, action, description)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (resource, action) DO UPDATE SET resource = EXCLUDED.resource
                RETURNING id
                "#,
            )
            .bind(permission.id)
            .bind(permission.resource.as_str())
            .bind(permission.action.as_str())
            .bind(&permission.description)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO role_permissions (role_id, permission_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(role.id)
            .bind(permission_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        let rows: Vec<RolePermissionRow> = sqlx::query_as(
            r#"
            SELECT r.id AS role_id, r.name AS role_name,
                   r.description AS role_description,
                   p.id AS permission_id, p.resource, p.action,
                   p.description AS permission_description
            FROM roles r
            LEFT JOIN role_permissions rp ON rp.role_id = r.id
            LEFT JOIN permissions p ON p.id = rp.permission_id
            WHERE r.name = $1
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(fold_roles(rows).into_iter().next())
    }

    async fn find_roles_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Role>> {
        let rows: Vec<RolePermissionRow> = sqlx::query_as(
            r#"
            SELECT r.id AS role_id, r.name AS role_name,
                   r.description AS role_description,
                   p.id AS permission_id, p.resource, p.action,
                   p.description AS permission_description
            FROM roles r
            LEFT JOIN role_permissions rp ON rp.role_id = r.id
            LEFT JOIN permissions p ON p.id = rp.permission_id
            WHERE r.id = ANY($1)
            ORDER BY r.name
            "#,
        )
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        Ok(fold_roles(rows))
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let rows: Vec<RolePermissionRow> = sqlx::query_as(
            r#"
            SELECT r.id AS role_id, r.name AS role_name,
                   r.description AS role_description,
                   p.id AS permission_id, p.resource, p.action,
                   p.description AS permission_description
            FROM roles r
            LEFT JOIN role_permissions rp ON rp.role_id = r.id
            LEFT JOIN permissions p ON p.id = rp.permission_id
            ORDER BY r.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(fold_roles(rows))
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>> {
        #[derive(Debug, sqlx::FromRow)]
        struct PermissionRow {
            id: Uuid,
            resource: String,
            action: String,
            description: Option<String>,
        }

        let rows: Vec<PermissionRow> = sqlx::query_as(
            "SELECT id, resource, action, description FROM permissions ORDER BY resource, action",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| parse_permission(row.id, &row.resource, &row.action, row.description))
            .collect())
    }

    async fn insert_permission(&self, permission: &Permission) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO permissions (id, resource, action, description)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (resource, action) DO NOTHING
            "#,
        )
        .bind(permission.id)
        .bind(permission.resource.as_str())
        .bind(permission.action.as_str())
        .bind(&permission.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl GroupStore for PostgresDirectory {
    async fn insert_group(&self, group: &Group, role_ids: &[Uuid]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO groups (id, name, description) VALUES ($1, $2, $3)")
            .bind(group.id)
            .bind(&group.name)
            .bind(&group.description)
            .execute(&mut *tx)
            .await?;

        if !role_ids.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO group_roles (group_id, role_id)
                SELECT $1, unnest($2::uuid[])
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(group.id)
            .bind(role_ids.to_vec())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_group(&self, group: &Group, role_ids: Option<&[Uuid]>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE groups SET name = $2, description = $3 WHERE id = $1")
            .bind(group.id)
            .bind(&group.name)
            .bind(&group.description)
            .execute(&mut *tx)
            .await?;

        if let Some(role_ids) = role_ids {
            sqlx::query("DELETE FROM group_roles WHERE group_id = $1")
                .bind(group.id)
                .execute(&mut *tx)
                .await?;
            if !role_ids.is_empty() {
                sqlx::query(
                    r#"
                    INSERT INTO group_roles (group_id, role_id)
                    SELECT $1, unnest($2::uuid[])
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(group.id)
                .bind(role_ids.to_vec())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_group(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_group(&self, id: Uuid) -> Result<Option<Group>> {
        let row: Option<(Uuid, String, Option<String>)> =
            sqlx::query_as("SELECT id, name, description FROM groups WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, name, description)| Group {
            id,
            name,
            description,
        }))
    }

    async fn find_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        let row: Option<(Uuid, String, Option<String>)> =
            sqlx::query_as("SELECT id, name, description FROM groups WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, name, description)| Group {
            id,
            name,
            description,
        }))
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        let rows: Vec<(Uuid, String, Option<String>)> =
            sqlx::query_as("SELECT id, name, description FROM groups ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, description)| Group {
                id,
                name,
                description,
            })
            .collect())
    }

    async fn group_roles(&self, id: Uuid) -> Result<Vec<Role>> {
        let rows: Vec<RolePermissionRow> = sqlx::query_as(
            r#"
            SELECT r.id AS role_id, r.name AS role_name,
                   r.description AS role_description,
                   p.id AS permission_id, p.resource, p.action,
                   p.description AS permission_description
            FROM group_roles gr
            JOIN roles r ON r.id = gr.role_id
            LEFT JOIN role_permissions rp ON rp.role_id = r.id
            LEFT JOIN permissions p ON p.id = rp.permission_id
            WHERE gr.group_id = $1
            ORDER BY r.name
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(fold_roles(rows))
    }

    async fn group_member_ids(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM group_members WHERE group_id = $1 ORDER BY user_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn add_members(&self, group_id: Uuid, user_ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO group_members (group_id, user_id)
            SELECT $1, unnest($2::uuid[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(group_id)
        .bind(user_ids.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn remove_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND user_id = $2")
                .bind(group_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role_row(
        role_id: Uuid,
        name: &str,
        permission: Option<(Uuid, &str, &str)>,
    ) -> RolePermissionRow {
        RolePermissionRow {
            role_id,
            role_name: name.to_string(),
            role_description: None,
            permission_id: permission.map(|(id, _, _)| id),
            resource: permission.map(|(_, r, _)| r.to_string()),
            action: permission.map(|(_, _, a)| a.to_string()),
            permission_description: None,
        }
    }

    #[test]
    fn test_fold_roles_groups_permissions() {
        let admin_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let rows = vec![
            role_row(admin_id, "ADMIN", Some((Uuid::new_v4(), "USER", "MANAGE"))),
            role_row(admin_id, "ADMIN", Some((Uuid::new_v4(), "USER", "READ"))),
            role_row(user_id, "USER", None),
        ];

        let roles = fold_roles(rows);
        assert_eq!(roles.len(), 2);
        assert_eq!(roles[0].name, "ADMIN");
        assert_eq!(roles[0].permissions.len(), 2);
        assert_eq!(roles[1].name, "USER");
        assert!(roles[1].permissions.is_empty());
    }

    #[test]
    fn test_fold_roles_skips_unknown_catalog_entries() {
        let role_id = Uuid::new_v4();
        let rows = vec![
            role_row(role_id, "ADMIN", Some((Uuid::new_v4(), "WIDGET", "FROB"))),
            role_row(role_id, "ADMIN", Some((Uuid::new_v4(), "USER", "READ"))),
        ];

        let roles = fold_roles(rows);
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].permissions.len(), 1);
        assert_eq!(roles[0].permissions[0].authority(), "USER_READ");
    }

    #[test]
    fn test_fold_group_grants_handles_roleless_groups() {
        let with_role = Uuid::new_v4();
        let without_role = Uuid::new_v4();
        let role_id = Uuid::new_v4();
        let rows = vec![
            GroupRoleRow {
                group_id: with_role,
                group_name: "admins".to_string(),
                group_description: None,
                role_id: Some(role_id),
                role_name: Some("ADMIN".to_string()),
                role_description: None,
                permission_id: Some(Uuid::new_v4()),
                resource: Some("USER".to_string()),
                action: Some("MANAGE".to_string()),
                permission_description: None,
            },
            GroupRoleRow {
                group_id: without_role,
                group_name: "everyone".to_string(),
                group_description: None,
                role_id: None,
                role_name: None,
                role_description: None,
                permission_id: None,
                resource: None,
                action: None,
                permission_description: None,
            },
        ];

        let grants = fold_group_grants(rows);
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].group.name, "admins");
        assert_eq!(grants[0].roles.len(), 1);
        assert_eq!(grants[0].roles[0].permissions[0].authority(), "USER_MANAGE");
        assert_eq!(grants[1].group.name, "everyone");
        assert!(grants[1].roles.is_empty());
    }

    #[test]
    fn test_user_filter_sql_shapes() {
        let (sql, params) = user_filter_sql(&UserQuery::default());
        assert!(sql.contains("deleted_at IS NULL"));
        assert_eq!(params, 0);

        let (sql, params) = user_filter_sql(&UserQuery {
            search: Some("ali".to_string()),
            role: Some("ADMIN".to_string()),
            enabled: Some(true),
            show_deleted: true,
            ..Default::default()
        });
        assert!(!sql.contains("deleted_at IS NULL"));
        assert!(sql.contains("username ILIKE $1 OR email ILIKE $1"));
        assert!(sql.contains("enabled = $2"));
        assert!(sql.contains("r.name = $3"));
        assert_eq!(params, 3);
    }
}
