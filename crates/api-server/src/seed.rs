//! Idempotent startup seeding: the permission catalog, the built-in
//! ADMIN and USER roles, and an initial administrator account taken
//! from the environment (for Docker/CI bootstrap).

use std::sync::Arc;

use identity::authority::{Action, Resource, ADMIN_ROLE, DEFAULT_ROLE};
use identity::password::hash_password;
use identity::{DefaultRoles, Permission, RoleStore, User, UserStore};

/// Run all seeding steps. Safe to run on every start: existing rows are
/// left untouched and the admin bootstrap is skipped once one exists.
pub async fn seed_identity(
    users: &Arc<dyn UserStore>,
    roles: &Arc<dyn RoleStore>,
) -> anyhow::Result<()> {
    seed_permissions(roles).await?;
    seed_roles(roles).await?;
    seed_admin_account(users, roles).await?;
    Ok(())
}

/// Insert the full resource/action permission catalog.
async fn seed_permissions(roles: &Arc<dyn RoleStore>) -> anyhow::Result<()> {
    for resource in Resource::ALL {
        for action in Action::ALL {
            let permission = Permission::new(resource, action).with_description(format!(
                "{} access to {} resources",
                action.as_str(),
                resource.as_str()
            ));
            roles.insert_permission(&permission).await?;
        }
    }
    Ok(())
}

/// Insert the built-in roles when missing. ADMIN carries the whole
/// catalog; USER carries no standalone permissions.
async fn seed_roles(roles: &Arc<dyn RoleStore>) -> anyhow::Result<()> {
    if roles.find_role_by_name(ADMIN_ROLE).await?.is_none() {
        roles.insert_role(&DefaultRoles::admin()).await?;
        tracing::info!(role = ADMIN_ROLE, "Seeded built-in role");
    }
    if roles.find_role_by_name(DEFAULT_ROLE).await?.is_none() {
        roles.insert_role(&DefaultRoles::user()).await?;
        tracing::info!(role = DEFAULT_ROLE, "Seeded built-in role");
    }
    Ok(())
}

/// Create the bootstrap administrator from ADMIN_USERNAME, ADMIN_EMAIL
/// and ADMIN_PASSWORD. Runs only while no enabled administrator exists.
async fn seed_admin_account(
    users: &Arc<dyn UserStore>,
    roles: &Arc<dyn RoleStore>,
) -> anyhow::Result<()> {
    if !users.active_admin_ids().await?.is_empty() {
        tracing::debug!("An administrator already exists, skipping bootstrap");
        return Ok(());
    }

    let username = std::env::var("ADMIN_USERNAME").ok();
    let email = std::env::var("ADMIN_EMAIL").ok();
    let password = std::env::var("ADMIN_PASSWORD").ok();
    let (username, email, password) = match (username, email, password) {
        (Some(username), Some(email), Some(password)) => (username, email, password),
        _ => {
            tracing::warn!(
                "No administrator exists and ADMIN_USERNAME/ADMIN_EMAIL/ADMIN_PASSWORD \
                 are not set, skipping bootstrap"
            );
            return Ok(());
        }
    };

    if username.trim().len() < 3 {
        anyhow::bail!("ADMIN_USERNAME must be at least 3 characters");
    }
    if !email.contains('@') || email.len() < 5 {
        anyhow::bail!("ADMIN_EMAIL is not a valid email address");
    }
    if password.len() < 8 {
        anyhow::bail!("ADMIN_PASSWORD must be at least 8 characters");
    }
    if users.find_active_by_username(&username).await?.is_some() {
        anyhow::bail!("ADMIN_USERNAME is already taken by a non-admin account");
    }
    if users.find_active_by_email(&email).await?.is_some() {
        anyhow::bail!("ADMIN_EMAIL is already taken by a non-admin account");
    }

    let admin_role = roles
        .find_role_by_name(ADMIN_ROLE)
        .await?
        .ok_or_else(|| anyhow::anyhow!("ADMIN role missing after role seeding"))?;

    let user = User::new(username, email, hash_password(&password)?);
    users.insert_user(&user, &[admin_role.id]).await?;

    tracing::info!(
        user_id = %user.id,
        username = %user.username,
        "Bootstrap administrator created"
    );
    Ok(())
}
