//! Integration tests for the identity service stack.
//!
//! These drive the seeded directory, account lifecycle, group grants and
//! audit trail together over the in-memory stores, the same wiring the
//! server builds minus the HTTP layer.

use std::sync::Arc;
use std::time::Duration;

use api_server::seed_identity;
use identity::audit::MemoryAuditStorage;
use identity::authority::{authorities, Action, Resource, ADMIN_ROLE, DEFAULT_ROLE};
use identity::password::verify_password;
use identity::{
    AccountLifecycle, AccountUpdate, Actor, AuditAction, AuditLogger, AuditQuery, AuditStorage,
    GroupManager, GroupStore, IdentityError, JwtAuth, JwtConfig, MemoryDirectory, NewAccount,
    Principal, RoleStore, UserQuery, UserStore,
};

struct Stack {
    users: Arc<dyn UserStore>,
    roles: Arc<dyn RoleStore>,
    lifecycle: AccountLifecycle,
    groups: GroupManager,
    audit_storage: Arc<MemoryAuditStorage>,
    jwt: JwtAuth,
}

/// Build the service stack over in-memory stores and run startup seeding.
/// No ADMIN_* variables are set in the test environment, so seeding
/// provisions the catalog and built-in roles but no account.
async fn stack() -> Stack {
    let directory = Arc::new(MemoryDirectory::new());
    let users: Arc<dyn UserStore> = directory.clone();
    let roles: Arc<dyn RoleStore> = directory.clone();
    let group_store: Arc<dyn GroupStore> = directory;

    let audit_storage = Arc::new(MemoryAuditStorage::new());
    let audit = Arc::new(AuditLogger::new(audit_storage.clone()));

    seed_identity(&users, &roles).await.unwrap();

    let lifecycle = AccountLifecycle::new(users.clone(), roles.clone(), audit.clone());
    let groups = GroupManager::new(users.clone(), group_store, roles.clone(), audit);
    let jwt = JwtAuth::new(JwtConfig {
        secret: "integration-test-secret".to_string(),
        ..JwtConfig::default()
    });

    Stack {
        users,
        roles,
        lifecycle,
        groups,
        audit_storage,
        jwt,
    }
}

async fn create_admin(stack: &Stack, username: &str) -> identity::User {
    let admin_role = stack
        .roles
        .find_role_by_name(ADMIN_ROLE)
        .await
        .unwrap()
        .unwrap();
    stack
        .lifecycle
        .create(
            &Actor::system(),
            NewAccount {
                username: username.to_string(),
                email: format!("{username}@example.com"),
                password: "admin-password".to_string(),
                role_ids: Some(vec![admin_role.id]),
            },
        )
        .await
        .unwrap()
}

/// Wait for the fire-and-forget audit channel to drain.
async fn flush_audit() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Startup seeding provisions the full permission catalog and both
/// built-in roles, and stays stable across re-runs.
#[tokio::test]
async fn test_seeded_catalog_and_roles() {
    let stack = stack().await;

    let permissions = stack.roles.list_permissions().await.unwrap();
    assert_eq!(permissions.len(), Resource::ALL.len() * Action::ALL.len());

    let admin = stack
        .roles
        .find_role_by_name(ADMIN_ROLE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(admin.permissions.len(), permissions.len());

    let user = stack
        .roles
        .find_role_by_name(DEFAULT_ROLE)
        .await
        .unwrap()
        .unwrap();
    assert!(user.permissions.is_empty());
}

/// Self-registration lands on the default role, the credentials verify,
/// and the issued access token carries the resolved authorities. After a
/// role change, re-deriving grants (the refresh path) picks up the new
/// authorities while the old token still carries the stale set.
#[tokio::test]
async fn test_register_login_refresh_flow() {
    let stack = stack().await;

    let registered = stack
        .lifecycle
        .register(
            Some("198.51.100.4".parse().unwrap()),
            NewAccount {
                username: "alice".to_string(),
                email: "alice@example.com".to_string(),
                password: "correct-horse".to_string(),
                role_ids: None,
            },
        )
        .await
        .unwrap();

    // Login path: load grants, verify the password, check usability.
    let grants = stack
        .users
        .load_grants_by_username("alice")
        .await
        .unwrap()
        .unwrap();
    let principal = Principal::from_grants(grants);
    assert!(verify_password("correct-horse", &principal.user().password_hash));
    assert!(!verify_password("wrong", &principal.user().password_hash));
    assert!(principal.can_authenticate());
    assert_eq!(principal.direct_roles().len(), 1);
    assert_eq!(principal.direct_roles()[0].name, DEFAULT_ROLE);

    let token = stack
        .jwt
        .issue_access_token(principal.username(), principal.authorities_vec())
        .unwrap();
    let claims = stack.jwt.decode(&token).unwrap();
    assert_eq!(claims.sub, "alice");
    // The default role contributes its membership marker and nothing else.
    assert_eq!(claims.authorities, vec!["ROLE_USER".to_string()]);

    // Grant the admin role, then re-derive as the refresh endpoint does.
    let admin_role = stack
        .roles
        .find_role_by_name(ADMIN_ROLE)
        .await
        .unwrap()
        .unwrap();
    stack
        .lifecycle
        .update(
            &Actor::system(),
            registered.id,
            AccountUpdate {
                role_ids: Some(vec![admin_role.id]),
                ..AccountUpdate::default()
            },
        )
        .await
        .unwrap();

    let grants = stack
        .users
        .load_grants_by_username("alice")
        .await
        .unwrap()
        .unwrap();
    let refreshed = Principal::from_grants(grants);
    assert!(refreshed.has_authority(authorities::USER_DELETE));

    let new_token = stack
        .jwt
        .issue_access_token(refreshed.username(), refreshed.authorities_vec())
        .unwrap();
    let new_claims = stack.jwt.decode(&new_token).unwrap();
    assert!(new_claims.has_authority(authorities::USER_DELETE));
    // The token issued before the role change still carries the old set.
    let stale_claims = stack.jwt.decode(&token).unwrap();
    assert!(!stale_claims.has_authority(authorities::USER_DELETE));

    flush_audit().await;
    let events = stack
        .audit_storage
        .query(&AuditQuery::new().action(AuditAction::UserRegistered))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].actor_name, "alice");
    assert_eq!(
        events[0].ip_address,
        Some("198.51.100.4".parse().unwrap())
    );
}

/// A disabled account keeps valid credentials but cannot authenticate.
#[tokio::test]
async fn test_disabled_account_cannot_authenticate() {
    let stack = stack().await;
    let admin = create_admin(&stack, "root").await;

    let user = stack
        .lifecycle
        .register(
            None,
            NewAccount {
                username: "mallory".to_string(),
                email: "mallory@example.com".to_string(),
                password: "valid-password".to_string(),
                role_ids: None,
            },
        )
        .await
        .unwrap();

    stack
        .lifecycle
        .set_enabled_bulk(&Actor::account(admin.id, "root"), &[user.id], false)
        .await
        .unwrap();

    let grants = stack
        .users
        .load_grants_by_username("mallory")
        .await
        .unwrap()
        .unwrap();
    let principal = Principal::from_grants(grants);
    assert!(verify_password("valid-password", &principal.user().password_hash));
    assert!(!principal.can_authenticate());
}

/// Soft delete hides the account from active lookups; restore brings it
/// back intact; purge removes a deleted account for good. Every step
/// lands in the audit trail.
#[tokio::test]
async fn test_delete_restore_purge_flow() {
    let stack = stack().await;
    let admin = create_admin(&stack, "root").await;
    let actor = Actor::account(admin.id, "root").with_ip("10.1.1.1".parse().unwrap());

    let bob = stack
        .lifecycle
        .create(
            &actor,
            NewAccount {
                username: "bob".to_string(),
                email: "bob@example.com".to_string(),
                password: "bob-password".to_string(),
                role_ids: None,
            },
        )
        .await
        .unwrap();

    stack.lifecycle.soft_delete(&actor, bob.id).await.unwrap();

    // Hidden from active lookups, visible by id and in show_deleted lists.
    assert!(stack
        .users
        .find_active_by_username("bob")
        .await
        .unwrap()
        .is_none());
    let deleted = stack.lifecycle.get(bob.id).await.unwrap();
    assert!(deleted.deleted_at.is_some());

    let active_page = stack
        .lifecycle
        .list(&UserQuery::default())
        .await
        .unwrap();
    assert!(active_page.items.iter().all(|u| u.id != bob.id));
    let all_page = stack
        .lifecycle
        .list(&UserQuery {
            show_deleted: true,
            ..UserQuery::default()
        })
        .await
        .unwrap();
    assert!(all_page.items.iter().any(|u| u.id == bob.id));

    // Deleting again fails; restoring brings the account back.
    let err = stack.lifecycle.soft_delete(&actor, bob.id).await.unwrap_err();
    assert!(matches!(err, IdentityError::NotFound(_)));

    let restored = stack.lifecycle.restore(&actor, bob.id).await.unwrap();
    assert!(restored.deleted_at.is_none());
    assert!(stack
        .users
        .find_active_by_username("bob")
        .await
        .unwrap()
        .is_some());

    // Purge requires a prior soft delete.
    let err = stack.lifecycle.purge(&actor, bob.id).await.unwrap_err();
    assert!(matches!(err, IdentityError::NotFound(_)));
    stack.lifecycle.soft_delete(&actor, bob.id).await.unwrap();
    stack.lifecycle.purge(&actor, bob.id).await.unwrap();
    let err = stack.lifecycle.get(bob.id).await.unwrap_err();
    assert!(matches!(err, IdentityError::NotFound(_)));

    flush_audit().await;
    for action in [
        AuditAction::UserCreated,
        AuditAction::UserDeleted,
        AuditAction::UserRestored,
        AuditAction::UserPurged,
    ] {
        let events = stack
            .audit_storage
            .query(&AuditQuery::new().action(action.clone()).actor("root"))
            .await
            .unwrap();
        assert!(!events.is_empty(), "missing audit entries for {action:?}");
        assert_eq!(events[0].actor_id, Some(admin.id));
        assert_eq!(events[0].ip_address, Some("10.1.1.1".parse().unwrap()));
    }
}

/// Bulk deletion is all-or-nothing and refuses to remove the whole
/// administrator set.
#[tokio::test]
async fn test_bulk_delete_protects_last_admin() {
    let stack = stack().await;
    let admin = create_admin(&stack, "root").await;
    let actor = Actor::account(admin.id, "root");

    let carol = stack
        .lifecycle
        .register(
            None,
            NewAccount {
                username: "carol".to_string(),
                email: "carol@example.com".to_string(),
                password: "carol-password".to_string(),
                role_ids: None,
            },
        )
        .await
        .unwrap();

    // Removing the only administrator is rejected, even inside a larger
    // batch, and nothing from the batch is applied.
    let err = stack
        .lifecycle
        .bulk_soft_delete(&actor, &[admin.id, carol.id])
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::InvalidState(_)));
    assert!(stack.lifecycle.get(carol.id).await.unwrap().deleted_at.is_none());

    // Unknown ids fail the whole batch.
    let err = stack
        .lifecycle
        .bulk_soft_delete(&actor, &[carol.id, uuid::Uuid::new_v4()])
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::NotFound(_)));

    // A batch that leaves an administrator standing goes through.
    let second_admin = create_admin(&stack, "root2").await;
    let deleted = stack
        .lifecycle
        .bulk_soft_delete(&actor, &[second_admin.id, carol.id])
        .await
        .unwrap();
    assert_eq!(deleted, 2);
}

/// Group roles flow into member authorities and disappear on removal.
/// A group with members cannot be deleted.
#[tokio::test]
async fn test_group_membership_grants_authorities() {
    let stack = stack().await;
    let admin = create_admin(&stack, "root").await;
    let actor = Actor::account(admin.id, "root");

    let dave = stack
        .lifecycle
        .register(
            None,
            NewAccount {
                username: "dave".to_string(),
                email: "dave@example.com".to_string(),
                password: "dave-password".to_string(),
                role_ids: None,
            },
        )
        .await
        .unwrap();

    let admin_role = stack
        .roles
        .find_role_by_name(ADMIN_ROLE)
        .await
        .unwrap()
        .unwrap();
    let detail = stack
        .groups
        .create(
            &actor,
            "operators",
            Some("On-call operators".to_string()),
            &[admin_role.id],
        )
        .await
        .unwrap();

    stack
        .groups
        .assign_members(&actor, detail.group.id, &[dave.id])
        .await
        .unwrap();

    let grants = stack
        .users
        .load_grants_by_username("dave")
        .await
        .unwrap()
        .unwrap();
    let principal = Principal::from_grants(grants);
    assert!(principal.has_authority(authorities::SYSTEM_MANAGE));
    // Group roles are not direct roles.
    assert_eq!(principal.direct_roles().len(), 1);
    assert_eq!(principal.direct_roles()[0].name, DEFAULT_ROLE);

    // Deletion is blocked while the group has members.
    let err = stack.groups.delete(&actor, detail.group.id).await.unwrap_err();
    assert!(matches!(err, IdentityError::InvalidState(_)));

    stack
        .groups
        .remove_member(&actor, detail.group.id, dave.id)
        .await
        .unwrap();

    let grants = stack
        .users
        .load_grants_by_username("dave")
        .await
        .unwrap()
        .unwrap();
    assert!(!Principal::from_grants(grants).has_authority(authorities::SYSTEM_MANAGE));

    stack.groups.delete(&actor, detail.group.id).await.unwrap();
    let err = stack.groups.get(detail.group.id).await.unwrap_err();
    assert!(matches!(err, IdentityError::NotFound(_)));
}

/// Identity collisions: live duplicates are rejected outright, a deleted
/// account's username is reusable, and the reuse then blocks the restore.
#[tokio::test]
async fn test_duplicate_identities() {
    let stack = stack().await;
    let admin = create_admin(&stack, "root").await;
    let actor = Actor::account(admin.id, "root");

    let erin = stack
        .lifecycle
        .register(
            None,
            NewAccount {
                username: "erin".to_string(),
                email: "erin@example.com".to_string(),
                password: "erin-password".to_string(),
                role_ids: None,
            },
        )
        .await
        .unwrap();

    let err = stack
        .lifecycle
        .register(
            None,
            NewAccount {
                username: "erin".to_string(),
                email: "other@example.com".to_string(),
                password: "whatever-else".to_string(),
                role_ids: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::DuplicateIdentity(_)));

    // Soft-deleting frees the username for a newcomer.
    stack.lifecycle.soft_delete(&actor, erin.id).await.unwrap();
    stack
        .lifecycle
        .register(
            None,
            NewAccount {
                username: "erin".to_string(),
                email: "erin2@example.com".to_string(),
                password: "second-erin".to_string(),
                role_ids: None,
            },
        )
        .await
        .unwrap();

    // The original can no longer come back under the taken name.
    let err = stack.lifecycle.restore(&actor, erin.id).await.unwrap_err();
    assert!(matches!(err, IdentityError::DuplicateIdentity(_)));
}
