//! Directory administration tests

use dockyard::errors::ErrorKind;
use dockyard::models::audit::AuditEventKind;
use dockyard::models::context::RequestContext;
use dockyard::models::grant::{Capability, ResourceRef};
use dockyard::models::host::{Connection, HostSpec};
use dockyard::models::user::{NewUser, Role};

use crate::support::Harness;

#[tokio::test]
async fn test_non_admin_cannot_administer() {
    let harness = Harness::new().await;
    let erin = harness.user("erin").await;

    let err = harness
        .directory
        .create_user(
            &RequestContext::api(erin.id),
            NewUser {
                username: "mallory".to_string(),
                role: Role::Admin,
                credential_hash: "x".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn test_duplicate_grant_conflicts() {
    let harness = Harness::new().await;
    let (host, _) = harness.host("edge-01").await;
    let alice = harness.user("alice").await;
    let ctx = harness.admin_ctx();

    harness
        .directory
        .grant(&ctx, alice.id, ResourceRef::host(host.id), Capability::View)
        .await
        .unwrap();
    let err = harness
        .directory
        .grant(&ctx, alice.id, ResourceRef::host(host.id), Capability::View)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(harness.events(AuditEventKind::PermissionGranted).await.len(), 1);
}

#[tokio::test]
async fn test_host_delete_cascades() {
    let harness = Harness::new().await;
    let (host, _) = harness.host("edge-01").await;
    let (_, stack) = harness.stack("web").await;
    let alice = harness.user("alice").await;
    let ctx = harness.admin_ctx();

    harness
        .directory
        .grant(&ctx, alice.id, ResourceRef::container(host.id, "web"), Capability::Manage)
        .await
        .unwrap();
    harness.deployments.deploy(&ctx, stack.id, host.id).await.unwrap();

    harness.directory.delete_host(&ctx, host.id).await.unwrap();

    assert!(harness.directory.list_grants(&ctx, Some(alice.id)).await.unwrap().is_empty());
    assert!(harness.deployments.list_deployments(&ctx, None).await.unwrap().is_empty());
    assert!(harness.directory.list_hosts(&ctx).await.unwrap().is_empty());
    assert!(!harness.manager.is_registered(host.id));

    let events = harness.events(AuditEventKind::HostDeleted).await;
    assert_eq!(events[0].detail["grants_removed"], 1);
    assert_eq!(events[0].detail["deployments_removed"], 1);
}

#[tokio::test]
async fn test_user_delete_anonymizes_history() {
    let harness = Harness::new().await;
    let (host, _) = harness.host("edge-01").await;
    let (_, stack) = harness.stack("web").await;
    let frank = harness.user("frank").await;
    let ctx = harness.admin_ctx();
    harness
        .directory
        .grant(&ctx, frank.id, ResourceRef::stack(host.id, stack.id), Capability::DeployStack)
        .await
        .unwrap();
    let deployment = harness
        .deployments
        .deploy(&RequestContext::api(frank.id), stack.id, host.id)
        .await
        .unwrap();
    assert_eq!(harness.events_by(frank.id).await.len(), 1);

    harness.directory.delete_user(&ctx, frank.id).await.unwrap();

    assert!(harness.events_by(frank.id).await.is_empty());
    let deployed = harness.events(AuditEventKind::StackDeployed).await;
    assert_eq!(deployed.len(), 1);
    assert_eq!(deployed[0].actor, None);

    let kept = harness.deployments.list_deployments(&ctx, None).await.unwrap();
    assert_eq!(kept[0].id, deployment.id);
    assert_eq!(kept[0].deployed_by, None);
}

#[tokio::test]
async fn test_last_admin_cannot_be_deleted() {
    let harness = Harness::new().await;
    let err = harness
        .directory
        .delete_user(&harness.admin_ctx(), harness.admin.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_unlink_refused_while_deployed() {
    let harness = Harness::new().await;
    let (host, _) = harness.host("edge-01").await;
    let (repository, stack) = harness.stack("web").await;
    let ctx = harness.admin_ctx();
    let deployment = harness.deployments.deploy(&ctx, stack.id, host.id).await.unwrap();
    assert!(harness.checkouts_dir.join(repository.id.to_string()).exists());

    let err = harness
        .directory
        .unlink_repository(&ctx, repository.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    harness.deployments.take_down(&ctx, deployment.id).await.unwrap();
    harness.directory.unlink_repository(&ctx, repository.id).await.unwrap();
    assert!(harness.directory.list_stacks(&ctx, None).await.unwrap().is_empty());
    assert!(!harness.checkouts_dir.join(repository.id.to_string()).exists());
}

#[tokio::test]
async fn test_stack_path_unique_per_repository() {
    let harness = Harness::new().await;
    let (repository, _) = harness.stack("web").await;

    let err = harness
        .directory
        .register_stack(
            &harness.admin_ctx(),
            dockyard::models::repository::NewStack {
                repository_id: repository.id,
                name: "web-again".to_string(),
                compose_path: "./docker-compose.yml".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_host_names_are_unique() {
    let harness = Harness::new().await;
    harness.host("edge-01").await;

    let err = harness
        .directory
        .create_host(
            &harness.admin_ctx(),
            HostSpec {
                name: "edge-01".to_string(),
                connection: Connection::Socket {
                    socket_path: "/run/docker.sock".to_string(),
                },
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_seeded_host_skipped_when_known() {
    let harness = Harness::new().await;
    let spec = HostSpec {
        name: "lab".to_string(),
        connection: Connection::Socket {
            socket_path: "/var/run/docker.sock".to_string(),
        },
    };

    let seeded = harness.directory.seed_host(spec.clone()).await.unwrap();
    assert!(seeded.is_some());
    assert!(harness.directory.seed_host(spec).await.unwrap().is_none());

    let events = harness.events(AuditEventKind::HostCreated).await;
    let from_config: Vec<_> = events
        .iter()
        .filter(|e| e.origin.source.as_deref() == Some("config"))
        .collect();
    assert_eq!(from_config.len(), 1);
    assert_eq!(from_config[0].actor, None);
}

#[tokio::test]
async fn test_concurrent_host_updates_register_committed_connection() {
    let harness = Harness::new().await;
    let (host, _) = harness.host("edge-01").await;
    let ctx = harness.admin_ctx();
    let spec = |socket_path: &str| HostSpec {
        name: "edge-01".to_string(),
        connection: Connection::Socket {
            socket_path: socket_path.to_string(),
        },
    };

    let (first, second) = tokio::join!(
        harness.directory.update_host(&ctx, host.id, spec("/run/docker-a.sock")),
        harness.directory.update_host(&ctx, host.id, spec("/run/docker-b.sock")),
    );
    first.unwrap();
    second.unwrap();

    let committed = harness
        .directory
        .list_hosts(&ctx)
        .await
        .unwrap()
        .into_iter()
        .find(|h| h.id == host.id)
        .unwrap();
    let registered = harness
        .manager
        .status()
        .into_iter()
        .find(|s| s.host_id == host.id)
        .unwrap();
    assert_eq!(registered.endpoint, committed.connection.endpoint());
    assert_eq!(harness.locks.tracked(), 0);
}
