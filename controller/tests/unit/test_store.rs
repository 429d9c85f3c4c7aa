//! Store persistence tests

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tempfile::TempDir;

use dockyard::errors::{DockyardError, ErrorKind};
use dockyard::filesys::file::File;
use dockyard::models::audit::AuditEventKind;
use dockyard::models::context::RequestContext;
use dockyard::models::user::{NewUser, Role};
use dockyard::store::backend::JsonFileBackend;
use dockyard::store::Store;

use crate::support::{FlakyBackend, Harness};

fn new_user(name: &str) -> NewUser {
    NewUser {
        username: name.to_string(),
        role: Role::User,
        credential_hash: "hash".to_string(),
    }
}

#[tokio::test]
async fn test_audit_persistence_failure_rolls_back_action() {
    let backend = Arc::new(FlakyBackend::default());
    let harness = Harness::with_backend(backend.clone()).await;
    let ctx = harness.admin_ctx();

    backend.fail.store(true, Ordering::SeqCst);
    let err = harness.directory.create_user(&ctx, new_user("grace")).await.unwrap_err();
    assert!(matches!(err, DockyardError::AuditPersistence));
    assert_eq!(err.to_string(), "Operation failed");
    assert_eq!(err.kind(), ErrorKind::AuditPersistence);

    backend.fail.store(false, Ordering::SeqCst);
    let users = harness.directory.list_users(&ctx).await.unwrap();
    assert!(users.iter().all(|u| u.username != "grace"));
    assert_eq!(harness.events(AuditEventKind::UserCreated).await.len(), 1);

    // The same request succeeds once the audit log is writable again
    harness.directory.create_user(&ctx, new_user("grace")).await.unwrap();
}

#[tokio::test]
async fn test_unwritable_audit_log_keeps_docker_untouched() {
    let backend = Arc::new(FlakyBackend::default());
    let harness = Harness::with_backend(backend.clone()).await;
    let (host, docker) = harness.host("edge-01").await;
    docker.add_container("web", None);

    backend.fail.store(true, Ordering::SeqCst);
    let err = harness
        .actions
        .start_container(&harness.admin_ctx(), host.id, "web")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuditPersistence);
    assert_eq!(docker.count("start_container"), 0);

    backend.fail.store(false, Ordering::SeqCst);
    assert!(harness.events(AuditEventKind::ActionRequested).await.is_empty());
    assert!(harness.events(AuditEventKind::ContainerStarted).await.is_empty());
}

#[tokio::test]
async fn test_denial_surfaced_when_audit_log_unwritable() {
    let backend = Arc::new(FlakyBackend::default());
    let harness = Harness::with_backend(backend.clone()).await;
    let (host, docker) = harness.host("edge-01").await;
    let bob = harness.user("bob").await;

    backend.fail.store(true, Ordering::SeqCst);
    let err = harness
        .actions
        .stop_container(&RequestContext::api(bob.id), host.id, "web")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(docker.calls().is_empty());

    backend.fail.store(false, Ordering::SeqCst);
    assert!(harness.events(AuditEventKind::AccessDenied).await.is_empty());
}

#[tokio::test]
async fn test_unrecorded_deployment_is_taken_down() {
    let backend = Arc::new(FlakyBackend::default());
    let harness = Harness::with_backend(backend.clone()).await;
    let (host, docker) = harness.host("edge-01").await;
    let (_, stack) = harness.stack("monitoring").await;
    let ctx = harness.admin_ctx();

    backend.fail.store(true, Ordering::SeqCst);
    let err = harness.deployments.deploy(&ctx, stack.id, host.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuditPersistence);
    assert_eq!(docker.count("up"), 1);
    assert_eq!(docker.count("down"), 1);

    backend.fail.store(false, Ordering::SeqCst);
    assert!(harness.deployments.list_deployments(&ctx, None).await.unwrap().is_empty());
    assert!(harness.events(AuditEventKind::StackDeployed).await.is_empty());
}

#[tokio::test]
async fn test_json_store_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    let (admin_id, host_id) = {
        let harness = Harness::with_backend(Arc::new(JsonFileBackend::new(File::new(&path)))).await;
        let (host, _) = harness.host("edge-01").await;
        (harness.admin.id, host.id)
    };

    let store = Store::open(Arc::new(JsonFileBackend::new(File::new(&path)))).await.unwrap();
    let (users, hosts, audit) = store
        .read(|state| {
            (
                state.tables.users.contains_key(&admin_id),
                state.tables.hosts.contains_key(&host_id),
                state.audit.iter().map(|e| e.kind).collect::<Vec<_>>(),
            )
        })
        .await;
    assert!(users);
    assert!(hosts);
    assert_eq!(audit, vec![AuditEventKind::UserCreated, AuditEventKind::HostCreated]);
}
