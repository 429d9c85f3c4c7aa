//! Stack deployment tests

use std::sync::atomic::Ordering;
use std::time::Duration;

use dockyard::errors::{DockyardError, ErrorKind};
use dockyard::models::audit::{AuditEventKind, AuditOutcome};
use dockyard::models::context::RequestContext;
use dockyard::models::deployment::DeploymentStatus;
use dockyard::models::grant::{Capability, ResourceRef};

use crate::support::{Fault, Harness};

#[tokio::test]
async fn test_deploy_and_take_down() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    let (_, stack) = harness.stack("monitoring").await;
    let ctx = harness.admin_ctx();

    let deployment = harness.deployments.deploy(&ctx, stack.id, host.id).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Active);
    assert_eq!(deployment.deployed_by, Some(harness.admin.id));
    assert!(deployment.project_name.starts_with("monitoring-"));
    assert_eq!(docker.calls(), vec![format!("up {}", deployment.project_name)]);
    let listed = harness.deployments.list_deployments(&ctx, Some(host.id)).await.unwrap();
    assert!(listed[0].is_active());

    let stopped = harness.deployments.take_down(&ctx, deployment.id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert!(stopped.stopped_at.is_some());
    let listed = harness.deployments.list_deployments(&ctx, Some(host.id)).await.unwrap();
    assert!(!listed[0].is_active());

    assert_eq!(harness.events(AuditEventKind::StackDeployed).await.len(), 1);
    assert_eq!(harness.events(AuditEventKind::StackTakenDown).await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_deploys_yield_one_active() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    let (_, stack) = harness.stack("web").await;
    let ctx = harness.admin_ctx();

    let (first, second) = tokio::join!(
        harness.deployments.deploy(&ctx, stack.id, host.id),
        harness.deployments.deploy(&ctx, stack.id, host.id),
    );

    let outcomes = [first, second];
    let active = outcomes.iter().filter(|o| o.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|o| matches!(o, Err(DockyardError::Conflict(_))))
        .count();
    assert_eq!((active, conflicts), (1, 1));
    assert_eq!(docker.count("up"), 1);

    let deployments = harness.deployments.list_deployments(&ctx, Some(host.id)).await.unwrap();
    assert_eq!(deployments.len(), 1);
}

#[tokio::test]
async fn test_failed_down_keeps_deployment_active() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    let (_, stack) = harness.stack("web").await;
    let ctx = harness.admin_ctx();
    let deployment = harness.deployments.deploy(&ctx, stack.id, host.id).await.unwrap();

    docker.fail_next("down", Fault::Rejected);
    let err = harness.deployments.take_down(&ctx, deployment.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Docker);

    let current = harness.deployments.list_deployments(&ctx, None).await.unwrap();
    assert_eq!(current[0].status, DeploymentStatus::Active);

    let events = harness.events(AuditEventKind::StackTakenDown).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, AuditOutcome::Failure);

    // Still active, so it can be taken down again
    harness.deployments.take_down(&ctx, deployment.id).await.unwrap();
}

#[tokio::test]
async fn test_failed_checkout_recorded_as_failed_deployment() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    let (_, stack) = harness.stack("web").await;
    let ctx = harness.admin_ctx();
    harness.checkout.fail.store(true, Ordering::SeqCst);

    let err = harness.deployments.deploy(&ctx, stack.id, host.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Git);
    assert_eq!(docker.count("up"), 0);

    let deployments = harness.deployments.list_deployments(&ctx, None).await.unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].status, DeploymentStatus::Failed);
    assert!(deployments[0].error.is_some());

    // A failed pair can be deployed again
    harness.checkout.fail.store(false, Ordering::SeqCst);
    harness.deployments.deploy(&ctx, stack.id, host.id).await.unwrap();
}

#[tokio::test]
async fn test_take_down_of_stopped_deployment_conflicts() {
    let harness = Harness::new().await;
    let (host, _docker) = harness.host("edge-01").await;
    let (_, stack) = harness.stack("web").await;
    let ctx = harness.admin_ctx();
    let deployment = harness.deployments.deploy(&ctx, stack.id, host.id).await.unwrap();
    harness.deployments.take_down(&ctx, deployment.id).await.unwrap();

    let err = harness.deployments.take_down(&ctx, deployment.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_stack_grant_is_host_scoped() {
    let harness = Harness::new().await;
    let (edge, _) = harness.host("edge-01").await;
    let (core, _) = harness.host("core-01").await;
    let (_, stack) = harness.stack("web").await;
    let dave = harness.user("dave").await;
    harness
        .directory
        .grant(
            &harness.admin_ctx(),
            dave.id,
            ResourceRef::stack(edge.id, stack.id),
            Capability::DeployStack,
        )
        .await
        .unwrap();

    let ctx = RequestContext::api(dave.id);
    harness.deployments.deploy(&ctx, stack.id, edge.id).await.unwrap();
    let err = harness.deployments.deploy(&ctx, stack.id, core.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // Only the deployment on the granted host is visible
    let visible = harness.deployments.list_deployments(&ctx, None).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].host_id, edge.id);
}

#[tokio::test]
async fn test_stack_containers_matched_by_project() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    let (_, stack) = harness.stack("web").await;
    let ctx = harness.admin_ctx();
    let deployment = harness.deployments.deploy(&ctx, stack.id, host.id).await.unwrap();
    docker.add_container("web-nginx-1", Some(&deployment.project_name));
    docker.add_container("unrelated", Some("other-project"));

    let containers = harness.deployments.stack_containers(&ctx, deployment.id).await.unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].name, "web-nginx-1");
}

#[tokio::test]
async fn test_shared_checkout_synced_by_one_deploy_at_a_time() {
    let harness = Harness::new().await;
    let (edge, edge_docker) = harness.host("edge-01").await;
    let (core, core_docker) = harness.host("core-01").await;
    let (_, stack) = harness.stack("web").await;
    let ctx = harness.admin_ctx();

    let (on_edge, on_core) = tokio::join!(
        harness.deployments.deploy(&ctx, stack.id, edge.id),
        harness.deployments.deploy(&ctx, stack.id, core.id),
    );

    assert!(on_edge.unwrap().is_active());
    assert!(on_core.unwrap().is_active());
    assert_eq!(harness.checkout.syncs.load(Ordering::SeqCst), 2);
    assert_eq!(harness.checkout.peak.load(Ordering::SeqCst), 1);
    assert_eq!(edge_docker.count("up"), 1);
    assert_eq!(core_docker.count("up"), 1);
    assert_eq!(harness.locks.tracked(), 0);
}

#[tokio::test]
async fn test_host_deletion_waits_for_inflight_deploy() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    let (_, stack) = harness.stack("web").await;
    let ctx = harness.admin_ctx();

    let gate = harness.checkout.hold.lock().await;
    let (deployed, deleted, ()) = tokio::join!(
        harness.deployments.deploy(&ctx, stack.id, host.id),
        async {
            harness.checkout.entered.notified().await;
            harness.directory.delete_host(&ctx, host.id).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(gate);
        },
    );

    assert!(deployed.unwrap().is_active());
    deleted.unwrap();
    assert_eq!(docker.count("up"), 1);

    let deployed = harness.events(AuditEventKind::StackDeployed).await;
    assert_eq!(deployed.len(), 1);
    assert_eq!(deployed[0].outcome, AuditOutcome::Success);
    let removed = harness.events(AuditEventKind::HostDeleted).await;
    assert_eq!(removed[0].detail["deployments_removed"], 1);
    assert!(removed[0].sequence > deployed[0].sequence);
    assert_eq!(harness.locks.tracked(), 0);
}

#[tokio::test]
async fn test_unlink_waits_for_checkout_in_use() {
    let harness = Harness::new().await;
    let (host, _) = harness.host("edge-01").await;
    let (repository, stack) = harness.stack("web").await;
    let ctx = harness.admin_ctx();

    let gate = harness.checkout.hold.lock().await;
    let (deployed, unlinked, ()) = tokio::join!(
        harness.deployments.deploy(&ctx, stack.id, host.id),
        async {
            harness.checkout.entered.notified().await;
            harness.directory.unlink_repository(&ctx, repository.id).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(gate);
        },
    );

    assert!(deployed.unwrap().is_active());
    assert!(matches!(unlinked, Err(DockyardError::Conflict(_))));
    assert!(harness.checkouts_dir.join(repository.id.to_string()).exists());
}
