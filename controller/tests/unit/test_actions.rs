//! Host action gateway tests

use dockyard::errors::ErrorKind;
use dockyard::models::audit::{AuditEventKind, AuditOutcome};
use dockyard::models::context::RequestContext;
use dockyard::models::grant::{Capability, ResourceRef};

use crate::support::{Fault, Harness};

#[tokio::test]
async fn test_host_manage_grant_allows_container_start() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    docker.add_container("web", None);
    let alice = harness.user("alice").await;
    harness
        .directory
        .grant(&harness.admin_ctx(), alice.id, ResourceRef::host(host.id), Capability::Manage)
        .await
        .unwrap();

    harness
        .actions
        .start_container(&RequestContext::api(alice.id), host.id, "web")
        .await
        .unwrap();

    assert_eq!(docker.calls(), vec!["inspect_container web", "start_container web"]);
    let events = harness.events(AuditEventKind::ContainerStarted).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].actor, Some(alice.id));
    assert_eq!(events[0].outcome, AuditOutcome::Success);
    assert_eq!(events[0].origin.source.as_deref(), Some("api"));

    // The request was on the log before the daemon was asked
    let requested = harness.events(AuditEventKind::ActionRequested).await;
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].outcome, AuditOutcome::Pending);
    assert_eq!(requested[0].detail["action"], "container_started");
    assert!(requested[0].sequence < events[0].sequence);
    assert_eq!(events[0].detail["intent"], requested[0].sequence);
}

#[tokio::test]
async fn test_denied_action_never_reaches_docker() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    let bob = harness.user("bob").await;

    let err = harness
        .actions
        .stop_container(&RequestContext::api(bob.id), host.id, "web")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(docker.calls().is_empty());
    assert!(harness.events(AuditEventKind::ContainerStopped).await.is_empty());

    let denials = harness.events(AuditEventKind::AccessDenied).await;
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].actor, Some(bob.id));
    assert_eq!(denials[0].outcome, AuditOutcome::Denied);
}

#[tokio::test]
async fn test_manage_does_not_imply_delete() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    docker.add_container("web", None);
    let alice = harness.user("alice").await;
    let web = ResourceRef::container(host.id, "web");
    harness
        .directory
        .grant(&harness.admin_ctx(), alice.id, web, Capability::Manage)
        .await
        .unwrap();

    let ctx = RequestContext::api(alice.id);
    harness.actions.restart_container(&ctx, host.id, "web").await.unwrap();
    let err = harness
        .actions
        .remove_container(&ctx, host.id, "web", true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(docker.calls(), vec!["inspect_container web", "restart_container web"]);
}

#[tokio::test]
async fn test_failed_action_audited_as_failure() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    docker.fail_next("pull_image", Fault::Rejected);

    let err = harness
        .actions
        .pull_image(&harness.admin_ctx(), host.id, "nginx:1.25")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Docker);

    let events = harness.events(AuditEventKind::ImagePulled).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, AuditOutcome::Failure);
    assert!(events[0].detail.get("error").is_some());
}

#[tokio::test]
async fn test_container_listing_filtered_by_grants() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    docker.add_container("web", None);
    docker.add_container("db", None);
    let carol = harness.user("carol").await;
    let grant = harness
        .directory
        .grant(
            &harness.admin_ctx(),
            carol.id,
            ResourceRef::container(host.id, "web"),
            Capability::Logs,
        )
        .await
        .unwrap();

    let ctx = RequestContext::api(carol.id);
    let visible = harness.actions.list_containers(&ctx, host.id, true).await.unwrap();
    let names: Vec<_> = visible.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["web"]);

    // Revoking the only grant also removes the derived host view
    harness.directory.revoke(&harness.admin_ctx(), grant.id).await.unwrap();
    let err = harness.actions.list_containers(&ctx, host.id, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn test_admin_sees_every_container() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    docker.add_container("web", None);
    docker.add_container("db", None);

    let visible = harness
        .actions
        .list_containers(&harness.admin_ctx(), host.id, false)
        .await
        .unwrap();
    assert_eq!(visible.len(), 2);
}

#[tokio::test]
async fn test_container_grant_checked_against_resolved_name() {
    let harness = Harness::new().await;
    let (host, docker) = harness.host("edge-01").await;
    docker.add_container_with_id("db", "abc123def456", None);
    let alice = harness.user("alice").await;
    harness
        .directory
        .grant(
            &harness.admin_ctx(),
            alice.id,
            ResourceRef::container(host.id, "abc"),
            Capability::Manage,
        )
        .await
        .unwrap();

    // No container is named "abc", so the daemon resolves it by ID prefix
    let err = harness
        .actions
        .stop_container(&RequestContext::api(alice.id), host.id, "abc")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(docker.count("stop_container"), 0);
    assert!(harness.events(AuditEventKind::ActionRequested).await.is_empty());
    let denials = harness.events(AuditEventKind::AccessDenied).await;
    assert_eq!(denials.len(), 1);
    assert!(denials[0]
        .resource
        .as_ref()
        .is_some_and(|r| r.reference.ends_with("/db")));
}

#[tokio::test]
async fn test_denials_not_recorded_when_disabled() {
    let harness = Harness::without_denial_records().await;
    let (host, docker) = harness.host("edge-01").await;
    let bob = harness.user("bob").await;

    let err = harness
        .actions
        .start_container(&RequestContext::api(bob.id), host.id, "web")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(docker.calls().is_empty());
    assert!(harness.events(AuditEventKind::AccessDenied).await.is_empty());
}
