//! Host Actions gateway
//!
//! Every container, image, network and volume operation passes the access
//! guard before it runs through the connection manager. A mutating operation
//! is put on the audit log as a pending request first and only reaches the
//! daemon once that request is persisted; its outcome is recorded afterwards.
//! Containers are addressed by name, which is also how container grants refer
//! to them.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error};
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::authz::guard::AccessGuard;
use crate::docker::session::{
    ContainerDetails, ContainerSummary, ImageSummary, LogQuery, NetworkSummary, PruneReport,
    VolumeSummary,
};
use crate::docker::{HostConnectionManager, LogStream};
use crate::errors::DockyardError;
use crate::models::audit::{AuditEventKind, AuditOutcome, AuditResourceKind, NewAuditEvent};
use crate::models::context::{Origin, RequestContext};
use crate::models::grant::{Capability, ResourceRef};
use crate::models::user::User;
use crate::store::Store;

/// A mutating action whose request is already on the audit log
struct PendingAction {
    intent: u64,
    actor: Uuid,
    origin: Origin,
    kind: AuditEventKind,
    resource: (AuditResourceKind, String),
    detail: Value,
}

pub struct HostActions {
    store: Arc<Store>,
    recorder: Arc<AuditRecorder>,
    guard: Arc<AccessGuard>,
    manager: Arc<HostConnectionManager>,
}

impl HostActions {
    pub fn new(
        store: Arc<Store>,
        recorder: Arc<AuditRecorder>,
        guard: Arc<AccessGuard>,
        manager: Arc<HostConnectionManager>,
    ) -> Self {
        Self {
            store,
            recorder,
            guard,
            manager,
        }
    }

    /// Record the request of a mutating action; the daemon is not touched when this fails
    async fn begin(
        &self,
        ctx: &RequestContext,
        user: &User,
        kind: AuditEventKind,
        resource: (AuditResourceKind, String),
        detail: Value,
    ) -> Result<PendingAction, DockyardError> {
        let intent = self
            .recorder
            .record_standalone(
                NewAuditEvent::new(AuditEventKind::ActionRequested, Some(user.id), ctx.origin.clone())
                    .resource(resource.0, &resource.1)
                    .outcome(AuditOutcome::Pending)
                    .detail(json!({ "action": kind, "detail": detail })),
            )
            .await?;
        Ok(PendingAction {
            intent,
            actor: user.id,
            origin: ctx.origin.clone(),
            kind,
            resource,
            detail,
        })
    }

    /// Record the outcome of a pending action, then hand it back
    async fn finish<T>(
        &self,
        pending: PendingAction,
        outcome: Result<T, DockyardError>,
    ) -> Result<T, DockyardError> {
        let mut detail = pending.detail;
        detail["intent"] = json!(pending.intent);
        let outcome_kind = match &outcome {
            Ok(_) => AuditOutcome::Success,
            Err(e) => {
                detail["error"] = json!(e.to_string());
                AuditOutcome::Failure
            }
        };
        let recorded = self
            .recorder
            .record_standalone(
                NewAuditEvent::new(pending.kind, Some(pending.actor), pending.origin)
                    .resource(pending.resource.0, pending.resource.1)
                    .outcome(outcome_kind)
                    .detail(detail),
            )
            .await;
        // The daemon already acted; the pending request stays as the record
        if let Err(e) = recorded {
            error!(
                "Outcome of audited request #{} ({:?}) not recorded: {}",
                pending.intent, pending.kind, e
            );
        }
        outcome
    }

    /// Authorize `capability` on a container and resolve it on the daemon
    ///
    /// The daemon falls back to ID-prefix matching when no container has the
    /// requested name, so the grant is checked again against the resolved name.
    async fn resolve_container(
        &self,
        ctx: &RequestContext,
        capability: Capability,
        host_id: Uuid,
        container: &str,
    ) -> Result<(User, ContainerDetails), DockyardError> {
        let user = self
            .guard
            .authorize(ctx, capability, &ResourceRef::container(host_id, container))
            .await?;
        let details = self.manager.inspect_container(host_id, container).await?;
        if details.name != container {
            debug!("Container {} resolves to {}", container, details.name);
            self.guard
                .authorize(ctx, capability, &ResourceRef::container(host_id, &details.name))
                .await?;
        }
        Ok((user, details))
    }

    /// Containers on `host_id` the caller may view
    pub async fn list_containers(
        &self,
        ctx: &RequestContext,
        host_id: Uuid,
        all: bool,
    ) -> Result<Vec<ContainerSummary>, DockyardError> {
        let user = self
            .guard
            .authorize(ctx, Capability::View, &ResourceRef::host(host_id))
            .await?;
        let containers = self.manager.list_containers(host_id, all).await?;

        let resolver = self.guard.resolver();
        let visible = self
            .store
            .read(|state| {
                containers
                    .into_iter()
                    .filter(|c| {
                        resolver.can_perform(
                            &state.tables,
                            &user,
                            Capability::View,
                            &ResourceRef::container(host_id, &c.name),
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .await;
        debug!("{} sees {} containers on {}", user.username, visible.len(), host_id);
        Ok(visible)
    }

    pub async fn inspect_container(
        &self,
        ctx: &RequestContext,
        host_id: Uuid,
        container: &str,
    ) -> Result<ContainerDetails, DockyardError> {
        let (_, details) = self
            .resolve_container(ctx, Capability::View, host_id, container)
            .await?;
        Ok(details)
    }

    pub async fn start_container(
        &self,
        ctx: &RequestContext,
        host_id: Uuid,
        container: &str,
    ) -> Result<(), DockyardError> {
        let (user, details) = self
            .resolve_container(ctx, Capability::Manage, host_id, container)
            .await?;
        let name = details.name;
        let pending = self
            .begin(
                ctx,
                &user,
                AuditEventKind::ContainerStarted,
                (
                    AuditResourceKind::Container,
                    ResourceRef::container(host_id, &name).to_string(),
                ),
                json!({ "host_id": host_id, "container": name }),
            )
            .await?;
        let outcome = self.manager.start_container(host_id, &name).await;
        self.finish(pending, outcome).await
    }

    pub async fn stop_container(
        &self,
        ctx: &RequestContext,
        host_id: Uuid,
        container: &str,
    ) -> Result<(), DockyardError> {
        let (user, details) = self
            .resolve_container(ctx, Capability::Manage, host_id, container)
            .await?;
        let name = details.name;
        let pending = self
            .begin(
                ctx,
                &user,
                AuditEventKind::ContainerStopped,
                (
                    AuditResourceKind::Container,
                    ResourceRef::container(host_id, &name).to_string(),
                ),
                json!({ "host_id": host_id, "container": name }),
            )
            .await?;
        let outcome = self.manager.stop_container(host_id, &name).await;
        self.finish(pending, outcome).await
    }

    pub async fn restart_container(
        &self,
        ctx: &RequestContext,
        host_id: Uuid,
        container: &str,
    ) -> Result<(), DockyardError> {
        let (user, details) = self
            .resolve_container(ctx, Capability::Manage, host_id, container)
            .await?;
        let name = details.name;
        let pending = self
            .begin(
                ctx,
                &user,
                AuditEventKind::ContainerRestarted,
                (
                    AuditResourceKind::Container,
                    ResourceRef::container(host_id, &name).to_string(),
                ),
                json!({ "host_id": host_id, "container": name }),
            )
            .await?;
        let outcome = self.manager.restart_container(host_id, &name).await;
        self.finish(pending, outcome).await
    }

    pub async fn remove_container(
        &self,
        ctx: &RequestContext,
        host_id: Uuid,
        container: &str,
        force: bool,
    ) -> Result<(), DockyardError> {
        let (user, details) = self
            .resolve_container(ctx, Capability::Delete, host_id, container)
            .await?;
        let name = details.name;
        let pending = self
            .begin(
                ctx,
                &user,
                AuditEventKind::ContainerRemoved,
                (
                    AuditResourceKind::Container,
                    ResourceRef::container(host_id, &name).to_string(),
                ),
                json!({ "host_id": host_id, "container": name, "force": force }),
            )
            .await?;
        let outcome = self.manager.remove_container(host_id, &name, force).await;
        self.finish(pending, outcome).await
    }

    /// Follow the logs of a container; dropping the stream stops it
    pub async fn stream_logs(
        &self,
        ctx: &RequestContext,
        host_id: Uuid,
        container: &str,
        query: LogQuery,
    ) -> Result<LogStream, DockyardError> {
        let (_, details) = self
            .resolve_container(ctx, Capability::Logs, host_id, container)
            .await?;
        self.manager.stream_logs(host_id, &details.name, query).await
    }

    pub async fn list_images(&self, ctx: &RequestContext, host_id: Uuid) -> Result<Vec<ImageSummary>, DockyardError> {
        self.guard
            .authorize(ctx, Capability::View, &ResourceRef::host(host_id))
            .await?;
        self.manager.list_images(host_id).await
    }

    pub async fn pull_image(&self, ctx: &RequestContext, host_id: Uuid, reference: &str) -> Result<(), DockyardError> {
        let user = self
            .guard
            .authorize(ctx, Capability::Manage, &ResourceRef::host(host_id))
            .await?;
        let pending = self
            .begin(
                ctx,
                &user,
                AuditEventKind::ImagePulled,
                (AuditResourceKind::Image, reference.to_string()),
                json!({ "host_id": host_id }),
            )
            .await?;
        let outcome = self.manager.pull_image(host_id, reference).await;
        self.finish(pending, outcome).await
    }

    pub async fn remove_image(
        &self,
        ctx: &RequestContext,
        host_id: Uuid,
        image: &str,
        force: bool,
    ) -> Result<Vec<String>, DockyardError> {
        let user = self
            .guard
            .authorize(ctx, Capability::Manage, &ResourceRef::host(host_id))
            .await?;
        let mut pending = self
            .begin(
                ctx,
                &user,
                AuditEventKind::ImageRemoved,
                (AuditResourceKind::Image, image.to_string()),
                json!({ "host_id": host_id, "force": force }),
            )
            .await?;
        let outcome = self.manager.remove_image(host_id, image, force).await;
        if let Ok(removed) = &outcome {
            pending.detail["removed"] = json!(removed);
        }
        self.finish(pending, outcome).await
    }

    pub async fn prune_images(
        &self,
        ctx: &RequestContext,
        host_id: Uuid,
        dangling_only: bool,
    ) -> Result<PruneReport, DockyardError> {
        let resource = ResourceRef::host(host_id);
        let user = self.guard.authorize(ctx, Capability::Manage, &resource).await?;
        let mut pending = self
            .begin(
                ctx,
                &user,
                AuditEventKind::ImagesPruned,
                (AuditResourceKind::Host, resource.to_string()),
                json!({ "dangling_only": dangling_only }),
            )
            .await?;
        let outcome = self.manager.prune_images(host_id, dangling_only).await;
        if let Ok(report) = &outcome {
            pending.detail["images_deleted"] = json!(report.images_deleted.len());
            pending.detail["space_reclaimed"] = json!(report.space_reclaimed);
        }
        self.finish(pending, outcome).await
    }

    pub async fn list_networks(&self, ctx: &RequestContext, host_id: Uuid) -> Result<Vec<NetworkSummary>, DockyardError> {
        self.guard
            .authorize(ctx, Capability::View, &ResourceRef::host(host_id))
            .await?;
        self.manager.list_networks(host_id).await
    }

    pub async fn list_volumes(&self, ctx: &RequestContext, host_id: Uuid) -> Result<Vec<VolumeSummary>, DockyardError> {
        self.guard
            .authorize(ctx, Capability::View, &ResourceRef::host(host_id))
            .await?;
        self.manager.list_volumes(host_id).await
    }
}
