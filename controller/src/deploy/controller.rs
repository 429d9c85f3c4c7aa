//! Stack Deployment Controller
//!
//! Drives a stack on a host through [`DeploymentFsm`]. A transition holds the
//! host lock shared and the (stack, host) pair lock for its whole duration, so
//! concurrent requests for the same pair run one after the other and each
//! re-checks the state left by the previous one. A deploy also holds its
//! repository lock, since the checkout directory is shared by every stack and
//! host deployed from that repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use super::git::Checkout;
use super::locks::TransitionLocks;
use crate::audit::AuditRecorder;
use crate::authz::guard::AccessGuard;
use crate::docker::session::{ComposeSpec, ContainerSummary};
use crate::docker::HostConnectionManager;
use crate::errors::DockyardError;
use crate::models::audit::{AuditEventKind, AuditOutcome, AuditResourceKind, NewAuditEvent};
use crate::models::context::RequestContext;
use crate::models::deployment::Deployment;
use crate::models::grant::{Capability, ResourceRef};
use crate::models::repository::{Repository, Stack};
use crate::store::tables::Tables;
use crate::store::Store;
use crate::utils::generate_project_name;

pub struct StackDeploymentController {
    store: Arc<Store>,
    recorder: Arc<AuditRecorder>,
    guard: Arc<AccessGuard>,
    manager: Arc<HostConnectionManager>,
    checkout: Arc<dyn Checkout>,
    locks: Arc<TransitionLocks>,
    checkouts_dir: PathBuf,
}

/// Most recent deployment of `stack_id` on `host_id`
fn latest_for_pair(tables: &Tables, stack_id: Uuid, host_id: Uuid) -> Option<&Deployment> {
    tables
        .deployments
        .values()
        .filter(|d| d.binds(stack_id, host_id))
        .max_by_key(|d| d.created_at)
}

impl StackDeploymentController {
    pub fn new(
        store: Arc<Store>,
        recorder: Arc<AuditRecorder>,
        guard: Arc<AccessGuard>,
        manager: Arc<HostConnectionManager>,
        checkout: Arc<dyn Checkout>,
        locks: Arc<TransitionLocks>,
        checkouts_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            recorder,
            guard,
            manager,
            checkout,
            locks,
            checkouts_dir,
        }
    }

    /// Deploy `stack_id` on `host_id`
    ///
    /// A failed checkout or `up` is recorded as a `Failed` deployment and then
    /// returned as the error.
    pub async fn deploy(
        &self,
        ctx: &RequestContext,
        stack_id: Uuid,
        host_id: Uuid,
    ) -> Result<Deployment, DockyardError> {
        let user = self
            .guard
            .authorize(ctx, Capability::DeployStack, &ResourceRef::stack(host_id, stack_id))
            .await?;

        let repository_id = self
            .store
            .read(|state| state.tables.stack(stack_id).map(|s| s.repository_id))
            .await?;

        let host_lock = self.locks.host(host_id);
        let _host = host_lock.read().await;
        let pair_lock = self.locks.pair(stack_id, host_id);
        let _pair = pair_lock.lock().await;
        let repository_lock = self.locks.repository(repository_id);
        let _checkout = repository_lock.lock().await;

        let (stack, repository, previous) = self
            .store
            .read(|state| {
                state.tables.host(host_id)?;
                let stack = state.tables.stack(stack_id)?.clone();
                let repository = state.tables.repository(stack.repository_id)?.clone();
                let previous = latest_for_pair(&state.tables, stack_id, host_id)
                    .map(|d| DeploymentState::from(d.status))
                    .unwrap_or(DeploymentState::Undeployed);
                Ok::<_, DockyardError>((stack, repository, previous))
            })
            .await?;

        let mut fsm = DeploymentFsm::resume(previous);
        if fsm.process(DeploymentEvent::Deploy).is_err() {
            return Err(DockyardError::Conflict(format!(
                "stack {} is already active on this host",
                stack.name
            )));
        }

        let project_name = generate_project_name(&stack.name);
        info!(
            "Deploying stack {} to host {} as project {}",
            stack.name, host_id, project_name
        );
        let outcome = self.bring_up(&repository, &stack, host_id, &project_name).await;

        let event = match &outcome {
            Ok(()) => DeploymentEvent::DeploySucceeded,
            Err(e) => {
                warn!("Deployment of stack {} failed: {}", stack.name, e);
                DeploymentEvent::DeployFailed(e.to_string())
            }
        };
        fsm.process(event).map_err(DockyardError::Internal)?;
        let status = fsm.status().ok_or_else(|| {
            DockyardError::Internal(format!("deployment left in {:?}", fsm.state()))
        })?;

        let now = Utc::now();
        let deployment = Deployment {
            id: Uuid::new_v4(),
            stack_id,
            host_id,
            project_name,
            deployed_by: Some(user.id),
            status,
            error: fsm.error().map(str::to_string),
            created_at: now,
            updated_at: now,
            stopped_at: None,
        };

        let committed = self
            .store
            .transact(|tx| {
                tx.tables().host(host_id)?;
                tx.tables().stack(stack_id)?;
                if deployment.is_active() && tx.tables().active_deployment(stack_id, host_id).is_some() {
                    return Err(DockyardError::Conflict(format!(
                        "stack {} is already active on this host",
                        stack.name
                    )));
                }
                tx.tables_mut()
                    .deployments
                    .insert(deployment.id, deployment.clone());

                let mut detail = json!({
                    "stack_id": stack_id,
                    "host_id": host_id,
                    "project_name": deployment.project_name,
                });
                let mut outcome_kind = AuditOutcome::Success;
                if let Some(error) = &deployment.error {
                    detail["error"] = json!(error);
                    outcome_kind = AuditOutcome::Failure;
                }
                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::StackDeployed, Some(user.id), ctx.origin.clone())
                        .resource(AuditResourceKind::Deployment, deployment.id)
                        .outcome(outcome_kind)
                        .detail(detail),
                );
                Ok(())
            })
            .await;

        if let Err(e) = committed {
            // Nothing records a project that is running, so take it down again
            if outcome.is_ok() {
                error!(
                    "Recording deployment {} failed, taking it down: {}",
                    deployment.project_name, e
                );
                if let Err(down) = self.manager.compose_down(host_id, &deployment.project_name).await {
                    error!("Take-down of unrecorded project {} failed: {}", deployment.project_name, down);
                }
            }
            return Err(e);
        }

        outcome.map(|()| deployment)
    }

    async fn bring_up(
        &self,
        repository: &Repository,
        stack: &Stack,
        host_id: Uuid,
        project_name: &str,
    ) -> Result<(), DockyardError> {
        let checkout_dir = self.checkouts_dir.join(repository.id.to_string());
        self.checkout.sync(repository, &checkout_dir).await?;

        let spec = compose_spec(&checkout_dir, &stack.compose_path, project_name);
        if tokio::fs::metadata(&spec.compose_file).await.is_err() {
            return Err(DockyardError::NotFound(format!(
                "compose file {} in repository {}",
                stack.compose_path, repository.name
            )));
        }
        self.manager.compose_up(host_id, &spec).await
    }

    /// Take down an active deployment
    ///
    /// When `down` fails the deployment stays active, the failure is audited
    /// and the error returned.
    pub async fn take_down(
        &self,
        ctx: &RequestContext,
        deployment_id: Uuid,
    ) -> Result<Deployment, DockyardError> {
        let target = self
            .store
            .read(|state| state.tables.deployment(deployment_id).cloned())
            .await?;
        let user = self
            .guard
            .authorize(
                ctx,
                Capability::DeployStack,
                &ResourceRef::stack(target.host_id, target.stack_id),
            )
            .await?;

        let host_lock = self.locks.host(target.host_id);
        let _host = host_lock.read().await;
        let pair_lock = self.locks.pair(target.stack_id, target.host_id);
        let _pair = pair_lock.lock().await;

        let current = self
            .store
            .read(|state| state.tables.deployment(deployment_id).cloned())
            .await?;
        let mut fsm = DeploymentFsm::resume(DeploymentState::from(current.status));
        if fsm.process(DeploymentEvent::TakeDown).is_err() {
            return Err(DockyardError::Conflict(format!(
                "deployment {} is not active",
                current.project_name
            )));
        }

        info!("Taking down project {}", current.project_name);
        let outcome = self
            .manager
            .compose_down(current.host_id, &current.project_name)
            .await;

        let event = match &outcome {
            Ok(()) => DeploymentEvent::TakeDownSucceeded,
            Err(e) => {
                warn!("Take-down of {} failed: {}", current.project_name, e);
                DeploymentEvent::TakeDownFailed(e.to_string())
            }
        };
        fsm.process(event).map_err(DockyardError::Internal)?;
        let status = fsm.status().ok_or_else(|| {
            DockyardError::Internal(format!("deployment left in {:?}", fsm.state()))
        })?;

        let mut updated = current.clone();
        if status != current.status {
            let now = Utc::now();
            updated.status = status;
            updated.updated_at = now;
            updated.stopped_at = Some(now);
        }

        self.store
            .transact(|tx| {
                if status != current.status {
                    if let Some(stored) = tx.tables_mut().deployments.get_mut(&deployment_id) {
                        *stored = updated.clone();
                    }
                }
                let mut detail = json!({
                    "stack_id": current.stack_id,
                    "host_id": current.host_id,
                    "project_name": current.project_name,
                });
                let mut outcome_kind = AuditOutcome::Success;
                if let Some(error) = fsm.error() {
                    detail["error"] = json!(error);
                    outcome_kind = AuditOutcome::Failure;
                }
                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::StackTakenDown, Some(user.id), ctx.origin.clone())
                        .resource(AuditResourceKind::Deployment, deployment_id)
                        .outcome(outcome_kind)
                        .detail(detail),
                );
                Ok(())
            })
            .await?;

        outcome.map(|()| updated)
    }

    /// Deployments the caller may view, newest first
    pub async fn list_deployments(
        &self,
        ctx: &RequestContext,
        host_id: Option<Uuid>,
    ) -> Result<Vec<Deployment>, DockyardError> {
        let resolver = self.guard.resolver();
        let mut visible = self
            .store
            .read(|state| {
                let Some(user) = state.tables.users.get(&ctx.user_id) else {
                    return Vec::new();
                };
                state
                    .tables
                    .deployments
                    .values()
                    .filter(|d| host_id.is_none_or(|h| d.host_id == h))
                    .filter(|d| {
                        resolver.can_perform(
                            &state.tables,
                            user,
                            Capability::View,
                            &ResourceRef::stack(d.host_id, d.stack_id),
                        )
                    })
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await;
        visible.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(visible)
    }

    /// Containers of a deployment, matched by Compose project label
    pub async fn stack_containers(
        &self,
        ctx: &RequestContext,
        deployment_id: Uuid,
    ) -> Result<Vec<ContainerSummary>, DockyardError> {
        let deployment = self
            .store
            .read(|state| state.tables.deployment(deployment_id).cloned())
            .await?;
        self.guard
            .authorize(
                ctx,
                Capability::View,
                &ResourceRef::stack(deployment.host_id, deployment.stack_id),
            )
            .await?;

        let containers = self.manager.list_containers(deployment.host_id, true).await?;
        Ok(containers
            .into_iter()
            .filter(|c| c.project() == Some(deployment.project_name.as_str()))
            .collect())
    }
}

fn compose_spec(checkout_dir: &Path, compose_path: &str, project_name: &str) -> ComposeSpec {
    let compose_file = checkout_dir.join(compose_path);
    let project_dir = compose_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| checkout_dir.to_path_buf());
    ComposeSpec {
        project_name: project_name.to_string(),
        project_dir,
        compose_file,
    }
}
