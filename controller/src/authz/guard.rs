//! Request-time authorization with the denial audit policy applied

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info};

use super::PermissionResolver;
use crate::audit::AuditRecorder;
use crate::errors::DockyardError;
use crate::models::audit::{AuditEventKind, AuditOutcome, AuditResourceKind, NewAuditEvent};
use crate::models::context::RequestContext;
use crate::models::grant::{Capability, ResourceKind, ResourceRef};
use crate::models::user::User;
use crate::store::Store;

pub fn audit_kind_of(resource: &ResourceRef) -> AuditResourceKind {
    match resource.kind() {
        ResourceKind::Host => AuditResourceKind::Host,
        ResourceKind::Container => AuditResourceKind::Container,
        ResourceKind::Stack => AuditResourceKind::Stack,
    }
}

/// Gate every inbound action passes before touching a host
pub struct AccessGuard {
    store: Arc<Store>,
    recorder: Arc<AuditRecorder>,
    resolver: PermissionResolver,
    record_denials: bool,
}

impl AccessGuard {
    pub fn new(store: Arc<Store>, recorder: Arc<AuditRecorder>, record_denials: bool) -> Self {
        Self {
            store,
            recorder,
            resolver: PermissionResolver::new(),
            record_denials,
        }
    }

    pub fn resolver(&self) -> PermissionResolver {
        self.resolver
    }

    /// Resolve the caller and require `capability` on `resource`
    ///
    /// An unknown caller is denied like any other subject without grants.
    pub async fn authorize(
        &self,
        ctx: &RequestContext,
        capability: Capability,
        resource: &ResourceRef,
    ) -> Result<User, DockyardError> {
        let decision = self
            .store
            .read(|state| {
                let user = state.tables.users.get(&ctx.user_id)?;
                let allowed = self
                    .resolver
                    .can_perform(&state.tables, user, capability, resource);
                Some((user.clone(), allowed))
            })
            .await;

        if let Some((user, true)) = &decision {
            debug!("{} may {} on {}", user.username, capability, resource);
            return Ok(user.clone());
        }

        info!(user = %ctx.user_id, "Denied {} on {}", capability, resource);
        if self.record_denials {
            // The denial is surfaced even when it cannot be recorded
            let recorded = self
                .recorder
                .record_standalone(
                    NewAuditEvent::new(
                        AuditEventKind::AccessDenied,
                        decision.map(|(user, _)| user.id),
                        ctx.origin.clone(),
                    )
                    .resource(audit_kind_of(resource), resource)
                    .outcome(AuditOutcome::Denied)
                    .detail(json!({ "capability": capability })),
                )
                .await;
            if let Err(e) = recorded {
                error!(user = %ctx.user_id, "Failed to record denial of {} on {}: {}", capability, resource, e);
            }
        }
        Err(DockyardError::PermissionDenied(format!(
            "{} on {}",
            capability, resource
        )))
    }

    /// Caller must be an administrator
    pub async fn require_admin(&self, ctx: &RequestContext) -> Result<User, DockyardError> {
        let user = self
            .store
            .read(|state| state.tables.users.get(&ctx.user_id).cloned())
            .await;
        match user {
            Some(user) if user.is_admin() => Ok(user),
            _ => {
                info!(user = %ctx.user_id, "Denied administrative action");
                Err(DockyardError::PermissionDenied(
                    "administrator role required".to_string(),
                ))
            }
        }
    }
}
