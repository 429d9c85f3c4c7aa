//! Permission resolver
//!
//! Decisions are a pure function of the grant set passed in. Implicit
//! permissions are derived on every call and never stored:
//!
//! * a grant on a host covers the same capability on its containers and stacks
//! * any grant on a resource implies `View` on that resource
//! * any container or stack grant implies `View` on the host it lives on

pub mod guard;

use uuid::Uuid;

use crate::models::grant::{Capability, Grant, ResourceRef};
use crate::models::user::User;
use crate::store::tables::Tables;

/// Resolves (subject, action, resource) to allow or deny
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionResolver;

impl PermissionResolver {
    pub fn new() -> Self {
        Self
    }

    /// Whether `subject` may perform `action` on `resource`
    pub fn can_perform(
        &self,
        tables: &Tables,
        subject: &User,
        action: Capability,
        resource: &ResourceRef,
    ) -> bool {
        if subject.is_admin() {
            return true;
        }

        let grants = || tables.grants_of(subject.id);
        let host_scope = ResourceRef::host(resource.host_id());

        let explicit = grants().any(|g| {
            g.capability == action && (&g.resource == resource || g.resource == host_scope)
        });
        if explicit {
            return true;
        }

        action == Capability::View && grants().any(|g| implies_view(g, resource, &host_scope))
    }

    /// Same as [`Self::can_perform`] for a subject identified by id; unknown users are denied
    pub fn check(
        &self,
        tables: &Tables,
        subject_id: Uuid,
        action: Capability,
        resource: &ResourceRef,
    ) -> bool {
        match tables.users.get(&subject_id) {
            Some(subject) => self.can_perform(tables, subject, action, resource),
            None => false,
        }
    }
}

/// Whether holding `grant` (of any capability) implies `View` on `resource`
fn implies_view(grant: &Grant, resource: &ResourceRef, host_scope: &ResourceRef) -> bool {
    if &grant.resource == resource || &grant.resource == host_scope {
        return true;
    }
    match resource {
        ResourceRef::Host { host_id } => grant.resource.host_id() == *host_id,
        ResourceRef::Container { .. } | ResourceRef::Stack { .. } => false,
    }
}
