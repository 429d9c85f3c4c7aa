//! Permission grant models

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of resource a grant applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Host,
    Container,
    Stack,
}

/// Capability granted on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    View,
    Manage,
    Logs,
    Delete,
    DeployStack,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::View => "view",
            Capability::Manage => "manage",
            Capability::Logs => "logs",
            Capability::Delete => "delete",
            Capability::DeployStack => "deploy_stack",
        };
        f.write_str(name)
    }
}

/// Reference to a grantable resource; containers and stacks are scoped to their host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResourceRef {
    Host { host_id: Uuid },
    Container { host_id: Uuid, container: String },
    Stack { host_id: Uuid, stack_id: Uuid },
}

impl ResourceRef {
    pub fn host(host_id: Uuid) -> Self {
        ResourceRef::Host { host_id }
    }

    /// Container reference by name; Docker's leading `/` is dropped
    pub fn container(host_id: Uuid, container: &str) -> Self {
        ResourceRef::Container {
            host_id,
            container: container.trim_start_matches('/').to_string(),
        }
    }

    pub fn stack(host_id: Uuid, stack_id: Uuid) -> Self {
        ResourceRef::Stack { host_id, stack_id }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceRef::Host { .. } => ResourceKind::Host,
            ResourceRef::Container { .. } => ResourceKind::Container,
            ResourceRef::Stack { .. } => ResourceKind::Stack,
        }
    }

    /// Host the resource lives on
    pub fn host_id(&self) -> Uuid {
        match self {
            ResourceRef::Host { host_id }
            | ResourceRef::Container { host_id, .. }
            | ResourceRef::Stack { host_id, .. } => *host_id,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::Host { host_id } => write!(f, "host:{}", host_id),
            ResourceRef::Container { host_id, container } => {
                write!(f, "container:{}/{}", host_id, container)
            }
            ResourceRef::Stack { host_id, stack_id } => write!(f, "stack:{}/{}", host_id, stack_id),
        }
    }
}

/// A stored permission grant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: Uuid,
    pub user_id: Uuid,
    pub resource: ResourceRef,
    pub capability: Capability,
    pub granted_by: Option<Uuid>,
    pub granted_at: DateTime<Utc>,
}

impl Grant {
    /// Whether this grant is the (subject, resource, capability) tuple given
    pub fn matches(&self, user_id: Uuid, resource: &ResourceRef, capability: Capability) -> bool {
        self.user_id == user_id && self.capability == capability && &self.resource == resource
    }
}
