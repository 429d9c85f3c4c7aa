//! Audit event models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::context::Origin;

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    UserCreated,
    UserDeleted,
    LoginFailed,
    HostCreated,
    HostUpdated,
    HostDeleted,
    PermissionGranted,
    PermissionRevoked,
    RepositoryLinked,
    RepositoryUnlinked,
    StackRegistered,
    ContainerStarted,
    ContainerStopped,
    ContainerRestarted,
    ContainerRemoved,
    ImagePulled,
    ImageRemoved,
    ImagesPruned,
    /// A host action about to reach the daemon
    ActionRequested,
    StackDeployed,
    StackTakenDown,
    AccessDenied,
}

/// Outcome of the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
    /// Requested; the outcome follows in a later event
    Pending,
}

/// Kind of resource an event is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResourceKind {
    User,
    Host,
    Container,
    Image,
    Grant,
    Repository,
    Stack,
    Deployment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResource {
    pub kind: AuditResourceKind,
    pub reference: String,
}

/// An immutable audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Position in the log, strictly increasing
    pub sequence: u64,
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Acting user; `None` for system events and deleted users
    pub actor: Option<Uuid>,
    pub kind: AuditEventKind,
    pub outcome: AuditOutcome,
    pub resource: Option<AuditResource>,
    pub detail: serde_json::Value,
    pub origin: Origin,
}

/// An event about to be recorded
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub actor: Option<Uuid>,
    pub kind: AuditEventKind,
    pub outcome: AuditOutcome,
    pub resource: Option<AuditResource>,
    pub detail: serde_json::Value,
    pub origin: Origin,
}

impl NewAuditEvent {
    pub fn new(kind: AuditEventKind, actor: Option<Uuid>, origin: Origin) -> Self {
        Self {
            actor,
            kind,
            outcome: AuditOutcome::Success,
            resource: None,
            detail: serde_json::Value::Null,
            origin,
        }
    }

    pub fn resource(mut self, kind: AuditResourceKind, reference: impl ToString) -> Self {
        self.resource = Some(AuditResource {
            kind,
            reference: reference.to_string(),
        });
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}
