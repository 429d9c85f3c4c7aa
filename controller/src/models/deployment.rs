//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Active,
    Stopped,
    Failed,
}

/// A binding of one stack to one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub stack_id: Uuid,
    pub host_id: Uuid,

    /// Compose project name; containers carry it in `com.docker.compose.project`
    pub project_name: String,

    /// Deploying user, cleared when that user is deleted
    pub deployed_by: Option<Uuid>,

    pub status: DeploymentStatus,

    /// Failure detail when the deployment failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn is_active(&self) -> bool {
        self.status == DeploymentStatus::Active
    }

    /// Whether this deployment binds `stack_id` to `host_id`
    pub fn binds(&self, stack_id: Uuid, host_id: Uuid) -> bool {
        self.stack_id == stack_id && self.host_id == host_id
    }
}
