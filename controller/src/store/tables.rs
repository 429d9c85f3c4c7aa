//! Entity tables

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DockyardError;
use crate::models::deployment::Deployment;
use crate::models::grant::Grant;
use crate::models::host::Host;
use crate::models::repository::{Repository, Stack};
use crate::models::user::User;

/// All mutable entities of the controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default)]
    pub users: BTreeMap<Uuid, User>,
    #[serde(default)]
    pub hosts: BTreeMap<Uuid, Host>,
    #[serde(default)]
    pub grants: BTreeMap<Uuid, Grant>,
    #[serde(default)]
    pub repositories: BTreeMap<Uuid, Repository>,
    #[serde(default)]
    pub stacks: BTreeMap<Uuid, Stack>,
    #[serde(default)]
    pub deployments: BTreeMap<Uuid, Deployment>,
}

impl Tables {
    pub fn user(&self, id: Uuid) -> Result<&User, DockyardError> {
        self.users
            .get(&id)
            .ok_or_else(|| DockyardError::NotFound(format!("user {}", id)))
    }

    pub fn user_by_name(&self, username: &str) -> Option<&User> {
        self.users.values().find(|u| u.username == username)
    }

    pub fn host(&self, id: Uuid) -> Result<&Host, DockyardError> {
        self.hosts
            .get(&id)
            .ok_or_else(|| DockyardError::NotFound(format!("host {}", id)))
    }

    pub fn host_by_name(&self, name: &str) -> Option<&Host> {
        self.hosts.values().find(|h| h.name == name)
    }

    pub fn repository(&self, id: Uuid) -> Result<&Repository, DockyardError> {
        self.repositories
            .get(&id)
            .ok_or_else(|| DockyardError::NotFound(format!("repository {}", id)))
    }

    pub fn stack(&self, id: Uuid) -> Result<&Stack, DockyardError> {
        self.stacks
            .get(&id)
            .ok_or_else(|| DockyardError::NotFound(format!("stack {}", id)))
    }

    pub fn deployment(&self, id: Uuid) -> Result<&Deployment, DockyardError> {
        self.deployments
            .get(&id)
            .ok_or_else(|| DockyardError::NotFound(format!("deployment {}", id)))
    }

    /// Grants currently held by `user_id`
    pub fn grants_of(&self, user_id: Uuid) -> impl Iterator<Item = &Grant> {
        self.grants.values().filter(move |g| g.user_id == user_id)
    }

    /// The active deployment binding `stack_id` to `host_id`, if any
    pub fn active_deployment(&self, stack_id: Uuid, host_id: Uuid) -> Option<&Deployment> {
        self.deployments
            .values()
            .find(|d| d.binds(stack_id, host_id) && d.is_active())
    }
}
