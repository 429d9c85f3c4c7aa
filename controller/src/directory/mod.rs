//! Directory: administration of users, hosts, grants, repositories and stacks
//!
//! Every mutation is admin-only and commits together with its audit event.
//! Host changes reach the connection manager after the commit, still under the
//! host's exclusive lock so in-flight deployments finish first and concurrent
//! updates register in commit order.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::authz::guard::AccessGuard;
use crate::deploy::locks::TransitionLocks;
use crate::docker::HostConnectionManager;
use crate::errors::DockyardError;
use crate::models::audit::{AuditEventKind, AuditResourceKind, NewAuditEvent};
use crate::models::context::{Origin, RequestContext};
use crate::models::deployment::Deployment;
use crate::models::grant::{Capability, Grant, ResourceRef};
use crate::models::host::{Connection, Host, HostSpec, SshAuth};
use crate::models::repository::{
    validate_compose_path, GitAuth, NewRepository, NewStack, Repository, Stack,
};
use crate::models::user::{NewUser, Role, User};
use crate::store::tables::Tables;
use crate::store::Store;
use crate::vault::{Ciphertext, Vault};

pub struct Directory {
    store: Arc<Store>,
    recorder: Arc<AuditRecorder>,
    guard: Arc<AccessGuard>,
    manager: Arc<HostConnectionManager>,
    vault: Arc<Vault>,
    locks: Arc<TransitionLocks>,
    checkouts_dir: PathBuf,
}

fn normalized_compose_path(path: &str) -> String {
    path.trim_start_matches("./").to_string()
}

impl Directory {
    pub fn new(
        store: Arc<Store>,
        recorder: Arc<AuditRecorder>,
        guard: Arc<AccessGuard>,
        manager: Arc<HostConnectionManager>,
        vault: Arc<Vault>,
        locks: Arc<TransitionLocks>,
        checkouts_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            recorder,
            guard,
            manager,
            vault,
            locks,
            checkouts_dir,
        }
    }

    /// Secrets must decrypt with the current master key before they are stored
    fn check_secret(&self, secret: &Ciphertext) -> Result<(), DockyardError> {
        self.vault.decrypt(secret).map(|_| ())
    }

    fn check_connection_secrets(&self, connection: &Connection) -> Result<(), DockyardError> {
        if let Connection::Ssh { auth, .. } = connection {
            match auth {
                SshAuth::Password { secret } | SshAuth::PrivateKey { secret } => {
                    self.check_secret(secret)?
                }
            }
        }
        Ok(())
    }

    // Users

    pub async fn create_user(&self, ctx: &RequestContext, new: NewUser) -> Result<User, DockyardError> {
        let admin = self.guard.require_admin(ctx).await?;
        let username = new.username.trim().to_string();
        if username.is_empty() {
            return Err(DockyardError::ValidationError("username is required".to_string()));
        }

        let user = User {
            id: Uuid::new_v4(),
            username,
            role: new.role,
            credential_hash: new.credential_hash,
            created_at: Utc::now(),
        };
        self.store
            .transact(|tx| {
                if tx.tables().user_by_name(&user.username).is_some() {
                    return Err(DockyardError::Conflict(format!(
                        "username {} is taken",
                        user.username
                    )));
                }
                tx.tables_mut().users.insert(user.id, user.clone());
                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::UserCreated, Some(admin.id), ctx.origin.clone())
                        .resource(AuditResourceKind::User, user.id)
                        .detail(json!({ "username": user.username, "role": user.role })),
                );
                Ok(())
            })
            .await?;
        info!("User {} created", user.username);
        Ok(user)
    }

    /// Delete a user, its grants, and its identity in audit history
    pub async fn delete_user(&self, ctx: &RequestContext, user_id: Uuid) -> Result<(), DockyardError> {
        let admin = self.guard.require_admin(ctx).await?;
        let removed = self
            .store
            .transact(|tx| {
                let target = tx.tables().user(user_id)?.clone();
                if target.is_admin()
                    && tx.tables().users.values().filter(|u| u.is_admin()).count() == 1
                {
                    return Err(DockyardError::Conflict(
                        "cannot delete the last administrator".to_string(),
                    ));
                }

                let tables = tx.tables_mut();
                tables.users.remove(&user_id);
                let before = tables.grants.len();
                tables.grants.retain(|_, g| g.user_id != user_id);
                let grants_removed = before - tables.grants.len();
                for deployment in tables.deployments.values_mut() {
                    if deployment.deployed_by == Some(user_id) {
                        deployment.deployed_by = None;
                    }
                }
                tx.anonymize_actor(user_id);

                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::UserDeleted, Some(admin.id), ctx.origin.clone())
                        .resource(AuditResourceKind::User, user_id)
                        .detail(json!({ "grants_removed": grants_removed })),
                );
                Ok(target)
            })
            .await?;
        info!("User {} deleted", removed.username);
        Ok(())
    }

    pub async fn list_users(&self, ctx: &RequestContext) -> Result<Vec<User>, DockyardError> {
        self.guard.require_admin(ctx).await?;
        Ok(self
            .store
            .read(|state| state.tables.users.values().cloned().collect())
            .await)
    }

    /// Create the first administrator when the store has no users
    pub async fn bootstrap_admin(
        &self,
        username: &str,
        credential_hash: &str,
    ) -> Result<Option<User>, DockyardError> {
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            role: Role::Admin,
            credential_hash: credential_hash.to_string(),
            created_at: Utc::now(),
        };
        let created = self
            .store
            .transact(|tx| {
                if !tx.tables().users.is_empty() {
                    return Ok(false);
                }
                tx.tables_mut().users.insert(user.id, user.clone());
                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::UserCreated, None, Origin::system())
                        .resource(AuditResourceKind::User, user.id)
                        .detail(json!({ "username": user.username, "role": user.role, "bootstrap": true })),
                );
                Ok(true)
            })
            .await?;
        if created {
            info!("Bootstrap administrator {} created", user.username);
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }

    // Hosts

    fn insert_host(
        &self,
        tables: &mut Tables,
        spec: &HostSpec,
    ) -> Result<Host, DockyardError> {
        if tables.host_by_name(&spec.name).is_some() {
            return Err(DockyardError::Conflict(format!("host {} already exists", spec.name)));
        }
        let now = Utc::now();
        let host = Host {
            id: Uuid::new_v4(),
            name: spec.name.clone(),
            connection: spec.connection.clone(),
            created_at: now,
            updated_at: now,
        };
        tables.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    pub async fn create_host(&self, ctx: &RequestContext, spec: HostSpec) -> Result<Host, DockyardError> {
        let admin = self.guard.require_admin(ctx).await?;
        spec.validate()?;
        self.check_connection_secrets(&spec.connection)?;

        let host = self
            .store
            .transact(|tx| {
                let host = self.insert_host(tx.tables_mut(), &spec)?;
                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::HostCreated, Some(admin.id), ctx.origin.clone())
                        .resource(AuditResourceKind::Host, host.id)
                        .detail(json!({
                            "name": host.name,
                            "connection_type": host.connection.kind(),
                            "endpoint": host.connection.endpoint(),
                        })),
                );
                Ok(host)
            })
            .await?;

        self.manager.register(&host);
        info!("Host {} created ({})", host.name, host.connection.endpoint());
        Ok(host)
    }

    /// Seed a host from the configuration file unless one with that name exists
    pub async fn seed_host(&self, spec: HostSpec) -> Result<Option<Host>, DockyardError> {
        spec.validate()?;
        self.check_connection_secrets(&spec.connection)?;

        let seeded = self
            .store
            .transact(|tx| {
                if tx.tables().host_by_name(&spec.name).is_some() {
                    return Ok(None);
                }
                let host = self.insert_host(tx.tables_mut(), &spec)?;
                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::HostCreated, None, Origin::source("config"))
                        .resource(AuditResourceKind::Host, host.id)
                        .detail(json!({
                            "name": host.name,
                            "connection_type": host.connection.kind(),
                            "endpoint": host.connection.endpoint(),
                        })),
                );
                Ok(Some(host))
            })
            .await?;

        if let Some(host) = &seeded {
            info!("Host {} seeded from configuration", host.name);
        }
        Ok(seeded)
    }

    pub async fn update_host(
        &self,
        ctx: &RequestContext,
        host_id: Uuid,
        spec: HostSpec,
    ) -> Result<Host, DockyardError> {
        let admin = self.guard.require_admin(ctx).await?;
        spec.validate()?;
        self.check_connection_secrets(&spec.connection)?;

        let host_lock = self.locks.host(host_id);
        let _exclusive = host_lock.write().await;
        let host = self
            .store
            .transact(|tx| {
                if tx
                    .tables()
                    .host_by_name(&spec.name)
                    .is_some_and(|other| other.id != host_id)
                {
                    return Err(DockyardError::Conflict(format!("host {} already exists", spec.name)));
                }
                let previous = tx.tables().host(host_id)?.clone();
                let updated = Host {
                    name: spec.name.clone(),
                    connection: spec.connection.clone(),
                    updated_at: Utc::now(),
                    ..previous.clone()
                };
                tx.tables_mut().hosts.insert(host_id, updated.clone());
                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::HostUpdated, Some(admin.id), ctx.origin.clone())
                        .resource(AuditResourceKind::Host, host_id)
                        .detail(json!({
                            "name": updated.name,
                            "previous_endpoint": previous.connection.endpoint(),
                            "endpoint": updated.connection.endpoint(),
                        })),
                );
                Ok(updated)
            })
            .await?;

        self.manager.register(&host);
        info!("Host {} updated", host.name);
        Ok(host)
    }

    /// Delete a host with every grant and deployment that references it
    pub async fn delete_host(&self, ctx: &RequestContext, host_id: Uuid) -> Result<(), DockyardError> {
        let admin = self.guard.require_admin(ctx).await?;

        let host_lock = self.locks.host(host_id);
        let _exclusive = host_lock.write().await;
        let host = self
            .store
            .transact(|tx| {
                let host = tx.tables().host(host_id)?.clone();

                // Collect dependents first, then remove them and the host
                let grant_ids: Vec<Uuid> = tx
                    .tables()
                    .grants
                    .values()
                    .filter(|g| g.resource.host_id() == host_id)
                    .map(|g| g.id)
                    .collect();
                let deployment_ids: Vec<Uuid> = tx
                    .tables()
                    .deployments
                    .values()
                    .filter(|d| d.host_id == host_id)
                    .map(|d| d.id)
                    .collect();

                let tables = tx.tables_mut();
                for id in &grant_ids {
                    tables.grants.remove(id);
                }
                for id in &deployment_ids {
                    tables.deployments.remove(id);
                }
                tables.hosts.remove(&host_id);

                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::HostDeleted, Some(admin.id), ctx.origin.clone())
                        .resource(AuditResourceKind::Host, host_id)
                        .detail(json!({
                            "name": host.name,
                            "grants_removed": grant_ids.len(),
                            "deployments_removed": deployment_ids.len(),
                        })),
                );
                Ok(host)
            })
            .await?;

        self.manager.deregister(host_id);
        info!("Host {} deleted", host.name);
        Ok(())
    }

    /// Hosts the caller may view
    pub async fn list_hosts(&self, ctx: &RequestContext) -> Result<Vec<Host>, DockyardError> {
        let resolver = self.guard.resolver();
        Ok(self
            .store
            .read(|state| {
                let Some(user) = state.tables.users.get(&ctx.user_id) else {
                    return Vec::new();
                };
                state
                    .tables
                    .hosts
                    .values()
                    .filter(|h| {
                        resolver.can_perform(&state.tables, user, Capability::View, &ResourceRef::host(h.id))
                    })
                    .cloned()
                    .collect()
            })
            .await)
    }

    // Grants

    pub async fn grant(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
        resource: ResourceRef,
        capability: Capability,
    ) -> Result<Grant, DockyardError> {
        let admin = self.guard.require_admin(ctx).await?;

        self.store
            .transact(|tx| {
                let tables = tx.tables();
                tables.user(user_id)?;
                tables.host(resource.host_id())?;
                if let ResourceRef::Stack { stack_id, .. } = &resource {
                    tables.stack(*stack_id)?;
                }
                if tables.grants_of(user_id).any(|g| g.matches(user_id, &resource, capability)) {
                    return Err(DockyardError::Conflict(format!(
                        "{} on {} is already granted",
                        capability, resource
                    )));
                }

                let grant = Grant {
                    id: Uuid::new_v4(),
                    user_id,
                    resource: resource.clone(),
                    capability,
                    granted_by: Some(admin.id),
                    granted_at: Utc::now(),
                };
                tx.tables_mut().grants.insert(grant.id, grant.clone());
                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::PermissionGranted, Some(admin.id), ctx.origin.clone())
                        .resource(AuditResourceKind::Grant, grant.id)
                        .detail(json!({
                            "user_id": user_id,
                            "resource": resource,
                            "capability": capability,
                        })),
                );
                Ok(grant)
            })
            .await
    }

    pub async fn revoke(&self, ctx: &RequestContext, grant_id: Uuid) -> Result<(), DockyardError> {
        let admin = self.guard.require_admin(ctx).await?;
        self.store
            .transact(|tx| {
                let grant = tx
                    .tables_mut()
                    .grants
                    .remove(&grant_id)
                    .ok_or_else(|| DockyardError::NotFound(format!("grant {}", grant_id)))?;
                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::PermissionRevoked, Some(admin.id), ctx.origin.clone())
                        .resource(AuditResourceKind::Grant, grant_id)
                        .detail(json!({
                            "user_id": grant.user_id,
                            "resource": grant.resource,
                            "capability": grant.capability,
                        })),
                );
                Ok(())
            })
            .await
    }

    pub async fn list_grants(
        &self,
        ctx: &RequestContext,
        user_id: Option<Uuid>,
    ) -> Result<Vec<Grant>, DockyardError> {
        self.guard.require_admin(ctx).await?;
        Ok(self
            .store
            .read(|state| {
                state
                    .tables
                    .grants
                    .values()
                    .filter(|g| user_id.is_none_or(|u| g.user_id == u))
                    .cloned()
                    .collect()
            })
            .await)
    }

    // Repositories and stacks

    pub async fn link_repository(
        &self,
        ctx: &RequestContext,
        new: NewRepository,
    ) -> Result<Repository, DockyardError> {
        let admin = self.guard.require_admin(ctx).await?;
        new.validate()?;
        match &new.auth {
            GitAuth::None => {}
            GitAuth::Token { token, .. } => self.check_secret(token)?,
            GitAuth::SshKey { private_key } => self.check_secret(private_key)?,
        }

        let repository = Repository {
            id: Uuid::new_v4(),
            name: new.name.trim().to_string(),
            url: new.url,
            branch: new.branch,
            auth: new.auth,
            created_at: Utc::now(),
        };
        self.store
            .transact(|tx| {
                if tx.tables().repositories.values().any(|r| r.name == repository.name) {
                    return Err(DockyardError::Conflict(format!(
                        "repository {} already exists",
                        repository.name
                    )));
                }
                tx.tables_mut()
                    .repositories
                    .insert(repository.id, repository.clone());
                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::RepositoryLinked, Some(admin.id), ctx.origin.clone())
                        .resource(AuditResourceKind::Repository, repository.id)
                        .detail(json!({
                            "name": repository.name,
                            "url": repository.url,
                            "branch": repository.branch,
                        })),
                );
                Ok(())
            })
            .await?;
        info!("Repository {} linked", repository.name);
        Ok(repository)
    }

    /// Unlink a repository, its stacks and the grants on them
    ///
    /// Refused while any of its stacks is actively deployed. Waits for a
    /// deploy that is using the checkout.
    pub async fn unlink_repository(&self, ctx: &RequestContext, repository_id: Uuid) -> Result<(), DockyardError> {
        let admin = self.guard.require_admin(ctx).await?;

        let repository_lock = self.locks.repository(repository_id);
        let _checkout = repository_lock.lock().await;

        let repository = self
            .store
            .transact(|tx| {
                let repository = tx.tables().repository(repository_id)?.clone();
                let stack_ids: Vec<Uuid> = tx
                    .tables()
                    .stacks
                    .values()
                    .filter(|s| s.repository_id == repository_id)
                    .map(|s| s.id)
                    .collect();
                let active: Vec<&Deployment> = tx
                    .tables()
                    .deployments
                    .values()
                    .filter(|d| d.is_active() && stack_ids.contains(&d.stack_id))
                    .collect();
                if !active.is_empty() {
                    return Err(DockyardError::Conflict(format!(
                        "repository {} has {} active deployment(s)",
                        repository.name,
                        active.len()
                    )));
                }

                let tables = tx.tables_mut();
                for id in &stack_ids {
                    tables.stacks.remove(id);
                }
                tables.grants.retain(|_, g| {
                    !matches!(&g.resource, ResourceRef::Stack { stack_id, .. } if stack_ids.contains(stack_id))
                });
                tables.deployments.retain(|_, d| !stack_ids.contains(&d.stack_id));
                tables.repositories.remove(&repository_id);

                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::RepositoryUnlinked, Some(admin.id), ctx.origin.clone())
                        .resource(AuditResourceKind::Repository, repository_id)
                        .detail(json!({ "name": repository.name, "stacks_removed": stack_ids.len() })),
                );
                Ok(repository)
            })
            .await?;

        let checkout = self.checkouts_dir.join(repository_id.to_string());
        if tokio::fs::metadata(&checkout).await.is_ok() {
            if let Err(e) = tokio::fs::remove_dir_all(&checkout).await {
                warn!("Failed to remove checkout {}: {}", checkout.display(), e);
            }
        }
        info!("Repository {} unlinked", repository.name);
        Ok(())
    }

    pub async fn list_repositories(&self, ctx: &RequestContext) -> Result<Vec<Repository>, DockyardError> {
        self.guard.require_admin(ctx).await?;
        Ok(self
            .store
            .read(|state| state.tables.repositories.values().cloned().collect())
            .await)
    }

    pub async fn register_stack(&self, ctx: &RequestContext, new: NewStack) -> Result<Stack, DockyardError> {
        let admin = self.guard.require_admin(ctx).await?;
        validate_compose_path(&new.compose_path)?;
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(DockyardError::ValidationError("stack name is required".to_string()));
        }

        let stack = Stack {
            id: Uuid::new_v4(),
            repository_id: new.repository_id,
            name,
            compose_path: normalized_compose_path(&new.compose_path),
            created_at: Utc::now(),
        };
        self.store
            .transact(|tx| {
                tx.tables().repository(stack.repository_id)?;
                let duplicate = tx.tables().stacks.values().any(|s| {
                    s.repository_id == stack.repository_id && s.compose_path == stack.compose_path
                });
                if duplicate {
                    return Err(DockyardError::Conflict(format!(
                        "{} is already registered for this repository",
                        stack.compose_path
                    )));
                }
                tx.tables_mut().stacks.insert(stack.id, stack.clone());
                self.recorder.record(
                    tx,
                    NewAuditEvent::new(AuditEventKind::StackRegistered, Some(admin.id), ctx.origin.clone())
                        .resource(AuditResourceKind::Stack, stack.id)
                        .detail(json!({
                            "name": stack.name,
                            "repository_id": stack.repository_id,
                            "compose_path": stack.compose_path,
                        })),
                );
                Ok(())
            })
            .await?;
        info!("Stack {} registered", stack.name);
        Ok(stack)
    }

    pub async fn list_stacks(&self, ctx: &RequestContext, repository_id: Option<Uuid>) -> Result<Vec<Stack>, DockyardError> {
        self.guard.require_admin(ctx).await?;
        Ok(self
            .store
            .read(|state| {
                state
                    .tables
                    .stacks
                    .values()
                    .filter(|s| repository_id.is_none_or(|r| s.repository_id == r))
                    .cloned()
                    .collect()
            })
            .await)
    }
}
