//! Application state management

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::actions::HostActions;
use crate::app::options::AppOptions;
use crate::audit::AuditRecorder;
use crate::authz::guard::AccessGuard;
use crate::deploy::controller::StackDeploymentController;
use crate::deploy::git::GitCheckout;
use crate::deploy::locks::TransitionLocks;
use crate::directory::Directory;
use crate::docker::HostConnectionManager;
use crate::errors::DockyardError;
use crate::filesys::file::File;
use crate::storage::hosts::load_hosts;
use crate::store::backend::{JsonFileBackend, MemoryBackend, StateBackend};
use crate::store::Store;
use crate::vault::{MasterKey, Vault};

/// Main application state
pub struct AppState {
    pub store: Arc<Store>,
    pub vault: Arc<Vault>,
    pub recorder: Arc<AuditRecorder>,
    pub guard: Arc<AccessGuard>,
    pub manager: Arc<HostConnectionManager>,
    pub directory: Arc<Directory>,
    pub actions: Arc<HostActions>,
    pub deployments: Arc<StackDeploymentController>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, DockyardError> {
        info!("Initializing application state...");

        let layout = &options.storage.layout;
        layout.setup().await?;

        let master_key = MasterKey::from_env(&options.master_key_env)?;
        let vault = Arc::new(Vault::new(Some(master_key))?);

        let backend: Arc<dyn StateBackend> = if options.storage.ephemeral {
            warn!("Running with an ephemeral store, state is lost on exit");
            Arc::new(MemoryBackend)
        } else {
            Arc::new(JsonFileBackend::new(layout.state_file()))
        };
        let store = Arc::new(Store::open(backend).await?);

        let recorder = Arc::new(AuditRecorder::new(store.clone(), options.audit.max_page_size));
        let guard = Arc::new(AccessGuard::new(
            store.clone(),
            recorder.clone(),
            options.audit.record_denials,
        ));
        let manager = Arc::new(HostConnectionManager::new(vault.clone(), options.sessions.clone()));

        let checkouts_dir: PathBuf = layout.checkouts_dir().path().to_path_buf();
        let locks = Arc::new(TransitionLocks::new());
        let directory = Arc::new(Directory::new(
            store.clone(),
            recorder.clone(),
            guard.clone(),
            manager.clone(),
            vault.clone(),
            locks.clone(),
            checkouts_dir.clone(),
        ));
        let actions = Arc::new(HostActions::new(
            store.clone(),
            recorder.clone(),
            guard.clone(),
            manager.clone(),
        ));
        let deployments = Arc::new(StackDeploymentController::new(
            store.clone(),
            recorder.clone(),
            guard.clone(),
            manager.clone(),
            Arc::new(GitCheckout::new(vault.clone())),
            locks,
            checkouts_dir,
        ));

        let state = Self {
            store,
            vault,
            recorder,
            guard,
            manager,
            directory,
            actions,
            deployments,
            started_at: Utc::now(),
        };

        if let Some(hosts_file) = &options.hosts_file {
            state.seed_hosts(&File::new(hosts_file)).await?;
        }
        if let Some(admin) = &options.bootstrap_admin {
            state
                .directory
                .bootstrap_admin(&admin.username, &admin.credential_hash)
                .await?;
        }
        state.register_hosts().await;

        Ok(state)
    }

    /// Seed hosts from the configuration file; a host that cannot be stored is skipped
    async fn seed_hosts(&self, file: &File) -> Result<(), DockyardError> {
        let specs = load_hosts(file, &self.vault).await?;
        info!("Seeding {} hosts from {}", specs.len(), file.path().display());
        for spec in specs {
            let name = spec.name.clone();
            if let Err(e) = self.directory.seed_host(spec).await {
                error!("Skipping configured host {}: {}", name, e);
            }
        }
        Ok(())
    }

    async fn register_hosts(&self) {
        let hosts = self
            .store
            .read(|state| state.tables.hosts.values().cloned().collect::<Vec<_>>())
            .await;
        for host in &hosts {
            self.manager.register(host);
        }
        info!("Registered {} Docker hosts", hosts.len());
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), DockyardError> {
        info!("Shutting down application state...");
        let dropped = self.manager.deregister_all();
        info!("Closed {} host slots", dropped);
        Ok(())
    }
}
