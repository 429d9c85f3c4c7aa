//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::DockyardError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::session_probe;

/// Run the Dockyard controller until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DockyardError> {
    info!("Initializing Dockyard controller...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start controller: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, DockyardError> {
    let app_state = Arc::new(AppState::init(options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    if options.enable_session_probe {
        init_session_probe_worker(
            options.session_probe.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    if options.enable_status_server {
        init_status_server(
            options,
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    info!("Dockyard controller ready");
    Ok(app_state)
}

async fn init_session_probe_worker(
    options: session_probe::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DockyardError> {
    info!("Initializing session probe worker...");

    let manager = app_state.manager.clone();

    let probe_handle = tokio::spawn(async move {
        session_probe::run(
            &options,
            manager.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_session_probe_worker_handle(probe_handle)?;
    Ok(())
}

async fn init_status_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DockyardError> {
    info!("Initializing local status server...");

    let server_state = ServerState::new(app_state.manager.clone(), app_state.started_at);

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_status_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    status_server_handle: Option<JoinHandle<Result<(), DockyardError>>>,
    session_probe_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            status_server_handle: None,
            session_probe_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), DockyardError> {
        if self.app_state.is_some() {
            return Err(DockyardError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_status_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), DockyardError>>,
    ) -> Result<(), DockyardError> {
        if self.status_server_handle.is_some() {
            return Err(DockyardError::ShutdownError(
                "status_server_handle already set".to_string(),
            ));
        }
        self.status_server_handle = Some(handle);
        Ok(())
    }

    pub fn with_session_probe_worker_handle(
        &mut self,
        handle: JoinHandle<()>,
    ) -> Result<(), DockyardError> {
        if self.session_probe_worker_handle.is_some() {
            return Err(DockyardError::ShutdownError(
                "session_probe_worker_handle already set".to_string(),
            ));
        }
        self.session_probe_worker_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), DockyardError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DockyardError> {
        info!("Shutting down Dockyard controller...");

        // 1. Session probe worker
        if let Some(handle) = self.session_probe_worker_handle.take() {
            handle.await.map_err(|e| DockyardError::ShutdownError(e.to_string()))?;
        }

        // 2. Status server
        if let Some(handle) = self.status_server_handle.take() {
            handle.await.map_err(|e| DockyardError::ShutdownError(e.to_string()))??;
        }

        // 3. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
