//! Host Connection Manager
//!
//! One slot per registered host. A slot's session is established lazily on
//! first use; establishment is serialized per host so concurrent callers share
//! one attempt. A transport failure discards the session and the next call
//! reconnects. Reads retry once against a fresh session, writes never do.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connector::{connector_for, Connector};
use super::session::{
    ComposeSpec, ContainerDetails, ContainerSummary, EngineError, EngineLogStream, HostSession,
    ImageSummary, LogLine, LogQuery, NetworkSummary, PruneReport, VolumeSummary,
};
use crate::errors::DockyardError;
use crate::models::host::{ConnectionKind, Host};
use crate::vault::Vault;

pub type LogStream = BoxStream<'static, Result<LogLine, DockyardError>>;

/// Timeouts applied to host sessions
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    /// Upper bound for Compose runs and image pulls
    pub long_operation_timeout: Duration,
    pub ssh_known_hosts: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            operation_timeout: Duration::from_secs(30),
            long_operation_timeout: Duration::from_secs(600),
            ssh_known_hosts: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    Once,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub host_id: Uuid,
    pub host_name: String,
    pub kind: ConnectionKind,
    pub endpoint: String,
    pub state: SessionState,
}

fn same_session(a: &Arc<dyn HostSession>, b: &Arc<dyn HostSession>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

struct HostSlot {
    host_id: Uuid,
    host_name: String,
    connector: Arc<dyn Connector>,
    session: Mutex<Option<Arc<dyn HostSession>>>,
}

impl HostSlot {
    async fn session(&self, connect_timeout: Duration) -> Result<Arc<dyn HostSession>, DockyardError> {
        let mut current = self.session.lock().await;
        if let Some(session) = current.as_ref() {
            return Ok(session.clone());
        }

        debug!(
            "Establishing {} session to {} ({})",
            self.connector.kind(),
            self.host_name,
            self.connector.endpoint()
        );
        match timeout(connect_timeout, self.connector.connect()).await {
            Ok(Ok(session)) => {
                info!("Connected to host {}", self.host_name);
                *current = Some(session.clone());
                Ok(session)
            }
            Ok(Err(e)) => Err(self.failure(e)),
            Err(_) => {
                warn!("Connecting to host {} timed out", self.host_name);
                Err(DockyardError::host_unreachable(&self.host_name))
            }
        }
    }

    /// Drop `failed` unless another caller already replaced it
    async fn invalidate(&self, failed: &Arc<dyn HostSession>) {
        let mut current = self.session.lock().await;
        if current.as_ref().is_some_and(|s| same_session(s, failed)) {
            debug!("Discarding session to {}", self.host_name);
            *current = None;
        }
    }

    fn state(&self) -> SessionState {
        match self.session.try_lock() {
            Ok(current) if current.is_some() => SessionState::Connected,
            Ok(_) => SessionState::Idle,
            Err(_) => SessionState::Connecting,
        }
    }

    fn failure(&self, err: EngineError) -> DockyardError {
        match err {
            EngineError::Transport(detail) => {
                warn!("Host {} unreachable: {}", self.host_name, detail);
                DockyardError::host_unreachable(&self.host_name)
            }
            EngineError::NotFound(detail) => DockyardError::NotFound(detail),
            EngineError::Rejected(detail) => DockyardError::DockerError(detail),
            EngineError::Credentials(detail) => {
                warn!("Credentials for host {} unusable: {}", self.host_name, detail);
                DockyardError::DecryptionError(format!("credentials of host {}", self.host_name))
            }
        }
    }
}

/// Owns the sessions to every registered host
pub struct HostConnectionManager {
    slots: RwLock<HashMap<Uuid, Arc<HostSlot>>>,
    vault: Arc<Vault>,
    options: SessionOptions,
}

impl HostConnectionManager {
    pub fn new(vault: Arc<Vault>, options: SessionOptions) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            vault,
            options,
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Register or re-register `host`; an existing session is discarded
    pub fn register(&self, host: &Host) {
        let connector = connector_for(host, self.vault.clone(), &self.options);
        self.register_with(host, connector);
    }

    /// Register `host` with an explicit connector
    pub fn register_with(&self, host: &Host, connector: Arc<dyn Connector>) {
        let slot = Arc::new(HostSlot {
            host_id: host.id,
            host_name: host.name.clone(),
            connector,
            session: Mutex::new(None),
        });
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if slots.insert(host.id, slot).is_some() {
            debug!("Replaced connection slot of host {}", host.name);
        }
    }

    pub fn deregister(&self, host_id: Uuid) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.remove(&host_id) {
            info!("Host {} deregistered", slot.host_name);
        }
    }

    /// Drop every slot and the sessions they hold
    pub fn deregister_all(&self) -> usize {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let count = slots.len();
        slots.clear();
        count
    }

    pub fn is_registered(&self, host_id: Uuid) -> bool {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.contains_key(&host_id)
    }

    pub fn status(&self) -> Vec<SessionStatus> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let mut statuses: Vec<SessionStatus> = slots
            .values()
            .map(|slot| SessionStatus {
                host_id: slot.host_id,
                host_name: slot.host_name.clone(),
                kind: slot.connector.kind(),
                endpoint: slot.connector.endpoint(),
                state: slot.state(),
            })
            .collect();
        statuses.sort_by(|a, b| a.host_name.cmp(&b.host_name));
        statuses
    }

    fn slot(&self, host_id: Uuid) -> Result<Arc<HostSlot>, DockyardError> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .get(&host_id)
            .cloned()
            .ok_or_else(|| DockyardError::NotFound(format!("host {}", host_id)))
    }

    async fn run<T, F, Fut>(
        &self,
        host_id: Uuid,
        op: &'static str,
        retry: Retry,
        limit: Duration,
        f: F,
    ) -> Result<T, DockyardError>
    where
        F: Fn(Arc<dyn HostSession>) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let slot = self.slot(host_id)?;
        let attempts = if retry == Retry::Once { 2 } else { 1 };
        let mut attempt = 0;

        loop {
            attempt += 1;
            let session = match slot.session(self.options.connect_timeout).await {
                Ok(session) => session,
                Err(DockyardError::HostUnreachable { .. }) if attempt < attempts => continue,
                Err(e) => return Err(e),
            };

            let result = match timeout(limit, f(session.clone())).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Transport(format!("{} timed out after {:?}", op, limit))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(EngineError::Transport(detail)) => {
                    warn!(host = %slot.host_name, op, attempt, "Docker transport failure: {}", detail);
                    slot.invalidate(&session).await;
                    if attempt < attempts {
                        continue;
                    }
                    return Err(DockyardError::host_unreachable(&slot.host_name));
                }
                Err(other) => return Err(slot.failure(other)),
            }
        }
    }

    /// Ping an established session without opening a new one
    ///
    /// Returns `None` when no session is open. A failed ping discards the session.
    pub async fn probe(&self, host_id: Uuid) -> Option<bool> {
        let slot = self.slot(host_id).ok()?;
        let session = {
            let current = slot.session.try_lock().ok()?;
            current.clone()?
        };
        match timeout(self.options.operation_timeout, session.ping()).await {
            Ok(Ok(())) => Some(true),
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", slot.host_name, e);
                slot.invalidate(&session).await;
                Some(false)
            }
            Err(_) => {
                debug!("Probe of {} timed out", slot.host_name);
                slot.invalidate(&session).await;
                Some(false)
            }
        }
    }

    pub fn registered_hosts(&self) -> Vec<Uuid> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.keys().copied().collect()
    }

    pub async fn list_containers(&self, host_id: Uuid, all: bool) -> Result<Vec<ContainerSummary>, DockyardError> {
        self.run(host_id, "list_containers", Retry::Once, self.options.operation_timeout, move |s| async move {
            s.list_containers(all).await
        })
        .await
    }

    pub async fn inspect_container(&self, host_id: Uuid, container: &str) -> Result<ContainerDetails, DockyardError> {
        let container = container.to_string();
        self.run(host_id, "inspect_container", Retry::Once, self.options.operation_timeout, |s| {
            let container = container.clone();
            async move { s.inspect_container(&container).await }
        })
        .await
    }

    pub async fn start_container(&self, host_id: Uuid, container: &str) -> Result<(), DockyardError> {
        let container = container.to_string();
        self.run(host_id, "start_container", Retry::Never, self.options.operation_timeout, |s| {
            let container = container.clone();
            async move { s.start_container(&container).await }
        })
        .await
    }

    pub async fn stop_container(&self, host_id: Uuid, container: &str) -> Result<(), DockyardError> {
        let container = container.to_string();
        self.run(host_id, "stop_container", Retry::Never, self.options.operation_timeout, |s| {
            let container = container.clone();
            async move { s.stop_container(&container).await }
        })
        .await
    }

    pub async fn restart_container(&self, host_id: Uuid, container: &str) -> Result<(), DockyardError> {
        let container = container.to_string();
        self.run(host_id, "restart_container", Retry::Never, self.options.operation_timeout, |s| {
            let container = container.clone();
            async move { s.restart_container(&container).await }
        })
        .await
    }

    pub async fn remove_container(&self, host_id: Uuid, container: &str, force: bool) -> Result<(), DockyardError> {
        let container = container.to_string();
        self.run(host_id, "remove_container", Retry::Never, self.options.operation_timeout, |s| {
            let container = container.clone();
            async move { s.remove_container(&container, force).await }
        })
        .await
    }

    pub async fn list_images(&self, host_id: Uuid) -> Result<Vec<ImageSummary>, DockyardError> {
        self.run(host_id, "list_images", Retry::Once, self.options.operation_timeout, |s| async move {
            s.list_images().await
        })
        .await
    }

    pub async fn pull_image(&self, host_id: Uuid, reference: &str) -> Result<(), DockyardError> {
        let reference = reference.to_string();
        self.run(host_id, "pull_image", Retry::Never, self.options.long_operation_timeout, |s| {
            let reference = reference.clone();
            async move { s.pull_image(&reference).await }
        })
        .await
    }

    pub async fn remove_image(&self, host_id: Uuid, image: &str, force: bool) -> Result<Vec<String>, DockyardError> {
        let image = image.to_string();
        self.run(host_id, "remove_image", Retry::Never, self.options.operation_timeout, |s| {
            let image = image.clone();
            async move { s.remove_image(&image, force).await }
        })
        .await
    }

    pub async fn prune_images(&self, host_id: Uuid, dangling_only: bool) -> Result<PruneReport, DockyardError> {
        self.run(host_id, "prune_images", Retry::Never, self.options.long_operation_timeout, move |s| async move {
            s.prune_images(dangling_only).await
        })
        .await
    }

    pub async fn list_networks(&self, host_id: Uuid) -> Result<Vec<NetworkSummary>, DockyardError> {
        self.run(host_id, "list_networks", Retry::Once, self.options.operation_timeout, |s| async move {
            s.list_networks().await
        })
        .await
    }

    pub async fn list_volumes(&self, host_id: Uuid) -> Result<Vec<VolumeSummary>, DockyardError> {
        self.run(host_id, "list_volumes", Retry::Once, self.options.operation_timeout, |s| async move {
            s.list_volumes().await
        })
        .await
    }

    pub async fn compose_up(&self, host_id: Uuid, spec: &ComposeSpec) -> Result<(), DockyardError> {
        self.run(host_id, "compose_up", Retry::Never, self.options.long_operation_timeout, |s| {
            let spec = spec.clone();
            async move { s.up(&spec).await }
        })
        .await
    }

    pub async fn compose_down(&self, host_id: Uuid, project_name: &str) -> Result<(), DockyardError> {
        let project_name = project_name.to_string();
        self.run(host_id, "compose_down", Retry::Never, self.options.long_operation_timeout, |s| {
            let project_name = project_name.clone();
            async move { s.down(&project_name).await }
        })
        .await
    }

    /// Stream container logs, resuming once across a dropped session
    ///
    /// The session is established before returning, so an unreachable host is
    /// reported here rather than as the first stream item. Lines already
    /// delivered are not repeated after a resume. The stream ends when the
    /// daemon closes it, typically because the container stopped.
    pub async fn stream_logs(&self, host_id: Uuid, container: &str, query: LogQuery) -> Result<LogStream, DockyardError> {
        let slot = self.slot(host_id)?;
        let session = slot.session(self.options.connect_timeout).await?;
        let inner = session.stream_logs(container, &query);

        let follow = LogFollow {
            slot,
            connect_timeout: self.options.connect_timeout,
            container: container.to_string(),
            query,
            session,
            last_seen: None,
            resumed: false,
            phase: Phase::Streaming(inner),
        };
        Ok(stream::unfold(follow, LogFollow::next).boxed())
    }
}

enum Phase {
    Streaming(EngineLogStream),
    Resume,
    Done,
}

struct LogFollow {
    slot: Arc<HostSlot>,
    connect_timeout: Duration,
    container: String,
    query: LogQuery,
    session: Arc<dyn HostSession>,
    last_seen: Option<DateTime<Utc>>,
    resumed: bool,
    phase: Phase,
}

impl LogFollow {
    async fn next(mut self) -> Option<(Result<LogLine, DockyardError>, Self)> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,
                Phase::Resume => match self.slot.session(self.connect_timeout).await {
                    Ok(session) => {
                        let mut query = self.query.clone();
                        if let Some(last) = self.last_seen {
                            query.since = Some(last);
                            query.tail = None;
                        }
                        debug!("Resuming log stream of {} on {}", self.container, self.slot.host_name);
                        self.phase = Phase::Streaming(session.stream_logs(&self.container, &query));
                        self.session = session;
                    }
                    Err(e) => return Some((Err(e), self)),
                },
                Phase::Streaming(mut inner) => match inner.next().await {
                    Some(Ok(line)) => {
                        if let (Some(ts), Some(last)) = (line.timestamp, self.last_seen) {
                            if ts <= last {
                                self.phase = Phase::Streaming(inner);
                                continue;
                            }
                        }
                        if line.timestamp.is_some() {
                            self.last_seen = line.timestamp;
                        }
                        self.resumed = false;
                        self.phase = Phase::Streaming(inner);
                        return Some((Ok(line), self));
                    }
                    Some(Err(EngineError::Transport(detail))) => {
                        warn!(
                            "Log stream of {} on {} interrupted: {}",
                            self.container, self.slot.host_name, detail
                        );
                        self.slot.invalidate(&self.session).await;
                        if self.resumed {
                            let err = DockyardError::host_unreachable(&self.slot.host_name);
                            return Some((Err(err), self));
                        }
                        self.resumed = true;
                        self.phase = Phase::Resume;
                    }
                    Some(Err(other)) => {
                        let err = self.slot.failure(other);
                        return Some((Err(err), self));
                    }
                    None => return None,
                },
            }
        }
    }
}
