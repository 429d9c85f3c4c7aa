//! In-process fakes for Docker hosts and git checkouts

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use secrecy::SecretString;
use tempfile::TempDir;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use uuid::Uuid;

use dockyard::actions::HostActions;
use dockyard::audit::{AuditFilter, AuditRecorder, Pagination};
use dockyard::authz::guard::AccessGuard;
use dockyard::deploy::controller::StackDeploymentController;
use dockyard::deploy::git::Checkout;
use dockyard::deploy::locks::TransitionLocks;
use dockyard::directory::Directory;
use dockyard::docker::connector::Connector;
use dockyard::docker::session::{
    ComposeSpec, ContainerDetails, ContainerState, ContainerSummary, EngineError,
    EngineLogStream, HostSession, ImageSummary, LogLine, LogQuery, LogSource, NetworkSummary,
    PruneReport, VolumeSummary, COMPOSE_PROJECT_LABEL,
};
use dockyard::docker::{HostConnectionManager, SessionOptions};
use dockyard::errors::DockyardError;
use dockyard::models::audit::{AuditEvent, AuditEventKind};
use dockyard::models::context::RequestContext;
use dockyard::models::host::{Connection, ConnectionKind, Host, HostSpec};
use dockyard::models::repository::{GitAuth, NewRepository, NewStack, Repository, Stack};
use dockyard::models::user::{NewUser, Role, User};
use dockyard::store::backend::{MemoryBackend, SnapshotRef, State, StateBackend};
use dockyard::store::Store;
use dockyard::vault::{MasterKey, Vault};

pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Failure injected into the next call of an operation
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Transport,
    Rejected,
}

impl Fault {
    fn into_error(self, op: &str) -> EngineError {
        match self {
            Fault::Transport => EngineError::Transport(format!("{}: connection reset", op)),
            Fault::Rejected => EngineError::Rejected(format!("{}: conflict", op)),
        }
    }
}

/// One scripted log line or a mid-stream failure
#[derive(Debug, Clone)]
pub enum LogStep {
    Line(DateTime<Utc>, &'static str),
    Drop,
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Shared state behind every fake session of one host
#[derive(Default)]
pub struct FakeDocker {
    pub connects: AtomicUsize,
    pub unreachable: AtomicBool,
    pub connect_delay_ms: AtomicU64,
    stalled: Mutex<HashSet<&'static str>>,
    faults: Mutex<HashMap<&'static str, VecDeque<Fault>>>,
    calls: Mutex<Vec<String>>,
    containers: Mutex<Vec<ContainerSummary>>,
    log_scripts: Mutex<VecDeque<Vec<LogStep>>>,
    log_queries: Mutex<Vec<LogQuery>>,
}

impl FakeDocker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, op: &'static str, fault: Fault) {
        self.faults.lock().unwrap().entry(op).or_default().push_back(fault);
    }

    pub fn add_container(&self, name: &str, project: Option<&str>) {
        self.add_container_with_id(name, &format!("id-{}", name), project);
    }

    pub fn add_container_with_id(&self, name: &str, id: &str, project: Option<&str>) {
        let mut labels = HashMap::new();
        if let Some(project) = project {
            labels.insert(COMPOSE_PROJECT_LABEL.to_string(), project.to_string());
        }
        self.containers.lock().unwrap().push(ContainerSummary {
            id: id.to_string(),
            name: name.to_string(),
            image: "nginx:latest".to_string(),
            state: "running".to_string(),
            status: "Up 5 minutes".to_string(),
            labels,
            created: 0,
        });
    }

    /// Calls of `op` never complete from now on
    pub fn stall(&self, op: &'static str) {
        self.stalled.lock().unwrap().insert(op);
    }

    pub fn script_logs(&self, steps: Vec<LogStep>) {
        self.log_scripts.lock().unwrap().push_back(steps);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.split(' ').next() == Some(op)).count()
    }

    pub fn log_queries(&self) -> Vec<LogQuery> {
        self.log_queries.lock().unwrap().clone()
    }

    async fn stall_point(&self, op: &'static str) {
        let stalled = self.stalled.lock().unwrap().contains(op);
        if stalled {
            futures::future::pending::<()>().await;
        }
    }

    fn call(&self, op: &'static str, arg: &str) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!("{} {}", op, arg).trim_end().to_string());
        let fault = self.faults.lock().unwrap().get_mut(op).and_then(VecDeque::pop_front);
        match fault {
            Some(fault) => Err(fault.into_error(op)),
            None => Ok(()),
        }
    }
}

pub struct FakeSession {
    docker: Arc<FakeDocker>,
}

#[async_trait]
impl HostSession for FakeSession {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.call("ping", "")
    }

    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        self.docker.call("list_containers", "")?;
        Ok(self.docker.containers.lock().unwrap().clone())
    }

    async fn inspect_container(&self, container: &str) -> Result<ContainerDetails, EngineError> {
        self.docker.call("inspect_container", container)?;
        let containers = self.docker.containers.lock().unwrap();
        let found = containers
            .iter()
            .find(|c| c.name == container)
            .or_else(|| containers.iter().find(|c| c.id.starts_with(container)))
            .ok_or_else(|| EngineError::NotFound(format!("container {}", container)))?;
        Ok(ContainerDetails {
            id: found.id.clone(),
            name: found.name.clone(),
            image: found.image.clone(),
            state: ContainerState::Running,
            exit_code: None,
            started_at: None,
            restart_count: 0,
            labels: found.labels.clone(),
        })
    }

    async fn start_container(&self, container: &str) -> Result<(), EngineError> {
        self.docker.call("start_container", container)?;
        self.docker.stall_point("start_container").await;
        Ok(())
    }

    async fn stop_container(&self, container: &str) -> Result<(), EngineError> {
        self.docker.call("stop_container", container)
    }

    async fn restart_container(&self, container: &str) -> Result<(), EngineError> {
        self.docker.call("restart_container", container)
    }

    async fn remove_container(&self, container: &str, _force: bool) -> Result<(), EngineError> {
        self.docker.call("remove_container", container)
    }

    fn stream_logs(&self, container: &str, query: &LogQuery) -> EngineLogStream {
        self.docker.log_queries.lock().unwrap().push(query.clone());
        if let Err(e) = self.docker.call("stream_logs", container) {
            return stream::iter(vec![Err(e)]).boxed();
        }
        let steps = self.docker.log_scripts.lock().unwrap().pop_front().unwrap_or_default();
        let items: Vec<Result<LogLine, EngineError>> = steps
            .into_iter()
            .map(|step| match step {
                LogStep::Line(ts, message) => Ok(LogLine {
                    source: LogSource::Stdout,
                    timestamp: Some(ts),
                    message: message.to_string(),
                }),
                LogStep::Drop => Err(EngineError::Transport("stream reset".to_string())),
            })
            .collect();
        stream::iter(items).boxed()
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        self.docker.call("list_images", "")?;
        Ok(Vec::new())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        self.docker.call("pull_image", reference)
    }

    async fn remove_image(&self, image: &str, _force: bool) -> Result<Vec<String>, EngineError> {
        self.docker.call("remove_image", image)?;
        Ok(vec![image.to_string()])
    }

    async fn prune_images(&self, _dangling_only: bool) -> Result<PruneReport, EngineError> {
        self.docker.call("prune_images", "")?;
        Ok(PruneReport::default())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError> {
        self.docker.call("list_networks", "")?;
        Ok(Vec::new())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>, EngineError> {
        self.docker.call("list_volumes", "")?;
        Ok(Vec::new())
    }

    async fn up(&self, spec: &ComposeSpec) -> Result<(), EngineError> {
        self.docker.call("up", &spec.project_name)
    }

    async fn down(&self, project_name: &str) -> Result<(), EngineError> {
        self.docker.call("down", project_name)
    }
}

pub struct FakeConnector {
    pub docker: Arc<FakeDocker>,
}

#[async_trait]
impl Connector for FakeConnector {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Socket
    }

    fn endpoint(&self) -> String {
        "fake://docker".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn HostSession>, EngineError> {
        if self.docker.unreachable.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("connection refused".to_string()));
        }
        self.docker.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.docker.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(Arc::new(FakeSession {
            docker: self.docker.clone(),
        }))
    }
}

/// Checkout that writes a compose file instead of cloning
#[derive(Default)]
pub struct FakeCheckout {
    pub syncs: AtomicUsize,
    pub fail: AtomicBool,
    /// Syncs wait while this is held
    pub hold: AsyncMutex<()>,
    /// Signalled when a sync starts
    pub entered: Notify,
    active: AtomicUsize,
    /// Most syncs ever running at once
    pub peak: AtomicUsize,
}

impl FakeCheckout {
    async fn write_checkout(&self, repository: &Repository, target: &Path) -> Result<(), DockyardError> {
        let _hold = self.hold.lock().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(DockyardError::GitError(format!("cannot reach {}", repository.url)));
        }
        tokio::fs::create_dir_all(target).await?;
        tokio::fs::write(target.join(COMPOSE_FILE), "services: {}\n").await?;
        Ok(())
    }
}

#[async_trait]
impl Checkout for FakeCheckout {
    async fn sync(&self, repository: &Repository, target: &Path) -> Result<(), DockyardError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        self.entered.notify_one();

        let result = self.write_checkout(repository, target).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Backend whose commits can be made to fail
#[derive(Default)]
pub struct FlakyBackend {
    pub fail: AtomicBool,
}

#[async_trait]
impl StateBackend for FlakyBackend {
    async fn load(&self) -> Result<Option<State>, DockyardError> {
        Ok(None)
    }

    async fn commit(&self, _snapshot: &SnapshotRef<'_>) -> Result<(), DockyardError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DockyardError::StorageError("disk full".to_string()));
        }
        Ok(())
    }
}

pub fn test_vault() -> Arc<Vault> {
    let key = MasterKey::from_material(&SecretString::from("unit-test-master-key".to_string())).unwrap();
    Arc::new(Vault::new(Some(key)).unwrap())
}

/// A fully wired controller over fakes
pub struct Harness {
    pub store: Arc<Store>,
    pub recorder: Arc<AuditRecorder>,
    pub manager: Arc<HostConnectionManager>,
    pub directory: Directory,
    pub actions: HostActions,
    pub deployments: StackDeploymentController,
    pub checkout: Arc<FakeCheckout>,
    pub locks: Arc<TransitionLocks>,
    pub admin: User,
    _workdir: TempDir,
    pub checkouts_dir: PathBuf,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_backend(Arc::new(MemoryBackend)).await
    }

    pub async fn with_backend(backend: Arc<dyn StateBackend>) -> Self {
        Self::build(backend, SessionOptions::default(), true).await
    }

    pub async fn with_options(options: SessionOptions) -> Self {
        Self::build(Arc::new(MemoryBackend), options, true).await
    }

    pub async fn without_denial_records() -> Self {
        Self::build(Arc::new(MemoryBackend), SessionOptions::default(), false).await
    }

    async fn build(backend: Arc<dyn StateBackend>, options: SessionOptions, record_denials: bool) -> Self {
        let workdir = TempDir::new().unwrap();
        let checkouts_dir = workdir.path().join("repositories");
        let vault = test_vault();

        let store = Arc::new(Store::open(backend).await.unwrap());
        let recorder = Arc::new(AuditRecorder::new(store.clone(), 500));
        let guard = Arc::new(AccessGuard::new(store.clone(), recorder.clone(), record_denials));
        let manager = Arc::new(HostConnectionManager::new(vault.clone(), options));
        let checkout = Arc::new(FakeCheckout::default());
        let locks = Arc::new(TransitionLocks::new());

        let directory = Directory::new(
            store.clone(),
            recorder.clone(),
            guard.clone(),
            manager.clone(),
            vault,
            locks.clone(),
            checkouts_dir.clone(),
        );
        let actions = HostActions::new(store.clone(), recorder.clone(), guard.clone(), manager.clone());
        let deployments = StackDeploymentController::new(
            store.clone(),
            recorder.clone(),
            guard,
            manager.clone(),
            checkout.clone(),
            locks.clone(),
            checkouts_dir.clone(),
        );

        let admin = directory
            .bootstrap_admin("root", "$argon2id$stub")
            .await
            .unwrap()
            .unwrap();

        Self {
            store,
            recorder,
            manager,
            directory,
            actions,
            deployments,
            checkout,
            locks,
            admin,
            _workdir: workdir,
            checkouts_dir,
        }
    }

    pub fn admin_ctx(&self) -> RequestContext {
        RequestContext::api(self.admin.id)
    }

    pub async fn user(&self, username: &str) -> User {
        self.directory
            .create_user(
                &self.admin_ctx(),
                NewUser {
                    username: username.to_string(),
                    role: Role::User,
                    credential_hash: format!("hash-of-{}", username),
                },
            )
            .await
            .unwrap()
    }

    /// Create a host and route its sessions to a fresh fake daemon
    pub async fn host(&self, name: &str) -> (Host, Arc<FakeDocker>) {
        let host = self
            .directory
            .create_host(
                &self.admin_ctx(),
                HostSpec {
                    name: name.to_string(),
                    connection: Connection::Socket {
                        socket_path: "/var/run/docker.sock".to_string(),
                    },
                },
            )
            .await
            .unwrap();
        let docker = FakeDocker::new();
        self.manager.register_with(
            &host,
            Arc::new(FakeConnector {
                docker: docker.clone(),
            }),
        );
        (host, docker)
    }

    pub async fn stack(&self, name: &str) -> (Repository, Stack) {
        let repository = self
            .directory
            .link_repository(
                &self.admin_ctx(),
                NewRepository {
                    name: format!("{}-repo", name),
                    url: format!("https://git.example.com/ops/{}.git", name),
                    branch: "main".to_string(),
                    auth: GitAuth::None,
                },
            )
            .await
            .unwrap();
        let stack = self
            .directory
            .register_stack(
                &self.admin_ctx(),
                NewStack {
                    repository_id: repository.id,
                    name: name.to_string(),
                    compose_path: COMPOSE_FILE.to_string(),
                },
            )
            .await
            .unwrap();
        (repository, stack)
    }

    pub async fn events(&self, kind: AuditEventKind) -> Vec<AuditEvent> {
        self.recorder
            .query(
                &AuditFilter {
                    kind: Some(kind),
                    ..Default::default()
                },
                Pagination {
                    offset: 0,
                    limit: 500,
                },
            )
            .await
            .items
    }

    pub async fn events_by(&self, actor: Uuid) -> Vec<AuditEvent> {
        self.recorder
            .query(
                &AuditFilter {
                    actor: Some(actor),
                    ..Default::default()
                },
                Pagination {
                    offset: 0,
                    limit: 500,
                },
            )
            .await
            .items
    }
}
