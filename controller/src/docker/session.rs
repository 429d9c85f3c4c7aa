//! Docker capability surface shared by every connection kind

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label Compose puts on every container of a project
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Failure reported by a session
///
/// Only `Transport` marks the session as broken; the other variants are
/// answers from a healthy daemon.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected by daemon: {0}")]
    Rejected(String),

    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub labels: HashMap<String, String>,
    pub created: i64,
}

impl ContainerSummary {
    /// Compose project the container belongs to, if any
    pub fn project(&self) -> Option<&str> {
        self.labels.get(COMPOSE_PROJECT_LABEL).map(String::as_str)
    }
}

/// Runtime state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub exit_code: Option<i64>,
    pub started_at: Option<String>,
    pub restart_count: i64,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: i64,
    pub created: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub images_deleted: Vec<String>,
    pub space_reclaimed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
}

/// What `up` brings up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeSpec {
    pub project_name: String,
    pub project_dir: PathBuf,
    pub compose_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub source: LogSource,
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

/// Log stream parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    /// Keep the stream open for new lines until the container stops
    pub follow: bool,
    /// Only the last `n` lines of history
    pub tail: Option<u64>,
    pub since: Option<DateTime<Utc>>,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            follow: true,
            tail: Some(200),
            since: None,
        }
    }
}

pub type EngineLogStream = BoxStream<'static, Result<LogLine, EngineError>>;

/// A live session to one Docker endpoint
#[async_trait]
pub trait HostSession: Send + Sync {
    async fn ping(&self) -> Result<(), EngineError>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError>;

    async fn inspect_container(&self, container: &str) -> Result<ContainerDetails, EngineError>;

    async fn start_container(&self, container: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, container: &str) -> Result<(), EngineError>;

    async fn restart_container(&self, container: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, container: &str, force: bool) -> Result<(), EngineError>;

    /// Log lines of `container`; ends when the daemon closes the stream
    fn stream_logs(&self, container: &str, query: &LogQuery) -> EngineLogStream;

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError>;

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Returns the deleted or untagged references
    async fn remove_image(&self, image: &str, force: bool) -> Result<Vec<String>, EngineError>;

    async fn prune_images(&self, dangling_only: bool) -> Result<PruneReport, EngineError>;

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError>;

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>, EngineError>;

    async fn up(&self, spec: &ComposeSpec) -> Result<(), EngineError>;

    async fn down(&self, project_name: &str) -> Result<(), EngineError>;
}

/// Split `name[:tag]` or `name@digest` into the pull reference and tag
///
/// The tag defaults to `latest` so a pull never fetches every tag.
pub fn split_image_reference(reference: &str) -> (String, String) {
    if reference.contains('@') {
        return (reference.to_string(), String::new());
    }
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    match last_segment.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() => {
            let repo = &reference[..reference.len() - tag.len() - 1];
            (repo.to_string(), tag.to_string())
        }
        _ => (reference.trim_end_matches(':').to_string(), "latest".to_string()),
    }
}
