//! Docker Engine API session backed by bollard

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions, PruneImagesOptions, RemoveImageOptions};
use bollard::models::ContainerStateStatusEnum;
use bollard::network::ListNetworksOptions;
use bollard::volume::ListVolumesOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::debug;

use super::compose::ComposeRunner;
use super::session::{
    split_image_reference, ComposeSpec, ContainerDetails, ContainerState, ContainerSummary,
    EngineError, EngineLogStream, HostSession, ImageSummary, LogLine, LogQuery, LogSource,
    NetworkSummary, PruneReport, VolumeSummary,
};
use super::tunnel::SshTunnel;

/// Grace period given to containers on stop
const STOP_TIMEOUT_SECS: i64 = 10;

/// Sort a bollard failure into transport problems and daemon answers
pub fn classify(err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Rejected(format!("{} ({})", message, status_code)),
        other => EngineError::Transport(other.to_string()),
    }
}

fn not_modified(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

/// A connected Docker endpoint plus the Compose runner pointed at it
pub struct DockerSession {
    docker: Docker,
    compose: ComposeRunner,
    // Kept alive for as long as the session exists
    _tunnel: Option<SshTunnel>,
}

impl DockerSession {
    pub fn new(docker: Docker, compose: ComposeRunner, tunnel: Option<SshTunnel>) -> Self {
        Self {
            docker,
            compose,
            _tunnel: tunnel,
        }
    }
}

fn container_state(status: Option<ContainerStateStatusEnum>) -> ContainerState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerState::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerState::Dead,
        _ => ContainerState::Unknown,
    }
}

/// Split a `timestamps=true` log frame into its RFC 3339 prefix and message
fn parse_log_frame(source: LogSource, raw: &[u8]) -> LogLine {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\n', '\r']);
    if let Some((prefix, rest)) = text.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(prefix) {
            return LogLine {
                source,
                timestamp: Some(ts.with_timezone(&Utc)),
                message: rest.to_string(),
            };
        }
    }
    LogLine {
        source,
        timestamp: None,
        message: text.to_string(),
    }
}

#[async_trait]
impl HostSession for DockerSession {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map(|_| ()).map_err(classify)
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                ContainerSummary {
                    id: c.id.unwrap_or_default(),
                    name,
                    image: c.image.unwrap_or_default(),
                    state: c.state.unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                    labels: c.labels.unwrap_or_default(),
                    created: c.created.unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn inspect_container(&self, container: &str) -> Result<ContainerDetails, EngineError> {
        let info = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;

        let state = info.state.as_ref();
        let config = info.config.as_ref();
        Ok(ContainerDetails {
            id: info.id.clone().unwrap_or_default(),
            name: info
                .name
                .clone()
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: config.and_then(|c| c.image.clone()).unwrap_or_default(),
            state: container_state(state.and_then(|s| s.status)),
            exit_code: state.and_then(|s| s.exit_code),
            started_at: state.and_then(|s| s.started_at.clone()),
            restart_count: info.restart_count.unwrap_or_default(),
            labels: config.and_then(|c| c.labels.clone()).unwrap_or_default(),
        })
    }

    async fn start_container(&self, container: &str) -> Result<(), EngineError> {
        match self
            .docker
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // Already running
            Err(e) if not_modified(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn stop_container(&self, container: &str) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.docker.stop_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped
            Err(e) if not_modified(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn restart_container(&self, container: &str) -> Result<(), EngineError> {
        self.docker
            .restart_container(container, None)
            .await
            .map_err(classify)
    }

    async fn remove_container(&self, container: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(container, Some(options))
            .await
            .map_err(classify)
    }

    fn stream_logs(&self, container: &str, query: &LogQuery) -> EngineLogStream {
        let options = LogsOptions::<String> {
            follow: query.follow,
            stdout: true,
            stderr: true,
            timestamps: true,
            since: query.since.map(|ts| ts.timestamp()).unwrap_or_default(),
            tail: query
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        self.docker
            .logs(container, Some(options))
            .filter_map(|frame| async move {
                match frame {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(parse_log_frame(LogSource::Stdout, &message)))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        Some(Ok(parse_log_frame(LogSource::Stderr, &message)))
                    }
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(classify(e))),
                }
            })
            .boxed()
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;

        Ok(images
            .into_iter()
            .map(|img| ImageSummary {
                id: img.id,
                repo_tags: img.repo_tags,
                size: img.size,
                created: img.created,
            })
            .collect())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let (from_image, tag) = split_image_reference(reference);
        let options = CreateImageOptions {
            from_image: from_image.as_str(),
            tag: tag.as_str(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(classify)?;
            if let Some(status) = info.status {
                debug!(image = %reference, status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn remove_image(&self, image: &str, force: bool) -> Result<Vec<String>, EngineError> {
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };
        let items = self
            .docker
            .remove_image(image, Some(options), None)
            .await
            .map_err(classify)?;

        Ok(items
            .into_iter()
            .filter_map(|item| item.deleted.or(item.untagged))
            .collect())
    }

    async fn prune_images(&self, dangling_only: bool) -> Result<PruneReport, EngineError> {
        let mut filters = HashMap::new();
        filters.insert(
            "dangling".to_string(),
            vec![dangling_only.to_string()],
        );
        let response = self
            .docker
            .prune_images(Some(PruneImagesOptions { filters }))
            .await
            .map_err(classify)?;

        Ok(PruneReport {
            images_deleted: response
                .images_deleted
                .unwrap_or_default()
                .into_iter()
                .filter_map(|item| item.deleted.or(item.untagged))
                .collect(),
            space_reclaimed: response.space_reclaimed.unwrap_or_default().max(0) as u64,
        })
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(classify)?;

        Ok(networks
            .into_iter()
            .map(|n| NetworkSummary {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                driver: n.driver.unwrap_or_default(),
                scope: n.scope.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>, EngineError> {
        let response = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await
            .map_err(classify)?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeSummary {
                name: v.name,
                driver: v.driver,
                mountpoint: v.mountpoint,
            })
            .collect())
    }

    async fn up(&self, spec: &ComposeSpec) -> Result<(), EngineError> {
        self.compose.up(spec).await
    }

    async fn down(&self, project_name: &str) -> Result<(), EngineError> {
        self.compose.down(project_name).await
    }
}
