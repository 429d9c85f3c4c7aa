//! Docker Compose driven through the docker CLI against a remote daemon

use std::ffi::OsString;
use std::io::ErrorKind as IoErrorKind;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use super::session::{ComposeSpec, EngineError};
use crate::models::host::TlsMaterial;

/// stderr fragments the CLI prints when it cannot reach the daemon
const UNREACHABLE_MARKERS: [&str; 3] = [
    "Cannot connect to the Docker daemon",
    "error during connect",
    "connection refused",
];

/// Runs `docker compose` (or legacy `docker-compose`) for one Docker endpoint
#[derive(Debug, Clone)]
pub struct ComposeRunner {
    docker_host: String,
    tls: Option<TlsMaterial>,
}

impl ComposeRunner {
    pub fn new(docker_host: impl Into<String>, tls: Option<TlsMaterial>) -> Self {
        Self {
            docker_host: docker_host.into(),
            tls,
        }
    }

    pub async fn up(&self, spec: &ComposeSpec) -> Result<(), EngineError> {
        info!(
            "Bringing up Compose project {} from {}",
            spec.project_name,
            spec.compose_file.display()
        );
        let args: Vec<OsString> = vec![
            "--project-name".into(),
            spec.project_name.clone().into(),
            "--project-directory".into(),
            spec.project_dir.clone().into_os_string(),
            "--file".into(),
            spec.compose_file.clone().into_os_string(),
            "up".into(),
            "--detach".into(),
            "--remove-orphans".into(),
        ];
        self.run(&args).await?;
        info!("Compose project {} is up", spec.project_name);
        Ok(())
    }

    pub async fn down(&self, project_name: &str) -> Result<(), EngineError> {
        info!("Taking down Compose project {}", project_name);
        let args: Vec<OsString> = vec![
            "--project-name".into(),
            project_name.into(),
            "down".into(),
            "--remove-orphans".into(),
        ];
        self.run(&args).await?;
        info!("Compose project {} is down", project_name);
        Ok(())
    }

    /// Connection flags understood by both `docker` and `docker-compose`
    pub fn global_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--host".into(), self.docker_host.clone().into()];
        if let Some(tls) = &self.tls {
            args.push("--tlsverify".into());
            args.push("--tlscacert".into());
            args.push(tls.ca_cert.clone().into_os_string());
            args.push("--tlscert".into());
            args.push(tls.client_cert.clone().into_os_string());
            args.push("--tlskey".into());
            args.push(tls.client_key.clone().into_os_string());
        }
        args
    }

    async fn run(&self, sub: &[OsString]) -> Result<(), EngineError> {
        let mut plugin_args = self.global_args();
        plugin_args.push("compose".into());
        plugin_args.extend(sub.iter().cloned());

        debug!("Running docker compose against {}", self.docker_host);
        match self.exec("docker", &plugin_args).await {
            Err(EngineError::Rejected(detail)) if detail.contains("is not a docker command") => {
                debug!("compose plugin missing, trying docker-compose");
            }
            Err(EngineError::Transport(detail)) if detail.starts_with("spawn") => {
                debug!("docker CLI unavailable ({}), trying docker-compose", detail);
            }
            other => return other,
        }

        let mut legacy_args = self.global_args();
        legacy_args.extend(sub.iter().cloned());
        self.exec("docker-compose", &legacy_args).await
    }

    async fn exec(&self, program: &str, args: &[OsString]) -> Result<(), EngineError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == IoErrorKind::NotFound {
                    EngineError::Transport(format!("spawn {}: not installed", program))
                } else {
                    EngineError::Transport(format!("spawn {}: {}", program, e))
                }
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output")
            .trim()
            .to_string();
        warn!("{} exited with {}: {}", program, output.status, detail);

        if UNREACHABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
            Err(EngineError::Transport(detail))
        } else {
            Err(EngineError::Rejected(detail))
        }
    }
}
