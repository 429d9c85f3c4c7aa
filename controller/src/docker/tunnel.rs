//! SSH tunnel forwarding a remote Docker socket to a local one

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::session::EngineError;
use crate::filesys::file::File;

const PASSWORD_ENV: &str = "DOCKYARD_SSH_PASSWORD";
const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$DOCKYARD_SSH_PASSWORD\"\n";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Decrypted SSH credential, only held while the tunnel is being opened
pub enum SshCredential {
    Password(SecretString),
    PrivateKey(SecretString),
}

/// Where and as whom to open the tunnel
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub remote_socket: String,
    pub known_hosts: Option<PathBuf>,
}

/// A running `ssh -L` process; killed and cleaned up on drop
pub struct SshTunnel {
    child: Child,
    local_socket: PathBuf,
    // Holds the forwarded socket and any key material
    _workdir: TempDir,
}

impl SshTunnel {
    pub async fn open(
        target: &SshTarget,
        credential: SshCredential,
        connect_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let workdir = tempfile::Builder::new()
            .prefix("dockyard-ssh-")
            .tempdir()
            .map_err(|e| EngineError::Transport(format!("tunnel workdir: {}", e)))?;
        let local_socket = workdir.path().join("docker.sock");

        let mut cmd = Command::new("ssh");
        cmd.args(base_args(target, &local_socket, connect_timeout));

        match &credential {
            SshCredential::PrivateKey(key) => {
                let key_file = File::new(workdir.path().join("id"));
                let mut material = key.expose_secret().to_string();
                if !material.ends_with('\n') {
                    material.push('\n');
                }
                key_file
                    .write_atomic(material.as_bytes())
                    .await
                    .map_err(|e| EngineError::Transport(format!("tunnel key: {}", e)))?;
                cmd.arg("-i")
                    .arg(key_file.path())
                    .args(["-o", "IdentitiesOnly=yes", "-o", "BatchMode=yes"])
                    .args(["-o", "PasswordAuthentication=no"]);
            }
            SshCredential::Password(password) => {
                let askpass = File::new(workdir.path().join("askpass.sh"));
                askpass
                    .write_atomic(ASKPASS_SCRIPT.as_bytes())
                    .await
                    .map_err(|e| EngineError::Transport(format!("tunnel askpass: {}", e)))?;
                make_executable(askpass.path()).await?;
                cmd.args(["-o", "PreferredAuthentications=password,keyboard-interactive"])
                    .args(["-o", "PubkeyAuthentication=no", "-o", "NumberOfPasswordPrompts=1"])
                    .env("SSH_ASKPASS", askpass.path())
                    .env("SSH_ASKPASS_REQUIRE", "force")
                    .env("DISPLAY", ":0")
                    .env(PASSWORD_ENV, password.expose_secret());
            }
        }

        cmd.arg("--")
            .arg(format!("{}@{}", target.username, target.address))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            "Opening SSH tunnel to {}@{}:{}",
            target.username, target.address, target.port
        );
        let child = cmd
            .spawn()
            .map_err(|e| EngineError::Transport(format!("spawn ssh: {}", e)))?;

        let mut tunnel = SshTunnel {
            child,
            local_socket,
            _workdir: workdir,
        };
        tunnel.wait_ready(connect_timeout).await?;
        info!(
            "SSH tunnel to {}:{} ready at {}",
            target.address,
            target.port,
            tunnel.local_socket.display()
        );
        Ok(tunnel)
    }

    pub fn local_socket(&self) -> &Path {
        &self.local_socket
    }

    async fn wait_ready(&mut self, limit: Duration) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if tokio::fs::metadata(&self.local_socket).await.is_ok() {
                return Ok(());
            }
            if let Ok(Some(status)) = self.child.try_wait() {
                let mut stderr = String::new();
                if let Some(mut pipe) = self.child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                let reason = stderr
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("no output")
                    .trim()
                    .to_string();
                warn!("ssh exited with {}: {}", status, reason);
                return Err(EngineError::Transport(format!("ssh exited: {}", reason)));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Transport(
                    "ssh tunnel did not come up in time".to_string(),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn base_args(target: &SshTarget, local_socket: &Path, connect_timeout: Duration) -> Vec<String> {
    let mut args = vec![
        "-N".to_string(),
        "-T".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
    ];
    if let Some(known_hosts) = &target.known_hosts {
        args.push("-o".to_string());
        args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
    }
    args.push("-p".to_string());
    args.push(target.port.to_string());
    args.push("-L".to_string());
    args.push(format!("{}:{}", local_socket.display(), target.remote_socket));
    args
}

async fn make_executable(path: &Path) -> Result<(), EngineError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| EngineError::Transport(format!("tunnel askpass: {}", e)))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
