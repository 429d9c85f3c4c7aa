//! Per-kind session establishment
//!
//! The connector for a host is chosen once, when the host is registered with
//! the manager; nothing downstream branches on the connection kind again.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::{Docker, API_DEFAULT_VERSION};
use tracing::debug;

use super::compose::ComposeRunner;
use super::engine::{classify, DockerSession};
use super::manager::SessionOptions;
use super::session::{EngineError, HostSession};
use super::tunnel::{SshCredential, SshTarget, SshTunnel};
use crate::models::host::{Connection, ConnectionKind, Host, SshAuth, TlsMaterial};
use crate::vault::{Ciphertext, Vault};

/// Opens sessions to one host
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> ConnectionKind;

    /// Endpoint description without secrets
    fn endpoint(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn HostSession>, EngineError>;
}

async fn verified(docker: Docker, compose: ComposeRunner, tunnel: Option<SshTunnel>) -> Result<Arc<dyn HostSession>, EngineError> {
    docker.ping().await.map_err(classify)?;
    Ok(Arc::new(DockerSession::new(docker, compose, tunnel)))
}

fn request_timeout(options: &SessionOptions) -> u64 {
    options.operation_timeout.as_secs().max(1)
}

/// Local Docker socket
pub struct SocketConnector {
    socket_path: String,
    options: SessionOptions,
}

impl SocketConnector {
    pub fn new(socket_path: impl Into<String>, options: SessionOptions) -> Self {
        Self {
            socket_path: socket_path.into(),
            options,
        }
    }
}

#[async_trait]
impl Connector for SocketConnector {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Socket
    }

    fn endpoint(&self) -> String {
        format!("unix://{}", self.socket_path)
    }

    async fn connect(&self) -> Result<Arc<dyn HostSession>, EngineError> {
        let docker = Docker::connect_with_socket(
            &self.socket_path,
            request_timeout(&self.options),
            API_DEFAULT_VERSION,
        )
        .map_err(classify)?;
        verified(docker, ComposeRunner::new(self.endpoint(), None), None).await
    }
}

/// Docker daemon listening on TCP, optionally with mutual TLS
pub struct TcpConnector {
    address: String,
    port: u16,
    tls: Option<TlsMaterial>,
    options: SessionOptions,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, port: u16, tls: Option<TlsMaterial>, options: SessionOptions) -> Self {
        Self {
            address: address.into(),
            port,
            tls,
            options,
        }
    }

    fn tcp_url(&self) -> String {
        format!("tcp://{}:{}", self.address, self.port)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Tcp
    }

    fn endpoint(&self) -> String {
        self.tcp_url()
    }

    async fn connect(&self) -> Result<Arc<dyn HostSession>, EngineError> {
        let timeout = request_timeout(&self.options);
        let docker = match &self.tls {
            Some(tls) => Docker::connect_with_ssl(
                &self.tcp_url(),
                &tls.client_key,
                &tls.client_cert,
                &tls.ca_cert,
                timeout,
                API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_http(&self.tcp_url(), timeout, API_DEFAULT_VERSION),
        }
        .map_err(classify)?;
        verified(
            docker,
            ComposeRunner::new(self.tcp_url(), self.tls.clone()),
            None,
        )
        .await
    }
}

/// Remote Docker socket reached through an SSH tunnel
pub struct SshConnector {
    target: SshTarget,
    auth: SshAuth,
    vault: Arc<Vault>,
    options: SessionOptions,
}

impl SshConnector {
    pub fn new(target: SshTarget, auth: SshAuth, vault: Arc<Vault>, options: SessionOptions) -> Self {
        Self {
            target,
            auth,
            vault,
            options,
        }
    }

    fn credential(&self) -> Result<SshCredential, EngineError> {
        let decrypt = |secret: &Ciphertext| {
            self.vault
                .decrypt(secret)
                .map_err(|e| EngineError::Credentials(e.to_string()))
        };
        Ok(match &self.auth {
            SshAuth::Password { secret } => SshCredential::Password(decrypt(secret)?),
            SshAuth::PrivateKey { secret } => SshCredential::PrivateKey(decrypt(secret)?),
        })
    }
}

#[async_trait]
impl Connector for SshConnector {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Ssh
    }

    fn endpoint(&self) -> String {
        format!(
            "ssh://{}@{}:{}",
            self.target.username, self.target.address, self.target.port
        )
    }

    async fn connect(&self) -> Result<Arc<dyn HostSession>, EngineError> {
        // Plaintext lives only until the tunnel has authenticated
        let credential = self.credential()?;
        let tunnel = SshTunnel::open(&self.target, credential, self.options.connect_timeout).await?;

        let socket = socket_path(tunnel.local_socket())?;
        let docker = Docker::connect_with_socket(&socket, request_timeout(&self.options), API_DEFAULT_VERSION)
            .map_err(classify)?;
        debug!("Docker client bound to tunnel socket {}", socket);
        verified(
            docker,
            ComposeRunner::new(format!("unix://{}", socket), None),
            Some(tunnel),
        )
        .await
    }
}

fn socket_path(path: &Path) -> Result<String, EngineError> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| EngineError::Transport(format!("non-UTF-8 socket path {:?}", path)))
}

/// Build the connector matching `host`'s connection kind
pub fn connector_for(host: &Host, vault: Arc<Vault>, options: &SessionOptions) -> Arc<dyn Connector> {
    match &host.connection {
        Connection::Socket { socket_path } => {
            Arc::new(SocketConnector::new(socket_path.clone(), options.clone()))
        }
        Connection::Tcp { address, port, tls } => Arc::new(TcpConnector::new(
            address.clone(),
            *port,
            tls.clone(),
            options.clone(),
        )),
        Connection::Ssh {
            address,
            port,
            username,
            auth,
            remote_socket,
        } => Arc::new(SshConnector::new(
            SshTarget {
                address: address.clone(),
                port: *port,
                username: username.clone(),
                remote_socket: remote_socket.clone(),
                known_hosts: options.ssh_known_hosts.clone(),
            },
            auth.clone(),
            vault,
            options.clone(),
        )),
    }
}
