//! Host models

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DockyardError;
use crate::vault::Ciphertext;

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Connection kind of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Socket,
    Tcp,
    Ssh,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Socket => f.write_str("socket"),
            ConnectionKind::Tcp => f.write_str("tcp"),
            ConnectionKind::Ssh => f.write_str("ssh"),
        }
    }
}

/// Client TLS material for a TCP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

/// SSH authentication method; the secret is always vault ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SshAuth {
    Password { secret: Ciphertext },
    PrivateKey { secret: Ciphertext },
}

/// Connection descriptor of a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "connection_type", rename_all = "lowercase")]
pub enum Connection {
    Socket {
        socket_path: String,
    },
    Tcp {
        address: String,
        port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tls: Option<TlsMaterial>,
    },
    Ssh {
        address: String,
        port: u16,
        username: String,
        auth: SshAuth,
        remote_socket: String,
    },
}

impl Connection {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            Connection::Socket { .. } => ConnectionKind::Socket,
            Connection::Tcp { .. } => ConnectionKind::Tcp,
            Connection::Ssh { .. } => ConnectionKind::Ssh,
        }
    }

    /// Human-readable endpoint, safe to log
    pub fn endpoint(&self) -> String {
        match self {
            Connection::Socket { socket_path } => format!("unix://{}", socket_path),
            Connection::Tcp { address, port, tls } => {
                let scheme = if tls.is_some() { "https" } else { "tcp" };
                format!("{}://{}:{}", scheme, address, port)
            }
            Connection::Ssh {
                address,
                port,
                username,
                ..
            } => format!("ssh://{}@{}:{}", username, address, port),
        }
    }

    pub fn validate(&self) -> Result<(), DockyardError> {
        match self {
            Connection::Socket { socket_path } => {
                if !socket_path.starts_with('/') {
                    return Err(DockyardError::ValidationError(format!(
                        "socket path must be absolute: {:?}",
                        socket_path
                    )));
                }
            }
            Connection::Tcp { address, port, .. } => {
                validate_address(address, *port)?;
            }
            Connection::Ssh {
                address,
                port,
                username,
                remote_socket,
                ..
            } => {
                validate_address(address, *port)?;
                if username.trim().is_empty() {
                    return Err(DockyardError::ValidationError(
                        "ssh username is required".to_string(),
                    ));
                }
                if !remote_socket.starts_with('/') {
                    return Err(DockyardError::ValidationError(format!(
                        "remote docker socket must be absolute: {:?}",
                        remote_socket
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_address(address: &str, port: u16) -> Result<(), DockyardError> {
    if address.trim().is_empty() || address.contains(char::is_whitespace) {
        return Err(DockyardError::ValidationError(format!(
            "invalid host address: {:?}",
            address
        )));
    }
    if port == 0 {
        return Err(DockyardError::ValidationError("port must be non-zero".to_string()));
    }
    Ok(())
}

/// A managed Docker host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub name: String,
    pub connection: Connection,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating or editing a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    pub connection: Connection,
}

impl HostSpec {
    pub fn validate(&self) -> Result<(), DockyardError> {
        if self.name.trim().is_empty() {
            return Err(DockyardError::ValidationError("host name is required".to_string()));
        }
        self.connection.validate()
    }
}
