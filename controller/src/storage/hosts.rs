//! Host configuration file
//!
//! A JSON object mapping host names to connection entries. The file is read
//! once at startup and never written. SSH secrets are given either as vault
//! ciphertext (`secret`) or as a plaintext file (`secret_file`) that is
//! encrypted on load.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

use crate::errors::DockyardError;
use crate::filesys::file::File;
use crate::models::host::{
    Connection, HostSpec, SshAuth, TlsMaterial, DEFAULT_DOCKER_SOCKET, DEFAULT_SSH_PORT,
};
use crate::vault::{Ciphertext, Vault};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AuthMethod {
    Password,
    PrivateKey,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "connection_type", rename_all = "lowercase")]
enum HostEntry {
    Socket {
        #[serde(default = "default_socket")]
        socket_path: String,
    },
    Tcp {
        address: String,
        port: u16,
        #[serde(default)]
        tls: Option<TlsMaterial>,
    },
    Ssh {
        address: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        username: String,
        auth_method: AuthMethod,
        #[serde(default)]
        secret: Option<Ciphertext>,
        #[serde(default)]
        secret_file: Option<PathBuf>,
        #[serde(default = "default_socket")]
        remote_socket: String,
    },
}

fn default_socket() -> String {
    DEFAULT_DOCKER_SOCKET.to_string()
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn config_error(name: &str, detail: impl std::fmt::Display) -> DockyardError {
    DockyardError::ConfigError(format!("host {}: {}", name, detail))
}

async fn resolve_secret(
    name: &str,
    method: AuthMethod,
    secret: Option<Ciphertext>,
    secret_file: Option<PathBuf>,
    vault: &Vault,
) -> Result<Ciphertext, DockyardError> {
    match (secret, secret_file) {
        (Some(secret), None) => Ok(secret),
        (None, Some(path)) => {
            let contents = File::new(&path).read_string().await.map_err(|e| {
                config_error(name, format!("cannot read secret file {}: {}", path.display(), e))
            })?;
            let plaintext = match method {
                AuthMethod::Password => contents.trim_end_matches(['\r', '\n']).to_string(),
                AuthMethod::PrivateKey => contents,
            };
            if plaintext.is_empty() {
                return Err(config_error(name, "secret file is empty"));
            }
            vault.encrypt(&plaintext)
        }
        (Some(_), Some(_)) => Err(config_error(name, "set either secret or secret_file, not both")),
        (None, None) => Err(config_error(name, "ssh hosts need secret or secret_file")),
    }
}

async fn into_spec(name: &str, entry: HostEntry, vault: &Vault) -> Result<HostSpec, DockyardError> {
    let connection = match entry {
        HostEntry::Socket { socket_path } => Connection::Socket { socket_path },
        HostEntry::Tcp { address, port, tls } => Connection::Tcp { address, port, tls },
        HostEntry::Ssh {
            address,
            port,
            username,
            auth_method,
            secret,
            secret_file,
            remote_socket,
        } => {
            let secret = resolve_secret(name, auth_method, secret, secret_file, vault).await?;
            let auth = match auth_method {
                AuthMethod::Password => SshAuth::Password { secret },
                AuthMethod::PrivateKey => SshAuth::PrivateKey { secret },
            };
            Connection::Ssh {
                address,
                port,
                username,
                auth,
                remote_socket,
            }
        }
    };

    let spec = HostSpec {
        name: name.to_string(),
        connection,
    };
    spec.validate().map_err(|e| config_error(name, e))?;
    Ok(spec)
}

/// Parse the host configuration in `contents`
pub async fn parse_hosts(contents: &str, vault: &Vault) -> Result<Vec<HostSpec>, DockyardError> {
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(contents)
        .map_err(|e| DockyardError::ConfigError(format!("invalid host configuration: {}", e)))?;

    let mut specs = Vec::with_capacity(raw.len());
    for (name, value) in raw {
        let entry: HostEntry = serde_json::from_value(value).map_err(|e| config_error(&name, e))?;
        let spec = into_spec(&name, entry, vault).await?;
        debug!("Host {} configured at {}", spec.name, spec.connection.endpoint());
        specs.push(spec);
    }
    Ok(specs)
}

/// Load the host configuration file
pub async fn load_hosts(file: &File, vault: &Vault) -> Result<Vec<HostSpec>, DockyardError> {
    let contents = file.read_string().await.map_err(|e| {
        DockyardError::ConfigError(format!("cannot read {}: {}", file.path().display(), e))
    })?;
    parse_hosts(&contents, vault).await
}
