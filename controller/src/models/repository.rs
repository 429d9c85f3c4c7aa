//! Git repository and stack models

use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DockyardError;
use crate::vault::Ciphertext;

/// How to authenticate against a git remote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum GitAuth {
    #[default]
    None,
    /// HTTP basic auth with a personal access token
    Token { username: String, token: Ciphertext },
    SshKey { private_key: Ciphertext },
}

/// A linked git repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub branch: String,
    pub auth: GitAuth,
    pub created_at: DateTime<Utc>,
}

/// Input for linking a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRepository {
    pub name: String,
    pub url: String,
    pub branch: String,
    #[serde(default)]
    pub auth: GitAuth,
}

impl NewRepository {
    pub fn validate(&self) -> Result<(), DockyardError> {
        if self.name.trim().is_empty() {
            return Err(DockyardError::ValidationError("repository name is required".to_string()));
        }
        if self.branch.trim().is_empty() || self.branch.starts_with('-') {
            return Err(DockyardError::ValidationError(format!(
                "invalid branch: {:?}",
                self.branch
            )));
        }
        validate_remote(&self.url)
    }
}

/// Accept `https://`, `http://`, `ssh://` and scp-like `user@host:path` remotes
fn validate_remote(remote: &str) -> Result<(), DockyardError> {
    if remote.starts_with('-') || remote.contains(char::is_whitespace) {
        return Err(DockyardError::ValidationError(format!("invalid git remote: {:?}", remote)));
    }
    match url::Url::parse(remote) {
        Ok(parsed) if matches!(parsed.scheme(), "https" | "http" | "ssh" | "file") => Ok(()),
        Ok(parsed) => Err(DockyardError::ValidationError(format!(
            "unsupported git remote scheme: {}",
            parsed.scheme()
        ))),
        Err(_) => match remote.split_once(':') {
            Some((host, path)) if host.contains('@') && !path.is_empty() => Ok(()),
            _ => Err(DockyardError::ValidationError(format!("invalid git remote: {:?}", remote))),
        },
    }
}

/// A Compose stack sourced from a repository file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stack {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub name: String,
    /// Compose file path relative to the repository root
    pub compose_path: String,
    pub created_at: DateTime<Utc>,
}

/// Input for registering a stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStack {
    pub repository_id: Uuid,
    pub name: String,
    pub compose_path: String,
}

/// A compose path must stay inside the checkout
pub fn validate_compose_path(compose_path: &str) -> Result<(), DockyardError> {
    let path = Path::new(compose_path);
    let mut normal = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            _ => {
                return Err(DockyardError::ValidationError(format!(
                    "compose path must be relative to the repository: {:?}",
                    compose_path
                )))
            }
        }
    }
    if normal == 0 {
        return Err(DockyardError::ValidationError("compose path is empty".to_string()));
    }
    Ok(())
}
