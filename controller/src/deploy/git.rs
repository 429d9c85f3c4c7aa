//! Git checkouts of linked repositories

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::DockyardError;
use crate::filesys::file::File;
use crate::models::repository::{GitAuth, Repository};
use crate::vault::Vault;

/// Brings a local checkout of a repository up to date
#[async_trait]
pub trait Checkout: Send + Sync {
    /// Clone `repository` into `target`, or fast-forward an existing checkout
    async fn sync(&self, repository: &Repository, target: &Path) -> Result<(), DockyardError>;
}

/// Checkout through the `git` CLI
pub struct GitCheckout {
    vault: Arc<Vault>,
}

/// Process environment carrying the decrypted auth descriptor
struct GitEnv {
    vars: Vec<(String, SecretString)>,
    // Removed with the key file when the sync finishes
    _keydir: Option<TempDir>,
}

impl GitCheckout {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }

    async fn env(&self, auth: &GitAuth) -> Result<GitEnv, DockyardError> {
        let mut vars = vec![("GIT_TERMINAL_PROMPT".to_string(), SecretString::from("0".to_string()))];
        let mut keydir = None;

        match auth {
            GitAuth::None => {}
            GitAuth::Token { username, token } => {
                let token = self.vault.decrypt(token)?;
                let basic = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, token.expose_secret()));
                vars.push(("GIT_CONFIG_COUNT".to_string(), SecretString::from("1".to_string())));
                vars.push((
                    "GIT_CONFIG_KEY_0".to_string(),
                    SecretString::from("http.extraHeader".to_string()),
                ));
                vars.push((
                    "GIT_CONFIG_VALUE_0".to_string(),
                    SecretString::from(format!("Authorization: Basic {}", basic)),
                ));
            }
            GitAuth::SshKey { private_key } => {
                let key = self.vault.decrypt(private_key)?;
                let dir = tempfile::Builder::new().prefix("dockyard-git-").tempdir()?;
                let key_file = File::new(dir.path().join("id"));
                let mut material = key.expose_secret().to_string();
                if !material.ends_with('\n') {
                    material.push('\n');
                }
                key_file.write_atomic(material.as_bytes()).await?;
                vars.push((
                    "GIT_SSH_COMMAND".to_string(),
                    SecretString::from(format!(
                        "ssh -i '{}' -o IdentitiesOnly=yes -o BatchMode=yes -o StrictHostKeyChecking=accept-new",
                        key_file.path().display()
                    )),
                ));
                keydir = Some(dir);
            }
        }

        Ok(GitEnv {
            vars,
            _keydir: keydir,
        })
    }
}

async fn run_git(args: &[&str], cwd: Option<&Path>, env: &GitEnv) -> Result<(), DockyardError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &env.vars {
        cmd.env(key, value.expose_secret());
    }
    let output = cmd
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| DockyardError::GitError(format!("failed to run git: {}", e)))?;

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
    warn!("git {} failed: {}", args.first().copied().unwrap_or_default(), detail);
    Err(DockyardError::GitError(detail))
}

#[async_trait]
impl Checkout for GitCheckout {
    async fn sync(&self, repository: &Repository, target: &Path) -> Result<(), DockyardError> {
        info!(
            "Syncing repository {} (branch: {}) to {}",
            repository.name,
            repository.branch,
            target.display()
        );
        let env = self.env(&repository.auth).await?;

        if tokio::fs::metadata(target.join(".git")).await.is_ok() {
            debug!("Checkout exists, fast-forwarding");
            run_git(
                &["pull", "--ff-only", "origin", repository.branch.as_str()],
                Some(target),
                &env,
            )
            .await?;
        } else {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let target_str = target.to_str().ok_or_else(|| {
                DockyardError::GitError(format!("non-UTF-8 checkout path {:?}", target))
            })?;
            debug!("Cloning repository to {}", target_str);
            run_git(
                &[
                    "clone",
                    "--branch",
                    repository.branch.as_str(),
                    "--single-branch",
                    "--",
                    repository.url.as_str(),
                    target_str,
                ],
                None,
                &env,
            )
            .await?;
        }

        info!("Repository {} is up to date", repository.name);
        Ok(())
    }
}
