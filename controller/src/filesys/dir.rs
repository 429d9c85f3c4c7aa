//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::DockyardError;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), DockyardError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Create the directory readable by the owner only
    pub async fn create_private(&self) -> Result<(), DockyardError> {
        self.create().await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o700)).await?;
        }
        Ok(())
    }
}
