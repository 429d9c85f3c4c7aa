//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::DockyardError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the controller
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Persisted store snapshot
    pub fn state_file(&self) -> File {
        File::new(self.base_dir.join("state.json"))
    }

    /// Default settings file location
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Git checkouts, one subdirectory per repository id
    pub fn checkouts_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("repositories"))
    }

    /// Known hosts of SSH-connected Docker hosts
    pub fn known_hosts_file(&self) -> File {
        File::new(self.base_dir.join("known_hosts"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), DockyardError> {
        Dir::new(&self.base_dir).create_private().await?;
        self.checkouts_dir().create_private().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/dockyard");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dockyard");

        Self::new(base_dir)
    }
}

#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
