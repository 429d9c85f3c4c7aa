//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DockyardError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::vault::DEFAULT_MASTER_KEY_ENV;

/// Controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Directory for rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Data directory; platform default when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Host configuration file seeded at startup
    #[serde(default)]
    pub hosts_file: Option<PathBuf>,

    /// Environment variable holding the vault master key
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,

    /// Keep state in memory only
    #[serde(default)]
    pub ephemeral: bool,

    #[serde(default)]
    pub sessions: SessionSettings,

    /// Session probe interval in seconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    #[serde(default)]
    pub audit: AuditSettings,

    #[serde(default)]
    pub server: ServerSettings,

    /// Administrator created when the store has no users
    #[serde(default)]
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

fn default_true() -> bool {
    true
}

fn default_master_key_env() -> String {
    DEFAULT_MASTER_KEY_ENV.to_string()
}

fn default_probe_interval() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            data_dir: None,
            hosts_file: None,
            master_key_env: default_master_key_env(),
            ephemeral: false,
            sessions: SessionSettings::default(),
            probe_interval_secs: default_probe_interval(),
            audit: AuditSettings::default(),
            server: ServerSettings::default(),
            bootstrap_admin: None,
        }
    }
}

impl Settings {
    /// Load settings from `file`
    pub async fn load(file: &File) -> Result<Self, DockyardError> {
        let contents = file.read_string().await.map_err(|e| {
            DockyardError::ConfigError(format!("cannot read {}: {}", file.path().display(), e))
        })?;
        let settings: Settings = serde_json::from_str(&contents).map_err(|e| {
            DockyardError::ConfigError(format!("invalid settings {}: {}", file.path().display(), e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `file`, falling back to defaults when it does not exist
    pub async fn load_or_default(file: &File) -> Result<Self, DockyardError> {
        if file.exists().await {
            Self::load(file).await
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), DockyardError> {
        if self.master_key_env.trim().is_empty() {
            return Err(DockyardError::ConfigError("master_key_env must not be empty".to_string()));
        }
        if self.probe_interval_secs == 0 {
            return Err(DockyardError::ConfigError("probe_interval_secs must be positive".to_string()));
        }
        if self.audit.max_page_size == 0 {
            return Err(DockyardError::ConfigError("audit.max_page_size must be positive".to_string()));
        }
        self.sessions.validate()?;
        if self.server.enabled && self.server.port == 0 {
            return Err(DockyardError::ConfigError("server.port must be non-zero".to_string()));
        }
        if let Some(admin) = &self.bootstrap_admin {
            if admin.username.trim().is_empty() || admin.credential_hash.is_empty() {
                return Err(DockyardError::ConfigError(
                    "bootstrap_admin needs a username and credential_hash".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

/// Host session timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Compose runs and image pulls
    #[serde(default = "default_long_operation_timeout")]
    pub long_operation_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_operation_timeout() -> u64 {
    30
}

fn default_long_operation_timeout() -> u64 {
    600
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            operation_timeout_secs: default_operation_timeout(),
            long_operation_timeout_secs: default_long_operation_timeout(),
        }
    }
}

impl SessionSettings {
    fn validate(&self) -> Result<(), DockyardError> {
        if self.connect_timeout_secs == 0
            || self.operation_timeout_secs == 0
            || self.long_operation_timeout_secs == 0
        {
            return Err(DockyardError::ConfigError("session timeouts must be positive".to_string()));
        }
        Ok(())
    }
}

/// Audit policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Record an `access_denied` event for every denied request
    #[serde(default = "default_true")]
    pub record_denials: bool,

    /// Upper bound on audit query page size
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

fn default_max_page_size() -> usize {
    500
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            record_denials: true,
            max_page_size: default_max_page_size(),
        }
    }
}

/// Local status server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    7878
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapAdmin {
    pub username: String,
    pub credential_hash: String,
}
