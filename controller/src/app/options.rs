//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::docker::SessionOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{BootstrapAdmin, Settings};
use crate::vault::DEFAULT_MASTER_KEY_ENV;
use crate::workers::session_probe;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Environment variable holding the vault master key
    pub master_key_env: String,

    /// Host configuration file seeded at startup
    pub hosts_file: Option<PathBuf>,

    /// Administrator created when the store has no users
    pub bootstrap_admin: Option<BootstrapAdmin>,

    /// Audit policy
    pub audit: AuditOptions,

    /// Host session timeouts
    pub sessions: SessionOptions,

    /// Enable the session probe worker
    pub enable_session_probe: bool,

    /// Session probe worker options
    pub session_probe: session_probe::Options,

    /// Enable local status server
    pub enable_status_server: bool,

    /// Server configuration
    pub server: ServerOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            master_key_env: DEFAULT_MASTER_KEY_ENV.to_string(),
            hosts_file: None,
            bootstrap_admin: None,
            audit: AuditOptions::default(),
            sessions: SessionOptions::default(),
            enable_session_probe: true,
            session_probe: session_probe::Options::default(),
            enable_status_server: true,
            server: ServerOptions::default(),
        }
    }
}

impl AppOptions {
    /// Build the runtime options from a validated settings file
    pub fn from_settings(settings: &Settings) -> Self {
        let layout = match &settings.data_dir {
            Some(dir) => StorageLayout::new(dir),
            None => StorageLayout::default(),
        };
        let sessions = SessionOptions {
            connect_timeout: Duration::from_secs(settings.sessions.connect_timeout_secs),
            operation_timeout: Duration::from_secs(settings.sessions.operation_timeout_secs),
            long_operation_timeout: Duration::from_secs(settings.sessions.long_operation_timeout_secs),
            ssh_known_hosts: Some(layout.known_hosts_file().path().to_path_buf()),
        };
        Self {
            storage: StorageOptions {
                layout,
                ephemeral: settings.ephemeral,
            },
            master_key_env: settings.master_key_env.clone(),
            hosts_file: settings.hosts_file.clone(),
            bootstrap_admin: settings.bootstrap_admin.clone(),
            audit: AuditOptions {
                record_denials: settings.audit.record_denials,
                max_page_size: settings.audit.max_page_size,
            },
            sessions,
            session_probe: session_probe::Options {
                interval: settings.probe_interval(),
                ..Default::default()
            },
            enable_status_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            ..Default::default()
        }
    }
}

/// Lifecycle options for the controller
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Keep state in memory only
    pub ephemeral: bool,
}

/// Audit policy
#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub record_denials: bool,
    pub max_page_size: usize,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            record_denials: true,
            max_page_size: 500,
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7878,
        }
    }
}
