//! Server state

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::docker::HostConnectionManager;

/// Server state shared across handlers
pub struct ServerState {
    pub manager: Arc<HostConnectionManager>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(manager: Arc<HostConnectionManager>, started_at: DateTime<Utc>) -> Self {
        Self { manager, started_at }
    }
}
