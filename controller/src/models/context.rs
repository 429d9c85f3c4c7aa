//! Request context carried by every inbound action

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a request came from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Entry point, e.g. `api`, `cli`, `config`, `system`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Origin {
    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }

    pub fn system() -> Self {
        Self::source("system")
    }
}

/// The acting user of a request plus its origin metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Uuid,
    pub origin: Origin,
}

impl RequestContext {
    pub fn new(user_id: Uuid, origin: Origin) -> Self {
        Self { user_id, origin }
    }

    pub fn api(user_id: Uuid) -> Self {
        Self::new(user_id, Origin::source("api"))
    }
}
