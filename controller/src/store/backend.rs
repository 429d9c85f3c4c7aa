//! Persistence backends for the state store

use std::borrow::Cow;

use async_trait::async_trait;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DockyardError;
use crate::filesys::file::File;
use crate::models::audit::AuditEvent;
use crate::store::tables::Tables;

/// Persisted form of the whole store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub tables: Tables,
    #[serde(default)]
    pub audit: Vec<AuditEvent>,
}

/// Borrowed view of the state a transaction is about to publish
///
/// Serializes exactly like [`State`] without copying the audit log.
pub struct SnapshotRef<'a> {
    pub tables: &'a Tables,
    pub(crate) committed: &'a [AuditEvent],
    pub(crate) staged: &'a [AuditEvent],
    pub(crate) anonymized: &'a [Uuid],
}

impl SnapshotRef<'_> {
    /// Audit log after this transaction, with pending anonymization applied
    pub fn audit(&self) -> impl Iterator<Item = Cow<'_, AuditEvent>> {
        self.committed.iter().chain(self.staged.iter()).map(|event| {
            match event.actor {
                Some(actor) if self.anonymized.contains(&actor) => {
                    let mut event = event.clone();
                    event.actor = None;
                    Cow::Owned(event)
                }
                _ => Cow::Borrowed(event),
            }
        })
    }
}

struct AuditLog<'s, 'a>(&'s SnapshotRef<'a>);

impl Serialize for AuditLog<'_, '_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.audit())
    }
}

impl Serialize for SnapshotRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("State", 2)?;
        state.serialize_field("tables", self.tables)?;
        state.serialize_field("audit", &AuditLog(self))?;
        state.end()
    }
}

/// Durable storage for committed state
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Load the last committed state, `None` when nothing was ever committed
    async fn load(&self) -> Result<Option<State>, DockyardError>;

    /// Persist `snapshot` atomically; on error nothing of it may be visible
    async fn commit(&self, snapshot: &SnapshotRef<'_>) -> Result<(), DockyardError>;
}

/// Keeps nothing beyond the process lifetime
#[derive(Debug, Default)]
pub struct MemoryBackend;

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<State>, DockyardError> {
        Ok(None)
    }

    async fn commit(&self, _snapshot: &SnapshotRef<'_>) -> Result<(), DockyardError> {
        Ok(())
    }
}

/// One JSON document replaced atomically on every commit
#[derive(Debug)]
pub struct JsonFileBackend {
    file: File,
}

impl JsonFileBackend {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

#[async_trait]
impl StateBackend for JsonFileBackend {
    async fn load(&self) -> Result<Option<State>, DockyardError> {
        if !self.file.exists().await {
            return Ok(None);
        }
        let state = self.file.read_json::<State>().await.map_err(|e| {
            DockyardError::StorageError(format!(
                "unable to load {}: {}",
                self.file.path().display(),
                e
            ))
        })?;
        Ok(Some(state))
    }

    async fn commit(&self, snapshot: &SnapshotRef<'_>) -> Result<(), DockyardError> {
        self.file.write_json_atomic(snapshot).await
    }
}
