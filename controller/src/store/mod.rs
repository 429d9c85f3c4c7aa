//! Transactional state store
//!
//! Entities and the audit log live in memory behind one lock. Every mutation
//! runs in [`Store::transact`] against a draft; the draft is persisted through
//! the [`StateBackend`] as a whole and only then published, so a mutation and
//! the audit events staged with it become visible together or not at all.

pub mod backend;
pub mod tables;

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

use crate::errors::DockyardError;
use crate::models::audit::AuditEvent;
use crate::store::backend::{SnapshotRef, State, StateBackend};
use crate::store::tables::Tables;

/// In-flight transaction over a draft of the tables
pub struct Transaction<'a> {
    tables: Tables,
    committed: &'a [AuditEvent],
    staged: Vec<AuditEvent>,
    anonymized: Vec<Uuid>,
}

impl<'a> Transaction<'a> {
    fn begin(state: &'a State) -> Self {
        Self {
            tables: state.tables.clone(),
            committed: &state.audit,
            staged: Vec::new(),
            anonymized: Vec::new(),
        }
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut Tables {
        &mut self.tables
    }

    /// Most recent audit event, staged or committed
    pub fn last_audit(&self) -> Option<&AuditEvent> {
        self.staged.last().or_else(|| self.committed.last())
    }

    /// Stage an audit event; only the audit recorder builds these
    pub(crate) fn stage_audit(&mut self, event: AuditEvent) {
        self.staged.push(event);
    }

    /// Null the actor of every event recorded by `user_id`
    pub(crate) fn anonymize_actor(&mut self, user_id: Uuid) {
        if !self.anonymized.contains(&user_id) {
            self.anonymized.push(user_id);
        }
    }
}

/// The controller's state store
pub struct Store {
    state: RwLock<State>,
    backend: Arc<dyn StateBackend>,
}

impl Store {
    /// Open the store, restoring the last committed state from `backend`
    pub async fn open(backend: Arc<dyn StateBackend>) -> Result<Self, DockyardError> {
        let state = backend.load().await?.unwrap_or_default();
        debug!(
            "Store opened with {} hosts, {} users, {} audit events",
            state.tables.hosts.len(),
            state.tables.users.len(),
            state.audit.len()
        );
        Ok(Self {
            state: RwLock::new(state),
            backend,
        })
    }

    /// Run `f` over a consistent view of the current state
    pub async fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let state = self.state.read().await;
        f(&state)
    }

    /// Run `f` in a transaction and commit its effects atomically
    ///
    /// If `f` fails or the commit cannot be persisted, the published state is
    /// left untouched. A failed commit that carried audit events surfaces as
    /// [`DockyardError::AuditPersistence`].
    pub async fn transact<R, F>(&self, f: F) -> Result<R, DockyardError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R, DockyardError>,
    {
        let mut state = self.state.write().await;

        let (output, tables, staged, anonymized) = {
            let mut tx = Transaction::begin(&state);
            let output = f(&mut tx)?;

            let snapshot = SnapshotRef {
                tables: &tx.tables,
                committed: tx.committed,
                staged: &tx.staged,
                anonymized: &tx.anonymized,
            };
            if let Err(e) = self.backend.commit(&snapshot).await {
                if tx.staged.is_empty() {
                    return Err(DockyardError::StorageError(e.to_string()));
                }
                error!(
                    "Rolling back transaction, audit events could not be persisted: {}",
                    e
                );
                return Err(DockyardError::AuditPersistence);
            }

            (output, tx.tables, tx.staged, tx.anonymized)
        };

        state.tables = tables;
        if !anonymized.is_empty() {
            for event in state.audit.iter_mut() {
                if event.actor.is_some_and(|actor| anonymized.contains(&actor)) {
                    event.actor = None;
                }
            }
        }
        state.audit.extend(staged);

        Ok(output)
    }
}
