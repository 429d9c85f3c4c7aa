//! Audit recorder
//!
//! Events are staged into the same [`Transaction`] as the mutation they
//! describe, so either both persist or neither does.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::errors::DockyardError;
use crate::models::audit::{AuditEvent, AuditEventKind, NewAuditEvent};
use crate::store::{Store, Transaction};

/// Audit query filter; every set field must match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub kind: Option<AuditEventKind>,
    pub actor: Option<Uuid>,
    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.kind.is_none_or(|kind| event.kind == kind)
            && self.actor.is_none_or(|actor| event.actor == Some(actor))
            && self.since.is_none_or(|since| event.timestamp >= since)
            && self.until.is_none_or(|until| event.timestamp < until)
    }
}

/// Pagination parameters for list queries
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// A page of results
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Appends and queries audit events
pub struct AuditRecorder {
    store: Arc<Store>,
    max_page_size: usize,
}

impl AuditRecorder {
    pub fn new(store: Arc<Store>, max_page_size: usize) -> Self {
        Self {
            store,
            max_page_size: max_page_size.max(1),
        }
    }

    /// Stage `event` in `tx`, returning its sequence number
    ///
    /// Timestamps never go backwards relative to the log so that timestamp
    /// order and sequence order agree.
    pub fn record(&self, tx: &mut Transaction<'_>, event: NewAuditEvent) -> u64 {
        let (sequence, timestamp) = match tx.last_audit() {
            Some(last) => (last.sequence + 1, Utc::now().max(last.timestamp)),
            None => (1, Utc::now()),
        };

        debug!(
            "Audit #{} {:?} ({:?}) by {:?}",
            sequence, event.kind, event.outcome, event.actor
        );

        tx.stage_audit(AuditEvent {
            sequence,
            id: Uuid::new_v4(),
            timestamp,
            actor: event.actor,
            kind: event.kind,
            outcome: event.outcome,
            resource: event.resource,
            detail: event.detail,
            origin: event.origin,
        });
        sequence
    }

    /// Record an event that has no paired state mutation
    pub async fn record_standalone(&self, event: NewAuditEvent) -> Result<u64, DockyardError> {
        self.store.transact(|tx| Ok(self.record(tx, event))).await
    }

    /// Events matching `filter`, ordered by timestamp ascending
    pub async fn query(&self, filter: &AuditFilter, pagination: Pagination) -> Page<AuditEvent> {
        let limit = pagination.limit.clamp(1, self.max_page_size);
        self.store
            .read(|state| {
                let mut total = 0;
                let mut items = Vec::new();
                for event in state.audit.iter().filter(|e| filter.matches(e)) {
                    if total >= pagination.offset && items.len() < limit {
                        items.push(event.clone());
                    }
                    total += 1;
                }
                Page {
                    items,
                    total,
                    offset: pagination.offset,
                    limit,
                }
            })
            .await
    }
}
