use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use super::entry::AuditEntry;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("audit entry rejected: {0}")]
    Rejected(String),
}

/// Receives audit entries. Persistence belongs to the implementation.
///
/// Callers treat recording as best effort: an error is logged, never
/// surfaced to the request that produced the entry.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

/// Emits each entry as a structured `tracing` event on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        tracing::info!(
            target: "audit",
            entry_id = %entry.entry_id,
            actor_id = %entry.actor_id,
            actor_type = entry.actor_type,
            verb = %entry.verb,
            action = %entry.action,
            entity_type = entry.entity_type.as_deref().unwrap_or(""),
            entity_id = entry.entity_id.as_deref().unwrap_or(""),
            status_from = entry.status_from.as_deref().unwrap_or(""),
            status_to = entry.status_to.as_deref().unwrap_or(""),
            occurred_at = %entry.occurred_at,
            "audit"
        );
        Ok(())
    }
}

/// Collects entries in memory (dev/test).
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
    failing: AtomicBool,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Make every subsequent `record` fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("in-memory sink set to fail".to_string()));
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditVerb, infer_entity};
    use tackroom_auth::{Principal, Role};
    use tackroom_core::PrincipalId;

    fn entry() -> AuditEntry {
        let actor = Principal::new(PrincipalId::new("u1").unwrap(), Role::Admin);
        AuditEntry::new(&actor, AuditVerb::Deleted, infer_entity("/saddles/9"), None)
    }

    #[tokio::test]
    async fn in_memory_sink_keeps_entries_in_order() {
        let sink = InMemoryAuditSink::new();
        let first = entry();
        let second = entry();
        sink.record(first.clone()).await.unwrap();
        sink.record(second.clone()).await.unwrap();
        assert_eq!(sink.entries(), vec![first, second]);
    }

    #[tokio::test]
    async fn failing_sink_reports_and_stores_nothing() {
        let sink = InMemoryAuditSink::new();
        sink.set_failing(true);
        assert!(matches!(sink.record(entry()).await, Err(AuditError::Unavailable(_))));
        assert!(sink.entries().is_empty());
    }

    #[tokio::test]
    async fn tracing_sink_accepts_entries() {
        assert_eq!(TracingAuditSink.record(entry()).await, Ok(()));
    }
}
