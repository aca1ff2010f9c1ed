//! Audit boundary: one structured record per successful mutating request.
//!
//! This crate builds entries and defines the sink; the HTTP layer decides
//! when to record and does so off the request path.

pub mod entry;
pub mod sink;

pub use entry::{AuditEntry, AuditVerb, EntityRef, StatusTransition, infer_entity};
pub use sink::{AuditError, AuditSink, InMemoryAuditSink, TracingAuditSink};
