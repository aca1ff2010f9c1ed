//! Per-request security context: model, manager and compliance checks.
//!
//! The manager never keeps per-request state. Callers pass the connection
//! the request has pinned, and every read, write and check runs on it.

pub mod compliance;
pub mod error;
pub mod manager;
pub mod session;

pub use compliance::{
    AccessViolation, CheckError, ComplianceReport, ContextValidation, IntegrityReport, IntegrityViolation,
    IntegrityViolationKind, LeakageFinding, LeakageReport, PolicyStatus, ScopeAccessReport,
};
pub use error::{ConnectionDisciplineError, SecurityError};
pub use manager::SecurityContextManager;
pub use session::{ContextSnapshot, SessionContext};
