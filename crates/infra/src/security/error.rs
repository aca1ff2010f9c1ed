use thiserror::Error;

use tackroom_auth::PrivilegeViolationError;

use crate::context_store::ContextStoreError;

/// A checked-out connection was not paired with its release, or was shared
/// beyond the request that owns it.
///
/// Unreachable as long as connections are only used through the scoped
/// helpers; reported (and the connection discarded) when it happens anyway.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("connection discipline violated: {0}")]
pub struct ConnectionDisciplineError(pub String);

/// Security context operation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error(transparent)]
    Store(#[from] ContextStoreError),

    /// Must always propagate and reject the operation.
    #[error(transparent)]
    PrivilegeViolation(#[from] PrivilegeViolationError),

    #[error(transparent)]
    ConnectionDiscipline(#[from] ConnectionDisciplineError),

    /// The requested scope does not fit the principal's role or claims.
    #[error("scope mismatch: {0}")]
    ScopeMismatch(String),
}

impl SecurityError {
    pub fn scope_mismatch(msg: impl Into<String>) -> Self {
        Self::ScopeMismatch(msg.into())
    }

    pub fn is_privilege_violation(&self) -> bool {
        matches!(self, SecurityError::PrivilegeViolation(_))
    }
}
