//! Privilege checks for security-sensitive context changes.
//!
//! - No IO
//! - No panics
//! - Pure policy checks on the principal presented at the moment of the call

use serde::Serialize;
use thiserror::Error;

use tackroom_core::PrincipalId;

use crate::{Principal, Role};

/// Rejected attempt to enable bypass mode or escalate a role.
///
/// Always propagated; callers must never downgrade this into a warning.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[error("privilege violation: principal '{principal_id}' with role {role} attempted {attempted} (requires {required})")]
pub struct PrivilegeViolationError {
    pub principal_id: PrincipalId,
    pub role: Role,
    pub required: Role,
    pub attempted: &'static str,
}

/// Proof that a principal held the `Supervisor` role when it was checked.
///
/// Only [`require_supervisor`] can mint one, which is what lets session
/// contexts demand it before turning on bypass mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorProof {
    principal_id: PrincipalId,
}

impl SupervisorProof {
    pub fn principal_id(&self) -> &PrincipalId {
        &self.principal_id
    }
}

/// Require the `Supervisor` role for `attempted`.
pub fn require_supervisor(
    principal: &Principal,
    attempted: &'static str,
) -> Result<SupervisorProof, PrivilegeViolationError> {
    require_role_at_least(principal, Role::Supervisor, attempted)?;
    Ok(SupervisorProof {
        principal_id: principal.id.clone(),
    })
}

/// Require `principal.role >= required` in privilege order.
pub fn require_role_at_least(
    principal: &Principal,
    required: Role,
    attempted: &'static str,
) -> Result<(), PrivilegeViolationError> {
    if principal.role.at_least(required) {
        Ok(())
    } else {
        Err(PrivilegeViolationError {
            principal_id: principal.id.clone(),
            role: principal.role,
            required,
            attempted,
        })
    }
}
