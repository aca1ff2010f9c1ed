//! Session context model.
//!
//! [`SessionContext`] is what gets written to a connection; [`ContextSnapshot`]
//! is what reading it back yields. Writing always covers every variable, so
//! nothing from a previous context (a factory id after switching to a fitter,
//! a bypass flag after leaving a supervisor context) can survive.

use serde::{Deserialize, Serialize};

use tackroom_auth::{Principal, Role, SupervisorProof};
use tackroom_core::{FactoryId, FitterId, TenantId};

use crate::context_store::SessionVariable;

use super::error::SecurityError;

/// Resolved identity/role/tenant facts for one request.
///
/// Fields are private so the role-specific invariants hold by construction:
///
/// - `factory_id` is only set for [`Role::Factory`];
/// - `fitter_id` is only set for [`Role::Fitter`];
/// - `bypass_mode` is only set for [`Role::Supervisor`], and only with a
///   [`SupervisorProof`] minted for the same principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionContext {
    user_id: String,
    role: Role,
    factory_id: Option<FactoryId>,
    fitter_id: Option<FitterId>,
    tenant_id: Option<TenantId>,
    organization_id: Option<String>,
    parent_tenant_id: Option<TenantId>,
    bypass_mode: bool,
}

impl SessionContext {
    /// Safe defaults: no identity, `User` role, no scopes, no bypass.
    pub fn cleared() -> Self {
        Self {
            user_id: String::new(),
            role: Role::DEFAULT,
            factory_id: None,
            fitter_id: None,
            tenant_id: None,
            organization_id: None,
            parent_tenant_id: None,
            bypass_mode: false,
        }
    }

    /// Base context for a principal. Scope claims that do not belong to the
    /// principal's role are dropped, never carried over.
    pub fn for_principal(principal: &Principal) -> Self {
        let factory_id = match principal.role {
            Role::Factory => principal.factory_id.clone(),
            _ => None,
        };
        let fitter_id = match principal.role {
            Role::Fitter => principal.fitter_id.clone(),
            _ => None,
        };

        Self {
            user_id: principal.id.to_string(),
            role: principal.role,
            factory_id,
            fitter_id,
            tenant_id: principal.tenant_id.clone(),
            organization_id: None,
            parent_tenant_id: None,
            bypass_mode: false,
        }
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_parent_tenant(mut self, parent_tenant_id: TenantId) -> Self {
        self.parent_tenant_id = Some(parent_tenant_id);
        self
    }

    /// Turn on bypass mode. The proof must belong to this context's user and
    /// the context must carry the supervisor role.
    pub fn with_bypass(mut self, proof: &SupervisorProof) -> Result<Self, SecurityError> {
        if self.role != Role::Supervisor || proof.principal_id().as_str() != self.user_id {
            return Err(SecurityError::scope_mismatch(
                "bypass proof does not match the context's supervisor identity",
            ));
        }
        self.bypass_mode = true;
        Ok(self)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn user_role_code(&self) -> i16 {
        self.role.code()
    }

    pub fn factory_id(&self) -> Option<&FactoryId> {
        self.factory_id.as_ref()
    }

    pub fn fitter_id(&self) -> Option<&FitterId> {
        self.fitter_id.as_ref()
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    pub fn organization_id(&self) -> Option<&str> {
        self.organization_id.as_deref()
    }

    pub fn parent_tenant_id(&self) -> Option<&TenantId> {
        self.parent_tenant_id.as_ref()
    }

    pub fn bypass_mode(&self) -> bool {
        self.bypass_mode
    }

    /// Every session variable with its value; absent values become defaults.
    pub fn to_variables(&self) -> Vec<(SessionVariable, String)> {
        ContextSnapshot::from(self).to_variables()
    }
}

/// Context as read back from a connection.
///
/// Always populated: unset identity is `""`, an unset or unparsable role is
/// the `User` code, unset bypass is `false`. Optional ids are `None` when
/// unset or empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub user_id: String,
    pub user_role: i16,
    pub factory_id: Option<String>,
    pub fitter_id: Option<String>,
    pub tenant_id: Option<String>,
    pub organization_id: Option<String>,
    pub parent_tenant_id: Option<String>,
    pub bypass_mode: bool,
}

impl ContextSnapshot {
    pub fn cleared() -> Self {
        Self::from(&SessionContext::cleared())
    }

    /// Normalize raw `current_setting` values.
    pub fn from_variables(values: &[(SessionVariable, Option<String>)]) -> Self {
        let mut snapshot = Self::cleared();

        for (variable, value) in values {
            let value = value.as_deref().map(str::trim).filter(|v| !v.is_empty());
            match variable {
                SessionVariable::UserId => snapshot.user_id = value.unwrap_or_default().to_string(),
                SessionVariable::UserRole => {
                    snapshot.user_role = value
                        .and_then(|v| v.parse::<i16>().ok())
                        .unwrap_or(Role::DEFAULT.code());
                }
                SessionVariable::TenantId => snapshot.tenant_id = value.map(str::to_string),
                SessionVariable::OrganizationId => snapshot.organization_id = value.map(str::to_string),
                SessionVariable::ParentTenantId => snapshot.parent_tenant_id = value.map(str::to_string),
                SessionVariable::FactoryId => snapshot.factory_id = value.map(str::to_string),
                SessionVariable::FitterId => snapshot.fitter_id = value.map(str::to_string),
                SessionVariable::BypassRls => {
                    snapshot.bypass_mode = matches!(value, Some("true" | "on" | "1" | "t"));
                }
            }
        }

        snapshot
    }

    /// `None` when the stored code is not a known role.
    pub fn role(&self) -> Option<Role> {
        Role::from_code(self.user_role)
    }

    /// Values to write back when restoring this snapshot.
    pub fn to_variables(&self) -> Vec<(SessionVariable, String)> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        vec![
            (SessionVariable::UserId, self.user_id.clone()),
            (SessionVariable::UserRole, self.user_role.to_string()),
            (SessionVariable::TenantId, opt(&self.tenant_id)),
            (SessionVariable::OrganizationId, opt(&self.organization_id)),
            (SessionVariable::ParentTenantId, opt(&self.parent_tenant_id)),
            (SessionVariable::FactoryId, opt(&self.factory_id)),
            (SessionVariable::FitterId, opt(&self.fitter_id)),
            (SessionVariable::BypassRls, self.bypass_mode.to_string()),
        ]
    }
}

impl From<&SessionContext> for ContextSnapshot {
    fn from(ctx: &SessionContext) -> Self {
        Self {
            user_id: ctx.user_id.clone(),
            user_role: ctx.role.code(),
            factory_id: ctx.factory_id.as_ref().map(ToString::to_string),
            fitter_id: ctx.fitter_id.as_ref().map(ToString::to_string),
            tenant_id: ctx.tenant_id.as_ref().map(ToString::to_string),
            organization_id: ctx.organization_id.clone(),
            parent_tenant_id: ctx.parent_tenant_id.as_ref().map(ToString::to_string),
            bypass_mode: ctx.bypass_mode,
        }
    }
}
