use serde::{Deserialize, Serialize};

use tackroom_core::{FactoryId, FitterId, PrincipalId, TenantId};

use crate::{JwtClaims, Role};

/// An authenticated caller, resolved from verified token claims.
///
/// Immutable for the lifetime of a request. Optional scopes are taken from
/// the claims as-is: a claim that is absent stays absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub role: Role,
    pub factory_id: Option<FactoryId>,
    pub fitter_id: Option<FitterId>,
    pub tenant_id: Option<TenantId>,
}

impl Principal {
    pub fn new(id: PrincipalId, role: Role) -> Self {
        Self {
            id,
            role,
            factory_id: None,
            fitter_id: None,
            tenant_id: None,
        }
    }

    pub fn with_factory(mut self, factory_id: FactoryId) -> Self {
        self.factory_id = Some(factory_id);
        self
    }

    pub fn with_fitter(mut self, fitter_id: FitterId) -> Self {
        self.fitter_id = Some(fitter_id);
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn is_supervisor(&self) -> bool {
        self.role == Role::Supervisor
    }
}

impl From<JwtClaims> for Principal {
    fn from(claims: JwtClaims) -> Self {
        Self {
            id: claims.sub,
            role: claims.role,
            factory_id: claims.factory_id,
            fitter_id: claims.fitter_id,
            tenant_id: claims.tenant_id,
        }
    }
}
