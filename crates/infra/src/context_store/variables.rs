//! Fixed vocabulary of session variables and protected tables.
//!
//! Row-level security policies in the database consult these variables by
//! name. Nothing outside this allow-list is ever written to, or interpolated
//! into, SQL text.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use tackroom_auth::Role;

/// A session-scoped configuration variable consulted by RLS policies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionVariable {
    UserId,
    UserRole,
    TenantId,
    OrganizationId,
    ParentTenantId,
    FactoryId,
    FitterId,
    BypassRls,
}

impl SessionVariable {
    pub const ALL: [SessionVariable; 8] = [
        SessionVariable::UserId,
        SessionVariable::UserRole,
        SessionVariable::TenantId,
        SessionVariable::OrganizationId,
        SessionVariable::ParentTenantId,
        SessionVariable::FactoryId,
        SessionVariable::FitterId,
        SessionVariable::BypassRls,
    ];

    /// Name as seen by `set_config` / `current_setting`.
    pub const fn name(self) -> &'static str {
        match self {
            SessionVariable::UserId => "app.current_user_id",
            SessionVariable::UserRole => "app.current_user_role",
            SessionVariable::TenantId => "app.current_tenant_id",
            SessionVariable::OrganizationId => "app.current_organization_id",
            SessionVariable::ParentTenantId => "app.parent_tenant_id",
            SessionVariable::FactoryId => "app.current_factory_id",
            SessionVariable::FitterId => "app.current_fitter_id",
            SessionVariable::BypassRls => "app.bypass_rls",
        }
    }

    /// Safe value written on clear/release.
    pub fn default_value(self) -> String {
        match self {
            SessionVariable::UserRole => Role::DEFAULT.code().to_string(),
            SessionVariable::BypassRls => "false".to_string(),
            _ => String::new(),
        }
    }

    /// `(variable, default)` for every variable, in write order.
    pub fn defaults() -> Vec<(SessionVariable, String)> {
        Self::ALL
            .into_iter()
            .map(|v| (v, v.default_value()))
            .collect()
    }
}

impl fmt::Display for SessionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tables guarded by RLS policies.
///
/// The SQL identifiers come from this enum only; compliance queries never
/// splice caller-provided names into statements.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectedTable {
    Orders,
    OrdersSaddles,
    Saddles,
    Factories,
    Fitters,
    Users,
    AuditLog,
}

impl ProtectedTable {
    pub const ALL: [ProtectedTable; 7] = [
        ProtectedTable::Orders,
        ProtectedTable::OrdersSaddles,
        ProtectedTable::Saddles,
        ProtectedTable::Factories,
        ProtectedTable::Fitters,
        ProtectedTable::Users,
        ProtectedTable::AuditLog,
    ];

    pub const fn table_name(self) -> &'static str {
        match self {
            ProtectedTable::Orders => "orders",
            ProtectedTable::OrdersSaddles => "orders_saddles",
            ProtectedTable::Saddles => "saddles",
            ProtectedTable::Factories => "factories",
            ProtectedTable::Fitters => "fitters",
            ProtectedTable::Users => "users",
            ProtectedTable::AuditLog => "audit_log",
        }
    }

    /// Scope columns present on this table.
    pub fn scope_columns(self) -> &'static [ScopeColumn] {
        match self {
            ProtectedTable::Orders => &[ScopeColumn::TenantId, ScopeColumn::FactoryId, ScopeColumn::FitterId],
            ProtectedTable::Saddles => &[ScopeColumn::TenantId, ScopeColumn::FactoryId],
            ProtectedTable::OrdersSaddles
            | ProtectedTable::Factories
            | ProtectedTable::Fitters
            | ProtectedTable::Users
            | ProtectedTable::AuditLog => &[ScopeColumn::TenantId],
        }
    }

    pub fn has_scope_column(self, column: ScopeColumn) -> bool {
        self.scope_columns().contains(&column)
    }
}

impl fmt::Display for ProtectedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for ProtectedTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProtectedTable::ALL
            .into_iter()
            .find(|t| t.table_name() == s.trim())
            .ok_or_else(|| format!("unknown protected table '{s}'"))
    }
}

/// Columns that carry a row's scope.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeColumn {
    TenantId,
    FactoryId,
    FitterId,
}

impl ScopeColumn {
    pub const fn column_name(self) -> &'static str {
        match self {
            ScopeColumn::TenantId => "tenant_id",
            ScopeColumn::FactoryId => "factory_id",
            ScopeColumn::FitterId => "fitter_id",
        }
    }
}
