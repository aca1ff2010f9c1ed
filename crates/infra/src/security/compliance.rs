//! Read-only validation and compliance checks.
//!
//! Every check runs on the caller's connection, so it sees exactly what the
//! request's business queries see. Nothing here writes. A failing query is
//! recorded in the report's `errors` and the remaining checks still run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use tackroom_auth::Role;
use tackroom_core::{FactoryId, FitterId, TenantId};

use crate::context_store::{DatabaseSession, ProtectedTable, ScopeColumn, TablePolicy};

use super::manager::SecurityContextManager;
use super::session::ContextSnapshot;

/// A check that could not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckError {
    pub check: String,
    pub message: String,
}

impl CheckError {
    fn new(check: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            check: check.into(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyStatus {
    pub tables: Vec<TablePolicy>,
    pub errors: Vec<CheckError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextValidation {
    pub valid: bool,
    pub snapshot: Option<ContextSnapshot>,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<CheckError>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityViolationKind {
    MissingTable,
    RlsDisabled,
    RlsNotForced,
    NoPolicies,
    LoginRoleBypassesRls,
}

impl IntegrityViolationKind {
    fn recommendation(self) -> &'static str {
        match self {
            IntegrityViolationKind::MissingTable => "create the missing table or remove it from the protected set",
            IntegrityViolationKind::RlsDisabled => "run ALTER TABLE ... ENABLE ROW LEVEL SECURITY",
            IntegrityViolationKind::RlsNotForced => {
                "run ALTER TABLE ... FORCE ROW LEVEL SECURITY so the table owner is also restricted"
            }
            IntegrityViolationKind::NoPolicies => "add a default-deny policy consulting the app.* session variables",
            IntegrityViolationKind::LoginRoleBypassesRls => {
                "connect with a role that is neither superuser nor BYPASSRLS"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityViolation {
    /// `None` for database-wide findings.
    pub table: Option<ProtectedTable>,
    pub kind: IntegrityViolationKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub violations: Vec<IntegrityViolation>,
    pub recommendations: Vec<String>,
    pub errors: Vec<CheckError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakageFinding {
    pub table: ProtectedTable,
    pub foreign_rows: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakageReport {
    pub tenant_id: TenantId,
    pub leaked: bool,
    pub findings: Vec<LeakageFinding>,
    pub errors: Vec<CheckError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessViolation {
    /// `None` when the active context itself is the problem.
    pub table: Option<ProtectedTable>,
    pub foreign_rows: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeAccessReport {
    /// e.g. `factory:f1`.
    pub scope: String,
    pub checked_tables: Vec<ProtectedTable>,
    pub violations: Vec<AccessViolation>,
    pub errors: Vec<CheckError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceReport {
    pub tenant_id: TenantId,
    pub generated_at: DateTime<Utc>,
    pub compliant: bool,
    pub policy_status: PolicyStatus,
    pub context: ContextValidation,
    pub integrity: IntegrityReport,
    pub leakage: LeakageReport,
    pub recommendations: Vec<String>,
}

impl SecurityContextManager {
    /// RLS state of every protected table.
    pub async fn check_policy_status<C>(&self, conn: &mut C) -> PolicyStatus
    where
        C: DatabaseSession + ?Sized,
    {
        let mut tables = Vec::new();
        let mut errors = Vec::new();

        for table in self.protected_tables() {
            match conn.table_policy(*table).await {
                Ok(policy) => tables.push(policy),
                Err(e) => errors.push(CheckError::new(format!("policy_status:{table}"), e)),
            }
        }

        PolicyStatus { tables, errors }
    }

    /// Check the active context's role/scope consistency.
    pub async fn validate_security_context<C>(&self, conn: &mut C) -> ContextValidation
    where
        C: DatabaseSession + ?Sized,
    {
        let snapshot = match self.read_context(conn).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return ContextValidation {
                    valid: false,
                    snapshot: None,
                    violations: Vec::new(),
                    warnings: Vec::new(),
                    errors: vec![CheckError::new("read_context", e)],
                };
            }
        };

        let (violations, warnings) = context_findings(&snapshot);
        ContextValidation {
            valid: violations.is_empty(),
            snapshot: Some(snapshot),
            violations,
            warnings,
            errors: Vec::new(),
        }
    }

    /// Every protected table must exist, have RLS enabled and forced, and
    /// carry at least one policy; the login role must not bypass RLS.
    #[instrument(skip_all, fields(connection_id = %conn.connection_id()))]
    pub async fn validate_rls_policy_integrity<C>(&self, conn: &mut C) -> IntegrityReport
    where
        C: DatabaseSession + ?Sized,
    {
        let status = self.check_policy_status(conn).await;
        let mut errors = status.errors;
        let mut violations: Vec<IntegrityViolation> = status.tables.iter().flat_map(table_findings).collect();

        match conn.login_role_bypasses_rls().await {
            Ok(true) => violations.push(IntegrityViolation {
                table: None,
                kind: IntegrityViolationKind::LoginRoleBypassesRls,
                message: "the connection's login role ignores every RLS policy".to_string(),
            }),
            Ok(false) => {}
            Err(e) => errors.push(CheckError::new("login_role", e)),
        }

        let recommendations = recommendations_for(&violations);
        if !violations.is_empty() {
            tracing::warn!(count = violations.len(), "RLS policy integrity violations found");
        }

        IntegrityReport {
            valid: violations.is_empty() && errors.is_empty(),
            violations,
            recommendations,
            errors,
        }
    }

    /// Rows of other tenants visible under the active context.
    pub async fn detect_data_leakage<C>(&self, tenant_id: &TenantId, conn: &mut C) -> LeakageReport
    where
        C: DatabaseSession + ?Sized,
    {
        let (findings, errors) =
            self.count_outside_scope(conn, ScopeColumn::TenantId, tenant_id.as_str(), "leakage").await;

        let findings: Vec<LeakageFinding> = findings
            .into_iter()
            .map(|(table, foreign_rows)| LeakageFinding { table, foreign_rows })
            .collect();

        if !findings.is_empty() {
            tracing::warn!(%tenant_id, tables = findings.len(), "cross-tenant rows visible");
        }

        LeakageReport {
            tenant_id: tenant_id.clone(),
            leaked: !findings.is_empty(),
            findings,
            errors,
        }
    }

    /// Orders (and saddles) of other factories visible under the active context.
    pub async fn validate_factory_order_access<C>(&self, factory_id: &FactoryId, conn: &mut C) -> ScopeAccessReport
    where
        C: DatabaseSession + ?Sized,
    {
        let scope = format!("factory:{factory_id}");
        let mut report = self
            .scope_access(conn, ScopeColumn::FactoryId, factory_id.as_str(), scope)
            .await;

        match self.read_context(conn).await {
            Ok(snapshot) if snapshot.factory_id.as_deref() != Some(factory_id.as_str()) => {
                report.violations.push(AccessViolation {
                    table: None,
                    foreign_rows: 0,
                    message: format!("active context is not scoped to factory '{factory_id}'"),
                });
            }
            Ok(_) => {}
            Err(e) => report.errors.push(CheckError::new("read_context", e)),
        }
        report
    }

    /// Orders of other fitters visible under the active context.
    pub async fn validate_fitter_order_access<C>(&self, fitter_id: &FitterId, conn: &mut C) -> ScopeAccessReport
    where
        C: DatabaseSession + ?Sized,
    {
        let scope = format!("fitter:{fitter_id}");
        let mut report = self
            .scope_access(conn, ScopeColumn::FitterId, fitter_id.as_str(), scope)
            .await;

        match self.read_context(conn).await {
            Ok(snapshot) if snapshot.fitter_id.as_deref() != Some(fitter_id.as_str()) => {
                report.violations.push(AccessViolation {
                    table: None,
                    foreign_rows: 0,
                    message: format!("active context is not scoped to fitter '{fitter_id}'"),
                });
            }
            Ok(_) => {}
            Err(e) => report.errors.push(CheckError::new("read_context", e)),
        }
        report
    }

    /// All checks for one tenant in one report.
    #[instrument(skip_all, fields(%tenant_id, connection_id = %conn.connection_id()))]
    pub async fn generate_compliance_report<C>(&self, tenant_id: &TenantId, conn: &mut C) -> ComplianceReport
    where
        C: DatabaseSession + ?Sized,
    {
        let policy_status = self.check_policy_status(conn).await;
        let context = self.validate_security_context(conn).await;
        let integrity = self.validate_rls_policy_integrity(conn).await;
        let leakage = self.detect_data_leakage(tenant_id, conn).await;

        let mut recommendations = integrity.recommendations.clone();
        if leakage.leaked {
            recommendations.push(format!(
                "review tenant policies: rows outside tenant '{tenant_id}' are visible"
            ));
        }
        if !context.violations.is_empty() {
            recommendations.push("re-apply the security context from the authenticated principal".to_string());
        }
        let failed_checks = policy_status.errors.len() + context.errors.len() + leakage.errors.len();
        if failed_checks > 0 {
            recommendations.push(format!("{failed_checks} check(s) could not run; see errors"));
        }

        let compliant = integrity.valid && context.valid && !leakage.leaked && failed_checks == 0;
        tracing::info!(compliant, "compliance report generated");

        ComplianceReport {
            tenant_id: tenant_id.clone(),
            generated_at: Utc::now(),
            compliant,
            policy_status,
            context,
            integrity,
            leakage,
            recommendations,
        }
    }

    async fn scope_access<C>(&self, conn: &mut C, column: ScopeColumn, value: &str, scope: String) -> ScopeAccessReport
    where
        C: DatabaseSession + ?Sized,
    {
        let checked_tables: Vec<ProtectedTable> = self
            .protected_tables()
            .iter()
            .copied()
            .filter(|t| t.has_scope_column(column))
            .collect();

        let (outside, errors) = self.count_outside_scope(conn, column, value, "scope_access").await;
        let violations = outside
            .into_iter()
            .map(|(table, foreign_rows)| AccessViolation {
                table: Some(table),
                foreign_rows,
                message: format!("{foreign_rows} row(s) in '{table}' outside {scope}"),
            })
            .collect();

        ScopeAccessReport {
            scope,
            checked_tables,
            violations,
            errors,
        }
    }

    /// Non-zero "visible rows outside `value`" counts per table having `column`.
    async fn count_outside_scope<C>(
        &self,
        conn: &mut C,
        column: ScopeColumn,
        value: &str,
        check: &str,
    ) -> (Vec<(ProtectedTable, i64)>, Vec<CheckError>)
    where
        C: DatabaseSession + ?Sized,
    {
        let mut found = Vec::new();
        let mut errors = Vec::new();

        for table in self.protected_tables().iter().filter(|t| t.has_scope_column(column)) {
            match conn.count_rows_outside(*table, column, value).await {
                Ok(0) => {}
                Ok(n) => found.push((*table, n)),
                Err(e) => errors.push(CheckError::new(format!("{check}:{table}"), e)),
            }
        }

        (found, errors)
    }
}

fn context_findings(snapshot: &ContextSnapshot) -> (Vec<String>, Vec<String>) {
    let mut violations = Vec::new();
    let mut warnings = Vec::new();

    let Some(role) = snapshot.role() else {
        violations.push(format!("unknown role code {}", snapshot.user_role));
        return (violations, warnings);
    };

    if snapshot.factory_id.is_some() && role != Role::Factory {
        violations.push(format!("factory scope set for role {role}"));
    }
    if snapshot.fitter_id.is_some() && role != Role::Fitter {
        violations.push(format!("fitter scope set for role {role}"));
    }
    if snapshot.bypass_mode && role != Role::Supervisor {
        violations.push(format!("RLS bypass enabled for role {role}"));
    }
    if role == Role::Factory && snapshot.factory_id.is_none() {
        violations.push("FACTORY context without a factory id".to_string());
    }
    if role == Role::Fitter && snapshot.fitter_id.is_none() {
        violations.push("FITTER context without a fitter id".to_string());
    }

    if snapshot.user_id.is_empty() {
        warnings.push("no user context applied".to_string());
    }
    if snapshot.bypass_mode {
        warnings.push("RLS bypass mode is active".to_string());
    }
    if snapshot.parent_tenant_id.is_some() && snapshot.tenant_id.is_none() {
        warnings.push("parent tenant set without a tenant".to_string());
    }

    (violations, warnings)
}

fn table_findings(policy: &TablePolicy) -> Vec<IntegrityViolation> {
    let table = policy.table;
    let finding = |kind: IntegrityViolationKind, message: String| IntegrityViolation {
        table: Some(table),
        kind,
        message,
    };

    if !policy.exists {
        return vec![finding(
            IntegrityViolationKind::MissingTable,
            format!("protected table '{table}' does not exist"),
        )];
    }

    let mut out = Vec::new();
    if !policy.rls_enabled {
        out.push(finding(
            IntegrityViolationKind::RlsDisabled,
            format!("row level security is disabled on '{table}'"),
        ));
    } else if !policy.rls_forced {
        out.push(finding(
            IntegrityViolationKind::RlsNotForced,
            format!("row level security is not forced on '{table}'"),
        ));
    }
    if policy.policies.is_empty() {
        out.push(finding(
            IntegrityViolationKind::NoPolicies,
            format!("'{table}' has no policies"),
        ));
    }
    out
}

fn recommendations_for(violations: &[IntegrityViolation]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for v in violations {
        let text = match v.table {
            Some(table) => format!("{table}: {}", v.kind.recommendation()),
            None => v.kind.recommendation().to_string(),
        };
        if !out.contains(&text) {
            out.push(text);
        }
    }
    out
}
