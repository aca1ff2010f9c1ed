//! Security context manager.
//!
//! Turns a [`Principal`] into a [`SessionContext`] and writes it to the
//! request's connection. Every operation takes that connection explicitly;
//! the manager holds no per-request state.
//!
//! Privilege checks happen here even when the HTTP layer already checked:
//! bypass mode and role escalation require the caller to be a supervisor at
//! the moment of the call.

use tracing::instrument;

use tackroom_auth::{Principal, PrivilegeViolationError, Role, require_supervisor};
use tackroom_core::TenantId;

use crate::config::SecurityConfig;
use crate::context_store::{BoxFuture, ProtectedTable, SessionConnection, SessionVariable};

use super::error::SecurityError;
use super::session::{ContextSnapshot, SessionContext};

/// Builds, applies, reads and validates per-connection security contexts.
#[derive(Debug, Clone)]
pub struct SecurityContextManager {
    protected_tables: Vec<ProtectedTable>,
}

impl Default for SecurityContextManager {
    fn default() -> Self {
        Self::new(ProtectedTable::ALL.to_vec())
    }
}

impl SecurityContextManager {
    /// Manager inspecting `protected_tables` in compliance checks.
    pub fn new(protected_tables: Vec<ProtectedTable>) -> Self {
        Self { protected_tables }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.protected_tables.clone())
    }

    pub fn protected_tables(&self) -> &[ProtectedTable] {
        &self.protected_tables
    }

    /// Apply `principal`'s base context. Idempotent.
    #[instrument(
        skip_all,
        fields(
            principal_id = %principal.id,
            role = %principal.role,
            connection_id = %conn.connection_id()
        ),
        err
    )]
    pub async fn apply_context<C>(&self, principal: &Principal, conn: &mut C) -> Result<SessionContext, SecurityError>
    where
        C: SessionConnection + ?Sized,
    {
        let context = SessionContext::for_principal(principal);
        write_context(&context, conn).await?;
        Ok(context)
    }

    /// Reset every variable to its safe default.
    #[instrument(skip_all, fields(connection_id = %conn.connection_id()), err)]
    pub async fn clear_context<C>(&self, conn: &mut C) -> Result<(), SecurityError>
    where
        C: SessionConnection + ?Sized,
    {
        write_context(&SessionContext::cleared(), conn).await
    }

    /// Same as [`SecurityContextManager::clear_context`].
    pub async fn clear_user_context<C>(&self, conn: &mut C) -> Result<(), SecurityError>
    where
        C: SessionConnection + ?Sized,
    {
        self.clear_context(conn).await
    }

    /// Read all variables back, normalized.
    pub async fn read_context<C>(&self, conn: &mut C) -> Result<ContextSnapshot, SecurityError>
    where
        C: SessionConnection + ?Sized,
    {
        let values = conn.get_variables(&SessionVariable::ALL).await?;
        Ok(ContextSnapshot::from_variables(&values))
    }

    /// Same as [`SecurityContextManager::read_context`].
    pub async fn current_context<C>(&self, conn: &mut C) -> Result<ContextSnapshot, SecurityError>
    where
        C: SessionConnection + ?Sized,
    {
        self.read_context(conn).await
    }

    /// Run `f` under `principal`'s context, then restore the previous one.
    ///
    /// The previous context is restored whether `f` succeeds or fails. Each
    /// call keeps its own snapshot, so nested calls unwind in LIFO order.
    ///
    /// Switching to a role more privileged than the active one requires the
    /// active context to be a supervisor; otherwise nothing is written and a
    /// privilege violation is returned.
    ///
    /// If both `f` and the restore fail, `f`'s error is returned and the
    /// connection is poisoned so it is not reused with the wrong context.
    pub async fn run_with_temporary_context<C, F, T, E>(
        &self,
        principal: &Principal,
        conn: &mut C,
        f: F,
    ) -> Result<T, E>
    where
        C: SessionConnection + ?Sized,
        F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<T, E>>,
        E: From<SecurityError>,
    {
        let previous = self.read_context(conn).await?;
        let active_role = previous.role().unwrap_or(Role::DEFAULT);

        if principal.role > active_role && active_role != Role::Supervisor {
            tracing::warn!(
                principal_id = %principal.id,
                target_role = %principal.role,
                active_role = %active_role,
                "rejected temporary context escalation"
            );
            return Err(SecurityError::from(PrivilegeViolationError {
                principal_id: principal.id.clone(),
                role: active_role,
                required: Role::Supervisor,
                attempted: "switch to a more privileged temporary context",
            })
            .into());
        }

        self.apply_context(principal, conn).await?;

        let result = f(&mut *conn).await;

        match conn.set_variables(&previous.to_variables()).await {
            Ok(()) => result,
            Err(e) => {
                tracing::error!(
                    connection_id = %conn.connection_id(),
                    error = %e,
                    "failed to restore security context after temporary execution"
                );
                conn.poison();
                match result {
                    Ok(_) => Err(SecurityError::from(e).into()),
                    Err(original) => Err(original),
                }
            }
        }
    }

    /// Base context plus tenant scope.
    pub async fn set_tenant_context<C>(
        &self,
        principal: &Principal,
        tenant_id: &TenantId,
        conn: &mut C,
    ) -> Result<SessionContext, SecurityError>
    where
        C: SessionConnection + ?Sized,
    {
        let context = SessionContext::for_principal(principal)
            .with_tenant(tenant_id.clone())
            .with_organization(tenant_id.to_string());
        write_context(&context, conn).await?;
        Ok(context)
    }

    /// Tenant scope nested under a parent tenant.
    pub async fn set_hierarchical_tenant_context<C>(
        &self,
        principal: &Principal,
        tenant_id: &TenantId,
        parent_tenant_id: &TenantId,
        conn: &mut C,
    ) -> Result<SessionContext, SecurityError>
    where
        C: SessionConnection + ?Sized,
    {
        if tenant_id == parent_tenant_id {
            return Err(SecurityError::scope_mismatch(format!(
                "tenant '{tenant_id}' cannot be its own parent"
            )));
        }

        let context = SessionContext::for_principal(principal)
            .with_tenant(tenant_id.clone())
            .with_organization(tenant_id.to_string())
            .with_parent_tenant(parent_tenant_id.clone());
        write_context(&context, conn).await?;
        Ok(context)
    }

    /// Tenant scope for a factory principal; the factory is the organization.
    pub async fn set_factory_tenant_context<C>(
        &self,
        principal: &Principal,
        tenant_id: &TenantId,
        conn: &mut C,
    ) -> Result<SessionContext, SecurityError>
    where
        C: SessionConnection + ?Sized,
    {
        let factory_id = match (principal.role, &principal.factory_id) {
            (Role::Factory, Some(factory_id)) => factory_id,
            (Role::Factory, None) => {
                return Err(SecurityError::scope_mismatch(format!(
                    "principal '{}' has no factory claim",
                    principal.id
                )));
            }
            (role, _) => {
                return Err(SecurityError::scope_mismatch(format!(
                    "factory context requires role FACTORY, principal '{}' is {role}",
                    principal.id
                )));
            }
        };

        let context = SessionContext::for_principal(principal)
            .with_tenant(tenant_id.clone())
            .with_organization(factory_id.to_string());
        write_context(&context, conn).await?;
        Ok(context)
    }

    /// Tenant scope for a fitter principal; the fitter is the organization.
    pub async fn set_fitter_tenant_context<C>(
        &self,
        principal: &Principal,
        tenant_id: &TenantId,
        conn: &mut C,
    ) -> Result<SessionContext, SecurityError>
    where
        C: SessionConnection + ?Sized,
    {
        let fitter_id = match (principal.role, &principal.fitter_id) {
            (Role::Fitter, Some(fitter_id)) => fitter_id,
            (Role::Fitter, None) => {
                return Err(SecurityError::scope_mismatch(format!(
                    "principal '{}' has no fitter claim",
                    principal.id
                )));
            }
            (role, _) => {
                return Err(SecurityError::scope_mismatch(format!(
                    "fitter context requires role FITTER, principal '{}' is {role}",
                    principal.id
                )));
            }
        };

        let context = SessionContext::for_principal(principal)
            .with_tenant(tenant_id.clone())
            .with_organization(fitter_id.to_string());
        write_context(&context, conn).await?;
        Ok(context)
    }

    /// Supervisor context with RLS bypass turned on.
    ///
    /// The supervisor check is done here, before anything is written; a
    /// rejected call leaves the active context exactly as it was.
    #[instrument(
        skip_all,
        fields(
            principal_id = %principal.id,
            role = %principal.role,
            connection_id = %conn.connection_id()
        ),
        err
    )]
    pub async fn set_admin_bypass_context<C>(
        &self,
        principal: &Principal,
        conn: &mut C,
    ) -> Result<SessionContext, SecurityError>
    where
        C: SessionConnection + ?Sized,
    {
        let proof = require_supervisor(principal, "enable RLS bypass mode").inspect_err(|e| {
            tracing::warn!(error = %e, "rejected RLS bypass request");
        })?;

        let context = SessionContext::for_principal(principal).with_bypass(&proof)?;
        write_context(&context, conn).await?;
        tracing::info!("RLS bypass mode enabled");
        Ok(context)
    }
}

/// Full overwrite of every variable, all-or-nothing.
async fn write_context<C>(context: &SessionContext, conn: &mut C) -> Result<(), SecurityError>
where
    C: SessionConnection + ?Sized,
{
    conn.set_variables(&context.to_variables()).await?;
    tracing::debug!(
        connection_id = %conn.connection_id(),
        user_id = context.user_id(),
        role = %context.role(),
        "security context written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tackroom_core::{FactoryId, FitterId, PrincipalId};

    use crate::context_store::{ContextStore, InMemoryContextStore};

    fn principal(id: &str, role: Role) -> Principal {
        Principal::new(PrincipalId::new(id).unwrap(), role)
    }

    fn factory(id: &str, factory_id: &str) -> Principal {
        principal(id, Role::Factory).with_factory(FactoryId::new(factory_id).unwrap())
    }

    fn fitter(id: &str, fitter_id: &str) -> Principal {
        principal(id, Role::Fitter).with_fitter(FitterId::new(fitter_id).unwrap())
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[tokio::test]
    async fn apply_then_read_round_trips() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        let p = factory("u1", "f1").with_tenant(tenant("t1"));
        let applied = manager.apply_context(&p, conn.as_mut()).await.unwrap();
        let read = manager.read_context(conn.as_mut()).await.unwrap();

        assert_eq!(read, ContextSnapshot::from(&applied));
        assert_eq!(read.user_id, "u1");
        assert_eq!(read.user_role, Role::Factory.code());
        assert_eq!(read.factory_id.as_deref(), Some("f1"));
        assert_eq!(read.tenant_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();
        let p = fitter("u2", "fit-9");

        manager.apply_context(&p, conn.as_mut()).await.unwrap();
        let first = manager.read_context(conn.as_mut()).await.unwrap();
        manager.apply_context(&p, conn.as_mut()).await.unwrap();
        let second = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn clear_returns_safe_defaults_after_any_context() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        let boss = principal("boss", Role::Supervisor);
        manager.set_admin_bypass_context(&boss, conn.as_mut()).await.unwrap();
        manager.clear_user_context(conn.as_mut()).await.unwrap();

        let snapshot = manager.current_context(conn.as_mut()).await.unwrap();
        assert_eq!(snapshot, ContextSnapshot::cleared());
        assert_eq!(snapshot.user_id, "");
        assert_eq!(snapshot.user_role, 2);
        assert_eq!(snapshot.factory_id, None);
        assert_eq!(snapshot.fitter_id, None);
        assert!(!snapshot.bypass_mode);
    }

    #[tokio::test]
    async fn switching_roles_never_merges_scope_fields() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        manager.apply_context(&fitter("u1", "fit-1"), conn.as_mut()).await.unwrap();
        manager.apply_context(&factory("u2", "f2"), conn.as_mut()).await.unwrap();
        let snapshot = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(snapshot.factory_id.as_deref(), Some("f2"));
        assert_eq!(snapshot.fitter_id, None);

        manager.apply_context(&fitter("u3", "fit-3"), conn.as_mut()).await.unwrap();
        let snapshot = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(snapshot.fitter_id.as_deref(), Some("fit-3"));
        assert_eq!(snapshot.factory_id, None);
    }

    #[tokio::test]
    async fn claims_for_other_roles_are_not_applied() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        let user = principal("u1", Role::User)
            .with_factory(FactoryId::new("f1").unwrap())
            .with_fitter(FitterId::new("fit-1").unwrap());
        manager.apply_context(&user, conn.as_mut()).await.unwrap();

        let snapshot = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(snapshot.factory_id, None);
        assert_eq!(snapshot.fitter_id, None);
    }

    #[tokio::test]
    async fn non_supervisors_cannot_enable_bypass_and_context_is_untouched() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        for role in [Role::User, Role::Fitter, Role::Factory, Role::Admin] {
            let p = principal("u2", role);
            manager.apply_context(&p, conn.as_mut()).await.unwrap();
            let before = manager.read_context(conn.as_mut()).await.unwrap();

            let err = manager.set_admin_bypass_context(&p, conn.as_mut()).await.unwrap_err();
            assert!(err.is_privilege_violation(), "{role}: {err}");

            let after = manager.read_context(conn.as_mut()).await.unwrap();
            assert_eq!(before, after);
            assert!(!after.bypass_mode);
        }
    }

    #[tokio::test]
    async fn supervisor_gets_bypass() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        let ctx = manager
            .set_admin_bypass_context(&principal("boss", Role::Supervisor), conn.as_mut())
            .await
            .unwrap();
        assert!(ctx.bypass_mode());

        let snapshot = manager.read_context(conn.as_mut()).await.unwrap();
        assert!(snapshot.bypass_mode);
        assert_eq!(snapshot.role(), Some(Role::Supervisor));
    }

    #[tokio::test]
    async fn temporary_context_is_visible_inside_and_restored_after() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        let a = factory("a", "f1");
        let b = factory("b", "f2");
        manager.apply_context(&a, conn.as_mut()).await.unwrap();

        let inner_manager = manager.clone();
        let seen: Result<ContextSnapshot, SecurityError> = manager
            .run_with_temporary_context(&b, conn.as_mut(), move |c| {
                Box::pin(async move { inner_manager.read_context(c).await })
            })
            .await;

        let seen = seen.unwrap();
        assert_eq!(seen.user_id, "b");
        assert_eq!(seen.factory_id.as_deref(), Some("f2"));

        let restored = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(restored.user_id, "a");
        assert_eq!(restored.factory_id.as_deref(), Some("f1"));
    }

    #[tokio::test]
    async fn temporary_context_is_restored_when_the_operation_fails() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        let a = principal("a", Role::Admin);
        let b = principal("b", Role::User);
        manager.apply_context(&a, conn.as_mut()).await.unwrap();

        let result: Result<(), SecurityError> = manager
            .run_with_temporary_context(&b, conn.as_mut(), |_c| {
                Box::pin(async move { Err(SecurityError::scope_mismatch("boom")) })
            })
            .await;
        assert_eq!(result, Err(SecurityError::scope_mismatch("boom")));

        let restored = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(restored.user_id, "a");
        assert_eq!(restored.role(), Some(Role::Admin));
    }

    #[tokio::test]
    async fn nested_temporary_contexts_unwind_in_order() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        manager.apply_context(&principal("outer", Role::Supervisor), conn.as_mut()).await.unwrap();

        let m1 = manager.clone();
        let observed: Result<(String, String), SecurityError> = manager
            .run_with_temporary_context(&principal("middle", Role::Admin), conn.as_mut(), move |c| {
                Box::pin(async move {
                    let m2 = m1.clone();
                    let innermost = m1
                        .run_with_temporary_context(&principal("inner", Role::User), &mut *c, move |c| {
                            Box::pin(async move { m2.read_context(c).await.map(|s| s.user_id) })
                        })
                        .await?;
                    let after_inner = m1.read_context(c).await?.user_id;
                    Ok((innermost, after_inner))
                })
            })
            .await;

        let (innermost, after_inner) = observed.unwrap();
        assert_eq!(innermost, "inner");
        assert_eq!(after_inner, "middle");
        assert_eq!(manager.read_context(conn.as_mut()).await.unwrap().user_id, "outer");
    }

    #[tokio::test]
    async fn temporary_escalation_requires_supervisor() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        manager.apply_context(&principal("u1", Role::User), conn.as_mut()).await.unwrap();
        let before = manager.read_context(conn.as_mut()).await.unwrap();

        let result: Result<(), SecurityError> = manager
            .run_with_temporary_context(&principal("root", Role::Supervisor), conn.as_mut(), |_c| {
                Box::pin(async move { Ok(()) })
            })
            .await;
        assert!(result.unwrap_err().is_privilege_violation());
        assert_eq!(manager.read_context(conn.as_mut()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn failed_restore_poisons_the_connection() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();
        let id = conn.connection_id();

        manager.apply_context(&principal("a", Role::Admin), conn.as_mut()).await.unwrap();

        let store_in = store.clone();
        let result: Result<(), SecurityError> = manager
            .run_with_temporary_context(&principal("b", Role::User), conn.as_mut(), move |_c| {
                Box::pin(async move {
                    store_in.fail_writes_to(SessionVariable::UserId);
                    Ok(())
                })
            })
            .await;
        assert!(matches!(result, Err(SecurityError::Store(_))));

        drop(conn);
        assert!(store.session_variables(id).is_none(), "poisoned session must not return to the pool");
    }

    #[tokio::test]
    async fn tenant_compositions_set_scope_variables() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        manager
            .set_hierarchical_tenant_context(&principal("u1", Role::Admin), &tenant("child"), &tenant("root"), conn.as_mut())
            .await
            .unwrap();
        let s = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(s.tenant_id.as_deref(), Some("child"));
        assert_eq!(s.parent_tenant_id.as_deref(), Some("root"));
        assert_eq!(s.organization_id.as_deref(), Some("child"));

        // Plain tenant context must not keep the parent from the previous call.
        manager
            .set_tenant_context(&principal("u1", Role::Admin), &tenant("solo"), conn.as_mut())
            .await
            .unwrap();
        let s = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(s.tenant_id.as_deref(), Some("solo"));
        assert_eq!(s.parent_tenant_id, None);

        manager
            .set_factory_tenant_context(&factory("u2", "f7"), &tenant("t1"), conn.as_mut())
            .await
            .unwrap();
        let s = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(s.factory_id.as_deref(), Some("f7"));
        assert_eq!(s.organization_id.as_deref(), Some("f7"));
        assert_eq!(s.fitter_id, None);

        manager
            .set_fitter_tenant_context(&fitter("u3", "fit-4"), &tenant("t1"), conn.as_mut())
            .await
            .unwrap();
        let s = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(s.fitter_id.as_deref(), Some("fit-4"));
        assert_eq!(s.factory_id, None);
    }

    #[tokio::test]
    async fn scoped_compositions_reject_mismatched_roles() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        let err = manager
            .set_factory_tenant_context(&fitter("u1", "fit-1"), &tenant("t1"), conn.as_mut())
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::ScopeMismatch(_)));

        let err = manager
            .set_fitter_tenant_context(&principal("u1", Role::Fitter), &tenant("t1"), conn.as_mut())
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::ScopeMismatch(_)));

        let err = manager
            .set_hierarchical_tenant_context(&principal("u1", Role::Admin), &tenant("t1"), &tenant("t1"), conn.as_mut())
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::ScopeMismatch(_)));
    }

    #[tokio::test]
    async fn write_failure_names_the_variable_and_keeps_previous_context() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        manager.apply_context(&factory("a", "f1"), conn.as_mut()).await.unwrap();
        store.fail_writes_to(SessionVariable::FitterId);

        let err = manager
            .apply_context(&fitter("b", "fit-2"), conn.as_mut())
            .await
            .unwrap_err();
        match err {
            SecurityError::Store(e) => assert_eq!(e.variable(), Some(SessionVariable::FitterId)),
            other => panic!("unexpected error: {other:?}"),
        }

        let snapshot = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(snapshot.user_id, "a");
        assert_eq!(snapshot.factory_id.as_deref(), Some("f1"));
    }
}
