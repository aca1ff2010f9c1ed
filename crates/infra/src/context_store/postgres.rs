//! Postgres-backed context store.
//!
//! Session variables are plain `set_config(name, value, false)` calls, so they
//! live exactly as long as the physical connection's session. This store
//! therefore never touches variables through the pool: callers check out a
//! [`PgSession`] and every write, read and business query for the request
//! goes through it.
//!
//! ## Release discipline
//!
//! - [`ContextStore::release`] resets all variables before the connection goes
//!   back to the pool and poisons it if the reset fails.
//! - The pool is built with an `after_release` hook that resets the variables
//!   again. This covers sessions dropped without an explicit release (a
//!   cancelled request future, a panic in a handler).
//!
//! ## Error mapping
//!
//! | SQLx error | `ContextStoreError` |
//! |------------|---------------------|
//! | any error from `set_config` | `Write { variable, .. }` |
//! | any error from `current_setting` | `Read { variable, .. }` |
//! | `BEGIN` / `COMMIT` failure | `Transaction` |
//! | pool acquire / connect failure | `Acquire` |
//! | catalog queries | `Catalog { target, .. }` |

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use tracing::instrument;

use super::r#trait::{
    ConnectionId, ContextStore, ContextStoreError, PolicyCatalog, PooledSession, SessionConnection,
    TablePolicy,
};
use super::variables::{ProtectedTable, ScopeColumn, SessionVariable};

const SET_CONFIG: &str = "SELECT set_config($1, $2, false)";

const CURRENT_SETTING: &str = "SELECT current_setting($1, true)";

const RESET_ALL: &str = r#"
    SELECT set_config(v.name, v.value, false)
    FROM UNNEST($1::text[], $2::text[]) AS v(name, value)
"#;

const TABLE_POLICY: &str = r#"
    SELECT
        c.relrowsecurity,
        c.relforcerowsecurity,
        COALESCE(
            ARRAY_AGG(p.policyname::text ORDER BY p.policyname)
                FILTER (WHERE p.policyname IS NOT NULL),
            ARRAY[]::text[]
        ) AS policies
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    LEFT JOIN pg_catalog.pg_policies p
        ON p.schemaname = n.nspname AND p.tablename = c.relname
    WHERE n.nspname = current_schema()
      AND c.relname = $1
      AND c.relkind IN ('r', 'p')
    GROUP BY c.relrowsecurity, c.relforcerowsecurity
"#;

const LOGIN_ROLE_BYPASS: &str = r#"
    SELECT rolsuper OR rolbypassrls
    FROM pg_catalog.pg_roles
    WHERE rolname = current_user
"#;

/// Postgres context store over a SQLx pool.
///
/// Uses SQLx's pool, which is `Send + Sync`; each checkout pins one physical
/// connection until it is released.
#[derive(Debug, Clone)]
pub struct PostgresContextStore {
    pool: PgPool,
}

impl PostgresContextStore {
    /// Wrap an existing pool.
    ///
    /// Prefer [`PostgresContextStore::connect`], which installs the
    /// `after_release` reset hook. A pool built elsewhere only gets the
    /// explicit reset done by [`ContextStore::release`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool with the variable-reset hook installed.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, ContextStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .after_release(|conn, _meta| {
                Box::pin(async move {
                    match reset_session(conn).await {
                        Ok(()) => Ok(true),
                        Err(e) => {
                            // Returning `false` closes the connection instead of pooling it.
                            tracing::warn!(error = %e, "session reset after release failed; closing connection");
                            Ok(false)
                        }
                    }
                })
            })
            .connect(database_url)
            .await
            .map_err(|e| ContextStoreError::Acquire(e.to_string()))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ContextStore for PostgresContextStore {
    #[instrument(skip(self), err)]
    async fn acquire(&self) -> Result<PooledSession, ContextStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| ContextStoreError::Acquire(e.to_string()))?;

        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ContextStoreError::Acquire(e.to_string()))?;

        Ok(Box::new(PgSession {
            conn,
            id: ConnectionId::new(u64::from(pid.unsigned_abs())),
        }))
    }
}

/// One pinned Postgres connection.
///
/// Business queries for the request should run through [`PgSession::connection`]
/// so they observe the variables set here.
pub struct PgSession {
    conn: PoolConnection<Postgres>,
    id: ConnectionId,
}

impl PgSession {
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

#[async_trait]
impl SessionConnection for PgSession {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    #[instrument(skip(self, value), fields(connection_id = %self.id, variable = %variable), err)]
    async fn set_variable(&mut self, variable: SessionVariable, value: &str) -> Result<(), ContextStoreError> {
        sqlx::query(SET_CONFIG)
            .bind(variable.name())
            .bind(value)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| write_error(variable, e))?;
        Ok(())
    }

    #[instrument(skip(self, values), fields(connection_id = %self.id, count = values.len()), err)]
    async fn set_variables(&mut self, values: &[(SessionVariable, String)]) -> Result<(), ContextStoreError> {
        // `set_config(.., false)` inside a transaction is rolled back with it,
        // so a failure part-way leaves the previous context intact.
        let mut tx = Connection::begin(&mut *self.conn)
            .await
            .map_err(|e| ContextStoreError::Transaction(e.to_string()))?;

        for (variable, value) in values {
            sqlx::query(SET_CONFIG)
                .bind(variable.name())
                .bind(value.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| write_error(*variable, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| ContextStoreError::Transaction(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(connection_id = %self.id, variable = %variable), err)]
    async fn get_variable(&mut self, variable: SessionVariable) -> Result<Option<String>, ContextStoreError> {
        sqlx::query_scalar::<_, Option<String>>(CURRENT_SETTING)
            .bind(variable.name())
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| ContextStoreError::Read {
                variable,
                message: e.to_string(),
            })
    }

    fn poison(&mut self) {
        self.conn.close_on_drop();
    }
}

#[async_trait]
impl PolicyCatalog for PgSession {
    #[instrument(skip(self), fields(connection_id = %self.id, table = %table), err)]
    async fn table_policy(&mut self, table: ProtectedTable) -> Result<TablePolicy, ContextStoreError> {
        let row = sqlx::query_as::<_, (bool, bool, Vec<String>)>(TABLE_POLICY)
            .bind(table.table_name())
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|e| catalog_error(table.table_name(), e))?;

        Ok(match row {
            Some((rls_enabled, rls_forced, policies)) => TablePolicy {
                table,
                exists: true,
                rls_enabled,
                rls_forced,
                policies,
            },
            None => TablePolicy::missing(table),
        })
    }

    #[instrument(skip(self, value), fields(connection_id = %self.id, table = %table), err)]
    async fn count_rows_outside(
        &mut self,
        table: ProtectedTable,
        column: ScopeColumn,
        value: &str,
    ) -> Result<i64, ContextStoreError> {
        if !table.has_scope_column(column) {
            return Err(ContextStoreError::Catalog {
                target: table.table_name().to_string(),
                message: format!("table has no '{}' column", column.column_name()),
            });
        }

        // Both identifiers come from the allow-listed enums; only the value is caller data.
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}::text IS DISTINCT FROM $1",
            table.table_name(),
            column.column_name()
        );

        sqlx::query_scalar::<_, i64>(&sql)
            .bind(value)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| catalog_error(table.table_name(), e))
    }

    async fn login_role_bypasses_rls(&mut self) -> Result<bool, ContextStoreError> {
        sqlx::query_scalar::<_, bool>(LOGIN_ROLE_BYPASS)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| catalog_error("pg_roles", e))
    }
}

async fn reset_session(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    let (names, values): (Vec<String>, Vec<String>) = SessionVariable::defaults()
        .into_iter()
        .map(|(variable, value)| (variable.name().to_string(), value))
        .unzip();

    sqlx::query(RESET_ALL)
        .bind(names)
        .bind(values)
        .execute(conn)
        .await?;
    Ok(())
}

fn write_error(variable: SessionVariable, err: sqlx::Error) -> ContextStoreError {
    ContextStoreError::Write {
        variable,
        message: err.to_string(),
    }
}

fn catalog_error(target: &str, err: sqlx::Error) -> ContextStoreError {
    ContextStoreError::Catalog {
        target: target.to_string(),
        message: err.to_string(),
    }
}
