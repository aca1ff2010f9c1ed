//! Session-variable storage bound to one physical connection.
//!
//! RLS policies read identity/role/tenant facts from session variables, which
//! the database keeps per connection. Everything in this module therefore
//! operates on a checked-out connection, never on "the pool".

pub mod in_memory;
pub mod postgres;
pub mod r#trait;
pub mod variables;

pub use in_memory::{InMemoryContextStore, InMemorySession, ScopedRow};
pub use postgres::{PgSession, PostgresContextStore};
pub use r#trait::{
    BoxFuture, ConnectionId, ContextStore, ContextStoreError, DatabaseSession, DynSession, PolicyCatalog,
    PooledSession, SessionConnection, TablePolicy, with_connection,
};
pub use variables::{ProtectedTable, ScopeColumn, SessionVariable};
