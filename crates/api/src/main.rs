use std::sync::Arc;

use anyhow::Context;

use tackroom_infra::audit::TracingAuditSink;
use tackroom_infra::config::{ContextFailurePolicy, SecurityConfig};
use tackroom_infra::context_store::{ContextStore, InMemoryContextStore, PostgresContextStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tackroom_observability::init();

    let config = SecurityConfig::from_env().context("invalid configuration")?;

    let store: Arc<dyn ContextStore> = match &config.database_url {
        Some(url) => Arc::new(
            PostgresContextStore::connect(url, config.max_connections)
                .await
                .context("failed to connect to database")?,
        ),
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory context store");
            Arc::new(InMemoryContextStore::new())
        }
    };

    if config.on_context_failure == ContextFailurePolicy::Proceed {
        tracing::warn!("requests proceed without a security context when it cannot be applied");
    }

    let state = tackroom_api::app::AppState::new(&config, store, Arc::new(TracingAuditSink));
    let app = tackroom_api::app::build_app(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
