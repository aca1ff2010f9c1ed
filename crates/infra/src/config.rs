//! Service configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | unset: in-memory context store |
//! | `DATABASE_MAX_CONNECTIONS` | `10` |
//! | `SECURITY_ON_CONTEXT_FAILURE` | `proceed` (`proceed` or `reject`) |
//! | `SECURITY_PROTECTED_TABLES` | every protected table |
//! | `SECURITY_SKIP_ROUTES` | none besides `/health` |
//! | `JWT_SECRET` | insecure dev default |
//! | `BIND_ADDR` | `0.0.0.0:8080` |

use core::fmt;
use core::str::FromStr;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context_store::ProtectedTable;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEV_JWT_SECRET: &str = "dev-secret";

/// Routes that never get a security context, whatever the configuration.
pub const DEFAULT_SKIP_ROUTES: &[&str] = &["/health"];

/// What the request gate does when the security context cannot be applied.
///
/// `Proceed` keeps the service available and relies on the database's
/// default-deny policies returning no rows for a request without context.
/// Only safe when every protected table actually denies by default.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextFailurePolicy {
    /// Log and run the request without a pinned connection.
    #[default]
    Proceed,
    /// Answer `503 Service Unavailable`.
    Reject,
}

impl fmt::Display for ContextFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContextFailurePolicy::Proceed => "proceed",
            ContextFailurePolicy::Reject => "reject",
        })
    }
}

impl FromStr for ContextFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proceed" | "open" => Ok(ContextFailurePolicy::Proceed),
            "reject" | "closed" => Ok(ContextFailurePolicy::Reject),
            other => Err(ConfigError::invalid("SECURITY_ON_CONTEXT_FAILURE", other)),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityConfig {
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub on_context_failure: ContextFailurePolicy,
    pub protected_tables: Vec<ProtectedTable>,
    /// Matched route paths (`/orders/:id`) the request gate passes through.
    pub skip_routes: Vec<String>,
    pub jwt_secret: String,
    pub bind_addr: SocketAddr,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            on_context_failure: ContextFailurePolicy::default(),
            protected_tables: ProtectedTable::ALL.to_vec(),
            skip_routes: DEFAULT_SKIP_ROUTES.iter().map(|r| r.to_string()).collect(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl SecurityConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        config.database_url = get("DATABASE_URL");

        if let Some(raw) = get("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = match raw.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::invalid("DATABASE_MAX_CONNECTIONS", raw)),
            };
        }

        if let Some(raw) = get("SECURITY_ON_CONTEXT_FAILURE") {
            config.on_context_failure = raw.parse()?;
        }

        if let Some(raw) = get("SECURITY_PROTECTED_TABLES") {
            config.protected_tables = parse_tables(&raw)?;
        }

        if let Some(raw) = get("SECURITY_SKIP_ROUTES") {
            for route in parse_routes(&raw)? {
                if !config.skip_routes.contains(&route) {
                    config.skip_routes.push(route);
                }
            }
        }

        match get("JWT_SECRET") {
            Some(secret) => config.jwt_secret = secret,
            None => tracing::warn!("JWT_SECRET not set; using insecure dev default"),
        }

        if let Some(raw) = get("BIND_ADDR") {
            config.bind_addr = raw
                .parse()
                .map_err(|e| ConfigError::invalid("BIND_ADDR", format!("{raw}: {e}")))?;
        }

        Ok(config)
    }
}

fn parse_tables(raw: &str) -> Result<Vec<ProtectedTable>, ConfigError> {
    let mut tables = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let table: ProtectedTable = name
            .parse()
            .map_err(|e: String| ConfigError::invalid("SECURITY_PROTECTED_TABLES", e))?;
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    if tables.is_empty() {
        return Err(ConfigError::invalid("SECURITY_PROTECTED_TABLES", "no tables listed"));
    }
    Ok(tables)
}

fn parse_routes(raw: &str) -> Result<Vec<String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|route| {
            if route.starts_with('/') {
                Ok(route.to_string())
            } else {
                Err(ConfigError::invalid("SECURITY_SKIP_ROUTES", route))
            }
        })
        .collect()
}
