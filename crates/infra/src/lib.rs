//! Infrastructure layer: connection-bound security context, compliance
//! checks, audit boundary and configuration.

pub mod audit;
pub mod config;
pub mod context_store;
pub mod security;

#[cfg(test)]
mod integration_tests;
