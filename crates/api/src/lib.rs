//! HTTP API: server, routing, and the per-request security pipeline.

pub mod app;
pub mod audit;
pub mod context;
pub mod gate;
pub mod middleware;
