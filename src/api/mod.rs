//! HTTP API over the heapscope service
//!
//! Provides:
//! - Type overview and per-type count history
//! - Per-type and per-object tracing, referrer trees
//! - Size refresh and allocation sites
//! - Server-Sent Events (SSE) stream of census ticks

pub mod server;

pub use server::{
    shutdown_signal, ApiServer, ApiServerConfig, ErrorResponse, HealthResponse, HistoryResponse,
    OverviewResponse,
};
