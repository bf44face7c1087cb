//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Delta stream WebSocket client and sync loop.
pub mod client;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Postgres source store.
pub mod postgres;

/// Per-connection subscription registry.
pub mod registry;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Bounded outbound queue adapter.
pub mod transport;

/// WebSocket server and wire protocol.
pub mod websocket;
