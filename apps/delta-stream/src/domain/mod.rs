//! Domain Layer - Core delta streaming types and business logic.
//!
//! This layer contains the core domain types for watermark-based delta
//! streaming. Nothing here performs I/O.

/// Registered time-series sources.
pub mod source;

/// Data points and delta batches.
pub mod streaming;

/// Per-connection subscriptions and watermarks.
pub mod subscription;

/// Client-side dedup merge store.
pub mod sync;
