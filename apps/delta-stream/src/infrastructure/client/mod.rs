//! Delta Stream Client
//!
//! WebSocket client that keeps a [`crate::domain::sync::SyncStore`] in step
//! with the server's delta stream.
//!
//! - `reconnect`: exponential backoff between connection attempts
//! - `liveness`: ping and silence detection on the live socket
//! - `sync_client`: connection loop, subscribe, and merge

pub mod liveness;
pub mod reconnect;
pub mod sync_client;

pub use liveness::{LivenessConfig, LivenessEvent, LivenessMonitor, LivenessState};
pub use reconnect::ReconnectPolicy;
pub use sync_client::{SyncClient, SyncClientError, SyncEvent};
