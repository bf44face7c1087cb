//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `WatermarkPoller`: per-subscription delta producer over the source store
//! - `PollTask`: cancellable fixed-cadence loop from producer to sink

mod poll_task;
mod poller;

pub use poll_task::{PollExit, PollTask};
pub use poller::WatermarkPoller;
