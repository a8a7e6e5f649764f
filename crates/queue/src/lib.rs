//! The durable queue engine: enqueue buffering, the transactional engine
//! itself, the timeout reaper, and the administration surface (spec §4).

pub mod admin;
pub mod buffer;
pub mod engine;
pub mod reaper;
pub mod retry;

pub use admin::AdminApi;
pub use buffer::EnqueueBuffer;
pub use engine::{DequeueOptions, EnqueueOptions, QueueEngine};
pub use reaper::Reaper;
