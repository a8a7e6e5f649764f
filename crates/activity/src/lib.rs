//! Activity logging and event distribution (spec §4.4, §4.6).
//!
//! This crate sits between the queue engine and the storage gateway: it
//! turns each committed outcome into detector context, attaches any
//! engine-level anomaly the gateway couldn't see on its own, and hands
//! subscribers a lag-aware view of the event channel.

pub mod consumer_stats;
pub mod event_bus;
pub mod logger;

pub use consumer_stats::ConsumerStatsCache;
pub use event_bus::{subscribe, EventSubscription, SubscriptionItem};
pub use logger::ActivityLogger;
