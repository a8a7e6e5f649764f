//! Per-consumer derived counters (§5: "the consumer-stats derived view may
//! be served from a cache with bounded staleness"), and the sliding window
//! `burst_dequeue` needs (§4.5: "recent_dequeue_count for this consumer in
//! window >= burst_count within burst_seconds").

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use duramq_core::ConsumerStats;

#[derive(Default)]
struct Entry {
    stats: ConsumerStats,
    recent_dequeues: Vec<DateTime<Utc>>,
}

/// Keyed by (queue, consumer_id). Mutated only under its own mutex, per the
/// Concurrency model's shared-resources list.
pub struct ConsumerStatsCache {
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl Default for ConsumerStatsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerStatsCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Record a dequeue and return the count within `window_seconds` of now
    /// (used directly as the `burst_dequeue` detector's input).
    pub fn record_dequeue(&self, queue: &str, consumer_id: &str, window_seconds: i64) -> u32 {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry((queue.to_string(), consumer_id.to_string())).or_default();
        entry.stats.last_dequeue_at = Some(now);
        entry.stats.dequeue_count += 1;
        entry.recent_dequeues.push(now);

        let cutoff = now - chrono::Duration::seconds(window_seconds);
        entry.recent_dequeues.retain(|t| *t >= cutoff);
        entry.recent_dequeues.len() as u32
    }

    pub fn get(&self, queue: &str, consumer_id: &str) -> ConsumerStats {
        self.entries
            .lock()
            .unwrap()
            .get(&(queue.to_string(), consumer_id.to_string()))
            .map(|e| e.stats.clone())
            .unwrap_or_default()
    }

    /// Snapshot every tracked consumer for a queue, for the admin `getMetrics`
    /// surface (§4.7).
    pub fn all_for_queue(&self, queue: &str) -> HashMap<String, ConsumerStats> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|((q, _), _)| q == queue)
            .map(|((_, c), e)| (c.clone(), e.stats.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_window_bounded_burst_count() {
        let cache = ConsumerStatsCache::new();
        for _ in 0..5 {
            cache.record_dequeue("orders", "c1", 60);
        }
        assert_eq!(cache.get("orders", "c1").dequeue_count, 5);
        let count = cache.record_dequeue("orders", "c1", 60);
        assert_eq!(count, 6);
    }
}
