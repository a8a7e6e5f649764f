//! Timeout reaper (spec §4.3/§9): a single scheduled task with a jittered
//! interval. Safe to run in multiple instances since `reap_expired` skips
//! rows another instance already reclaimed (`FOR UPDATE SKIP LOCKED`).

use std::sync::Arc;
use std::time::Duration;

use duramq_core::ActorConfig;
use duramq_storage::StorageGateway;
use rand::Rng;
use tracing::{debug, warn};

pub struct Reaper {
    gateway: Arc<dyn StorageGateway>,
    actors: ActorConfig,
    interval: Duration,
    jitter: Duration,
}

impl Reaper {
    pub fn new(gateway: Arc<dyn StorageGateway>, actors: ActorConfig, config: &duramq_core::ReaperConfig) -> Self {
        Self {
            gateway,
            actors,
            interval: Duration::from_millis(config.interval_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    async fn tick(&self) {
        let now = chrono::Utc::now();
        match self.gateway.reap_expired(now, &self.actors.relay_actor).await {
            Ok(outcomes) => {
                for outcome in &outcomes {
                    if outcome.requeued {
                        debug!(message_id = %outcome.message_id, "reaper requeued expired lock");
                    } else {
                        debug!(message_id = %outcome.message_id, "reaper moved expired lock to dead");
                    }
                    if let Some(anomaly) = &outcome.zombie_anomaly {
                        warn!(message_id = %outcome.message_id, ?anomaly, "zombie message reclaimed");
                    }
                }
            }
            Err(err) => warn!(?err, "reaper sweep failed"),
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter_ms) };
        self.interval + Duration::from_millis(extra)
    }

    /// Spawn the reaper loop as a detached task. The returned handle can be
    /// aborted on shutdown; dropping it without aborting leaves the task
    /// running (tokio's default detached-task semantics).
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.next_delay()).await;
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duramq_core::{ActorConfig, ReaperConfig};
    use duramq_storage::InMemoryStorageGateway;

    #[tokio::test]
    async fn tick_runs_without_panicking_on_empty_store() {
        let gateway: Arc<dyn StorageGateway> = Arc::new(InMemoryStorageGateway::new());
        let reaper = Reaper::new(
            gateway,
            ActorConfig { relay_actor: "relay".into(), manual_actor: "manual".into() },
            &ReaperConfig { interval_ms: 10, jitter_ms: 0 },
        );
        reaper.tick().await;
    }
}
