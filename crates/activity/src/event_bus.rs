//! Subscriber-facing wrapper around `StorageGateway::subscribe` (spec §4.6).
//!
//! The gateway's broadcast channel already gives every subscriber a bounded
//! queue that drops the oldest entries first when it falls behind — that is
//! exactly `tokio::sync::broadcast`'s native lagged-receiver behavior. This
//! module's job is just to turn a `RecvError::Lagged(n)` into the
//! `subscriber_lagged` signal the spec calls for, the same way the old
//! notification dispatcher isolated one channel's failure from the others:
//! a lagging subscriber logs and keeps going, it never stops the publisher
//! or other subscribers.

use duramq_core::QueueEvent;
use tokio::sync::broadcast;
use tracing::warn;

pub struct EventSubscription {
    queue_label: String,
    receiver: broadcast::Receiver<QueueEvent>,
}

/// One item yielded by a subscription: either a real event, or a signal
/// that this subscriber missed `count` events and should reconcile its
/// view via a fresh poll/list call.
#[derive(Debug, Clone)]
pub enum SubscriptionItem {
    Event(QueueEvent),
    SubscriberLagged { count: u64 },
}

impl EventSubscription {
    pub fn new(label: impl Into<String>, receiver: broadcast::Receiver<QueueEvent>) -> Self {
        Self { queue_label: label.into(), receiver }
    }

    /// Await the next item. Returns `None` only once the publisher side has
    /// been dropped entirely (broker shutdown).
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        loop {
            return match self.receiver.recv().await {
                Ok(event) => Some(SubscriptionItem::Event(event)),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(label = %self.queue_label, count, "event subscriber lagged, events dropped");
                    Some(SubscriptionItem::SubscriberLagged { count })
                }
                Err(broadcast::error::RecvError::Closed) => None,
            };
        }
    }
}

/// Thin factory so callers don't need to depend on `duramq_storage` just to
/// name the gateway trait when subscribing.
pub fn subscribe(gateway: &dyn duramq_storage::StorageGateway, label: impl Into<String>) -> EventSubscription {
    EventSubscription::new(label, gateway.subscribe())
}

#[cfg(test)]
mod tests {
    use super::*;
    use duramq_core::ActivityAction;

    #[tokio::test]
    async fn surfaces_lagged_as_a_signal_not_an_error() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = EventSubscription::new("test", rx);

        for i in 0..5 {
            let _ = tx.send(QueueEvent {
                queue: "orders".into(),
                action: ActivityAction::Enqueue,
                message_id: None,
                timestamp: chrono::Utc::now() + chrono::Duration::seconds(i),
            });
        }

        let first = sub.recv().await.unwrap();
        assert!(matches!(first, SubscriptionItem::SubscriberLagged { .. }));
    }
}
