//! Built-in detectors, one struct per row of the §4.5 table. Each is a
//! small pure function; none perform I/O.

use duramq_core::{Anomaly, AnomalySeverity};

use crate::context::{BulkOperationType, DetectorContext, EventKind};
use crate::registry::Detector;

fn anomaly(ctx: &DetectorContext, kind: &str, severity: AnomalySeverity, details: serde_json::Value) -> Anomaly {
    Anomaly {
        anomaly_type: kind.to_string(),
        severity,
        message_id: ctx.message_id,
        consumer_id: ctx.consumer_id.clone(),
        details,
    }
}

pub struct FlashMessage;
impl Detector for FlashMessage {
    fn name(&self) -> &'static str {
        "flash_message"
    }
    fn description(&self) -> &'static str {
        "Message dequeued almost immediately after being enqueued."
    }
    fn events(&self) -> &'static [EventKind] {
        &[EventKind::Dequeue]
    }
    fn detect(&self, ctx: &DetectorContext) -> Option<Anomaly> {
        let t = ctx.time_in_queue_ms?;
        (t < ctx.thresholds.flash_threshold_ms)
            .then(|| anomaly(ctx, "flash_message", AnomalySeverity::Warning, serde_json::json!({ "time_in_queue_ms": t })))
    }
}

pub struct LargePayload;
impl Detector for LargePayload {
    fn name(&self) -> &'static str {
        "large_payload"
    }
    fn description(&self) -> &'static str {
        "Enqueued payload exceeds the configured size threshold."
    }
    fn events(&self) -> &'static [EventKind] {
        &[EventKind::Enqueue]
    }
    fn detect(&self, ctx: &DetectorContext) -> Option<Anomaly> {
        let size = ctx.payload_size?;
        (size > ctx.thresholds.large_payload_threshold_bytes).then(|| {
            anomaly(ctx, "large_payload", AnomalySeverity::Info, serde_json::json!({ "payload_size": size }))
        })
    }
}

pub struct LongProcessing;
impl Detector for LongProcessing {
    fn name(&self) -> &'static str {
        "long_processing"
    }
    fn description(&self) -> &'static str {
        "Message took unusually long between dequeue and ack."
    }
    fn events(&self) -> &'static [EventKind] {
        &[EventKind::Ack]
    }
    fn detect(&self, ctx: &DetectorContext) -> Option<Anomaly> {
        let t = ctx.processing_time_ms?;
        (t > ctx.thresholds.long_processing_threshold_ms).then(|| {
            anomaly(ctx, "long_processing", AnomalySeverity::Warning, serde_json::json!({ "processing_time_ms": t }))
        })
    }
}

pub struct LockStolen;
impl Detector for LockStolen {
    fn name(&self) -> &'static str {
        "lock_stolen"
    }
    fn description(&self) -> &'static str {
        "Ack/nack presented a lock token that does not match the current holder."
    }
    fn events(&self) -> &'static [EventKind] {
        &[EventKind::Ack]
    }
    fn detect(&self, ctx: &DetectorContext) -> Option<Anomaly> {
        (ctx.expected_lock_token.is_some() && ctx.expected_lock_token != ctx.received_lock_token).then(|| {
            anomaly(
                ctx,
                "lock_stolen",
                AnomalySeverity::Critical,
                serde_json::json!({
                    "expected_lock_token": ctx.expected_lock_token,
                    "received_lock_token": ctx.received_lock_token,
                }),
            )
        })
    }
}

pub struct NearDlq;
impl Detector for NearDlq {
    fn name(&self) -> &'static str {
        "near_dlq"
    }
    fn description(&self) -> &'static str {
        "Message has few attempts left before dead-lettering."
    }
    fn events(&self) -> &'static [EventKind] {
        &[EventKind::Dequeue]
    }
    fn detect(&self, ctx: &DetectorContext) -> Option<Anomaly> {
        let remaining = ctx.attempts_remaining?;
        (remaining <= ctx.thresholds.near_dlq_threshold).then(|| {
            anomaly(ctx, "near_dlq", AnomalySeverity::Warning, serde_json::json!({ "attempts_remaining": remaining }))
        })
    }
}

pub struct DlqMovement;
impl Detector for DlqMovement {
    fn name(&self) -> &'static str {
        "dlq_movement"
    }
    fn description(&self) -> &'static str {
        "Message exhausted its retry budget and moved to dead."
    }
    fn events(&self) -> &'static [EventKind] {
        &[EventKind::Nack, EventKind::TimeoutRequeue]
    }
    fn detect(&self, ctx: &DetectorContext) -> Option<Anomaly> {
        let attempts = ctx.attempt_count?;
        let max = ctx.max_attempts?;
        (attempts >= max).then(|| {
            anomaly(ctx, "dlq_movement", AnomalySeverity::Warning, serde_json::json!({ "attempt_count": attempts, "max_attempts": max }))
        })
    }
}

pub struct ZombieMessage;
impl Detector for ZombieMessage {
    fn name(&self) -> &'static str {
        "zombie_message"
    }
    fn description(&self) -> &'static str {
        "Reaper reclaimed a lock that was overdue by a large multiple of its timeout."
    }
    fn events(&self) -> &'static [EventKind] {
        &[EventKind::TimeoutRequeue]
    }
    fn detect(&self, ctx: &DetectorContext) -> Option<Anomaly> {
        let overdue = ctx.overdue_ms?;
        let expected = ctx.expected_timeout_ms?;
        (overdue as f64 > expected as f64 * ctx.thresholds.zombie_multiplier).then(|| {
            anomaly(ctx, "zombie_message", AnomalySeverity::Critical, serde_json::json!({ "overdue_ms": overdue, "expected_timeout_ms": expected }))
        })
    }
}

pub struct BurstDequeue;
impl Detector for BurstDequeue {
    fn name(&self) -> &'static str {
        "burst_dequeue"
    }
    fn description(&self) -> &'static str {
        "A single consumer is dequeuing unusually fast."
    }
    fn events(&self) -> &'static [EventKind] {
        &[EventKind::Dequeue]
    }
    fn detect(&self, ctx: &DetectorContext) -> Option<Anomaly> {
        let count = ctx.recent_dequeue_count?;
        (count >= ctx.thresholds.burst_count).then(|| {
            anomaly(
                ctx,
                "burst_dequeue",
                AnomalySeverity::Warning,
                serde_json::json!({ "recent_dequeue_count": count, "window_seconds": ctx.thresholds.burst_seconds }),
            )
        })
    }
}

pub struct BulkOperation;
impl Detector for BulkOperation {
    fn name(&self) -> &'static str {
        "bulk_enqueue_delete_move"
    }
    fn description(&self) -> &'static str {
        "A bulk enqueue/delete/move affected an unusually large number of messages."
    }
    fn events(&self) -> &'static [EventKind] {
        &[EventKind::BulkOperation]
    }
    fn detect(&self, ctx: &DetectorContext) -> Option<Anomaly> {
        let count = ctx.affected_count?;
        if !matches!(ctx.bulk_operation, Some(BulkOperationType::Enqueue | BulkOperationType::Delete | BulkOperationType::Move)) {
            return None;
        }
        (count >= ctx.thresholds.bulk_threshold).then(|| {
            let op = match ctx.bulk_operation {
                Some(BulkOperationType::Enqueue) => "bulk_enqueue",
                Some(BulkOperationType::Delete) => "bulk_delete",
                Some(BulkOperationType::Move) => "bulk_move",
                _ => "bulk_operation",
            };
            anomaly(ctx, op, AnomalySeverity::Info, serde_json::json!({ "affected_count": count }))
        })
    }
}

pub struct QueueCleared;
impl Detector for QueueCleared {
    fn name(&self) -> &'static str {
        "queue_cleared"
    }
    fn description(&self) -> &'static str {
        "An entire queue/status was cleared in one operation."
    }
    fn events(&self) -> &'static [EventKind] {
        &[EventKind::BulkOperation]
    }
    fn detect(&self, ctx: &DetectorContext) -> Option<Anomaly> {
        if ctx.bulk_operation != Some(BulkOperationType::Clear) {
            return None;
        }
        let count = ctx.affected_count?;
        (count > 0).then(|| anomaly(ctx, "queue_cleared", AnomalySeverity::Warning, serde_json::json!({ "affected_count": count })))
    }
}

pub fn all() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(FlashMessage),
        Box::new(LargePayload),
        Box::new(LongProcessing),
        Box::new(LockStolen),
        Box::new(NearDlq),
        Box::new(DlqMovement),
        Box::new(ZombieMessage),
        Box::new(BurstDequeue),
        Box::new(BulkOperation),
        Box::new(QueueCleared),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use duramq_core::DetectorConfig;

    fn ctx(event: EventKind) -> DetectorContext {
        DetectorContext::new(event, "orders", DetectorConfig::default())
    }

    #[test]
    fn flash_message_fires_below_threshold() {
        let mut c = ctx(EventKind::Dequeue);
        c.time_in_queue_ms = Some(10);
        assert!(FlashMessage.detect(&c).is_some());
    }

    #[test]
    fn flash_message_silent_above_threshold() {
        let mut c = ctx(EventKind::Dequeue);
        c.time_in_queue_ms = Some(10_000);
        assert!(FlashMessage.detect(&c).is_none());
    }

    #[test]
    fn zombie_message_requires_multiplier_breach() {
        let mut c = ctx(EventKind::TimeoutRequeue);
        c.overdue_ms = Some(1_000);
        c.expected_timeout_ms = Some(1_000);
        assert!(ZombieMessage.detect(&c).is_none());
        c.overdue_ms = Some(10_000);
        assert!(ZombieMessage.detect(&c).is_some());
    }

    #[test]
    fn queue_cleared_requires_nonzero_count() {
        let mut c = ctx(EventKind::BulkOperation);
        c.bulk_operation = Some(BulkOperationType::Clear);
        c.affected_count = Some(0);
        assert!(QueueCleared.detect(&c).is_none());
        c.affected_count = Some(5);
        assert!(QueueCleared.detect(&c).is_some());
    }

    #[test]
    fn registry_runs_only_subscribed_enabled_detectors() {
        let registry = crate::registry::DetectorRegistry::with_builtins();
        let mut c = ctx(EventKind::Dequeue);
        c.time_in_queue_ms = Some(1);
        c.attempts_remaining = Some(0);
        let anomalies = registry.run(&c);
        assert!(anomalies.iter().any(|a| a.anomaly_type == "flash_message"));
        assert!(anomalies.iter().any(|a| a.anomaly_type == "near_dlq"));

        registry.set_enabled("flash_message", false);
        let anomalies = registry.run(&c);
        assert!(!anomalies.iter().any(|a| a.anomaly_type == "flash_message"));
    }
}
