//! String <-> enum mappings for the columns backed by `TEXT` with a
//! `CHECK` constraint rather than a native Postgres enum type, so adding a
//! variant is a deploy, not a migration.

use duramq_core::{ActivityAction, AnomalySeverity, MessageStatus, PartitionInterval, QueueType};

pub fn status_str(s: MessageStatus) -> &'static str {
    match s {
        MessageStatus::Queued => "queued",
        MessageStatus::Processing => "processing",
        MessageStatus::Acknowledged => "acknowledged",
        MessageStatus::Dead => "dead",
        MessageStatus::Archived => "archived",
    }
}

pub fn parse_status(s: &str) -> MessageStatus {
    match s {
        "processing" => MessageStatus::Processing,
        "acknowledged" => MessageStatus::Acknowledged,
        "dead" => MessageStatus::Dead,
        "archived" => MessageStatus::Archived,
        _ => MessageStatus::Queued,
    }
}

pub fn action_str(a: ActivityAction) -> &'static str {
    match a {
        ActivityAction::Enqueue => "enqueue",
        ActivityAction::Dequeue => "dequeue",
        ActivityAction::Ack => "ack",
        ActivityAction::Nack => "nack",
        ActivityAction::Move => "move",
        ActivityAction::Delete => "delete",
        ActivityAction::Clear => "clear",
        ActivityAction::Touch => "touch",
        ActivityAction::Timeout => "timeout",
        ActivityAction::Requeue => "requeue",
        ActivityAction::Dlq => "dlq",
    }
}

pub fn parse_action(s: &str) -> ActivityAction {
    match s {
        "dequeue" => ActivityAction::Dequeue,
        "ack" => ActivityAction::Ack,
        "nack" => ActivityAction::Nack,
        "move" => ActivityAction::Move,
        "delete" => ActivityAction::Delete,
        "clear" => ActivityAction::Clear,
        "touch" => ActivityAction::Touch,
        "timeout" => ActivityAction::Timeout,
        "requeue" => ActivityAction::Requeue,
        "dlq" => ActivityAction::Dlq,
        _ => ActivityAction::Enqueue,
    }
}

pub fn queue_type_str(t: QueueType) -> &'static str {
    match t {
        QueueType::Standard => "standard",
        QueueType::Unlogged => "unlogged",
        QueueType::Partitioned => "partitioned",
    }
}

pub fn parse_queue_type(s: &str) -> QueueType {
    match s {
        "unlogged" => QueueType::Unlogged,
        "partitioned" => QueueType::Partitioned,
        _ => QueueType::Standard,
    }
}

pub fn partition_interval_str(p: PartitionInterval) -> &'static str {
    match p {
        PartitionInterval::Hourly => "hourly",
        PartitionInterval::Daily => "daily",
        PartitionInterval::Weekly => "weekly",
    }
}

pub fn parse_partition_interval(s: &str) -> Option<PartitionInterval> {
    match s {
        "hourly" => Some(PartitionInterval::Hourly),
        "daily" => Some(PartitionInterval::Daily),
        "weekly" => Some(PartitionInterval::Weekly),
        _ => None,
    }
}

pub fn severity_str(s: AnomalySeverity) -> &'static str {
    match s {
        AnomalySeverity::Critical => "critical",
        AnomalySeverity::Warning => "warning",
        AnomalySeverity::Info => "info",
    }
}

pub fn parse_severity(s: &str) -> AnomalySeverity {
    match s {
        "critical" => AnomalySeverity::Critical,
        "info" => AnomalySeverity::Info,
        _ => AnomalySeverity::Warning,
    }
}
