//! Advisory destination mapping.
//!
//! The broker publishes lifecycle events (consumer add/remove, producer
//! add/remove, DLQ activity, connection churn) on well-known topics derived
//! from the destination they concern. This module computes those names.

use crate::commands::{Destination, DestinationKind};

pub const ADVISORY_TOPIC_PREFIX: &str = "ActiveMQ.Advisory.";
pub const CONNECTION_ADVISORY_TOPIC: &str = "ActiveMQ.Advisory.Connection";

/// Topic carrying consumer add/remove events for `destination`.
pub fn consumer_advisory_topic(destination: &Destination) -> Destination {
    advisory_for("Consumer", destination)
}

/// Topic carrying producer add/remove events for `destination`.
pub fn producer_advisory_topic(destination: &Destination) -> Destination {
    advisory_for("Producer", destination)
}

/// Topic notified when a message for `destination` is dead-lettered.
pub fn dlq_advisory_topic(destination: &Destination) -> Destination {
    advisory_for("MessageDLQd", destination)
}

/// Topic carrying connection start/stop events.
pub fn connection_advisory_topic() -> Destination {
    Destination::topic(CONNECTION_ADVISORY_TOPIC)
}

pub fn is_advisory(destination: &Destination) -> bool {
    destination.kind == DestinationKind::Topic
        && destination.name.starts_with(ADVISORY_TOPIC_PREFIX)
}

fn advisory_for(category: &str, destination: &Destination) -> Destination {
    let kind = match destination.kind {
        DestinationKind::Queue | DestinationKind::TempQueue => "Queue",
        DestinationKind::Topic | DestinationKind::TempTopic => "Topic",
    };
    Destination::topic(format!(
        "{ADVISORY_TOPIC_PREFIX}{category}.{kind}.{}",
        destination.name
    ))
}
