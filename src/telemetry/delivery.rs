//! Delivery processing span helpers.
//!
//! Field names follow the OpenTelemetry messaging semantic conventions
//! where one exists:
//! - `messaging.system`
//! - `messaging.operation.type`
//! - `messaging.destination.name`
//! - `messaging.rabbitmq.message.delivery_tag`

use crate::model::DeliveryOutcome;
use tracing::Span;

/// Start a span for processing one delivery.
///
/// The `messaging.outcome` field is declared empty and is filled by
/// [`record_outcome`] once the delivery is settled.
pub fn start_delivery_span(queue: &str, delivery_tag: u64, redelivered: bool) -> Span {
    tracing::info_span!(
        "delivery.process",
        "messaging.system" = "rabbitmq",
        "messaging.operation.type" = "process",
        "messaging.destination.name" = queue,
        "messaging.rabbitmq.message.delivery_tag" = delivery_tag,
        "messaging.redelivered" = redelivered,
        "messaging.outcome" = tracing::field::Empty,
    )
}

/// Record how the delivery was settled on its span.
pub fn record_outcome(span: &Span, outcome: DeliveryOutcome) {
    span.record("messaging.outcome", outcome.as_str());
}
