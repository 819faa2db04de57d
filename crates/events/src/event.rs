use chrono::{DateTime, Utc};

use storefront_core::EventId;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - uniquely identified (retry history is keyed by `event_id`)
/// - typed by a stable name used for routing and metrics
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Unique identifier of this event occurrence.
    fn event_id(&self) -> EventId;

    /// Stable event name/type identifier (e.g. "inventory.stock_changed").
    fn event_type(&self) -> &str;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
