use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storefront_core::{DomainError, DomainResult, EventId};

use crate::Event;

/// Envelope carrying an event payload with its identity metadata.
///
/// Services that do not model their events as dedicated types can wrap any
/// serializable payload (commonly `serde_json::Value`) and hand the envelope
/// straight to the retry executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    event_id: EventId,
    event_type: String,
    occurred_at: DateTime<Utc>,
    payload: P,
}

impl<P> EventEnvelope<P> {
    /// Wrap a payload as a freshly occurred event with a new identifier.
    pub fn new(event_type: impl Into<String>, payload: P) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Rebuild an envelope from known metadata.
    ///
    /// Rejects an empty `event_type`; metrics and records are labelled by it.
    pub fn from_parts(
        event_id: EventId,
        event_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: P,
    ) -> DomainResult<Self> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(DomainError::validation("event_type must not be empty"));
        }
        Ok(Self {
            event_id,
            event_type,
            occurred_at,
            payload,
        })
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

impl<P> Event for EventEnvelope<P>
where
    P: Clone + core::fmt::Debug + Send + Sync + 'static,
{
    fn event_id(&self) -> EventId {
        self.event_id
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
