use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EVENTS_CAP;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum EventType {
    Normal,
    Warning,
}

/// A human-readable observation attached to a devnet, eg. `Normal BinaryBuilt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub r#type: EventType,
    pub reason: String,
    pub message: String,
    pub component: String,
}

impl Event {
    pub fn normal(
        reason: impl Into<String>,
        message: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            r#type: EventType::Normal,
            reason: reason.into(),
            message: message.into(),
            component: component.into(),
        }
    }

    pub fn warning(
        reason: impl Into<String>,
        message: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            r#type: EventType::Warning,
            reason: reason.into(),
            message: message.into(),
            component: component.into(),
        }
    }
}

/// Appends an event, dropping the oldest entry once [`EVENTS_CAP`] is reached.
///
/// An event with the same `(reason, message)` as one of the recent tail is
/// dropped instead of appended, so a flapping condition cannot flood the ring.
/// Returns `true` if the event was actually appended.
pub fn append_event(events: &mut Vec<Event>, event: Event) -> bool {
    const DEDUP_WINDOW: usize = 5;

    let tail = events.len().saturating_sub(DEDUP_WINDOW);
    if events[tail..].iter().any(|e| e.reason == event.reason && e.message == event.message) {
        return false;
    }

    events.push(event);
    if events.len() > EVENTS_CAP {
        let excess = events.len() - EVENTS_CAP;
        events.drain(..excess);
    }
    true
}
