//! Pub/sub event envelope.

use serde::{Deserialize, Serialize};

/// What happened to the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// An event delivered to broker subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
}

impl<T> Event<T> {
    pub fn new(kind: EventKind, payload: T) -> Self {
        Self { kind, payload }
    }
}
