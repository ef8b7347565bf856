//! Watch event types.

use serde::{Deserialize, Serialize};

/// Kubernetes watch event kinds, serialized in the upstream wire casing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "ADDED")]
    Added,
    #[serde(rename = "MODIFIED")]
    Modified,
    #[serde(rename = "DELETED")]
    Deleted,
}

/// One change observed by a backend, fanned out to every eligible watcher.
#[derive(Clone, Debug)]
pub struct Event<O> {
    pub event_type: EventType,
    pub object: O,
}

impl<O> Event<O> {
    pub fn added(object: O) -> Self {
        Self {
            event_type: EventType::Added,
            object,
        }
    }

    pub fn modified(object: O) -> Self {
        Self {
            event_type: EventType::Modified,
            object,
        }
    }

    pub fn deleted(object: O) -> Self {
        Self {
            event_type: EventType::Deleted,
            object,
        }
    }
}
