use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Change event fired for every accepted mutation of a map
///
/// The first put of a key is an insert, a put over an existing key is an
/// update, a remove carries the prior value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapEvent {
    Inserted { key: Bytes, value: Bytes },
    Updated { key: Bytes, old_value: Bytes, value: Bytes },
    Removed { key: Bytes, old_value: Bytes },
}

impl MapEvent {
    /// Key the event refers to
    pub fn key(&self) -> &Bytes {
        match self {
            MapEvent::Inserted { key, .. }
            | MapEvent::Updated { key, .. }
            | MapEvent::Removed { key, .. } => key,
        }
    }

    /// Value after the event (None for a remove)
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            MapEvent::Inserted { value, .. } | MapEvent::Updated { value, .. } => Some(value),
            MapEvent::Removed { .. } => None,
        }
    }

    /// Value before the event (None for an insert)
    pub fn old_value(&self) -> Option<&Bytes> {
        match self {
            MapEvent::Inserted { .. } => None,
            MapEvent::Updated { old_value, .. } | MapEvent::Removed { old_value, .. } => {
                Some(old_value)
            }
        }
    }
}

/// Outcome a subscriber reports back from a delivery
///
/// `Invalid` means the subscriber can no longer accept messages and must be
/// unregistered by the caller; it is a status value, never an unwound error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberStatus {
    Continue,
    Invalid,
}

/// Statistics for the visible store
#[derive(Debug, Default, Clone, Serialize)]
pub struct MapStoreStats {
    /// Current number of visible keys
    pub total_keys: usize,
    /// Number of insert operations
    pub inserts: u64,
    /// Number of update operations
    pub updates: u64,
    /// Number of remove operations
    pub removes: u64,
    /// Number of get operations
    pub gets: u64,
}

/// Statistics for a subscription collection
///
/// The three subscriber facets are tracked independently.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SubscriptionStats {
    pub key_subscribers: usize,
    pub entry_topic_subscribers: usize,
    pub reference_subscribers: usize,
    pub events_delivered: u64,
    pub invalid_removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let inserted = MapEvent::Inserted {
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
        };
        assert_eq!(inserted.key().as_ref(), b"k");
        assert_eq!(inserted.value().map(|v| v.as_ref()), Some(&b"v"[..]));
        assert!(inserted.old_value().is_none());

        let removed = MapEvent::Removed {
            key: Bytes::from_static(b"k"),
            old_value: Bytes::from_static(b"v"),
        };
        assert!(removed.value().is_none());
        assert_eq!(removed.old_value().map(|v| v.as_ref()), Some(&b"v"[..]));
    }
}
