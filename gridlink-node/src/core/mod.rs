/// Core module - local store and observer plumbing
///
/// - `MapStore`: the visible single-host byte-keyed store
/// - `SubscriptionCollection`: per-asset observer registries with bootstrap
///   delivery and invalid-subscriber recovery
/// - shared event and error types
pub mod error;
pub mod map_store;
pub mod subscription;
pub mod types;

pub use error::{GridError, Result};
pub use map_store::MapStore;
pub use subscription::{
    EntrySubscriber, EventFilter, SubscriptionCollection, TopicSubscriber, ValueSubscriber,
};
pub use types::{MapEvent, MapStoreStats, SubscriberStatus, SubscriptionStats};
