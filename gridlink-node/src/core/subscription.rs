use super::map_store::MapStore;
use super::types::{MapEvent, SubscriberStatus, SubscriptionStats};
use crate::protocol::context::RequestContext;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Observer of a single value (a key subscription or a value reference)
pub trait ValueSubscriber: Send + Sync {
    /// Deliver the current value; `None` means the key is absent
    fn on_message(&self, value: Option<&Bytes>) -> SubscriberStatus;

    /// The subscription has ended; called exactly once per registration
    fn on_end_of_subscription(&self) {}
}

/// Observer of whole-map change events
pub trait EntrySubscriber: Send + Sync {
    fn on_event(&self, event: &MapEvent) -> SubscriberStatus;

    fn on_end_of_subscription(&self) {}
}

/// Observer of topic messages published through the asset
pub trait TopicSubscriber: Send + Sync {
    fn on_message(&self, topic: &str, payload: &Bytes) -> SubscriberStatus;

    fn on_end_of_subscription(&self) {}
}

/// Predicate limiting which events an entry subscriber observes
pub type EventFilter = Box<dyn Fn(&MapEvent) -> bool + Send + Sync>;

/// Subscribers are identified by object identity, not by value
fn identity_of<S: ?Sized>(subscriber: &Arc<S>) -> usize {
    Arc::as_ptr(subscriber) as *const () as usize
}

struct EntryRegistration {
    subscriber: Arc<dyn EntrySubscriber>,
    filter: Option<EventFilter>,
}

/// Per-asset set of local and remote observers
///
/// Three subscriber facets are tracked independently: key subscribers,
/// entry/topic subscribers and reference subscribers. Registration with
/// `bootstrap != false` delivers the current value or snapshot before any
/// live event. A subscriber returning `Invalid` from any delivery is
/// unregistered on the spot without interrupting delivery to its siblings.
pub struct SubscriptionCollection {
    store: Arc<MapStore>,

    key_subs: RwLock<HashMap<Vec<u8>, Vec<Arc<dyn ValueSubscriber>>>>,
    reference_subs: RwLock<HashMap<Vec<u8>, Vec<Arc<dyn ValueSubscriber>>>>,
    entry_subs: RwLock<Vec<EntryRegistration>>,
    topic_subs: RwLock<Vec<Arc<dyn TopicSubscriber>>>,

    stats: RwLock<SubscriptionStats>,
}

impl SubscriptionCollection {
    pub fn new(store: Arc<MapStore>) -> Self {
        Self {
            store,
            key_subs: RwLock::new(HashMap::new()),
            reference_subs: RwLock::new(HashMap::new()),
            entry_subs: RwLock::new(Vec::new()),
            topic_subs: RwLock::new(Vec::new()),
            stats: RwLock::new(SubscriptionStats::default()),
        }
    }

    /// Register an observer of one key's value
    ///
    /// With bootstrap enabled the current value is delivered before this
    /// call returns; a subscriber reporting `Invalid` on that delivery is
    /// dropped without ever registering for live updates.
    pub fn register_key_subscriber(
        &self,
        context: &RequestContext,
        key: &[u8],
        subscriber: Arc<dyn ValueSubscriber>,
    ) {
        if context.bootstrap() {
            let current = self.store.get(key);
            if subscriber.on_message(current.as_ref()) == SubscriberStatus::Invalid {
                subscriber.on_end_of_subscription();
                self.stats.write().invalid_removed += 1;
                return;
            }
        }

        self.key_subs
            .write()
            .entry(key.to_vec())
            .or_default()
            .push(subscriber);
    }

    /// Register a scalar-reference observer of one key's value
    pub fn register_reference_subscriber(
        &self,
        context: &RequestContext,
        key: &[u8],
        subscriber: Arc<dyn ValueSubscriber>,
    ) {
        if context.bootstrap() {
            let current = self.store.get(key);
            if subscriber.on_message(current.as_ref()) == SubscriberStatus::Invalid {
                subscriber.on_end_of_subscription();
                self.stats.write().invalid_removed += 1;
                return;
            }
        }

        self.reference_subs
            .write()
            .entry(key.to_vec())
            .or_default()
            .push(subscriber);
    }

    /// Register an observer of every map event, optionally filtered
    ///
    /// Bootstrap replays the current contents as insert events.
    pub fn register_entry_subscriber(
        &self,
        context: &RequestContext,
        subscriber: Arc<dyn EntrySubscriber>,
        filter: Option<EventFilter>,
    ) {
        if context.bootstrap() {
            for (key, value) in self.store.entries() {
                let event = MapEvent::Inserted {
                    key: Bytes::from(key),
                    value,
                };
                if let Some(f) = &filter {
                    if !f(&event) {
                        continue;
                    }
                }
                if subscriber.on_event(&event) == SubscriberStatus::Invalid {
                    subscriber.on_end_of_subscription();
                    self.stats.write().invalid_removed += 1;
                    return;
                }
            }
        }

        self.entry_subs
            .write()
            .push(EntryRegistration { subscriber, filter });
    }

    /// Register an observer of topic messages; topics have no backlog, so
    /// there is nothing to bootstrap
    pub fn register_topic_subscriber(&self, subscriber: Arc<dyn TopicSubscriber>) {
        self.topic_subs.write().push(subscriber);
    }

    /// Unregister a key or reference subscriber
    ///
    /// Idempotent: the end-of-subscription callback fires exactly once, on
    /// the call that actually removes the registration. An unknown
    /// subscriber logs a warning and is otherwise a no-op.
    pub fn unregister_value_subscriber(&self, subscriber: &Arc<dyn ValueSubscriber>) -> bool {
        let id = identity_of(subscriber);

        if Self::remove_from_keyed(&self.key_subs, id) || Self::remove_from_keyed(&self.reference_subs, id)
        {
            subscriber.on_end_of_subscription();
            return true;
        }

        warn!("unregister of unknown value subscriber");
        false
    }

    pub fn unregister_entry_subscriber(&self, subscriber: &Arc<dyn EntrySubscriber>) -> bool {
        let id = identity_of(subscriber);
        let mut subs = self.entry_subs.write();
        let before = subs.len();
        subs.retain(|r| identity_of(&r.subscriber) != id);
        let removed = subs.len() < before;
        drop(subs);

        if removed {
            subscriber.on_end_of_subscription();
        } else {
            warn!("unregister of unknown entry subscriber");
        }
        removed
    }

    pub fn unregister_topic_subscriber(&self, subscriber: &Arc<dyn TopicSubscriber>) -> bool {
        let id = identity_of(subscriber);
        let mut subs = self.topic_subs.write();
        let before = subs.len();
        subs.retain(|s| identity_of(s) != id);
        let removed = subs.len() < before;
        drop(subs);

        if removed {
            subscriber.on_end_of_subscription();
        } else {
            warn!("unregister of unknown topic subscriber");
        }
        removed
    }

    /// Fan a map event out to every current subscriber
    ///
    /// A subscriber reporting `Invalid` is removed; delivery to the others
    /// proceeds and the mutation is never rolled back.
    pub fn notify_event(&self, event: &MapEvent) {
        let key = event.key().to_vec();

        self.deliver_value(&self.key_subs, &key, event.value());
        self.deliver_value(&self.reference_subs, &key, event.value());
        self.deliver_entry(event);
    }

    /// Fan a topic message out to every topic subscriber
    pub fn notify_topic(&self, topic: &str, payload: &Bytes) {
        let subs: Vec<Arc<dyn TopicSubscriber>> = self.topic_subs.read().clone();
        if subs.is_empty() {
            return;
        }

        let mut invalid = Vec::new();
        for sub in &subs {
            self.stats.write().events_delivered += 1;
            if sub.on_message(topic, payload) == SubscriberStatus::Invalid {
                invalid.push(identity_of(sub));
            }
        }

        if !invalid.is_empty() {
            let mut subs = self.topic_subs.write();
            subs.retain(|s| {
                if invalid.contains(&identity_of(s)) {
                    s.on_end_of_subscription();
                    false
                } else {
                    true
                }
            });
            self.stats.write().invalid_removed += invalid.len() as u64;
        }
    }

    pub fn key_subscriber_count(&self) -> usize {
        self.key_subs.read().values().map(Vec::len).sum()
    }

    pub fn entry_topic_subscriber_count(&self) -> usize {
        self.entry_subs.read().len() + self.topic_subs.read().len()
    }

    pub fn reference_subscriber_count(&self) -> usize {
        self.reference_subs.read().values().map(Vec::len).sum()
    }

    /// True when no facet holds a subscriber; delivery may be shortcut
    pub fn is_idle(&self) -> bool {
        self.key_subscriber_count() == 0
            && self.entry_topic_subscriber_count() == 0
            && self.reference_subscriber_count() == 0
    }

    pub fn stats(&self) -> SubscriptionStats {
        let mut stats = self.stats.read().clone();
        stats.key_subscribers = self.key_subscriber_count();
        stats.entry_topic_subscribers = self.entry_topic_subscriber_count();
        stats.reference_subscribers = self.reference_subscriber_count();
        stats
    }

    fn deliver_value(
        &self,
        registry: &RwLock<HashMap<Vec<u8>, Vec<Arc<dyn ValueSubscriber>>>>,
        key: &[u8],
        value: Option<&Bytes>,
    ) {
        let subs: Vec<Arc<dyn ValueSubscriber>> = match registry.read().get(key) {
            Some(subs) if !subs.is_empty() => subs.clone(),
            _ => return,
        };

        let mut invalid = Vec::new();
        for sub in &subs {
            self.stats.write().events_delivered += 1;
            if sub.on_message(value) == SubscriberStatus::Invalid {
                invalid.push(identity_of(sub));
            }
        }

        if !invalid.is_empty() {
            debug!("removing {} invalid value subscribers", invalid.len());
            let mut registry = registry.write();
            if let Some(subs) = registry.get_mut(key) {
                subs.retain(|s| {
                    if invalid.contains(&identity_of(s)) {
                        s.on_end_of_subscription();
                        false
                    } else {
                        true
                    }
                });
                if subs.is_empty() {
                    registry.remove(key);
                }
            }
            self.stats.write().invalid_removed += invalid.len() as u64;
        }
    }

    fn deliver_entry(&self, event: &MapEvent) {
        let subs: Vec<(usize, Arc<dyn EntrySubscriber>)> = {
            let guard = self.entry_subs.read();
            guard
                .iter()
                .filter(|r| r.filter.as_ref().is_none_or(|f| f(event)))
                .map(|r| (identity_of(&r.subscriber), r.subscriber.clone()))
                .collect()
        };

        let mut invalid = Vec::new();
        for (id, sub) in &subs {
            self.stats.write().events_delivered += 1;
            if sub.on_event(event) == SubscriberStatus::Invalid {
                invalid.push(*id);
            }
        }

        if !invalid.is_empty() {
            let mut subs = self.entry_subs.write();
            subs.retain(|r| {
                if invalid.contains(&identity_of(&r.subscriber)) {
                    r.subscriber.on_end_of_subscription();
                    false
                } else {
                    true
                }
            });
            self.stats.write().invalid_removed += invalid.len() as u64;
        }
    }

    fn remove_from_keyed(
        registry: &RwLock<HashMap<Vec<u8>, Vec<Arc<dyn ValueSubscriber>>>>,
        id: usize,
    ) -> bool {
        let mut registry = registry.write();
        let mut removed = false;
        registry.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| identity_of(s) != id);
            removed |= subs.len() < before;
            !subs.is_empty()
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        values: Mutex<Vec<Option<Bytes>>>,
        ended: Mutex<u32>,
        invalid_after: Option<usize>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(Vec::new()),
                ended: Mutex::new(0),
                invalid_after: None,
            })
        }

        fn invalid_after(n: usize) -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(Vec::new()),
                ended: Mutex::new(0),
                invalid_after: Some(n),
            })
        }
    }

    impl ValueSubscriber for Recorder {
        fn on_message(&self, value: Option<&Bytes>) -> SubscriberStatus {
            let mut values = self.values.lock();
            values.push(value.cloned());
            match self.invalid_after {
                Some(n) if values.len() > n => SubscriberStatus::Invalid,
                _ => SubscriberStatus::Continue,
            }
        }

        fn on_end_of_subscription(&self) {
            *self.ended.lock() += 1;
        }
    }

    fn collection_with(key: &[u8], value: &'static [u8]) -> SubscriptionCollection {
        let store = Arc::new(MapStore::new());
        store.insert(key, Bytes::from_static(value));
        SubscriptionCollection::new(store)
    }

    #[test]
    fn test_bootstrap_delivers_current_value() {
        let collection = collection_with(b"greeting", b"init");

        let recorder = Recorder::new();
        let context = RequestContext::new("/maps/test");
        collection.register_key_subscriber(
            &context,
            b"greeting",
            recorder.clone() as Arc<dyn ValueSubscriber>,
        );

        assert_eq!(
            recorder.values.lock().as_slice(),
            &[Some(Bytes::from_static(b"init"))]
        );
        assert_eq!(collection.key_subscriber_count(), 1);
    }

    #[test]
    fn test_bootstrap_disabled_skips_initial_value() {
        let collection = collection_with(b"greeting", b"init");

        let recorder = Recorder::new();
        let context = RequestContext::new("/maps/test").with_bootstrap(false);
        collection.register_key_subscriber(
            &context,
            b"greeting",
            recorder.clone() as Arc<dyn ValueSubscriber>,
        );

        assert!(recorder.values.lock().is_empty());
        assert_eq!(collection.key_subscriber_count(), 1);
    }

    #[test]
    fn test_invalid_on_bootstrap_never_registers() {
        let collection = collection_with(b"greeting", b"init");

        let recorder = Recorder::invalid_after(0);
        let context = RequestContext::new("/maps/test");
        collection.register_key_subscriber(
            &context,
            b"greeting",
            recorder.clone() as Arc<dyn ValueSubscriber>,
        );

        assert_eq!(collection.key_subscriber_count(), 0);
        assert_eq!(*recorder.ended.lock(), 1);
    }

    #[test]
    fn test_invalid_during_live_delivery_removes_only_that_subscriber() {
        let collection = collection_with(b"k", b"v0");

        let healthy = Recorder::new();
        let failing = Recorder::invalid_after(1);
        let context = RequestContext::new("/maps/test");
        collection.register_key_subscriber(&context, b"k", healthy.clone() as Arc<dyn ValueSubscriber>);
        collection.register_key_subscriber(&context, b"k", failing.clone() as Arc<dyn ValueSubscriber>);

        let event = MapEvent::Updated {
            key: Bytes::from_static(b"k"),
            old_value: Bytes::from_static(b"v0"),
            value: Bytes::from_static(b"v1"),
        };
        collection.notify_event(&event);

        assert_eq!(collection.key_subscriber_count(), 1);
        assert_eq!(*failing.ended.lock(), 1);
        assert_eq!(*healthy.ended.lock(), 0);
        assert_eq!(healthy.values.lock().len(), 2); // bootstrap + live
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let collection = collection_with(b"k", b"v");

        let recorder = Recorder::new();
        let context = RequestContext::new("/maps/test");
        let sub = recorder.clone() as Arc<dyn ValueSubscriber>;
        collection.register_key_subscriber(&context, b"k", sub.clone());

        assert!(collection.unregister_value_subscriber(&sub));
        assert!(!collection.unregister_value_subscriber(&sub));
        assert_eq!(*recorder.ended.lock(), 1);
    }

    #[test]
    fn test_facet_counts_are_independent() {
        let store = Arc::new(MapStore::new());
        let collection = SubscriptionCollection::new(store);
        let context = RequestContext::new("/maps/test").with_bootstrap(false);

        struct Sink;
        impl EntrySubscriber for Sink {
            fn on_event(&self, _: &MapEvent) -> SubscriberStatus {
                SubscriberStatus::Continue
            }
        }
        impl TopicSubscriber for Sink {
            fn on_message(&self, _: &str, _: &Bytes) -> SubscriberStatus {
                SubscriberStatus::Continue
            }
        }

        collection.register_key_subscriber(&context, b"k", Recorder::new());
        collection.register_reference_subscriber(&context, b"k", Recorder::new());
        collection.register_entry_subscriber(&context, Arc::new(Sink), None);
        collection.register_topic_subscriber(Arc::new(Sink));

        let stats = collection.stats();
        assert_eq!(stats.key_subscribers, 1);
        assert_eq!(stats.reference_subscribers, 1);
        assert_eq!(stats.entry_topic_subscribers, 2);
        assert!(!collection.is_idle());
    }

    #[test]
    fn test_entry_filter() {
        let store = Arc::new(MapStore::new());
        store.insert(b"keep", Bytes::from_static(b"1"));
        store.insert(b"skip", Bytes::from_static(b"2"));
        let collection = SubscriptionCollection::new(store);

        struct Counting(Mutex<Vec<Vec<u8>>>);
        impl EntrySubscriber for Counting {
            fn on_event(&self, event: &MapEvent) -> SubscriberStatus {
                self.0.lock().push(event.key().to_vec());
                SubscriberStatus::Continue
            }
        }

        let sub = Arc::new(Counting(Mutex::new(Vec::new())));
        let context = RequestContext::new("/maps/test");
        collection.register_entry_subscriber(
            &context,
            sub.clone(),
            Some(Box::new(|e| e.key().as_ref() == b"keep")),
        );

        assert_eq!(sub.0.lock().as_slice(), &[b"keep".to_vec()]);
    }
}
