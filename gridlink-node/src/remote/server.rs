use crate::channel::{ChannelError, WireChannel};
use crate::core::subscription::{EntrySubscriber, TopicSubscriber, ValueSubscriber};
use crate::core::{MapEvent, SubscriberStatus};
use crate::protocol::context::{RequestContext, SubscriptionView};
use crate::protocol::frame::{Frame, FrameBody, PushPayload};
use crate::registry::AssetRegistry;
use crate::replication::ReplicatedMap;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Coalesces pushes per subscription when `throttlePeriodMs` is set
///
/// An event inside the window is skipped; the subscriber catches up on the
/// next event after the window, and bootstrap always goes through first.
struct Throttle {
    period_ms: u64,
    last_sent_ms: AtomicI64,
}

impl Throttle {
    fn new(period_ms: u64) -> Self {
        Self {
            period_ms,
            last_sent_ms: AtomicI64::new(0),
        }
    }

    fn admit(&self) -> bool {
        if self.period_ms == 0 {
            return true;
        }
        let now = now_ms();
        let last = self.last_sent_ms.load(Ordering::SeqCst);
        if now - last >= self.period_ms as i64 {
            self.last_sent_ms.store(now, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

/// Forwards one subscription's pushes over the wire as Reply frames
struct RemotePush {
    channel: Arc<WireChannel>,
    tid: i64,
    throttle: Throttle,
}

impl RemotePush {
    fn new(channel: Arc<WireChannel>, tid: i64, throttle_period_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            channel,
            tid,
            throttle: Throttle::new(throttle_period_ms),
        })
    }

    fn push(&self, payload: PushPayload) -> SubscriberStatus {
        if !self.throttle.admit() {
            return SubscriberStatus::Continue;
        }

        match self
            .channel
            .send(Frame::new(self.tid, FrameBody::Reply { payload }))
        {
            Ok(()) => SubscriberStatus::Continue,
            // A dead connection invalidates the registration so the local
            // collection sheds it instead of leaking.
            Err(ChannelError::Closed) => SubscriberStatus::Invalid,
            Err(e) => {
                warn!("push for tid {} failed: {}", self.tid, e);
                SubscriberStatus::Continue
            }
        }
    }

    fn push_end(&self) {
        if self.channel.is_open() {
            let _ = self
                .channel
                .send(Frame::new(self.tid, FrameBody::EndOfSubscription));
        }
    }
}

impl ValueSubscriber for RemotePush {
    fn on_message(&self, value: Option<&Bytes>) -> SubscriberStatus {
        self.push(PushPayload::Value {
            value: value.cloned(),
        })
    }

    fn on_end_of_subscription(&self) {
        self.push_end();
    }
}

impl EntrySubscriber for RemotePush {
    fn on_event(&self, event: &MapEvent) -> SubscriberStatus {
        self.push(PushPayload::Event(event.clone()))
    }

    fn on_end_of_subscription(&self) {
        self.push_end();
    }
}

impl TopicSubscriber for RemotePush {
    fn on_message(&self, topic: &str, payload: &Bytes) -> SubscriberStatus {
        self.push(PushPayload::TopicMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
        })
    }

    fn on_end_of_subscription(&self) {
        self.push_end();
    }
}

/// One live server-side registration: the mirror of a client tid
struct ActiveSubscription {
    map: Arc<ReplicatedMap>,
    view: SubscriptionView,
    adapter: Arc<RemotePush>,
}

impl ActiveSubscription {
    fn unregister(&self) {
        match self.view {
            SubscriptionView::Key | SubscriptionView::Reference => {
                let subscriber: Arc<dyn ValueSubscriber> = self.adapter.clone();
                self.map.subscriptions().unregister_value_subscriber(&subscriber);
            }
            SubscriptionView::Entry => {
                let subscriber: Arc<dyn EntrySubscriber> = self.adapter.clone();
                self.map.subscriptions().unregister_entry_subscriber(&subscriber);
            }
            SubscriptionView::Topic => {
                let subscriber: Arc<dyn TopicSubscriber> = self.adapter.clone();
                self.map.subscriptions().unregister_topic_subscriber(&subscriber);
            }
        }
    }
}

/// Server half of the remote subscription protocol, one per connection
///
/// Holds, per active tid, the local registration backing it. A protocol
/// fault on a single frame drops that frame only; closing the connection
/// unregisters every local subscription so dead connections leak nothing.
pub struct SubscriptionServer {
    registry: Arc<AssetRegistry>,
    channel: Arc<WireChannel>,
    active: Mutex<HashMap<i64, ActiveSubscription>>,
}

impl SubscriptionServer {
    pub fn new(registry: Arc<AssetRegistry>, channel: Arc<WireChannel>) -> Self {
        Self {
            registry,
            channel,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one inbound frame from this connection's read path
    pub fn handle_frame(&self, frame: Frame) {
        let tid = frame.tid();
        match frame.body {
            FrameBody::Subscribe { uri } => self.handle_subscribe(tid, &uri),
            FrameBody::Unsubscribe => self.handle_unsubscribe(tid),
            FrameBody::Publish { topic, payload } => {
                match frame.meta.csp {
                    Some(csp) => {
                        let map = self.registry.acquire_map(&csp);
                        if let Err(e) = map.publish(&topic, payload) {
                            warn!("publish into {} failed: {}", csp, e);
                        }
                    }
                    None => warn!("dropping publish frame without a service path"),
                }
            }
            FrameBody::Heartbeat | FrameBody::HeartbeatConfig { .. } => {
                // Liveness is recorded by the read loop
            }
            other => {
                // Protocol fault on a single frame; the connection lives on
                warn!("dropping unexpected frame on server connection: {:?}", other);
            }
        }
    }

    fn handle_subscribe(&self, tid: i64, uri: &str) {
        let context = match RequestContext::parse(uri) {
            Ok(context) => context,
            Err(e) => {
                warn!("rejecting malformed subscribe uri {}: {}", uri, e);
                let _ = self
                    .channel
                    .send(Frame::new(tid, FrameBody::EndOfSubscription));
                return;
            }
        };

        let map = self.registry.acquire_map(context.csp());
        let adapter = RemotePush::new(
            self.channel.clone(),
            tid,
            context.throttle_period_ms(),
        );

        match context.view() {
            SubscriptionView::Key | SubscriptionView::Reference => {
                let Some(key) = context.key() else {
                    warn!("subscribe uri {} lacks the required key option", uri);
                    let _ = self
                        .channel
                        .send(Frame::new(tid, FrameBody::EndOfSubscription));
                    return;
                };
                let subscriber: Arc<dyn ValueSubscriber> = adapter.clone();
                if context.view() == SubscriptionView::Key {
                    map.register_key_subscriber(&context, key.as_bytes(), subscriber);
                } else {
                    map.register_reference_subscriber(&context, key.as_bytes(), subscriber);
                }
            }
            SubscriptionView::Entry => {
                let subscriber: Arc<dyn EntrySubscriber> = adapter.clone();
                map.register_entry_subscriber(&context, subscriber, None);
            }
            SubscriptionView::Topic => {
                let subscriber: Arc<dyn TopicSubscriber> = adapter.clone();
                map.register_topic_subscriber(subscriber);
            }
        }

        debug!(
            "subscription tid {} opened on {} ({:?})",
            tid,
            context.csp(),
            context.view()
        );

        self.active.lock().insert(
            tid,
            ActiveSubscription {
                map,
                view: context.view(),
                adapter,
            },
        );
    }

    fn handle_unsubscribe(&self, tid: i64) {
        match self.active.lock().remove(&tid) {
            Some(subscription) => {
                debug!("subscription tid {} closed by client", tid);
                subscription.unregister();
            }
            None => warn!("unsubscribe for unknown tid {}", tid),
        }
    }

    /// Number of live registrations on this connection
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Unregister every local subscription this connection holds
    ///
    /// Must run when the connection goes away, or dead connections would
    /// leak local subscribers.
    pub fn close_connection(&self) {
        let subscriptions: Vec<ActiveSubscription> =
            self.active.lock().drain().map(|(_, s)| s).collect();
        if !subscriptions.is_empty() {
            debug!(
                "connection closed, unregistering {} subscriptions",
                subscriptions.len()
            );
        }
        for subscription in subscriptions {
            subscription.unregister();
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::replication::PeerId;

    fn setup() -> (
        Arc<AssetRegistry>,
        SubscriptionServer,
        tokio::sync::mpsc::UnboundedReceiver<Frame>,
    ) {
        let registry = Arc::new(AssetRegistry::new(PeerId::new(1).unwrap()));
        let server_side = WireChannel::disconnected();
        let client_side = WireChannel::disconnected();
        let (client_in, _server_in) = channel::link(&client_side, &server_side);
        // The server writes through its own end; what it sends arrives on
        // the client's inbound queue.
        let server = SubscriptionServer::new(registry.clone(), server_side);
        (registry, server, client_in)
    }

    fn subscribe_frame(tid: i64, uri: &str) -> Frame {
        Frame::new(
            tid,
            FrameBody::Subscribe {
                uri: uri.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_subscribe_delivers_bootstrap_reply() {
        let (registry, server, mut client_in) = setup();
        registry
            .acquire_map("/maps/test")
            .put(b"hello", Bytes::from_static(b"init"))
            .unwrap();

        server.handle_frame(subscribe_frame(5, "/maps/test?view=key&key=hello"));

        let reply = client_in.recv().await.unwrap();
        assert_eq!(reply.tid(), 5);
        assert_eq!(
            reply.body,
            FrameBody::Reply {
                payload: PushPayload::Value {
                    value: Some(Bytes::from_static(b"init"))
                }
            }
        );
        assert_eq!(server.active_count(), 1);
    }

    #[tokio::test]
    async fn test_live_events_pushed_after_bootstrap() {
        let (registry, server, mut client_in) = setup();
        let map = registry.acquire_map("/maps/test");

        server.handle_frame(subscribe_frame(5, "/maps/test?view=key&key=hello"));
        let _bootstrap = client_in.recv().await.unwrap();

        map.put(b"hello", Bytes::from_static(b"world")).unwrap();

        let push = client_in.recv().await.unwrap();
        assert_eq!(
            push.body,
            FrameBody::Reply {
                payload: PushPayload::Value {
                    value: Some(Bytes::from_static(b"world"))
                }
            }
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_local_registration() {
        let (registry, server, mut client_in) = setup();
        let map = registry.acquire_map("/maps/test");

        server.handle_frame(subscribe_frame(5, "/maps/test?view=key&key=hello"));
        let _bootstrap = client_in.recv().await.unwrap();
        assert_eq!(map.subscriptions().key_subscriber_count(), 1);

        server.handle_frame(Frame::new(5, FrameBody::Unsubscribe));

        assert_eq!(map.subscriptions().key_subscriber_count(), 0);
        assert_eq!(server.active_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_close_unregisters_everything() {
        let (registry, server, mut client_in) = setup();
        let map = registry.acquire_map("/maps/test");

        server.handle_frame(subscribe_frame(1, "/maps/test?view=key&key=a"));
        server.handle_frame(subscribe_frame(2, "/maps/test?view=entry&bootstrap=false"));
        let _bootstrap = client_in.recv().await.unwrap();

        server.close_connection();

        assert_eq!(map.subscriptions().key_subscriber_count(), 0);
        assert_eq!(map.subscriptions().entry_topic_subscriber_count(), 0);
        assert_eq!(server.active_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_subscribe_ends_that_tid_only() {
        let (_registry, server, mut client_in) = setup();

        server.handle_frame(subscribe_frame(9, "/maps/test?view=column"));

        let end = client_in.recv().await.unwrap();
        assert_eq!(end.tid(), 9);
        assert_eq!(end.body, FrameBody::EndOfSubscription);
        assert_eq!(server.active_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_lands_in_topic() {
        let (registry, server, mut client_in) = setup();
        let map = registry.acquire_map("/maps/feed");

        server.handle_frame(subscribe_frame(3, "/maps/feed?view=topic"));

        let frame = Frame {
            meta: crate::protocol::frame::FrameMeta::for_tid(4).with_csp("/maps/feed"),
            body: FrameBody::Publish {
                topic: "news".to_string(),
                payload: Bytes::from_static(b"flash"),
            },
        };
        server.handle_frame(frame);

        let push = client_in.recv().await.unwrap();
        assert_eq!(push.tid(), 3);
        assert_eq!(
            push.body,
            FrameBody::Reply {
                payload: PushPayload::TopicMessage {
                    topic: "news".to_string(),
                    payload: Bytes::from_static(b"flash"),
                }
            }
        );
        assert_eq!(map.get(b"news"), Some(Bytes::from_static(b"flash")));
    }
}
