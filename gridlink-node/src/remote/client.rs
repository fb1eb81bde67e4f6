use crate::channel::{ChannelError, WireChannel};
use crate::core::subscription::{EntrySubscriber, TopicSubscriber, ValueSubscriber};
use crate::core::{GridError, Result, SubscriberStatus};
use crate::liveness::HeartbeatHandler;
use crate::protocol::context::RequestContext;
use crate::protocol::frame::{Frame, FrameBody, FrameMeta, PushPayload};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A subscriber of one of the three observer shapes
pub enum SubscriberSink {
    Value(Arc<dyn ValueSubscriber>),
    Entry(Arc<dyn EntrySubscriber>),
    Topic(Arc<dyn TopicSubscriber>),
}

impl SubscriberSink {
    /// Subscribers are identified by object identity
    fn identity(&self) -> usize {
        match self {
            SubscriberSink::Value(s) => Arc::as_ptr(s) as *const () as usize,
            SubscriberSink::Entry(s) => Arc::as_ptr(s) as *const () as usize,
            SubscriberSink::Topic(s) => Arc::as_ptr(s) as *const () as usize,
        }
    }

    fn deliver(&self, payload: &PushPayload) -> SubscriberStatus {
        match (self, payload) {
            (SubscriberSink::Value(s), PushPayload::Value { value }) => {
                s.on_message(value.as_ref())
            }
            (SubscriberSink::Entry(s), PushPayload::Event(event)) => s.on_event(event),
            (SubscriberSink::Topic(s), PushPayload::TopicMessage { topic, payload }) => {
                s.on_message(topic, payload)
            }
            _ => {
                warn!("dropping reply whose payload does not match the subscription view");
                SubscriberStatus::Continue
            }
        }
    }

    fn end(&self) {
        match self {
            SubscriberSink::Value(s) => s.on_end_of_subscription(),
            SubscriberSink::Entry(s) => s.on_end_of_subscription(),
            SubscriberSink::Topic(s) => s.on_end_of_subscription(),
        }
    }
}

/// Client-side lifecycle of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    /// Subscribe frame sent, no reply seen yet
    Pending,
    /// At least one reply received
    Active,
    /// Terminal: unregistered or ended by the server
    Ended,
}

struct ClientSubscription {
    context: RequestContext,
    sink: SubscriberSink,
    tid: AtomicI64,
    state: Mutex<SubscriptionState>,
    no_resubscribe: AtomicBool,
    ended: AtomicBool,
}

impl ClientSubscription {
    /// Fires the end-of-subscription callback exactly once per lifetime
    fn end_once(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            *self.state.lock() = SubscriptionState::Ended;
            self.sink.end();
        }
    }
}

/// Client half of the remote subscription protocol
///
/// Stateless toward the wire: every registration is a Subscribe frame
/// tagged with a freshly allocated tid, replies come back asynchronously
/// on the connection's read path and are dispatched by tid lookup. On
/// reconnect, every registration not marked do-not-resubscribe is replayed
/// verbatim under a new tid, so bootstrap redelivery hands the subscriber a
/// fresh consistent snapshot instead of a silent gap.
pub struct RemoteSubscriptionClient {
    channel: Arc<WireChannel>,
    next_tid: AtomicI64,
    by_tid: Mutex<HashMap<i64, Arc<ClientSubscription>>>,
    by_identity: Mutex<HashMap<usize, Arc<ClientSubscription>>>,
}

impl RemoteSubscriptionClient {
    pub fn new(channel: Arc<WireChannel>) -> Arc<Self> {
        let client = Arc::new(Self {
            channel: channel.clone(),
            next_tid: AtomicI64::new(1),
            by_tid: Mutex::new(HashMap::new()),
            by_identity: Mutex::new(HashMap::new()),
        });

        let hook_client = Arc::downgrade(&client);
        channel.on_reconnect(Box::new(move || {
            if let Some(client) = hook_client.upgrade() {
                client.resubscribe_all();
            }
        }));

        client
    }

    pub fn channel(&self) -> &Arc<WireChannel> {
        &self.channel
    }

    /// Register a subscriber, sending the subscribe frame asynchronously
    ///
    /// Suspends only until the frame is handed to the transport; replies
    /// arrive later on the read path. Registering from a thread that
    /// already holds the channel's write lock is a programming error and
    /// fails fast.
    pub fn register_subscriber(
        &self,
        context: RequestContext,
        sink: SubscriberSink,
    ) -> Result<i64> {
        if self.channel.write_held_by_current_thread() {
            return Err(GridError::IllegalState(
                "registerSubscriber called while holding the channel write lock".to_string(),
            ));
        }

        let identity = sink.identity();
        if self.by_identity.lock().contains_key(&identity) {
            return Err(GridError::InvalidRequest(
                "subscriber is already registered on this connection".to_string(),
            ));
        }

        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        let subscription = Arc::new(ClientSubscription {
            context,
            sink,
            tid: AtomicI64::new(tid),
            state: Mutex::new(SubscriptionState::Pending),
            no_resubscribe: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        });

        self.by_tid.lock().insert(tid, subscription.clone());
        self.by_identity.lock().insert(identity, subscription.clone());

        match self.send_subscribe(&subscription, tid) {
            Ok(()) => {}
            // A closed link is not an error: the reconnect replay will
            // re-issue the subscribe once the channel is back.
            Err(ChannelError::Closed) => {
                debug!("subscribe deferred, channel currently closed (tid {})", tid)
            }
            Err(ChannelError::RecursiveWrite) => {
                self.by_tid.lock().remove(&tid);
                self.by_identity.lock().remove(&identity);
                return Err(GridError::IllegalState(
                    "recursive write while sending subscribe frame".to_string(),
                ));
            }
        }

        Ok(tid)
    }

    /// Unregister a subscriber
    ///
    /// Idempotent and safe from any thread, including after the connection
    /// is already gone: a closed channel skips the network write but local
    /// bookkeeping is still cleared. The end-of-subscription callback fires
    /// exactly once.
    pub fn unregister_subscriber(&self, sink: &SubscriberSink) -> Result<()> {
        let identity = sink.identity();

        let Some(subscription) = self.by_identity.lock().remove(&identity) else {
            warn!("unregister of unknown remote subscriber");
            return Ok(());
        };

        subscription.no_resubscribe.store(true, Ordering::SeqCst);
        let tid = subscription.tid.load(Ordering::SeqCst);
        self.by_tid.lock().remove(&tid);

        if self.channel.is_open() {
            let frame = Frame::new(tid, FrameBody::Unsubscribe);
            if let Err(e) = self.channel.send(frame) {
                debug!("skipping unsubscribe frame for tid {}: {}", tid, e);
            }
        }

        subscription.end_once();
        Ok(())
    }

    /// Publish a message into a remote asset's topic
    pub fn publish(&self, csp: &str, topic: &str, payload: Bytes) -> Result<()> {
        let frame = Frame {
            meta: FrameMeta::for_tid(self.next_tid.fetch_add(1, Ordering::SeqCst))
                .with_csp(csp),
            body: FrameBody::Publish {
                topic: topic.to_string(),
                payload,
            },
        };
        self.channel
            .send(frame)
            .map_err(|_| GridError::ChannelClosed)
    }

    /// Dispatch one frame from the connection's read path by tid lookup
    pub fn dispatch(&self, frame: Frame) {
        let tid = frame.tid();
        match frame.body {
            FrameBody::Reply { payload } => {
                let Some(subscription) = self.by_tid.lock().get(&tid).cloned() else {
                    debug!("dropping reply for unknown tid {}", tid);
                    return;
                };

                {
                    let mut state = subscription.state.lock();
                    if *state == SubscriptionState::Pending {
                        *state = SubscriptionState::Active;
                    }
                }

                if subscription.sink.deliver(&payload) == SubscriberStatus::Invalid {
                    debug!("subscriber for tid {} became invalid, unregistering", tid);
                    self.remove_subscription(&subscription, tid, true);
                }
            }
            FrameBody::EndOfSubscription => {
                let Some(subscription) = self.by_tid.lock().get(&tid).cloned() else {
                    debug!("dropping end-of-subscription for unknown tid {}", tid);
                    return;
                };
                subscription.no_resubscribe.store(true, Ordering::SeqCst);
                self.remove_subscription(&subscription, tid, false);
            }
            FrameBody::Heartbeat | FrameBody::HeartbeatConfig { .. } => {
                // Liveness already recorded by the read loop
            }
            other => {
                warn!("dropping unexpected frame on client connection: {:?}", other);
            }
        }
    }

    /// Replay every live registration after a reconnect, under fresh tids
    pub fn resubscribe_all(&self) {
        let subscriptions: Vec<Arc<ClientSubscription>> = self
            .by_identity
            .lock()
            .values()
            .filter(|s| !s.no_resubscribe.load(Ordering::SeqCst))
            .cloned()
            .collect();

        debug!("resubscribing {} registrations", subscriptions.len());

        for subscription in subscriptions {
            let old_tid = subscription.tid.load(Ordering::SeqCst);
            let new_tid = self.next_tid.fetch_add(1, Ordering::SeqCst);

            {
                let mut by_tid = self.by_tid.lock();
                by_tid.remove(&old_tid);
                by_tid.insert(new_tid, subscription.clone());
            }
            subscription.tid.store(new_tid, Ordering::SeqCst);
            *subscription.state.lock() = SubscriptionState::Pending;

            if let Err(e) = self.send_subscribe(&subscription, new_tid) {
                warn!("resubscribe of tid {} failed: {}", new_tid, e);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.by_identity.lock().len()
    }

    fn send_subscribe(
        &self,
        subscription: &Arc<ClientSubscription>,
        tid: i64,
    ) -> std::result::Result<(), ChannelError> {
        let frame = Frame {
            meta: FrameMeta::for_tid(tid).with_csp(subscription.context.csp()),
            body: FrameBody::Subscribe {
                uri: subscription.context.to_uri(),
            },
        };
        self.channel.send(frame)
    }

    fn remove_subscription(
        &self,
        subscription: &Arc<ClientSubscription>,
        tid: i64,
        notify_server: bool,
    ) {
        self.by_tid.lock().remove(&tid);
        self.by_identity
            .lock()
            .remove(&subscription.sink.identity());

        if notify_server && self.channel.is_open() {
            let _ = self.channel.send(Frame::new(tid, FrameBody::Unsubscribe));
        }

        subscription.end_once();
    }
}

/// Pump inbound frames into the client, recording liveness first
pub fn spawn_dispatch(
    client: Arc<RemoteSubscriptionClient>,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    heartbeat: Option<Arc<HeartbeatHandler>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = inbound.recv().await {
            if let Some(handler) = &heartbeat {
                handler.record_activity();
            }
            client.dispatch(frame);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use parking_lot::Mutex as PlMutex;

    struct Recorder {
        values: PlMutex<Vec<Option<Bytes>>>,
        ended: PlMutex<u32>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                values: PlMutex::new(Vec::new()),
                ended: PlMutex::new(0),
            })
        }
    }

    impl ValueSubscriber for Recorder {
        fn on_message(&self, value: Option<&Bytes>) -> SubscriberStatus {
            self.values.lock().push(value.cloned());
            SubscriberStatus::Continue
        }
        fn on_end_of_subscription(&self) {
            *self.ended.lock() += 1;
        }
    }

    fn key_context() -> RequestContext {
        RequestContext::new("/maps/test")
            .with_view(crate::protocol::context::SubscriptionView::Key)
            .with_key("hello")
    }

    #[tokio::test]
    async fn test_register_sends_subscribe_frame() {
        let local = WireChannel::disconnected();
        let remote = WireChannel::disconnected();
        let (_local_in, mut remote_in) = channel::link(&local, &remote);

        let client = RemoteSubscriptionClient::new(local);
        let recorder = Recorder::new();
        let tid = client
            .register_subscriber(key_context(), SubscriberSink::Value(recorder))
            .unwrap();

        let frame = remote_in.recv().await.unwrap();
        assert_eq!(frame.tid(), tid);
        assert!(matches!(
            frame.body,
            FrameBody::Subscribe { uri } if uri.contains("view=key") && uri.contains("key=hello")
        ));
    }

    #[tokio::test]
    async fn test_reply_dispatched_by_tid() {
        let local = WireChannel::disconnected();
        let remote = WireChannel::disconnected();
        let _receivers = channel::link(&local, &remote);

        let client = RemoteSubscriptionClient::new(local);
        let recorder = Recorder::new();
        let tid = client
            .register_subscriber(key_context(), SubscriberSink::Value(recorder.clone()))
            .unwrap();

        client.dispatch(Frame::new(
            tid,
            FrameBody::Reply {
                payload: PushPayload::Value {
                    value: Some(Bytes::from_static(b"init")),
                },
            },
        ));

        assert_eq!(
            recorder.values.lock().as_slice(),
            &[Some(Bytes::from_static(b"init"))]
        );
    }

    #[tokio::test]
    async fn test_end_of_subscription_fires_once_and_unmaps() {
        let local = WireChannel::disconnected();
        let remote = WireChannel::disconnected();
        let _receivers = channel::link(&local, &remote);

        let client = RemoteSubscriptionClient::new(local);
        let recorder = Recorder::new();
        let tid = client
            .register_subscriber(key_context(), SubscriberSink::Value(recorder.clone()))
            .unwrap();

        client.dispatch(Frame::new(tid, FrameBody::EndOfSubscription));
        client.dispatch(Frame::new(tid, FrameBody::EndOfSubscription));

        assert_eq!(*recorder.ended.lock(), 1);
        assert_eq!(client.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_after_disconnect_is_safe() {
        let local = WireChannel::disconnected();
        let remote = WireChannel::disconnected();
        let _receivers = channel::link(&local, &remote);

        let client = RemoteSubscriptionClient::new(local.clone());
        let recorder = Recorder::new();
        client
            .register_subscriber(
                key_context(),
                SubscriberSink::Value(recorder.clone()),
            )
            .unwrap();

        local.force_disconnect();

        let sink = SubscriberSink::Value(recorder.clone());
        client.unregister_subscriber(&sink).unwrap();
        client.unregister_subscriber(&sink).unwrap(); // idempotent

        assert_eq!(client.active_count(), 0);
        assert_eq!(*recorder.ended.lock(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let local = WireChannel::disconnected();
        let remote = WireChannel::disconnected();
        let _receivers = channel::link(&local, &remote);

        let client = RemoteSubscriptionClient::new(local);
        let recorder = Recorder::new();
        client
            .register_subscriber(key_context(), SubscriberSink::Value(recorder.clone()))
            .unwrap();

        let result =
            client.register_subscriber(key_context(), SubscriberSink::Value(recorder));
        assert!(matches!(result, Err(GridError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_resubscribe_uses_fresh_tid_and_same_uri() {
        let local = WireChannel::disconnected();
        let remote = WireChannel::disconnected();
        let (_local_in, mut remote_in) = channel::link(&local, &remote);

        let client = RemoteSubscriptionClient::new(local.clone());
        let recorder = Recorder::new();
        let tid = client
            .register_subscriber(key_context(), SubscriberSink::Value(recorder))
            .unwrap();
        let first = remote_in.recv().await.unwrap();

        local.force_disconnect();
        remote.force_disconnect();
        let (_local_in, mut remote_in) = channel::relink(&local, &remote);

        let second = remote_in.recv().await.unwrap();
        assert_ne!(second.tid(), tid);
        assert_eq!(second.body, first.body); // same context, verbatim
        assert_eq!(client.active_count(), 1);
    }

    #[tokio::test]
    async fn test_register_under_write_lock_fails_fast() {
        let local = WireChannel::disconnected();
        let remote = WireChannel::disconnected();
        let _receivers = channel::link(&local, &remote);

        let client = RemoteSubscriptionClient::new(local.clone());
        let _guard = local.lock_writer().unwrap();

        let result = client.register_subscriber(
            key_context(),
            SubscriberSink::Value(Recorder::new()),
        );
        assert!(matches!(result, Err(GridError::IllegalState(_))));
    }
}
