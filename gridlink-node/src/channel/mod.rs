use crate::protocol::frame::Frame;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::ThreadId;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel error types
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Recursive write attempt from the thread already holding the write lock")]
    RecursiveWrite,
}

/// Hook replayed after a successful reconnect
pub type ReconnectHook = Box<dyn Fn() + Send + Sync>;

/// One physical connection to a peer, multiplexed by correlation id
///
/// All frame writes are serialized through a channel-scoped write lock held
/// for a single frame at a time and never while awaiting the peer. A write
/// attempted by the thread that already holds the lock is a programming
/// error and fails fast instead of deadlocking.
///
/// The transport behind the channel comes and goes: `connect` attaches a
/// sender, `disconnect` drops it on link loss, and `reconnect` attaches a
/// fresh one and replays the registered resubscription hooks. `terminate`
/// is final.
pub struct WireChannel {
    id: Uuid,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,

    write_holder: Mutex<Option<ThreadId>>,
    write_released: Condvar,

    reconnect_hooks: Mutex<Vec<ReconnectHook>>,
    last_write_ms: AtomicI64,
    terminated: AtomicBool,
}

impl WireChannel {
    /// A channel with no transport attached yet
    pub fn disconnected() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            outbound: Mutex::new(None),
            write_holder: Mutex::new(None),
            write_released: Condvar::new(),
            reconnect_hooks: Mutex::new(Vec::new()),
            last_write_ms: AtomicI64::new(now_ms()),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Attach the initial transport
    pub fn connect(&self, sender: mpsc::UnboundedSender<Frame>) {
        *self.outbound.lock() = Some(sender);
        debug!("channel {} connected", self.id);
    }

    /// Attach a fresh transport and replay resubscription hooks
    pub fn reconnect(&self, sender: mpsc::UnboundedSender<Frame>) {
        if self.terminated.load(Ordering::SeqCst) {
            warn!("ignoring reconnect of terminated channel {}", self.id);
            return;
        }

        *self.outbound.lock() = Some(sender);
        info!("channel {} reconnected, replaying subscriptions", self.id);

        let hooks = self.reconnect_hooks.lock();
        for hook in hooks.iter() {
            hook();
        }
    }

    /// Drop the transport on link loss; the channel may reconnect later
    pub fn disconnect(&self) {
        if self.outbound.lock().take().is_some() {
            debug!("channel {} disconnected", self.id);
        }
    }

    /// Sever the link on purpose; used to exercise reconnect paths in tests
    pub fn force_disconnect(&self) {
        info!("channel {} force-disconnected", self.id);
        self.disconnect();
    }

    /// Final teardown; reconnect is refused afterwards
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.disconnect();
    }

    pub fn is_open(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst) && self.outbound.lock().is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Register a hook replayed on every successful reconnect
    pub fn on_reconnect(&self, hook: ReconnectHook) {
        self.reconnect_hooks.lock().push(hook);
    }

    /// Send one frame under the write lock
    ///
    /// Suspends only until the frame is handed to the transport, never
    /// until a reply arrives.
    pub fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let _guard = self.lock_writer()?;

        let result = {
            let outbound = self.outbound.lock();
            match outbound.as_ref() {
                Some(sender) if !self.terminated.load(Ordering::SeqCst) => {
                    sender.send(frame).map_err(|_| ChannelError::Closed)
                }
                _ => Err(ChannelError::Closed),
            }
        };

        if result.is_ok() {
            self.last_write_ms.store(now_ms(), Ordering::SeqCst);
        }
        result
    }

    /// Acquire the channel-scoped write lock
    ///
    /// Fails fast when the calling thread already holds it.
    pub fn lock_writer(&self) -> Result<WriteGuard<'_>, ChannelError> {
        let me = std::thread::current().id();
        let mut holder = self.write_holder.lock();

        if *holder == Some(me) {
            return Err(ChannelError::RecursiveWrite);
        }
        while holder.is_some() {
            self.write_released.wait(&mut holder);
        }
        *holder = Some(me);

        Ok(WriteGuard { channel: self })
    }

    /// True when the calling thread holds the write lock
    pub fn write_held_by_current_thread(&self) -> bool {
        *self.write_holder.lock() == Some(std::thread::current().id())
    }

    /// Wall-clock ms of the last successful frame write
    pub fn last_write_ms(&self) -> i64 {
        self.last_write_ms.load(Ordering::SeqCst)
    }
}

/// Exclusive hold of a channel's write lock
pub struct WriteGuard<'a> {
    channel: &'a WireChannel,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut holder = self.channel.write_holder.lock();
        *holder = None;
        self.channel.write_released.notify_one();
    }
}

/// Cross-wire two channels in memory, returning each side's inbound frames
///
/// The first element receives what `b` sends, the second what `a` sends.
pub fn link(
    a: &Arc<WireChannel>,
    b: &Arc<WireChannel>,
) -> (
    mpsc::UnboundedReceiver<Frame>,
    mpsc::UnboundedReceiver<Frame>,
) {
    let (a_to_b, b_inbound) = mpsc::unbounded_channel();
    let (b_to_a, a_inbound) = mpsc::unbounded_channel();

    a.connect(a_to_b);
    b.connect(b_to_a);

    (a_inbound, b_inbound)
}

/// Re-establish a severed in-memory link, firing `a`'s resubscription hooks
pub fn relink(
    a: &Arc<WireChannel>,
    b: &Arc<WireChannel>,
) -> (
    mpsc::UnboundedReceiver<Frame>,
    mpsc::UnboundedReceiver<Frame>,
) {
    let (a_to_b, b_inbound) = mpsc::unbounded_channel();
    let (b_to_a, a_inbound) = mpsc::unbounded_channel();

    b.connect(b_to_a);
    a.reconnect(a_to_b);

    (a_inbound, b_inbound)
}

/// Drain a channel's outbound queue onto an async writer
pub fn spawn_frame_writer<W>(
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    mut writer: W,
) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = inbound.recv().await {
            if frame.write_to(&mut writer).await.is_err() {
                break;
            }
        }
    })
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
