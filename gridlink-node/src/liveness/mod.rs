use crate::channel::WireChannel;
use crate::core::{GridError, Result};
use crate::protocol::frame::{CONTROL_TID, Frame, FrameBody};
use crate::replication::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Liveness parameters of one connection
///
/// The accepting side transmits its configured values once at connection
/// initialize; both sides then run the same periodic tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            timeout_ms: 5_000,
        }
    }
}

impl HeartbeatConfig {
    /// Violating any of these bounds is a configuration fault, fatal at
    /// construction time
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms < 1_000 {
            return Err(GridError::Configuration(format!(
                "heartbeat timeout must be >= 1000ms, got {}",
                self.timeout_ms
            )));
        }
        if self.interval_ms < 500 {
            return Err(GridError::Configuration(format!(
                "heartbeat interval must be >= 500ms, got {}",
                self.interval_ms
            )));
        }
        if self.timeout_ms <= self.interval_ms {
            return Err(GridError::Configuration(format!(
                "heartbeat timeout ({}) must exceed interval ({})",
                self.timeout_ms, self.interval_ms
            )));
        }
        Ok(())
    }
}

/// Liveness state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    AwaitingFirstMessage,
    Healthy,
    Suspect,
    Closed,
}

/// Status a periodic task reports back to its driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Continue,
    StopRecurringTask,
}

/// Observer of connection liveness transitions
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self, local: PeerId, remote: PeerId);
    fn on_disconnected(&self, local: PeerId, remote: PeerId);
}

/// Heartbeat / liveness handler for one connection
///
/// Two periodic tasks drive the state machine: a sender that emits a
/// heartbeat frame when the outbound path has been idle for a full
/// interval (heartbeats never starve or shadow real traffic), and a
/// checker that compares `now - last received` against the timeout.
/// Receiving any frame counts as liveness. Closed is terminal; a new
/// connection gets a new handler.
pub struct HeartbeatHandler {
    config: HeartbeatConfig,
    local: PeerId,
    remote: PeerId,
    channel: Arc<WireChannel>,
    listener: Arc<dyn ConnectionListener>,

    last_received_ms: AtomicI64,
    state: Mutex<LivenessState>,
    closed: AtomicBool,
    reconnect: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl HeartbeatHandler {
    pub fn new(
        config: HeartbeatConfig,
        local: PeerId,
        remote: PeerId,
        channel: Arc<WireChannel>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        Ok(Arc::new(Self {
            config,
            local,
            remote,
            channel,
            listener,
            last_received_ms: AtomicI64::new(now_ms()),
            state: Mutex::new(LivenessState::AwaitingFirstMessage),
            closed: AtomicBool::new(false),
            reconnect: Mutex::new(None),
        }))
    }

    /// Procedure invoked once the connection is gone for good and must be
    /// re-established
    pub fn set_reconnect(&self, reconnect: Box<dyn Fn() + Send + Sync>) {
        *self.reconnect.lock() = Some(reconnect);
    }

    /// Transmit the liveness parameters; called by the accepting side at
    /// connection initialize
    pub fn transmit_config(&self) {
        let frame = Frame::new(
            CONTROL_TID,
            FrameBody::HeartbeatConfig {
                interval_ms: self.config.interval_ms,
                timeout_ms: self.config.timeout_ms,
            },
        );
        if self.channel.send(frame).is_err() {
            warn!("could not transmit heartbeat config, channel closed");
        }
    }

    /// Spawn the two periodic tasks
    pub fn start(self: &Arc<Self>) {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(handler.config.interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if handler.heartbeat_tick() == TaskStatus::StopRecurringTask {
                    break;
                }
            }
        });

        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(handler.config.timeout_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the peer gets a
            // full timeout window before the first check.
            interval.tick().await;
            loop {
                interval.tick().await;
                if handler.check_tick() == TaskStatus::StopRecurringTask {
                    break;
                }
            }
        });
    }

    /// Any received frame, heartbeat or data, counts as liveness
    pub fn record_activity(&self) {
        self.last_received_ms.store(now_ms(), Ordering::SeqCst);

        let mut state = self.state.lock();
        if *state == LivenessState::AwaitingFirstMessage {
            *state = LivenessState::Healthy;
            drop(state);
            debug!("connection {} -> {} saw first message", self.local, self.remote);
            self.listener.on_connected(self.local, self.remote);
        }
    }

    pub fn state(&self) -> LivenessState {
        *self.state.lock()
    }

    /// Idempotent terminal close; the second call is a no-op
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = LivenessState::Closed;
        debug!("heartbeat handler for {} -> {} closed", self.local, self.remote);
    }

    fn heartbeat_tick(&self) -> TaskStatus {
        if self.closed.load(Ordering::SeqCst) {
            return TaskStatus::StopRecurringTask;
        }

        match *self.state.lock() {
            LivenessState::Closed => return TaskStatus::StopRecurringTask,
            // No heartbeats into a link already suspected dead
            LivenessState::Suspect => return TaskStatus::Continue,
            _ => {}
        }

        // Send only when the outbound queue is otherwise idle: real
        // traffic within the last interval already proves liveness.
        let idle_ms = now_ms() - self.channel.last_write_ms();
        if idle_ms >= self.config.interval_ms as i64 {
            let _ = self.channel.send(Frame::heartbeat());
        }

        TaskStatus::Continue
    }

    fn check_tick(&self) -> TaskStatus {
        if self.closed.load(Ordering::SeqCst) {
            return TaskStatus::StopRecurringTask;
        }

        let silent_ms = now_ms() - self.last_received_ms.load(Ordering::SeqCst);
        let alive = silent_ms <= self.config.timeout_ms as i64;

        let mut state = self.state.lock();
        match *state {
            LivenessState::Closed => return TaskStatus::StopRecurringTask,
            LivenessState::Suspect if alive => {
                *state = LivenessState::Healthy;
                drop(state);
                info!(
                    "connection {} -> {} recovered before teardown",
                    self.local, self.remote
                );
                self.listener.on_connected(self.local, self.remote);
            }
            LivenessState::Healthy | LivenessState::AwaitingFirstMessage if !alive => {
                *state = LivenessState::Suspect;
                drop(state);
                warn!(
                    "connection {} -> {} silent for {}ms, declaring down",
                    self.local, self.remote, silent_ms
                );
                self.listener.on_disconnected(self.local, self.remote);

                // Reconnect only once the transport itself is gone, and
                // never after a deliberate terminate.
                if !self.channel.is_open() && !self.channel.is_terminated() {
                    if let Some(reconnect) = self.reconnect.lock().as_ref() {
                        reconnect();
                    }
                }
            }
            _ => {}
        }

        TaskStatus::Continue
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
