use crate::channel::{self, WireChannel};
use crate::config::{NodeConfig, PeerEntry};
use crate::core::GridError;
use crate::liveness::{ConnectionListener, HeartbeatConfig, HeartbeatHandler};
use crate::protocol::frame::{Frame, FrameBody};
use crate::registry::AssetRegistry;
use crate::remote::{RemoteSubscriptionClient, SubscriptionServer};
use crate::replication::{PeerId, ReplicationMessage, ReplicationResult};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause between drain sweeps when no entries are pending
const DRAIN_IDLE_MS: u64 = 20;

/// Liveness observer that just logs transitions
pub struct LogListener;

impl ConnectionListener for LogListener {
    fn on_connected(&self, local: PeerId, remote: PeerId) {
        info!("connection up: {} -> {}", local, remote);
    }

    fn on_disconnected(&self, local: PeerId, remote: PeerId) {
        warn!("connection down: {} -> {}", local, remote);
    }
}

/// A grid node: hosted assets plus the listeners and peer sessions that
/// keep them consistent and watched
///
/// - subscription listener: serves the remote subscription protocol
/// - replication listener: drains modification iterators to peers that
///   announce themselves with a Hello
/// - peer receivers: connect out to every configured peer and apply what
///   that peer drains for us, reconnecting with a fresh catch-up after
///   any loss
pub struct GridNode {
    config: NodeConfig,
    local: PeerId,
    registry: Arc<AssetRegistry>,
}

impl GridNode {
    pub fn new(config: NodeConfig) -> Result<Self, GridError> {
        config.validate()?;
        let local = PeerId::new(config.node.identifier)
            .map_err(|e| GridError::Configuration(e.to_string()))?;

        Ok(Self {
            registry: Arc::new(AssetRegistry::new(local)),
            local,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<AssetRegistry> {
        &self.registry
    }

    pub fn local_identifier(&self) -> PeerId {
        self.local
    }

    /// Start every listener and peer session
    pub async fn start(&self) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let mut tasks = Vec::new();

        let subscription_listener =
            TcpListener::bind(self.config.subscription.listen_address).await?;
        info!(
            "node {} serving subscriptions on {}",
            self.config.node.name,
            self.config.subscription.listen_address
        );
        tasks.push(tokio::spawn(Self::run_subscription_listener(
            subscription_listener,
            self.registry.clone(),
            self.config.heartbeat,
            self.local,
        )));

        let replication_listener =
            TcpListener::bind(self.config.replication.listen_address).await?;
        info!(
            "node {} serving replication on {}",
            self.config.node.name,
            self.config.replication.listen_address
        );
        tasks.push(tokio::spawn(Self::run_replication_listener(
            replication_listener,
            self.registry.clone(),
            self.config.heartbeat,
        )));

        for peer in self.config.replication.peers.clone() {
            tasks.push(tokio::spawn(Self::run_peer_receiver(
                self.local,
                peer,
                self.registry.clone(),
                self.config.replication.reconnect_delay_ms,
            )));
        }

        Ok(tasks)
    }

    async fn run_subscription_listener(
        listener: TcpListener,
        registry: Arc<AssetRegistry>,
        heartbeat: HeartbeatConfig,
        local: PeerId,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("new subscription connection from {}", addr);
                    tokio::spawn(Self::handle_subscription_connection(
                        stream,
                        registry.clone(),
                        heartbeat,
                        local,
                    ));
                }
                Err(e) => warn!("failed to accept subscription connection: {}", e),
            }
        }
    }

    async fn handle_subscription_connection(
        stream: TcpStream,
        registry: Arc<AssetRegistry>,
        heartbeat: HeartbeatConfig,
        local: PeerId,
    ) {
        let (mut read_half, write_half) = stream.into_split();

        let wire = WireChannel::disconnected();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        wire.connect(outbound_tx);
        let writer = channel::spawn_frame_writer(outbound_rx, write_half);

        let server = SubscriptionServer::new(registry, wire.clone());

        // The accepting side owns the liveness parameters and transmits
        // them before anything else. Subscription clients carry no host
        // identifier, so the local id stands in for both ends.
        let handler = match HeartbeatHandler::new(
            heartbeat,
            local,
            local,
            wire.clone(),
            Arc::new(LogListener),
        ) {
            Ok(handler) => handler,
            Err(e) => {
                error!("refusing connection, invalid heartbeat config: {}", e);
                return;
            }
        };
        handler.transmit_config();
        handler.start();

        Self::pump_subscription_frames(&mut read_half, &server, &handler).await;

        wire.terminate();
        handler.close();
        server.close_connection();
        writer.abort();
    }

    async fn pump_subscription_frames(
        read_half: &mut OwnedReadHalf,
        server: &SubscriptionServer,
        handler: &Arc<HeartbeatHandler>,
    ) {
        loop {
            match Frame::read_from(read_half).await {
                Ok(Some(frame)) => {
                    handler.record_activity();
                    server.handle_frame(frame);
                }
                Ok(None) => {
                    debug!("subscription connection closed by peer");
                    return;
                }
                // One undecodable frame is rejected; the framing survives
                Err(GridError::SerializationError(e)) => {
                    warn!("dropping undecodable frame: {}", e);
                }
                Err(e) => {
                    warn!("subscription connection failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn run_replication_listener(
        listener: TcpListener,
        registry: Arc<AssetRegistry>,
        heartbeat: HeartbeatConfig,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("new replication connection from {}", addr);
                    tokio::spawn(Self::handle_replication_connection(
                        stream,
                        registry.clone(),
                        heartbeat,
                    ));
                }
                Err(e) => warn!("failed to accept replication connection: {}", e),
            }
        }
    }

    /// Serve one peer: wait for its Hello, catch it up from its last-seen
    /// timestamp, then keep draining the iterators as mutations land
    async fn handle_replication_connection(
        mut stream: TcpStream,
        registry: Arc<AssetRegistry>,
        heartbeat: HeartbeatConfig,
    ) {
        let (peer, last_seen) = match ReplicationMessage::read_from(&mut stream).await {
            Ok(Some(ReplicationMessage::Hello {
                identifier,
                last_seen_timestamp,
            })) => (identifier, last_seen_timestamp),
            Ok(_) => {
                warn!("replication connection did not open with a hello");
                return;
            }
            Err(e) => {
                warn!("replication handshake failed: {}", e);
                return;
            }
        };

        info!(
            "replication peer {} connected, catching up from {}",
            peer, last_seen
        );

        if let Err(e) = Self::drain_to_peer(&mut stream, &registry, peer, last_seen, heartbeat).await
        {
            warn!("replication session with peer {} ended: {}", peer, e);
        }
        info!("replication peer {} disconnected", peer);
    }

    async fn drain_to_peer(
        stream: &mut TcpStream,
        registry: &Arc<AssetRegistry>,
        peer: PeerId,
        last_seen: i64,
        heartbeat: HeartbeatConfig,
    ) -> ReplicationResult<()> {
        let mut known_assets: HashSet<String> = HashSet::new();
        let mut idle_ms: u64 = 0;

        loop {
            let mut drained = 0usize;

            for map in registry.maps() {
                let iterator = map.acquire_modification_iterator(peer);

                // An asset this session has not served yet replays its
                // history from the peer's watermark; the conflict rule on
                // the far side absorbs any overlap.
                if known_assets.insert(map.name().to_string()) {
                    iterator.dirty_entries(last_seen);
                }

                let mut pending = Vec::new();
                iterator.for_each(|entry| pending.push(entry.clone()));

                for entry in pending {
                    let message = ReplicationMessage::Entry {
                        asset: map.name().to_string(),
                        entry,
                    };
                    message.write_to(stream).await?;
                    drained += 1;
                }
            }

            if drained == 0 {
                tokio::time::sleep(Duration::from_millis(DRAIN_IDLE_MS)).await;
                idle_ms += DRAIN_IDLE_MS;
                if idle_ms >= heartbeat.interval_ms {
                    ReplicationMessage::Heartbeat {
                        timestamp: now_ms(),
                    }
                    .write_to(stream)
                    .await?;
                    idle_ms = 0;
                }
            } else {
                idle_ms = 0;
            }
        }
    }

    /// Connect out to a peer's replication listener and apply its entries,
    /// re-announcing our watermark after every reconnect
    async fn run_peer_receiver(
        local: PeerId,
        peer: PeerEntry,
        registry: Arc<AssetRegistry>,
        reconnect_delay_ms: u64,
    ) {
        let last_seen = AtomicI64::new(0);
        let reconnect_delay = Duration::from_millis(reconnect_delay_ms);

        loop {
            match TcpStream::connect(peer.address).await {
                Ok(mut stream) => {
                    info!(
                        "connected to replication peer {} at {}",
                        peer.identifier, peer.address
                    );

                    let hello = ReplicationMessage::Hello {
                        identifier: local,
                        last_seen_timestamp: last_seen.load(Ordering::SeqCst),
                    };

                    match hello.write_to(&mut stream).await {
                        Ok(()) => {
                            if let Err(e) =
                                Self::receive_entries(&mut stream, &registry, &last_seen).await
                            {
                                warn!("session with peer {} failed: {}", peer.identifier, e);
                            }
                        }
                        Err(e) => warn!("hello to peer {} failed: {}", peer.identifier, e),
                    }
                }
                Err(e) => debug!("peer {} unreachable: {}", peer.identifier, e),
            }

            tokio::time::sleep(reconnect_delay).await;
        }
    }

    async fn receive_entries(
        stream: &mut TcpStream,
        registry: &Arc<AssetRegistry>,
        last_seen: &AtomicI64,
    ) -> ReplicationResult<()> {
        loop {
            match ReplicationMessage::read_from(stream).await? {
                Some(ReplicationMessage::Entry { asset, entry }) => {
                    let map = registry.acquire_map(&asset);
                    let timestamp = entry.timestamp;
                    match map.apply_replication(&entry) {
                        Ok(_) => {
                            last_seen.fetch_max(timestamp, Ordering::SeqCst);
                        }
                        // Fatal for this entry only; later entries proceed
                        Err(e) => warn!("skipping replication entry for {}: {}", asset, e),
                    }
                }
                Some(ReplicationMessage::Snapshot { asset, data }) => {
                    let map = registry.acquire_map(&asset);
                    match map.apply_snapshot(&data) {
                        Ok(applied) => debug!("snapshot of {} applied {} entries", asset, applied),
                        Err(e) => warn!("snapshot of {} rejected: {}", asset, e),
                    }
                }
                Some(ReplicationMessage::Heartbeat { .. }) => {}
                Some(ReplicationMessage::Hello { .. }) => {
                    warn!("unexpected hello mid-session");
                }
                None => return Ok(()),
            }
        }
    }
}

/// Connect a remote subscription client to a node's subscription listener
///
/// The read task applies the server-transmitted heartbeat parameters,
/// records liveness for every inbound frame, and dispatches replies by
/// tid. Dropping the connection leaves the client intact; its channel
/// replays subscriptions if a new transport is attached.
pub async fn connect_client(
    addr: SocketAddr,
    local: PeerId,
    listener: Arc<dyn ConnectionListener>,
) -> anyhow::Result<Arc<RemoteSubscriptionClient>> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, write_half) = stream.into_split();

    let wire = WireChannel::disconnected();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    wire.connect(outbound_tx);
    channel::spawn_frame_writer(outbound_rx, write_half);

    let client = RemoteSubscriptionClient::new(wire.clone());
    tokio::spawn(run_client_read_loop(
        read_half,
        client.clone(),
        wire,
        local,
        listener,
    ));

    Ok(client)
}

async fn run_client_read_loop(
    mut read_half: OwnedReadHalf,
    client: Arc<RemoteSubscriptionClient>,
    wire: Arc<WireChannel>,
    local: PeerId,
    listener: Arc<dyn ConnectionListener>,
) {
    let mut handler: Option<Arc<HeartbeatHandler>> = None;

    loop {
        match Frame::read_from(&mut read_half).await {
            Ok(Some(frame)) => {
                if let Some(h) = &handler {
                    h.record_activity();
                }

                if let FrameBody::HeartbeatConfig {
                    interval_ms,
                    timeout_ms,
                } = frame.body
                {
                    if handler.is_none() {
                        let config = HeartbeatConfig {
                            interval_ms,
                            timeout_ms,
                        };
                        match HeartbeatHandler::new(
                            config,
                            local,
                            local,
                            wire.clone(),
                            listener.clone(),
                        ) {
                            Ok(h) => {
                                h.record_activity();
                                h.start();
                                handler = Some(h);
                            }
                            Err(e) => warn!("rejecting heartbeat parameters: {}", e),
                        }
                    }
                    continue;
                }

                client.dispatch(frame);
            }
            Ok(None) => break,
            Err(GridError::SerializationError(e)) => {
                warn!("dropping undecodable frame: {}", e);
            }
            Err(_) => break,
        }
    }

    wire.disconnect();
    if let Some(h) = handler {
        h.close();
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    #[test]
    fn test_node_rejects_invalid_config() {
        let mut config = NodeConfig::default();
        config.heartbeat.timeout_ms = 100;
        assert!(GridNode::new(config).is_err());
    }

    #[test]
    fn test_node_exposes_registry() {
        let node = GridNode::new(NodeConfig::default()).unwrap();
        let map = node.registry().acquire_map("/maps/test");
        assert_eq!(map.local_identifier(), node.local_identifier());
    }
}
