pub mod channel;
pub mod config;
pub mod core;
pub mod liveness;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod remote;
pub mod replication;

// Re-export commonly used types
pub use channel::{ChannelError, WireChannel};
pub use config::NodeConfig;
pub use core::{
    GridError, MapEvent, MapStore, SubscriberStatus, SubscriptionCollection, SubscriptionStats,
};
pub use liveness::{ConnectionListener, HeartbeatConfig, HeartbeatHandler, LivenessState};
pub use node::{GridNode, LogListener, connect_client};
pub use protocol::{Frame, FrameBody, PushPayload, RequestContext, SubscriptionView};
pub use registry::AssetRegistry;
pub use remote::{RemoteSubscriptionClient, SubscriberSink, SubscriptionServer};
pub use replication::{
    ModificationEntry, ModificationIterator, PeerId, ReplicatedMap, ReplicationError,
    ReplicationStats,
};
