use crate::core::{GridError, Result};
use crate::liveness::HeartbeatConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub subscription: SubscriptionSection,
    pub replication: ReplicationSection,
    pub heartbeat: HeartbeatConfig,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Replication identifier of this host, 0..=127
    pub identifier: u8,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSection {
    /// Where remote subscription clients connect
    pub listen_address: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSection {
    /// Where replication peers connect
    pub listen_address: SocketAddr,
    /// The other hosts of the grid
    pub peers: Vec<PeerEntry>,
    /// Delay between reconnect attempts to a dead peer
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub identifier: u8,
    pub address: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    pub level: String,
    pub format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection {
                identifier: 1,
                name: "gridlink".to_string(),
            },
            subscription: SubscriptionSection {
                listen_address: "0.0.0.0:16600".parse().unwrap(),
            },
            replication: ReplicationSection {
                listen_address: "0.0.0.0:16601".parse().unwrap(),
                peers: Vec::new(),
                reconnect_delay_ms: 5_000,
            },
            heartbeat: HeartbeatConfig::default(),
            logging: LoggingSection {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl NodeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: NodeConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate at startup; any failure here aborts initialization
    pub fn validate(&self) -> Result<()> {
        if self.node.identifier > 127 {
            return Err(GridError::Configuration(format!(
                "node identifier must be 0..=127, got {}",
                self.node.identifier
            )));
        }

        self.heartbeat.validate()?;

        let mut seen = HashSet::new();
        for peer in &self.replication.peers {
            if peer.identifier > 127 {
                return Err(GridError::Configuration(format!(
                    "peer identifier must be 0..=127, got {}",
                    peer.identifier
                )));
            }
            if peer.identifier == self.node.identifier {
                return Err(GridError::Configuration(format!(
                    "peer identifier {} collides with this node",
                    peer.identifier
                )));
            }
            if !seen.insert(peer.identifier) {
                return Err(GridError::Configuration(format!(
                    "duplicate peer identifier {}",
                    peer.identifier
                )));
            }
        }

        if self.replication.reconnect_delay_ms == 0 {
            return Err(GridError::Configuration(
                "reconnect_delay_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
