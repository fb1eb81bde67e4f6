use crate::replication::{PeerId, ReplicatedMap};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Explicit registry of the assets this node hosts
///
/// Passed into the components that need it at construction time; there is
/// no process-wide registry. Assets are created on first acquisition and
/// all share the node's identifier.
pub struct AssetRegistry {
    local: PeerId,
    maps: RwLock<HashMap<String, Arc<ReplicatedMap>>>,
}

impl AssetRegistry {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            maps: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_identifier(&self) -> PeerId {
        self.local
    }

    /// Create-if-absent acquisition of a named replicated map
    pub fn acquire_map(&self, name: &str) -> Arc<ReplicatedMap> {
        if let Some(map) = self.maps.read().get(name) {
            return map.clone();
        }

        let mut maps = self.maps.write();
        maps.entry(name.to_string())
            .or_insert_with(|| {
                info!("creating asset {}", name);
                Arc::new(ReplicatedMap::new(name, self.local))
            })
            .clone()
    }

    pub fn find_map(&self, name: &str) -> Option<Arc<ReplicatedMap>> {
        self.maps.read().get(name).cloned()
    }

    pub fn asset_names(&self) -> Vec<String> {
        self.maps.read().keys().cloned().collect()
    }

    /// Every hosted asset, for replication drains
    pub fn maps(&self) -> Vec<Arc<ReplicatedMap>> {
        self.maps.read().values().cloned().collect()
    }
}
