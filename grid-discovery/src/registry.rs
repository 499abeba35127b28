use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use grid_error::Result;

use crate::{Advertisement, Discovery, OnPeerFound, OnPeerLost, PeerDescriptor};

/// Peers not refreshed within this window are dropped by
/// [`PeerRegistry::expire_stale`].
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// The live set of known peers.
///
/// The map is mutated only by the discovery transport's event hooks;
/// everyone else gets consistent snapshots through the read methods.
/// A node never registers itself: descriptors carrying the local node
/// id are filtered out on arrival, by identity rather than by network
/// address.
pub struct PeerRegistry {
    local_node_id: String,
    peers: Arc<RwLock<HashMap<String, PeerDescriptor>>>,
    discovery: Arc<dyn Discovery>,
    started: Mutex<bool>,
    stale_after: Duration,
    on_peer_found: Arc<RwLock<Option<OnPeerFound>>>,
    on_peer_lost: Arc<RwLock<Option<OnPeerLost>>>,
}

impl PeerRegistry {
    pub fn new(
        local_node_id: String,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        Self::with_stale_after(local_node_id, discovery, DEFAULT_STALE_AFTER)
    }

    pub fn with_stale_after(
        local_node_id: String,
        discovery: Arc<dyn Discovery>,
        stale_after: Duration,
    ) -> Self {
        Self {
            local_node_id,
            peers: Arc::new(RwLock::new(HashMap::new())),
            discovery,
            started: Mutex::new(false),
            stale_after,
            on_peer_found: Arc::new(RwLock::new(None)),
            on_peer_lost: Arc::new(RwLock::new(None)),
        }
    }

    /// Registers a hook fired whenever a peer is discovered or
    /// refreshed. Runs on the discovery transport's task; best-effort
    /// (a found peer may already be stale or unreachable).
    pub fn set_on_peer_found(&self, hook: OnPeerFound) {
        *self.on_peer_found.write().unwrap() = Some(hook);
    }

    /// Registers a hook fired with the node id of a lost peer. Runs on
    /// the discovery transport's task; best-effort (a lost peer may
    /// still answer a request already in flight).
    pub fn set_on_peer_lost(&self, hook: OnPeerLost) {
        *self.on_peer_lost.write().unwrap() = Some(hook);
    }

    /// Starts advertising this node and watching for others.
    /// Idempotent: calling while already started is a no-op.
    pub fn start(&self, ad: Advertisement) -> Result<()> {
        let mut started = self.started.lock().unwrap();
        if *started {
            log::debug!("registry: already started");
            return Ok(());
        }

        self.discovery
            .watch(self.found_hook(), self.lost_hook())?;
        self.discovery.advertise(ad)?;
        *started = true;

        log::info!("registry: started, node_id={}", self.local_node_id);
        Ok(())
    }

    /// Withdraws the advertisement, stops watching and clears all
    /// known peers. Always safe to call, including when never started.
    pub fn stop(&self) {
        self.discovery.shutdown();
        self.peers.write().unwrap().clear();
        *self.started.lock().unwrap() = false;
        log::info!("registry: stopped");
    }

    /// Synchronous snapshot of peers advertising the given hardware
    /// class, ordered by node id. No I/O; the snapshot may be stale by
    /// the time it is used.
    pub fn peers_with_hardware_class(
        &self,
        hardware_class: &str,
    ) -> Vec<PeerDescriptor> {
        let mut matching: Vec<PeerDescriptor> = self
            .peers
            .read()
            .unwrap()
            .values()
            .filter(|peer| peer.hardware_class == hardware_class)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        matching
    }

    /// Snapshot of every known peer, ordered by node id.
    pub fn snapshot(&self) -> Vec<PeerDescriptor> {
        let mut all: Vec<PeerDescriptor> =
            self.peers.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    /// Drops peers whose advertisement has not been refreshed within
    /// the staleness threshold, firing the lost hook for each.
    pub fn expire_stale(&self) {
        let now = SystemTime::now();
        let expired: Vec<String> = {
            let mut peers = self.peers.write().unwrap();
            let expired: Vec<String> = peers
                .iter()
                .filter(|(_, peer)| {
                    now.duration_since(peer.last_seen)
                        .map(|age| age > self.stale_after)
                        .unwrap_or(false)
                })
                .map(|(node_id, _)| node_id.clone())
                .collect();
            for node_id in &expired {
                peers.remove(node_id);
            }
            expired
        };

        let hook = self.on_peer_lost.read().unwrap().clone();
        for node_id in expired {
            log::info!("registry: peer {} expired", node_id);
            if let Some(hook) = &hook {
                hook(node_id);
            }
        }
    }

    fn found_hook(&self) -> OnPeerFound {
        let peers = Arc::clone(&self.peers);
        let local_node_id = self.local_node_id.clone();
        let consumer = Arc::clone(&self.on_peer_found);

        Arc::new(move |descriptor: PeerDescriptor| {
            if descriptor.node_id == local_node_id {
                log::debug!("registry: ignoring own advertisement");
                return;
            }

            let first_sighting = {
                let mut map = peers.write().unwrap();
                map.insert(descriptor.node_id.clone(), descriptor.clone())
                    .is_none()
            };
            if first_sighting {
                log::info!(
                    "registry: discovered peer {} @ {} ({})",
                    descriptor.node_id,
                    descriptor.address(),
                    descriptor.hardware_class
                );
            } else {
                log::debug!(
                    "registry: refreshed peer {}",
                    descriptor.node_id
                );
            }

            let hook = consumer.read().unwrap().clone();
            if let Some(hook) = hook {
                hook(descriptor);
            }
        })
    }

    fn lost_hook(&self) -> OnPeerLost {
        let peers = Arc::clone(&self.peers);
        let consumer = Arc::clone(&self.on_peer_lost);

        Arc::new(move |node_id: String| {
            let known = peers.write().unwrap().remove(&node_id).is_some();
            if known {
                log::info!("registry: lost peer {}", node_id);
                let hook = consumer.read().unwrap().clone();
                if let Some(hook) = hook {
                    hook(node_id);
                }
            }
        })
    }
}
