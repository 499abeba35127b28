//! Peer discovery for the shader grid.
//!
//! A node advertises its identity, hardware class and listening port,
//! watches for other nodes doing the same, and keeps the live peer set
//! in a [`registry::PeerRegistry`]. The transport that carries
//! advertisements is pluggable through the [`Discovery`] trait: the
//! grid ships a UDP multicast beacon for local networks and a static
//! peer list for fixed fleets and tests.

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use grid_error::Result;

pub mod beacon;
pub mod identity;
pub mod registry;
pub mod static_list;

pub use identity::local_node_id;
pub use registry::PeerRegistry;

/// Discovery attribute values are capped at 63 bytes, the limit DNS-SD
/// style attribute encodings impose. Hardware-class strings from GPU
/// drivers routinely exceed it.
pub const MAX_ATTRIBUTE_LEN: usize = 63;

/// A peer as currently known to this node.
///
/// Keyed by `node_id`; `host`/`port` may change across rediscovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub hardware_class: String,
    pub software_version: String,
    pub last_seen: SystemTime,
}

impl PeerDescriptor {
    /// `host:port` form usable for a socket connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What a node publishes about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    pub node_id: String,
    /// Port the transfer listener accepts connections on.
    pub port: u16,
    pub hardware_class: String,
    pub software_version: String,
}

/// Hook invoked when a peer is discovered or refreshed. Fires from the
/// discovery transport's own task, not the caller's.
pub type OnPeerFound = Arc<dyn Fn(PeerDescriptor) + Send + Sync>;

/// Hook invoked with the node id of a peer that was lost. Best-effort:
/// a lost peer may still answer a request already in flight.
pub type OnPeerLost = Arc<dyn Fn(String) + Send + Sync>;

/// Capability interface over a concrete discovery transport.
///
/// Implementations spawn their own background tasks on the ambient
/// tokio runtime; hooks run on those tasks and must not assume any
/// ordering relative to the caller.
pub trait Discovery: Send + Sync {
    /// Begin publishing this node's advertisement.
    fn advertise(&self, ad: Advertisement) -> Result<()>;

    /// Begin watching for other nodes' advertisements.
    fn watch(&self, on_found: OnPeerFound, on_lost: OnPeerLost)
        -> Result<()>;

    /// Withdraw the advertisement and stop watching. Safe to call at
    /// any time, including before `advertise`/`watch`.
    fn shutdown(&self);
}

/// Truncates an attribute value to [`MAX_ATTRIBUTE_LEN`] bytes without
/// splitting a UTF-8 character.
pub fn truncate_attribute(value: &str) -> &str {
    if value.len() <= MAX_ATTRIBUTE_LEN {
        return value;
    }
    let mut end = MAX_ATTRIBUTE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
