//! A peer-to-peer distribution layer for compiled-shader artifacts.
//!
//! Nodes on a local network with compatible rendering hardware share
//! their compiled shaders so each node can fetch ready binaries from
//! its peers before falling back to expensive local compilation.
//!
//! The crate is driven through an explicit [`GridContext`] handle:
//!
//! ```no_run
//! use std::sync::Arc;
//! use shader_grid::{GridConfig, GridContext};
//! use grid_discovery::beacon::MulticastDiscovery;
//!
//! # async fn example() -> grid_error::Result<()> {
//! let config = GridConfig::new(
//!     "/var/cache/shader-grid".into(),
//!     "Adreno 650".to_string(),
//!     Arc::new(MulticastDiscovery::default()),
//! );
//! let grid = GridContext::init(config)?;
//! grid.start().await?;
//!
//! // Before launching the workload: pull missing shaders from peers
//! let sync = grid.sync_for_hardware_class("Adreno 650");
//! sync.wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! Every operation is non-fatal to the caller: a grid with no peers,
//! or one whose transfers all fail, degrades to "no acceleration" and
//! never to a launch failure.

pub mod context;
pub mod sync;

pub use context::{GridConfig, GridContext};
pub use sync::{SyncHandle, SyncOrchestrator, SyncProgress};

pub use grid_discovery::{
    local_node_id, Advertisement, Discovery, PeerDescriptor, PeerRegistry,
};
pub use grid_error::{GridError, Result};
pub use grid_hash::ContentHash;
pub use grid_protocol::TransferClient;
pub use grid_store::{ArtifactHandle, ArtifactStore};

/// Default bound on total cached artifact bytes.
pub const DEFAULT_CAPACITY_BYTES: u64 = 500 * 1024 * 1024;

pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
