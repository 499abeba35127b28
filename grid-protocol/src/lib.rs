//! The artifact transfer protocol.
//!
//! Line-delimited JSON over TCP, one request/response cycle per
//! connection. A client asks a peer for its artifact list or for one
//! artifact by content hash; the server answers from the local store
//! and closes. Payloads over a fixed threshold travel gzip-compressed;
//! integrity is verified by the receiver when the bytes enter its
//! store, never trusted from the wire.

use std::time::Duration;

pub mod client;
pub mod message;
pub mod server;

pub use client::TransferClient;
pub use server::serve;

/// The protocol version this node speaks. Enforced by the receiving
/// side: a request carrying any other version is answered with a
/// structured error, not served.
pub const PROTOCOL_VERSION: &str = "1";

/// Payloads larger than this are gzip-compressed on the wire.
pub const COMPRESSION_THRESHOLD: usize = 50_000;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
