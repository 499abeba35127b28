use std::fs;

use grid_hash::ContentHash;

/// Length of the short node identifier in hex characters.
const NODE_ID_LEN: usize = 16;

/// Derives this node's stable, anonymized identity.
///
/// The identity is the SHA-256 digest of a stable device identifier,
/// truncated to 16 hex characters. It serves both as the node's
/// protocol identity and as its advertised service-name suffix. Never
/// fails: when no device identifier is available the literal
/// `"unknown"` is hashed instead.
pub fn local_node_id() -> String {
    let seed = device_identifier();
    let digest = ContentHash::from_bytes(seed.as_bytes());
    digest.as_str()[..NODE_ID_LEN].to_string()
}

fn device_identifier() -> String {
    for path in ["/etc/machine-id", "/etc/hostname"] {
        if let Ok(contents) = fs::read_to_string(path) {
            let contents = contents.trim();
            if !contents.is_empty() {
                return contents.to_string();
            }
        }
    }
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }
    "unknown".to_string()
}
