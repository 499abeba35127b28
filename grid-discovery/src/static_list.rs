use std::sync::Mutex;
use std::time::SystemTime;

use tokio::net::lookup_host;
use tokio::task::JoinHandle;

use grid_error::Result;

use crate::{
    Advertisement, Discovery, OnPeerFound, OnPeerLost, PeerDescriptor,
};

/// A peer known ahead of time, by hostname or address.
#[derive(Debug, Clone)]
pub struct StaticPeer {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub hardware_class: String,
    pub software_version: String,
}

/// Discovery backed by a fixed peer list.
///
/// Useful for fleets with known membership and for tests. Hostnames
/// are resolved asynchronously, one task per peer, so a peer that
/// fails to resolve never blocks or fails the others. Loss events are
/// never emitted; staleness sweeps are the only removal path.
pub struct StaticDiscovery {
    peers: Vec<StaticPeer>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<StaticPeer>) -> Self {
        Self {
            peers,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl Discovery for StaticDiscovery {
    fn advertise(&self, ad: Advertisement) -> Result<()> {
        // Nothing to publish: static peers are configured, not found
        log::debug!(
            "static discovery: advertisement for {} is a no-op",
            ad.node_id
        );
        Ok(())
    }

    fn watch(
        &self,
        on_found: OnPeerFound,
        _on_lost: OnPeerLost,
    ) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        for peer in self.peers.clone() {
            let on_found = on_found.clone();
            tasks.push(tokio::spawn(async move {
                let target = (peer.host.as_str(), peer.port);
                let resolved = match lookup_host(target).await {
                    Ok(mut addrs) => addrs.next(),
                    Err(err) => {
                        log::warn!(
                            "static discovery: failed to resolve {}: {}",
                            peer.host,
                            err
                        );
                        return;
                    }
                };
                let addr = match resolved {
                    Some(addr) => addr,
                    None => {
                        log::warn!(
                            "static discovery: no address for {}",
                            peer.host
                        );
                        return;
                    }
                };

                on_found(PeerDescriptor {
                    node_id: peer.node_id,
                    host: addr.ip().to_string(),
                    port: peer.port,
                    hardware_class: peer.hardware_class,
                    software_version: peer.software_version,
                    last_seen: SystemTime::now(),
                });
            }));
        }
        Ok(())
    }

    fn shutdown(&self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn static_peer(node_id: &str, host: &str) -> StaticPeer {
        StaticPeer {
            node_id: node_id.to_string(),
            host: host.to_string(),
            port: 47823,
            hardware_class: "Adreno 650".to_string(),
            software_version: "1.0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_resolution_failure_does_not_block_others() {
        let discovery = StaticDiscovery::new(vec![
            static_peer("bad", "host.invalid."),
            static_peer("good", "127.0.0.1"),
        ]);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let on_found: OnPeerFound = Arc::new(move |peer| {
            let _ = tx.send(peer);
        });
        let on_lost: OnPeerLost = Arc::new(|_| {});

        discovery.watch(on_found, on_lost).unwrap();

        let found = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("resolution timed out")
            .expect("channel closed");
        assert_eq!(found.node_id, "good");
        assert_eq!(found.host, "127.0.0.1");

        discovery.shutdown();
    }
}
