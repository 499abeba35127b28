use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use grid_error::Result;

use crate::{
    truncate_attribute, Advertisement, Discovery, OnPeerFound, OnPeerLost,
    PeerDescriptor,
};

/// Service-name prefix; a node advertises as `<prefix>_<node_id>`.
pub const SERVICE_PREFIX: &str = "shadergrid";

/// Administratively-scoped multicast group the beacons travel on.
pub const BEACON_GROUP: Ipv4Addr = Ipv4Addr::new(239, 77, 83, 71);

pub const BEACON_PORT: u16 = 47823;

pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(5);

/// A peer is reported lost after this long without a beacon.
pub const DEFAULT_LOSS_WINDOW: Duration = Duration::from_secs(20);

/// On-the-wire beacon: the service name plus a small key-value
/// attribute payload, per-value capped at the discovery attribute
/// limit.
#[derive(Debug, Serialize, Deserialize)]
struct BeaconPayload {
    service: String,
    port: u16,
    attributes: BTreeMap<String, String>,
}

impl BeaconPayload {
    fn for_advertisement(ad: &Advertisement) -> Self {
        let mut attributes = BTreeMap::new();
        attributes
            .insert("nodeId".to_string(), ad.node_id.clone());
        attributes.insert(
            "gpu".to_string(),
            truncate_attribute(&ad.hardware_class).to_string(),
        );
        attributes.insert(
            "version".to_string(),
            truncate_attribute(&ad.software_version).to_string(),
        );
        Self {
            service: format!("{}_{}", SERVICE_PREFIX, ad.node_id),
            port: ad.port,
            attributes,
        }
    }
}

/// LAN discovery over periodic UDP multicast beacons.
///
/// Plays the role a platform mDNS/DNS-SD registration would: each node
/// periodically multicasts its advertisement, watches the group for
/// everyone else's, and reports a peer lost once its beacons stop
/// arriving for a full loss window.
pub struct MulticastDiscovery {
    group: SocketAddrV4,
    beacon_interval: Duration,
    loss_window: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for MulticastDiscovery {
    fn default() -> Self {
        Self::new(
            SocketAddrV4::new(BEACON_GROUP, BEACON_PORT),
            DEFAULT_BEACON_INTERVAL,
            DEFAULT_LOSS_WINDOW,
        )
    }
}

impl MulticastDiscovery {
    pub fn new(
        group: SocketAddrV4,
        beacon_interval: Duration,
        loss_window: Duration,
    ) -> Self {
        Self {
            group,
            beacon_interval,
            loss_window,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl Discovery for MulticastDiscovery {
    fn advertise(&self, ad: Advertisement) -> Result<()> {
        let payload =
            serde_json::to_vec(&BeaconPayload::for_advertisement(&ad))?;
        let group = self.group;
        let interval = self.beacon_interval;

        let handle = tokio::spawn(async move {
            let socket =
                match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
                    Ok(socket) => socket,
                    Err(err) => {
                        log::error!(
                            "beacon: failed to bind send socket: {}",
                            err
                        );
                        return;
                    }
                };

            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                if let Err(err) = socket.send_to(&payload, group).await {
                    log::warn!("beacon: failed to send: {}", err);
                }
            }
        });

        self.tasks.lock().unwrap().push(handle);
        log::debug!("beacon: advertising {} on {}", ad.node_id, self.group);
        Ok(())
    }

    fn watch(
        &self,
        on_found: OnPeerFound,
        on_lost: OnPeerLost,
    ) -> Result<()> {
        let group = self.group;
        let loss_window = self.loss_window;

        let handle = tokio::spawn(async move {
            // TODO: set SO_REUSEPORT (socket2) so two nodes on one
            // host can watch the group simultaneously
            let socket = match UdpSocket::bind((
                Ipv4Addr::UNSPECIFIED,
                group.port(),
            ))
            .await
            {
                Ok(socket) => socket,
                Err(err) => {
                    log::error!(
                        "beacon: failed to bind watch socket: {}",
                        err
                    );
                    return;
                }
            };
            if let Err(err) =
                socket.join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)
            {
                log::error!("beacon: failed to join group: {}", err);
                return;
            }

            let mut last_beacon: HashMap<String, Instant> = HashMap::new();
            let mut sweep = tokio::time::interval(loss_window / 2);
            let mut buf = vec![0u8; 2048];

            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        let (len, src) = match received {
                            Ok(received) => received,
                            Err(err) => {
                                log::warn!("beacon: receive failed: {}", err);
                                continue;
                            }
                        };
                        match parse_beacon(&buf[..len], src.ip()) {
                            Some(descriptor) => {
                                last_beacon.insert(
                                    descriptor.node_id.clone(),
                                    Instant::now(),
                                );
                                on_found(descriptor);
                            }
                            None => log::debug!(
                                "beacon: ignoring malformed datagram from {}",
                                src
                            ),
                        }
                    }
                    _ = sweep.tick() => {
                        let now = Instant::now();
                        let lost: Vec<String> = last_beacon
                            .iter()
                            .filter(|(_, seen)| {
                                now.duration_since(**seen) > loss_window
                            })
                            .map(|(node_id, _)| node_id.clone())
                            .collect();
                        for node_id in lost {
                            last_beacon.remove(&node_id);
                            on_lost(node_id);
                        }
                    }
                }
            }
        });

        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    fn shutdown(&self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

/// Turns a received datagram into a peer descriptor. The sender's
/// address becomes the peer's host; the payload carries the rest.
fn parse_beacon(bytes: &[u8], src: IpAddr) -> Option<PeerDescriptor> {
    let payload: BeaconPayload = serde_json::from_slice(bytes).ok()?;
    if !payload.service.starts_with(SERVICE_PREFIX) {
        return None;
    }

    let node_id = payload
        .attributes
        .get("nodeId")
        .cloned()
        .unwrap_or_else(|| {
            payload
                .service
                .trim_start_matches(&format!("{}_", SERVICE_PREFIX))
                .to_string()
        });

    let attr_or_unknown = |key: &str| {
        payload
            .attributes
            .get(key)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    };

    Some(PeerDescriptor {
        node_id,
        host: src.to_string(),
        port: payload.port,
        hardware_class: attr_or_unknown("gpu"),
        software_version: attr_or_unknown("version"),
        last_seen: SystemTime::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement() -> Advertisement {
        Advertisement {
            node_id: "aaaa0000bbbb1111".to_string(),
            port: 50123,
            hardware_class: "Adreno (TM) 650".to_string(),
            software_version: "1.0".to_string(),
        }
    }

    #[test]
    fn test_beacon_round_trip() {
        let payload = BeaconPayload::for_advertisement(&advertisement());
        let bytes = serde_json::to_vec(&payload).unwrap();

        let descriptor =
            parse_beacon(&bytes, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)))
                .expect("beacon should parse");

        assert_eq!(descriptor.node_id, "aaaa0000bbbb1111");
        assert_eq!(descriptor.host, "10.0.0.7");
        assert_eq!(descriptor.port, 50123);
        assert_eq!(descriptor.hardware_class, "Adreno (TM) 650");
    }

    #[test]
    fn test_beacon_caps_attribute_length() {
        let mut ad = advertisement();
        ad.hardware_class = "y".repeat(200);
        let payload = BeaconPayload::for_advertisement(&ad);
        assert_eq!(
            payload.attributes.get("gpu").unwrap().len(),
            crate::MAX_ATTRIBUTE_LEN
        );
    }

    #[test]
    fn test_malformed_and_foreign_datagrams_are_ignored() {
        let src = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(parse_beacon(b"not json", src).is_none());

        let foreign = serde_json::to_vec(&BeaconPayload {
            service: "someoneelse_abc".to_string(),
            port: 1,
            attributes: BTreeMap::new(),
        })
        .unwrap();
        assert!(parse_beacon(&foreign, src).is_none());
    }

    #[test]
    fn test_node_id_falls_back_to_service_suffix() {
        let payload = BeaconPayload {
            service: format!("{}_cafe1234cafe1234", SERVICE_PREFIX),
            port: 9,
            attributes: BTreeMap::new(),
        };
        let bytes = serde_json::to_vec(&payload).unwrap();
        let descriptor =
            parse_beacon(&bytes, IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert_eq!(descriptor.node_id, "cafe1234cafe1234");
        assert_eq!(descriptor.hardware_class, "unknown");
    }
}
