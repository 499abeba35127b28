use std::io::Read;
use std::time::Duration;

use flate2::read::GzDecoder;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use grid_discovery::PeerDescriptor;
use grid_error::{GridError, Result};
use grid_hash::ContentHash;

use crate::message::{FetchResponse, ListResponse, Request};
use crate::{CONNECT_TIMEOUT, PROTOCOL_VERSION, READ_TIMEOUT};

/// Client side of the transfer protocol. One connection per request,
/// closed when the response completes; every network step carries an
/// explicit timeout.
pub struct TransferClient {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT, READ_TIMEOUT)
    }
}

impl TransferClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }

    /// Asks a peer for every artifact hash it holds.
    ///
    /// Any failure (unreachable peer, timeout, malformed response)
    /// yields an empty list: the peer currently has nothing usable.
    pub async fn list_artifacts(
        &self,
        peer: &PeerDescriptor,
        hardware_class: &str,
    ) -> Vec<ContentHash> {
        match self.try_list(peer, hardware_class).await {
            Ok(hashes) => hashes,
            Err(err) => {
                log::warn!(
                    "transfer: listing from {} failed: {}",
                    peer.node_id,
                    err
                );
                Vec::new()
            }
        }
    }

    async fn try_list(
        &self,
        peer: &PeerDescriptor,
        hardware_class: &str,
    ) -> Result<Vec<ContentHash>> {
        let stream = self.connect(peer).await?;
        let mut reader = BufReader::new(stream);

        self.send_request(
            &mut reader,
            &Request::List {
                gpu: hardware_class.to_string(),
                proto: PROTOCOL_VERSION.to_string(),
            },
        )
        .await?;

        let line = self.read_response_line(&mut reader).await?;
        let response: ListResponse = serde_json::from_str(line.trim())?;

        let hashes = response
            .shaders
            .iter()
            .filter_map(|raw| match raw.parse::<ContentHash>() {
                Ok(hash) => Some(hash),
                Err(_) => {
                    log::debug!(
                        "transfer: peer {} listed invalid hash {:?}",
                        peer.node_id,
                        raw
                    );
                    None
                }
            })
            .collect();
        Ok(hashes)
    }

    /// Fetches one artifact by content hash.
    ///
    /// Returns `GridError::NotFound` when the peer answers
    /// `found:false`. The returned bytes are exactly the declared
    /// decompressed size; the authoritative digest check happens when
    /// the caller hands them to the content store.
    pub async fn fetch_artifact(
        &self,
        peer: &PeerDescriptor,
        content_hash: &ContentHash,
        hardware_class: &str,
    ) -> Result<Vec<u8>> {
        let stream = self.connect(peer).await?;
        let mut reader = BufReader::new(stream);

        self.send_request(
            &mut reader,
            &Request::Fetch {
                shader_hash: content_hash.to_string(),
                gpu: hardware_class.to_string(),
                proto: PROTOCOL_VERSION.to_string(),
            },
        )
        .await?;

        let line = self.read_response_line(&mut reader).await?;
        let meta: FetchResponse = serde_json::from_str(line.trim())?;

        if !meta.found {
            return Err(GridError::NotFound(content_hash.to_string()));
        }
        let declared = meta.size.ok_or_else(|| {
            GridError::Malformed("found response missing size".to_string())
        })?;
        let compressed = meta.gzip.unwrap_or(false);

        let mut raw = Vec::new();
        timeout(self.read_timeout, reader.read_to_end(&mut raw))
            .await
            .map_err(|_| {
                GridError::Transport("payload read timed out".to_string())
            })?
            .map_err(|err| GridError::Transport(err.to_string()))?;

        let payload = if compressed {
            let mut decoder = GzDecoder::new(raw.as_slice());
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|err| {
                    GridError::Malformed(format!(
                        "invalid gzip payload: {}",
                        err
                    ))
                })?;
            decompressed
        } else {
            raw
        };

        if payload.len() as u64 != declared {
            return Err(GridError::Malformed(format!(
                "payload size mismatch: declared {}, received {}",
                declared,
                payload.len()
            )));
        }

        log::debug!(
            "transfer: fetched {} ({} bytes{}) from {}",
            content_hash,
            payload.len(),
            if compressed { ", gzip" } else { "" },
            peer.node_id
        );
        Ok(payload)
    }

    async fn connect(&self, peer: &PeerDescriptor) -> Result<TcpStream> {
        let address = peer.address();
        timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                GridError::Transport(format!(
                    "connect to {} timed out",
                    address
                ))
            })?
            .map_err(|err| {
                GridError::Transport(format!(
                    "connect to {} failed: {}",
                    address, err
                ))
            })
    }

    async fn send_request(
        &self,
        stream: &mut BufReader<TcpStream>,
        request: &Request,
    ) -> Result<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|err| GridError::Transport(err.to_string()))?;
        Ok(())
    }

    async fn read_response_line(
        &self,
        reader: &mut BufReader<TcpStream>,
    ) -> Result<String> {
        let mut line = String::new();
        let bytes_read = timeout(self.read_timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| {
                GridError::Transport("response read timed out".to_string())
            })?
            .map_err(|err| GridError::Transport(err.to_string()))?;
        if bytes_read == 0 {
            return Err(GridError::Transport(
                "connection closed before response".to_string(),
            ));
        }
        Ok(line)
    }
}
