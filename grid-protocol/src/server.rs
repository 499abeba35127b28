use std::io::Write;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use grid_error::{GridError, Result};
use grid_hash::ContentHash;
use grid_store::ArtifactStore;

use crate::message::{ErrorResponse, FetchResponse, ListResponse, Request};
use crate::{COMPRESSION_THRESHOLD, PROTOCOL_VERSION, READ_TIMEOUT};

/// Serves exactly one request on an inbound connection, then lets the
/// connection close. The protocol is not persistent or multiplexed.
///
/// All failures are absorbed and logged; nothing propagates to the
/// hosting listener.
pub async fn serve(
    stream: TcpStream,
    store: Arc<ArtifactStore>,
    hardware_class: &str,
) {
    let remote = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    if let Err(err) = try_serve(stream, &store, hardware_class).await {
        log::warn!("serve: request from {} failed: {}", remote, err);
    }
}

async fn try_serve(
    stream: TcpStream,
    store: &ArtifactStore,
    hardware_class: &str,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    let bytes_read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| {
            GridError::Transport("request read timed out".to_string())
        })?
        .map_err(|err| GridError::Transport(err.to_string()))?;
    if bytes_read == 0 {
        // Connection closed without sending a request
        return Ok(());
    }

    match serde_json::from_str::<Request>(line.trim()) {
        Ok(request) if request.proto() != PROTOCOL_VERSION => {
            log::debug!(
                "serve: rejecting unsupported protocol version {:?}",
                request.proto()
            );
            write_line(
                &mut reader,
                &ErrorResponse {
                    error: "unsupported_proto".to_string(),
                },
            )
            .await
        }
        Ok(Request::List { .. }) => {
            handle_list(&mut reader, store, hardware_class).await
        }
        Ok(Request::Fetch { shader_hash, .. }) => {
            handle_fetch(&mut reader, store, &shader_hash).await
        }
        Err(_) => {
            // A well-formed JSON object with an action we don't know
            // gets a structured error; outright garbage gets one too
            let error = if serde_json::from_str::<serde_json::Value>(
                line.trim(),
            )
            .is_ok()
            {
                "unknown_action"
            } else {
                "malformed_request"
            };
            write_line(
                &mut reader,
                &ErrorResponse {
                    error: error.to_string(),
                },
            )
            .await
        }
    }
}

async fn handle_list(
    stream: &mut BufReader<TcpStream>,
    store: &ArtifactStore,
    hardware_class: &str,
) -> Result<()> {
    let shaders: Vec<String> = store
        .list_all()?
        .into_iter()
        .map(|handle| handle.content_hash.to_string())
        .collect();

    log::debug!("serve: listing {} artifacts", shaders.len());
    let response = ListResponse {
        count: shaders.len(),
        shaders,
        gpu: hardware_class.to_string(),
    };
    write_line(stream, &response).await
}

async fn handle_fetch(
    stream: &mut BufReader<TcpStream>,
    store: &ArtifactStore,
    shader_hash: &str,
) -> Result<()> {
    let hash: ContentHash = match shader_hash.parse() {
        Ok(hash) => hash,
        Err(_) => {
            log::debug!(
                "serve: request for invalid hash {:?}",
                shader_hash
            );
            return write_line(stream, &FetchResponse::not_found()).await;
        }
    };

    // A corrupt entry is evicted inside `get` and reported absent
    let bytes = match store.get(&hash)? {
        Some(bytes) => bytes,
        None => {
            return write_line(stream, &FetchResponse::not_found()).await;
        }
    };

    let gzip = bytes.len() > COMPRESSION_THRESHOLD;
    let meta = FetchResponse {
        found: true,
        sha256: Some(hash.to_string()),
        size: Some(bytes.len() as u64),
        gzip: Some(gzip),
    };
    write_line(stream, &meta).await?;

    let payload = if gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&bytes)
            .and_then(|_| encoder.finish())
            .map_err(|err| {
                GridError::Storage(
                    "serve".to_string(),
                    format!("compression failed: {}", err),
                )
            })?
    } else {
        bytes
    };

    stream
        .get_mut()
        .write_all(&payload)
        .await
        .map_err(|err| GridError::Transport(err.to_string()))?;
    stream
        .get_mut()
        .flush()
        .await
        .map_err(|err| GridError::Transport(err.to_string()))?;

    log::debug!(
        "serve: sent {} ({} bytes{})",
        hash,
        payload.len(),
        if gzip { ", gzip" } else { "" }
    );
    Ok(())
}

async fn write_line<T: Serialize>(
    stream: &mut BufReader<TcpStream>,
    response: &T,
) -> Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    stream
        .get_mut()
        .write_all(line.as_bytes())
        .await
        .map_err(|err| GridError::Transport(err.to_string()))?;
    stream
        .get_mut()
        .flush()
        .await
        .map_err(|err| GridError::Transport(err.to_string()))?;
    Ok(())
}
