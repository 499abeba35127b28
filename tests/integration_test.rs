#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tempdir::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use grid_discovery::static_list::{StaticDiscovery, StaticPeer};
    use shader_grid::{ContentHash, GridConfig, GridContext};

    const CLASS: &str = "Adreno 650";

    fn node_config(
        temp_dir: &TempDir,
        peers: Vec<StaticPeer>,
    ) -> GridConfig {
        let mut config = GridConfig::new(
            temp_dir.path().join("cache"),
            CLASS.to_string(),
            Arc::new(StaticDiscovery::new(peers)),
        );
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config
    }

    fn peer_at(node_id: &str, addr: SocketAddr) -> StaticPeer {
        StaticPeer {
            node_id: node_id.to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            hardware_class: CLASS.to_string(),
            software_version: "1.0".to_string(),
        }
    }

    async fn wait_for_peers(grid: &GridContext, count: usize) {
        for _ in 0..100 {
            if grid.peer_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("peers did not appear in time");
    }

    #[tokio::test]
    async fn test_two_node_sync_round_trip() {
        let _ = env_logger::builder().is_test(true).try_init();

        // Node A holds one compiled shader
        let dir_a = TempDir::new("node-a").unwrap();
        let node_a = GridContext::init(node_config(&dir_a, Vec::new()))
            .expect("init A failed");
        node_a.start().await.expect("start A failed");
        let port_a = node_a.listen_port().expect("A has no listener");

        let bytes = b"shader-binary-1".to_vec();
        let h1 = ContentHash::from_bytes(&bytes);
        node_a.store().put(&h1, &bytes).unwrap();

        // Node B, same hardware class, empty cache
        let dir_b = TempDir::new("node-b").unwrap();
        let addr_a: SocketAddr =
            format!("127.0.0.1:{}", port_a).parse().unwrap();
        let node_b = GridContext::init(node_config(
            &dir_b,
            vec![peer_at("node-a", addr_a)],
        ))
        .expect("init B failed");
        node_b.start().await.expect("start B failed");
        wait_for_peers(&node_b, 1).await;

        let sync = node_b.sync_for_hardware_class(CLASS);
        sync.wait().await;

        // B now holds exactly the shader A had; A is unchanged
        assert_eq!(node_b.store().get(&h1).unwrap().unwrap(), bytes);
        assert_eq!(node_b.store().list_all().unwrap().len(), 1);
        assert_eq!(node_a.store().list_all().unwrap().len(), 1);

        node_a.stop();
        node_b.stop();
    }

    #[tokio::test]
    async fn test_lying_peer_artifact_never_enters_store() {
        let _ = env_logger::builder().is_test(true).try_init();

        let genuine = b"shader-binary-1".to_vec();
        let h1 = ContentHash::from_bytes(&genuine);

        // A hand-rolled peer that advertises h1 but streams bytes
        // hashing to something else entirely
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hash_string = h1.to_string();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                let hash_string = hash_string.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.is_err() {
                        return;
                    }
                    let forged = b"not-the-shader-you-wanted".to_vec();
                    let response = if line.contains("list_shaders") {
                        json!({
                            "shaders": [hash_string],
                            "count": 1,
                            "gpu": CLASS,
                        })
                        .to_string()
                    } else {
                        json!({
                            "found": true,
                            "sha256": hash_string,
                            "size": forged.len(),
                            "gzip": false,
                        })
                        .to_string()
                    };
                    let writer = reader.get_mut();
                    let _ = writer
                        .write_all(format!("{}\n", response).as_bytes())
                        .await;
                    if !line.contains("list_shaders") {
                        let _ = writer.write_all(&forged).await;
                    }
                    let _ = writer.flush().await;
                });
            }
        });

        let dir_b = TempDir::new("node-b").unwrap();
        let node_b = GridContext::init(node_config(
            &dir_b,
            vec![peer_at("liar", addr)],
        ))
        .expect("init B failed");
        node_b.start().await.expect("start B failed");
        wait_for_peers(&node_b, 1).await;

        let sync = node_b.sync_for_hardware_class(CLASS);
        let progress = sync.subscribe();
        sync.wait().await;

        // The transfer was attempted and counted, but the forged
        // artifact never became visible under h1
        assert_eq!(progress.borrow().percent, 100);
        assert!(!node_b.store().has(&h1));
        assert!(node_b.store().list_all().unwrap().is_empty());

        node_b.stop();
    }
}
