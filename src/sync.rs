use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use grid_discovery::{PeerDescriptor, PeerRegistry};
use grid_error::Result;
use grid_hash::ContentHash;
use grid_protocol::TransferClient;
use grid_store::ArtifactStore;

/// One snapshot of a running sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Work units processed so far, successful or not.
    pub completed: usize,
    /// Total work units discovered during planning.
    pub total: usize,
    /// Integer percentage, monotonically non-decreasing, in [0, 100].
    pub percent: u8,
}

/// Handle to one sync invocation: an observable progress stream plus
/// cancellation. The job state is ephemeral and discarded with the
/// handle.
pub struct SyncHandle {
    progress: watch::Receiver<SyncProgress>,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// A handle that is already done. Used when there is nothing to
    /// sync (for instance, a disabled grid).
    pub fn completed() -> Self {
        let (_, progress) = watch::channel(SyncProgress {
            completed: 0,
            total: 0,
            percent: 100,
        });
        Self {
            progress,
            task: None,
        }
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    /// A receiver the caller can await change notifications on.
    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress.clone()
    }

    /// Aborts the sync. Artifacts already stored stay stored.
    pub fn cancel(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| task.is_finished())
            .unwrap_or(true)
    }

    /// Waits for the sync to run to completion (or cancellation).
    pub async fn wait(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Drives one pre-use sync: plans the artifact gap against matching
/// peers, fetches what is missing, and reports progress.
pub struct SyncOrchestrator {
    store: Arc<ArtifactStore>,
    registry: Arc<PeerRegistry>,
    client: Arc<TransferClient>,
    capacity_bytes: u64,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<ArtifactStore>,
        registry: Arc<PeerRegistry>,
        client: Arc<TransferClient>,
        capacity_bytes: u64,
    ) -> Self {
        Self {
            store,
            registry,
            client,
            capacity_bytes,
        }
    }

    /// Starts the sync for one hardware class and returns its handle.
    ///
    /// The work itself runs on its own task: it performs many blocking
    /// network calls in sequence and must stay off any UI-facing
    /// context. Per-peer and per-artifact failures are logged and
    /// skipped; the sync never aborts because one unit of work failed.
    pub fn sync_for_hardware_class(&self, hardware_class: &str) -> SyncHandle {
        let (tx, rx) = watch::channel(SyncProgress::default());

        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let client = Arc::clone(&self.client);
        let capacity_bytes = self.capacity_bytes;
        let hardware_class = hardware_class.to_string();

        let task = tokio::spawn(async move {
            run_sync(
                store,
                registry,
                client,
                capacity_bytes,
                hardware_class,
                tx,
            )
            .await;
        });

        SyncHandle {
            progress: rx,
            task: Some(task),
        }
    }
}

async fn run_sync(
    store: Arc<ArtifactStore>,
    registry: Arc<PeerRegistry>,
    client: Arc<TransferClient>,
    capacity_bytes: u64,
    hardware_class: String,
    tx: watch::Sender<SyncProgress>,
) {
    let peers = registry.peers_with_hardware_class(&hardware_class);
    if peers.is_empty() {
        log::info!(
            "sync: no peers with gpu={}, skipping pre-use check",
            hardware_class
        );
        send_progress(&tx, 0, 0);
        return;
    }
    log::info!(
        "sync: pre-use check against {} peer(s) with gpu={}",
        peers.len(),
        hardware_class
    );

    // Planning pass, in registry order: each peer's list is diffed
    // against the local store; a hash already planned from an earlier
    // peer is not planned again. The plan fixes the total, which keeps
    // the percentage monotone.
    let mut work: Vec<(PeerDescriptor, ContentHash)> = Vec::new();
    let mut planned: HashSet<ContentHash> = HashSet::new();
    for peer in &peers {
        let listed = client.list_artifacts(peer, &hardware_class).await;
        let offered = listed.len();
        let mut missing = 0;
        for hash in listed {
            if store.has(&hash) || planned.contains(&hash) {
                continue;
            }
            planned.insert(hash.clone());
            work.push((peer.clone(), hash));
            missing += 1;
        }
        log::info!(
            "sync: peer {} offers {} artifact(s), {} missing locally",
            peer.node_id,
            offered,
            missing
        );
    }

    let total = work.len();
    if total == 0 {
        send_progress(&tx, 0, 0);
        return;
    }

    let mut completed = 0;
    for (peer, hash) in work {
        match fetch_one(&store, &client, capacity_bytes, &peer, &hash, &hardware_class)
            .await
        {
            Ok(()) => {
                log::debug!("sync: fetched {} from {}", hash, peer.node_id)
            }
            Err(err) => {
                // Unreachable peer, integrity failure, local I/O:
                // all skipped, the sync moves to the next unit
                log::warn!(
                    "sync: skipping {} from {}: {}",
                    hash,
                    peer.node_id,
                    err
                );
            }
        }
        completed += 1;
        send_progress(&tx, completed, total);
    }

    log::info!("sync: complete, {}/{} unit(s) processed", completed, total);
}

async fn fetch_one(
    store: &ArtifactStore,
    client: &TransferClient,
    capacity_bytes: u64,
    peer: &PeerDescriptor,
    hash: &ContentHash,
    hardware_class: &str,
) -> Result<()> {
    let bytes = client
        .fetch_artifact(peer, hash, hardware_class)
        .await?;
    // The authoritative integrity boundary: bytes that do not hash to
    // the requested identity never become visible in the store
    store.put(hash, &bytes)?;
    store.evict_if_over_capacity(capacity_bytes);
    Ok(())
}

/// Publishes a progress update. The percentage never decreases and an
/// empty plan reports straight to 100.
fn send_progress(
    tx: &watch::Sender<SyncProgress>,
    completed: usize,
    total: usize,
) {
    tx.send_modify(|progress| {
        let percent = if total == 0 {
            100
        } else {
            ((completed * 100) / total).min(100) as u8
        };
        progress.completed = completed;
        progress.total = total;
        progress.percent = progress.percent.max(percent);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use grid_discovery::static_list::{StaticDiscovery, StaticPeer};
    use grid_discovery::{Advertisement, Discovery};
    use tempdir::TempDir;

    const CLASS: &str = "Adreno 650";

    async fn spawn_server(store: Arc<ArtifactStore>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    grid_protocol::serve(stream, store, CLASS).await;
                });
            }
        });
        addr
    }

    fn static_peer(node_id: &str, addr: SocketAddr) -> StaticPeer {
        StaticPeer {
            node_id: node_id.to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            hardware_class: CLASS.to_string(),
            software_version: "1.0".to_string(),
        }
    }

    fn started_registry(peers: Vec<StaticPeer>) -> Arc<PeerRegistry> {
        let registry = Arc::new(PeerRegistry::new(
            "local0000local00".to_string(),
            Arc::new(StaticDiscovery::new(peers)) as Arc<dyn Discovery>,
        ));
        registry
            .start(Advertisement {
                node_id: "local0000local00".to_string(),
                port: 0,
                hardware_class: CLASS.to_string(),
                software_version: "1.0".to_string(),
            })
            .unwrap();
        registry
    }

    async fn wait_for_peers(registry: &PeerRegistry, count: usize) {
        for _ in 0..100 {
            if registry.peers_with_hardware_class(CLASS).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("peers did not appear in time");
    }

    fn orchestrator(
        store: Arc<ArtifactStore>,
        registry: Arc<PeerRegistry>,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            store,
            registry,
            Arc::new(TransferClient::new(
                Duration::from_secs(2),
                Duration::from_secs(5),
            )),
            crate::DEFAULT_CAPACITY_BYTES,
        )
    }

    #[tokio::test]
    async fn test_sync_with_no_peers_is_a_noop() {
        let temp_dir = TempDir::new("sync").unwrap();
        let store = Arc::new(
            ArtifactStore::new("local".to_string(), temp_dir.path())
                .unwrap(),
        );
        let registry = started_registry(Vec::new());

        let handle =
            orchestrator(store, registry).sync_for_hardware_class(CLASS);
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_sync_pulls_missing_artifacts() {
        let remote_dir = TempDir::new("remote").unwrap();
        let remote = Arc::new(
            ArtifactStore::new("remote".to_string(), remote_dir.path())
                .unwrap(),
        );
        let first = b"shader-binary-1".to_vec();
        let second = b"shader-binary-2".to_vec();
        let first_hash = ContentHash::from_bytes(&first);
        let second_hash = ContentHash::from_bytes(&second);
        remote.put(&first_hash, &first).unwrap();
        remote.put(&second_hash, &second).unwrap();

        let addr = spawn_server(Arc::clone(&remote)).await;
        let registry = started_registry(vec![static_peer("peer-a", addr)]);
        wait_for_peers(&registry, 1).await;

        let local_dir = TempDir::new("local").unwrap();
        let local = Arc::new(
            ArtifactStore::new("local".to_string(), local_dir.path())
                .unwrap(),
        );
        // One of the two is already cached
        local.put(&first_hash, &first).unwrap();

        let handle = orchestrator(Arc::clone(&local), registry)
            .sync_for_hardware_class(CLASS);
        let final_progress = {
            let handle_progress = handle.subscribe();
            handle.wait().await;
            let progress = handle_progress.borrow().clone();
            progress
        };

        assert_eq!(local.get(&second_hash).unwrap().unwrap(), second);
        assert_eq!(final_progress.total, 1);
        assert_eq!(final_progress.completed, 1);
        assert_eq!(final_progress.percent, 100);
        // The remote store was only read
        assert_eq!(remote.list_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_progress_is_monotone() {
        let remote_dir = TempDir::new("remote").unwrap();
        let remote = Arc::new(
            ArtifactStore::new("remote".to_string(), remote_dir.path())
                .unwrap(),
        );
        for i in 0..5u8 {
            let bytes = vec![i; 64];
            remote.put(&ContentHash::from_bytes(&bytes), &bytes).unwrap();
        }

        let addr = spawn_server(Arc::clone(&remote)).await;
        let registry = started_registry(vec![static_peer("peer-a", addr)]);
        wait_for_peers(&registry, 1).await;

        let local_dir = TempDir::new("local").unwrap();
        let local = Arc::new(
            ArtifactStore::new("local".to_string(), local_dir.path())
                .unwrap(),
        );

        let handle = orchestrator(Arc::clone(&local), registry)
            .sync_for_hardware_class(CLASS);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut rx = handle.subscribe();
        let seen_clone = Arc::clone(&seen);
        let collector = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                seen_clone.lock().unwrap().push(rx.borrow().percent);
            }
        });

        handle.wait().await;
        let _ = collector.await;

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*seen.last().unwrap(), 100);
        assert_eq!(local.list_all().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_skipped() {
        let remote_dir = TempDir::new("remote").unwrap();
        let remote = Arc::new(
            ArtifactStore::new("remote".to_string(), remote_dir.path())
                .unwrap(),
        );
        let bytes = b"shader-binary-1".to_vec();
        let hash = ContentHash::from_bytes(&bytes);
        remote.put(&hash, &bytes).unwrap();

        let addr = spawn_server(Arc::clone(&remote)).await;
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let registry = started_registry(vec![
            static_peer("peer-dead", dead),
            static_peer("peer-live", addr),
        ]);
        wait_for_peers(&registry, 2).await;

        let local_dir = TempDir::new("local").unwrap();
        let local = Arc::new(
            ArtifactStore::new("local".to_string(), local_dir.path())
                .unwrap(),
        );

        let handle = orchestrator(Arc::clone(&local), registry)
            .sync_for_hardware_class(CLASS);
        handle.wait().await;

        // The dead peer contributed nothing but did not stop the sync
        assert_eq!(local.get(&hash).unwrap().unwrap(), bytes);
    }
}
