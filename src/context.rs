use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use grid_discovery::{local_node_id, Advertisement, Discovery, PeerRegistry};
use grid_error::Result;
use grid_protocol::TransferClient;
use grid_store::ArtifactStore;

use crate::sync::{SyncHandle, SyncOrchestrator};
use crate::{DEFAULT_CAPACITY_BYTES, SOFTWARE_VERSION};

/// How often the registry sweeps for stale peers.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Configuration for one grid node.
pub struct GridConfig {
    /// Directory the artifact cache lives in.
    pub cache_dir: PathBuf,
    /// Bound on total cached bytes, enforced by LRU eviction.
    pub capacity_bytes: u64,
    /// Identifies the rendering hardware. The probe belongs to the
    /// host application; the grid only partitions peers by the string.
    pub hardware_class: String,
    pub software_version: String,
    /// The host-persisted switch. A disabled grid does nothing at all.
    pub enabled: bool,
    /// Address the transfer listener binds. Port 0 picks an ephemeral
    /// port, which is then advertised to peers.
    pub listen_addr: SocketAddr,
    /// Transport that carries advertisements between nodes.
    pub discovery: Arc<dyn Discovery>,
}

impl GridConfig {
    pub fn new(
        cache_dir: PathBuf,
        hardware_class: String,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        Self {
            cache_dir,
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            hardware_class,
            software_version: SOFTWARE_VERSION.to_string(),
            enabled: true,
            listen_addr: "0.0.0.0:0".parse().expect("static address"),
            discovery,
        }
    }
}

struct ListenerState {
    port: u16,
    tasks: Vec<JoinHandle<()>>,
}

/// Handle to one running grid node.
///
/// Created by [`GridContext::init`]; every operation goes through the
/// handle rather than process-wide state. Dropping the handle stops
/// the node.
pub struct GridContext {
    node_id: String,
    hardware_class: String,
    software_version: String,
    enabled: bool,
    capacity_bytes: u64,
    listen_addr: SocketAddr,
    store: Arc<ArtifactStore>,
    registry: Arc<PeerRegistry>,
    client: Arc<TransferClient>,
    listener: Mutex<Option<ListenerState>>,
}

impl GridContext {
    /// Builds the context: derives the node identity and opens the
    /// artifact store. No network activity until [`GridContext::start`].
    pub fn init(config: GridConfig) -> Result<Self> {
        let node_id = local_node_id();
        let store = Arc::new(ArtifactStore::new(
            "grid".to_string(),
            &config.cache_dir,
        )?);
        let registry = Arc::new(PeerRegistry::new(
            node_id.clone(),
            Arc::clone(&config.discovery),
        ));

        log::info!(
            "grid: initialized, node_id={} gpu={}",
            node_id,
            config.hardware_class
        );

        Ok(Self {
            node_id,
            hardware_class: config.hardware_class,
            software_version: config.software_version,
            enabled: config.enabled,
            capacity_bytes: config.capacity_bytes,
            listen_addr: config.listen_addr,
            store,
            registry,
            client: Arc::new(TransferClient::default()),
            listener: Mutex::new(None),
        })
    }

    /// Binds the inbound transfer listener, starts advertising this
    /// node and watching for peers. Idempotent; a no-op when the grid
    /// is disabled.
    pub async fn start(&self) -> Result<()> {
        if !self.enabled {
            log::info!("grid: disabled, not starting");
            return Ok(());
        }
        if self.listener.lock().unwrap().is_some() {
            log::debug!("grid: already started");
            return Ok(());
        }

        let listener = TcpListener::bind(self.listen_addr).await?;
        let port = listener.local_addr()?.port();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.store),
            self.hardware_class.clone(),
        ));
        let sweep_task = tokio::spawn(expiry_sweep(Arc::clone(&self.registry)));

        {
            let mut state = self.listener.lock().unwrap();
            if state.is_some() {
                // Lost a start/start race; keep the first listener
                accept_task.abort();
                sweep_task.abort();
                return Ok(());
            }
            *state = Some(ListenerState {
                port,
                tasks: vec![accept_task, sweep_task],
            });
        }

        self.registry.start(Advertisement {
            node_id: self.node_id.clone(),
            port,
            hardware_class: self.hardware_class.clone(),
            software_version: self.software_version.clone(),
        })?;

        log::info!("grid: started, listening on port {}", port);
        Ok(())
    }

    /// Withdraws the advertisement, stops watching, clears known peers
    /// and releases the listening port. Always safe to call.
    pub fn stop(&self) {
        self.registry.stop();
        if let Some(state) = self.listener.lock().unwrap().take() {
            for task in state.tasks {
                task.abort();
            }
        }
        log::info!("grid: stopped");
    }

    /// Pulls artifacts this node is missing from peers advertising the
    /// given hardware class. Returns a handle exposing the progress
    /// stream and cancellation; a disabled grid returns an
    /// already-completed handle.
    pub fn sync_for_hardware_class(&self, hardware_class: &str) -> SyncHandle {
        if !self.enabled {
            log::debug!("grid: disabled, sync is a no-op");
            return SyncHandle::completed();
        }
        SyncOrchestrator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.client),
            self.capacity_bytes,
        )
        .sync_for_hardware_class(hardware_class)
    }

    /// Adds the cache-directory variables to an environment map that
    /// will be handed to the launched workload, directing its shader
    /// cache through this store. A no-op when disabled.
    pub fn environment_for_process(
        &self,
        env: &mut HashMap<String, String>,
    ) {
        if !self.enabled {
            return;
        }
        let cache_dir = self.store.root().display().to_string();

        env.insert("MESA_SHADER_CACHE_DIR".to_string(), cache_dir.clone());
        env.insert(
            "MESA_SHADER_CACHE_MAX_SIZE".to_string(),
            format_capacity(self.capacity_bytes),
        );
        // Older Mesa versions use the GLSL name
        env.insert("MESA_GLSL_CACHE_DIR".to_string(), cache_dir.clone());
        // NVIDIA driver equivalent
        env.insert(
            "__GL_SHADER_DISK_CACHE_PATH".to_string(),
            cache_dir.clone(),
        );

        log::info!("grid: environment injected, cache_dir={}", cache_dir);
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn peer_count(&self) -> usize {
        self.registry.peer_count()
    }

    /// Port the transfer listener is bound to, when started.
    pub fn listen_port(&self) -> Option<u16> {
        self.listener
            .lock()
            .unwrap()
            .as_ref()
            .map(|state| state.port)
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }
}

impl Drop for GridContext {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accepts inbound transfer connections for as long as the grid runs,
/// handing each one to its own task.
async fn accept_loop(
    listener: TcpListener,
    store: Arc<ArtifactStore>,
    hardware_class: String,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                log::debug!("grid: inbound connection from {}", remote);
                let store = Arc::clone(&store);
                let hardware_class = hardware_class.clone();
                tokio::spawn(async move {
                    grid_protocol::serve(stream, store, &hardware_class)
                        .await;
                });
            }
            Err(err) => {
                log::warn!("grid: accept failed: {}", err);
            }
        }
    }
}

async fn expiry_sweep(registry: Arc<PeerRegistry>) {
    let mut timer = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
    loop {
        timer.tick().await;
        registry.expire_stale();
    }
}

/// Renders a byte count the way shader-cache size variables expect it.
fn format_capacity(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{}G", bytes / GIB)
    } else if bytes >= MIB && bytes % MIB == 0 {
        format!("{}M", bytes / MIB)
    } else {
        bytes.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_discovery::static_list::StaticDiscovery;
    use tempdir::TempDir;

    fn config_in(temp_dir: &TempDir) -> GridConfig {
        let mut config = GridConfig::new(
            temp_dir.path().join("cache"),
            "Adreno 650".to_string(),
            Arc::new(StaticDiscovery::new(Vec::new())),
        );
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config
    }

    #[test]
    fn test_format_capacity() {
        assert_eq!(format_capacity(500 * 1024 * 1024), "500M");
        assert_eq!(format_capacity(1024 * 1024 * 1024), "1G");
        assert_eq!(format_capacity(1234), "1234");
    }

    #[tokio::test]
    async fn test_start_binds_and_is_idempotent() {
        let temp_dir = TempDir::new("grid").unwrap();
        let grid = GridContext::init(config_in(&temp_dir)).unwrap();

        grid.start().await.unwrap();
        let port = grid.listen_port().expect("listener not bound");
        assert_ne!(port, 0);

        grid.start().await.unwrap();
        assert_eq!(grid.listen_port(), Some(port));

        grid.stop();
        assert_eq!(grid.listen_port(), None);
    }

    #[tokio::test]
    async fn test_stop_is_safe_when_never_started() {
        let temp_dir = TempDir::new("grid").unwrap();
        let grid = GridContext::init(config_in(&temp_dir)).unwrap();
        grid.stop();
        grid.stop();
    }

    #[tokio::test]
    async fn test_disabled_grid_does_nothing() {
        let temp_dir = TempDir::new("grid").unwrap();
        let mut config = config_in(&temp_dir);
        config.enabled = false;
        let grid = GridContext::init(config).unwrap();

        grid.start().await.unwrap();
        assert_eq!(grid.listen_port(), None);

        let mut env = HashMap::new();
        grid.environment_for_process(&mut env);
        assert!(env.is_empty());

        let sync = grid.sync_for_hardware_class("Adreno 650");
        let progress = sync.progress();
        assert_eq!(progress.percent, 100);
    }

    #[tokio::test]
    async fn test_environment_injection() {
        let temp_dir = TempDir::new("grid").unwrap();
        let grid = GridContext::init(config_in(&temp_dir)).unwrap();

        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        grid.environment_for_process(&mut env);

        let cache_dir = grid.store().root().display().to_string();
        assert_eq!(env.get("MESA_SHADER_CACHE_DIR"), Some(&cache_dir));
        assert_eq!(env.get("MESA_GLSL_CACHE_DIR"), Some(&cache_dir));
        assert_eq!(
            env.get("__GL_SHADER_DISK_CACHE_PATH"),
            Some(&cache_dir)
        );
        assert_eq!(
            env.get("MESA_SHADER_CACHE_MAX_SIZE"),
            Some(&"500M".to_string())
        );
        // Pre-existing entries are untouched
        assert_eq!(env.get("PATH"), Some(&"/usr/bin".to_string()));
    }
}
