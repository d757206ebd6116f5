//! Common test utilities for `Hubfile` integration tests.
//!
//! Two services are wired back to back through [`LinkTransport`]: whatever
//! one node sends lands in the other node's event channel, with frames
//! addressed to the hub delivered to the peer as the hub would.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use hubfile_core::config::FileConfig;
use hubfile_core::events::TaskView;
use hubfile_core::transfer::FileService;
use hubfile_core::transport::{InboundFrame, Major, Route, Transport, TransportEvent};
use hubfile_core::{Error, Result};

/// Hub id used by every test node.
pub const HUB: u32 = 1;
/// Node id of the first node.
pub const NODE_A: u32 = 10;
/// Node id of the second node.
pub const NODE_B: u32 = 20;

const CHANNEL_CAPACITY: usize = 4096;

/// One end of an in-memory link.
pub struct LinkTransport {
    peer: u32,
    tx: mpsc::Sender<TransportEvent>,
    down: AtomicBool,
    drop_data: AtomicBool,
    sent: Mutex<Vec<(Route, Vec<u8>)>>,
}

impl LinkTransport {
    fn new(peer: u32, tx: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            peer,
            tx,
            down: AtomicBool::new(false),
            drop_data: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Make every send fail.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Silently lose data and ack frames.
    pub fn set_drop_data(&self, drop: bool) {
        self.drop_data.store(drop, Ordering::SeqCst);
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<(Route, Vec<u8>)> {
        self.sent.lock().clone()
    }
}

impl Transport for LinkTransport {
    async fn send(&self, route: Route, payload: Vec<u8>) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Transport("link down".to_string()));
        }
        self.sent.lock().push((route, payload.clone()));
        if route.major == Major::Msg && self.drop_data.load(Ordering::SeqCst) {
            return Ok(());
        }
        let target_id = if route.target_id == HUB {
            self.peer
        } else {
            route.target_id
        };
        let frame = InboundFrame {
            major: match route.major {
                Major::Cmd => 1,
                Major::Msg => 2,
            },
            sub_proto: route.sub_proto,
            source_id: route.source_id,
            target_id,
            payload,
        };
        self.tx
            .send(TransportEvent::Frame(frame))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// A running node.
pub struct Node {
    pub id: u32,
    pub service: FileService<Arc<LinkTransport>>,
    pub transport: Arc<LinkTransport>,
    pub base: tempfile::TempDir,
}

impl Node {
    /// Base directory of this node.
    pub fn base_path(&self) -> &Path {
        self.base.path()
    }
}

/// Install a test-friendly subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}

/// Config rooted at `base` with small chunks so transfers span many frames.
pub fn test_config(base: &Path) -> FileConfig {
    FileConfig {
        base_dir: base.to_path_buf(),
        chunk_bytes: 16 * 1024,
        ..FileConfig::default()
    }
}

/// Two connected nodes, A and B, each running its event loop.
pub fn connected_pair() -> (Node, Node) {
    connected_pair_with(test_config, test_config)
}

/// Two connected nodes with per-node config.
pub fn connected_pair_with(
    config_a: impl FnOnce(&Path) -> FileConfig,
    config_b: impl FnOnce(&Path) -> FileConfig,
) -> (Node, Node) {
    init_tracing();
    let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
    let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

    let base_a = create_temp_dir();
    let base_b = create_temp_dir();
    let transport_a = Arc::new(LinkTransport::new(NODE_B, tx_b));
    let transport_b = Arc::new(LinkTransport::new(NODE_A, tx_a));

    let service_a = FileService::new(Arc::clone(&transport_a), config_a(base_a.path()));
    service_a.set_identity(NODE_A, HUB);
    let service_b = FileService::new(Arc::clone(&transport_b), config_b(base_b.path()));
    service_b.set_identity(NODE_B, HUB);

    tokio::spawn(service_a.clone().run(rx_a));
    tokio::spawn(service_b.clone().run(rx_b));

    (
        Node {
            id: NODE_A,
            service: service_a,
            transport: transport_a,
            base: base_a,
        },
        Node {
            id: NODE_B,
            service: service_b,
            transport: transport_b,
            base: base_b,
        },
    )
}

/// A single node A without an event loop.
///
/// Frames are fed with `handle_event`; whatever A sends shows up on the
/// returned receiver, addressed as if B had received it.
pub fn solo_node(config: impl FnOnce(&Path) -> FileConfig) -> (Node, mpsc::Receiver<TransportEvent>) {
    init_tracing();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let base = create_temp_dir();
    let transport = Arc::new(LinkTransport::new(NODE_B, tx));
    let service = FileService::new(Arc::clone(&transport), config(base.path()));
    service.set_identity(NODE_A, HUB);
    (
        Node {
            id: NODE_A,
            service,
            transport,
            base,
        },
        rx,
    )
}

/// Poll `service` until the task with `task_id` satisfies `pred`.
pub async fn wait_for_task(
    service: &FileService<Arc<LinkTransport>>,
    task_id: &str,
    pred: impl Fn(&TaskView) -> bool,
) -> TaskView {
    wait_for_any(service, |t| t.task_id == task_id && pred(t)).await
}

/// Poll `service` until some task satisfies `pred`.
pub async fn wait_for_any(
    service: &FileService<Arc<LinkTransport>>,
    pred: impl Fn(&TaskView) -> bool,
) -> TaskView {
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(task) = service.tasks_snapshot().into_iter().find(|t| pred(t)) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    found.unwrap_or_else(|_| {
        panic!(
            "Timed out waiting for task, have: {:#?}",
            service.tasks_snapshot()
        )
    })
}

/// Poll until `cond` holds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timed out waiting for condition");
}

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}
