//! Shared fakes and helpers for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use riptide::assignment;
use riptide::config::{AppConfig, AppSettings, DepCfg};
use riptide::consumer::{
    Consumer, ConsumerConfig, EngineProcess, EngineSpawner, RebalanceIntervals,
};
use riptide::dcp::{CdcClient, CdcMessage, StreamStart};
use riptide::membership::ClusterMember;
use riptide::producer::ProducerContext;
use riptide::protocol::{self, Message, Response};
use riptide::timer_transfer::{TimerTransferClient, TransferError, TransferSession};
use riptide::Vbucket;

/// Route `tracing` output through the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `f` until it holds, panicking after ten seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// `wait_until` for async conditions.
pub async fn wait_until_async<F, Fut>(what: &str, f: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Millisecond-scale rebalance timings so tests converge quickly.
pub fn fast_intervals() -> RebalanceIntervals {
    RebalanceIntervals {
        bucket_op_retry: Duration::from_millis(10),
        vb_meta_state_check: Duration::from_millis(10),
        vb_takeover_retry: Duration::from_millis(10),
        dcp_stream_request_retry: Duration::from_millis(10),
    }
}

/// App config with test credentials and a short checkpoint tick.
pub fn test_app_config(app_name: &str, worker_count: usize) -> Arc<AppConfig> {
    let map = serde_json::json!({
        "rbacuser": "admin",
        "rbacpass": "secret",
        "worker_count": worker_count,
        "tick_duration": 50.0,
    })
    .as_object()
    .unwrap()
    .clone();
    let settings = AppSettings::from_map(&map).unwrap();
    Arc::new(AppConfig {
        app_name: app_name.to_string(),
        app_code: "function OnUpdate(doc, meta) {}".to_string(),
        handler_uuid: 1,
        function_instance_id: "inst-test".to_string(),
        dep_cfg: DepCfg {
            buckets: Vec::new(),
            metadata_bucket: "eventing-meta".to_string(),
            source_bucket: "source".to_string(),
            source_scope: "_default".to_string(),
            source_collection: "_default".to_string(),
            metadata_scope: "_default".to_string(),
            metadata_collection: "_default".to_string(),
        },
        access: Vec::new(),
        curl: Vec::new(),
        constants: Vec::new(),
        settings,
        raw_settings: map,
    })
}

pub fn consumer_config(
    worker_name: &str,
    num_vbuckets: u16,
    eventing_dir: &Path,
) -> ConsumerConfig {
    ConsumerConfig {
        worker_name: worker_name.to_string(),
        num_vbuckets,
        eventing_dir: eventing_dir.to_path_buf(),
        eventing_port: "8096".to_string(),
        curr_host: "127.0.0.1".to_string(),
        kv_host_port: "127.0.0.1:11210".to_string(),
        intervals: fast_intervals(),
    }
}

// ---------------------------------------------------------------------------
// Producer context fake
// ---------------------------------------------------------------------------

/// One node's view of the cluster, driven directly by the test.
pub struct FakeNodeCtx {
    pub node_uuid: String,
    pub host_port: String,
    node_assign: RwLock<HashMap<Vbucket, String>>,
    worker_assign: RwLock<BTreeMap<String, Vec<Vbucket>>>,
    dead_uuids: RwLock<HashSet<String>>,
}

impl FakeNodeCtx {
    pub fn new(node_uuid: &str, host_port: &str) -> Arc<Self> {
        Arc::new(Self {
            node_uuid: node_uuid.to_string(),
            host_port: host_port.to_string(),
            node_assign: RwLock::new(HashMap::new()),
            worker_assign: RwLock::new(BTreeMap::new()),
            dead_uuids: RwLock::new(HashSet::new()),
        })
    }

    /// Recompute this node's plan from a membership snapshot.
    pub fn apply_plan(
        &self,
        members: &[ClusterMember],
        app_name: &str,
        worker_count: usize,
        num_vbuckets: u16,
    ) {
        let node_assign = assignment::plan_node_assignment(members, num_vbuckets);
        let mut local: Vec<Vbucket> = node_assign
            .iter()
            .filter(|(_, addr)| **addr == self.host_port)
            .map(|(vb, _)| *vb)
            .collect();
        local.sort_unstable();
        let worker_assign = assignment::plan_worker_assignment(app_name, &local, worker_count);
        *self.node_assign.write().unwrap() = node_assign;
        *self.worker_assign.write().unwrap() = worker_assign;
    }

    pub fn mark_dead(&self, node_uuid: &str) {
        self.dead_uuids.write().unwrap().insert(node_uuid.to_string());
    }
}

#[async_trait]
impl ProducerContext for FakeNodeCtx {
    fn vb_eventing_node_assign_map(&self) -> HashMap<Vbucket, String> {
        self.node_assign.read().unwrap().clone()
    }

    fn worker_vb_map(&self) -> BTreeMap<String, Vec<Vbucket>> {
        self.worker_assign.read().unwrap().clone()
    }

    async fn is_eventing_node_alive(&self, _host_port: &str, node_uuid: &str) -> bool {
        !self.dead_uuids.read().unwrap().contains(node_uuid)
    }

    fn node_uuid(&self) -> String {
        self.node_uuid.clone()
    }

    fn host_port_addr(&self) -> String {
        self.host_port.clone()
    }
}

// ---------------------------------------------------------------------------
// Membership oracle fake
// ---------------------------------------------------------------------------

/// Oracle whose snapshots the test scripts directly.
pub struct ScriptedOracle {
    current: ClusterMember,
    members: RwLock<Vec<ClusterMember>>,
    dead_uuids: RwLock<HashSet<String>>,
}

impl ScriptedOracle {
    pub fn new(current: ClusterMember, members: Vec<ClusterMember>) -> Arc<Self> {
        Arc::new(Self {
            current,
            members: RwLock::new(members),
            dead_uuids: RwLock::new(HashSet::new()),
        })
    }

    pub fn set_members(&self, members: Vec<ClusterMember>) {
        *self.members.write().unwrap() = members;
    }

    pub fn mark_dead(&self, node_uuid: &str) {
        self.dead_uuids.write().unwrap().insert(node_uuid.to_string());
    }
}

#[async_trait]
impl riptide::MembershipOracle for ScriptedOracle {
    async fn eventing_nodes(&self) -> anyhow::Result<Vec<ClusterMember>> {
        Ok(self.members.read().unwrap().clone())
    }

    async fn kv_nodes(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec!["127.0.0.1:11210".to_string()])
    }

    async fn current_node(&self) -> anyhow::Result<ClusterMember> {
        Ok(self.current.clone())
    }

    async fn is_alive(&self, host_port: &str, node_uuid: &str) -> bool {
        !self.dead_uuids.read().unwrap().contains(node_uuid)
            && self
                .members
                .read()
                .unwrap()
                .iter()
                .any(|m| m.host_port == host_port && m.node_uuid == node_uuid)
    }
}

// ---------------------------------------------------------------------------
// CDC fake
// ---------------------------------------------------------------------------

/// In-memory CDC producer: streams are channels the test can feed.
#[derive(Default)]
pub struct FakeCdc {
    senders: Mutex<HashMap<Vbucket, mpsc::Sender<CdcMessage>>>,
    opens: Mutex<Vec<(Vbucket, StreamStart)>>,
}

impl FakeCdc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every `open_stream` call observed, in order.
    pub fn opens(&self) -> Vec<(Vbucket, StreamStart)> {
        self.opens.lock().unwrap().clone()
    }

    pub fn open_count(&self, vb: Vbucket) -> usize {
        self.opens
            .lock()
            .unwrap()
            .iter()
            .filter(|(v, _)| *v == vb)
            .count()
    }

    /// Push one event into an open stream.
    pub async fn push(&self, message: CdcMessage) {
        let vb = match &message {
            CdcMessage::Event(event) => event.vb,
            CdcMessage::StreamEnd(vb) => *vb,
        };
        let sender = self.senders.lock().unwrap().get(&vb).cloned();
        sender
            .unwrap_or_else(|| panic!("no open stream for vb {vb}"))
            .send(message)
            .await
            .unwrap();
    }
}

#[async_trait]
impl CdcClient for FakeCdc {
    async fn open_stream(
        &self,
        vb: Vbucket,
        start: StreamStart,
    ) -> anyhow::Result<mpsc::Receiver<CdcMessage>> {
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().unwrap().insert(vb, tx);
        self.opens.lock().unwrap().push((vb, start));
        Ok(rx)
    }

    async fn close_stream(&self, vb: Vbucket) -> anyhow::Result<()> {
        let sender = self.senders.lock().unwrap().remove(&vb);
        if let Some(sender) = sender {
            // Terminal marker, matching a real producer's close handshake.
            let _ = sender.send(CdcMessage::StreamEnd(vb)).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Timer transfer fake
// ---------------------------------------------------------------------------

/// Records dial/download calls and materialises the downloaded directory.
#[derive(Default)]
pub struct RecordingTimerRpc {
    downloads: Arc<Mutex<Vec<(String, String, String)>>>,
}

impl RecordingTimerRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn downloads(&self) -> Vec<(String, String, String)> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

struct RecordingSession {
    addr: String,
    downloads: Arc<Mutex<Vec<(String, String, String)>>>,
}

#[async_trait]
impl TransferSession for RecordingSession {
    async fn download(
        &mut self,
        src_path: &Path,
        dst_path: &Path,
    ) -> Result<(), TransferError> {
        std::fs::create_dir_all(dst_path).map_err(|_| TransferError::Download {
            dir: src_path.display().to_string(),
            addr: self.addr.clone(),
        })?;
        self.downloads.lock().unwrap().push((
            self.addr.clone(),
            src_path.display().to_string(),
            dst_path.display().to_string(),
        ));
        Ok(())
    }
}

#[async_trait]
impl TimerTransferClient for RecordingTimerRpc {
    async fn dial(
        &self,
        host_port: &str,
        _worker_name: &str,
    ) -> Result<Box<dyn TransferSession>, TransferError> {
        Ok(Box::new(RecordingSession {
            addr: host_port.to_string(),
            downloads: self.downloads.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Engine fake
// ---------------------------------------------------------------------------

/// One in-process "engine": connects back over loopback like the real
/// subprocess, records every decoded message, and sends queued responses.
pub struct FakeEngineConn {
    pub worker: String,
    pub received: Arc<Mutex<Vec<Message>>>,
    respond_tx: mpsc::UnboundedSender<Response>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FakeEngineConn {
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    pub fn respond(&self, response: Response) {
        let _ = self.respond_tx.send(response);
    }

    /// Drop the control connection, as a crashing engine would.
    pub fn kill(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Spawner that runs fake engines inside the test process.
#[derive(Default)]
pub struct FakeEngineSpawner {
    pub engines: Mutex<Vec<Arc<FakeEngineConn>>>,
}

impl FakeEngineSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn engine_count(&self) -> usize {
        self.engines.lock().unwrap().len()
    }

    pub fn engine(&self, index: usize) -> Arc<FakeEngineConn> {
        self.engines.lock().unwrap()[index].clone()
    }
}

struct FakeEngineProcess {
    conn: Arc<FakeEngineConn>,
}

#[async_trait]
impl EngineProcess for FakeEngineProcess {
    async fn kill(&mut self) -> anyhow::Result<()> {
        self.conn.kill();
        Ok(())
    }
}

#[async_trait]
impl EngineSpawner for FakeEngineSpawner {
    async fn spawn(
        &self,
        worker_name: &str,
        control_port: u16,
    ) -> anyhow::Result<Box<dyn EngineProcess>> {
        let stream = TcpStream::connect(("127.0.0.1", control_port)).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let received = Arc::new(Mutex::new(Vec::new()));
        let (respond_tx, mut respond_rx) = mpsc::unbounded_channel::<Response>();

        let reader_received = received.clone();
        let reader = tokio::spawn(async move {
            while let Ok(message) = protocol::read_message(&mut read_half).await {
                reader_received.lock().unwrap().push(message);
            }
        });
        let writer = tokio::spawn(async move {
            while let Some(response) = respond_rx.recv().await {
                if protocol::write_response(&mut write_half, &response).await.is_err() {
                    return;
                }
            }
        });

        let conn = Arc::new(FakeEngineConn {
            worker: worker_name.to_string(),
            received,
            respond_tx,
            tasks: Mutex::new(vec![reader, writer]),
        });
        self.engines.lock().unwrap().push(conn.clone());
        Ok(Box::new(FakeEngineProcess { conn }))
    }
}

// ---------------------------------------------------------------------------
// Consumer wiring
// ---------------------------------------------------------------------------

/// Assemble a consumer against the shared fakes without starting an engine.
pub struct TestNode {
    pub ctx: Arc<FakeNodeCtx>,
    pub cdc: Arc<FakeCdc>,
    pub consumers: Vec<Consumer>,
}

#[allow(clippy::too_many_arguments)]
pub fn build_node(
    node_uuid: &str,
    host_port: &str,
    app: &Arc<AppConfig>,
    store: &Arc<riptide::MemoryMetaStore>,
    timer_rpc: &Arc<RecordingTimerRpc>,
    spawner: &Arc<FakeEngineSpawner>,
    num_vbuckets: u16,
    eventing_dir: &Path,
) -> TestNode {
    init_tracing();
    let ctx = FakeNodeCtx::new(node_uuid, host_port);
    let cdc = FakeCdc::new();
    let consumers = (0..app.settings.worker_count)
        .map(|ordinal| {
            let worker = assignment::worker_name(&app.app_name, ordinal);
            Consumer::new(
                consumer_config(&worker, num_vbuckets, eventing_dir),
                app.clone(),
                ctx.clone(),
                store.clone(),
                cdc.clone(),
                timer_rpc.clone(),
                spawner.clone(),
            )
        })
        .collect();
    TestNode { ctx, cdc, consumers }
}

pub fn members(pairs: &[(&str, &str)]) -> Vec<ClusterMember> {
    pairs
        .iter()
        .map(|(uuid, addr)| ClusterMember {
            node_uuid: uuid.to_string(),
            host_port: addr.to_string(),
        })
        .collect()
}

pub fn temp_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    (dir, path)
}
