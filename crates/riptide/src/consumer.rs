//! Worker supervisor: one script-engine subprocess and its vbucket streams.
//!
//! The consumer owns the engine's control channel (a loopback TCP
//! connection), a bounded outbound queue that applies backpressure at
//! `worker_queue_cap`, the per-vbucket CDC pumps, and the periodic
//! checkpointer. Ownership movement lives in the `rebalance` module but
//! operates on the state kept here.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{
    self, epoch_secs, vb_blob_key, CasOutcome, CheckpointBlob, MetaStore, StreamStatus,
};
use crate::config::{AppConfig, StreamBoundary};
use crate::dcp::{CdcClient, CdcMessage, CdcOp, StreamStart};
use crate::producer::ProducerContext;
use crate::protocol::{
    self, DcpOpcode, Header, Message, Payload, Response, ResponseOpcode, SettingOpcode,
    ThreadPartitions, V8WorkerOpcode,
};
use crate::stats::{EngineStats, VbProcessingStats};
use crate::timer_transfer::TimerTransferClient;
use crate::{assignment, Vbucket};

/// Handle to a spawned engine subprocess.
#[async_trait]
pub trait EngineProcess: Send {
    async fn kill(&mut self) -> anyhow::Result<()>;
}

/// Launches engine subprocesses. The worker name and the control port are
/// the whole contract; everything else arrives over the control channel.
#[async_trait]
pub trait EngineSpawner: Send + Sync + 'static {
    async fn spawn(
        &self,
        worker_name: &str,
        control_port: u16,
    ) -> anyhow::Result<Box<dyn EngineProcess>>;
}

/// Spawns the engine as a real OS process.
pub struct ProcessEngineSpawner {
    pub program: PathBuf,
    pub extra_args: Vec<String>,
}

struct ChildEngine {
    child: tokio::process::Child,
}

#[async_trait]
impl EngineProcess for ChildEngine {
    async fn kill(&mut self) -> anyhow::Result<()> {
        self.child.kill().await.context("kill engine process")
    }
}

#[async_trait]
impl EngineSpawner for ProcessEngineSpawner {
    async fn spawn(
        &self,
        worker_name: &str,
        control_port: u16,
    ) -> anyhow::Result<Box<dyn EngineProcess>> {
        let child = tokio::process::Command::new(&self.program)
            .arg(worker_name)
            .arg(control_port.to_string())
            .args(&self.extra_args)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn engine {}", self.program.display()))?;
        Ok(Box::new(ChildEngine { child }))
    }
}

/// Polling and retry intervals of the rebalance protocol. Production
/// defaults are one second; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct RebalanceIntervals {
    pub bucket_op_retry: Duration,
    pub vb_meta_state_check: Duration,
    pub vb_takeover_retry: Duration,
    pub dcp_stream_request_retry: Duration,
}

impl Default for RebalanceIntervals {
    fn default() -> Self {
        Self {
            bucket_op_retry: Duration::from_secs(1),
            vb_meta_state_check: Duration::from_secs(1),
            vb_takeover_retry: Duration::from_secs(1),
            dcp_stream_request_retry: Duration::from_secs(1),
        }
    }
}

/// Static configuration of one consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub worker_name: String,
    pub num_vbuckets: u16,
    /// Local directory holding timer artifacts for this node.
    pub eventing_dir: PathBuf,
    /// Admin port of the local eventing service, rendered into the init
    /// payload.
    pub eventing_port: String,
    pub curr_host: String,
    pub kv_host_port: String,
    pub intervals: RebalanceIntervals,
}

pub(crate) struct FeedHandle {
    pub(crate) pump: JoinHandle<()>,
}

pub(crate) struct ConsumerInner {
    pub(crate) cfg: ConsumerConfig,
    pub(crate) app: Arc<AppConfig>,
    pub(crate) producer: Arc<dyn ProducerContext>,
    pub(crate) store: Arc<dyn MetaStore>,
    pub(crate) cdc: Arc<dyn CdcClient>,
    pub(crate) timer_rpc: Arc<dyn TimerTransferClient>,
    pub(crate) spawner: Arc<dyn EngineSpawner>,

    pub(crate) vb_stats: VbProcessingStats,
    pub(crate) engine_stats: EngineStats,
    /// Guards duplicate DCP stream requests: insert-if-absent, else no-op.
    pub(crate) vb_stream_requested: Mutex<HashSet<Vbucket>>,
    /// Vbuckets whose stream close was issued by the give-up path.
    pub(crate) vbs_stream_closed: Mutex<HashSet<Vbucket>>,
    pub(crate) feeds: RwLock<HashMap<Vbucket, FeedHandle>>,

    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    engine: tokio::sync::Mutex<Option<Box<dyn EngineProcess>>>,

    source_map: Mutex<String>,
    handler_code: Mutex<String>,
    compile_info: Mutex<String>,
    agg_queue_size: AtomicI64,

    pub(crate) giveup_cancel: Mutex<CancellationToken>,
    pub(crate) takeover_cancel: Mutex<CancellationToken>,
    pub(crate) rebalance_ongoing: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Supervisor of one script-engine subprocess. Cheap to clone; all clones
/// share the same state.
#[derive(Clone)]
pub struct Consumer {
    pub(crate) inner: Arc<ConsumerInner>,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ConsumerConfig,
        app: Arc<AppConfig>,
        producer: Arc<dyn ProducerContext>,
        store: Arc<dyn MetaStore>,
        cdc: Arc<dyn CdcClient>,
        timer_rpc: Arc<dyn TimerTransferClient>,
        spawner: Arc<dyn EngineSpawner>,
    ) -> Self {
        let num_vbuckets = cfg.num_vbuckets;
        Self {
            inner: Arc::new(ConsumerInner {
                cfg,
                app,
                producer,
                store,
                cdc,
                timer_rpc,
                spawner,
                vb_stats: VbProcessingStats::new(num_vbuckets),
                engine_stats: EngineStats::new(),
                vb_stream_requested: Mutex::new(HashSet::new()),
                vbs_stream_closed: Mutex::new(HashSet::new()),
                feeds: RwLock::new(HashMap::new()),
                outbound: Mutex::new(None),
                engine: tokio::sync::Mutex::new(None),
                source_map: Mutex::new(String::new()),
                handler_code: Mutex::new(String::new()),
                compile_info: Mutex::new(String::new()),
                agg_queue_size: AtomicI64::new(0),
                giveup_cancel: Mutex::new(CancellationToken::new()),
                takeover_cancel: Mutex::new(CancellationToken::new()),
                rebalance_ongoing: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.inner.cfg.worker_name
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app.app_name
    }

    pub(crate) fn node_uuid(&self) -> String {
        self.inner.producer.node_uuid()
    }

    pub(crate) fn host_port_addr(&self) -> String {
        self.inner.producer.host_port_addr()
    }

    /// Vbuckets the planner assigns to this worker.
    pub fn assigned_vbs(&self) -> Vec<Vbucket> {
        self.inner
            .producer
            .worker_vb_map()
            .get(self.worker_name())
            .cloned()
            .unwrap_or_default()
    }

    /// Vbuckets this worker currently runs, per the local stats mirror.
    pub fn currently_owned_vbs(&self) -> Vec<Vbucket> {
        let node_uuid = self.node_uuid();
        let mut owned = Vec::new();
        for (vb, stat) in self.inner.vb_stats.snapshot().into_iter().enumerate() {
            if stat.stream_status == StreamStatus::Running
                && stat.node_uuid == node_uuid
                && stat.assigned_worker == self.worker_name()
            {
                owned.push(vb as Vbucket);
            }
        }
        owned
    }

    pub fn stats(&self) -> &VbProcessingStats {
        &self.inner.vb_stats
    }

    pub fn engine_stats(&self) -> &EngineStats {
        &self.inner.engine_stats
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Spawn the engine, establish the control channel, send the init
    /// sequence, and start the periodic checkpointer.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.start_engine().await?;

        let consumer = self.clone();
        let ticker = tokio::spawn(async move { consumer.checkpoint_loop().await });
        self.inner.tasks.lock().unwrap().push(ticker);
        Ok(())
    }

    /// Cancel everything, kill the engine, abort pumps.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.giveup_cancel.lock().unwrap().cancel();
        self.inner.takeover_cancel.lock().unwrap().cancel();

        *self.inner.outbound.lock().unwrap() = None;
        if let Some(mut engine) = self.inner.engine.lock().await.take() {
            if let Err(err) = engine.kill().await {
                tracing::warn!(worker = self.worker_name(), error = ?err, "engine kill failed");
            }
        }
        for (_, feed) in self.inner.feeds.write().unwrap().drain() {
            feed.pump.abort();
        }
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    // Returns a boxed future (rather than `async fn`) so its type is a
    // concrete `Pin<Box<dyn Future>>` instead of an opaque type. `run_reader`
    // (spawned below) can call `restart_engine`, which calls back into this
    // function; an opaque return type here would make that cycle
    // self-referential and defeat rustc's auto-trait (Send) inference.
    fn start_engine(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let listener = TcpListener::bind(("127.0.0.1", 0))
                .await
                .context("bind engine control listener")?;
            let control_port = listener.local_addr()?.port();

            let engine = self
                .inner
                .spawner
                .spawn(self.worker_name(), control_port)
                .await
                .context("spawn script engine")?;

            let (socket, peer) = tokio::time::timeout(
                self.inner.app.settings.deadline_timeout,
                listener.accept(),
            )
            .await
            .context("engine did not dial the control port in time")?
            .context("accept engine control connection")?;
            socket.set_nodelay(true).ok();

            tracing::info!(
                worker = self.worker_name(),
                port = control_port,
                peer = %peer,
                "engine control channel established"
            );

            let (read_half, write_half) = socket.into_split();
            let (tx, rx) = mpsc::channel(self.inner.app.settings.worker_queue_cap.max(1));
            *self.inner.outbound.lock().unwrap() = Some(tx);
            *self.inner.engine.lock().await = Some(engine);

            let worker = self.worker_name().to_string();
            let batch_max = self.inner.app.settings.sock_batch_size.max(1);
            let writer = tokio::spawn(run_writer(write_half, rx, worker, batch_max));
            let consumer = self.clone();
            let reader = tokio::spawn(async move { consumer.run_reader(read_half).await });
            {
                let mut tasks = self.inner.tasks.lock().unwrap();
                tasks.push(writer);
                tasks.push(reader);
            }

            self.send_init_sequence().await
        })
    }

    /// Engine crash path: kill whatever is left, bring a fresh engine up,
    /// and replay each owned vbucket from its last processed sequence.
    pub(crate) async fn restart_engine(&self) -> anyhow::Result<()> {
        tracing::warn!(worker = self.worker_name(), "restarting script engine");

        *self.inner.outbound.lock().unwrap() = None;
        if let Some(mut engine) = self.inner.engine.lock().await.take() {
            let _ = engine.kill().await;
        }
        // Pumps wired to the dead engine's queue are torn down; streams are
        // re-requested below from checkpointed progress.
        for (_, feed) in self.inner.feeds.write().unwrap().drain() {
            feed.pump.abort();
        }
        self.inner.vb_stream_requested.lock().unwrap().clear();

        self.start_engine().await?;

        for vb in self.currently_owned_vbs() {
            let stat = self.inner.vb_stats.get(vb);
            if let Err(err) = self
                .open_vb_stream(vb, StreamStart::Seq(stat.last_seq_processed))
                .await
            {
                tracing::error!(
                    worker = self.worker_name(),
                    vb,
                    error = ?err,
                    "failed to resume stream after engine restart"
                );
            }
        }
        Ok(())
    }

    async fn send_init_sequence(&self) -> anyhow::Result<()> {
        let app = &self.inner.app;
        let settings = &app.settings;
        let cfg = &self.inner.cfg;

        let init = Payload {
            app_name: Some(app.app_name.clone()),
            curr_host: Some(cfg.curr_host.clone()),
            eventing_dir: Some(cfg.eventing_dir.display().to_string()),
            curr_eventing_port: Some(cfg.eventing_port.clone()),
            depcfg: Some(app.depcfg_json()),
            kv_host_port: Some(cfg.kv_host_port.clone()),
            rbac_user: Some(settings.rbac_user.clone()),
            rbac_pass: Some(settings.rbac_pass.clone()),
            lcb_inst_capacity: Some(settings.lcb_inst_capacity),
            execution_timeout: Some(settings.execution_timeout.as_secs() as i32),
            fuzz_offset: Some(settings.fuzz_offset),
            checkpoint_interval: Some(settings.checkpoint_interval.as_millis() as i32),
            curl_timeout: Some(settings.curl_timeout.as_millis() as i64),
            enable_recursive_mutation: Some(settings.enable_recursive_mutation),
            skip_lcb_bootstrap: Some(false),
            ..Default::default()
        };
        self.send(Message::new(Header::v8_worker(V8WorkerOpcode::Init, ""), init))
            .await?;
        self.send(Message::new(
            Header::v8_worker(V8WorkerOpcode::Load, app.app_code.clone()),
            Payload::default(),
        ))
        .await?;
        self.send(Message::new(
            Header::setting(SettingOpcode::LogLevel, settings.log_level.clone()),
            Payload::default(),
        ))
        .await?;
        self.send(Message::new(
            Header::setting(
                SettingOpcode::WorkerThreadCount,
                settings.cpp_worker_thread_count.to_string(),
            ),
            Payload::default(),
        ))
        .await?;
        self.send_thread_partition_map().await
    }

    /// Emit the engine-thread to vbucket pinning derived from the current
    /// worker assignment.
    pub async fn send_thread_partition_map(&self) -> anyhow::Result<()> {
        let vbs = self.assigned_vbs();
        let threads = self.inner.app.settings.cpp_worker_thread_count.max(1);
        let thr_map = assignment::shard_vbuckets(&vbs, threads)
            .into_iter()
            .enumerate()
            .map(|(i, partitions)| ThreadPartitions {
                thread_id: i as i16,
                partitions,
            })
            .collect();
        let payload = Payload::thread_partition_map(thr_map, vbs.len() as i16);
        self.send(Message::new(
            Header::setting(SettingOpcode::WorkerThreadPartitionMap, ""),
            payload,
        ))
        .await
    }

    // -----------------------------------------------------------------
    // Outbound path
    // -----------------------------------------------------------------

    /// Enqueue one message for the engine. Applies backpressure once the
    /// queue holds `worker_queue_cap` messages; waits out engine restarts.
    pub(crate) async fn send(&self, message: Message) -> anyhow::Result<()> {
        let mut message = Some(message);
        loop {
            let tx = self.inner.outbound.lock().unwrap().clone();
            match tx {
                Some(tx) => match tx.send(message.take().expect("message present")).await {
                    Ok(()) => return Ok(()),
                    Err(send_err) => {
                        // Writer tore down mid-send; the restart path will
                        // replay from the checkpoint.
                        message = Some(send_err.0);
                    }
                },
                None => {}
            }
            if self.inner.shutdown.is_cancelled() {
                anyhow::bail!("consumer {} shut down", self.worker_name());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Enqueue one mutation for the engine and advance the local mirror.
    pub async fn handle_mutation(
        &self,
        vb: Vbucket,
        key: Vec<u8>,
        value: Vec<u8>,
        seq: u64,
    ) -> anyhow::Result<()> {
        let metadata = dcp_event_metadata(vb, seq);
        self.send(Message::new(
            Header::dcp(DcpOpcode::Mutation, vb, metadata),
            Payload::dcp(key, value),
        ))
        .await?;
        self.inner.vb_stats.update(vb, |s| {
            s.last_seq_processed = s.last_seq_processed.max(seq);
            s.mutations_processed += 1;
        });
        Ok(())
    }

    /// Enqueue one deletion for the engine and advance the local mirror.
    pub async fn handle_deletion(
        &self,
        vb: Vbucket,
        key: Vec<u8>,
        seq: u64,
    ) -> anyhow::Result<()> {
        let metadata = dcp_event_metadata(vb, seq);
        self.send(Message::new(
            Header::dcp(DcpOpcode::Deletion, vb, metadata),
            Payload::dcp(key, Vec::new()),
        ))
        .await?;
        self.inner.vb_stats.update(vb, |s| {
            s.last_seq_processed = s.last_seq_processed.max(seq);
            s.deletions_processed += 1;
        });
        Ok(())
    }

    // -----------------------------------------------------------------
    // CDC streams
    // -----------------------------------------------------------------

    /// Idempotently request the CDC stream for `vb`. Returns `false` when a
    /// request is already in flight. On open failure the guard entry is
    /// removed so the caller can retry.
    pub(crate) async fn open_vb_stream(
        &self,
        vb: Vbucket,
        start: StreamStart,
    ) -> anyhow::Result<bool> {
        {
            let mut requested = self.inner.vb_stream_requested.lock().unwrap();
            if !requested.insert(vb) {
                tracing::debug!(
                    worker = self.worker_name(),
                    vb,
                    "stream request already in flight, skipping"
                );
                return Ok(false);
            }
        }

        match self.inner.cdc.open_stream(vb, start).await {
            Ok(rx) => {
                let pump = self.spawn_vb_pump(vb, rx);
                self.inner
                    .feeds
                    .write()
                    .unwrap()
                    .insert(vb, FeedHandle { pump });
                Ok(true)
            }
            Err(err) => {
                self.inner.vb_stream_requested.lock().unwrap().remove(&vb);
                Err(err).with_context(|| format!("dcp stream request for vb {vb}"))
            }
        }
    }

    /// Issue a stream close; the stopped checkpoint is flushed when the
    /// producer's terminal marker arrives on the pump.
    pub async fn close_stream(&self, vb: Vbucket) -> anyhow::Result<()> {
        self.inner.cdc.close_stream(vb).await
    }

    fn spawn_vb_pump(&self, vb: Vbucket, mut rx: mpsc::Receiver<CdcMessage>) -> JoinHandle<()> {
        let consumer = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if consumer.inner.shutdown.is_cancelled() {
                    return;
                }
                match message {
                    CdcMessage::Event(event) => {
                        let res = match event.op {
                            CdcOp::Mutation => {
                                consumer
                                    .handle_mutation(event.vb, event.key, event.value, event.seq)
                                    .await
                            }
                            CdcOp::Deletion => {
                                consumer.handle_deletion(event.vb, event.key, event.seq).await
                            }
                        };
                        if let Err(err) = res {
                            tracing::error!(
                                worker = consumer.worker_name(),
                                vb,
                                error = ?err,
                                "dropping vb pump after enqueue failure"
                            );
                            return;
                        }
                    }
                    CdcMessage::StreamEnd(vb) => {
                        consumer.on_stream_end(vb).await;
                        return;
                    }
                }
            }
        })
    }

    /// Terminal stream marker: clear the request guard and, unless the
    /// give-up path already wrote its checkpoint, flush a stopped one.
    pub(crate) async fn on_stream_end(&self, vb: Vbucket) {
        self.inner.feeds.write().unwrap().remove(&vb);
        self.inner.vb_stream_requested.lock().unwrap().remove(&vb);
        let closed_by_giveup = self.inner.vbs_stream_closed.lock().unwrap().remove(&vb);

        if !closed_by_giveup {
            if let Err(err) = self.flush_stopped_checkpoint(vb).await {
                tracing::error!(
                    worker = self.worker_name(),
                    vb,
                    error = ?err,
                    "failed to flush stopped checkpoint on stream end"
                );
            }
        }

        self.inner.vb_stats.update(vb, |s| {
            s.stream_status = StreamStatus::Stopped;
        });
        tracing::info!(worker = self.worker_name(), vb, "dcp stream ended");
    }

    /// CAS the blob to `stopped`, keeping recorded progress intact.
    async fn flush_stopped_checkpoint(&self, vb: Vbucket) -> anyhow::Result<()> {
        let key = vb_blob_key(self.app_name(), vb);
        loop {
            let Some((mut blob, token)) = checkpoint::read_blob(&*self.inner.store, &key).await?
            else {
                return Ok(());
            };
            if blob.stream_status == StreamStatus::Stopped {
                return Ok(());
            }
            let stat = self.inner.vb_stats.get(vb);
            blob.stream_status = StreamStatus::Stopped;
            blob.last_seq_processed = blob.last_seq_processed.max(stat.last_seq_processed);
            blob.last_checkpoint_time = epoch_secs();
            match checkpoint::write_blob(&*self.inner.store, &key, &blob, Some(token)).await? {
                CasOutcome::Stored(_) => return Ok(()),
                CasOutcome::Conflict => continue,
            }
        }
    }

    // -----------------------------------------------------------------
    // Periodic checkpointing
    // -----------------------------------------------------------------

    async fn checkpoint_loop(&self) {
        let mut ticker = tokio::time::interval(self.inner.app.settings.tick_duration);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            for vb in self.currently_owned_vbs() {
                if let Err(err) = self.checkpoint_vb_progress(vb).await {
                    tracing::warn!(
                        worker = self.worker_name(),
                        vb,
                        error = ?err,
                        "periodic checkpoint failed"
                    );
                }
            }
        }
    }

    /// CAS the blob forward to the current `last_seq_processed`. Progress
    /// never moves backwards, and no write happens when nothing advanced.
    pub(crate) async fn checkpoint_vb_progress(&self, vb: Vbucket) -> anyhow::Result<()> {
        let stat = self.inner.vb_stats.get(vb);
        if stat.last_seq_processed <= stat.last_checkpointed_seq {
            return Ok(());
        }
        let key = vb_blob_key(self.app_name(), vb);
        loop {
            let Some((mut blob, token)) = checkpoint::read_blob(&*self.inner.store, &key).await?
            else {
                return Ok(());
            };
            if blob.last_seq_processed >= stat.last_seq_processed {
                break;
            }
            blob.last_seq_processed = stat.last_seq_processed;
            blob.last_timer_feedback_seq =
                blob.last_timer_feedback_seq.max(stat.last_timer_feedback_seq);
            blob.last_checkpoint_time = epoch_secs();
            match checkpoint::write_blob(&*self.inner.store, &key, &blob, Some(token)).await? {
                CasOutcome::Stored(_) => break,
                CasOutcome::Conflict => continue,
            }
        }
        self.inner.vb_stats.update(vb, |s| {
            s.last_checkpointed_seq = s.last_checkpointed_seq.max(stat.last_seq_processed);
        });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Inbound path
    // -----------------------------------------------------------------

    async fn run_reader(self, mut read_half: OwnedReadHalf) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                res = protocol::read_response(&mut read_half) => match res {
                    Ok(response) => self.route_response(response),
                    Err(err) => {
                        tracing::error!(
                            worker = self.worker_name(),
                            error = %err,
                            "engine control channel failed"
                        );
                        break;
                    }
                }
            }
        }
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        if let Err(err) = self.restart_engine().await {
            tracing::error!(
                worker = self.worker_name(),
                error = ?err,
                "engine restart failed"
            );
        }
    }

    fn route_response(&self, response: Response) {
        match response.opcode {
            ResponseOpcode::SourceMap => {
                *self.inner.source_map.lock().unwrap() = response.msg;
            }
            ResponseOpcode::HandlerCode => {
                *self.inner.handler_code.lock().unwrap() = response.msg;
            }
            ResponseOpcode::CompileInfo => {
                *self.inner.compile_info.lock().unwrap() = response.msg;
            }
            ResponseOpcode::QueueSize => match response.msg.trim().parse::<i64>() {
                Ok(size) => self.inner.agg_queue_size.store(size, Ordering::Relaxed),
                Err(_) => tracing::warn!(
                    worker = self.worker_name(),
                    msg = %response.msg,
                    "unparseable queue size report"
                ),
            },
            ResponseOpcode::AppLogMessage => {
                tracing::info!(
                    app = self.app_name(),
                    worker = self.worker_name(),
                    "{}",
                    response.msg
                );
            }
            ResponseOpcode::SysLogMessage => {
                tracing::info!(worker = self.worker_name(), "{}", response.msg);
            }
            ResponseOpcode::LatencyStats
            | ResponseOpcode::FailureStats
            | ResponseOpcode::ExecutionStats
            | ResponseOpcode::LcbExceptions => {
                if let Err(err) = self.inner.engine_stats.apply(response.opcode, &response.msg) {
                    tracing::error!(
                        worker = self.worker_name(),
                        opcode = ?response.opcode,
                        error = ?err,
                        "failed to merge engine stats"
                    );
                }
            }
        }
    }

    pub fn source_map(&self) -> String {
        self.inner.source_map.lock().unwrap().clone()
    }

    pub fn handler_code(&self) -> String {
        self.inner.handler_code.lock().unwrap().clone()
    }

    pub fn compile_info(&self) -> String {
        self.inner.compile_info.lock().unwrap().clone()
    }

    pub fn engine_queue_size(&self) -> i64 {
        self.inner.agg_queue_size.load(Ordering::Relaxed)
    }
}

/// Header metadata string for one CDC event.
fn dcp_event_metadata(vb: Vbucket, seq: u64) -> String {
    format!(r#"{{"vb":{vb},"seq":{seq}}}"#)
}

/// Drain the outbound queue in batches of up to `batch_max` messages per
/// socket flush.
async fn run_writer(
    write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Message>,
    worker: String,
    batch_max: usize,
) {
    use tokio::io::AsyncWriteExt;

    let mut writer = tokio::io::BufWriter::new(write_half);
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < batch_max {
            match rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }
        for message in &batch {
            if let Err(err) = protocol::write_message(&mut writer, message).await {
                tracing::error!(worker = %worker, error = %err, "engine write failed, dropping queue");
                return;
            }
        }
        if let Err(err) = writer.flush().await {
            tracing::error!(worker = %worker, error = %err, "engine flush failed, dropping queue");
            return;
        }
    }
}

/// Whether a fresh (uninitialised) vbucket should start from the stream
/// tail instead of history, per the configured boundary.
pub(crate) fn initial_stream_start(boundary: StreamBoundary, blob: &CheckpointBlob) -> StreamStart {
    if blob.stream_status == StreamStatus::Uninitialised
        && matches!(boundary, StreamBoundary::FromNow)
    {
        return StreamStart::Tail;
    }
    StreamStart::Seq(blob.last_seq_processed.min(blob.last_timer_feedback_seq))
}
