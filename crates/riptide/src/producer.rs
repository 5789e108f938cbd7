//! Node supervisor: owns the per-application assignment plan and the set of
//! consumers on this node.
//!
//! Consumers never hold the producer directly; they see the narrow
//! [`ProducerContext`] interface so ownership stays one-way.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::assignment;
use crate::checkpoint::MetaStore;
use crate::config::{load_app_config, AppConfig};
use crate::consumer::{Consumer, ConsumerConfig, EngineSpawner, RebalanceIntervals};
use crate::dcp::CdcClient;
use crate::membership::{ClusterMember, MembershipOracle};
use crate::retry::{retry_with_backoff, FixedBackoff};
use crate::timer_transfer::TimerTransferClient;
use crate::Vbucket;

/// The capabilities a consumer needs from its supervising node.
#[async_trait]
pub trait ProducerContext: Send + Sync + 'static {
    /// Planner output: vb -> owning node address, total over the space.
    fn vb_eventing_node_assign_map(&self) -> HashMap<Vbucket, String>;

    /// Planner output: worker name -> vbuckets on this node.
    fn worker_vb_map(&self) -> BTreeMap<String, Vec<Vbucket>>;

    /// Liveness of a node per the membership oracle.
    async fn is_eventing_node_alive(&self, host_port: &str, node_uuid: &str) -> bool;

    /// This node's identity.
    fn node_uuid(&self) -> String;

    /// This node's eventing address.
    fn host_port_addr(&self) -> String;
}

/// External collaborators handed to the producer at construction.
pub struct ProducerDeps {
    pub oracle: Arc<dyn MembershipOracle>,
    pub store: Arc<dyn MetaStore>,
    pub cdc: Arc<dyn CdcClient>,
    pub timer_rpc: Arc<dyn TimerTransferClient>,
    pub spawner: Arc<dyn EngineSpawner>,
}

/// Node-level configuration shared by every consumer of the application.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub num_vbuckets: u16,
    pub eventing_dir: PathBuf,
    pub eventing_port: String,
    pub intervals: RebalanceIntervals,
    pub retry_backoff: FixedBackoff,
}

struct ProducerState {
    current: ClusterMember,
    members: Vec<ClusterMember>,
    kv_nodes: Vec<String>,
    node_assign: HashMap<Vbucket, String>,
    worker_assign: BTreeMap<String, Vec<Vbucket>>,
}

/// Per-application node supervisor.
pub struct Producer {
    cfg: ProducerConfig,
    deps: ProducerDeps,
    app: RwLock<Arc<AppConfig>>,
    state: RwLock<ProducerState>,
    consumers: tokio::sync::Mutex<Vec<Consumer>>,
    shutdown: CancellationToken,
}

impl Producer {
    /// Load the application's config and compute the initial assignment.
    /// Config-parse failures are fatal for this application only.
    pub async fn new(
        app_name: &str,
        cfg: ProducerConfig,
        deps: ProducerDeps,
    ) -> anyhow::Result<Arc<Self>> {
        let shutdown = CancellationToken::new();
        let app = Arc::new(
            load_app_config(&*deps.store, app_name, cfg.retry_backoff, &shutdown).await?,
        );

        let producer = Arc::new(Self {
            cfg,
            deps,
            app: RwLock::new(app),
            state: RwLock::new(ProducerState {
                current: ClusterMember {
                    node_uuid: String::new(),
                    host_port: String::new(),
                },
                members: Vec::new(),
                kv_nodes: Vec::new(),
                node_assign: HashMap::new(),
                worker_assign: BTreeMap::new(),
            }),
            consumers: tokio::sync::Mutex::new(Vec::new()),
            shutdown,
        });
        producer.refresh_assignment().await?;
        Ok(producer)
    }

    pub fn app(&self) -> Arc<AppConfig> {
        self.app.read().unwrap().clone()
    }

    /// Re-read membership and recompute both assignment projections.
    pub async fn refresh_assignment(&self) -> anyhow::Result<()> {
        let backoff = self.cfg.retry_backoff;
        let oracle = &self.deps.oracle;

        let members = retry_with_backoff(backoff, &self.shutdown, "get eventing nodes", || {
            oracle.eventing_nodes()
        })
        .await?;
        let current = retry_with_backoff(backoff, &self.shutdown, "get current node", || {
            oracle.current_node()
        })
        .await?;
        let kv_nodes = retry_with_backoff(backoff, &self.shutdown, "get kv nodes", || {
            oracle.kv_nodes()
        })
        .await?;

        let app = self.app();
        let node_assign = assignment::plan_node_assignment(&members, self.cfg.num_vbuckets);
        let mut local_vbs: Vec<Vbucket> = node_assign
            .iter()
            .filter(|(_, addr)| **addr == current.host_port)
            .map(|(vb, _)| *vb)
            .collect();
        local_vbs.sort_unstable();
        let worker_assign = assignment::plan_worker_assignment(
            &app.app_name,
            &local_vbs,
            app.settings.worker_count,
        );

        tracing::info!(
            app = %app.app_name,
            node = %current.host_port,
            members = members.len(),
            local_vbs = local_vbs.len(),
            workers = app.settings.worker_count,
            "assignment plan refreshed"
        );

        let mut state = self.state.write().unwrap();
        state.current = current;
        state.members = members;
        state.kv_nodes = kv_nodes;
        state.node_assign = node_assign;
        state.worker_assign = worker_assign;
        Ok(())
    }

    /// Spawn and start one consumer per worker slot, then converge
    /// ownership in the background.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let app = self.app();
        let mut consumers = self.consumers.lock().await;
        anyhow::ensure!(consumers.is_empty(), "producer already started");

        for ordinal in 0..app.settings.worker_count {
            let consumer = self.build_consumer(&app, ordinal);
            consumer
                .start()
                .await
                .with_context(|| format!("start {}", consumer.worker_name()))?;
            consumers.push(consumer);
        }
        drop(consumers);

        self.trigger_rebalance().await;
        Ok(())
    }

    fn build_consumer(self: &Arc<Self>, app: &Arc<AppConfig>, ordinal: usize) -> Consumer {
        let state = self.state.read().unwrap();
        let curr_host = state
            .current
            .host_port
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| state.current.host_port.clone());
        let cfg = ConsumerConfig {
            worker_name: assignment::worker_name(&app.app_name, ordinal),
            num_vbuckets: self.cfg.num_vbuckets,
            eventing_dir: self.cfg.eventing_dir.clone(),
            eventing_port: self.cfg.eventing_port.clone(),
            curr_host,
            kv_host_port: state.kv_nodes.join(","),
            intervals: self.cfg.intervals,
        };
        Consumer::new(
            cfg,
            app.clone(),
            self.clone(),
            self.deps.store.clone(),
            self.deps.cdc.clone(),
            self.deps.timer_rpc.clone(),
            self.deps.spawner.clone(),
        )
    }

    /// Membership changed: replan, re-pin engine threads, converge.
    pub async fn handle_topology_change(self: &Arc<Self>) -> anyhow::Result<()> {
        self.refresh_assignment().await?;
        for consumer in self.consumers.lock().await.iter() {
            if let Err(err) = consumer.send_thread_partition_map().await {
                tracing::warn!(
                    worker = consumer.worker_name(),
                    error = ?err,
                    "failed to push refreshed partition map"
                );
            }
        }
        self.trigger_rebalance().await;
        Ok(())
    }

    /// Settings changed: reload config; a worker-count change replaces the
    /// consumer set, anything else just replans and converges.
    pub async fn handle_settings_change(self: &Arc<Self>) -> anyhow::Result<()> {
        let app_name = self.app().app_name.clone();
        let fresh = Arc::new(
            load_app_config(
                &*self.deps.store,
                &app_name,
                self.cfg.retry_backoff,
                &self.shutdown,
            )
            .await?,
        );
        let worker_count_changed =
            fresh.settings.worker_count != self.app().settings.worker_count;
        *self.app.write().unwrap() = fresh.clone();
        self.refresh_assignment().await?;

        if worker_count_changed {
            tracing::info!(
                app = %app_name,
                worker_count = fresh.settings.worker_count,
                "worker count changed, replacing consumers"
            );
            let mut consumers = self.consumers.lock().await;
            for consumer in consumers.drain(..) {
                // Release ownership first so the replacement set finds
                // stopped checkpoints instead of orphaned running streams.
                if let Err(err) = consumer.surrender_all_owned().await {
                    tracing::warn!(
                        worker = consumer.worker_name(),
                        error = ?err,
                        "surrender before replacement failed"
                    );
                }
                consumer.stop().await;
            }
            for ordinal in 0..fresh.settings.worker_count {
                let consumer = self.build_consumer(&fresh, ordinal);
                consumer.start().await?;
                consumers.push(consumer);
            }
        }

        self.trigger_rebalance().await;
        Ok(())
    }

    /// Kick every consumer's ownership convergence in the background.
    pub async fn trigger_rebalance(&self) {
        for consumer in self.consumers.lock().await.iter() {
            let consumer = consumer.clone();
            tokio::spawn(async move {
                if let Err(err) = consumer.vbs_state_update().await {
                    tracing::error!(
                        worker = consumer.worker_name(),
                        error = ?err,
                        "ownership convergence failed"
                    );
                }
            });
        }
    }

    /// Current consumers (snapshot).
    pub async fn consumers(&self) -> Vec<Consumer> {
        self.consumers.lock().await.clone()
    }

    /// Membership snapshot the current plan was derived from.
    pub fn members(&self) -> Vec<ClusterMember> {
        self.state.read().unwrap().members.clone()
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        for consumer in self.consumers.lock().await.drain(..) {
            consumer.stop().await;
        }
    }
}

#[async_trait]
impl ProducerContext for Producer {
    fn vb_eventing_node_assign_map(&self) -> HashMap<Vbucket, String> {
        self.state.read().unwrap().node_assign.clone()
    }

    fn worker_vb_map(&self) -> BTreeMap<String, Vec<Vbucket>> {
        self.state.read().unwrap().worker_assign.clone()
    }

    async fn is_eventing_node_alive(&self, host_port: &str, node_uuid: &str) -> bool {
        self.deps.oracle.is_alive(host_port, node_uuid).await
    }

    fn node_uuid(&self) -> String {
        self.state.read().unwrap().current.node_uuid.clone()
    }

    fn host_port_addr(&self) -> String {
        self.state.read().unwrap().current.host_port.clone()
    }
}
