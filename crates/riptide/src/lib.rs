//! Per-node execution runtime for a function-as-a-service layer over a
//! partitioned change-data-capture stream.
//!
//! The crate is a library embedded in a host process. For each deployed
//! application it:
//! - divides the cluster's fixed vbucket space across eventing nodes and
//!   across worker subprocesses on each node ([`assignment`]),
//! - moves vbucket ownership between nodes and workers with an
//!   at-most-one-active-stream guarantee ([`rebalance`]),
//! - drives external single-threaded script engines over a length-prefixed
//!   TCP protocol ([`protocol`], [`consumer`]),
//! - persists per-vbucket progress as CAS-guarded checkpoint blobs in a
//!   shared metadata store ([`checkpoint`]).
//!
//! External collaborators (the metadata store, the CDC producer, the
//! membership oracle, the timer-transfer RPC server, the engine binary) are
//! modeled as traits so a host wires in its own implementations.

pub mod assignment;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod dcp;
pub mod membership;
pub mod producer;
pub mod protocol;
pub mod rebalance;
pub mod retry;
pub mod stats;
pub mod timer_transfer;

/// Identifier of one partition of the underlying KV store's hash space.
pub type Vbucket = u16;

/// Default size of the cluster-wide vbucket space. Injected into the
/// planner and supervisors; never read as a global.
pub const DEFAULT_NUM_VBUCKETS: u16 = 1024;

pub use checkpoint::{CasOutcome, CasToken, CheckpointBlob, MemoryMetaStore, MetaStore, StreamStatus};
pub use config::{AppConfig, AppSettings};
pub use consumer::{Consumer, ConsumerConfig, EngineProcess, EngineSpawner, ProcessEngineSpawner};
pub use membership::{ClusterMember, MembershipOracle};
pub use producer::{Producer, ProducerContext};
pub use rebalance::TakeoverError;
