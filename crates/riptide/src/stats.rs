//! Shared runtime statistics.
//!
//! `VbProcessingStats` is the consumer's write-behind mirror of the
//! checkpoint blobs, read concurrently by HTTP admin handlers, the event
//! path, and the checkpointer; each vbucket has its own lock so writers on
//! different vbuckets never contend. Engine-reported stats documents sit
//! behind one reader/writer lock so admin readers see consistent snapshots.

use std::sync::{Mutex, RwLock};

use serde_json::Value;

use crate::checkpoint::StreamStatus;
use crate::protocol::ResponseOpcode;
use crate::Vbucket;

/// Mirror of one vbucket's ownership and progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VbStat {
    pub current_vb_owner: String,
    pub assigned_worker: String,
    pub node_uuid: String,
    pub stream_status: StreamStatus,
    pub last_seq_processed: u64,
    pub last_timer_feedback_seq: u64,
    pub last_checkpointed_seq: u64,
    pub mutations_processed: u64,
    pub deletions_processed: u64,
}

/// Per-vbucket stats with per-slot locking.
pub struct VbProcessingStats {
    slots: Vec<Mutex<VbStat>>,
}

impl VbProcessingStats {
    pub fn new(num_vbuckets: u16) -> Self {
        let slots = (0..num_vbuckets).map(|_| Mutex::new(VbStat::default())).collect();
        Self { slots }
    }

    pub fn num_vbuckets(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Mutate one vbucket's stats under its lock.
    pub fn update<F: FnOnce(&mut VbStat)>(&self, vb: Vbucket, f: F) {
        if let Some(slot) = self.slots.get(vb as usize) {
            f(&mut slot.lock().unwrap());
        }
    }

    /// Clone one vbucket's stats.
    pub fn get(&self, vb: Vbucket) -> VbStat {
        self.slots
            .get(vb as usize)
            .map(|slot| slot.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Clone every vbucket's stats, indexed by vbucket id.
    pub fn snapshot(&self) -> Vec<VbStat> {
        self.slots.iter().map(|slot| slot.lock().unwrap().clone()).collect()
    }
}

#[derive(Default)]
struct EngineStatsInner {
    latency: serde_json::Map<String, Value>,
    failure: serde_json::Map<String, Value>,
    execution: serde_json::Map<String, Value>,
    lcb_exceptions: serde_json::Map<String, Value>,
}

/// Engine-reported stats caches, merged by the response reader and read by
/// admin endpoints.
#[derive(Default)]
pub struct EngineStats {
    inner: RwLock<EngineStatsInner>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one stats response body into the matching cache. Returns an
    /// error when the body is not a JSON object.
    pub fn apply(&self, opcode: ResponseOpcode, body: &str) -> anyhow::Result<()> {
        let doc: Value = serde_json::from_str(body)?;
        let map = doc
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("stats body is not a JSON object"))?
            .clone();

        let mut inner = self.inner.write().unwrap();
        match opcode {
            ResponseOpcode::LatencyStats => inner.latency = map,
            ResponseOpcode::FailureStats => inner.failure = map,
            ResponseOpcode::ExecutionStats => inner.execution = map,
            ResponseOpcode::LcbExceptions => inner.lcb_exceptions = map,
            other => anyhow::bail!("{other:?} is not a stats opcode"),
        }
        Ok(())
    }

    pub fn latency(&self) -> serde_json::Map<String, Value> {
        self.inner.read().unwrap().latency.clone()
    }

    pub fn failure(&self) -> serde_json::Map<String, Value> {
        self.inner.read().unwrap().failure.clone()
    }

    pub fn execution(&self) -> serde_json::Map<String, Value> {
        self.inner.read().unwrap().execution.clone()
    }

    pub fn lcb_exceptions(&self) -> serde_json::Map<String, Value> {
        self.inner.read().unwrap().lcb_exceptions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_vb_updates_are_isolated() {
        let stats = VbProcessingStats::new(4);
        stats.update(2, |s| {
            s.assigned_worker = "worker_app1_1".into();
            s.last_seq_processed = 10;
        });
        assert_eq!(stats.get(2).last_seq_processed, 10);
        assert_eq!(stats.get(1), VbStat::default());
        // Out-of-range vbuckets read as defaults and ignore writes.
        stats.update(99, |s| s.last_seq_processed = 5);
        assert_eq!(stats.get(99), VbStat::default());
    }

    #[test]
    fn stats_caches_merge_by_opcode() {
        let stats = EngineStats::new();
        stats
            .apply(ResponseOpcode::LatencyStats, r#"{"p50": 2, "p99": 17}"#)
            .unwrap();
        stats
            .apply(ResponseOpcode::FailureStats, r#"{"timeouts": 1}"#)
            .unwrap();
        assert_eq!(stats.latency()["p99"], 17);
        assert_eq!(stats.failure()["timeouts"], 1);
        assert!(stats.execution().is_empty());

        assert!(stats.apply(ResponseOpcode::LatencyStats, "not json").is_err());
        assert!(stats.apply(ResponseOpcode::QueueSize, "{}").is_err());
    }
}
