//! Deterministic vbucket assignment planning.
//!
//! Both planners are pure functions of their inputs so every node that sees
//! the same membership snapshot derives the identical map. Rebalance is a
//! diff of this plan against the observed per-vbucket checkpoint blobs.

use std::collections::{BTreeMap, HashMap};

use crate::membership::ClusterMember;
use crate::Vbucket;

/// Canonical name of one worker slot of an application.
pub fn worker_name(app_name: &str, ordinal: usize) -> String {
    format!("worker_{app_name}_{ordinal}")
}

/// Immutable snapshot of the planner output for one application.
#[derive(Debug, Clone, Default)]
pub struct AssignmentMap {
    /// Total over the vbucket space: vb -> owning node address.
    pub node_of: HashMap<Vbucket, String>,
    /// Worker -> vbuckets, only meaningful for vbuckets owned by this node.
    pub worker_of: BTreeMap<String, Vec<Vbucket>>,
}

impl AssignmentMap {
    /// Worker slot responsible for `vb`, if it is assigned to this node.
    pub fn worker_for_vb(&self, vb: Vbucket) -> Option<&str> {
        self.worker_of
            .iter()
            .find(|(_, vbs)| vbs.contains(&vb))
            .map(|(name, _)| name.as_str())
    }
}

/// Divide the vbucket space `[0, num_vbuckets)` across the given members.
///
/// Members are ordered by address before planning so the result does not
/// depend on the oracle's enumeration order. Each of the first
/// `num_vbuckets % n` members receives one extra vbucket; vbuckets are
/// handed out in ascending contiguous runs.
pub fn plan_node_assignment(
    members: &[ClusterMember],
    num_vbuckets: u16,
) -> HashMap<Vbucket, String> {
    let mut addrs: Vec<&str> = members.iter().map(|m| m.host_port.as_str()).collect();
    addrs.sort_unstable();
    addrs.dedup();

    let mut map = HashMap::with_capacity(num_vbuckets as usize);
    if addrs.is_empty() {
        return map;
    }

    let per_node = num_vbuckets as usize / addrs.len();
    let remainder = num_vbuckets as usize % addrs.len();

    let mut next_vb = 0usize;
    for (i, addr) in addrs.iter().enumerate() {
        let count = per_node + usize::from(i < remainder);
        for _ in 0..count {
            map.insert(next_vb as Vbucket, addr.to_string());
            next_vb += 1;
        }
    }
    map
}

/// Divide this node's vbuckets across its worker slots, same remainder
/// scheme as [`plan_node_assignment`].
pub fn plan_worker_assignment(
    app_name: &str,
    local_vbs: &[Vbucket],
    worker_count: usize,
) -> BTreeMap<String, Vec<Vbucket>> {
    let mut vbs = local_vbs.to_vec();
    vbs.sort_unstable();
    vbs.dedup();

    let mut map = BTreeMap::new();
    if worker_count == 0 {
        return map;
    }

    let per_worker = vbs.len() / worker_count;
    let remainder = vbs.len() % worker_count;

    let mut next = 0usize;
    for i in 0..worker_count {
        let count = per_worker + usize::from(i < remainder);
        let slice = vbs[next..next + count].to_vec();
        next += count;
        map.insert(worker_name(app_name, i), slice);
    }
    map
}

/// Round-robin shard a vbucket list over `shard_count` parallel routines.
pub fn shard_vbuckets(vbs: &[Vbucket], shard_count: usize) -> Vec<Vec<Vbucket>> {
    let shard_count = shard_count.max(1);
    let mut shards = vec![Vec::new(); shard_count];
    for (i, vb) in vbs.iter().enumerate() {
        shards[i % shard_count].push(*vb);
    }
    shards
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(addrs: &[&str]) -> Vec<ClusterMember> {
        addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| ClusterMember {
                node_uuid: format!("uuid-{i}"),
                host_port: addr.to_string(),
            })
            .collect()
    }

    fn counts_by_node(map: &HashMap<Vbucket, String>) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for addr in map.values() {
            *counts.entry(addr.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn balanced_split_four_nodes() {
        let map = plan_node_assignment(
            &members(&["n1:8096", "n2:8096", "n3:8096", "n4:8096"]),
            1024,
        );
        let counts: Vec<usize> = counts_by_node(&map).values().copied().collect();
        assert_eq!(counts, vec![256, 256, 256, 256]);
    }

    #[test]
    fn unbalanced_split_three_nodes() {
        let map = plan_node_assignment(&members(&["n1:8096", "n2:8096", "n3:8096"]), 1024);
        let counts = counts_by_node(&map);
        assert_eq!(counts["n1:8096"], 342);
        assert_eq!(counts["n2:8096"], 341);
        assert_eq!(counts["n3:8096"], 341);
    }

    #[test]
    fn covers_the_space_exactly_once_and_is_deterministic() {
        for n in 1..=7usize {
            let addrs: Vec<String> = (0..n).map(|i| format!("node{i}:8096")).collect();
            let refs: Vec<&str> = addrs.iter().map(String::as_str).collect();
            let map = plan_node_assignment(&members(&refs), 1024);
            assert_eq!(map.len(), 1024, "n={n} must cover every vbucket");
            let counts = counts_by_node(&map);
            let min = counts.values().min().unwrap();
            let max = counts.values().max().unwrap();
            assert!(max - min <= 1, "n={n} counts differ by more than 1");

            // Enumeration order must not matter.
            let mut reversed = members(&refs);
            reversed.reverse();
            assert_eq!(map, plan_node_assignment(&reversed, 1024));
        }
    }

    #[test]
    fn worker_split_matches_node_scheme() {
        let vbs: Vec<Vbucket> = (0..10).collect();
        let map = plan_worker_assignment("app1", &vbs, 3);
        assert_eq!(map["worker_app1_0"], vec![0, 1, 2, 3]);
        assert_eq!(map["worker_app1_1"], vec![4, 5, 6]);
        assert_eq!(map["worker_app1_2"], vec![7, 8, 9]);

        // Node then worker planning covers each local vb exactly once.
        let all: Vec<Vbucket> = map.values().flatten().copied().collect();
        let mut sorted = all.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vbs);
    }

    #[test]
    fn shards_round_robin() {
        let vbs: Vec<Vbucket> = vec![1, 2, 3, 4, 5];
        let shards = shard_vbuckets(&vbs, 2);
        assert_eq!(shards[0], vec![1, 3, 5]);
        assert_eq!(shards[1], vec![2, 4]);
        // A zero shard count degrades to a single shard.
        assert_eq!(shard_vbuckets(&vbs, 0).len(), 1);
    }
}
