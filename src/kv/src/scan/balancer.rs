// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-node load balancer for range-scan streams.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use cbx_topology::VbucketMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

#[derive(Debug, Default)]
struct NodeState {
    pending: VecDeque<u16>,
    active_stream_count: u16,
}

#[derive(Debug)]
struct BalancerState {
    nodes: BTreeMap<i16, NodeState>,
    /// Present when a deterministic shuffle was requested; seeded once at
    /// construction.
    rng: Option<StdRng>,
}

/// Tracks pending partitions and active stream counts per node, handing
/// out the next partition from the least busy node.
///
/// Nodes with equal load are tie-broken by a shuffle so streams spread
/// instead of piling onto the lowest node id; a fixed seed makes the
/// shuffle, and therefore tests, deterministic.
#[derive(Debug)]
pub struct RangeScanLoadBalancer {
    state: Mutex<BalancerState>,
}

impl RangeScanLoadBalancer {
    /// Builds the balancer from a vbucket map by grouping each partition
    /// under its active owner.
    pub fn new(vbucket_map: &VbucketMap, seed: Option<u64>) -> Self {
        let mut nodes: BTreeMap<i16, NodeState> = BTreeMap::new();
        for (partition, servers) in vbucket_map.iter().enumerate() {
            let node_id = servers.first().copied().unwrap_or(-1);
            nodes
                .entry(node_id)
                .or_default()
                .pending
                .push_back(partition as u16);
        }
        RangeScanLoadBalancer {
            state: Mutex::new(BalancerState {
                nodes,
                rng: seed.map(StdRng::seed_from_u64),
            }),
        }
    }

    /// Pops the next partition from the node with the fewest active
    /// streams among nodes that still have pending partitions, and counts
    /// the new stream against that node. Returns `None` when every queue is
    /// empty.
    pub fn select_vbucket(&self) -> Option<(i16, u16)> {
        let mut state = self.state.lock().expect("poisoned");

        let mut node_ids: Vec<i16> = state.nodes.keys().copied().collect();
        match &mut state.rng {
            Some(rng) => node_ids.shuffle(rng),
            None => node_ids.shuffle(&mut rand::thread_rng()),
        }

        let mut selected: Option<i16> = None;
        let mut min_stream_count = u16::MAX;
        for node_id in node_ids {
            let node = &state.nodes[&node_id];
            if !node.pending.is_empty() && node.active_stream_count < min_stream_count {
                min_stream_count = node.active_stream_count;
                selected = Some(node_id);
            }
        }

        let node_id = selected?;
        let node = state.nodes.get_mut(&node_id).expect("selected node exists");
        let partition = node.pending.pop_front()?;
        node.active_stream_count += 1;
        Some((node_id, partition))
    }

    /// Records that a stream on `node_id` ended.
    pub fn notify_stream_ended(&self, node_id: i16) {
        let mut state = self.state.lock().expect("poisoned");
        if let Some(node) = state.nodes.get_mut(&node_id) {
            node.active_stream_count = node.active_stream_count.saturating_sub(1);
        }
    }

    /// Re-queues a partition, used when its stream failed with a retryable
    /// error.
    pub fn enqueue_vbucket(&self, node_id: i16, partition: u16) {
        let mut state = self.state.lock().expect("poisoned");
        state
            .nodes
            .entry(node_id)
            .or_default()
            .pending
            .push_back(partition);
    }

    /// The number of active streams on `node_id`, for tests.
    pub fn active_stream_count(&self, node_id: i16) -> u16 {
        let state = self.state.lock().expect("poisoned");
        state
            .nodes
            .get(&node_id)
            .map(|node| node.active_stream_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn even_map(nodes: i16, partitions_per_node: u16) -> VbucketMap {
        let mut map = Vec::new();
        for node in 0..nodes {
            for _ in 0..partitions_per_node {
                map.push(vec![node]);
            }
        }
        map
    }

    #[test]
    fn selection_is_exhaustive_and_unique() {
        let balancer = RangeScanLoadBalancer::new(&even_map(3, 4), Some(7));
        let mut seen = std::collections::BTreeSet::new();
        while let Some((_, partition)) = balancer.select_vbucket() {
            assert!(seen.insert(partition));
        }
        assert_eq!(seen.len(), 12);
    }

    #[test]
    fn selection_balances_active_streams_across_nodes() {
        let balancer = RangeScanLoadBalancer::new(&even_map(4, 8), Some(42));
        // Take 4 * 3 streams without ending any; every node must carry
        // exactly 3.
        let mut selections = Vec::new();
        for _ in 0..12 {
            selections.push(balancer.select_vbucket().unwrap());
        }
        for node in 0..4 {
            assert_eq!(balancer.active_stream_count(node), 3);
        }
    }

    #[test]
    fn active_counts_stay_within_one_of_the_minimum() {
        let balancer = RangeScanLoadBalancer::new(&even_map(3, 16), None);
        for _ in 0..8 {
            balancer.select_vbucket().unwrap();
        }
        let counts: Vec<u16> = (0..3).map(|n| balancer.active_stream_count(n)).collect();
        let min = *counts.iter().min().unwrap();
        assert!(counts.iter().all(|&c| c <= min + 1), "{:?}", counts);
    }

    #[test]
    fn ended_streams_free_capacity() {
        let balancer = RangeScanLoadBalancer::new(&even_map(2, 2), Some(1));
        let (node, _) = balancer.select_vbucket().unwrap();
        assert_eq!(balancer.active_stream_count(node), 1);
        balancer.notify_stream_ended(node);
        assert_eq!(balancer.active_stream_count(node), 0);
    }

    #[test]
    fn requeued_partitions_are_selected_again() {
        let balancer = RangeScanLoadBalancer::new(&vec![vec![0]], Some(1));
        let (node, partition) = balancer.select_vbucket().unwrap();
        assert_eq!(balancer.select_vbucket(), None);
        balancer.notify_stream_ended(node);
        balancer.enqueue_vbucket(node, partition);
        assert_eq!(balancer.select_vbucket(), Some((node, partition)));
    }

    #[test]
    fn a_fixed_seed_makes_selection_deterministic() {
        let order = |seed| {
            let balancer = RangeScanLoadBalancer::new(&even_map(4, 4), Some(seed));
            let mut order = Vec::new();
            while let Some(choice) = balancer.select_vbucket() {
                order.push(choice);
            }
            order
        };
        assert_eq!(order(99), order(99));
    }
}
