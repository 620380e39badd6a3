// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Replica-set selection for zone-aware reads.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::configuration::Configuration;

/// Read affinity for replica read operations.
///
/// Every strategy except [`ReadPreference::NoPreference`] shrinks the set of
/// nodes eligible to serve a read, which raises the likelihood of
/// `document_irretrievable` when the filtered set is empty or holds no copy
/// of the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadPreference {
    /// Do not filter the replica set.
    #[default]
    NoPreference,
    /// Only nodes in the preferred server group.
    SelectedServerGroup,
    /// Nodes in the preferred server group, expanding to all available nodes
    /// when the group holds none.
    SelectedServerGroupOrAllAvailable,
}

/// One node eligible to serve a read, in replica-rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadableNode {
    /// Whether this is a replica copy (rank > 0) rather than the active.
    pub is_replica: bool,
    /// The replica rank, usable directly as the `rank` argument of
    /// [`Configuration::map_key`].
    pub index: u32,
}

/// Returns the nodes eligible to serve a read of `key`, in rank order
/// 0..=num_replicas, honoring the read preference and preferred server
/// group.
///
/// An empty result under a strict group preference means the caller must
/// surface `document_irretrievable` without dispatching.
pub fn effective_nodes(
    key: &[u8],
    config: &Configuration,
    preference: ReadPreference,
    preferred_server_group: &str,
) -> Vec<ReadableNode> {
    if preference != ReadPreference::NoPreference && preferred_server_group.is_empty() {
        warn!("preferred server group is required for zone-aware replica reads");
        return Vec::new();
    }

    let mut available = Vec::new();
    let mut local = Vec::new();

    for rank in 0..=config.num_replicas.unwrap_or(0) {
        let (_, server) = config.map_key(key, rank);
        if let Some(server) = server {
            if server >= config.nodes.len() {
                continue;
            }
            let node = ReadableNode {
                is_replica: rank != 0,
                index: rank,
            };
            available.push(node);
            if config.nodes[server].server_group == preferred_server_group {
                local.push(node);
            }
        }
    }

    match preference {
        ReadPreference::NoPreference => available,
        ReadPreference::SelectedServerGroup => local,
        ReadPreference::SelectedServerGroupOrAllAvailable => {
            if local.is_empty() {
                available
            } else {
                local
            }
        }
    }
}
