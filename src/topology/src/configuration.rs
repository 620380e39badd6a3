// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! One revision of the cluster configuration.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::capabilities::{BucketCapability, ClusterCapability};

/// A service a node may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    KeyValue,
    Management,
    Query,
    Search,
    Analytics,
    Views,
    Eventing,
}

/// Ports a node exposes for each service, either in plain or TLS flavor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    pub key_value: Option<u16>,
    pub management: Option<u16>,
    pub query: Option<u16>,
    pub search: Option<u16>,
    pub analytics: Option<u16>,
    pub views: Option<u16>,
    pub eventing: Option<u16>,
}

impl PortMap {
    fn get(&self, service: ServiceType) -> Option<u16> {
        match service {
            ServiceType::KeyValue => self.key_value,
            ServiceType::Management => self.management,
            ServiceType::Query => self.query,
            ServiceType::Search => self.search,
            ServiceType::Analytics => self.analytics,
            ServiceType::Views => self.views,
            ServiceType::Eventing => self.eventing,
        }
    }
}

/// An address a node advertises for one named network (e.g. "external" in a
/// NAT'd deployment).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateAddress {
    pub name: String,
    pub hostname: String,
    pub services_plain: PortMap,
    pub services_tls: PortMap,
}

/// One node of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub this_node: bool,
    pub index: usize,
    pub hostname: String,
    pub services_plain: PortMap,
    pub services_tls: PortMap,
    /// Alternate addresses keyed by network name.
    pub alt: BTreeMap<String, AlternateAddress>,
    pub server_group: String,
    pub node_uuid: String,
}

impl Node {
    /// The port for `service` on the given network, or `default` when the
    /// node does not expose it. A network without an alternate-address entry
    /// falls back to the primary address matrix.
    pub fn port_or(&self, network: &str, service: ServiceType, tls: bool, default: u16) -> u16 {
        if network != "default" {
            if let Some(alt) = self.alt.get(network) {
                let map = if tls {
                    &alt.services_tls
                } else {
                    &alt.services_plain
                };
                return map.get(service).unwrap_or(default);
            }
        }
        let map = if tls {
            &self.services_tls
        } else {
            &self.services_plain
        };
        map.get(service).unwrap_or(default)
    }

    /// The hostname on the given network, falling back to the primary
    /// hostname when the network has no alternate entry.
    pub fn hostname_for(&self, network: &str) -> &str {
        if network != "default" {
            if let Some(alt) = self.alt.get(network) {
                return &alt.hostname;
            }
        }
        &self.hostname
    }

    /// The "host:port" endpoint for `service` on the given network, if the
    /// node exposes it there.
    pub fn endpoint(&self, network: &str, service: ServiceType, tls: bool) -> Option<String> {
        let port = self.port_or(network, service, tls, 0);
        if port == 0 {
            return None;
        }
        Some(format!("{}:{}", self.hostname_for(network), port))
    }
}

/// How keys are located on nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeLocator {
    #[default]
    Unknown,
    Vbucket,
    Ketama,
}

/// The partition→node assignment: outer index is the partition, inner index
/// 0 is the active copy and 1..N are replicas. An entry of `-1` marks an
/// unassigned copy.
pub type VbucketMap = Vec<Vec<i16>>;

/// One revision of the cluster configuration, as pushed by the config
/// fetcher. Totally ordered by `(epoch, rev)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    pub epoch: Option<i64>,
    pub rev: Option<i64>,
    pub id: String,
    pub uuid: Option<String>,
    pub cluster_name: Option<String>,
    pub cluster_uuid: Option<String>,
    pub bucket: Option<String>,
    pub num_replicas: Option<u32>,
    pub nodes: Vec<Node>,
    pub vbmap: Option<VbucketMap>,
    pub collections_manifest_uid: Option<u64>,
    pub bucket_capabilities: BTreeSet<BucketCapability>,
    pub cluster_capabilities: BTreeSet<ClusterCapability>,
    pub node_locator: NodeLocator,
}

impl PartialEq for Configuration {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch && self.rev == other.rev
    }
}

impl Eq for Configuration {}

impl PartialOrd for Configuration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Configuration {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.epoch, self.rev).cmp(&(other.epoch, other.rev))
    }
}

impl Configuration {
    /// A diagnostic rendering of the configuration revision.
    pub fn rev_str(&self) -> String {
        format!(
            "epoch={}, rev={}",
            self.epoch.unwrap_or(-1),
            self.rev.unwrap_or(-1)
        )
    }

    /// Maps a document key to its partition and, for the given replica rank
    /// (0 = active), the index of the owning node.
    ///
    /// Partitioning is CRC32 (IEEE polynomial) over the key bytes modulo the
    /// partition count; this is a contract with the server and must stay
    /// bit-exact. Without a vbucket map every key maps to partition 0 with
    /// no owner.
    pub fn map_key(&self, key: &[u8], rank: u32) -> (u16, Option<usize>) {
        let Some(vbmap) = &self.vbmap else {
            return (0, None);
        };
        if vbmap.is_empty() {
            return (0, None);
        }
        let crc = crc32fast::hash(key);
        let partition = (crc as usize % vbmap.len()) as u16;
        (partition, self.server_by_vbucket(partition, rank))
    }

    /// The index of the node owning `(partition, rank)`, if assigned.
    pub fn server_by_vbucket(&self, partition: u16, rank: u32) -> Option<usize> {
        let vbmap = self.vbmap.as_ref()?;
        let entry = vbmap.get(usize::from(partition))?.get(rank as usize)?;
        if *entry < 0 {
            return None;
        }
        Some(*entry as usize)
    }

    /// Whether a node serves `service` at `host:port` on the given network.
    pub fn has_node(
        &self,
        network: &str,
        service: ServiceType,
        tls: bool,
        hostname: &str,
        port: u16,
    ) -> bool {
        self.nodes.iter().any(|node| {
            node.hostname_for(network) == hostname
                && node.port_or(network, service, tls, 0) == port
        })
    }

    /// Selects the network to use for a cluster bootstrapped through
    /// `bootstrap_hostname`: "default" when the host matches a primary
    /// hostname, otherwise the first alternate network whose address
    /// matches, otherwise "default".
    pub fn select_network(&self, bootstrap_hostname: &str) -> String {
        for node in &self.nodes {
            if node.hostname == bootstrap_hostname {
                return "default".into();
            }
        }
        for node in &self.nodes {
            for (name, alt) in &node.alt {
                if alt.hostname == bootstrap_hostname {
                    return name.clone();
                }
            }
        }
        "default".into()
    }

    /// Ephemeral buckets lack the general document capability.
    pub fn ephemeral(&self) -> bool {
        !self.bucket_capabilities.contains(&BucketCapability::CouchApi)
    }

    pub fn supports_enhanced_prepared_statements(&self) -> bool {
        self.cluster_capabilities
            .contains(&ClusterCapability::EnhancedPreparedStatements)
    }

    /// The index of the node this configuration was obtained from, when the
    /// server marked one.
    pub fn index_for_this_node(&self) -> Option<usize> {
        self.nodes.iter().find(|n| n.this_node).map(|n| n.index)
    }
}

/// Builds a minimal single-node configuration for bootstrap, before the
/// first full configuration has been fetched. It has no vbucket map.
pub fn make_blank_configuration(hostname: &str, plain_port: u16, tls_port: u16) -> Configuration {
    Configuration {
        id: String::new(),
        epoch: None,
        rev: None,
        nodes: vec![Node {
            this_node: true,
            index: 0,
            hostname: hostname.to_string(),
            services_plain: PortMap {
                key_value: Some(plain_port),
                ..Default::default()
            },
            services_tls: PortMap {
                key_value: Some(tls_port),
                ..Default::default()
            },
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_config() -> Configuration {
        let mut node0 = Node {
            index: 0,
            hostname: "192.168.1.101".into(),
            services_plain: PortMap {
                key_value: Some(11210),
                management: Some(8091),
                ..Default::default()
            },
            ..Default::default()
        };
        node0.alt.insert(
            "external".into(),
            AlternateAddress {
                name: "external".into(),
                hostname: "a.example.com".into(),
                services_plain: PortMap {
                    key_value: Some(31210),
                    ..Default::default()
                },
                services_tls: PortMap::default(),
            },
        );
        let node1 = Node {
            index: 1,
            hostname: "192.168.1.102".into(),
            services_plain: PortMap {
                key_value: Some(11210),
                ..Default::default()
            },
            ..Default::default()
        };
        Configuration {
            epoch: Some(1),
            rev: Some(2),
            num_replicas: Some(1),
            nodes: vec![node0, node1],
            vbmap: Some(vec![vec![0, 1], vec![1, 0], vec![0, -1]]),
            ..Default::default()
        }
    }

    #[test]
    fn map_key_is_deterministic() {
        let config = two_node_config();
        let first = config.map_key(b"hello", 0);
        for _ in 0..32 {
            assert_eq!(config.map_key(b"hello", 0), first);
        }
        assert!(first.1.is_some());
    }

    #[test]
    fn map_key_uses_ieee_crc32() {
        // crc32("") == 0, so the empty key lands on partition 0.
        let config = two_node_config();
        assert_eq!(config.map_key(b"", 0), (0, Some(0)));
    }

    #[test]
    fn map_key_without_vbmap() {
        let config = make_blank_configuration("localhost", 11210, 11207);
        assert_eq!(config.map_key(b"anything", 0), (0, None));
    }

    #[test]
    fn unassigned_replica_is_absent() {
        let config = two_node_config();
        assert_eq!(config.server_by_vbucket(2, 0), Some(0));
        assert_eq!(config.server_by_vbucket(2, 1), None);
        assert_eq!(config.server_by_vbucket(2, 7), None);
    }

    #[test]
    fn ordering_is_lexicographic_on_epoch_then_rev() {
        let mut older = two_node_config();
        let mut newer = two_node_config();
        older.epoch = Some(1);
        older.rev = Some(9);
        newer.epoch = Some(2);
        newer.rev = Some(0);
        assert!(older < newer);

        newer.epoch = Some(1);
        newer.rev = Some(10);
        assert!(older < newer);

        // Equality considers only the revision, not the topology payload.
        let mut same_revision = two_node_config();
        same_revision.nodes.clear();
        assert_eq!(same_revision, two_node_config());
    }

    #[test]
    fn port_lookup_falls_back_to_default_network() {
        let config = two_node_config();
        let node = &config.nodes[0];
        assert_eq!(node.port_or("external", ServiceType::KeyValue, false, 0), 31210);
        // The alternate entry has no management port; lookups of services the
        // alternate map omits yield the default.
        assert_eq!(node.port_or("external", ServiceType::Management, false, 4444), 4444);
        // A network with no alternate entry falls back to the primary map.
        assert_eq!(node.port_or("internal", ServiceType::KeyValue, false, 0), 11210);
        assert_eq!(node.hostname_for("external"), "a.example.com");
        assert_eq!(node.hostname_for("internal"), "192.168.1.101");
    }

    #[test]
    fn select_network_prefers_primary_hostnames() {
        let config = two_node_config();
        assert_eq!(config.select_network("192.168.1.102"), "default");
        assert_eq!(config.select_network("a.example.com"), "external");
        assert_eq!(config.select_network("unknown.example.com"), "default");
    }

    #[test]
    fn has_node_checks_endpoints() {
        let config = two_node_config();
        assert!(config.has_node("default", ServiceType::KeyValue, false, "192.168.1.101", 11210));
        assert!(!config.has_node("default", ServiceType::KeyValue, true, "192.168.1.101", 11210));
        assert!(config.has_node("external", ServiceType::KeyValue, false, "a.example.com", 31210));
    }

    #[test]
    fn ephemeral_tracks_the_document_capability() {
        let mut config = two_node_config();
        assert!(config.ephemeral());
        config.bucket_capabilities.insert(BucketCapability::CouchApi);
        assert!(!config.ephemeral());
    }
}
