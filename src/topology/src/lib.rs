// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster topology model, key routing, and replica selection.
//!
//! A [`Configuration`] describes one revision of the cluster: its nodes,
//! the services and ports they expose per network, and the assignment of
//! partitions to nodes. Routing a document key to a node is a pure function
//! over a configuration (see [`Configuration::map_key`]); selecting the set
//! of nodes eligible to serve a replica read additionally honors a
//! [`ReadPreference`] and a preferred server group
//! (see [`effective_nodes`]).

mod capabilities;
mod configuration;
mod replica;

pub use crate::capabilities::{BucketCapability, ClusterCapability};
pub use crate::configuration::{
    make_blank_configuration, AlternateAddress, Configuration, Node, NodeLocator, PortMap,
    ServiceType, VbucketMap,
};
pub use crate::replica::{effective_nodes, ReadPreference, ReadableNode};
