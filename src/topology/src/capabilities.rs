// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Bucket and cluster capability flags advertised by the server.

use serde::{Deserialize, Serialize};

/// A feature a bucket advertises support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BucketCapability {
    /// General document access. Ephemeral buckets lack this capability.
    CouchApi,
    Dcp,
    Xattr,
    CollectionsManifest,
    DurableWrite,
    TombstonedUserXattrs,
    /// Sub-document lookups may target replica copies.
    SubdocReadReplica,
    RangeScan,
    NonDedupedHistory,
}

/// A feature the cluster as a whole advertises support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClusterCapability {
    EnhancedPreparedStatements,
}
