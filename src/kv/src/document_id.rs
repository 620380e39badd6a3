// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Fully qualified document addresses.

use std::fmt;

/// The address of one document: bucket, scope, collection, and key.
///
/// `node_index` is zero for the active copy; replica fan-outs re-target a
/// clone of the id at a specific replica rank before dispatching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DocumentId {
    bucket: String,
    scope: String,
    collection: String,
    key: String,
    node_index: u32,
}

impl DocumentId {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        DocumentId {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key: key.into(),
            node_index: 0,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The replica rank this id targets; zero means the active copy.
    pub fn node_index(&self) -> u32 {
        self.node_index
    }

    pub fn set_node_index(&mut self, node_index: u32) {
        self.node_index = node_index;
    }

    /// A clone of this id re-targeted at the given replica rank.
    pub fn with_node_index(&self, node_index: u32) -> Self {
        let mut id = self.clone();
        id.node_index = node_index;
        id
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.bucket, self.scope, self.collection, self.key
        )
    }
}
