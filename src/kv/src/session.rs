// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The session layer the dispatcher sends frames on.
//!
//! Sessions are owned outside this subsystem (one per node per bucket);
//! the dispatcher only selects one and exchanges abstract frames with it.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use cbx_error::Error;

use crate::context::ErrorMapInfo;
use crate::protocol::{RequestFrame, ResponseFrame};

/// One established connection to the key-value service of a node.
#[async_trait]
pub trait KvSession: Debug + Send + Sync {
    /// Sends a frame and resolves with the matching response frame.
    /// Responses are matched by opaque; frames on one session are processed
    /// in opaque order.
    async fn send(&self, frame: RequestFrame) -> Result<ResponseFrame, Error>;

    /// The `(local, remote)` socket addresses of the session, for error
    /// contexts.
    fn last_endpoints(&self) -> (String, String);

    /// The error-map entry the server advertises for a non-zero status.
    fn error_map_info(&self, status: u16) -> Option<ErrorMapInfo>;

    /// Assigns the next per-session request id.
    fn next_opaque(&self) -> u32;
}

/// Hands out sessions per bucket and node.
pub trait SessionManager: Debug + Send + Sync {
    fn kv_session(&self, bucket: &str, node_index: usize) -> Option<Arc<dyn KvSession>>;
}
