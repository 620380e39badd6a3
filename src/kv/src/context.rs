// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Structured context attached to every key-value result.

use std::collections::BTreeSet;

use cbx_error::Error;

use crate::document_id::DocumentId;
use crate::protocol::Status;
use crate::retry::RetryReason;

/// A decoded entry of the server's error map for a status code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorMapInfo {
    pub code: u16,
    pub name: String,
    pub description: String,
}

/// Sub-document failure details, present on sub-document operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubdocErrorDetails {
    pub first_error_path: Option<String>,
    pub first_error_index: Option<u64>,
    /// Whether the document was a tombstone accessed through xattrs.
    pub deleted: bool,
}

/// Context carried by every key-value response, success or failure.
///
/// On success `ec` is `None` and the retry statistics and endpoints still
/// describe how the operation was dispatched.
#[derive(Debug, Clone, Default)]
pub struct KeyValueErrorContext {
    /// Client-generated id correlating retries of one logical operation.
    pub operation_id: String,
    pub ec: Option<Error>,
    /// "host:port" of the node the last attempt was sent to.
    pub last_dispatched_to: Option<String>,
    /// "host:port" of the local socket the last attempt was sent from.
    pub last_dispatched_from: Option<String>,
    pub retry_attempts: u32,
    pub retry_reasons: BTreeSet<RetryReason>,
    pub id: DocumentId,
    pub opaque: u32,
    pub status_code: Option<Status>,
    pub cas: Option<u64>,
    pub error_map_info: Option<ErrorMapInfo>,
    pub extended_error_info: Option<String>,
    pub subdoc: Option<SubdocErrorDetails>,
}

impl KeyValueErrorContext {
    /// A context for an operation that failed before it could be
    /// dispatched.
    pub fn for_id(id: DocumentId, ec: Option<Error>) -> Self {
        KeyValueErrorContext {
            operation_id: uuid::Uuid::new_v4().to_string(),
            ec,
            id,
            ..Default::default()
        }
    }

    /// Rewrites the error code, preserving the rest of the context. Used by
    /// compound reads when all branches have failed.
    pub fn override_ec(&mut self, ec: Option<Error>) {
        self.ec = ec;
    }
}
