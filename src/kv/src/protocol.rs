// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The abstract request/response shape the dispatcher exchanges with the
//! session layer.
//!
//! Wire-format encoding (opcodes, frame layout, extras) is the session
//! layer's concern; the dispatcher works with [`RequestFrame`] and
//! [`ResponseFrame`] values whose payloads are plain sum types. Server
//! status values use the binary-protocol numbering so error-map lookups
//! and retry classification stay bit-compatible with the server.

use std::fmt;

use bytes::Bytes;
use cbx_error::{CommonError, Error, KeyValueError};

use crate::retry::RetryReason;

/// A server status code in binary-protocol numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const NOT_FOUND: Status = Status(0x0001);
    pub const EXISTS: Status = Status(0x0002);
    pub const TOO_BIG: Status = Status(0x0003);
    pub const INVALID_ARGUMENTS: Status = Status(0x0004);
    pub const NOT_STORED: Status = Status(0x0005);
    pub const DELTA_BAD_VALUE: Status = Status(0x0006);
    pub const NOT_MY_VBUCKET: Status = Status(0x0007);
    pub const NO_BUCKET: Status = Status(0x0008);
    pub const LOCKED: Status = Status(0x0009);
    pub const NOT_LOCKED: Status = Status(0x000e);
    pub const AUTH_ERROR: Status = Status(0x0020);
    pub const OUT_OF_MEMORY: Status = Status(0x0082);
    pub const NOT_SUPPORTED: Status = Status(0x0083);
    pub const INTERNAL: Status = Status(0x0084);
    pub const BUSY: Status = Status(0x0085);
    pub const TEMPORARY_FAILURE: Status = Status(0x0086);
    pub const UNKNOWN_COLLECTION: Status = Status(0x0088);
    pub const NO_COLLECTIONS_MANIFEST: Status = Status(0x0089);
    pub const UNKNOWN_SCOPE: Status = Status(0x008c);
    pub const DURABILITY_INVALID_LEVEL: Status = Status(0x00a0);
    pub const DURABILITY_IMPOSSIBLE: Status = Status(0x00a1);
    pub const SYNC_WRITE_IN_PROGRESS: Status = Status(0x00a2);
    pub const SYNC_WRITE_AMBIGUOUS: Status = Status(0x00a3);
    pub const SYNC_WRITE_RE_COMMIT_IN_PROGRESS: Status = Status(0x00a4);
    pub const RANGE_SCAN_CANCELLED: Status = Status(0x00a5);
    pub const RANGE_SCAN_MORE: Status = Status(0x00a6);
    pub const RANGE_SCAN_COMPLETE: Status = Status(0x00a7);
    pub const SUBDOC_PATH_NOT_FOUND: Status = Status(0x00c0);
    pub const SUBDOC_PATH_MISMATCH: Status = Status(0x00c1);
    pub const SUBDOC_PATH_INVALID: Status = Status(0x00c2);
    pub const SUBDOC_PATH_TOO_BIG: Status = Status(0x00c3);
    pub const SUBDOC_DOC_TOO_DEEP: Status = Status(0x00c4);
    pub const SUBDOC_VALUE_CANNOT_INSERT: Status = Status(0x00c5);
    pub const SUBDOC_DOC_NOT_JSON: Status = Status(0x00c6);
    pub const SUBDOC_NUM_RANGE_ERROR: Status = Status(0x00c7);
    pub const SUBDOC_DELTA_INVALID: Status = Status(0x00c8);
    pub const SUBDOC_PATH_EXISTS: Status = Status(0x00c9);
    pub const SUBDOC_VALUE_TOO_DEEP: Status = Status(0x00ca);
    pub const SUBDOC_MULTI_PATH_FAILURE: Status = Status(0x00cc);
    pub const SUBDOC_SUCCESS_DELETED: Status = Status(0x00cd);
    pub const SUBDOC_MULTI_PATH_FAILURE_DELETED: Status = Status(0x00d3);

    pub fn is_success(&self) -> bool {
        matches!(
            *self,
            Status::SUCCESS
                | Status::SUBDOC_SUCCESS_DELETED
                | Status::RANGE_SCAN_MORE
                | Status::RANGE_SCAN_COMPLETE
        )
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::SUCCESS
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Maps a non-retryable server status to the client error taxonomy.
pub fn status_to_error(status: Status) -> Option<Error> {
    if status.is_success() {
        return None;
    }
    let error = match status {
        Status::NOT_FOUND => KeyValueError::DocumentNotFound.into(),
        Status::EXISTS => KeyValueError::DocumentExists.into(),
        Status::TOO_BIG => KeyValueError::ValueTooLarge.into(),
        Status::INVALID_ARGUMENTS => CommonError::InvalidArgument.into(),
        Status::NOT_STORED => KeyValueError::DocumentExists.into(),
        Status::DELTA_BAD_VALUE => KeyValueError::DeltaInvalid.into(),
        Status::NOT_MY_VBUCKET => CommonError::RequestCanceled.into(),
        Status::NO_BUCKET => CommonError::BucketNotFound.into(),
        Status::LOCKED => KeyValueError::DocumentLocked.into(),
        Status::NOT_LOCKED => KeyValueError::DocumentNotLocked.into(),
        Status::AUTH_ERROR => CommonError::AuthenticationFailure.into(),
        Status::OUT_OF_MEMORY | Status::BUSY | Status::TEMPORARY_FAILURE => {
            CommonError::TemporaryFailure.into()
        }
        Status::NOT_SUPPORTED => CommonError::UnsupportedOperation.into(),
        Status::INTERNAL => CommonError::InternalServerFailure.into(),
        Status::UNKNOWN_COLLECTION => CommonError::CollectionNotFound.into(),
        Status::NO_COLLECTIONS_MANIFEST => CommonError::UnsupportedOperation.into(),
        Status::UNKNOWN_SCOPE => CommonError::ScopeNotFound.into(),
        Status::DURABILITY_INVALID_LEVEL => KeyValueError::DurabilityLevelNotAvailable.into(),
        Status::DURABILITY_IMPOSSIBLE => KeyValueError::DurabilityImpossible.into(),
        Status::SYNC_WRITE_IN_PROGRESS => KeyValueError::DurableWriteInProgress.into(),
        Status::SYNC_WRITE_AMBIGUOUS => KeyValueError::DurabilityAmbiguous.into(),
        Status::SYNC_WRITE_RE_COMMIT_IN_PROGRESS => {
            KeyValueError::DurableWriteReCommitInProgress.into()
        }
        Status::RANGE_SCAN_CANCELLED => CommonError::RequestCanceled.into(),
        Status::SUBDOC_PATH_NOT_FOUND => KeyValueError::PathNotFound.into(),
        Status::SUBDOC_PATH_MISMATCH => KeyValueError::PathMismatch.into(),
        Status::SUBDOC_PATH_INVALID => KeyValueError::PathInvalid.into(),
        Status::SUBDOC_PATH_TOO_BIG => KeyValueError::PathTooBig.into(),
        Status::SUBDOC_DOC_TOO_DEEP => KeyValueError::PathTooDeep.into(),
        Status::SUBDOC_VALUE_CANNOT_INSERT => KeyValueError::ValueInvalid.into(),
        Status::SUBDOC_DOC_NOT_JSON => KeyValueError::DocumentNotJson.into(),
        Status::SUBDOC_NUM_RANGE_ERROR => KeyValueError::NumberTooBig.into(),
        Status::SUBDOC_DELTA_INVALID => KeyValueError::DeltaInvalid.into(),
        Status::SUBDOC_PATH_EXISTS => KeyValueError::PathExists.into(),
        Status::SUBDOC_VALUE_TOO_DEEP => KeyValueError::ValueTooDeep.into(),
        Status::SUBDOC_MULTI_PATH_FAILURE | Status::SUBDOC_MULTI_PATH_FAILURE_DELETED => {
            KeyValueError::PathNotFound.into()
        }
        _ => CommonError::InternalServerFailure.into(),
    };
    Some(error)
}

/// The retry classification for a server status, when the status is
/// retryable at all.
pub fn retry_reason_for_status(status: Status) -> Option<RetryReason> {
    match status {
        Status::NOT_MY_VBUCKET => Some(RetryReason::KvNotMyVbucket),
        Status::UNKNOWN_COLLECTION | Status::NO_COLLECTIONS_MANIFEST => {
            Some(RetryReason::KvCollectionOutdated)
        }
        Status::LOCKED => Some(RetryReason::KvLocked),
        Status::OUT_OF_MEMORY | Status::BUSY | Status::TEMPORARY_FAILURE => {
            Some(RetryReason::KvTemporaryFailure)
        }
        Status::SYNC_WRITE_IN_PROGRESS => Some(RetryReason::KvSyncWriteInProgress),
        Status::SYNC_WRITE_RE_COMMIT_IN_PROGRESS => {
            Some(RetryReason::KvSyncWriteReCommitInProgress)
        }
        _ => None,
    }
}

/// Synchronous durability requested for a mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DurabilityLevel {
    #[default]
    None,
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

impl fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DurabilityLevel::None => f.write_str("none"),
            DurabilityLevel::Majority => f.write_str("majority"),
            DurabilityLevel::MajorityAndPersistToActive => {
                f.write_str("majority_and_persist_to_active")
            }
            DurabilityLevel::PersistToMajority => f.write_str("persist_to_majority"),
        }
    }
}

/// A token identifying one mutation's position in a partition's history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationToken {
    pub partition_uuid: u64,
    pub sequence_number: u64,
    pub partition_id: u16,
    pub bucket_name: String,
}

/// A set of mutation tokens a scan can be made consistent with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationState {
    pub tokens: Vec<MutationToken>,
}

/// The snapshot a partition must have reached before a scan may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRequirements {
    pub partition_uuid: u64,
    pub sequence_number: u64,
}

/// One boundary of a range scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTerm {
    pub term: Vec<u8>,
    pub exclusive: bool,
}

impl ScanTerm {
    pub fn inclusive(term: impl Into<Vec<u8>>) -> Self {
        ScanTerm {
            term: term.into(),
            exclusive: false,
        }
    }

    pub fn exclusive(term: impl Into<Vec<u8>>) -> Self {
        ScanTerm {
            term: term.into(),
            exclusive: true,
        }
    }
}

/// What a range scan covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeScanType {
    Range {
        from: Option<ScanTerm>,
        to: Option<ScanTerm>,
    },
    Prefix {
        prefix: Vec<u8>,
    },
    Sampling {
        limit: u64,
        seed: Option<u64>,
    },
}

/// The document metadata and content carried by a scan item when the scan
/// was not ids-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeScanItemBody {
    pub cas: u64,
    pub value: Bytes,
    pub flags: u32,
    pub sequence_number: u64,
    pub expiry_time: u32,
}

/// One document produced by a range scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeScanItem {
    pub key: Vec<u8>,
    pub body: Option<RangeScanItemBody>,
}

/// One path lookup inside a sub-document read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInSpec {
    pub path: String,
    pub xattr: bool,
    /// Checks existence only, returning no value.
    pub exists: bool,
}

impl LookupInSpec {
    pub fn get(path: impl Into<String>) -> Self {
        LookupInSpec {
            path: path.into(),
            xattr: false,
            exists: false,
        }
    }

    pub fn exists(path: impl Into<String>) -> Self {
        LookupInSpec {
            path: path.into(),
            xattr: false,
            exists: true,
        }
    }
}

/// How a sub-document mutation treats a missing document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreSemantics {
    #[default]
    Replace,
    Upsert,
    Insert,
}

/// One path mutation inside a sub-document write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateInSpec {
    pub path: String,
    pub value: Bytes,
    pub xattr: bool,
    pub create_path: bool,
    pub remove: bool,
}

impl MutateInSpec {
    pub fn upsert(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        MutateInSpec {
            path: path.into(),
            value: value.into(),
            xattr: false,
            create_path: false,
            remove: false,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        MutateInSpec {
            path: path.into(),
            value: Bytes::new(),
            xattr: false,
            create_path: false,
            remove: true,
        }
    }
}

/// The request payload the session layer encodes onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Get {
        key: String,
    },
    GetAndLock {
        key: String,
        lock_time: u32,
    },
    GetAndTouch {
        key: String,
        expiry: u32,
    },
    GetReplica {
        key: String,
    },
    Touch {
        key: String,
        expiry: u32,
    },
    Unlock {
        key: String,
        cas: u64,
    },
    Insert {
        key: String,
        value: Bytes,
        flags: u32,
        expiry: u32,
        durability: DurabilityLevel,
    },
    Upsert {
        key: String,
        value: Bytes,
        flags: u32,
        expiry: u32,
        durability: DurabilityLevel,
        preserve_expiry: bool,
    },
    Replace {
        key: String,
        value: Bytes,
        flags: u32,
        expiry: u32,
        cas: u64,
        durability: DurabilityLevel,
        preserve_expiry: bool,
    },
    Remove {
        key: String,
        cas: u64,
        durability: DurabilityLevel,
    },
    Append {
        key: String,
        value: Bytes,
        cas: u64,
        durability: DurabilityLevel,
    },
    Prepend {
        key: String,
        value: Bytes,
        cas: u64,
        durability: DurabilityLevel,
    },
    Increment {
        key: String,
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
        durability: DurabilityLevel,
    },
    Decrement {
        key: String,
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
        durability: DurabilityLevel,
    },
    LookupIn {
        key: String,
        specs: Vec<LookupInSpec>,
        access_deleted: bool,
    },
    LookupInReplica {
        key: String,
        specs: Vec<LookupInSpec>,
    },
    MutateIn {
        key: String,
        specs: Vec<MutateInSpec>,
        store_semantics: StoreSemantics,
        cas: u64,
        expiry: u32,
        durability: DurabilityLevel,
        access_deleted: bool,
    },
    ObserveSeqno {
        partition_uuid: u64,
    },
    RangeScanCreate {
        scope: String,
        collection: String,
        scan_type: RangeScanType,
        ids_only: bool,
        snapshot_requirements: Option<SnapshotRequirements>,
    },
    RangeScanContinue {
        scan_uuid: [u8; 16],
        batch_item_limit: u32,
        batch_byte_limit: u32,
        batch_time_limit_ms: u32,
    },
    RangeScanCancel {
        scan_uuid: [u8; 16],
    },
}

/// One sub-document lookup result field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInFieldRaw {
    pub status: Status,
    pub value: Bytes,
}

/// One sub-document mutation result field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateInFieldRaw {
    pub status: Status,
    pub value: Bytes,
}

/// The sequence-number state of a partition as reported by observe-seqno.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserveSeqnoState {
    pub partition_uuid: u64,
    pub current_seqno: u64,
    pub last_persisted_seqno: u64,
}

/// The decoded response payload, before per-operation typing.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResponsePayload {
    #[default]
    None,
    Value {
        value: Bytes,
        flags: u32,
    },
    Counter {
        content: u64,
    },
    LookupIn {
        fields: Vec<LookupInFieldRaw>,
        deleted: bool,
    },
    MutateIn {
        fields: Vec<MutateInFieldRaw>,
        deleted: bool,
        /// Index of the first failing spec, for multi-path failures.
        first_error_index: Option<u64>,
    },
    Mutation {
        token: Option<MutationToken>,
    },
    ObserveSeqno(ObserveSeqnoState),
    RangeScanCreate {
        scan_uuid: [u8; 16],
    },
    RangeScanContinue {
        items: Vec<RangeScanItem>,
    },
}

/// A request frame handed to the session layer. The opaque is assigned
/// per session, monotonically; the partition was computed by the router.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub opaque: u32,
    pub partition: u16,
    pub payload: RequestPayload,
}

/// A response frame handed back by the session layer.
#[derive(Debug, Clone, Default)]
pub struct ResponseFrame {
    pub opaque: u32,
    pub status: Status,
    pub cas: u64,
    pub payload: ResponsePayload,
    pub extended_error_info: Option<String>,
}

impl ResponseFrame {
    /// A successful frame carrying a document body.
    pub fn with_value(cas: u64, value: impl Into<Bytes>, flags: u32) -> Self {
        ResponseFrame {
            cas,
            payload: ResponsePayload::Value {
                value: value.into(),
                flags,
            },
            ..Default::default()
        }
    }

    /// A failed frame carrying only a status.
    pub fn with_status(status: Status) -> Self {
        ResponseFrame {
            status,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_the_taxonomy() {
        assert_eq!(status_to_error(Status::SUCCESS), None);
        assert_eq!(
            status_to_error(Status::NOT_FOUND),
            Some(KeyValueError::DocumentNotFound.into())
        );
        assert_eq!(
            status_to_error(Status::SYNC_WRITE_AMBIGUOUS),
            Some(KeyValueError::DurabilityAmbiguous.into())
        );
        assert_eq!(
            status_to_error(Status::UNKNOWN_COLLECTION),
            Some(CommonError::CollectionNotFound.into())
        );
    }

    #[test]
    fn retryable_statuses_have_reasons() {
        assert_eq!(
            retry_reason_for_status(Status::NOT_MY_VBUCKET),
            Some(RetryReason::KvNotMyVbucket)
        );
        assert_eq!(
            retry_reason_for_status(Status::TEMPORARY_FAILURE),
            Some(RetryReason::KvTemporaryFailure)
        );
        assert_eq!(retry_reason_for_status(Status::NOT_FOUND), None);
        assert_eq!(retry_reason_for_status(Status::SUCCESS), None);
    }
}
