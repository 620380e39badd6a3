// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Typed key-value operations.
//!
//! Every operation is a request struct implementing [`KvOperation`]: it
//! names itself for spans, addresses a document, encodes into the abstract
//! [`RequestPayload`], and decodes the terminal [`ResponseFrame`] into its
//! typed body. The dispatcher is generic over this trait and owns
//! everything else (routing, retries, timeouts, context assembly).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cbx_error::{CommonError, Error};
use cbx_signal::Span;

use crate::context::SubdocErrorDetails;
use crate::document_id::DocumentId;
use crate::protocol::{
    status_to_error, DurabilityLevel, LookupInSpec, MutateInSpec, MutationToken,
    ObserveSeqnoState, RangeScanItem, RangeScanType, RequestPayload, ResponseFrame,
    ResponsePayload, SnapshotRequirements, Status, StoreSemantics,
};
use crate::retry::RetryStrategy;

/// Options shared by every request: a per-call timeout override, a retry
/// strategy override, and the parent span.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub parent_span: Option<Arc<dyn Span>>,
}

/// One dispatchable key-value operation.
pub trait KvOperation: Send + Sync + 'static {
    type Body: Send + 'static;

    /// The operation name used for span and metric attribution.
    fn name(&self) -> &'static str;

    fn id(&self) -> &DocumentId;

    fn options(&self) -> &RequestOptions;

    fn is_idempotent(&self) -> bool {
        false
    }

    /// The replica rank to route to; zero targets the active copy.
    fn replica_rank(&self) -> u32 {
        self.id().node_index()
    }

    fn durability(&self) -> DurabilityLevel {
        DurabilityLevel::None
    }

    /// Routes to a fixed partition instead of hashing the key. Used by the
    /// range-scan operations, which address partitions directly.
    fn target_partition(&self) -> Option<u16> {
        None
    }

    fn encode(&self) -> RequestPayload;

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error>;

    /// Sub-document operations fill in path-level failure details.
    fn subdoc_details(&self, _frame: &ResponseFrame) -> Option<SubdocErrorDetails> {
        None
    }
}

fn status_failure(frame: &ResponseFrame) -> Error {
    status_to_error(frame.status).unwrap_or_else(|| CommonError::DecodingFailure.into())
}

/// Which copy of the document served a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Active,
    Replica,
}

/// The body of a successful document read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub cas: u64,
    pub value: Bytes,
    pub flags: u32,
    pub source: ReadSource,
}

/// The body of a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
    pub token: Option<MutationToken>,
}

/// The body of a successful counter operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterResult {
    pub cas: u64,
    pub content: u64,
    pub token: Option<MutationToken>,
}

/// One decoded sub-document lookup field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInField {
    pub path: String,
    pub status: Status,
    pub value: Bytes,
    pub exists: bool,
}

/// The body of a successful sub-document lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInResult {
    pub cas: u64,
    pub fields: Vec<LookupInField>,
    pub deleted: bool,
    pub source: ReadSource,
}

/// One decoded sub-document mutation field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateInField {
    pub path: String,
    pub status: Status,
    pub value: Bytes,
}

/// The body of a successful sub-document mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateInResult {
    pub cas: u64,
    pub token: Option<MutationToken>,
    pub fields: Vec<MutateInField>,
    pub deleted: bool,
}

fn mutation_token(frame: &ResponseFrame) -> Option<MutationToken> {
    match &frame.payload {
        ResponsePayload::Mutation { token } => token.clone(),
        _ => None,
    }
}

fn decode_get(frame: &ResponseFrame, source: ReadSource) -> Result<GetResult, Error> {
    if frame.status != Status::SUCCESS {
        return Err(status_failure(frame));
    }
    match &frame.payload {
        ResponsePayload::Value { value, flags } => Ok(GetResult {
            cas: frame.cas,
            value: value.clone(),
            flags: *flags,
            source,
        }),
        _ => Err(CommonError::DecodingFailure.into()),
    }
}

fn decode_mutation(frame: &ResponseFrame) -> Result<MutationResult, Error> {
    if frame.status != Status::SUCCESS {
        return Err(status_failure(frame));
    }
    Ok(MutationResult {
        cas: frame.cas,
        token: mutation_token(frame),
    })
}

fn decode_counter(frame: &ResponseFrame) -> Result<CounterResult, Error> {
    if frame.status != Status::SUCCESS {
        return Err(status_failure(frame));
    }
    match &frame.payload {
        ResponsePayload::Counter { content } => Ok(CounterResult {
            cas: frame.cas,
            content: *content,
            token: None,
        }),
        _ => Err(CommonError::DecodingFailure.into()),
    }
}

/// Reads a document's body from the active copy.
#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    pub id: DocumentId,
    pub options: RequestOptions,
}

impl KvOperation for GetRequest {
    type Body = GetResult;

    fn name(&self) -> &'static str {
        "get"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::Get {
            key: self.id.key().to_string(),
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_get(frame, ReadSource::Active)
    }
}

/// Reads a document's body from a replica copy; the id carries the replica
/// rank.
#[derive(Debug, Clone, Default)]
pub struct GetReplicaRequest {
    pub id: DocumentId,
    pub options: RequestOptions,
}

impl KvOperation for GetReplicaRequest {
    type Body = GetResult;

    fn name(&self) -> &'static str {
        "get_replica"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::GetReplica {
            key: self.id.key().to_string(),
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_get(frame, ReadSource::Replica)
    }
}

/// Reads a document and write-locks it for `lock_time` seconds.
#[derive(Debug, Clone, Default)]
pub struct GetAndLockRequest {
    pub id: DocumentId,
    pub lock_time: u32,
    pub options: RequestOptions,
}

impl KvOperation for GetAndLockRequest {
    type Body = GetResult;

    fn name(&self) -> &'static str {
        "get_and_lock"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::GetAndLock {
            key: self.id.key().to_string(),
            lock_time: self.lock_time,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_get(frame, ReadSource::Active)
    }
}

/// Reads a document and resets its expiry in one round trip.
#[derive(Debug, Clone, Default)]
pub struct GetAndTouchRequest {
    pub id: DocumentId,
    pub expiry: u32,
    pub options: RequestOptions,
}

impl KvOperation for GetAndTouchRequest {
    type Body = GetResult;

    fn name(&self) -> &'static str {
        "get_and_touch"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::GetAndTouch {
            key: self.id.key().to_string(),
            expiry: self.expiry,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_get(frame, ReadSource::Active)
    }
}

/// Resets a document's expiry.
#[derive(Debug, Clone, Default)]
pub struct TouchRequest {
    pub id: DocumentId,
    pub expiry: u32,
    pub options: RequestOptions,
}

impl KvOperation for TouchRequest {
    type Body = MutationResult;

    fn name(&self) -> &'static str {
        "touch"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::Touch {
            key: self.id.key().to_string(),
            expiry: self.expiry,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_mutation(frame)
    }
}

/// Releases a lock taken by get-and-lock; the cas must match the locked
/// document.
#[derive(Debug, Clone, Default)]
pub struct UnlockRequest {
    pub id: DocumentId,
    pub cas: u64,
    pub options: RequestOptions,
}

impl KvOperation for UnlockRequest {
    type Body = ();

    fn name(&self) -> &'static str {
        "unlock"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::Unlock {
            key: self.id.key().to_string(),
            cas: self.cas,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        if frame.status != Status::SUCCESS {
            return Err(status_failure(frame));
        }
        Ok(())
    }
}

/// Creates a document that must not yet exist.
#[derive(Debug, Clone, Default)]
pub struct InsertRequest {
    pub id: DocumentId,
    pub value: Bytes,
    pub flags: u32,
    pub expiry: u32,
    pub durability_level: DurabilityLevel,
    /// Legacy observe-based durability; mutually exclusive with
    /// `durability_level`.
    pub persist_to: u32,
    pub replicate_to: u32,
    pub options: RequestOptions,
}

impl KvOperation for InsertRequest {
    type Body = MutationResult;

    fn name(&self) -> &'static str {
        "insert"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn durability(&self) -> DurabilityLevel {
        self.durability_level
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::Insert {
            key: self.id.key().to_string(),
            value: self.value.clone(),
            flags: self.flags,
            expiry: self.expiry,
            durability: self.durability_level,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_mutation(frame)
    }
}

/// Creates or replaces a document.
#[derive(Debug, Clone, Default)]
pub struct UpsertRequest {
    pub id: DocumentId,
    pub value: Bytes,
    pub flags: u32,
    pub expiry: u32,
    pub preserve_expiry: bool,
    pub durability_level: DurabilityLevel,
    pub persist_to: u32,
    pub replicate_to: u32,
    pub options: RequestOptions,
}

impl KvOperation for UpsertRequest {
    type Body = MutationResult;

    fn name(&self) -> &'static str {
        "upsert"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn durability(&self) -> DurabilityLevel {
        self.durability_level
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::Upsert {
            key: self.id.key().to_string(),
            value: self.value.clone(),
            flags: self.flags,
            expiry: self.expiry,
            durability: self.durability_level,
            preserve_expiry: self.preserve_expiry,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_mutation(frame)
    }
}

/// Replaces a document that must already exist; a non-zero cas makes the
/// write optimistic.
#[derive(Debug, Clone, Default)]
pub struct ReplaceRequest {
    pub id: DocumentId,
    pub value: Bytes,
    pub flags: u32,
    pub expiry: u32,
    pub cas: u64,
    pub preserve_expiry: bool,
    pub durability_level: DurabilityLevel,
    pub persist_to: u32,
    pub replicate_to: u32,
    pub options: RequestOptions,
}

impl KvOperation for ReplaceRequest {
    type Body = MutationResult;

    fn name(&self) -> &'static str {
        "replace"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn durability(&self) -> DurabilityLevel {
        self.durability_level
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::Replace {
            key: self.id.key().to_string(),
            value: self.value.clone(),
            flags: self.flags,
            expiry: self.expiry,
            cas: self.cas,
            durability: self.durability_level,
            preserve_expiry: self.preserve_expiry,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        if frame.status == Status::EXISTS && self.cas != 0 {
            return Err(CommonError::CasMismatch.into());
        }
        decode_mutation(frame)
    }
}

/// Removes a document.
#[derive(Debug, Clone, Default)]
pub struct RemoveRequest {
    pub id: DocumentId,
    pub cas: u64,
    pub durability_level: DurabilityLevel,
    pub persist_to: u32,
    pub replicate_to: u32,
    pub options: RequestOptions,
}

impl KvOperation for RemoveRequest {
    type Body = MutationResult;

    fn name(&self) -> &'static str {
        "remove"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn durability(&self) -> DurabilityLevel {
        self.durability_level
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::Remove {
            key: self.id.key().to_string(),
            cas: self.cas,
            durability: self.durability_level,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        if frame.status == Status::EXISTS && self.cas != 0 {
            return Err(CommonError::CasMismatch.into());
        }
        decode_mutation(frame)
    }
}

/// Appends raw bytes to a document's value.
#[derive(Debug, Clone, Default)]
pub struct AppendRequest {
    pub id: DocumentId,
    pub value: Bytes,
    pub cas: u64,
    pub durability_level: DurabilityLevel,
    pub options: RequestOptions,
}

impl KvOperation for AppendRequest {
    type Body = MutationResult;

    fn name(&self) -> &'static str {
        "append"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn durability(&self) -> DurabilityLevel {
        self.durability_level
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::Append {
            key: self.id.key().to_string(),
            value: self.value.clone(),
            cas: self.cas,
            durability: self.durability_level,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_mutation(frame)
    }
}

/// Prepends raw bytes to a document's value.
#[derive(Debug, Clone, Default)]
pub struct PrependRequest {
    pub id: DocumentId,
    pub value: Bytes,
    pub cas: u64,
    pub durability_level: DurabilityLevel,
    pub options: RequestOptions,
}

impl KvOperation for PrependRequest {
    type Body = MutationResult;

    fn name(&self) -> &'static str {
        "prepend"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn durability(&self) -> DurabilityLevel {
        self.durability_level
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::Prepend {
            key: self.id.key().to_string(),
            value: self.value.clone(),
            cas: self.cas,
            durability: self.durability_level,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_mutation(frame)
    }
}

/// Atomically adds to a counter document, optionally seeding it.
#[derive(Debug, Clone, Default)]
pub struct IncrementRequest {
    pub id: DocumentId,
    pub delta: u64,
    pub initial: Option<u64>,
    pub expiry: u32,
    pub durability_level: DurabilityLevel,
    pub options: RequestOptions,
}

impl KvOperation for IncrementRequest {
    type Body = CounterResult;

    fn name(&self) -> &'static str {
        "increment"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn durability(&self) -> DurabilityLevel {
        self.durability_level
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::Increment {
            key: self.id.key().to_string(),
            delta: self.delta,
            initial: self.initial,
            expiry: self.expiry,
            durability: self.durability_level,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_counter(frame)
    }
}

/// Atomically subtracts from a counter document, optionally seeding it.
#[derive(Debug, Clone, Default)]
pub struct DecrementRequest {
    pub id: DocumentId,
    pub delta: u64,
    pub initial: Option<u64>,
    pub expiry: u32,
    pub durability_level: DurabilityLevel,
    pub options: RequestOptions,
}

impl KvOperation for DecrementRequest {
    type Body = CounterResult;

    fn name(&self) -> &'static str {
        "decrement"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn durability(&self) -> DurabilityLevel {
        self.durability_level
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::Decrement {
            key: self.id.key().to_string(),
            delta: self.delta,
            initial: self.initial,
            expiry: self.expiry,
            durability: self.durability_level,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_counter(frame)
    }
}

fn decode_lookup_fields(
    specs: &[LookupInSpec],
    frame: &ResponseFrame,
    source: ReadSource,
) -> Result<LookupInResult, Error> {
    match frame.status {
        Status::SUCCESS | Status::SUBDOC_SUCCESS_DELETED => {}
        Status::SUBDOC_MULTI_PATH_FAILURE | Status::SUBDOC_MULTI_PATH_FAILURE_DELETED => {
            // The whole lookup failed; surface the first failing path's
            // error.
            let first_failure = match &frame.payload {
                ResponsePayload::LookupIn { fields, .. } => fields
                    .iter()
                    .find(|field| field.status != Status::SUCCESS)
                    .map(|field| status_failure(&ResponseFrame::with_status(field.status))),
                _ => None,
            };
            return Err(first_failure.unwrap_or_else(|| CommonError::DecodingFailure.into()));
        }
        _ => return Err(status_failure(frame)),
    }
    let (raw_fields, deleted) = match &frame.payload {
        ResponsePayload::LookupIn { fields, deleted } => (fields, *deleted),
        _ => return Err(CommonError::DecodingFailure.into()),
    };
    let fields = specs
        .iter()
        .zip(raw_fields.iter())
        .map(|(spec, raw)| LookupInField {
            path: spec.path.clone(),
            status: raw.status,
            value: raw.value.clone(),
            exists: raw.status == Status::SUCCESS,
        })
        .collect();
    Ok(LookupInResult {
        cas: frame.cas,
        fields,
        deleted,
        source,
    })
}

fn lookup_subdoc_details(specs: &[LookupInSpec], frame: &ResponseFrame) -> Option<SubdocErrorDetails> {
    let (raw_fields, deleted) = match &frame.payload {
        ResponsePayload::LookupIn { fields, deleted } => (fields, *deleted),
        _ => return None,
    };
    let first_error = raw_fields
        .iter()
        .position(|field| field.status != Status::SUCCESS);
    Some(SubdocErrorDetails {
        first_error_path: first_error
            .and_then(|index| specs.get(index))
            .map(|spec| spec.path.clone()),
        first_error_index: first_error.map(|index| index as u64),
        deleted,
    })
}

/// Looks up paths inside a document on the active copy.
#[derive(Debug, Clone, Default)]
pub struct LookupInRequest {
    pub id: DocumentId,
    pub specs: Vec<LookupInSpec>,
    pub access_deleted: bool,
    pub options: RequestOptions,
}

impl KvOperation for LookupInRequest {
    type Body = LookupInResult;

    fn name(&self) -> &'static str {
        "lookup_in"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::LookupIn {
            key: self.id.key().to_string(),
            specs: self.specs.clone(),
            access_deleted: self.access_deleted,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_lookup_fields(&self.specs, frame, ReadSource::Active)
    }

    fn subdoc_details(&self, frame: &ResponseFrame) -> Option<SubdocErrorDetails> {
        lookup_subdoc_details(&self.specs, frame)
    }
}

/// Looks up paths inside a document on a replica copy; the id carries the
/// replica rank.
#[derive(Debug, Clone, Default)]
pub struct LookupInReplicaRequest {
    pub id: DocumentId,
    pub specs: Vec<LookupInSpec>,
    pub options: RequestOptions,
}

impl KvOperation for LookupInReplicaRequest {
    type Body = LookupInResult;

    fn name(&self) -> &'static str {
        "lookup_in_replica"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::LookupInReplica {
            key: self.id.key().to_string(),
            specs: self.specs.clone(),
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        decode_lookup_fields(&self.specs, frame, ReadSource::Replica)
    }

    fn subdoc_details(&self, frame: &ResponseFrame) -> Option<SubdocErrorDetails> {
        lookup_subdoc_details(&self.specs, frame)
    }
}

/// Mutates paths inside a document.
#[derive(Debug, Clone, Default)]
pub struct MutateInRequest {
    pub id: DocumentId,
    pub specs: Vec<MutateInSpec>,
    pub store_semantics: StoreSemantics,
    pub cas: u64,
    pub expiry: u32,
    pub durability_level: DurabilityLevel,
    pub access_deleted: bool,
    pub options: RequestOptions,
}

impl KvOperation for MutateInRequest {
    type Body = MutateInResult;

    fn name(&self) -> &'static str {
        "mutate_in"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn durability(&self) -> DurabilityLevel {
        self.durability_level
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::MutateIn {
            key: self.id.key().to_string(),
            specs: self.specs.clone(),
            store_semantics: self.store_semantics,
            cas: self.cas,
            expiry: self.expiry,
            durability: self.durability_level,
            access_deleted: self.access_deleted,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        match frame.status {
            Status::SUCCESS | Status::SUBDOC_SUCCESS_DELETED => {}
            Status::SUBDOC_MULTI_PATH_FAILURE | Status::SUBDOC_MULTI_PATH_FAILURE_DELETED => {
                let first_failure = match &frame.payload {
                    ResponsePayload::MutateIn { fields, .. } => fields
                        .iter()
                        .find(|field| field.status != Status::SUCCESS)
                        .map(|field| status_failure(&ResponseFrame::with_status(field.status))),
                    _ => None,
                };
                return Err(first_failure.unwrap_or_else(|| CommonError::DecodingFailure.into()));
            }
            Status::EXISTS if self.cas != 0 => return Err(CommonError::CasMismatch.into()),
            _ => return Err(status_failure(frame)),
        }
        let (raw_fields, deleted) = match &frame.payload {
            ResponsePayload::MutateIn { fields, deleted, .. } => (fields, *deleted),
            _ => return Err(CommonError::DecodingFailure.into()),
        };
        let fields = self
            .specs
            .iter()
            .zip(raw_fields.iter())
            .map(|(spec, raw)| MutateInField {
                path: spec.path.clone(),
                status: raw.status,
                value: raw.value.clone(),
            })
            .collect();
        Ok(MutateInResult {
            cas: frame.cas,
            token: None,
            fields,
            deleted,
        })
    }

    fn subdoc_details(&self, frame: &ResponseFrame) -> Option<SubdocErrorDetails> {
        let (first_error_index, deleted) = match &frame.payload {
            ResponsePayload::MutateIn {
                first_error_index,
                deleted,
                ..
            } => (*first_error_index, *deleted),
            _ => return None,
        };
        Some(SubdocErrorDetails {
            first_error_path: first_error_index
                .and_then(|index| self.specs.get(index as usize))
                .map(|spec| spec.path.clone()),
            first_error_index,
            deleted,
        })
    }
}

/// Polls a partition's persisted and replicated sequence numbers; routed by
/// partition, not by key.
#[derive(Debug, Clone, Default)]
pub struct ObserveSeqnoRequest {
    pub id: DocumentId,
    pub partition: u16,
    pub partition_uuid: u64,
    /// The replica rank to poll; zero polls the active copy.
    pub rank: u32,
    pub options: RequestOptions,
}

impl KvOperation for ObserveSeqnoRequest {
    type Body = ObserveSeqnoState;

    fn name(&self) -> &'static str {
        "observe_seqno"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn replica_rank(&self) -> u32 {
        self.rank
    }

    fn target_partition(&self) -> Option<u16> {
        Some(self.partition)
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::ObserveSeqno {
            partition_uuid: self.partition_uuid,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        if frame.status != Status::SUCCESS {
            return Err(status_failure(frame));
        }
        match &frame.payload {
            ResponsePayload::ObserveSeqno(state) => Ok(*state),
            _ => Err(CommonError::DecodingFailure.into()),
        }
    }
}

/// The body of a successful range-scan create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeScanCreateResult {
    pub scan_uuid: [u8; 16],
}

/// Creates a scan on one partition.
#[derive(Debug, Clone)]
pub struct RangeScanCreateRequest {
    pub id: DocumentId,
    pub partition: u16,
    pub scan_type: RangeScanType,
    pub ids_only: bool,
    pub snapshot_requirements: Option<SnapshotRequirements>,
    pub options: RequestOptions,
}

impl KvOperation for RangeScanCreateRequest {
    type Body = RangeScanCreateResult;

    fn name(&self) -> &'static str {
        "range_scan_create"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn target_partition(&self) -> Option<u16> {
        Some(self.partition)
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::RangeScanCreate {
            scope: self.id.scope().to_string(),
            collection: self.id.collection().to_string(),
            scan_type: self.scan_type.clone(),
            ids_only: self.ids_only,
            snapshot_requirements: self.snapshot_requirements,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        if frame.status != Status::SUCCESS {
            return Err(status_failure(frame));
        }
        match &frame.payload {
            ResponsePayload::RangeScanCreate { scan_uuid } => Ok(RangeScanCreateResult {
                scan_uuid: *scan_uuid,
            }),
            _ => Err(CommonError::DecodingFailure.into()),
        }
    }
}

/// The body of one range-scan continue round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeScanContinueResult {
    pub items: Vec<RangeScanItem>,
    /// Whether the server expects another continue for this scan.
    pub more: bool,
}

/// Streams the next batch of items from a created scan.
#[derive(Debug, Clone)]
pub struct RangeScanContinueRequest {
    pub id: DocumentId,
    pub partition: u16,
    pub scan_uuid: [u8; 16],
    pub batch_item_limit: u32,
    pub batch_byte_limit: u32,
    pub batch_time_limit: Duration,
    pub options: RequestOptions,
}

impl KvOperation for RangeScanContinueRequest {
    type Body = RangeScanContinueResult;

    fn name(&self) -> &'static str {
        "range_scan_continue"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn target_partition(&self) -> Option<u16> {
        Some(self.partition)
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::RangeScanContinue {
            scan_uuid: self.scan_uuid,
            batch_item_limit: self.batch_item_limit,
            batch_byte_limit: self.batch_byte_limit,
            batch_time_limit_ms: u32::try_from(self.batch_time_limit.as_millis()).unwrap_or(0),
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        let more = match frame.status {
            Status::RANGE_SCAN_COMPLETE => false,
            Status::SUCCESS | Status::RANGE_SCAN_MORE => true,
            _ => return Err(status_failure(frame)),
        };
        match &frame.payload {
            ResponsePayload::RangeScanContinue { items } => Ok(RangeScanContinueResult {
                items: items.clone(),
                more,
            }),
            _ => Err(CommonError::DecodingFailure.into()),
        }
    }
}

/// Cancels a created scan; best-effort, a scan the server already dropped
/// counts as cancelled.
#[derive(Debug, Clone)]
pub struct RangeScanCancelRequest {
    pub id: DocumentId,
    pub partition: u16,
    pub scan_uuid: [u8; 16],
    pub options: RequestOptions,
}

impl KvOperation for RangeScanCancelRequest {
    type Body = ();

    fn name(&self) -> &'static str {
        "range_scan_cancel"
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn target_partition(&self) -> Option<u16> {
        Some(self.partition)
    }

    fn encode(&self) -> RequestPayload {
        RequestPayload::RangeScanCancel {
            scan_uuid: self.scan_uuid,
        }
    }

    fn decode(&self, frame: &ResponseFrame) -> Result<Self::Body, Error> {
        match frame.status {
            Status::SUCCESS => Ok(()),
            Status::NOT_FOUND => Ok(()),
            _ => Err(status_failure(frame)),
        }
    }
}

#[cfg(test)]
mod tests {
    use cbx_error::KeyValueError;

    use crate::protocol::LookupInFieldRaw;

    use super::*;

    fn id() -> DocumentId {
        DocumentId::new("default", "_default", "_default", "k")
    }

    #[test]
    fn get_decodes_value_frames() {
        let request = GetRequest {
            id: id(),
            options: RequestOptions::default(),
        };
        let frame = ResponseFrame::with_value(42, "{}", 0x2000000);
        let body = request.decode(&frame).unwrap();
        assert_eq!(body.cas, 42);
        assert_eq!(body.flags, 0x2000000);
        assert_eq!(body.source, ReadSource::Active);

        let failure = request
            .decode(&ResponseFrame::with_status(Status::NOT_FOUND))
            .unwrap_err();
        assert_eq!(failure, KeyValueError::DocumentNotFound.into());
    }

    #[test]
    fn replace_maps_exists_to_cas_mismatch_only_with_a_cas() {
        let with_cas = ReplaceRequest {
            id: id(),
            cas: 7,
            ..Default::default()
        };
        assert_eq!(
            with_cas
                .decode(&ResponseFrame::with_status(Status::EXISTS))
                .unwrap_err(),
            CommonError::CasMismatch.into()
        );
        let without_cas = ReplaceRequest {
            id: id(),
            ..Default::default()
        };
        assert_eq!(
            without_cas
                .decode(&ResponseFrame::with_status(Status::EXISTS))
                .unwrap_err(),
            KeyValueError::DocumentExists.into()
        );
    }

    #[test]
    fn lookup_in_surfaces_the_first_failing_path() {
        let request = LookupInRequest {
            id: id(),
            specs: vec![LookupInSpec::get("a"), LookupInSpec::get("b")],
            access_deleted: false,
            options: RequestOptions::default(),
        };
        let frame = ResponseFrame {
            status: Status::SUBDOC_MULTI_PATH_FAILURE,
            payload: crate::protocol::ResponsePayload::LookupIn {
                fields: vec![
                    LookupInFieldRaw {
                        status: Status::SUCCESS,
                        value: Bytes::from_static(b"1"),
                    },
                    LookupInFieldRaw {
                        status: Status::SUBDOC_PATH_NOT_FOUND,
                        value: Bytes::new(),
                    },
                ],
                deleted: false,
            },
            ..Default::default()
        };
        assert_eq!(
            request.decode(&frame).unwrap_err(),
            KeyValueError::PathNotFound.into()
        );
        let details = request.subdoc_details(&frame).unwrap();
        assert_eq!(details.first_error_path.as_deref(), Some("b"));
        assert_eq!(details.first_error_index, Some(1));
    }

    #[test]
    fn range_scan_continue_reports_stream_state() {
        let request = RangeScanContinueRequest {
            id: id(),
            partition: 3,
            scan_uuid: [1; 16],
            batch_item_limit: 50,
            batch_byte_limit: 15_000,
            batch_time_limit: Duration::ZERO,
            options: RequestOptions::default(),
        };
        let frame = ResponseFrame {
            status: Status::RANGE_SCAN_COMPLETE,
            payload: crate::protocol::ResponsePayload::RangeScanContinue { items: vec![] },
            ..Default::default()
        };
        let body = request.decode(&frame).unwrap();
        assert!(!body.more);
    }
}
