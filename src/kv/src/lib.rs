// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Key-value operation dispatch and replica coordination.
//!
//! This crate is the core of the client: given a logical request it locates
//! the authoritative node for the document key through the cluster
//! topology, sends an abstract binary frame on that node's session with
//! retry and timeout semantics, and hands the result back through a
//! callback carrying a fully populated error context. Compound operations
//! (read-from-any-replica, read-from-all-replicas, scoped range scans)
//! orchestrate concurrent sub-operations on top of the dispatcher.
//!
//! Nothing here is synchronous: every public operation returns immediately
//! and completes via a callback scheduled on the tokio executor that the
//! [`Cluster`] was created under.

mod cancellation;
mod cluster;
mod config_cache;
mod context;
mod dispatcher;
mod document_id;
mod observability;
mod observe;
mod operations;
mod options;
mod protocol;
mod replica_reads;
mod retry;
mod scan;
mod session;

pub use crate::cancellation::CancellationToken;
pub use crate::cluster::{Cluster, ClusterCore};
pub use crate::config_cache::{ConfigFetcher, ConfigListener, ConfigurationCache};
pub use crate::context::{ErrorMapInfo, KeyValueErrorContext, SubdocErrorDetails};
pub use crate::dispatcher::{KvResponse, OperationCallback, OperationDispatcher};
pub use crate::document_id::DocumentId;
pub use crate::observability::{ClusterLabels, MetricAttributes, ObservabilityRecorder};
pub use crate::observe::ObserveRequirements;
pub use crate::operations::{
    AppendRequest, CounterResult, DecrementRequest, GetAndLockRequest, GetAndTouchRequest,
    GetReplicaRequest, GetRequest, GetResult, IncrementRequest, InsertRequest, KvOperation,
    LookupInField, LookupInReplicaRequest, LookupInRequest, LookupInResult, MutateInField,
    MutateInRequest, MutateInResult, MutationResult, ObserveSeqnoRequest, PrependRequest,
    RangeScanCancelRequest, RangeScanContinueRequest, RangeScanContinueResult,
    RangeScanCreateRequest, RangeScanCreateResult, ReadSource, RemoveRequest, ReplaceRequest,
    RequestOptions, TouchRequest, UnlockRequest, UpsertRequest,
};
pub use crate::options::{
    parse_duration, ClusterOptions, ConfigProfile, IpProtocol, TimeoutOptions, TlsVerifyMode,
    WanDevelopmentProfile,
};
pub use crate::protocol::{
    retry_reason_for_status, status_to_error, DurabilityLevel, LookupInFieldRaw, LookupInSpec,
    MutateInFieldRaw, MutateInSpec, MutationState, MutationToken, ObserveSeqnoState,
    RangeScanItem, RangeScanItemBody, RangeScanType, RequestFrame, RequestPayload, ResponseFrame,
    ResponsePayload, ScanTerm, SnapshotRequirements, Status, StoreSemantics,
};
pub use crate::replica_reads::{
    GetAllReplicasRequest, GetAnyReplicaRequest, LookupInAllReplicasRequest,
    LookupInAnyReplicaRequest,
};
pub use crate::retry::{
    controlled_backoff, BestEffortRetryStrategy, FailFastRetryStrategy, RetryAction, RetryReason,
    RetryRequest, RetryStrategy,
};
pub use crate::scan::{
    RangeScanLoadBalancer, RangeScanOrchestrator, RangeScanOrchestratorOptions, ScanResult,
    ScanSort,
};
pub use crate::session::{KvSession, SessionManager};
