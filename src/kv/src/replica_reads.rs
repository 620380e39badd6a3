// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Replica-read fan-outs.
//!
//! Any-replica and all-replicas reads share one skeleton: select the
//! eligible nodes through the replica-set selector, dispatch one
//! sub-operation per node, and aggregate the branch completions in an
//! orchestrator task that owns the fan-out record exclusively. Branch
//! completions arrive as messages; the handler is taken out of an `Option`
//! on completion, so it cannot fire twice no matter how branches race.

use std::sync::Arc;

use cbx_error::KeyValueError;
use cbx_topology::{effective_nodes, BucketCapability, ReadPreference, ReadableNode};
use tokio::sync::mpsc;

use crate::cluster::ClusterCore;
use crate::context::KeyValueErrorContext;
use crate::dispatcher::{KvResponse, OperationCallback};
use crate::document_id::DocumentId;
use crate::operations::{
    GetReplicaRequest, GetRequest, GetResult, LookupInReplicaRequest, LookupInRequest,
    LookupInResult, RequestOptions,
};
use crate::protocol::LookupInSpec;

/// Reads a document from whichever eligible copy answers first.
#[derive(Debug, Clone, Default)]
pub struct GetAnyReplicaRequest {
    pub id: DocumentId,
    pub read_preference: ReadPreference,
    pub options: RequestOptions,
}

/// Reads a document from every eligible copy, collecting all successes.
#[derive(Debug, Clone, Default)]
pub struct GetAllReplicasRequest {
    pub id: DocumentId,
    pub read_preference: ReadPreference,
    pub options: RequestOptions,
}

/// Sub-document lookup served by whichever eligible copy answers first.
#[derive(Debug, Clone, Default)]
pub struct LookupInAnyReplicaRequest {
    pub id: DocumentId,
    pub specs: Vec<LookupInSpec>,
    pub read_preference: ReadPreference,
    pub options: RequestOptions,
}

/// Sub-document lookup fanned out to every eligible copy.
#[derive(Debug, Clone, Default)]
pub struct LookupInAllReplicasRequest {
    pub id: DocumentId,
    pub specs: Vec<LookupInSpec>,
    pub read_preference: ReadPreference,
    pub options: RequestOptions,
}

type BranchSender<T> = mpsc::UnboundedSender<(ReadableNode, KvResponse<T>)>;

/// How one fan-out resolves the eligible node set and dispatches branches.
struct FanOut<T> {
    id: DocumentId,
    read_preference: ReadPreference,
    /// A bucket capability the fan-out requires, checked before dispatch.
    required_capability: Option<BucketCapability>,
    dispatch: Box<dyn Fn(ReadableNode, BranchSender<T>) + Send>,
}

fn irretrievable<T>(id: DocumentId) -> KvResponse<T> {
    KvResponse {
        ctx: KeyValueErrorContext::for_id(id, Some(KeyValueError::DocumentIrretrievable.into())),
        result: None,
    }
}

/// Runs the shared fan-out skeleton. `first_wins` completes on the first
/// successful branch; otherwise all branches are awaited and their bodies
/// collected.
fn initiate_fan_out<T: Send + 'static>(
    core: &Arc<ClusterCore>,
    fan_out: FanOut<T>,
    first_wins: bool,
    cb: OperationCallback<Vec<(ReadableNode, T)>>,
) {
    let core = Arc::clone(core);
    tokio::spawn(async move {
        let FanOut {
            id,
            read_preference,
            required_capability,
            dispatch,
        } = fan_out;

        let config = match core.config.bucket_configuration(id.bucket()).await {
            Ok(config) => config,
            Err(error) => {
                return cb(KvResponse {
                    ctx: KeyValueErrorContext::for_id(id, Some(error)),
                    result: None,
                });
            }
        };
        if let Some(capability) = required_capability {
            if !config.bucket_capabilities.contains(&capability) {
                return cb(KvResponse {
                    ctx: KeyValueErrorContext::for_id(
                        id,
                        Some(cbx_error::CommonError::FeatureNotAvailable.into()),
                    ),
                    result: None,
                });
            }
        }

        let nodes = effective_nodes(
            id.key().as_bytes(),
            &config,
            read_preference,
            &core.options.preferred_server_group,
        );
        if nodes.is_empty() {
            // A strict server-group preference left nothing to read from;
            // never dispatch.
            return cb(irretrievable(id));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        for node in &nodes {
            dispatch(*node, tx.clone());
        }
        drop(tx);

        let mut cb = Some(cb);
        let mut remaining = nodes.len();
        let mut results: Vec<(ReadableNode, T)> = Vec::new();
        let mut last_ctx: Option<KeyValueErrorContext> = None;

        while let Some((node, response)) = rx.recv().await {
            remaining -= 1;
            match response.result {
                Some(body) if first_wins => {
                    if let Some(cb) = cb.take() {
                        cb(KvResponse {
                            ctx: response.ctx,
                            result: Some(vec![(node, body)]),
                        });
                    }
                    // Remaining branches complete into a closed channel and
                    // are dropped on arrival.
                    return;
                }
                Some(body) => {
                    results.push((node, body));
                    last_ctx = Some(response.ctx);
                }
                None => {
                    last_ctx = Some(response.ctx);
                }
            }
            if remaining == 0 {
                break;
            }
        }

        if let Some(cb) = cb.take() {
            let mut ctx = last_ctx
                .unwrap_or_else(|| KeyValueErrorContext::for_id(id, None));
            if results.is_empty() {
                ctx.override_ec(Some(KeyValueError::DocumentIrretrievable.into()));
                cb(KvResponse { ctx, result: None });
            } else {
                ctx.override_ec(None);
                cb(KvResponse {
                    ctx,
                    result: Some(results),
                });
            }
        }
    });
}

fn branch_options(options: &RequestOptions) -> RequestOptions {
    RequestOptions {
        timeout: options.timeout,
        retry_strategy: options.retry_strategy.clone(),
        parent_span: options.parent_span.clone(),
    }
}

fn get_dispatcher(
    core: &Arc<ClusterCore>,
    id: &DocumentId,
    options: &RequestOptions,
) -> Box<dyn Fn(ReadableNode, BranchSender<GetResult>) + Send> {
    let core = Arc::clone(core);
    let id = id.clone();
    let options = branch_options(options);
    Box::new(move |node, tx| {
        let forward = move |response: KvResponse<GetResult>| {
            let _ = tx.send((node, response));
        };
        if node.is_replica {
            core.dispatcher.execute(
                GetReplicaRequest {
                    id: id.with_node_index(node.index),
                    options: branch_options(&options),
                },
                forward,
            );
        } else {
            core.dispatcher.execute(
                GetRequest {
                    id: id.clone(),
                    options: branch_options(&options),
                },
                forward,
            );
        }
    })
}

fn lookup_dispatcher(
    core: &Arc<ClusterCore>,
    id: &DocumentId,
    specs: &[LookupInSpec],
    options: &RequestOptions,
) -> Box<dyn Fn(ReadableNode, BranchSender<LookupInResult>) + Send> {
    let core = Arc::clone(core);
    let id = id.clone();
    let specs = specs.to_vec();
    let options = branch_options(options);
    Box::new(move |node, tx| {
        let forward = move |response: KvResponse<LookupInResult>| {
            let _ = tx.send((node, response));
        };
        if node.is_replica {
            core.dispatcher.execute(
                LookupInReplicaRequest {
                    id: id.with_node_index(node.index),
                    specs: specs.clone(),
                    options: branch_options(&options),
                },
                forward,
            );
        } else {
            core.dispatcher.execute(
                LookupInRequest {
                    id: id.clone(),
                    specs: specs.clone(),
                    access_deleted: false,
                    options: branch_options(&options),
                },
                forward,
            );
        }
    })
}

pub(crate) fn initiate_get_any_replica(
    core: &Arc<ClusterCore>,
    request: GetAnyReplicaRequest,
    cb: OperationCallback<GetResult>,
) {
    let dispatch = get_dispatcher(core, &request.id, &request.options);
    initiate_fan_out(
        core,
        FanOut {
            id: request.id,
            read_preference: request.read_preference,
            required_capability: None,
            dispatch,
        },
        true,
        Box::new(|response: KvResponse<Vec<(ReadableNode, GetResult)>>| {
            cb(KvResponse {
                ctx: response.ctx,
                result: response
                    .result
                    .and_then(|mut results| results.pop())
                    .map(|(_, body)| body),
            });
        }),
    );
}

pub(crate) fn initiate_get_all_replicas(
    core: &Arc<ClusterCore>,
    request: GetAllReplicasRequest,
    cb: OperationCallback<Vec<GetResult>>,
) {
    let dispatch = get_dispatcher(core, &request.id, &request.options);
    initiate_fan_out(
        core,
        FanOut {
            id: request.id,
            read_preference: request.read_preference,
            required_capability: None,
            dispatch,
        },
        false,
        Box::new(|response: KvResponse<Vec<(ReadableNode, GetResult)>>| {
            cb(KvResponse {
                ctx: response.ctx,
                result: response
                    .result
                    .map(|results| results.into_iter().map(|(_, body)| body).collect()),
            });
        }),
    );
}

pub(crate) fn initiate_lookup_in_any_replica(
    core: &Arc<ClusterCore>,
    request: LookupInAnyReplicaRequest,
    cb: OperationCallback<LookupInResult>,
) {
    let dispatch = lookup_dispatcher(core, &request.id, &request.specs, &request.options);
    initiate_fan_out(
        core,
        FanOut {
            id: request.id,
            read_preference: request.read_preference,
            required_capability: Some(BucketCapability::SubdocReadReplica),
            dispatch,
        },
        true,
        Box::new(|response: KvResponse<Vec<(ReadableNode, LookupInResult)>>| {
            cb(KvResponse {
                ctx: response.ctx,
                result: response
                    .result
                    .and_then(|mut results| results.pop())
                    .map(|(_, body)| body),
            });
        }),
    );
}

pub(crate) fn initiate_lookup_in_all_replicas(
    core: &Arc<ClusterCore>,
    request: LookupInAllReplicasRequest,
    cb: OperationCallback<Vec<LookupInResult>>,
) {
    let dispatch = lookup_dispatcher(core, &request.id, &request.specs, &request.options);
    initiate_fan_out(
        core,
        FanOut {
            id: request.id,
            read_preference: request.read_preference,
            required_capability: Some(BucketCapability::SubdocReadReplica),
            dispatch,
        },
        false,
        Box::new(|response: KvResponse<Vec<(ReadableNode, LookupInResult)>>| {
            cb(KvResponse {
                ctx: response.ctx,
                result: response
                    .result
                    .map(|results| results.into_iter().map(|(_, body)| body).collect()),
            });
        }),
    );
}
