// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The range-scan orchestrator.
//!
//! A scan covers every partition of the bucket. The orchestrator creates a
//! server-side scan per partition through the dispatcher, streams item
//! batches with repeated continues, and enforces the concurrency limit by
//! only keeping that many partition streams in flight; which partition goes
//! next is the load balancer's decision. Items flow to the consumer through
//! a bounded channel, so a slow consumer backpressures the streams.

mod balancer;
mod result;

pub use balancer::RangeScanLoadBalancer;
pub use result::ScanResult;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cbx_error::{CommonError, Error, KeyValueError};
use cbx_signal::Span;
use cbx_topology::BucketCapability;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::cancellation::CancellationToken;
use crate::cluster::ClusterCore;
use crate::document_id::DocumentId;
use crate::operations::{
    RangeScanCancelRequest, RangeScanContinueRequest, RangeScanCreateRequest, RequestOptions,
};
use crate::protocol::{MutationState, RangeScanType, SnapshotRequirements};
use crate::scan::result::ScanResultShared;

/// How scan items are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanSort {
    /// Per-partition order only; no global ordering.
    #[default]
    None,
    Ascending,
}

/// Options for a range scan.
#[derive(Debug, Clone)]
pub struct RangeScanOrchestratorOptions {
    /// Return keys only, without document bodies.
    pub ids_only: bool,
    /// Partitions must have caught up with these mutations before their
    /// scan is created.
    pub consistent_with: Option<MutationState>,
    pub sort: ScanSort,
    pub batch_item_limit: u32,
    pub batch_byte_limit: u32,
    pub batch_time_limit: Duration,
    /// The maximum number of partition streams in flight. Zero is invalid.
    pub concurrency: u16,
    pub timeout: Option<Duration>,
    pub parent_span: Option<Arc<dyn Span>>,
}

impl Default for RangeScanOrchestratorOptions {
    fn default() -> Self {
        RangeScanOrchestratorOptions {
            ids_only: false,
            consistent_with: None,
            sort: ScanSort::None,
            batch_item_limit: 50,
            batch_byte_limit: 15_000,
            batch_time_limit: Duration::ZERO,
            concurrency: 1,
            timeout: None,
            parent_span: None,
        }
    }
}

/// A terminal event one partition stream reports to the manager.
#[derive(Debug)]
enum StreamEvent {
    Completed { node_id: i16 },
    Retry { node_id: i16, partition: u16, error: Error },
    Failed { node_id: i16, error: Error },
}

struct StreamContext {
    core: Arc<ClusterCore>,
    id: DocumentId,
    scan_type: RangeScanType,
    options: RangeScanOrchestratorOptions,
    snapshots: BTreeMap<u16, SnapshotRequirements>,
    item_tx: mpsc::Sender<crate::protocol::RangeScanItem>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    stopped: Arc<AtomicBool>,
}

impl StreamContext {
    fn request_options(&self) -> RequestOptions {
        RequestOptions {
            timeout: self.options.timeout,
            retry_strategy: None,
            parent_span: self.options.parent_span.clone(),
        }
    }
}

/// Streams scanned before a retryable failure cannot be replayed without
/// duplicating items, so a partition is only re-enqueued this many times.
const MAX_STREAM_RETRIES: u32 = 8;

/// Drives a scoped range scan to a lazy [`ScanResult`].
#[derive(Debug)]
pub struct RangeScanOrchestrator;

impl RangeScanOrchestrator {
    /// Validates the options and starts the scan. Option validation errors
    /// resolve `cb` synchronously, before the bucket is even opened.
    pub fn start(
        core: &Arc<ClusterCore>,
        bucket: &str,
        scope: &str,
        collection: &str,
        scan_type: RangeScanType,
        options: RangeScanOrchestratorOptions,
        cb: impl FnOnce(Result<ScanResult, Error>) + Send + 'static,
    ) {
        if options.concurrency == 0 {
            return cb(Err(CommonError::InvalidArgument.into()));
        }
        if let RangeScanType::Sampling { limit: 0, .. } = scan_type {
            return cb(Err(CommonError::InvalidArgument.into()));
        }

        let core = Arc::clone(core);
        let id = DocumentId::new(bucket, scope, collection, "");
        tokio::spawn(async move {
            let config = match core.config.bucket_configuration(id.bucket()).await {
                Ok(config) => config,
                Err(error) => return cb(Err(error)),
            };
            if !config.bucket_capabilities.contains(&BucketCapability::RangeScan) {
                return cb(Err(CommonError::FeatureNotAvailable.into()));
            }
            let Some(vbucket_map) = config.vbmap.clone() else {
                return cb(Err(CommonError::FeatureNotAvailable.into()));
            };

            let seed = match &scan_type {
                RangeScanType::Sampling { seed, .. } => *seed,
                _ => None,
            };
            let balancer = RangeScanLoadBalancer::new(&vbucket_map, seed);

            let snapshots = options
                .consistent_with
                .as_ref()
                .map(|state| {
                    state
                        .tokens
                        .iter()
                        .map(|token| {
                            (
                                token.partition_id,
                                SnapshotRequirements {
                                    partition_uuid: token.partition_uuid,
                                    sequence_number: token.sequence_number,
                                },
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();

            let capacity =
                (options.batch_item_limit as usize).max(1) * usize::from(options.concurrency);
            let (item_tx, item_rx) = mpsc::channel(capacity);
            let shared = ScanResultShared::new(item_rx);
            let stopped = Arc::new(AtomicBool::new(false));
            let manager_notify = Arc::new(Notify::new());

            let cancel_token = {
                let shared = Arc::clone(&shared);
                let stopped = Arc::clone(&stopped);
                let manager_notify = Arc::clone(&manager_notify);
                CancellationToken::new(move || {
                    stopped.store(true, Ordering::SeqCst);
                    shared.set_terminal(KeyValueError::RangeScanCompleted.into());
                    shared.wake_cancelled();
                    manager_notify.notify_waiters();
                })
            };
            cb(Ok(ScanResult::new(
                Arc::clone(&shared),
                cancel_token.clone(),
            )));

            let (event_tx, mut event_rx) = mpsc::unbounded_channel();
            let context = Arc::new(StreamContext {
                core,
                id,
                scan_type,
                options,
                snapshots,
                item_tx,
                event_tx,
                stopped: Arc::clone(&stopped),
            });

            // Ascending sort keeps partition streams sequential so each
            // partition's key order survives; the protocol offers no global
            // order across partitions.
            let concurrency = match context.options.sort {
                ScanSort::Ascending => 1,
                ScanSort::None => usize::from(context.options.concurrency),
            };
            let mut active: usize = 0;
            let mut fatal: Option<Error> = None;
            let mut retries: BTreeMap<u16, u32> = BTreeMap::new();

            loop {
                if stopped.load(Ordering::SeqCst) && active == 0 {
                    break;
                }
                if fatal.is_none() && !stopped.load(Ordering::SeqCst) {
                    while active < concurrency {
                        let Some((node_id, partition)) = balancer.select_vbucket() else {
                            break;
                        };
                        active += 1;
                        tokio::spawn(run_stream(Arc::clone(&context), node_id, partition));
                    }
                }
                if active == 0 {
                    break;
                }
                tokio::select! {
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            StreamEvent::Completed { node_id } => {
                                balancer.notify_stream_ended(node_id);
                                active -= 1;
                            }
                            StreamEvent::Retry { node_id, partition, error } => {
                                balancer.notify_stream_ended(node_id);
                                active -= 1;
                                let count = retries.entry(partition).or_insert(0);
                                *count += 1;
                                if *count > MAX_STREAM_RETRIES {
                                    fatal.get_or_insert(error);
                                    stopped.store(true, Ordering::SeqCst);
                                } else {
                                    debug!(
                                        "re-queueing partition {} after retryable scan error: {}",
                                        partition, error
                                    );
                                    balancer.enqueue_vbucket(node_id, partition);
                                }
                            }
                            StreamEvent::Failed { node_id, error } => {
                                balancer.notify_stream_ended(node_id);
                                active -= 1;
                                fatal.get_or_insert(error);
                                stopped.store(true, Ordering::SeqCst);
                            }
                        }
                    }
                    _ = manager_notify.notified() => {}
                }
            }

            if let Some(error) = fatal {
                shared.set_terminal(error);
            }
            cancel_token.complete();
            // Dropping the context drops the last item sender; the consumer
            // then observes end-of-stream and resolves the terminal state.
        });
    }
}

fn is_retryable_scan_error(error: Error) -> bool {
    matches!(
        error,
        Error::Common(CommonError::TemporaryFailure)
            | Error::Common(CommonError::CollectionNotFound)
            | Error::Common(CommonError::ServiceNotAvailable)
    )
}

/// Sends the protocol-level cancel for a created scan, best-effort.
fn cancel_scan(context: &Arc<StreamContext>, partition: u16, scan_uuid: [u8; 16]) {
    context.core.dispatcher.execute(
        RangeScanCancelRequest {
            id: context.id.clone(),
            partition,
            scan_uuid,
            options: context.request_options(),
        },
        |_| {},
    );
}

async fn run_stream(context: Arc<StreamContext>, node_id: i16, partition: u16) {
    let create = context
        .core
        .dispatcher
        .execute_async(RangeScanCreateRequest {
            id: context.id.clone(),
            partition,
            scan_type: context.scan_type.clone(),
            ids_only: context.options.ids_only,
            snapshot_requirements: context.snapshots.get(&partition).copied(),
            options: context.request_options(),
        })
        .await;

    let scan_uuid = match (create.ctx.ec, create.result) {
        (None, Some(body)) => body.scan_uuid,
        (Some(Error::KeyValue(KeyValueError::DocumentNotFound)), _) => {
            // The partition holds no keys in range; an empty stream.
            let _ = context.event_tx.send(StreamEvent::Completed { node_id });
            return;
        }
        (Some(error), _) if is_retryable_scan_error(error) => {
            let _ = context.event_tx.send(StreamEvent::Retry {
                node_id,
                partition,
                error,
            });
            return;
        }
        (Some(error), _) => {
            let _ = context
                .event_tx
                .send(StreamEvent::Failed { node_id, error });
            return;
        }
        (None, None) => {
            let _ = context.event_tx.send(StreamEvent::Failed {
                node_id,
                error: CommonError::DecodingFailure.into(),
            });
            return;
        }
    };

    loop {
        if context.stopped.load(Ordering::SeqCst) {
            cancel_scan(&context, partition, scan_uuid);
            let _ = context.event_tx.send(StreamEvent::Completed { node_id });
            return;
        }

        let batch = context
            .core
            .dispatcher
            .execute_async(RangeScanContinueRequest {
                id: context.id.clone(),
                partition,
                scan_uuid,
                batch_item_limit: context.options.batch_item_limit,
                batch_byte_limit: context.options.batch_byte_limit,
                batch_time_limit: context.options.batch_time_limit,
                options: context.request_options(),
            })
            .await;

        match (batch.ctx.ec, batch.result) {
            (None, Some(body)) => {
                for item in body.items {
                    if context.item_tx.send(item).await.is_err() {
                        // The consumer cancelled; stop streaming and drop
                        // the server-side scan.
                        cancel_scan(&context, partition, scan_uuid);
                        let _ = context.event_tx.send(StreamEvent::Completed { node_id });
                        return;
                    }
                }
                if !body.more {
                    let _ = context.event_tx.send(StreamEvent::Completed { node_id });
                    return;
                }
            }
            (Some(error), _) => {
                let _ = context
                    .event_tx
                    .send(StreamEvent::Failed { node_id, error });
                return;
            }
            (None, None) => {
                let _ = context.event_tx.send(StreamEvent::Failed {
                    node_id,
                    error: CommonError::DecodingFailure.into(),
                });
                return;
            }
        }
    }
}
