// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The operation dispatcher.
//!
//! [`OperationDispatcher::execute`] accepts an owned request, resolves the
//! target `(partition, node)` through the configuration cache and the key
//! router, exchanges frames with the node's session, and completes the
//! callback exactly once with a typed response whose error context is
//! always populated — even a success carries the retry statistics and the
//! last dispatched endpoints.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cbx_error::{CommonError, Error, NetworkError};
use cbx_signal::{Meter, Tracer};
use cbx_topology::Configuration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config_cache::ConfigurationCache;
use crate::context::KeyValueErrorContext;
use crate::observability::{ClusterLabels, ObservabilityRecorder, SERVICE_KEY_VALUE};
use crate::operations::KvOperation;
use crate::options::TimeoutOptions;
use crate::protocol::{
    retry_reason_for_status, status_to_error, DurabilityLevel, RequestFrame, ResponseFrame,
};
use crate::retry::{controlled_backoff, RetryReason, RetryRequest, RetryStrategy};
use crate::session::{KvSession, SessionManager};

/// A typed operation outcome. `ctx.ec` is `None` exactly when `result` is
/// present.
#[derive(Debug)]
pub struct KvResponse<T> {
    pub ctx: KeyValueErrorContext,
    pub result: Option<T>,
}

impl<T> KvResponse<T> {
    pub fn error(&self) -> Option<Error> {
        self.ctx.ec
    }

    pub fn is_success(&self) -> bool {
        self.ctx.ec.is_none()
    }
}

/// The boxed completion callback for one operation.
pub type OperationCallback<T> = Box<dyn FnOnce(KvResponse<T>) + Send + 'static>;

/// Dispatches operations onto node sessions.
#[derive(Debug)]
pub struct OperationDispatcher {
    config: Arc<ConfigurationCache>,
    sessions: Arc<dyn SessionManager>,
    tracer: Arc<dyn Tracer>,
    meter: Arc<dyn Meter>,
    labels: Arc<ClusterLabels>,
    timeouts: TimeoutOptions,
    default_retry: Arc<dyn RetryStrategy>,
}

impl OperationDispatcher {
    pub fn new(
        config: Arc<ConfigurationCache>,
        sessions: Arc<dyn SessionManager>,
        tracer: Arc<dyn Tracer>,
        meter: Arc<dyn Meter>,
        labels: Arc<ClusterLabels>,
        timeouts: TimeoutOptions,
        default_retry: Arc<dyn RetryStrategy>,
    ) -> Arc<Self> {
        Arc::new(OperationDispatcher {
            config,
            sessions,
            tracer,
            meter,
            labels,
            timeouts,
            default_retry,
        })
    }

    pub fn cluster_labels(&self) -> &Arc<ClusterLabels> {
        &self.labels
    }

    pub fn configuration_cache(&self) -> &Arc<ConfigurationCache> {
        &self.config
    }

    /// Runs `op` and completes `cb` exactly once. Returns immediately.
    pub fn execute<O, F>(self: &Arc<Self>, op: O, cb: F)
    where
        O: KvOperation,
        F: FnOnce(KvResponse<O::Body>) + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let response = this.run(&op).await;
            cb(response);
        });
    }

    /// Async convenience over [`OperationDispatcher::execute`], used by the
    /// compound orchestrators.
    pub async fn execute_async<O>(self: &Arc<Self>, op: O) -> KvResponse<O::Body>
    where
        O: KvOperation,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.execute(op, move |response| {
            let _ = tx.send(response);
        });
        match rx.await {
            Ok(response) => response,
            Err(_) => KvResponse {
                ctx: KeyValueErrorContext::for_id(
                    Default::default(),
                    Some(CommonError::RequestCanceled.into()),
                ),
                result: None,
            },
        }
    }

    fn operation_timeout<O: KvOperation>(&self, op: &O) -> Duration {
        if let Some(timeout) = op.options().timeout {
            return timeout;
        }
        if op.durability() != DurabilityLevel::None {
            self.timeouts.key_value_durable
        } else {
            self.timeouts.key_value
        }
    }

    async fn run<O: KvOperation>(&self, op: &O) -> KvResponse<O::Body> {
        let recorder = ObservabilityRecorder::create(
            op.name(),
            op.options().parent_span.as_ref(),
            &self.tracer,
            &self.meter,
            &self.labels,
        );
        recorder.with_service(SERVICE_KEY_VALUE);
        recorder.with_bucket_name(op.id().bucket());
        recorder.with_scope_name(op.id().scope());
        recorder.with_collection_name(op.id().collection());
        recorder.with_durability(op.durability());

        let mut ctx = KeyValueErrorContext {
            operation_id: Uuid::new_v4().to_string(),
            id: op.id().clone(),
            ..Default::default()
        };

        let deadline = Instant::now() + self.operation_timeout(op);
        let strategy = op
            .options()
            .retry_strategy
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.default_retry));

        let mut attempts: u32 = 0;
        let mut reasons: BTreeSet<RetryReason> = BTreeSet::new();

        let mut config = match tokio::time::timeout_at(
            deadline,
            self.config.bucket_configuration(op.id().bucket()),
        )
        .await
        {
            Err(_) => {
                return self.fail(op, &recorder, ctx, attempts, reasons, CommonError::UnambiguousTimeout.into());
            }
            Ok(Err(error)) => {
                return self.fail(op, &recorder, ctx, attempts, reasons, error);
            }
            Ok(Ok(config)) => config,
        };

        loop {
            let routed = self.route(op, &config);
            let (partition, server) = match routed {
                Ok(target) => target,
                Err(error) => {
                    return self.fail(op, &recorder, ctx, attempts, reasons, error);
                }
            };

            let Some(session) = self.sessions.kv_session(op.id().bucket(), server) else {
                match self
                    .backoff(
                        op,
                        &strategy,
                        RetryReason::NodeNotAvailable,
                        &mut attempts,
                        &mut reasons,
                        deadline,
                    )
                    .await
                {
                    Ok(()) => {
                        config = self.refresh_config(op, config).await;
                        continue;
                    }
                    Err(error) => {
                        let error = if error.is_timeout() {
                            CommonError::UnambiguousTimeout.into()
                        } else {
                            error
                        };
                        return self.fail(op, &recorder, ctx, attempts, reasons, error);
                    }
                }
            };

            let encoding_span = recorder.create_request_encoding_span();
            let opaque = session.next_opaque();
            let frame = RequestFrame {
                opaque,
                partition,
                payload: op.encode(),
            };
            encoding_span.end();

            ctx.opaque = opaque;
            let (local, remote) = session.last_endpoints();
            ctx.last_dispatched_from = Some(local);
            ctx.last_dispatched_to = Some(remote);

            match tokio::time::timeout_at(deadline, session.send(frame)).await {
                Err(_) => {
                    // The frame may have reached the server; the outcome is
                    // unknown.
                    return self.fail(op, &recorder, ctx, attempts, reasons, CommonError::AmbiguousTimeout.into());
                }
                Ok(Err(session_error)) => {
                    let reason = reason_for_session_error(session_error);
                    match reason {
                        Some(reason) => {
                            match self
                                .backoff(op, &strategy, reason, &mut attempts, &mut reasons, deadline)
                                .await
                            {
                                Ok(()) => {
                                    config = self.refresh_config(op, config).await;
                                    continue;
                                }
                                Err(error) => {
                                    // The deadline passing mid-retry is only
                                    // ambiguous when the last write may have
                                    // executed.
                                    let error = if error.is_timeout() {
                                        timeout_error(
                                            reason == RetryReason::SocketClosedWhileInFlight,
                                        )
                                    } else {
                                        session_error
                                    };
                                    return self.fail(op, &recorder, ctx, attempts, reasons, error);
                                }
                            }
                        }
                        None => {
                            return self.fail(op, &recorder, ctx, attempts, reasons, session_error);
                        }
                    }
                }
                Ok(Ok(response)) => {
                    if let Some(reason) = retry_reason_for_status(response.status) {
                        match self
                            .backoff(op, &strategy, reason, &mut attempts, &mut reasons, deadline)
                            .await
                        {
                            Ok(()) => {
                                if reason == RetryReason::KvNotMyVbucket {
                                    config = self.refresh_config(op, config).await;
                                }
                                continue;
                            }
                            Err(error) => {
                                let error = if error.is_timeout() {
                                    CommonError::UnambiguousTimeout.into()
                                } else {
                                    status_to_error(response.status).unwrap_or(error)
                                };
                                self.fill_response_context(&mut ctx, &session, &response);
                                ctx.subdoc = op.subdoc_details(&response);
                                return self.fail(op, &recorder, ctx, attempts, reasons, error);
                            }
                        }
                    }

                    self.fill_response_context(&mut ctx, &session, &response);
                    ctx.subdoc = op.subdoc_details(&response);
                    ctx.retry_attempts = attempts;
                    ctx.retry_reasons = reasons;

                    let result = match op.decode(&response) {
                        Ok(body) => {
                            ctx.ec = None;
                            Some(body)
                        }
                        Err(error) => {
                            ctx.ec = Some(error);
                            None
                        }
                    };
                    recorder.finish(ctx.retry_attempts, ctx.ec);
                    return KvResponse { ctx, result };
                }
            }
        }
    }

    fn route<O: KvOperation>(
        &self,
        op: &O,
        config: &Arc<Configuration>,
    ) -> Result<(u16, usize), Error> {
        let (partition, server) = match op.target_partition() {
            Some(partition) => (partition, config.server_by_vbucket(partition, op.replica_rank())),
            None => config.map_key(op.id().key().as_bytes(), op.replica_rank()),
        };
        match server {
            Some(server) => Ok((partition, server)),
            None => {
                // Either there is no vbucket map yet or the copy at this
                // rank is unassigned; neither can be dispatched.
                debug!(
                    "no server for partition {} rank {} of {}",
                    partition,
                    op.replica_rank(),
                    op.id()
                );
                Err(CommonError::RequestCanceled.into())
            }
        }
    }

    async fn refresh_config<O: KvOperation>(
        &self,
        op: &O,
        current: Arc<Configuration>,
    ) -> Arc<Configuration> {
        self.config
            .current(op.id().bucket())
            .unwrap_or(current)
    }

    /// Consults the retry strategy and sleeps out the backoff. `Ok(())`
    /// means "retry now"; an error means the operation must fail with it.
    async fn backoff<O: KvOperation>(
        &self,
        op: &O,
        strategy: &Arc<dyn RetryStrategy>,
        reason: RetryReason,
        attempts: &mut u32,
        reasons: &mut BTreeSet<RetryReason>,
        deadline: Instant,
    ) -> Result<(), Error> {
        let now = Instant::now();
        let remaining = deadline.saturating_duration_since(now);
        let action = if reason.always_retry() {
            crate::retry::RetryAction::after(controlled_backoff(*attempts))
        } else {
            strategy.should_retry(
                &RetryRequest {
                    operation: op.name(),
                    attempts: *attempts,
                    idempotent: op.is_idempotent(),
                    deadline_remaining: remaining,
                },
                reason,
            )
        };
        let Some(delay) = action.retry_after else {
            return Err(status_like_error(reason));
        };
        if now + delay >= deadline {
            return Err(CommonError::AmbiguousTimeout.into());
        }
        *attempts += 1;
        reasons.insert(reason);
        debug!(
            "retrying {} after {:?} ({})",
            op.name(),
            delay,
            reason
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn fill_response_context(
        &self,
        ctx: &mut KeyValueErrorContext,
        session: &Arc<dyn KvSession>,
        response: &ResponseFrame,
    ) {
        if response.opaque != 0 {
            ctx.opaque = response.opaque;
        }
        ctx.status_code = Some(response.status);
        if response.cas != 0 {
            ctx.cas = Some(response.cas);
        }
        if response.status.0 != 0 {
            ctx.error_map_info = session.error_map_info(response.status.0);
        }
        ctx.extended_error_info = response.extended_error_info.clone();
        let (local, remote) = session.last_endpoints();
        ctx.last_dispatched_from = Some(local);
        ctx.last_dispatched_to = Some(remote);
    }

    fn fail<O: KvOperation>(
        &self,
        _op: &O,
        recorder: &ObservabilityRecorder,
        mut ctx: KeyValueErrorContext,
        attempts: u32,
        reasons: BTreeSet<RetryReason>,
        error: Error,
    ) -> KvResponse<O::Body> {
        ctx.ec = Some(error);
        ctx.retry_attempts = attempts;
        ctx.retry_reasons = reasons;
        recorder.finish(attempts, Some(error));
        KvResponse { ctx, result: None }
    }
}

fn timeout_error(ambiguous: bool) -> Error {
    if ambiguous {
        CommonError::AmbiguousTimeout.into()
    } else {
        CommonError::UnambiguousTimeout.into()
    }
}

/// The error surfaced when the strategy refuses to retry a reason that has
/// no response status of its own.
fn status_like_error(reason: RetryReason) -> Error {
    match reason {
        RetryReason::NodeNotAvailable | RetryReason::ServiceNotAvailable => {
            CommonError::ServiceNotAvailable.into()
        }
        RetryReason::SocketNotAvailable | RetryReason::SocketClosedWhileInFlight => {
            NetworkError::EndOfStream.into()
        }
        RetryReason::KvTemporaryFailure => CommonError::TemporaryFailure.into(),
        RetryReason::KvLocked => cbx_error::KeyValueError::DocumentLocked.into(),
        RetryReason::KvSyncWriteInProgress => {
            cbx_error::KeyValueError::DurableWriteInProgress.into()
        }
        RetryReason::KvSyncWriteReCommitInProgress => {
            cbx_error::KeyValueError::DurableWriteReCommitInProgress.into()
        }
        _ => CommonError::RequestCanceled.into(),
    }
}

fn reason_for_session_error(error: Error) -> Option<RetryReason> {
    match error {
        Error::Network(NetworkError::OperationQueueFull) => Some(RetryReason::SocketNotAvailable),
        Error::Network(NetworkError::EndOfStream) => Some(RetryReason::SocketClosedWhileInFlight),
        Error::Common(CommonError::TemporaryFailure) => Some(RetryReason::KvTemporaryFailure),
        Error::Common(CommonError::ServiceNotAvailable) => Some(RetryReason::ServiceNotAvailable),
        _ => None,
    }
}
