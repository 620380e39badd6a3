// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The public callback surface of the client core.
//!
//! A [`Cluster`] owns the configuration cache, the dispatcher, and the
//! telemetry facades. Every operation takes an owned request and a
//! callback; nothing blocks, and the callback runs exactly once on the
//! tokio executor the cluster was created under.

use std::sync::Arc;

use cbx_error::{CommonError, Error, KeyValueError};
use cbx_signal::{noop_meter, noop_tracer, Meter, Tracer};

use crate::config_cache::{ConfigFetcher, ConfigListener, ConfigurationCache};
use crate::context::KeyValueErrorContext;
use crate::dispatcher::{KvResponse, OperationDispatcher};
use crate::observability::ClusterLabels;
use crate::observe::{self, ObserveRequirements};
use crate::operations::{
    AppendRequest, CounterResult, DecrementRequest, GetAndLockRequest, GetAndTouchRequest,
    GetRequest, GetResult, IncrementRequest, InsertRequest, KvOperation, LookupInRequest,
    LookupInResult, MutateInRequest, MutateInResult, MutationResult, PrependRequest,
    RemoveRequest, ReplaceRequest, TouchRequest, UnlockRequest, UpsertRequest,
};
use crate::options::ClusterOptions;
use crate::protocol::{DurabilityLevel, RangeScanType};
use crate::replica_reads::{
    self, GetAllReplicasRequest, GetAnyReplicaRequest, LookupInAllReplicasRequest,
    LookupInAnyReplicaRequest,
};
use crate::scan::{RangeScanOrchestrator, RangeScanOrchestratorOptions, ScanResult};
use crate::session::SessionManager;

/// The shared internals behind a [`Cluster`] handle.
#[derive(Debug)]
pub struct ClusterCore {
    pub(crate) options: ClusterOptions,
    pub(crate) config: Arc<ConfigurationCache>,
    pub(crate) dispatcher: Arc<OperationDispatcher>,
}

/// A handle on one cluster. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Cluster {
    core: Arc<ClusterCore>,
}

impl Cluster {
    /// Creates a cluster with telemetry disabled.
    pub fn new(
        options: ClusterOptions,
        sessions: Arc<dyn SessionManager>,
        fetcher: Arc<dyn ConfigFetcher>,
    ) -> Cluster {
        Self::with_telemetry(options, sessions, fetcher, noop_tracer(), noop_meter())
    }

    /// Creates a cluster recording spans and metrics through the given
    /// facades.
    pub fn with_telemetry(
        options: ClusterOptions,
        sessions: Arc<dyn SessionManager>,
        fetcher: Arc<dyn ConfigFetcher>,
        tracer: Arc<dyn Tracer>,
        meter: Arc<dyn Meter>,
    ) -> Cluster {
        let config = ConfigurationCache::new(fetcher, options.timeouts.bootstrap);
        let labels = Arc::new(ClusterLabels::default());
        let listener: Arc<dyn ConfigListener> = Arc::clone(&labels) as Arc<dyn ConfigListener>;
        config.register_config_listener(listener);
        let dispatcher = OperationDispatcher::new(
            Arc::clone(&config),
            sessions,
            tracer,
            meter,
            labels,
            options.timeouts.clone(),
            Arc::clone(&options.default_retry_strategy),
        );
        Cluster {
            core: Arc::new(ClusterCore {
                options,
                config,
                dispatcher,
            }),
        }
    }

    /// The configuration cache, where the config fetcher pushes updates.
    pub fn configuration_cache(&self) -> &Arc<ConfigurationCache> {
        &self.core.config
    }

    /// Ensures a bucket is opened; `cb(None)` once the first configuration
    /// arrived.
    pub fn open_bucket(&self, name: &str, cb: impl FnOnce(Option<Error>) + Send + 'static) {
        self.core.config.open_bucket(name, Box::new(cb));
    }

    pub fn get(&self, request: GetRequest, cb: impl FnOnce(KvResponse<GetResult>) + Send + 'static) {
        self.core.dispatcher.execute(request, cb);
    }

    pub fn get_and_lock(
        &self,
        request: GetAndLockRequest,
        cb: impl FnOnce(KvResponse<GetResult>) + Send + 'static,
    ) {
        self.core.dispatcher.execute(request, cb);
    }

    pub fn get_and_touch(
        &self,
        request: GetAndTouchRequest,
        cb: impl FnOnce(KvResponse<GetResult>) + Send + 'static,
    ) {
        self.core.dispatcher.execute(request, cb);
    }

    pub fn touch(
        &self,
        request: TouchRequest,
        cb: impl FnOnce(KvResponse<MutationResult>) + Send + 'static,
    ) {
        self.core.dispatcher.execute(request, cb);
    }

    pub fn unlock(&self, request: UnlockRequest, cb: impl FnOnce(KvResponse<()>) + Send + 'static) {
        self.core.dispatcher.execute(request, cb);
    }

    pub fn insert(
        &self,
        request: InsertRequest,
        cb: impl FnOnce(KvResponse<MutationResult>) + Send + 'static,
    ) {
        let observe = ObserveRequirements {
            persist_to: request.persist_to,
            replicate_to: request.replicate_to,
        };
        self.execute_mutation(request, observe, cb);
    }

    pub fn upsert(
        &self,
        request: UpsertRequest,
        cb: impl FnOnce(KvResponse<MutationResult>) + Send + 'static,
    ) {
        let observe = ObserveRequirements {
            persist_to: request.persist_to,
            replicate_to: request.replicate_to,
        };
        self.execute_mutation(request, observe, cb);
    }

    pub fn replace(
        &self,
        request: ReplaceRequest,
        cb: impl FnOnce(KvResponse<MutationResult>) + Send + 'static,
    ) {
        let observe = ObserveRequirements {
            persist_to: request.persist_to,
            replicate_to: request.replicate_to,
        };
        self.execute_mutation(request, observe, cb);
    }

    pub fn remove(
        &self,
        request: RemoveRequest,
        cb: impl FnOnce(KvResponse<MutationResult>) + Send + 'static,
    ) {
        let observe = ObserveRequirements {
            persist_to: request.persist_to,
            replicate_to: request.replicate_to,
        };
        self.execute_mutation(request, observe, cb);
    }

    pub fn append(
        &self,
        request: AppendRequest,
        cb: impl FnOnce(KvResponse<MutationResult>) + Send + 'static,
    ) {
        self.core.dispatcher.execute(request, cb);
    }

    pub fn prepend(
        &self,
        request: PrependRequest,
        cb: impl FnOnce(KvResponse<MutationResult>) + Send + 'static,
    ) {
        self.core.dispatcher.execute(request, cb);
    }

    pub fn increment(
        &self,
        request: IncrementRequest,
        cb: impl FnOnce(KvResponse<CounterResult>) + Send + 'static,
    ) {
        self.core.dispatcher.execute(request, cb);
    }

    pub fn decrement(
        &self,
        request: DecrementRequest,
        cb: impl FnOnce(KvResponse<CounterResult>) + Send + 'static,
    ) {
        self.core.dispatcher.execute(request, cb);
    }

    pub fn lookup_in(
        &self,
        request: LookupInRequest,
        cb: impl FnOnce(KvResponse<LookupInResult>) + Send + 'static,
    ) {
        self.core.dispatcher.execute(request, cb);
    }

    pub fn mutate_in(
        &self,
        request: MutateInRequest,
        cb: impl FnOnce(KvResponse<MutateInResult>) + Send + 'static,
    ) {
        self.core.dispatcher.execute(request, cb);
    }

    pub fn get_any_replica(
        &self,
        request: GetAnyReplicaRequest,
        cb: impl FnOnce(KvResponse<GetResult>) + Send + 'static,
    ) {
        replica_reads::initiate_get_any_replica(&self.core, request, Box::new(cb));
    }

    pub fn get_all_replicas(
        &self,
        request: GetAllReplicasRequest,
        cb: impl FnOnce(KvResponse<Vec<GetResult>>) + Send + 'static,
    ) {
        replica_reads::initiate_get_all_replicas(&self.core, request, Box::new(cb));
    }

    pub fn lookup_in_any_replica(
        &self,
        request: LookupInAnyReplicaRequest,
        cb: impl FnOnce(KvResponse<LookupInResult>) + Send + 'static,
    ) {
        replica_reads::initiate_lookup_in_any_replica(&self.core, request, Box::new(cb));
    }

    pub fn lookup_in_all_replicas(
        &self,
        request: LookupInAllReplicasRequest,
        cb: impl FnOnce(KvResponse<Vec<LookupInResult>>) + Send + 'static,
    ) {
        replica_reads::initiate_lookup_in_all_replicas(&self.core, request, Box::new(cb));
    }

    /// Starts a range, prefix, or sampling scan over a collection.
    pub fn scan(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
        scan_type: RangeScanType,
        options: RangeScanOrchestratorOptions,
        cb: impl FnOnce(Result<ScanResult, Error>) + Send + 'static,
    ) {
        RangeScanOrchestrator::start(&self.core, bucket, scope, collection, scan_type, options, cb);
    }

    /// Dispatches a mutation, enforcing legacy observe durability when the
    /// caller asked for persist/replicate thresholds. Requesting both a
    /// native durability level and observe thresholds is an error.
    fn execute_mutation<O>(
        &self,
        request: O,
        observe: ObserveRequirements,
        cb: impl FnOnce(KvResponse<MutationResult>) + Send + 'static,
    ) where
        O: KvOperation<Body = MutationResult>,
    {
        if observe.is_empty() {
            return self.core.dispatcher.execute(request, cb);
        }
        if request.durability() != DurabilityLevel::None {
            return cb(KvResponse {
                ctx: KeyValueErrorContext::for_id(
                    request.id().clone(),
                    Some(CommonError::InvalidArgument.into()),
                ),
                result: None,
            });
        }

        let core = Arc::clone(&self.core);
        let id = request.id().clone();
        let timeout = request
            .options()
            .timeout
            .unwrap_or(core.options.timeouts.key_value_durable);
        self.core.dispatcher.execute(request, move |response| {
            if !response.is_success() {
                return cb(response);
            }
            let Some(token) = response.result.as_ref().and_then(|r| r.token.clone()) else {
                // Without a mutation token the observe poll cannot identify
                // the mutation.
                let mut response = response;
                response.ctx.ec = Some(KeyValueError::MutationTokenOutdated.into());
                response.result = None;
                return cb(response);
            };
            tokio::spawn(async move {
                let outcome =
                    observe::enforce_requirements(core, id, token, observe, timeout).await;
                match outcome {
                    None => cb(response),
                    Some(error) => {
                        let mut response = response;
                        // The mutation itself happened; keep its CAS while
                        // reporting the durability failure.
                        if let Some(result) = &response.result {
                            response.ctx.cas = Some(result.cas);
                        }
                        response.ctx.ec = Some(error);
                        response.result = None;
                        cb(response);
                    }
                }
            });
        });
    }
}
