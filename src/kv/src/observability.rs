// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Span and metric attribution for dispatched operations.
//!
//! Every operation owns an [`ObservabilityRecorder`]: it opens the
//! operation span, collects the attributes that end up on both the span and
//! the duration metric, and on `finish` records one sample of
//! `db.couchbase.operations` tagged with a standardized outcome label.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use cbx_error::{Error, FieldLevelEncryptionError};
use cbx_signal::{Meter, Span, TagValue, Tracer};
use cbx_topology::Configuration;

use crate::config_cache::ConfigListener;
use crate::protocol::DurabilityLevel;

/// Span attribute names, aligned with the semantic conventions the server
/// tooling expects.
pub mod attributes {
    pub const SYSTEM: &str = "db.system.name";
    pub const CLUSTER_NAME: &str = "couchbase.cluster.name";
    pub const CLUSTER_UUID: &str = "couchbase.cluster.uuid";
    pub const SERVICE: &str = "couchbase.service";
    pub const OPERATION_NAME: &str = "db.operation.name";
    pub const BUCKET_NAME: &str = "db.namespace";
    pub const SCOPE_NAME: &str = "couchbase.scope.name";
    pub const COLLECTION_NAME: &str = "couchbase.collection.name";
    pub const DURABILITY_LEVEL: &str = "couchbase.durability";
    pub const RETRY_COUNT: &str = "couchbase.retries";
    pub const QUERY_STATEMENT: &str = "db.query.text";
}

/// The span name of the request-encoding step.
pub const STEP_REQUEST_ENCODING: &str = "request_encoding";
/// The service label for key-value operations.
pub const SERVICE_KEY_VALUE: &str = "kv";
/// The operation-duration metric.
pub const METER_NAME: &str = "db.couchbase.operations";

const SYSTEM_NAME: &str = "couchbase";

fn snake_case_to_camel_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut capitalize = true;
    for c in s.chars() {
        if c == '_' {
            capitalize = true;
            continue;
        }
        if capitalize {
            result.extend(c.to_uppercase());
            capitalize = false;
        } else {
            result.push(c);
        }
    }
    result
}

/// The standardized outcome label for the duration metric: `Success`, a
/// CamelCase error name, or a hard-coded override for SDK-internal and
/// cryptography errors.
pub fn standardized_outcome(ec: Option<Error>) -> String {
    let Some(error) = ec else {
        return "Success".to_string();
    };
    if error.code() >= 1000 {
        return "CouchbaseError".to_string();
    }
    if error
        == Error::FieldLevelEncryption(FieldLevelEncryptionError::GenericCryptographyFailure)
    {
        return "CryptoError".to_string();
    }
    snake_case_to_camel_case(&error.name())
}

/// Cluster name and uuid learned from accepted configuration updates, so
/// metrics can be attributed even though operations never see the raw
/// configuration.
#[derive(Debug, Default)]
pub struct ClusterLabels {
    inner: RwLock<(Option<String>, Option<String>)>,
}

impl ClusterLabels {
    pub fn get(&self) -> (Option<String>, Option<String>) {
        self.inner.read().expect("poisoned").clone()
    }
}

impl ConfigListener for ClusterLabels {
    fn config_updated(&self, config: &Arc<Configuration>) {
        let mut inner = self.inner.write().expect("poisoned");
        if config.cluster_name.is_some() {
            inner.0 = config.cluster_name.clone();
        }
        if config.cluster_uuid.is_some() {
            inner.1 = config.cluster_uuid.clone();
        }
    }
}

/// The attributes recorded on the operation-duration metric.
#[derive(Debug, Clone, Default)]
pub struct MetricAttributes {
    pub service: String,
    pub operation: String,
    pub ec: Option<Error>,
    pub bucket_name: Option<String>,
    pub scope_name: Option<String>,
    pub collection_name: Option<String>,
    pub cluster_name: Option<String>,
    pub cluster_uuid: Option<String>,
}

impl MetricAttributes {
    pub fn encode(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::from([
            ("db.couchbase.service".to_string(), self.service.clone()),
            ("db.operation".to_string(), self.operation.clone()),
            ("outcome".to_string(), standardized_outcome(self.ec)),
        ]);
        if let Some(cluster_name) = &self.cluster_name {
            tags.insert("db.couchbase.cluster_name".to_string(), cluster_name.clone());
        }
        if let Some(cluster_uuid) = &self.cluster_uuid {
            tags.insert("db.couchbase.cluster_uuid".to_string(), cluster_uuid.clone());
        }
        if let Some(bucket_name) = &self.bucket_name {
            tags.insert("db.name".to_string(), bucket_name.clone());
        }
        if let Some(scope_name) = &self.scope_name {
            tags.insert("db.couchbase.scope".to_string(), scope_name.clone());
        }
        if let Some(collection_name) = &self.collection_name {
            tags.insert("db.couchbase.collection".to_string(), collection_name.clone());
        }
        tags
    }
}

/// The per-operation span plus metric recorder.
pub struct ObservabilityRecorder {
    op_name: String,
    tracer: Arc<dyn Tracer>,
    meter: Arc<dyn Meter>,
    labels: Arc<ClusterLabels>,
    span: Arc<dyn Span>,
    start: Instant,
    attrs: Mutex<MetricAttributes>,
}

impl std::fmt::Debug for ObservabilityRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ObservabilityRecorder")
            .field("op_name", &self.op_name)
            .finish_non_exhaustive()
    }
}

impl ObservabilityRecorder {
    pub fn create(
        op_name: &str,
        parent_span: Option<&Arc<dyn Span>>,
        tracer: &Arc<dyn Tracer>,
        meter: &Arc<dyn Meter>,
        labels: &Arc<ClusterLabels>,
    ) -> Self {
        let span = tracer.create_span(op_name, parent_span);
        if span.is_recording() {
            span.add_tag(attributes::SYSTEM, TagValue::from(SYSTEM_NAME));
            span.add_tag(attributes::OPERATION_NAME, TagValue::from(op_name));
            let (cluster_name, cluster_uuid) = labels.get();
            if let Some(cluster_name) = cluster_name {
                span.add_tag(attributes::CLUSTER_NAME, TagValue::from(cluster_name));
            }
            if let Some(cluster_uuid) = cluster_uuid {
                span.add_tag(attributes::CLUSTER_UUID, TagValue::from(cluster_uuid));
            }
        }
        ObservabilityRecorder {
            op_name: op_name.to_string(),
            tracer: Arc::clone(tracer),
            meter: Arc::clone(meter),
            labels: Arc::clone(labels),
            span,
            start: Instant::now(),
            attrs: Mutex::new(MetricAttributes {
                operation: op_name.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn operation_span(&self) -> &Arc<dyn Span> {
        &self.span
    }

    /// Opens the child span covering the request-encoding step.
    pub fn create_request_encoding_span(&self) -> Arc<dyn Span> {
        self.tracer
            .create_span(STEP_REQUEST_ENCODING, Some(&self.span))
    }

    /// A recorder for a sub-operation, parented under this operation's
    /// span.
    pub fn record_suboperation(&self, subop_name: &str) -> ObservabilityRecorder {
        ObservabilityRecorder::create(
            subop_name,
            Some(&self.span),
            &self.tracer,
            &self.meter,
            &self.labels,
        )
    }

    pub fn with_service(&self, service: &str) {
        self.attrs.lock().expect("poisoned").service = service.to_string();
        if self.span.is_recording() {
            self.span.add_tag(attributes::SERVICE, TagValue::from(service));
        }
    }

    pub fn with_bucket_name(&self, bucket_name: &str) {
        self.attrs.lock().expect("poisoned").bucket_name = Some(bucket_name.to_string());
        if self.span.is_recording() {
            self.span
                .add_tag(attributes::BUCKET_NAME, TagValue::from(bucket_name));
        }
    }

    pub fn with_scope_name(&self, scope_name: &str) {
        self.attrs.lock().expect("poisoned").scope_name = Some(scope_name.to_string());
        if self.span.is_recording() {
            self.span
                .add_tag(attributes::SCOPE_NAME, TagValue::from(scope_name));
        }
    }

    pub fn with_collection_name(&self, collection_name: &str) {
        self.attrs.lock().expect("poisoned").collection_name = Some(collection_name.to_string());
        if self.span.is_recording() {
            self.span
                .add_tag(attributes::COLLECTION_NAME, TagValue::from(collection_name));
        }
    }

    pub fn with_durability(&self, durability: DurabilityLevel) {
        if durability == DurabilityLevel::None {
            return;
        }
        if self.span.is_recording() {
            self.span.add_tag(
                attributes::DURABILITY_LEVEL,
                TagValue::from(durability.to_string()),
            );
        }
    }

    /// Records the statement text, only when the statement carries
    /// parameters.
    pub fn with_query_statement(&self, statement: &str, has_parameters: bool) {
        if !has_parameters {
            return;
        }
        if self.span.is_recording() {
            self.span
                .add_tag(attributes::QUERY_STATEMENT, TagValue::from(statement));
        }
    }

    /// Ends the operation span and records the duration metric, tagged with
    /// the outcome derived from `ec` and the retry count.
    pub fn finish(&self, retry_attempts: u32, ec: Option<Error>) {
        if self.span.is_recording() {
            self.span.add_tag(
                attributes::RETRY_COUNT,
                TagValue::from(u64::from(retry_attempts)),
            );
        }
        let mut attrs = self.attrs.lock().expect("poisoned").clone();
        attrs.ec = ec;
        let (cluster_name, cluster_uuid) = self.labels.get();
        attrs.cluster_name = cluster_name;
        attrs.cluster_uuid = cluster_uuid;
        let micros =
            i64::try_from(self.start.elapsed().as_micros()).unwrap_or(i64::MAX);
        self.meter
            .value_recorder(METER_NAME, &attrs.encode())
            .record_value(micros);
        self.span.end();
    }
}

#[cfg(test)]
mod tests {
    use cbx_error::{CommonError, KeyValueError, NetworkError};

    use super::*;

    #[test]
    fn outcomes_are_camel_cased() {
        assert_eq!(standardized_outcome(None), "Success");
        assert_eq!(
            standardized_outcome(Some(KeyValueError::DocumentNotFound.into())),
            "DocumentNotFound"
        );
        assert_eq!(
            standardized_outcome(Some(CommonError::AmbiguousTimeout.into())),
            "AmbiguousTimeout"
        );
    }

    #[test]
    fn sdk_internal_errors_collapse_to_couchbase_error() {
        assert_eq!(
            standardized_outcome(Some(NetworkError::ProtocolError.into())),
            "CouchbaseError"
        );
        assert_eq!(
            standardized_outcome(Some(NetworkError::BucketClosed.into())),
            "CouchbaseError"
        );
    }

    #[test]
    fn crypto_failures_have_a_dedicated_outcome() {
        assert_eq!(
            standardized_outcome(Some(
                FieldLevelEncryptionError::GenericCryptographyFailure.into()
            )),
            "CryptoError"
        );
        assert_eq!(
            standardized_outcome(Some(FieldLevelEncryptionError::EncryptionFailure.into())),
            "EncryptionFailure"
        );
    }

    #[test]
    fn metric_tags_include_namespace_when_known() {
        let attrs = MetricAttributes {
            service: SERVICE_KEY_VALUE.to_string(),
            operation: "get".to_string(),
            ec: None,
            bucket_name: Some("travel-sample".to_string()),
            scope_name: Some("inventory".to_string()),
            collection_name: Some("airline".to_string()),
            cluster_name: None,
            cluster_uuid: None,
        };
        let tags = attrs.encode();
        assert_eq!(tags["db.couchbase.service"], "kv");
        assert_eq!(tags["db.operation"], "get");
        assert_eq!(tags["outcome"], "Success");
        assert_eq!(tags["db.name"], "travel-sample");
        assert_eq!(tags["db.couchbase.scope"], "inventory");
        assert_eq!(tags["db.couchbase.collection"], "airline");
        assert!(!tags.contains_key("db.couchbase.cluster_name"));
    }
}
