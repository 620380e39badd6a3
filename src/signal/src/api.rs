// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tracer and meter facades consumed by the operation dispatcher.
//!
//! Implementations are pluggable; the crate ships [`FileSignalSink`]
//! (see [`crate::sink`]) and no-op variants for clusters that disable
//! telemetry.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// The identifiers correlating a span with its trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
}

/// A value attachable to a span attribute.
#[derive(Debug, Clone)]
pub enum TagValue {
    Str(String),
    U64(u64),
    I64(i64),
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Str(value)
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        TagValue::U64(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::I64(value)
    }
}

impl TagValue {
    pub fn render(&self) -> String {
        match self {
            TagValue::Str(s) => s.clone(),
            TagValue::U64(v) => v.to_string(),
            TagValue::I64(v) => v.to_string(),
        }
    }
}

/// An in-flight span. `end` is idempotent; tags added after `end` are
/// discarded.
pub trait Span: Debug + Send + Sync {
    fn add_tag(&self, name: &str, value: TagValue);
    fn end(&self);
    fn context(&self) -> SpanContext;
    /// Whether the span records tags at all; lets hot paths skip attribute
    /// formatting for no-op tracers.
    fn is_recording(&self) -> bool {
        true
    }
}

/// Creates spans. A child span inherits its parent's trace id and records
/// the parent's span id.
pub trait Tracer: Debug + Send + Sync {
    fn create_span(&self, name: &str, parent: Option<&Arc<dyn Span>>) -> Arc<dyn Span>;
}

/// Records samples of one named metric with a fixed tag set.
pub trait ValueRecorder: Debug + Send + Sync {
    fn record_value(&self, value: i64);
}

/// Hands out value recorders.
pub trait Meter: Debug + Send + Sync {
    fn value_recorder(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Arc<dyn ValueRecorder>;
}

#[derive(Debug)]
struct NoopSpan;

impl Span for NoopSpan {
    fn add_tag(&self, _name: &str, _value: TagValue) {}

    fn end(&self) {}

    fn context(&self) -> SpanContext {
        SpanContext::default()
    }

    fn is_recording(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct NoopTracer;

impl Tracer for NoopTracer {
    fn create_span(&self, _name: &str, _parent: Option<&Arc<dyn Span>>) -> Arc<dyn Span> {
        Arc::new(NoopSpan)
    }
}

#[derive(Debug)]
struct NoopValueRecorder;

impl ValueRecorder for NoopValueRecorder {
    fn record_value(&self, _value: i64) {}
}

#[derive(Debug)]
struct NoopMeter;

impl Meter for NoopMeter {
    fn value_recorder(
        &self,
        _name: &str,
        _tags: &BTreeMap<String, String>,
    ) -> Arc<dyn ValueRecorder> {
        Arc::new(NoopValueRecorder)
    }
}

/// A tracer that records nothing.
pub fn noop_tracer() -> Arc<dyn Tracer> {
    Arc::new(NoopTracer)
}

/// A meter that records nothing.
pub fn noop_meter() -> Arc<dyn Meter> {
    Arc::new(NoopMeter)
}
