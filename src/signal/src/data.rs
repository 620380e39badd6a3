// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The signal record types carried by the bridge.

use std::fmt;
use std::time::SystemTime;

use serde_json::{json, Value};

use crate::time::format_system_time;

/// A single key/value attribute attached to a span, metric, or log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalAttribute {
    pub name: String,
    pub value: String,
}

impl SignalAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        SignalAttribute {
            name: name.into(),
            value: value.into(),
        }
    }

    fn to_json(&self) -> Value {
        json!({ "name": self.name, "value": self.value })
    }
}

fn attributes_to_json(attributes: &[SignalAttribute]) -> Value {
    Value::Array(attributes.iter().map(SignalAttribute::to_json).collect())
}

/// A point-in-time event recorded inside a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub name: String,
    pub timestamp: SystemTime,
    pub attributes: Vec<SignalAttribute>,
}

/// A finished trace span.
///
/// `trace_id` is 32 hex digits and `span_id` 16; a child span carries its
/// parent's trace id and records the parent's span id in `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSpan {
    pub name: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_id: String,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub attributes: Vec<SignalAttribute>,
    pub events: Vec<TraceEvent>,
}

impl Default for TraceSpan {
    fn default() -> Self {
        TraceSpan {
            name: String::new(),
            trace_id: String::new(),
            span_id: String::new(),
            parent_id: String::new(),
            start_time: SystemTime::UNIX_EPOCH,
            end_time: SystemTime::UNIX_EPOCH,
            attributes: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl TraceSpan {
    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "context": { "trace_id": self.trace_id, "span_id": self.span_id },
            "parent_id": self.parent_id,
            "start_time": format_system_time(self.start_time),
            "end_time": format_system_time(self.end_time),
            "attributes": attributes_to_json(&self.attributes),
            "events": Value::Array(
                self.events
                    .iter()
                    .map(|event| {
                        json!({
                            "name": event.name,
                            "timestamp": format_system_time(event.timestamp),
                            "attributes": attributes_to_json(&event.attributes),
                        })
                    })
                    .collect(),
            ),
        })
    }
}

/// The value of a metric sample: int64 or double.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int64(i64),
    Double(f64),
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Int64(value)
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Double(value)
    }
}

/// One metric sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricMeasurement {
    pub name: String,
    pub value: MetricValue,
    pub attributes: Vec<SignalAttribute>,
}

impl MetricMeasurement {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<MetricValue>,
        attributes: Vec<SignalAttribute>,
    ) -> Self {
        MetricMeasurement {
            name: name.into(),
            value: value.into(),
            attributes,
        }
    }

    pub fn is_int64(&self) -> bool {
        matches!(self.value, MetricValue::Int64(_))
    }

    pub fn is_double(&self) -> bool {
        matches!(self.value, MetricValue::Double(_))
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self.value {
            MetricValue::Int64(v) => Some(v),
            MetricValue::Double(_) => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self.value {
            MetricValue::Double(v) => Some(v),
            MetricValue::Int64(_) => None,
        }
    }

    fn to_json(&self) -> Value {
        let value = match self.value {
            MetricValue::Int64(v) => json!(v),
            MetricValue::Double(v) => json!(v),
        };
        json!({
            "name": self.name,
            "value": value,
            "attributes": attributes_to_json(&self.attributes),
        })
    }
}

/// One log record, already formatted and correlated to a span.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub severity: String,
    pub message: String,
    pub trace_id: String,
    pub span_id: String,
    pub attributes: Vec<SignalAttribute>,
}

impl LogEntry {
    fn to_json(&self) -> Value {
        json!({
            "timestamp": self.timestamp,
            "severity": self.severity,
            "message": self.message,
            "context": { "trace_id": self.trace_id, "span_id": self.span_id },
            "attributes": attributes_to_json(&self.attributes),
        })
    }
}

/// Any record the bridge can carry. Moving the payload out with
/// [`SignalData::take`] leaves [`SignalData::Empty`] behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SignalData {
    #[default]
    Empty,
    TraceSpan(TraceSpan),
    MetricMeasurement(MetricMeasurement),
    LogEntry(LogEntry),
}

impl SignalData {
    pub fn is_empty(&self) -> bool {
        matches!(self, SignalData::Empty)
    }

    pub fn is_trace_span(&self) -> bool {
        matches!(self, SignalData::TraceSpan(_))
    }

    pub fn is_metric_measurement(&self) -> bool {
        matches!(self, SignalData::MetricMeasurement(_))
    }

    pub fn is_log_entry(&self) -> bool {
        matches!(self, SignalData::LogEntry(_))
    }

    /// Moves the record out, leaving [`SignalData::Empty`].
    pub fn take(&mut self) -> SignalData {
        std::mem::take(self)
    }

    pub fn into_trace_span(self) -> Option<TraceSpan> {
        match self {
            SignalData::TraceSpan(span) => Some(span),
            _ => None,
        }
    }

    pub fn into_metric_measurement(self) -> Option<MetricMeasurement> {
        match self {
            SignalData::MetricMeasurement(measurement) => Some(measurement),
            _ => None,
        }
    }

    pub fn into_log_entry(self) -> Option<LogEntry> {
        match self {
            SignalData::LogEntry(entry) => Some(entry),
            _ => None,
        }
    }

    /// The JSON rendering written by the file sink: one object, no
    /// trailing newline.
    pub fn to_json(&self) -> Value {
        match self {
            SignalData::Empty => Value::Null,
            SignalData::TraceSpan(span) => span.to_json(),
            SignalData::MetricMeasurement(measurement) => measurement.to_json(),
            SignalData::LogEntry(entry) => entry.to_json(),
        }
    }
}

impl From<TraceSpan> for SignalData {
    fn from(span: TraceSpan) -> Self {
        SignalData::TraceSpan(span)
    }
}

impl From<MetricMeasurement> for SignalData {
    fn from(measurement: MetricMeasurement) -> Self {
        SignalData::MetricMeasurement(measurement)
    }
}

impl From<LogEntry> for SignalData {
    fn from(entry: LogEntry) -> Self {
        SignalData::LogEntry(entry)
    }
}

impl fmt::Display for SignalData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}
