// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Telemetry signals and their transport.
//!
//! Operations record trace spans and duration metrics through the
//! [`Tracer`] and [`Meter`] facades. The built-in implementation of both is
//! the [`FileSignalSink`]: spans and measurements are funneled through a
//! bounded, lossy [`SignalBridge`] and drained by a background worker that
//! writes one JSON object per line.
//!
//! Ownership is deliberately one-way: the sink owns the tracer and meter
//! facades, and spans hold a handle to the *bridge* only, so no reference
//! cycle between sink, tracer, and spans can form.

mod api;
mod bridge;
mod data;
mod sink;
mod time;

pub use crate::api::{noop_meter, noop_tracer, Meter, Span, SpanContext, TagValue, Tracer, ValueRecorder};
pub use crate::bridge::{SignalBridge, SignalBridgeOptions};
pub use crate::data::{
    LogEntry, MetricMeasurement, MetricValue, SignalAttribute, SignalData, TraceEvent, TraceSpan,
};
pub use crate::sink::{FileSignalSink, FileSignalSinkOptions};
pub use crate::time::{format_system_time, to_iso8601_utc};
