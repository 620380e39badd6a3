// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A sink that drains the signal bridge to a JSON-lines writer.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::api::{Meter, Span, SpanContext, TagValue, Tracer, ValueRecorder};
use crate::bridge::{SignalBridge, SignalBridgeOptions};
use crate::data::{LogEntry, MetricMeasurement, SignalAttribute, SignalData, TraceSpan};

thread_local! {
    static ID_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

fn generate_span_id() -> String {
    ID_RNG.with(|rng| format!("{:016x}", rng.borrow_mut().gen::<u64>()))
}

fn generate_trace_id() -> String {
    ID_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
    })
}

/// Tuning knobs for a [`FileSignalSink`].
#[derive(Debug, Clone)]
pub struct FileSignalSinkOptions {
    /// How long the worker blocks waiting for the bridge before re-checking
    /// for shutdown.
    pub wait_interval: Duration,
    pub bridge: SignalBridgeOptions,
}

impl Default for FileSignalSinkOptions {
    fn default() -> Self {
        FileSignalSinkOptions {
            wait_interval: Duration::from_millis(100),
            bridge: SignalBridgeOptions::default(),
        }
    }
}

struct SinkShared {
    bridge: Arc<SignalBridge>,
    output: Mutex<Box<dyn Write + Send>>,
    running: AtomicBool,
}

impl std::fmt::Debug for SinkShared {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SinkShared")
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl SinkShared {
    fn write_all(&self, mut data: std::collections::VecDeque<SignalData>) {
        let mut output = self.output.lock().expect("poisoned");
        while let Some(record) = data.pop_front() {
            if record.is_empty() {
                continue;
            }
            if let Err(error) = writeln!(output, "{}", record) {
                warn!("failed to write telemetry record: {}", error);
                return;
            }
        }
    }

    fn flush(&self) {
        if let Err(error) = self.output.lock().expect("poisoned").flush() {
            warn!("failed to flush telemetry output: {}", error);
        }
    }
}

/// A tracer/meter provider that serializes every span and metric sample as
/// one JSON object per line.
///
/// The sink owns the facades; spans hand records to the [`SignalBridge`]
/// and a background worker thread drains the bridge to the writer. Dropping
/// the sink stops the worker, drains whatever is buffered, and flushes the
/// output.
#[derive(Debug)]
pub struct FileSignalSink {
    shared: Arc<SinkShared>,
    wait_interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileSignalSink {
    pub fn new(output: Box<dyn Write + Send>) -> Self {
        Self::with_options(output, FileSignalSinkOptions::default())
    }

    pub fn with_options(output: Box<dyn Write + Send>, options: FileSignalSinkOptions) -> Self {
        FileSignalSink {
            shared: Arc::new(SinkShared {
                bridge: Arc::new(SignalBridge::new(options.bridge)),
                output: Mutex::new(output),
                running: AtomicBool::new(false),
            }),
            wait_interval: options.wait_interval,
            worker: Mutex::new(None),
        }
    }

    /// Starts the drain worker. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("poisoned");
        if worker.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let wait_interval = self.wait_interval;
        *worker = Some(std::thread::spawn(move || {
            while shared.running.load(Ordering::SeqCst) {
                let data = shared.bridge.wait_for_buffer_ready(wait_interval);
                shared.write_all(data);
            }
            shared.write_all(shared.bridge.take_buffer());
            shared.flush();
        }));
    }

    /// Stops the drain worker, draining buffered records first. Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let worker = self.worker.lock().expect("poisoned").take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("telemetry sink worker panicked");
            }
        }
    }

    pub fn tracer(&self) -> Arc<dyn Tracer> {
        Arc::new(FileTracer {
            bridge: Arc::clone(&self.shared.bridge),
        })
    }

    pub fn meter(&self) -> Arc<dyn Meter> {
        Arc::new(FileMeter {
            bridge: Arc::clone(&self.shared.bridge),
        })
    }

    /// Enqueues a log record onto the bridge.
    pub fn emit_log(&self, entry: LogEntry) {
        self.shared.bridge.emplace(SignalData::from(entry));
    }
}

impl Drop for FileSignalSink {
    fn drop(&mut self) {
        self.stop();
        self.shared.write_all(self.shared.bridge.take_buffer());
        self.shared.flush();
    }
}

#[derive(Debug)]
struct FileTracer {
    bridge: Arc<SignalBridge>,
}

impl Tracer for FileTracer {
    fn create_span(&self, name: &str, parent: Option<&Arc<dyn Span>>) -> Arc<dyn Span> {
        let mut span = TraceSpan {
            name: name.to_string(),
            span_id: generate_span_id(),
            start_time: SystemTime::now(),
            ..Default::default()
        };
        match parent.map(|parent| parent.context()) {
            Some(context) if !context.trace_id.is_empty() => {
                span.trace_id = context.trace_id;
                span.parent_id = context.span_id;
            }
            _ => span.trace_id = generate_trace_id(),
        }
        Arc::new(FileSpan {
            bridge: Arc::clone(&self.bridge),
            state: Mutex::new(FileSpanState { span, ended: false }),
        })
    }
}

#[derive(Debug)]
struct FileSpanState {
    span: TraceSpan,
    ended: bool,
}

#[derive(Debug)]
struct FileSpan {
    bridge: Arc<SignalBridge>,
    state: Mutex<FileSpanState>,
}

impl Span for FileSpan {
    fn add_tag(&self, name: &str, value: TagValue) {
        let mut state = self.state.lock().expect("poisoned");
        if state.ended {
            return;
        }
        state
            .span
            .attributes
            .push(SignalAttribute::new(name, value.render()));
    }

    fn end(&self) {
        let mut state = self.state.lock().expect("poisoned");
        if state.ended {
            return;
        }
        state.ended = true;
        state.span.end_time = SystemTime::now();
        let span = std::mem::take(&mut state.span);
        self.bridge.emplace(SignalData::from(span));
    }

    fn context(&self) -> SpanContext {
        let state = self.state.lock().expect("poisoned");
        SpanContext {
            trace_id: state.span.trace_id.clone(),
            span_id: state.span.span_id.clone(),
        }
    }
}

#[derive(Debug)]
struct FileMeter {
    bridge: Arc<SignalBridge>,
}

impl Meter for FileMeter {
    fn value_recorder(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Arc<dyn ValueRecorder> {
        let attributes = tags
            .iter()
            .map(|(name, value)| SignalAttribute::new(name.clone(), value.clone()))
            .collect();
        Arc::new(FileValueRecorder {
            bridge: Arc::clone(&self.bridge),
            name: name.to_string(),
            attributes,
        })
    }
}

#[derive(Debug)]
struct FileValueRecorder {
    bridge: Arc<SignalBridge>,
    name: String,
    attributes: Vec<SignalAttribute>,
}

impl ValueRecorder for FileValueRecorder {
    fn record_value(&self, value: i64) {
        self.bridge.emplace(SignalData::from(MetricMeasurement::new(
            self.name.clone(),
            value,
            self.attributes.clone(),
        )));
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn span_ids_have_the_documented_widths() {
        assert_eq!(generate_span_id().len(), 16);
        assert_eq!(generate_trace_id().len(), 32);
        assert!(generate_span_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn child_spans_inherit_the_trace() {
        let sink = FileSignalSink::new(Box::new(std::io::sink()));
        let tracer = sink.tracer();
        let parent = tracer.create_span("get", None);
        let child = tracer.create_span("request_encoding", Some(&parent));
        assert_eq!(child.context().trace_id, parent.context().trace_id);
        assert_ne!(child.context().span_id, parent.context().span_id);
    }

    #[test]
    fn ending_twice_records_once() {
        let sink = FileSignalSink::new(Box::new(std::io::sink()));
        let tracer = sink.tracer();
        let span = tracer.create_span("get", None);
        span.end();
        span.end();
        assert_eq!(sink.shared.bridge.len(), 1);
    }

    #[test]
    fn sink_writes_json_lines() -> Result<(), anyhow::Error> {
        let file = tempfile::NamedTempFile::new()?;
        let sink = FileSignalSink::new(Box::new(file.reopen()?));
        sink.start();

        let tracer = sink.tracer();
        let span = tracer.create_span("get", None);
        span.add_tag("couchbase.service", TagValue::from("kv"));
        span.end();

        let meter = sink.meter();
        let tags = BTreeMap::from([("outcome".to_string(), "Success".to_string())]);
        meter.value_recorder("db.couchbase.operations", &tags).record_value(125);

        sink.stop();

        let mut contents = String::new();
        file.reopen()?.read_to_string(&mut contents)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let span_line: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(span_line["name"], "get");
        assert_eq!(span_line["context"]["span_id"].as_str().unwrap().len(), 16);
        assert_eq!(span_line["context"]["trace_id"].as_str().unwrap().len(), 32);

        let metric_line: serde_json::Value = serde_json::from_str(lines[1])?;
        assert_eq!(metric_line["name"], "db.couchbase.operations");
        assert_eq!(metric_line["value"], 125);
        assert_eq!(metric_line["attributes"][0]["name"], "outcome");
        Ok(())
    }
}
