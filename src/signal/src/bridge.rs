// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The bounded queue between signal producers and the sink worker.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::data::SignalData;

/// Tuning knobs for a [`SignalBridge`].
#[derive(Debug, Clone)]
pub struct SignalBridgeOptions {
    /// Records beyond this queue size are dropped.
    pub buffer_limit: usize,
    /// Fraction of `buffer_limit` at which a waiter is woken.
    pub notification_threshold: f64,
}

impl SignalBridgeOptions {
    pub const DEFAULT_BUFFER_LIMIT: usize = 10_000;
    pub const DEFAULT_NOTIFICATION_THRESHOLD: f64 = 0.7;

    pub fn buffer_limit(mut self, buffer_limit: usize) -> Self {
        self.buffer_limit = buffer_limit;
        self
    }

    pub fn notification_threshold(mut self, notification_threshold: f64) -> Self {
        self.notification_threshold = notification_threshold;
        self
    }
}

impl Default for SignalBridgeOptions {
    fn default() -> Self {
        SignalBridgeOptions {
            buffer_limit: Self::DEFAULT_BUFFER_LIMIT,
            notification_threshold: Self::DEFAULT_NOTIFICATION_THRESHOLD,
        }
    }
}

/// A bounded, lossy, multi-producer queue of [`SignalData`] with
/// threshold-based wake-up.
///
/// Producers call [`SignalBridge::emplace`]; the record is dropped when the
/// queue is full. A consumer blocks in
/// [`SignalBridge::wait_for_buffer_ready`] and is woken once the queue
/// reaches `notification_threshold * buffer_limit` records; a timed-out wait
/// returns an empty queue so the consumer batches implicitly instead of
/// draining tiny buffers.
#[derive(Debug)]
pub struct SignalBridge {
    buffer_limit: usize,
    notification_threshold: f64,
    buffer: Mutex<VecDeque<SignalData>>,
    buffer_ready: Condvar,
}

impl SignalBridge {
    pub fn new(options: SignalBridgeOptions) -> Self {
        SignalBridge {
            buffer_limit: options.buffer_limit,
            notification_threshold: options.notification_threshold,
            buffer: Mutex::new(VecDeque::new()),
            buffer_ready: Condvar::new(),
        }
    }

    /// Adds a record to the queue, dropping it when the queue is full.
    pub fn emplace(&self, data: SignalData) {
        let mut buffer = self.buffer.lock().expect("poisoned");
        if buffer.len() < self.buffer_limit {
            buffer.push_back(data);
        }
        let threshold = (self.buffer_limit as f64 * self.notification_threshold) as usize;
        if buffer.len() >= threshold {
            self.buffer_ready.notify_one();
        }
    }

    /// Blocks until woken or `interval` elapses. Returns the drained queue
    /// when woken; returns an empty queue on timeout, leaving buffered
    /// records in place.
    pub fn wait_for_buffer_ready(&self, interval: Duration) -> VecDeque<SignalData> {
        let buffer = self.buffer.lock().expect("poisoned");
        let (mut buffer, result) = self
            .buffer_ready
            .wait_timeout(buffer, interval)
            .expect("poisoned");
        if result.timed_out() {
            return VecDeque::new();
        }
        std::mem::take(&mut *buffer)
    }

    /// Drains the queue synchronously. Called at shutdown so buffered
    /// records are not lost.
    pub fn take_buffer(&self) -> VecDeque<SignalData> {
        let mut buffer = self.buffer.lock().expect("poisoned");
        std::mem::take(&mut *buffer)
    }

    /// The current queue size, for tests and introspection.
    pub fn len(&self) -> usize {
        self.buffer.lock().expect("poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
