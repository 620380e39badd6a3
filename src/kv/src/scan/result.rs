// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The lazy item sequence a range scan resolves to.

use std::sync::{Arc, Mutex as StdMutex};

use cbx_error::{CommonError, Error, KeyValueError};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::cancellation::CancellationToken;
use crate::protocol::RangeScanItem;

#[derive(Debug)]
pub(crate) struct ScanResultShared {
    /// `None` once the stream is drained or cancelled.
    items: Mutex<Option<mpsc::Receiver<RangeScanItem>>>,
    /// The error `next` resolves with once no more items will arrive.
    terminal: StdMutex<Option<Error>>,
    cancel_notify: Notify,
}

impl ScanResultShared {
    pub(crate) fn new(items: mpsc::Receiver<RangeScanItem>) -> Arc<Self> {
        Arc::new(ScanResultShared {
            items: Mutex::new(Some(items)),
            terminal: StdMutex::new(None),
            cancel_notify: Notify::new(),
        })
    }

    /// Sets the terminal error if none is set yet.
    pub(crate) fn set_terminal(&self, error: Error) {
        let mut terminal = self.terminal.lock().expect("poisoned");
        if terminal.is_none() {
            *terminal = Some(error);
        }
    }

    pub(crate) fn wake_cancelled(&self) {
        // Drop the receiver if nothing holds it, so blocked stream tasks
        // see a closed channel; a pending `next` drops it itself.
        if let Ok(mut items) = self.items.try_lock() {
            *items = None;
        }
        self.cancel_notify.notify_waiters();
    }

    fn terminal_error(&self) -> Error {
        self.terminal
            .lock()
            .expect("poisoned")
            .unwrap_or_else(|| KeyValueError::RangeScanCompleted.into())
    }
}

/// The result handle of a range scan: a lazy sequence of items in arrival
/// order across the scanned partitions.
#[derive(Debug, Clone)]
pub struct ScanResult {
    shared: Arc<ScanResultShared>,
    cancel: CancellationToken,
}

impl ScanResult {
    pub(crate) fn new(shared: Arc<ScanResultShared>, cancel: CancellationToken) -> Self {
        ScanResult { shared, cancel }
    }

    /// Resolves `cb` with the next item, with `range_scan_completed` when
    /// every partition has drained, or with the scan's first fatal error.
    pub fn next(&self, cb: impl FnOnce(Result<RangeScanItem, Error>) + Send + 'static) {
        let this = self.clone();
        tokio::spawn(async move {
            cb(this.next_item().await);
        });
    }

    /// Async flavor of [`ScanResult::next`].
    pub async fn next_item(&self) -> Result<RangeScanItem, Error> {
        let mut items = self.shared.items.lock().await;
        let Some(receiver) = items.as_mut() else {
            return Err(self.shared.terminal_error());
        };
        tokio::select! {
            item = receiver.recv() => match item {
                Some(item) => Ok(item),
                None => {
                    *items = None;
                    Err(self.shared.terminal_error())
                }
            },
            _ = self.shared.cancel_notify.notified() => {
                // Cancelled while this call was outstanding.
                *items = None;
                Err(CommonError::RequestCanceled.into())
            }
        }
    }

    /// Stops the scan: no further continues are issued, in-flight streams
    /// cancel their server-side scans best-effort, and later `next` calls
    /// resolve with the terminal state. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drained_streams_resolve_range_scan_completed() {
        let (tx, rx) = mpsc::channel(4);
        let shared = ScanResultShared::new(rx);
        let result = ScanResult::new(Arc::clone(&shared), CancellationToken::completed());
        tx.send(RangeScanItem {
            key: b"scan-1".to_vec(),
            body: None,
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(result.next_item().await.unwrap().key, b"scan-1".to_vec());
        assert_eq!(
            result.next_item().await.unwrap_err(),
            KeyValueError::RangeScanCompleted.into()
        );
        // The terminal state is sticky.
        assert_eq!(
            result.next_item().await.unwrap_err(),
            KeyValueError::RangeScanCompleted.into()
        );
    }

    #[tokio::test]
    async fn fatal_errors_take_precedence_over_completion() {
        let (tx, rx) = mpsc::channel::<RangeScanItem>(4);
        let shared = ScanResultShared::new(rx);
        shared.set_terminal(CommonError::InternalServerFailure.into());
        drop(tx);
        let result = ScanResult::new(shared, CancellationToken::completed());
        assert_eq!(
            result.next_item().await.unwrap_err(),
            CommonError::InternalServerFailure.into()
        );
    }
}
