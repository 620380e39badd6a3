// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! One-shot cancellation with a cached teardown action.

use std::fmt;
use std::sync::{Arc, Mutex};

enum TokenState {
    Armed(Box<dyn FnOnce() + Send>),
    Completed,
    Cancelled,
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenState::Armed(_) => f.write_str("Armed"),
            TokenState::Completed => f.write_str("Completed"),
            TokenState::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// A handle that cancels one operation.
///
/// `cancel` is idempotent and thread-safe: the cached teardown action runs
/// synchronously on the first call and never again. Cancelling after the
/// operation completed is a no-op.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<Mutex<TokenState>>,
}

impl CancellationToken {
    /// A token whose cancellation runs `teardown` once.
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        CancellationToken {
            state: Arc::new(Mutex::new(TokenState::Armed(Box::new(teardown)))),
        }
    }

    /// A token with nothing to tear down.
    pub fn completed() -> Self {
        CancellationToken {
            state: Arc::new(Mutex::new(TokenState::Completed)),
        }
    }

    /// Cancels the operation; returns whether the teardown ran on this
    /// call.
    pub fn cancel(&self) -> bool {
        let teardown = {
            let mut state = self.state.lock().expect("poisoned");
            match std::mem::replace(&mut *state, TokenState::Cancelled) {
                TokenState::Armed(teardown) => Some(teardown),
                TokenState::Completed => {
                    // Completion wins; remember that but run nothing.
                    *state = TokenState::Completed;
                    None
                }
                TokenState::Cancelled => None,
            }
        };
        match teardown {
            Some(teardown) => {
                teardown();
                true
            }
            None => false,
        }
    }

    /// Marks the operation complete, dropping the teardown action without
    /// running it.
    pub fn complete(&self) {
        let mut state = self.state.lock().expect("poisoned");
        if matches!(*state, TokenState::Armed(_)) {
            *state = TokenState::Completed;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock().expect("poisoned"), TokenState::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn cancel_runs_the_teardown_exactly_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let token = {
            let runs = Arc::clone(&runs);
            CancellationToken::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert!(token.cancel());
        for _ in 0..10 {
            assert!(!token.cancel());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(token.is_cancelled());
    }

    #[test]
    fn concurrent_cancels_run_the_teardown_exactly_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let token = {
            let runs = Arc::clone(&runs);
            CancellationToken::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let token = token.clone();
                std::thread::spawn(move || token.cancel())
            })
            .collect();
        let ran: usize = handles.into_iter().map(|h| usize::from(h.join().unwrap())).sum();
        assert_eq!(ran, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelling_after_completion_is_a_no_op() {
        let runs = Arc::new(AtomicUsize::new(0));
        let token = {
            let runs = Arc::clone(&runs);
            CancellationToken::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        token.complete();
        assert!(!token.cancel());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
