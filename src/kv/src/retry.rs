// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Pluggable retry orchestration.
//!
//! The dispatcher never decides to retry on its own: every failed attempt
//! is classified as a [`RetryReason`] and routed through the request's
//! [`RetryStrategy`]. Reasons that guarantee the server did not execute the
//! operation (a moved partition, an outdated collection manifest) are
//! always retried, bypassing the strategy.

use std::fmt::Debug;
use std::time::Duration;

/// Why an attempt failed and may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RetryReason {
    Unknown,
    SocketNotAvailable,
    ServiceNotAvailable,
    NodeNotAvailable,
    KvNotMyVbucket,
    KvCollectionOutdated,
    KvErrorMapRetryIndicated,
    KvLocked,
    KvTemporaryFailure,
    KvSyncWriteInProgress,
    KvSyncWriteReCommitInProgress,
    SocketClosedWhileInFlight,
    CircuitBreakerOpen,
}

impl RetryReason {
    /// Whether the attempt is known not to have executed on the server, so
    /// even a non-idempotent operation can be retried safely.
    pub fn allows_non_idempotent_retry(&self) -> bool {
        !matches!(
            self,
            RetryReason::Unknown | RetryReason::SocketClosedWhileInFlight
        )
    }

    /// Whether the attempt must be retried regardless of the strategy.
    pub fn always_retry(&self) -> bool {
        matches!(
            self,
            RetryReason::KvNotMyVbucket | RetryReason::KvCollectionOutdated
        )
    }
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            RetryReason::Unknown => "unknown",
            RetryReason::SocketNotAvailable => "socket_not_available",
            RetryReason::ServiceNotAvailable => "service_not_available",
            RetryReason::NodeNotAvailable => "node_not_available",
            RetryReason::KvNotMyVbucket => "kv_not_my_vbucket",
            RetryReason::KvCollectionOutdated => "kv_collection_outdated",
            RetryReason::KvErrorMapRetryIndicated => "kv_error_map_retry_indicated",
            RetryReason::KvLocked => "kv_locked",
            RetryReason::KvTemporaryFailure => "kv_temporary_failure",
            RetryReason::KvSyncWriteInProgress => "kv_sync_write_in_progress",
            RetryReason::KvSyncWriteReCommitInProgress => "kv_sync_write_re_commit_in_progress",
            RetryReason::SocketClosedWhileInFlight => "socket_closed_while_in_flight",
            RetryReason::CircuitBreakerOpen => "circuit_breaker_open",
        };
        f.write_str(name)
    }
}

/// What the strategy knows about the operation when deciding.
#[derive(Debug, Clone, Copy)]
pub struct RetryRequest<'a> {
    /// The operation name, e.g. `"get"`.
    pub operation: &'a str,
    /// Attempts made so far, not counting the initial one.
    pub attempts: u32,
    pub idempotent: bool,
    /// Time left until the operation deadline.
    pub deadline_remaining: Duration,
}

/// The strategy's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAction {
    /// `Some(delay)` schedules a retry after `delay`; `None` stops with the
    /// attempt's error.
    pub retry_after: Option<Duration>,
}

impl RetryAction {
    pub fn after(delay: Duration) -> Self {
        RetryAction {
            retry_after: Some(delay),
        }
    }

    pub fn do_not_retry() -> Self {
        RetryAction { retry_after: None }
    }
}

/// Decides whether a failed attempt is retried and how long to back off.
pub trait RetryStrategy: Debug + Send + Sync {
    fn should_retry(&self, request: &RetryRequest, reason: RetryReason) -> RetryAction;
}

/// The backoff ladder used between attempts: steep at first, capped at one
/// second.
pub fn controlled_backoff(attempt: u32) -> Duration {
    let ms = match attempt {
        0 => 1,
        1 => 10,
        2 => 50,
        3 => 100,
        4 => 500,
        _ => 1_000,
    };
    Duration::from_millis(ms)
}

/// Retries idempotent operations on any transient reason and non-idempotent
/// operations only when the failure proves the server did not execute them.
#[derive(Debug, Default, Clone, Copy)]
pub struct BestEffortRetryStrategy;

impl RetryStrategy for BestEffortRetryStrategy {
    fn should_retry(&self, request: &RetryRequest, reason: RetryReason) -> RetryAction {
        if request.idempotent || reason.allows_non_idempotent_retry() {
            RetryAction::after(controlled_backoff(request.attempts))
        } else {
            RetryAction::do_not_retry()
        }
    }
}

/// Never retries; the first failure surfaces directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn should_retry(&self, _request: &RetryRequest, _reason: RetryReason) -> RetryAction {
        RetryAction::do_not_retry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(attempts: u32, idempotent: bool) -> RetryRequest<'static> {
        RetryRequest {
            operation: "get",
            attempts,
            idempotent,
            deadline_remaining: Duration::from_secs(2),
        }
    }

    #[test]
    fn backoff_ladder_is_capped() {
        assert_eq!(controlled_backoff(0), Duration::from_millis(1));
        assert_eq!(controlled_backoff(3), Duration::from_millis(100));
        assert_eq!(controlled_backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn best_effort_retries_idempotent_on_ambiguous_failures() {
        let strategy = BestEffortRetryStrategy;
        let action = strategy.should_retry(&request(0, true), RetryReason::SocketClosedWhileInFlight);
        assert_eq!(action, RetryAction::after(Duration::from_millis(1)));
    }

    #[test]
    fn best_effort_fails_non_idempotent_on_ambiguous_failures() {
        let strategy = BestEffortRetryStrategy;
        let action =
            strategy.should_retry(&request(0, false), RetryReason::SocketClosedWhileInFlight);
        assert_eq!(action, RetryAction::do_not_retry());
        // A reason that proves non-execution is retryable even for writes.
        let action = strategy.should_retry(&request(1, false), RetryReason::KvTemporaryFailure);
        assert_eq!(action, RetryAction::after(Duration::from_millis(10)));
    }

    #[test]
    fn moved_partitions_always_retry() {
        assert!(RetryReason::KvNotMyVbucket.always_retry());
        assert!(RetryReason::KvCollectionOutdated.always_retry());
        assert!(!RetryReason::KvTemporaryFailure.always_retry());
    }
}
