// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-bucket configuration cache.
//!
//! Readers take a cheap reference-counted snapshot; the config fetcher
//! pushes new configurations which replace the snapshot only when strictly
//! newer by `(epoch, rev)`. Waiters registered before an update are
//! notified exactly once per update they are interested in.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use cbx_error::{CommonError, Error};
use cbx_topology::Configuration;
use tracing::debug;

/// The external collaborator that obtains configurations from the server.
pub trait ConfigFetcher: Debug + Send + Sync {
    /// Fetches the current configuration for `bucket`, resolving through
    /// `cb` exactly once. A rejection maps to `bucket_not_found`.
    fn fetch(&self, bucket: &str, cb: Box<dyn FnOnce(Result<Configuration, Error>) + Send>);
}

/// Observes every accepted configuration update, for components that track
/// cluster-level attributes.
pub trait ConfigListener: Send + Sync {
    fn config_updated(&self, config: &Arc<Configuration>);
}

type ConfigCallback = Box<dyn FnOnce(Result<Arc<Configuration>, Error>) + Send>;
type OpenCallback = Box<dyn FnOnce(Option<Error>) + Send>;

#[derive(Default)]
struct BucketWaiters {
    fetch_in_flight: bool,
    config_waiters: Vec<ConfigCallback>,
    open_waiters: Vec<OpenCallback>,
}

/// Per-bucket current topology with subscribers.
pub struct ConfigurationCache {
    fetcher: Arc<dyn ConfigFetcher>,
    bootstrap_timeout: Duration,
    snapshots: RwLock<HashMap<String, Arc<Configuration>>>,
    waiters: Mutex<HashMap<String, BucketWaiters>>,
    listeners: Mutex<Vec<Arc<dyn ConfigListener>>>,
}

impl Debug for ConfigurationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ConfigurationCache")
            .field("fetcher", &self.fetcher)
            .field("bootstrap_timeout", &self.bootstrap_timeout)
            .finish_non_exhaustive()
    }
}

impl ConfigurationCache {
    pub fn new(fetcher: Arc<dyn ConfigFetcher>, bootstrap_timeout: Duration) -> Arc<Self> {
        Arc::new(ConfigurationCache {
            fetcher,
            bootstrap_timeout,
            snapshots: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn register_config_listener(&self, listener: Arc<dyn ConfigListener>) {
        self.listeners.lock().expect("poisoned").push(listener);
    }

    /// The current snapshot for `bucket`, if one is cached.
    pub fn current(&self, bucket: &str) -> Option<Arc<Configuration>> {
        self.snapshots
            .read()
            .expect("poisoned")
            .get(bucket)
            .map(Arc::clone)
    }

    /// Ensures `bucket` is opened. Idempotent; `cb` fires with `None` once
    /// the first configuration has been obtained, or with the fetch error.
    /// An initial fetch that does not complete within the bootstrap budget
    /// fails with `unambiguous_timeout`.
    pub fn open_bucket(self: &Arc<Self>, bucket: &str, cb: OpenCallback) {
        if self.current(bucket).is_some() {
            cb(None);
            return;
        }
        {
            let mut waiters = self.waiters.lock().expect("poisoned");
            let entry = waiters.entry(bucket.to_string()).or_default();
            entry.open_waiters.push(cb);
        }
        // An update may have raced the registration; drain it now so the
        // waiter cannot be stranded until the next update.
        if self.current(bucket).is_some() {
            self.drain_waiters(bucket);
        }
        self.ensure_fetch(bucket);

        let this = Arc::clone(self);
        let bucket = bucket.to_string();
        let bootstrap_timeout = self.bootstrap_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(bootstrap_timeout).await;
            if this.current(&bucket).is_some() {
                return;
            }
            let expired = {
                let mut waiters = this.waiters.lock().expect("poisoned");
                match waiters.get_mut(&bucket) {
                    Some(entry) => std::mem::take(&mut entry.open_waiters),
                    None => Vec::new(),
                }
            };
            for waiter in expired {
                waiter(Some(CommonError::UnambiguousTimeout.into()));
            }
        });
    }

    /// Resolves `cb` with a configuration snapshot: immediately when one is
    /// cached, otherwise queued until the next accepted update (a fetch is
    /// kicked off if none is in flight).
    pub fn with_bucket_configuration(self: &Arc<Self>, bucket: &str, cb: ConfigCallback) {
        if let Some(snapshot) = self.current(bucket) {
            cb(Ok(snapshot));
            return;
        }
        {
            let mut waiters = self.waiters.lock().expect("poisoned");
            let entry = waiters.entry(bucket.to_string()).or_default();
            entry.config_waiters.push(cb);
        }
        // An update may have raced the registration; drain it now so the
        // waiter cannot be stranded until the next update.
        if self.current(bucket).is_some() {
            self.drain_waiters(bucket);
        }
        self.ensure_fetch(bucket);
    }

    /// Async convenience over [`ConfigurationCache::with_bucket_configuration`].
    pub async fn bucket_configuration(
        self: &Arc<Self>,
        bucket: &str,
    ) -> Result<Arc<Configuration>, Error> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.with_bucket_configuration(
            bucket,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await
            .unwrap_or(Err(CommonError::RequestCanceled.into()))
    }

    /// Replaces the cached configuration for `bucket` iff `config` is
    /// strictly newer than the cached one; a stale push is ignored.
    /// Listeners are notified synchronously, exactly once per accepted
    /// update. Queued waiters are drained either way, since any cached
    /// snapshot satisfies them.
    pub fn update_config(&self, bucket: &str, config: Configuration) {
        let accepted = {
            let mut snapshots = self.snapshots.write().expect("poisoned");
            match snapshots.get(bucket) {
                Some(current) if config <= **current => {
                    debug!(
                        "ignoring stale configuration for {} ({})",
                        bucket,
                        config.rev_str()
                    );
                    None
                }
                _ => {
                    let snapshot = Arc::new(config);
                    snapshots.insert(bucket.to_string(), Arc::clone(&snapshot));
                    Some(snapshot)
                }
            }
        };
        if let Some(snapshot) = &accepted {
            debug!(
                "installed configuration for {} ({})",
                bucket,
                snapshot.rev_str()
            );
            let listeners = self.listeners.lock().expect("poisoned").clone();
            for listener in listeners {
                listener.config_updated(snapshot);
            }
        }
        self.drain_waiters(bucket);
    }

    /// Fires every queued waiter for `bucket` with the cached snapshot.
    fn drain_waiters(&self, bucket: &str) {
        let Some(snapshot) = self.current(bucket) else {
            return;
        };
        let (config_waiters, open_waiters) = {
            let mut waiters = self.waiters.lock().expect("poisoned");
            match waiters.get_mut(bucket) {
                Some(entry) => {
                    entry.fetch_in_flight = false;
                    (
                        std::mem::take(&mut entry.config_waiters),
                        std::mem::take(&mut entry.open_waiters),
                    )
                }
                None => (Vec::new(), Vec::new()),
            }
        };
        for waiter in config_waiters {
            waiter(Ok(Arc::clone(&snapshot)));
        }
        for waiter in open_waiters {
            waiter(None);
        }
    }

    fn ensure_fetch(self: &Arc<Self>, bucket: &str) {
        {
            let mut waiters = self.waiters.lock().expect("poisoned");
            let entry = waiters.entry(bucket.to_string()).or_default();
            if entry.fetch_in_flight {
                return;
            }
            entry.fetch_in_flight = true;
        }
        let this = Arc::clone(self);
        let name = bucket.to_string();
        self.fetcher.fetch(
            bucket,
            Box::new(move |result| match result {
                Ok(config) => this.update_config(&name, config),
                Err(error) => this.fail_waiters(&name, error),
            }),
        );
    }

    fn fail_waiters(&self, bucket: &str, error: Error) {
        let (config_waiters, open_waiters) = {
            let mut waiters = self.waiters.lock().expect("poisoned");
            match waiters.get_mut(bucket) {
                Some(entry) => {
                    entry.fetch_in_flight = false;
                    (
                        std::mem::take(&mut entry.config_waiters),
                        std::mem::take(&mut entry.open_waiters),
                    )
                }
                None => (Vec::new(), Vec::new()),
            }
        };
        for waiter in config_waiters {
            waiter(Err(error));
        }
        for waiter in open_waiters {
            waiter(Some(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct ManualFetcher;

    impl ConfigFetcher for ManualFetcher {
        fn fetch(&self, _bucket: &str, _cb: Box<dyn FnOnce(Result<Configuration, Error>) + Send>) {
            // Configurations arrive through `update_config` in these tests.
        }
    }

    fn config(epoch: i64, rev: i64) -> Configuration {
        Configuration {
            epoch: Some(epoch),
            rev: Some(rev),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cached_revision_is_the_maximum_of_all_updates() {
        let cache = ConfigurationCache::new(Arc::new(ManualFetcher), Duration::from_secs(10));
        for (epoch, rev) in [(1, 1), (2, 1), (1, 9), (2, 0), (2, 3), (2, 2)] {
            cache.update_config("default", config(epoch, rev));
        }
        let snapshot = cache.current("default").unwrap();
        assert_eq!((snapshot.epoch, snapshot.rev), (Some(2), Some(3)));
    }

    #[tokio::test]
    async fn waiters_fire_on_the_next_update() {
        let cache = ConfigurationCache::new(Arc::new(ManualFetcher), Duration::from_secs(10));
        let fired = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            cache.with_bucket_configuration(
                "default",
                Box::new(move |result| {
                    assert!(result.is_ok());
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        cache.update_config("default", config(1, 1));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        // A later update does not re-notify drained waiters.
        cache.update_config("default", config(1, 2));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cached_snapshot_resolves_immediately() {
        let cache = ConfigurationCache::new(Arc::new(ManualFetcher), Duration::from_secs(10));
        cache.update_config("default", config(3, 4));
        let snapshot = cache.bucket_configuration("default").await.unwrap();
        assert_eq!(snapshot.rev, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn open_bucket_times_out_on_the_bootstrap_budget() {
        let cache = ConfigurationCache::new(Arc::new(ManualFetcher), Duration::from_millis(100));
        let (tx, rx) = tokio::sync::oneshot::channel();
        cache.open_bucket(
            "default",
            Box::new(move |error| {
                let _ = tx.send(error);
            }),
        );
        let error = rx.await.unwrap();
        assert_eq!(error, Some(CommonError::UnambiguousTimeout.into()));
    }

    #[tokio::test]
    async fn open_bucket_resolves_once_a_configuration_arrives() {
        let cache = ConfigurationCache::new(Arc::new(ManualFetcher), Duration::from_secs(10));
        let (tx, rx) = tokio::sync::oneshot::channel();
        cache.open_bucket(
            "default",
            Box::new(move |error| {
                let _ = tx.send(error);
            }),
        );
        cache.update_config("default", config(1, 1));
        assert_eq!(rx.await.unwrap(), None);
    }
}
