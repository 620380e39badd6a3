// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A scripted in-memory cluster for exercising the dispatcher end to end:
//! per-node response tables, programmable delays and failure injection,
//! and a frame log for dispatch-count assertions.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cbx_error::Error;
use cbx_kv::{
    Cluster, ClusterOptions, ConfigFetcher, ErrorMapInfo, GetRequest, GetResult, KvResponse,
    KvSession, LookupInFieldRaw, MutationToken, ObserveSeqnoState, RangeScanItem,
    RangeScanItemBody, RangeScanType, RequestFrame, RequestOptions, RequestPayload, ResponseFrame,
    ResponsePayload, ScanTerm, SessionManager, Status,
};
use cbx_topology::{BucketCapability, Configuration, Node, PortMap, VbucketMap};

pub const BUCKET: &str = "default";
pub const SCOPE: &str = "_default";
pub const COLLECTION: &str = "_default";
pub const KV_PORT: u16 = 11210;
pub const PARTITION_UUID: u64 = 0x1111_2222_3333_4444;

#[derive(Debug, Clone)]
pub struct StoredDoc {
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

#[derive(Debug)]
pub struct MockShared {
    pub config: Configuration,
    pub store: Mutex<BTreeMap<String, StoredDoc>>,
    next_cas: AtomicU64,
    next_seqno: AtomicU64,
}

impl MockShared {
    pub fn partition_of(&self, key: &str) -> u16 {
        self.config.map_key(key.as_bytes(), 0).0
    }
}

/// One scripted node. Failure injection applies to document reads; scans
/// and mutations always follow the shared store.
#[derive(Debug)]
pub struct MockNode {
    pub index: usize,
    shared: Arc<MockShared>,
    /// Delay applied to every response from this node.
    pub delay: Mutex<Option<Duration>>,
    /// Status returned for reads while `fail_times` is non-zero (-1 means
    /// forever).
    pub fail_reads_with: Mutex<Option<Status>>,
    pub fail_times: AtomicI32,
    pub frames: Mutex<Vec<RequestPayload>>,
    pub observe: Mutex<Option<ObserveSeqnoState>>,
    scans: Mutex<HashMap<[u8; 16], VecDeque<RangeScanItem>>>,
    next_scan_uuid: AtomicU64,
    next_opaque: AtomicU32,
}

impl MockNode {
    fn new(index: usize, shared: Arc<MockShared>) -> Arc<Self> {
        Arc::new(MockNode {
            index,
            shared,
            delay: Mutex::new(None),
            fail_reads_with: Mutex::new(None),
            fail_times: AtomicI32::new(0),
            frames: Mutex::new(Vec::new()),
            observe: Mutex::new(None),
            scans: Mutex::new(HashMap::new()),
            next_scan_uuid: AtomicU64::new(1),
            next_opaque: AtomicU32::new(1),
        })
    }

    pub fn fail_reads(&self, status: Status, times: i32) {
        *self.fail_reads_with.lock().unwrap() = Some(status);
        self.fail_times.store(times, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn sent_cancel_frame(&self) -> bool {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .any(|frame| matches!(frame, RequestPayload::RangeScanCancel { .. }))
    }

    fn take_read_failure(&self) -> Option<Status> {
        let status = (*self.fail_reads_with.lock().unwrap())?;
        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining == 0 {
            return None;
        }
        if remaining > 0 {
            self.fail_times.fetch_sub(1, Ordering::SeqCst);
        }
        Some(status)
    }

    fn mutation_payload(&self, key: &str) -> ResponsePayload {
        ResponsePayload::Mutation {
            token: Some(MutationToken {
                partition_uuid: PARTITION_UUID,
                sequence_number: self.shared.next_seqno.fetch_add(1, Ordering::SeqCst),
                partition_id: self.shared.partition_of(key),
                bucket_name: BUCKET.to_string(),
            }),
        }
    }

    fn handle(&self, frame: RequestFrame) -> ResponseFrame {
        let opaque = frame.opaque;
        let mut response = match frame.payload {
            RequestPayload::Get { key }
            | RequestPayload::GetReplica { key }
            | RequestPayload::GetAndLock { key, .. }
            | RequestPayload::GetAndTouch { key, .. } => {
                if let Some(status) = self.take_read_failure() {
                    ResponseFrame::with_status(status)
                } else {
                    match self.shared.store.lock().unwrap().get(&key) {
                        Some(doc) => ResponseFrame::with_value(doc.cas, doc.value.clone(), doc.flags),
                        None => ResponseFrame::with_status(Status::NOT_FOUND),
                    }
                }
            }
            RequestPayload::Touch { .. } | RequestPayload::Unlock { .. } => {
                ResponseFrame::default()
            }
            RequestPayload::Insert { key, value, flags, .. } => {
                let mut store = self.shared.store.lock().unwrap();
                if store.contains_key(&key) {
                    ResponseFrame::with_status(Status::EXISTS)
                } else {
                    let cas = self.shared.next_cas.fetch_add(1, Ordering::SeqCst);
                    store.insert(key.clone(), StoredDoc { value, flags, cas });
                    ResponseFrame {
                        cas,
                        payload: self.mutation_payload(&key),
                        ..Default::default()
                    }
                }
            }
            RequestPayload::Upsert { key, value, flags, .. }
            | RequestPayload::Replace { key, value, flags, .. } => {
                let cas = self.shared.next_cas.fetch_add(1, Ordering::SeqCst);
                self.shared
                    .store
                    .lock()
                    .unwrap()
                    .insert(key.clone(), StoredDoc { value, flags, cas });
                ResponseFrame {
                    cas,
                    payload: self.mutation_payload(&key),
                    ..Default::default()
                }
            }
            RequestPayload::Remove { key, .. } => {
                match self.shared.store.lock().unwrap().remove(&key) {
                    Some(_) => ResponseFrame {
                        cas: self.shared.next_cas.fetch_add(1, Ordering::SeqCst),
                        payload: self.mutation_payload(&key),
                        ..Default::default()
                    },
                    None => ResponseFrame::with_status(Status::NOT_FOUND),
                }
            }
            RequestPayload::Append { key, .. } | RequestPayload::Prepend { key, .. } => {
                ResponseFrame {
                    cas: self.shared.next_cas.fetch_add(1, Ordering::SeqCst),
                    payload: self.mutation_payload(&key),
                    ..Default::default()
                }
            }
            RequestPayload::Increment { delta, initial, .. }
            | RequestPayload::Decrement { delta, initial, .. } => ResponseFrame {
                cas: self.shared.next_cas.fetch_add(1, Ordering::SeqCst),
                payload: ResponsePayload::Counter {
                    content: initial.unwrap_or(delta),
                },
                ..Default::default()
            },
            RequestPayload::LookupIn { key, specs, .. }
            | RequestPayload::LookupInReplica { key, specs } => {
                if let Some(status) = self.take_read_failure() {
                    ResponseFrame::with_status(status)
                } else {
                    match self.shared.store.lock().unwrap().get(&key) {
                        Some(doc) => ResponseFrame {
                            cas: doc.cas,
                            payload: ResponsePayload::LookupIn {
                                fields: specs
                                    .iter()
                                    .map(|_| LookupInFieldRaw {
                                        status: Status::SUCCESS,
                                        value: doc.value.clone(),
                                    })
                                    .collect(),
                                deleted: false,
                            },
                            ..Default::default()
                        },
                        None => ResponseFrame::with_status(Status::NOT_FOUND),
                    }
                }
            }
            RequestPayload::MutateIn { key, specs, .. } => ResponseFrame {
                cas: self.shared.next_cas.fetch_add(1, Ordering::SeqCst),
                payload: ResponsePayload::MutateIn {
                    fields: specs
                        .iter()
                        .map(|_| cbx_kv::MutateInFieldRaw {
                            status: Status::SUCCESS,
                            value: Bytes::new(),
                        })
                        .collect(),
                    deleted: false,
                    first_error_index: None,
                },
                ..Default::default()
            },
            RequestPayload::ObserveSeqno { partition_uuid } => {
                let state = self.observe.lock().unwrap().unwrap_or(ObserveSeqnoState {
                    partition_uuid,
                    current_seqno: u64::MAX,
                    last_persisted_seqno: u64::MAX,
                });
                ResponseFrame {
                    payload: ResponsePayload::ObserveSeqno(state),
                    ..Default::default()
                }
            }
            RequestPayload::RangeScanCreate { scan_type, ids_only, .. } => {
                let items = self.matching_items(frame.partition, &scan_type, ids_only);
                if items.is_empty() {
                    ResponseFrame::with_status(Status::NOT_FOUND)
                } else {
                    let mut uuid = [0u8; 16];
                    uuid[..8].copy_from_slice(
                        &self.next_scan_uuid.fetch_add(1, Ordering::SeqCst).to_be_bytes(),
                    );
                    uuid[8] = self.index as u8;
                    self.scans.lock().unwrap().insert(uuid, items.into());
                    ResponseFrame {
                        payload: ResponsePayload::RangeScanCreate { scan_uuid: uuid },
                        ..Default::default()
                    }
                }
            }
            RequestPayload::RangeScanContinue { scan_uuid, batch_item_limit, .. } => {
                let mut scans = self.scans.lock().unwrap();
                match scans.get_mut(&scan_uuid) {
                    None => ResponseFrame::with_status(Status::NOT_FOUND),
                    Some(pending) => {
                        let take = (batch_item_limit as usize).max(1).min(pending.len());
                        let items: Vec<RangeScanItem> = pending.drain(..take).collect();
                        let status = if pending.is_empty() {
                            scans.remove(&scan_uuid);
                            Status::RANGE_SCAN_COMPLETE
                        } else {
                            Status::RANGE_SCAN_MORE
                        };
                        ResponseFrame {
                            status,
                            payload: ResponsePayload::RangeScanContinue { items },
                            ..Default::default()
                        }
                    }
                }
            }
            RequestPayload::RangeScanCancel { scan_uuid } => {
                self.scans.lock().unwrap().remove(&scan_uuid);
                ResponseFrame::default()
            }
        };
        response.opaque = opaque;
        response
    }

    fn matching_items(
        &self,
        partition: u16,
        scan_type: &RangeScanType,
        ids_only: bool,
    ) -> Vec<RangeScanItem> {
        let store = self.shared.store.lock().unwrap();
        store
            .iter()
            .filter(|(key, _)| self.shared.partition_of(key) == partition)
            .filter(|(key, _)| match scan_type {
                RangeScanType::Prefix { prefix } => key.as_bytes().starts_with(prefix),
                RangeScanType::Range { from, to } => {
                    let key = key.as_bytes();
                    let after_from = match from {
                        None => true,
                        Some(ScanTerm { term, exclusive: false }) => key >= term.as_slice(),
                        Some(ScanTerm { term, exclusive: true }) => key > term.as_slice(),
                    };
                    let before_to = match to {
                        None => true,
                        Some(ScanTerm { term, exclusive: false }) => key <= term.as_slice(),
                        Some(ScanTerm { term, exclusive: true }) => key < term.as_slice(),
                    };
                    after_from && before_to
                }
                RangeScanType::Sampling { .. } => true,
            })
            .map(|(key, doc)| RangeScanItem {
                key: key.as_bytes().to_vec(),
                body: (!ids_only).then(|| RangeScanItemBody {
                    cas: doc.cas,
                    value: doc.value.clone(),
                    flags: doc.flags,
                    sequence_number: 1,
                    expiry_time: 0,
                }),
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct MockSession {
    node: Arc<MockNode>,
}

#[async_trait]
impl KvSession for MockSession {
    async fn send(&self, frame: RequestFrame) -> Result<ResponseFrame, Error> {
        self.node.frames.lock().unwrap().push(frame.payload.clone());
        let delay = *self.node.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.node.handle(frame))
    }

    fn last_endpoints(&self) -> (String, String) {
        (
            format!("127.0.0.1:{}", 50_000 + self.node.index),
            format!("node{}.example.com:{}", self.node.index, KV_PORT),
        )
    }

    fn error_map_info(&self, status: u16) -> Option<ErrorMapInfo> {
        Some(ErrorMapInfo {
            code: status,
            name: format!("status_{:#06x}", status),
            description: "scripted".to_string(),
        })
    }

    fn next_opaque(&self) -> u32 {
        self.node.next_opaque.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MockSessionManager {
    nodes: Vec<Arc<MockNode>>,
}

impl SessionManager for MockSessionManager {
    fn kv_session(&self, _bucket: &str, node_index: usize) -> Option<Arc<dyn KvSession>> {
        let node = self.nodes.get(node_index)?;
        Some(Arc::new(MockSession {
            node: Arc::clone(node),
        }))
    }
}

/// Serves the scripted configuration and counts fetches.
#[derive(Debug)]
pub struct StaticFetcher {
    config: Configuration,
    pub fetches: AtomicU32,
}

impl ConfigFetcher for StaticFetcher {
    fn fetch(&self, _bucket: &str, cb: Box<dyn FnOnce(Result<Configuration, Error>) + Send>) {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        cb(Ok(self.config.clone()));
    }
}

pub struct TestHarness {
    pub cluster: Cluster,
    pub nodes: Vec<Arc<MockNode>>,
    pub shared: Arc<MockShared>,
    pub fetcher: Arc<StaticFetcher>,
}

/// A cluster of `num_nodes` nodes, `partitions` partitions, and
/// `num_replicas` replicas per partition, assigned round-robin.
pub fn scripted_config(num_nodes: usize, num_replicas: u32, partitions: usize, server_groups: &[&str]) -> Configuration {
    let nodes = (0..num_nodes)
        .map(|index| Node {
            index,
            hostname: format!("node{}.example.com", index),
            services_plain: PortMap {
                key_value: Some(KV_PORT),
                ..Default::default()
            },
            server_group: server_groups.get(index).copied().unwrap_or("").to_string(),
            ..Default::default()
        })
        .collect();
    let vbmap: VbucketMap = (0..partitions)
        .map(|partition| {
            (0..=num_replicas)
                .map(|rank| {
                    if (rank as usize) < num_nodes {
                        ((partition + rank as usize) % num_nodes) as i16
                    } else {
                        -1
                    }
                })
                .collect()
        })
        .collect();
    Configuration {
        epoch: Some(1),
        rev: Some(1),
        bucket: Some(BUCKET.to_string()),
        num_replicas: Some(num_replicas),
        nodes,
        vbmap: Some(vbmap),
        bucket_capabilities: [
            BucketCapability::CouchApi,
            BucketCapability::RangeScan,
            BucketCapability::SubdocReadReplica,
        ]
        .into_iter()
        .collect(),
        ..Default::default()
    }
}

impl TestHarness {
    pub fn new(num_nodes: usize, num_replicas: u32, partitions: usize) -> Self {
        Self::with_groups_and_options(
            num_nodes,
            num_replicas,
            partitions,
            &[],
            ClusterOptions::default(),
        )
    }

    pub fn with_groups_and_options(
        num_nodes: usize,
        num_replicas: u32,
        partitions: usize,
        server_groups: &[&str],
        options: ClusterOptions,
    ) -> Self {
        let config = scripted_config(num_nodes, num_replicas, partitions, server_groups);
        let shared = Arc::new(MockShared {
            config: config.clone(),
            store: Mutex::new(BTreeMap::new()),
            next_cas: AtomicU64::new(1000),
            next_seqno: AtomicU64::new(1),
        });
        let nodes: Vec<Arc<MockNode>> = (0..num_nodes)
            .map(|index| MockNode::new(index, Arc::clone(&shared)))
            .collect();
        let fetcher = Arc::new(StaticFetcher {
            config,
            fetches: AtomicU32::new(0),
        });
        let sessions: Arc<dyn cbx_kv::SessionManager> = Arc::new(MockSessionManager {
            nodes: nodes.clone(),
        });
        let fetcher_handle: Arc<dyn ConfigFetcher> = Arc::clone(&fetcher) as Arc<dyn ConfigFetcher>;
        let cluster = Cluster::new(options, sessions, fetcher_handle);
        TestHarness {
            cluster,
            nodes,
            shared,
            fetcher,
        }
    }

    pub fn store_doc(&self, key: &str, value: &str) {
        let cas = self.shared.next_cas.fetch_add(1, Ordering::SeqCst);
        self.shared.store.lock().unwrap().insert(
            key.to_string(),
            StoredDoc {
                value: Bytes::copy_from_slice(value.as_bytes()),
                flags: 0,
                cas,
            },
        );
    }

    pub fn doc_id(&self, key: &str) -> cbx_kv::DocumentId {
        cbx_kv::DocumentId::new(BUCKET, SCOPE, COLLECTION, key)
    }

    pub async fn get(&self, key: &str) -> KvResponse<GetResult> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.cluster.get(
            GetRequest {
                id: self.doc_id(key),
                options: RequestOptions::default(),
            },
            move |response| {
                let _ = tx.send(response);
            },
        );
        rx.await.expect("callback runs")
    }

    pub fn total_frames(&self) -> usize {
        self.nodes.iter().map(|node| node.frame_count()).sum()
    }
}

/// Awaits a callback-style operation as a future.
pub async fn await_cb<T: Send + 'static>(
    start: impl FnOnce(Box<dyn FnOnce(T) + Send>),
) -> T {
    let (tx, rx) = tokio::sync::oneshot::channel();
    start(Box::new(move |value| {
        let _ = tx.send(value);
    }));
    rx.await.expect("callback runs")
}
