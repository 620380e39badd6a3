// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Range-scan orchestration against the scripted session layer.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use cbx_error::{CommonError, Error, KeyValueError};
use cbx_kv::{RangeScanOrchestratorOptions, RangeScanType, ScanResult, ScanTerm};

use crate::common::{await_cb, TestHarness, BUCKET, COLLECTION, SCOPE};

fn scan_options(concurrency: u16) -> RangeScanOrchestratorOptions {
    RangeScanOrchestratorOptions {
        concurrency,
        ..Default::default()
    }
}

async fn start_scan(
    harness: &TestHarness,
    scan_type: RangeScanType,
    options: RangeScanOrchestratorOptions,
) -> Result<ScanResult, Error> {
    await_cb(|cb| {
        harness
            .cluster
            .scan(BUCKET, SCOPE, COLLECTION, scan_type, options, cb)
    })
    .await
}

#[tokio::test]
async fn prefix_scans_return_every_matching_document_exactly_once() {
    let harness = TestHarness::new(2, 0, 8);
    for i in 0..100 {
        harness.store_doc(&format!("scan-{:03}", i), &format!("value-{:03}", i));
    }
    harness.store_doc("other", "not scanned");

    let result = start_scan(
        &harness,
        RangeScanType::Prefix {
            prefix: b"scan-".to_vec(),
        },
        scan_options(20),
    )
    .await
    .unwrap();

    let mut keys = BTreeSet::new();
    loop {
        match result.next_item().await {
            Ok(item) => {
                let key = String::from_utf8(item.key.clone()).unwrap();
                assert!(keys.insert(key.clone()), "duplicate key {}", key);
                let body = item.body.expect("bodies requested");
                let expected = format!("value-{}", key.trim_start_matches("scan-"));
                assert_eq!(body.value.as_ref(), expected.as_bytes());
            }
            Err(error) => {
                assert_eq!(error, KeyValueError::RangeScanCompleted.into());
                break;
            }
        }
    }
    assert_eq!(keys.len(), 100);
    assert!(keys.iter().all(|key| key.starts_with("scan-")));
}

#[tokio::test]
async fn ids_only_scans_omit_bodies() {
    let harness = TestHarness::new(2, 0, 4);
    for i in 0..10 {
        harness.store_doc(&format!("scan-{}", i), "v");
    }

    let options = RangeScanOrchestratorOptions {
        ids_only: true,
        concurrency: 4,
        ..Default::default()
    };
    let result = start_scan(
        &harness,
        RangeScanType::Prefix {
            prefix: b"scan-".to_vec(),
        },
        options,
    )
    .await
    .unwrap();

    let mut count = 0;
    while let Ok(item) = result.next_item().await {
        assert!(item.body.is_none());
        count += 1;
    }
    assert_eq!(count, 10);
}

#[tokio::test]
async fn range_scans_honor_term_boundaries() {
    let harness = TestHarness::new(1, 0, 2);
    for key in ["a", "b", "c", "d"] {
        harness.store_doc(key, key);
    }

    let result = start_scan(
        &harness,
        RangeScanType::Range {
            from: Some(ScanTerm::inclusive(b"b".to_vec())),
            to: Some(ScanTerm::exclusive(b"d".to_vec())),
        },
        scan_options(2),
    )
    .await
    .unwrap();

    let mut keys = BTreeSet::new();
    while let Ok(item) = result.next_item().await {
        keys.insert(String::from_utf8(item.key).unwrap());
    }
    assert_eq!(
        keys,
        BTreeSet::from(["b".to_string(), "c".to_string()])
    );
}

#[tokio::test]
async fn cancelling_a_scan_stops_the_stream_and_cancels_server_side() {
    let harness = TestHarness::new(1, 0, 1);
    for i in 0..10 {
        harness.store_doc(&format!("scan-{}", i), "v");
    }

    // Small batches keep the partition stream alive across many continues
    // so the cancel lands mid-stream.
    let options = RangeScanOrchestratorOptions {
        batch_item_limit: 2,
        concurrency: 1,
        ..Default::default()
    };
    let result = start_scan(
        &harness,
        RangeScanType::Prefix {
            prefix: b"scan-".to_vec(),
        },
        options,
    )
    .await
    .unwrap();

    let first = result.next_item().await.unwrap();
    assert!(first.key.starts_with(b"scan-"));

    result.cancel();
    // Cancelling twice is a no-op.
    result.cancel();

    let after_cancel = result.next_item().await;
    assert_eq!(
        after_cancel.unwrap_err(),
        KeyValueError::RangeScanCompleted.into()
    );

    // The in-flight stream tears its server-side scan down best-effort.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        harness.nodes.iter().any(|node| node.sent_cancel_frame()),
        "expected a range_scan_cancel frame"
    );
}

#[tokio::test]
async fn zero_concurrency_fails_synchronously_without_opening_the_bucket() {
    let harness = TestHarness::new(1, 0, 1);
    let result = start_scan(
        &harness,
        RangeScanType::Prefix {
            prefix: b"x".to_vec(),
        },
        scan_options(0),
    )
    .await;
    assert_eq!(
        result.unwrap_err(),
        CommonError::InvalidArgument.into()
    );
    assert_eq!(harness.fetcher.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(harness.total_frames(), 0);
}

#[tokio::test]
async fn sampling_scans_validate_their_limit() {
    let harness = TestHarness::new(1, 0, 1);
    let result = start_scan(
        &harness,
        RangeScanType::Sampling {
            limit: 0,
            seed: None,
        },
        scan_options(1),
    )
    .await;
    assert_eq!(result.unwrap_err(), CommonError::InvalidArgument.into());
}

#[tokio::test]
async fn scans_of_an_empty_range_complete_immediately() {
    let harness = TestHarness::new(2, 0, 4);
    harness.store_doc("other", "v");

    let result = start_scan(
        &harness,
        RangeScanType::Prefix {
            prefix: b"scan-".to_vec(),
        },
        scan_options(4),
    )
    .await
    .unwrap();
    assert_eq!(
        result.next_item().await.unwrap_err(),
        KeyValueError::RangeScanCompleted.into()
    );
}
