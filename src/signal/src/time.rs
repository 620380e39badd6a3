// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! ISO-8601 UTC timestamp formatting for the file sink.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDateTime;

/// Formats `(seconds_since_epoch, microseconds)` as
/// `YYYY-MM-DDTHH:MM:SS.uuuuuuZ`: 27 characters, zero-padded fields,
/// microseconds always six digits.
pub fn to_iso8601_utc(seconds: i64, microseconds: i64) -> String {
    let datetime = NaiveDateTime::from_timestamp_opt(seconds, 0)
        .unwrap_or_else(|| NaiveDateTime::from_timestamp_opt(0, 0).unwrap());
    format!(
        "{}.{:06}Z",
        datetime.format("%Y-%m-%dT%H:%M:%S"),
        microseconds.clamp(0, 999_999)
    )
}

/// Formats a [`SystemTime`] with [`to_iso8601_utc`]. Times before the epoch
/// render as the epoch.
pub fn format_system_time(time: SystemTime) -> String {
    let duration = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    to_iso8601_utc(duration.as_secs() as i64, i64::from(duration.subsec_micros()))
}
