// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use aptos_protos::util::timestamp::Timestamp;
use chrono::{DateTime, Utc};

// 9999-12-31 23:59:59, this is the max supported by Google BigQuery
pub const MAX_TIMESTAMP_SECS: i64 = 253_402_300_799;

pub fn parse_timestamp(ts: &Timestamp) -> Option<DateTime<Utc>> {
    let (seconds, nanos) = if ts.seconds >= MAX_TIMESTAMP_SECS {
        (MAX_TIMESTAMP_SECS, 0)
    } else {
        (ts.seconds, ts.nanos)
    };
    DateTime::from_timestamp(seconds, u32::try_from(nanos).ok()?)
}

/// Convert the protobuf timestamp to ISO format. Empty if the timestamp is invalid.
pub fn timestamp_to_iso(timestamp: &Timestamp) -> String {
    parse_timestamp(timestamp)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string())
        .unwrap_or_default()
}

/// Convert the protobuf timestamp to unixtime
pub fn timestamp_to_unixtime(timestamp: &Timestamp) -> f64 {
    timestamp.seconds as f64 + timestamp.nanos as f64 * 1e-9
}
