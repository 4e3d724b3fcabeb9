// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge_vec, register_int_counter_vec, register_int_gauge_vec, GaugeVec, IntCounterVec,
    IntGaugeVec,
};

pub const TRANSACTION_STREAM_METRICS_PREFIX: &str = "resumable_transaction_stream";

/// Latest version received from the stream
pub static LATEST_RECEIVED_VERSION: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        format!("{}_latest_received_version", TRANSACTION_STREAM_METRICS_PREFIX),
        "Latest version received from the transaction stream",
        &["request_name"]
    )
    .unwrap()
});

/// Count of transactions received.
pub static NUM_TRANSACTIONS_RECEIVED_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        format!(
            "{}_num_transactions_received_count",
            TRANSACTION_STREAM_METRICS_PREFIX
        ),
        "Number of transactions received from the transaction stream",
        &["request_name"]
    )
    .unwrap()
});

/// Count of bytes received.
pub static RECEIVED_BYTES_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        format!("{}_received_bytes_count", TRANSACTION_STREAM_METRICS_PREFIX),
        "Count of bytes received from the transaction stream",
        &["request_name"]
    )
    .unwrap()
});

/// Transaction timestamp in unixtime
pub static TRANSACTION_UNIX_TIMESTAMP: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        format!(
            "{}_transaction_unix_timestamp",
            TRANSACTION_STREAM_METRICS_PREFIX
        ),
        "Timestamp of the first transaction of the latest batch in unixtime",
        &["request_name"]
    )
    .unwrap()
});

/// Stream errors by kind.
pub static STREAM_ERROR_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        format!("{}_stream_error_count", TRANSACTION_STREAM_METRICS_PREFIX),
        "Number of stream sessions that ended with an error",
        &["request_name", "kind"]
    )
    .unwrap()
});

/// Version persisted to the checkpoint store, i.e. the version a restart resumes from.
pub static CHECKPOINT_VERSION: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        format!("{}_checkpoint_version", TRANSACTION_STREAM_METRICS_PREFIX),
        "Next version to stream from, as last committed to the checkpoint store",
        &["request_name"]
    )
    .unwrap()
});

/// Reconnections performed by the supervisor.
pub static RECONNECTION_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        format!("{}_reconnection_count", TRANSACTION_STREAM_METRICS_PREFIX),
        "Number of times the transaction stream was reopened from a checkpoint",
        &["request_name"]
    )
    .unwrap()
});
