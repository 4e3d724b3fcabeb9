// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionStreamConfig {
    /// The address of the transaction stream service, e.g. `https://grpc.testnet.aptoslabs.com:443`.
    pub transaction_stream_address: Url,
    /// Inclusive. Ignored by the resumable consumer, which reads it from the checkpoint store.
    #[serde(default)]
    pub starting_version: u64,
    /// Inclusive. If unset the stream is open-ended.
    #[serde(default)]
    pub request_ending_version: Option<u64>,
    /// The API key, sent as a bearer token.
    pub auth_token: String,
    #[serde(default = "TransactionStreamConfig::default_request_name_header")]
    pub request_name_header: String,
    #[serde(default = "TransactionStreamConfig::default_indexer_grpc_http2_ping_interval")]
    pub indexer_grpc_http2_ping_interval_secs: u64,
    #[serde(default = "TransactionStreamConfig::default_indexer_grpc_http2_ping_timeout")]
    pub indexer_grpc_http2_ping_timeout_secs: u64,
    #[serde(default = "TransactionStreamConfig::default_indexer_grpc_connection_timeout")]
    pub indexer_grpc_connection_timeout_secs: u64,
    #[serde(default = "TransactionStreamConfig::default_indexer_grpc_response_item_timeout")]
    pub indexer_grpc_response_item_timeout_secs: u64,
    #[serde(default = "TransactionStreamConfig::default_channel_buffer_size")]
    pub channel_buffer_size: usize,
}

impl TransactionStreamConfig {
    pub fn new(transaction_stream_address: Url, auth_token: impl Into<String>) -> Self {
        Self {
            transaction_stream_address,
            starting_version: 0,
            request_ending_version: None,
            auth_token: auth_token.into(),
            request_name_header: Self::default_request_name_header(),
            indexer_grpc_http2_ping_interval_secs: Self::default_indexer_grpc_http2_ping_interval(),
            indexer_grpc_http2_ping_timeout_secs: Self::default_indexer_grpc_http2_ping_timeout(),
            indexer_grpc_connection_timeout_secs: Self::default_indexer_grpc_connection_timeout(),
            indexer_grpc_response_item_timeout_secs:
                Self::default_indexer_grpc_response_item_timeout(),
            channel_buffer_size: Self::default_channel_buffer_size(),
        }
    }

    pub fn with_starting_version(mut self, starting_version: u64) -> Self {
        self.starting_version = starting_version;
        self
    }

    pub fn with_request_ending_version(mut self, request_ending_version: Option<u64>) -> Self {
        self.request_ending_version = request_ending_version;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transaction_stream_address.host_str().unwrap_or_default().is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        if self.auth_token.trim().is_empty() {
            return Err(ConfigError::MissingAuthToken);
        }
        if let Some(ending_version) = self.request_ending_version {
            if ending_version < self.starting_version {
                return Err(ConfigError::InvalidVersionRange {
                    starting_version: self.starting_version,
                    ending_version,
                });
            }
        }
        if self.channel_buffer_size == 0 {
            return Err(ConfigError::ZeroChannelBuffer);
        }
        Ok(())
    }

    pub const fn indexer_grpc_http2_ping_interval(&self) -> Duration {
        Duration::from_secs(self.indexer_grpc_http2_ping_interval_secs)
    }

    pub const fn indexer_grpc_http2_ping_timeout(&self) -> Duration {
        Duration::from_secs(self.indexer_grpc_http2_ping_timeout_secs)
    }

    pub const fn indexer_grpc_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.indexer_grpc_connection_timeout_secs)
    }

    pub const fn indexer_grpc_response_item_timeout(&self) -> Duration {
        Duration::from_secs(self.indexer_grpc_response_item_timeout_secs)
    }

    pub fn default_request_name_header() -> String {
        "resumable-transaction-stream".to_string()
    }

    /// Indexer GRPC http2 ping interval in seconds. Defaults to 30.
    /// Tonic ref: https://docs.rs/tonic/latest/tonic/transport/channel/struct.Endpoint.html#method.http2_keep_alive_interval
    pub const fn default_indexer_grpc_http2_ping_interval() -> u64 {
        30
    }

    /// Indexer GRPC http2 ping timeout in seconds. Defaults to 10.
    pub const fn default_indexer_grpc_http2_ping_timeout() -> u64 {
        10
    }

    /// Default timeout for establishing a grpc connection. Defaults to 5 seconds.
    pub const fn default_indexer_grpc_connection_timeout() -> u64 {
        5
    }

    /// Default timeout for receiving an item from grpc stream. Defaults to 60 seconds.
    pub const fn default_indexer_grpc_response_item_timeout() -> u64 {
        60
    }

    /// How many events the reader task may buffer ahead of the caller.
    pub const fn default_channel_buffer_size() -> usize {
        10
    }
}
