// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("transaction stream address has no host")]
    MissingAddress,
    #[error("auth token must not be empty")]
    MissingAuthToken,
    #[error("ending version {ending_version} is before starting version {starting_version}")]
    InvalidVersionRange {
        starting_version: u64,
        ending_version: u64,
    },
    #[error("channel buffer size must be at least 1")]
    ZeroChannelBuffer,
}

/// Everything that can end a stream session. Carried by `StreamEvent::Error`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("failed to connect to {address}: {message}")]
    Connect { address: String, message: String },
    #[error("timed out after {0:?} connecting to the transaction stream")]
    ConnectTimeout(Duration),
    #[error("rpc failed with {code:?}: {message}")]
    Rpc { code: tonic::Code, message: String },
    #[error("no response from the transaction stream within {0:?}")]
    ResponseTimeout(Duration),
    #[error("server closed the stream, next version would have been {next_version}")]
    StreamEnded { next_version: u64 },
    #[error("received an empty batch while expecting version {expected_version}")]
    EmptyBatch { expected_version: u64 },
    #[error("received batch starting at {actual} while expecting version {expected}")]
    VersionGap { expected: u64, actual: u64 },
    #[error("batch is not contiguous: expected version {expected}, found {actual}")]
    NonContiguousBatch { expected: u64, actual: u64 },
    #[error("response did not carry a chain id")]
    MissingChainId,
    #[error("version {0} cannot be incremented")]
    VersionOverflow(u64),
}

impl StreamError {
    /// The server sent something that breaks the stream contract. Never retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            StreamError::EmptyBatch { .. }
                | StreamError::VersionGap { .. }
                | StreamError::NonContiguousBatch { .. }
                | StreamError::MissingChainId
                | StreamError::VersionOverflow(_)
        )
    }

    /// Whether opening a new session from the last checkpoint may recover.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Rpc { code, .. } => !matches!(
                code,
                tonic::Code::Unauthenticated
                    | tonic::Code::PermissionDenied
                    | tonic::Code::InvalidArgument
            ),
            StreamError::Connect { .. }
            | StreamError::ConnectTimeout(_)
            | StreamError::ResponseTimeout(_)
            | StreamError::StreamEnded { .. } => true,
            _ => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::Connect { .. } => "connect",
            StreamError::ConnectTimeout(_) => "connect_timeout",
            StreamError::Rpc { .. } => "rpc",
            StreamError::ResponseTimeout(_) => "response_timeout",
            StreamError::StreamEnded { .. } => "stream_ended",
            StreamError::EmptyBatch { .. } => "empty_batch",
            StreamError::VersionGap { .. } => "version_gap",
            StreamError::NonContiguousBatch { .. } => "non_contiguous_batch",
            StreamError::MissingChainId => "missing_chain_id",
            StreamError::VersionOverflow(_) => "version_overflow",
        }
    }
}

impl From<tonic::Status> for StreamError {
    fn from(status: tonic::Status) -> Self {
        StreamError::Rpc {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

/// Errors raised by the resumable consumer and the reconnect supervisor. Stream
/// failures are not in here; they arrive as `StreamEvent::Error`.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("invalid stream config: {0}")]
    Config(#[from] ConfigError),
    #[error("checkpoint store failed: {0:#}")]
    Checkpoint(#[source] anyhow::Error),
    #[error("wrong chain detected: expected chain id {expected}, stream reports {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    #[error("version {0} cannot be incremented")]
    VersionOverflow(u64),
    #[error("gave up after {retries} reconnection attempts: {last_error}")]
    RetriesExhausted { retries: u64, last_error: StreamError },
    #[error("stream failed with a non-retryable error: {0}")]
    Fatal(StreamError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let gap = StreamError::VersionGap {
            expected: 10,
            actual: 12,
        };
        assert!(gap.is_protocol_violation());
        assert!(!gap.is_retryable());

        let unavailable = StreamError::from(tonic::Status::unavailable("upstream restarting"));
        assert!(!unavailable.is_protocol_violation());
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.kind(), "rpc");

        let denied = StreamError::from(tonic::Status::unauthenticated("bad key"));
        assert!(!denied.is_retryable());

        assert!(StreamError::ResponseTimeout(Duration::from_secs(60)).is_retryable());
        assert!(!StreamError::EmptyBatch {
            expected_version: 0
        }
        .is_retryable());
    }
}
