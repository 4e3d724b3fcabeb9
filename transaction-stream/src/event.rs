// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::error::StreamError;
use aptos_protos::{transaction::v1::Transaction, util::timestamp::Timestamp};

/// A non-empty run of transactions with contiguous, increasing versions, exactly as
/// one server response delivered it.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionBatch {
    transactions: Vec<Transaction>,
}

impl TransactionBatch {
    /// Checks that the batch is non-empty, starts at `expected_version` and has no
    /// holes.
    pub fn validated(
        transactions: Vec<Transaction>,
        expected_version: u64,
    ) -> Result<Self, StreamError> {
        let first = transactions
            .first()
            .ok_or(StreamError::EmptyBatch { expected_version })?;
        if first.version != expected_version {
            return Err(StreamError::VersionGap {
                expected: expected_version,
                actual: first.version,
            });
        }
        for pair in transactions.windows(2) {
            let expected = pair[0]
                .version
                .checked_add(1)
                .ok_or(StreamError::VersionOverflow(pair[0].version))?;
            if pair[1].version != expected {
                return Err(StreamError::NonContiguousBatch {
                    expected,
                    actual: pair[1].version,
                });
            }
        }
        Ok(Self { transactions })
    }

    pub fn start_version(&self) -> u64 {
        self.transactions[0].version
    }

    pub fn end_version(&self) -> u64 {
        self.transactions[self.transactions.len() - 1].version
    }

    /// The version to resume from once this batch has been processed.
    pub fn next_version(&self) -> Result<u64, StreamError> {
        let end_version = self.end_version();
        end_version
            .checked_add(1)
            .ok_or(StreamError::VersionOverflow(end_version))
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn start_txn_timestamp(&self) -> Option<&Timestamp> {
        self.transactions[0].timestamp.as_ref()
    }

    pub fn end_txn_timestamp(&self) -> Option<&Timestamp> {
        self.transactions[self.transactions.len() - 1]
            .timestamp
            .as_ref()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }
}

/// Connection details, reported once per session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMetadata {
    pub stream_address: String,
    /// Value of the `x-aptos-connection-id` response header, if the server sent one.
    pub connection_id: Option<String>,
    pub request_name: String,
    pub starting_version: u64,
    pub ending_version: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    /// The server accepted the request; data follows.
    Established { starting_version: u64 },
    /// The requested ending version was reached. No more events follow.
    Completed { next_version: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Data {
        chain_id: u64,
        transactions: TransactionBatch,
    },
    Error {
        error: StreamError,
    },
    Metadata {
        metadata: StreamMetadata,
    },
    Status {
        status: StreamStatus,
    },
}

/// Lifecycle of a single stream session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
}
