// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::TransactionStreamConfig,
    error::{ConfigError, StreamError},
    event::{SessionState, StreamEvent, StreamMetadata, StreamStatus, TransactionBatch},
    transport::{StreamRequest, TransactionSource, TransportStream, SERVICE_TYPE},
    utils::{
        counters::{
            LATEST_RECEIVED_VERSION, NUM_TRANSACTIONS_RECEIVED_COUNT, RECEIVED_BYTES_COUNT,
            STREAM_ERROR_COUNT, TRANSACTION_UNIX_TIMESTAMP,
        },
        util::{timestamp_to_iso, timestamp_to_unixtime},
    },
};
use anyhow::Context as AnyhowContext;
use aptos_protos::indexer::v1::TransactionsResponse;
use futures::{Stream, StreamExt};
use prost::Message;
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

/// One logical stream of transactions from a starting version.
///
/// A reader task owns the transport and pushes events into a bounded channel, so it
/// can never run more than `channel_buffer_size` events ahead of the caller. The
/// session never reconnects: after an `Error` or a `Completed` status the sequence
/// ends and a new session must be opened. Dropping the session aborts the reader
/// task and releases the connection.
pub struct StreamSession {
    receiver: mpsc::Receiver<StreamEvent>,
    state: watch::Receiver<SessionState>,
    join_handle: JoinHandle<()>,
    starting_version: u64,
}

impl StreamSession {
    /// Opens a session against `source`. Must be called within a tokio runtime.
    pub fn open(
        source: Arc<dyn TransactionSource>,
        config: &TransactionStreamConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::spawn(source, config))
    }

    /// Like [`StreamSession::open`], but a starting version past the ending version is
    /// accepted. Such a session yields `Completed` without connecting. Used when the
    /// starting version comes from a checkpoint of a finished bounded stream.
    pub fn resume(
        source: Arc<dyn TransactionSource>,
        config: &TransactionStreamConfig,
    ) -> Result<Self, ConfigError> {
        let mut checked = config.clone();
        if let Some(ending_version) = config.request_ending_version {
            checked.starting_version = checked.starting_version.min(ending_version);
        }
        checked.validate()?;
        Ok(Self::spawn(source, config))
    }

    fn spawn(source: Arc<dyn TransactionSource>, config: &TransactionStreamConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size);
        let (state_sender, state) = watch::channel(SessionState::Idle);
        let reader = SessionReader {
            stream_address: source.address(),
            source,
            request: StreamRequest {
                starting_version: config.starting_version,
                ending_version: config.request_ending_version,
            },
            request_name: config.request_name_header.clone(),
            connection_timeout: config.indexer_grpc_connection_timeout(),
            response_item_timeout: config.indexer_grpc_response_item_timeout(),
            sender,
            state: state_sender,
        };
        let join_handle = tokio::spawn(reader.run());

        Self {
            receiver,
            state,
            join_handle,
            starting_version: config.starting_version,
        }
    }

    /// Waits for the next event. `None` once the session has ended.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// State of the reader task. May be ahead of the events the caller has consumed.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn starting_version(&self) -> u64 {
        self.starting_version
    }
}

impl Stream for StreamSession {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

/// Opens a single-transaction session and returns the chain id the server reports.
pub async fn fetch_chain_id(
    source: Arc<dyn TransactionSource>,
    config: &TransactionStreamConfig,
) -> anyhow::Result<u64> {
    let config = config
        .clone()
        .with_request_ending_version(Some(config.starting_version));
    let mut session =
        StreamSession::open(source, &config).context("Invalid transaction stream config")?;
    while let Some(event) = session.next().await {
        match event {
            StreamEvent::Data { chain_id, .. } => return Ok(chain_id),
            StreamEvent::Error { error } => {
                return Err(error).context("Error receiving datastream response for chain id")
            },
            StreamEvent::Metadata { .. } | StreamEvent::Status { .. } => {},
        }
    }
    anyhow::bail!("Stream ended before getting response for chain id")
}

struct SessionReader {
    source: Arc<dyn TransactionSource>,
    stream_address: String,
    request: StreamRequest,
    request_name: String,
    connection_timeout: Duration,
    response_item_timeout: Duration,
    sender: mpsc::Sender<StreamEvent>,
    state: watch::Sender<SessionState>,
}

impl SessionReader {
    async fn run(self) {
        if let Some(ending_version) = self.request.ending_version {
            if self.request.starting_version > ending_version {
                let next_version = self.request.starting_version;
                return self.complete(None, next_version).await;
            }
        }

        self.state.send_replace(SessionState::Connecting);
        info!(
            service_type = SERVICE_TYPE,
            stream_address = self.stream_address,
            request_name = self.request_name,
            start_version = self.request.starting_version,
            end_version = self.request.ending_version,
            "[Stream] Connecting to GRPC stream",
        );

        let connect_result =
            tokio::time::timeout(self.connection_timeout, self.source.connect(self.request)).await;
        let transport = match connect_result {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return self.fail(None, e).await,
            Err(_) => {
                return self
                    .fail(None, StreamError::ConnectTimeout(self.connection_timeout))
                    .await
            },
        };
        let TransportStream {
            connection_id,
            mut responses,
        } = transport;

        info!(
            service_type = SERVICE_TYPE,
            stream_address = self.stream_address,
            connection_id,
            start_version = self.request.starting_version,
            end_version = self.request.ending_version,
            "[Stream] Successfully connected to GRPC stream",
        );
        self.state.send_replace(SessionState::Streaming);
        let metadata = StreamMetadata {
            stream_address: self.stream_address.clone(),
            connection_id: connection_id.clone(),
            request_name: self.request_name.clone(),
            starting_version: self.request.starting_version,
            ending_version: self.request.ending_version,
        };
        if !self.emit(StreamEvent::Metadata { metadata }).await
            || !self
                .emit(StreamEvent::Status {
                    status: StreamStatus::Established {
                        starting_version: self.request.starting_version,
                    },
                })
                .await
        {
            return;
        }

        let mut next_version = self.request.starting_version;
        loop {
            if let Some(ending_version) = self.request.ending_version {
                if next_version > ending_version {
                    return self.complete(connection_id.as_deref(), next_version).await;
                }
            }

            let recv_latency = Instant::now();
            let response =
                match tokio::time::timeout(self.response_item_timeout, responses.next()).await {
                    Ok(Some(Ok(response))) => response,
                    Ok(Some(Err(status))) => {
                        return self.fail(connection_id.as_deref(), status.into()).await
                    },
                    Ok(None) => {
                        return self
                            .fail(
                                connection_id.as_deref(),
                                StreamError::StreamEnded { next_version },
                            )
                            .await
                    },
                    Err(_) => {
                        return self
                            .fail(
                                connection_id.as_deref(),
                                StreamError::ResponseTimeout(self.response_item_timeout),
                            )
                            .await
                    },
                };

            let (chain_id, batch) = match self.frame(response, next_version, recv_latency) {
                Ok(framed) => framed,
                Err(e) => return self.fail(connection_id.as_deref(), e).await,
            };
            next_version = match batch.next_version() {
                Ok(version) => version,
                Err(e) => return self.fail(connection_id.as_deref(), e).await,
            };
            if !self
                .emit(StreamEvent::Data {
                    chain_id,
                    transactions: batch,
                })
                .await
            {
                return;
            }
        }
    }

    /// Validates one server response and turns it into a batch.
    fn frame(
        &self,
        response: TransactionsResponse,
        expected_version: u64,
        recv_latency: Instant,
    ) -> Result<(u64, TransactionBatch), StreamError> {
        let size_in_bytes = response.encoded_len() as u64;
        let chain_id = response.chain_id.ok_or(StreamError::MissingChainId)?;
        let batch = TransactionBatch::validated(response.transactions, expected_version)?;

        let duration_in_secs = recv_latency.elapsed().as_secs_f64();
        info!(
            service_type = SERVICE_TYPE,
            stream_address = self.stream_address,
            request_name = self.request_name,
            chain_id,
            start_version = batch.start_version(),
            end_version = batch.end_version(),
            start_txn_timestamp_iso = batch
                .start_txn_timestamp()
                .map(timestamp_to_iso)
                .unwrap_or_default(),
            end_txn_timestamp_iso = batch
                .end_txn_timestamp()
                .map(timestamp_to_iso)
                .unwrap_or_default(),
            num_of_transactions = batch.len(),
            size_in_bytes,
            duration_in_secs,
            "[Stream] Received transactions from GRPC.",
        );
        LATEST_RECEIVED_VERSION
            .with_label_values(&[&self.request_name])
            .set(batch.end_version() as i64);
        NUM_TRANSACTIONS_RECEIVED_COUNT
            .with_label_values(&[&self.request_name])
            .inc_by(batch.len() as u64);
        RECEIVED_BYTES_COUNT
            .with_label_values(&[&self.request_name])
            .inc_by(size_in_bytes);
        TRANSACTION_UNIX_TIMESTAMP
            .with_label_values(&[&self.request_name])
            .set(
                batch
                    .start_txn_timestamp()
                    .map(timestamp_to_unixtime)
                    .unwrap_or_default(),
            );

        Ok((chain_id, batch))
    }

    /// Returns false if the caller is gone.
    async fn emit(&self, event: StreamEvent) -> bool {
        self.sender.send(event).await.is_ok()
    }

    async fn complete(self, connection_id: Option<&str>, next_version: u64) {
        info!(
            service_type = SERVICE_TYPE,
            stream_address = self.stream_address,
            connection_id,
            ending_version = self.request.ending_version,
            next_version,
            "[Stream] Reached ending version.",
        );
        self.state.send_replace(SessionState::Completed);
        self.emit(StreamEvent::Status {
            status: StreamStatus::Completed { next_version },
        })
        .await;
    }

    async fn fail(self, connection_id: Option<&str>, error: StreamError) {
        warn!(
            service_type = SERVICE_TYPE,
            stream_address = self.stream_address,
            connection_id,
            start_version = self.request.starting_version,
            end_version = self.request.ending_version,
            protocol_violation = error.is_protocol_violation(),
            error = %error,
            "[Stream] Stream session failed."
        );
        STREAM_ERROR_COUNT
            .with_label_values(&[&self.request_name, error.kind()])
            .inc();
        self.state.send_replace(SessionState::Failed);
        self.emit(StreamEvent::Error { error }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{response, ScriptedSource};
    use url::Url;

    fn config(starting_version: u64) -> TransactionStreamConfig {
        TransactionStreamConfig::new(Url::parse("http://127.0.0.1:50051").unwrap(), "token")
            .with_starting_version(starting_version)
    }

    async fn collect(mut session: StreamSession) -> Vec<StreamEvent> {
        let mut events = vec![];
        while let Some(event) = session.next().await {
            events.push(event);
        }
        events
    }

    fn data_ranges(events: &[StreamEvent]) -> Vec<(u64, u64)> {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Data { transactions, .. } => {
                    Some((transactions.start_version(), transactions.end_version()))
                },
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batches_are_delivered_in_order() {
        let source = ScriptedSource::new(vec![vec![
            Ok(response(2, 0..=2)),
            Ok(response(2, 3..=3)),
            Ok(response(2, 4..=9)),
        ]]);
        let session = StreamSession::open(source.clone(), &config(0)).unwrap();
        let events = collect(session).await;

        assert!(matches!(events[0], StreamEvent::Metadata { .. }));
        assert_eq!(events[1], StreamEvent::Status {
            status: StreamStatus::Established {
                starting_version: 0
            }
        });
        let ranges = data_ranges(&events);
        assert_eq!(ranges, vec![(0, 2), (3, 3), (4, 9)]);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
        // Script exhausted, so the server closed without a defined end.
        assert_eq!(events.last().unwrap(), &StreamEvent::Error {
            error: StreamError::StreamEnded { next_version: 10 }
        });
        assert_eq!(source.requests(), vec![StreamRequest {
            starting_version: 0,
            ending_version: None,
        }]);
    }

    #[tokio::test]
    async fn test_chain_id_is_passed_through() {
        let source = ScriptedSource::new(vec![vec![
            Ok(response(2, 0..=1)),
            Ok(response(1, 2..=3)),
        ]]);
        let events = collect(StreamSession::open(source, &config(0)).unwrap()).await;
        let chain_ids: Vec<u64> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Data { chain_id, .. } => Some(*chain_id),
                _ => None,
            })
            .collect();
        assert_eq!(chain_ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_empty_batch_ends_session() {
        let source = ScriptedSource::new(vec![vec![
            Ok(response(2, 5..=6)),
            Ok(response(2, 1..=0)),
            Ok(response(2, 7..=8)),
        ]]);
        let mut session = StreamSession::open(source, &config(5)).unwrap();
        let mut events = vec![];
        while let Some(event) = session.next().await {
            events.push(event);
        }
        assert_eq!(data_ranges(&events), vec![(5, 6)]);
        assert_eq!(events.last().unwrap(), &StreamEvent::Error {
            error: StreamError::EmptyBatch {
                expected_version: 7
            }
        });
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_gap_between_batches_ends_session() {
        let source = ScriptedSource::new(vec![vec![
            Ok(response(2, 0..=4)),
            Ok(response(2, 6..=7)),
        ]]);
        let events = collect(StreamSession::open(source, &config(0)).unwrap()).await;
        assert_eq!(data_ranges(&events), vec![(0, 4)]);
        assert_eq!(events.last().unwrap(), &StreamEvent::Error {
            error: StreamError::VersionGap {
                expected: 5,
                actual: 6
            }
        });
    }

    #[tokio::test]
    async fn test_missing_chain_id_ends_session() {
        let mut without_chain_id = response(2, 0..=1);
        without_chain_id.chain_id = None;
        let source = ScriptedSource::new(vec![vec![Ok(without_chain_id)]]);
        let events = collect(StreamSession::open(source, &config(0)).unwrap()).await;
        assert!(data_ranges(&events).is_empty());
        assert_eq!(events.last().unwrap(), &StreamEvent::Error {
            error: StreamError::MissingChainId
        });
    }

    #[tokio::test]
    async fn test_rpc_error_ends_session() {
        let source = ScriptedSource::new(vec![vec![
            Ok(response(2, 0..=1)),
            Err(tonic::Status::unavailable("upstream is restarting")),
            Ok(response(2, 2..=3)),
        ]]);
        let events = collect(StreamSession::open(source, &config(0)).unwrap()).await;
        assert_eq!(data_ranges(&events), vec![(0, 1)]);
        assert_eq!(events.last().unwrap(), &StreamEvent::Error {
            error: StreamError::Rpc {
                code: tonic::Code::Unavailable,
                message: "upstream is restarting".to_string(),
            }
        });
    }

    #[tokio::test]
    async fn test_connect_error_ends_session() {
        let source = ScriptedSource::failing(StreamError::Connect {
            address: "http://127.0.0.1:50051/".to_string(),
            message: "connection refused".to_string(),
        });
        let events = collect(StreamSession::open(source, &config(0)).unwrap()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error {
            error: StreamError::Connect { .. }
        }));
    }

    #[tokio::test]
    async fn test_completes_at_ending_version() {
        let source = ScriptedSource::new(vec![vec![
            Ok(response(2, 100..=102)),
            Ok(response(2, 103..=104)),
            Ok(response(2, 105..=106)),
        ]]);
        let config = config(100).with_request_ending_version(Some(104));
        let mut session = StreamSession::open(source.clone(), &config).unwrap();
        let mut events = vec![];
        while let Some(event) = session.next().await {
            events.push(event);
        }
        assert_eq!(data_ranges(&events), vec![(100, 102), (103, 104)]);
        assert_eq!(events.last().unwrap(), &StreamEvent::Status {
            status: StreamStatus::Completed { next_version: 105 }
        });
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(source.requests()[0].transactions_count(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout_ends_session() {
        let source = ScriptedSource::new(vec![vec![Ok(response(2, 0..=0))]]).hanging();
        let mut config = config(0);
        config.indexer_grpc_response_item_timeout_secs = 3;
        let events = collect(StreamSession::open(source, &config).unwrap()).await;
        assert_eq!(data_ranges(&events), vec![(0, 0)]);
        assert_eq!(events.last().unwrap(), &StreamEvent::Error {
            error: StreamError::ResponseTimeout(Duration::from_secs(3))
        });
    }

    #[tokio::test]
    async fn test_reader_does_not_run_ahead_of_caller() {
        let batches = (0..20).map(|i| Ok(response(2, i..=i))).collect();
        let source = ScriptedSource::new(vec![batches]);
        let mut config = config(0);
        config.channel_buffer_size = 2;
        let mut session = StreamSession::open(source.clone(), &config).unwrap();

        // Metadata and Established fill the buffer; the reader is now parked.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(source.responses_taken() <= 3);

        let first = session.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Metadata { .. }));
        drop(session);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(source.responses_taken() <= 4);
        assert!(source.is_released());
    }

    #[tokio::test]
    async fn test_fetch_chain_id() {
        let source = ScriptedSource::new(vec![vec![Ok(response(2, 0..=0))]]);
        assert_eq!(fetch_chain_id(source.clone(), &config(0)).await.unwrap(), 2);
        assert_eq!(source.requests()[0].ending_version, Some(0));
    }

    #[tokio::test]
    async fn test_resume_past_ending_version_completes_without_connecting() {
        let source = ScriptedSource::new(vec![vec![Ok(response(2, 23..=25))]]);
        let config = config(23).with_request_ending_version(Some(22));
        assert_eq!(
            StreamSession::open(source.clone(), &config).err(),
            Some(ConfigError::InvalidVersionRange {
                starting_version: 23,
                ending_version: 22
            })
        );

        let mut session = StreamSession::resume(source.clone(), &config).unwrap();
        let mut events = vec![];
        while let Some(event) = session.next().await {
            events.push(event);
        }
        assert_eq!(events, vec![StreamEvent::Status {
            status: StreamStatus::Completed { next_version: 23 }
        }]);
        assert_eq!(session.state(), SessionState::Completed);
        assert!(source.requests().is_empty());
    }

    #[test]
    fn test_resume_still_validates_the_rest_of_the_config() {
        let source = ScriptedSource::new(vec![]);
        let mut config = config(23).with_request_ending_version(Some(22));
        config.channel_buffer_size = 0;
        assert_eq!(
            StreamSession::resume(source, &config).err(),
            Some(ConfigError::ZeroChannelBuffer)
        );
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        // Validation happens before the reader task is spawned, so no runtime is needed.
        let source = ScriptedSource::new(vec![]);
        let mut config = config(0);
        config.auth_token = String::new();
        assert_eq!(
            StreamSession::open(source, &config).err(),
            Some(ConfigError::MissingAuthToken)
        );
    }
}
