// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use aptos_protos::{
    indexer::v1::TransactionsResponse, transaction::v1::Transaction, util::timestamp::Timestamp,
};
use futures::{stream, StreamExt};
use resumable_transaction_stream::{
    error::StreamError,
    transport::{StreamRequest, TransportStream},
    CheckpointStore, ConsumerError, ConsumerOptions, FileCheckpointStore, ReconnectPolicy,
    ReconnectSupervisor, ResumableConsumer, StreamEvent, TransactionSource,
    TransactionStreamConfig,
};
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tempfile::TempDir;
use url::Url;


/// How a single connection to the [`FakeChain`] behaves.
#[derive(Clone, Copy, Debug)]
pub enum Connection {
    /// Serve until the chain or the requested range runs out, then close.
    Healthy,
    /// Serve this many batches, then fail with `UNAVAILABLE`.
    DropAfter(usize),
    /// Refuse the connection.
    Refuse,
}

/// A chain of `num_transactions` transactions starting at version 0, served over an
/// in-process transport in batches of `batch_size`.
pub struct FakeChain {
    chain_id: u64,
    transactions: Arc<Vec<Transaction>>,
    batch_size: usize,
    connections: Mutex<VecDeque<Connection>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl FakeChain {
    pub fn new(chain_id: u64, num_transactions: u64, batch_size: usize) -> Arc<Self> {
        Self::with_connections(chain_id, num_transactions, batch_size, vec![])
    }

    /// Connections beyond the given list are [`Connection::Healthy`].
    pub fn with_connections(
        chain_id: u64,
        num_transactions: u64,
        batch_size: usize,
        connections: Vec<Connection>,
    ) -> Arc<Self> {
        let transactions = (0..num_transactions)
            .map(|version| Transaction {
                version,
                timestamp: Some(Timestamp {
                    seconds: 1_700_000_000 + version as i64,
                    nanos: 0,
                }),
                ..Transaction::default()
            })
            .collect();
        Arc::new(Self {
            chain_id,
            transactions: Arc::new(transactions),
            batch_size,
            connections: Mutex::new(connections.into()),
            requests: Mutex::new(vec![]),
        })
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn batches(&self, request: StreamRequest) -> Vec<TransactionsResponse> {
        let end = match request.ending_version {
            Some(ending_version) => (ending_version + 1).min(self.transactions.len() as u64),
            None => self.transactions.len() as u64,
        };
        if request.starting_version >= end {
            return vec![];
        }
        self.transactions[request.starting_version as usize..end as usize]
            .chunks(self.batch_size)
            .map(|chunk| TransactionsResponse {
                transactions: chunk.to_vec(),
                chain_id: Some(self.chain_id),
                ..TransactionsResponse::default()
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl TransactionSource for FakeChain {
    fn address(&self) -> String {
        "http://fake-chain.local:50051/".to_string()
    }

    async fn connect(&self, request: StreamRequest) -> Result<TransportStream, StreamError> {
        self.requests.lock().unwrap().push(request);
        let connection = self
            .connections
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Connection::Healthy);

        let batches = self.batches(request);
        let responses = match connection {
            Connection::Healthy => stream::iter(batches.into_iter().map(Ok)).boxed(),
            Connection::DropAfter(n) => stream::iter(
                batches
                    .into_iter()
                    .take(n)
                    .map(Ok)
                    .chain(std::iter::once(Err(tonic::Status::unavailable(
                        "connection reset",
                    )))),
            )
            .boxed(),
            Connection::Refuse => {
                return Err(StreamError::Connect {
                    address: self.address(),
                    message: "connection refused".to_string(),
                })
            },
        };
        Ok(TransportStream {
            connection_id: Some(format!("fake-{}", request.starting_version)),
            responses,
        })
    }
}

/// The test context owns a checkpoint file that outlives individual consumer runs, so
/// a test can stop a consumer and start another one as a restarted process would.
pub struct TestContext {
    checkpoint_dir: TempDir,
    pub config: TransactionStreamConfig,
}

impl TestContext {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            checkpoint_dir: tempfile::tempdir()?,
            config: TransactionStreamConfig::new(
                Url::parse("http://fake-chain.local:50051")?,
                "integration-test-token",
            ),
        })
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir.path().join("checkpoint.json")
    }

    /// A fresh handle on the checkpoint file, as a new process would open it.
    pub fn store(&self) -> Arc<FileCheckpointStore> {
        Arc::new(FileCheckpointStore::new(self.checkpoint_path()))
    }

    pub async fn consumer(
        &self,
        source: Arc<dyn TransactionSource>,
        options: &ConsumerOptions,
    ) -> Result<ResumableConsumer<Arc<FileCheckpointStore>>, ConsumerError> {
        ResumableConsumer::run(source, &self.config, self.store(), options).await
    }

    pub fn supervisor(
        &self,
        source: Arc<dyn TransactionSource>,
        options: ConsumerOptions,
        policy: ReconnectPolicy,
    ) -> ReconnectSupervisor<FileCheckpointStore> {
        ReconnectSupervisor::new(source, self.config.clone(), self.store(), options, policy)
    }
}

/// What a consumer run delivered.
#[derive(Debug, Default)]
pub struct Delivered {
    pub versions: Vec<u64>,
    pub chain_ids: Vec<u64>,
    pub errors: Vec<StreamError>,
    pub failure: Option<ConsumerError>,
}

impl Delivered {
    pub fn record(&mut self, item: Result<StreamEvent, ConsumerError>) {
        match item {
            Ok(StreamEvent::Data {
                chain_id,
                transactions,
            }) => {
                self.chain_ids.push(chain_id);
                self.versions
                    .extend(transactions.transactions().iter().map(|txn| txn.version));
            },
            Ok(StreamEvent::Error { error }) => self.errors.push(error),
            Ok(_) => {},
            Err(e) => self.failure = Some(e),
        }
    }

    /// Pull everything until the consumer ends.
    pub async fn drain<S: CheckpointStore>(consumer: &mut ResumableConsumer<S>) -> Self {
        let mut delivered = Self::default();
        while let Some(item) = consumer.next().await {
            delivered.record(item);
        }
        delivered
    }

    /// Pull everything until the supervisor ends.
    pub async fn drain_supervisor<S: CheckpointStore>(
        supervisor: &mut ReconnectSupervisor<S>,
    ) -> Self {
        let mut delivered = Self::default();
        while let Some(item) = supervisor.next().await {
            delivered.record(item);
        }
        delivered
    }

    /// Pull until `num_batches` batches have been handed out, then stop pulling. The
    /// last batch is handed out but never acknowledged.
    pub async fn take_batches<S: CheckpointStore>(
        consumer: &mut ResumableConsumer<S>,
        num_batches: usize,
    ) -> Self {
        let mut delivered = Self::default();
        let mut batches = 0;
        while batches < num_batches {
            let Some(item) = consumer.next().await else {
                break;
            };
            if matches!(item, Ok(StreamEvent::Data { .. })) {
                batches += 1;
            }
            delivered.record(item);
        }
        delivered
    }

    pub fn is_contiguous_from(&self, starting_version: u64) -> bool {
        self.versions
            .iter()
            .enumerate()
            .all(|(i, version)| *version == starting_version + i as u64)
    }
}
