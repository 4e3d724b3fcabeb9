// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use resumable_transaction_stream::{
    checkpoint::STARTING_VERSION_KEY, fetch_chain_id, utils::util::timestamp_to_iso,
    CheckpointStore, ConsumerOptions, ReconnectPolicy, ReconnectSupervisor, StreamEvent,
    StreamStatus, TransactionSource, TransactionStreamConfig,
};
use std::sync::Arc;
use tracing::{info, warn};

const SERVICE_TYPE: &str = "stream_consumer";

pub struct Worker<S: CheckpointStore> {
    source: Arc<dyn TransactionSource>,
    config: TransactionStreamConfig,
    store: Arc<S>,
    options: ConsumerOptions,
    policy: ReconnectPolicy,
    num_batches_received: u64,
    num_transactions_received: u64,
}

impl<S: CheckpointStore> Worker<S> {
    pub fn new(
        source: Arc<dyn TransactionSource>,
        config: TransactionStreamConfig,
        store: Arc<S>,
        options: ConsumerOptions,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            source,
            config,
            store,
            options,
            policy,
            num_batches_received: 0,
            num_transactions_received: 0,
        }
    }

    /// Checks the chain id, then follows the stream until it completes or fails for
    /// good.
    pub async fn run(&mut self) -> Result<()> {
        self.check_chain_id().await?;

        let mut supervisor = ReconnectSupervisor::new(
            self.source.clone(),
            self.config.clone(),
            self.store.clone(),
            self.options.clone(),
            self.policy.clone(),
        );
        while let Some(item) = supervisor.next().await {
            let event = item.context("Transaction stream stopped")?;
            self.log_event(&event);
        }
        info!(
            service_type = SERVICE_TYPE,
            request_name = self.config.request_name_header,
            num_batches_received = self.num_batches_received,
            num_transactions_received = self.num_transactions_received,
            "[Stream Consumer] Stream completed, exiting."
        );
        Ok(())
    }

    /// Verify the chain id reported at the resume point against the configured one.
    /// Without a configured chain id, the reported one is required from then on.
    async fn check_chain_id(&mut self) -> Result<()> {
        let starting_version_from_store = self
            .store
            .get(STARTING_VERSION_KEY)
            .await
            .context("Failed to read checkpoint")?;
        let starting_version = self
            .options
            .determine_starting_version(starting_version_from_store);
        if self
            .config
            .request_ending_version
            .is_some_and(|ending_version| starting_version > ending_version)
        {
            // Nothing left to stream, so nothing to check.
            return Ok(());
        }

        info!(
            service_type = SERVICE_TYPE,
            request_name = self.config.request_name_header,
            start_version = starting_version,
            "[Stream Consumer] Checking if chain id is correct"
        );
        let chain_id = fetch_chain_id(
            self.source.clone(),
            &self.config.clone().with_starting_version(starting_version),
        )
        .await
        .context("Failed to fetch chain id")?;
        if let Some(expected_chain_id) = self.options.expected_chain_id {
            anyhow::ensure!(
                expected_chain_id == chain_id,
                "Wrong chain detected! Expected chain {} but the stream serves chain {}",
                expected_chain_id,
                chain_id
            );
        }
        info!(
            service_type = SERVICE_TYPE,
            request_name = self.config.request_name_header,
            chain_id,
            "[Stream Consumer] Chain id matches! Continue to stream..."
        );
        self.options.expected_chain_id = Some(chain_id);
        Ok(())
    }

    pub fn num_transactions_received(&self) -> u64 {
        self.num_transactions_received
    }

    fn log_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Data {
                chain_id,
                transactions,
            } => {
                self.num_batches_received += 1;
                self.num_transactions_received += transactions.len() as u64;
                info!(
                    service_type = SERVICE_TYPE,
                    request_name = self.config.request_name_header,
                    chain_id,
                    start_version = transactions.start_version(),
                    end_version = transactions.end_version(),
                    num_of_transactions = transactions.len(),
                    start_txn_timestamp_iso = transactions
                        .start_txn_timestamp()
                        .map(timestamp_to_iso)
                        .unwrap_or_default(),
                    end_txn_timestamp_iso = transactions
                        .end_txn_timestamp()
                        .map(timestamp_to_iso)
                        .unwrap_or_default(),
                    "[Stream Consumer] Received batch"
                );
            },
            StreamEvent::Metadata { metadata } => info!(
                service_type = SERVICE_TYPE,
                request_name = self.config.request_name_header,
                stream_address = metadata.stream_address,
                connection_id = metadata.connection_id.as_deref().unwrap_or("None"),
                start_version = metadata.starting_version,
                end_version = metadata.ending_version,
                "[Stream Consumer] Connected"
            ),
            StreamEvent::Status {
                status: StreamStatus::Established { starting_version },
            } => info!(
                service_type = SERVICE_TYPE,
                request_name = self.config.request_name_header,
                start_version = starting_version,
                "[Stream Consumer] Stream established"
            ),
            StreamEvent::Status {
                status: StreamStatus::Completed { next_version },
            } => info!(
                service_type = SERVICE_TYPE,
                request_name = self.config.request_name_header,
                next_version,
                "[Stream Consumer] Reached the ending version"
            ),
            StreamEvent::Error { error } => warn!(
                service_type = SERVICE_TYPE,
                request_name = self.config.request_name_header,
                error = %error,
                retryable = error.is_retryable(),
                "[Stream Consumer] Stream session failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resumable_transaction_stream::{
        test_utils::{response, ScriptedSource},
        FileCheckpointStore,
    };
    use url::Url;

    fn config() -> TransactionStreamConfig {
        TransactionStreamConfig::new(Url::parse("http://127.0.0.1:50051").unwrap(), "token")
            .with_request_ending_version(Some(9))
    }

    fn worker(
        source: Arc<ScriptedSource>,
        store: Arc<FileCheckpointStore>,
        options: ConsumerOptions,
    ) -> Worker<FileCheckpointStore> {
        Worker::new(source, config(), store, options, ReconnectPolicy::default())
    }

    #[tokio::test]
    async fn test_runs_to_completion_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoint.json")));
        let source = ScriptedSource::new(vec![
            // Chain id lookup.
            vec![Ok(response(2, 0..=0))],
            vec![Ok(response(2, 0..=4)), Ok(response(2, 5..=9))],
        ]);

        let mut worker = worker(source.clone(), store.clone(), ConsumerOptions::default());
        worker.run().await.unwrap();

        assert_eq!(worker.num_transactions_received(), 10);
        assert_eq!(store.get(STARTING_VERSION_KEY).await.unwrap(), Some(10));
        let requests = source.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].ending_version, Some(0));
    }

    #[tokio::test]
    async fn test_wrong_chain_is_rejected_before_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoint.json")));
        let source = ScriptedSource::new(vec![
            vec![Ok(response(1, 0..=0))],
            vec![Ok(response(1, 0..=4))],
        ]);

        let mut worker = worker(source.clone(), store.clone(), ConsumerOptions {
            expected_chain_id: Some(2),
            ..ConsumerOptions::default()
        });
        let err = worker.run().await.unwrap_err();

        assert!(err.to_string().contains("Wrong chain detected"));
        assert_eq!(worker.num_transactions_received(), 0);
        assert_eq!(source.requests().len(), 1);
        assert_eq!(store.get(STARTING_VERSION_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_looked_up_chain_id_is_enforced_on_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoint.json")));
        let source = ScriptedSource::new(vec![
            vec![Ok(response(2, 0..=0))],
            vec![Ok(response(1, 0..=4))],
        ]);

        let mut worker = worker(source, store.clone(), ConsumerOptions::default());
        assert!(worker.run().await.is_err());
        assert_eq!(worker.num_transactions_received(), 0);
        assert_eq!(store.get(STARTING_VERSION_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_restart_after_completion_exits_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoint.json")));
        store.upsert(STARTING_VERSION_KEY, 10).await.unwrap();
        let source = ScriptedSource::new(vec![]);

        let mut worker = worker(source.clone(), store.clone(), ConsumerOptions::default());
        worker.run().await.unwrap();

        assert_eq!(worker.num_transactions_received(), 0);
        assert!(source.requests().is_empty());
        assert_eq!(store.get(STARTING_VERSION_KEY).await.unwrap(), Some(10));
    }
}
