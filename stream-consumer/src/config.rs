// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::worker::Worker;
use anyhow::{Context, Result};
use resumable_transaction_stream::{
    ConsumerOptions, FileCheckpointStore, GrpcTransactionSource, ReconnectPolicy,
    TransactionStreamConfig,
};
use serde::{Deserialize, Serialize};
use server_framework::RunnableConfig;
use std::{path::PathBuf, sync::Arc};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConsumerConfig {
    pub transaction_stream_config: TransactionStreamConfig,
    /// JSON file holding the version to resume from.
    pub checkpoint_path: PathBuf,
    pub expected_chain_id: Option<u64>,
    pub initial_starting_version: Option<u64>,
    pub starting_version_override: Option<u64>,
    #[serde(default)]
    pub reconnect_policy: ReconnectPolicy,
}

impl StreamConsumerConfig {
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            initial_starting_version: self.initial_starting_version,
            starting_version_override: self.starting_version_override,
            expected_chain_id: self.expected_chain_id,
        }
    }
}

#[async_trait::async_trait]
impl RunnableConfig for StreamConsumerConfig {
    fn validate(&self) -> Result<()> {
        self.transaction_stream_config
            .validate()
            .context("Invalid transaction_stream_config")
    }

    async fn run(&self) -> Result<()> {
        let source = Arc::new(GrpcTransactionSource::new(&self.transaction_stream_config));
        let store = Arc::new(FileCheckpointStore::new(self.checkpoint_path.clone()));
        let mut worker = Worker::new(
            source,
            self.transaction_stream_config.clone(),
            store,
            self.consumer_options(),
            self.reconnect_policy.clone(),
        );
        worker.run().await
    }

    fn get_server_name(&self) -> String {
        let name = &self.transaction_stream_config.request_name_header;
        name[..name.len().min(12)].to_string()
    }
}
