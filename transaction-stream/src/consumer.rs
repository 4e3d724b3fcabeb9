// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    checkpoint::{CheckpointStore, STARTING_VERSION_KEY},
    config::TransactionStreamConfig,
    error::{ConsumerError, StreamError},
    event::StreamEvent,
    session::StreamSession,
    transport::{TransactionSource, SERVICE_TYPE},
    utils::counters::CHECKPOINT_VERSION,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerOptions {
    /// If there is no checkpoint in the store, this is the version from which we'll
    /// start streaming txns. Defaults to 0.
    #[serde(default)]
    pub initial_starting_version: Option<u64>,

    /// Even if there is a checkpoint in the store, start streaming txns from this
    /// version.
    #[serde(default)]
    pub starting_version_override: Option<u64>,

    /// Chain the stream must report. If unset, the chain id of the first batch is
    /// pinned for the rest of the run.
    #[serde(default)]
    pub expected_chain_id: Option<u64>,
}

impl ConsumerOptions {
    pub fn determine_starting_version(&self, starting_version_from_store: Option<u64>) -> u64 {
        let (starting_version, source) = match self.starting_version_override {
            Some(version) => (version, "starting_version_override"),
            None => match starting_version_from_store {
                Some(version) => (version, "checkpoint_store"),
                None => match self.initial_starting_version {
                    Some(version) => (version, "initial_starting_version"),
                    None => (0, "default"),
                },
            },
        };
        info!(
            service_type = SERVICE_TYPE,
            start_version = starting_version,
            source = source,
            "[Stream] Starting from version {} (source: {})",
            starting_version,
            source
        );
        starting_version
    }
}

/// Adds resume-after-interruption to a [`StreamSession`].
///
/// Every event of the session is handed to the caller unchanged. For each Data event
/// the version after the batch is written to the checkpoint store once the caller
/// asks for the following event, i.e. after the caller is done with the batch. A
/// crash or drop before that point replays the batch on the next run; nothing is
/// ever skipped.
///
/// The consumer does not retry. When the session ends, so does the consumer; run it
/// again with the same store to pick up from the last checkpoint.
pub struct ResumableConsumer<S: CheckpointStore> {
    session: StreamSession,
    store: S,
    request_name: String,
    expected_chain_id: Option<u64>,
    starting_version: u64,
    pending_checkpoint: Option<u64>,
    last_committed_version: Option<u64>,
    last_error: Option<StreamError>,
    finished: bool,
}

impl<S: CheckpointStore> ResumableConsumer<S> {
    /// Reads the checkpoint and opens a session from it. `config.starting_version` is
    /// ignored. If the checkpoint is already past `config.request_ending_version`, the
    /// only event is `Completed`.
    pub async fn run(
        source: Arc<dyn TransactionSource>,
        config: &TransactionStreamConfig,
        store: S,
        options: &ConsumerOptions,
    ) -> Result<Self, ConsumerError> {
        let starting_version_from_store = store
            .get(STARTING_VERSION_KEY)
            .await
            .map_err(ConsumerError::Checkpoint)?;
        let starting_version = options.determine_starting_version(starting_version_from_store);
        let config = config.clone().with_starting_version(starting_version);
        let session = StreamSession::resume(source, &config)?;

        Ok(Self {
            session,
            store,
            request_name: config.request_name_header.clone(),
            expected_chain_id: options.expected_chain_id,
            starting_version,
            pending_checkpoint: None,
            last_committed_version: None,
            last_error: None,
            finished: false,
        })
    }

    /// Commits the previous batch, if any, then waits for the next event.
    ///
    /// `None` once the session has ended. An `Err` is always the last item.
    pub async fn next(&mut self) -> Option<Result<StreamEvent, ConsumerError>> {
        if self.finished {
            return None;
        }
        if let Some(next_version) = self.pending_checkpoint.take() {
            if let Err(e) = self.commit(next_version).await {
                return Some(Err(self.finish(e)));
            }
        }

        let event = match self.session.next().await {
            Some(event) => event,
            None => {
                self.finished = true;
                return None;
            },
        };

        match &event {
            StreamEvent::Data {
                chain_id,
                transactions,
            } => {
                match self.expected_chain_id {
                    Some(expected) if expected != *chain_id => {
                        return Some(Err(self.finish(ConsumerError::ChainIdMismatch {
                            expected,
                            actual: *chain_id,
                        })));
                    },
                    Some(_) => {},
                    None => self.expected_chain_id = Some(*chain_id),
                }
                match transactions.next_version() {
                    Ok(next_version) => self.pending_checkpoint = Some(next_version),
                    Err(_) => {
                        return Some(Err(self.finish(ConsumerError::VersionOverflow(
                            transactions.end_version(),
                        ))));
                    },
                }
            },
            StreamEvent::Error { error } => self.last_error = Some(error.clone()),
            StreamEvent::Metadata { .. } | StreamEvent::Status { .. } => {},
        }
        Some(Ok(event))
    }

    /// Adapts the consumer into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamEvent, ConsumerError>> {
        futures::stream::unfold(self, |mut consumer| async move {
            consumer.next().await.map(|item| (item, consumer))
        })
    }

    pub fn starting_version(&self) -> u64 {
        self.starting_version
    }

    /// Chain id expected from, or pinned by, this run.
    pub fn chain_id(&self) -> Option<u64> {
        self.expected_chain_id
    }

    pub fn last_committed_version(&self) -> Option<u64> {
        self.last_committed_version
    }

    /// The error that ended the underlying session, if it failed.
    pub fn last_error(&self) -> Option<&StreamError> {
        self.last_error.as_ref()
    }

    async fn commit(&mut self, next_version: u64) -> Result<(), ConsumerError> {
        self.store
            .upsert(STARTING_VERSION_KEY, next_version)
            .await
            .map_err(ConsumerError::Checkpoint)?;
        self.last_committed_version = Some(next_version);
        CHECKPOINT_VERSION
            .with_label_values(&[&self.request_name])
            .set(next_version as i64);
        debug!(
            service_type = SERVICE_TYPE,
            request_name = self.request_name,
            next_version,
            "[Stream] Committed checkpoint."
        );
        Ok(())
    }

    fn finish(&mut self, error: ConsumerError) -> ConsumerError {
        error!(
            service_type = SERVICE_TYPE,
            request_name = self.request_name,
            last_committed_version = self.last_committed_version,
            error = %error,
            "[Stream] Resumable consumer stopped."
        );
        self.finished = true;
        self.pending_checkpoint = None;
        error
    }
}
