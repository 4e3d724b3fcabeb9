// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    checkpoint::CheckpointStore,
    config::TransactionStreamConfig,
    consumer::{ConsumerOptions, ResumableConsumer},
    error::ConsumerError,
    event::StreamEvent,
    transport::{TransactionSource, SERVICE_TYPE},
    utils::counters::RECONNECTION_COUNT,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{error, info};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectPolicy {
    /// Consecutive failed sessions tolerated before giving up. Reset by any delivered batch.
    #[serde(default = "ReconnectPolicy::default_max_reconnection_retries")]
    pub max_reconnection_retries: u64,
    /// Sleep between a failed session and the next one.
    #[serde(default = "ReconnectPolicy::default_backoff_ms")]
    pub backoff_ms: u64,
}

impl ReconnectPolicy {
    /// We will try to reconnect 5 times in case upstream connection is being updated
    pub const fn default_max_reconnection_retries() -> u64 {
        5
    }

    pub const fn default_backoff_ms() -> u64 {
        100
    }

    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_reconnection_retries: Self::default_max_reconnection_retries(),
            backoff_ms: Self::default_backoff_ms(),
        }
    }
}

/// Reopens a [`ResumableConsumer`] from the last checkpoint whenever its session dies
/// of a retryable error.
///
/// Events, including the `Error` event of every failed session, are passed through.
/// Protocol violations, a chain id mismatch and checkpoint store failures end the
/// sequence immediately. The chain id seen by the first session is required of every
/// later one.
pub struct ReconnectSupervisor<S: CheckpointStore> {
    source: Arc<dyn TransactionSource>,
    config: TransactionStreamConfig,
    store: Arc<S>,
    options: ConsumerOptions,
    policy: ReconnectPolicy,
    consumer: Option<ResumableConsumer<Arc<S>>>,
    reconnection_retries: u64,
    finished: bool,
}

impl<S: CheckpointStore> ReconnectSupervisor<S> {
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
            consumer: None,
            reconnection_retries: 0,
            finished: false,
        }
    }

    /// `None` once the stream completed. An `Err` is always the last item.
    pub async fn next(&mut self) -> Option<Result<StreamEvent, ConsumerError>> {
        loop {
            if self.finished {
                return None;
            }
            if self.consumer.is_none() {
                match ResumableConsumer::run(
                    self.source.clone(),
                    &self.config,
                    self.store.clone(),
                    &self.options,
                )
                .await
                {
                    Ok(consumer) => self.consumer = Some(consumer),
                    Err(e) => return Some(Err(self.finish(e))),
                }
            }
            let Some(consumer) = self.consumer.as_mut() else {
                return None;
            };

            match consumer.next().await {
                Some(Ok(event)) => {
                    if matches!(event, StreamEvent::Data { .. }) {
                        self.reconnection_retries = 0;
                    }
                    return Some(Ok(event));
                },
                Some(Err(e)) => return Some(Err(self.finish(e))),
                None => {},
            }

            // The session ended. Decide whether to open another one.
            let Some(consumer) = self.consumer.take() else {
                return None;
            };
            if self.options.expected_chain_id.is_none() {
                self.options.expected_chain_id = consumer.chain_id();
            }
            let last_error = match consumer.last_error() {
                None => {
                    info!(
                        service_type = SERVICE_TYPE,
                        request_name = self.config.request_name_header,
                        last_committed_version = consumer.last_committed_version(),
                        "[Stream] Transaction stream completed."
                    );
                    self.finished = true;
                    return None;
                },
                Some(e) => e.clone(),
            };
            if !last_error.is_retryable() {
                return Some(Err(self.finish(ConsumerError::Fatal(last_error))));
            }
            if self.reconnection_retries >= self.policy.max_reconnection_retries {
                return Some(Err(self.finish(ConsumerError::RetriesExhausted {
                    retries: self.reconnection_retries,
                    last_error,
                })));
            }

            self.reconnection_retries += 1;
            RECONNECTION_COUNT
                .with_label_values(&[&self.config.request_name_header])
                .inc();
            info!(
                service_type = SERVICE_TYPE,
                request_name = self.config.request_name_header,
                last_committed_version = consumer.last_committed_version(),
                reconnection_retries = self.reconnection_retries,
                error = %last_error,
                "[Stream] Reconnecting to GRPC stream"
            );
            drop(consumer);
            tokio::time::sleep(self.policy.backoff()).await;
        }
    }

    /// Adapts the supervisor into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamEvent, ConsumerError>> {
        futures::stream::unfold(self, |mut supervisor| async move {
            supervisor.next().await.map(|item| (item, supervisor))
        })
    }

    pub fn reconnection_retries(&self) -> u64 {
        self.reconnection_retries
    }

    fn finish(&mut self, error: ConsumerError) -> ConsumerError {
        error!(
            service_type = SERVICE_TYPE,
            request_name = self.config.request_name_header,
            reconnection_retries = self.reconnection_retries,
            error = %error,
            "[Stream] Will not reconnect."
        );
        self.finished = true;
        self.consumer = None;
        error
    }
}
