// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! In-process stand-ins for the transaction stream service.

use crate::{
    error::StreamError,
    transport::{StreamRequest, TransactionSource, TransportStream},
};
use aptos_protos::{
    indexer::v1::TransactionsResponse, transaction::v1::Transaction, util::timestamp::Timestamp,
};
use futures::{stream, StreamExt};
use std::{
    collections::VecDeque,
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

pub type ScriptedResponse = Result<TransactionsResponse, tonic::Status>;

/// Builds a server response carrying one transaction per version in `versions`.
pub fn response(chain_id: u64, versions: RangeInclusive<u64>) -> TransactionsResponse {
    TransactionsResponse {
        transactions: versions
            .map(|version| Transaction {
                version,
                timestamp: Some(Timestamp {
                    seconds: 1_700_000_000 + version as i64,
                    nanos: 0,
                }),
                ..Transaction::default()
            })
            .collect(),
        chain_id: Some(chain_id),
        ..TransactionsResponse::default()
    }
}

/// Serves one script per connection, in order. Each script is the list of responses
/// the server sends before closing the stream. Connections beyond the last script
/// fail to connect.
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Result<Vec<ScriptedResponse>, StreamError>>>,
    requests: Mutex<Vec<StreamRequest>>,
    responses_taken: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
    hang_after_script: AtomicBool,
}

impl ScriptedSource {
    pub fn new(scripts: Vec<Vec<ScriptedResponse>>) -> Arc<Self> {
        Self::with_connections(scripts.into_iter().map(Ok).collect())
    }

    /// A source whose first connection attempt fails with `error`.
    pub fn failing(error: StreamError) -> Arc<Self> {
        Self::with_connections(vec![Err(error)])
    }

    /// One entry per connection attempt: either a script or a connect error.
    pub fn with_connections(
        connections: Vec<Result<Vec<ScriptedResponse>, StreamError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(connections.into()),
            requests: Mutex::new(vec![]),
            responses_taken: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicBool::new(true)),
            hang_after_script: AtomicBool::new(false),
        })
    }

    /// Keep streams open after their script runs out instead of closing them.
    pub fn hanging(self: Arc<Self>) -> Arc<Self> {
        self.hang_after_script.store(true, Ordering::SeqCst);
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of responses pulled off the server streams so far.
    pub fn responses_taken(&self) -> usize {
        self.responses_taken.load(Ordering::SeqCst)
    }

    /// True when no stream handed out by this source is still alive.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl TransactionSource for ScriptedSource {
    fn address(&self) -> String {
        "http://scripted.local:50051/".to_string()
    }

    async fn connect(&self, request: StreamRequest) -> Result<TransportStream, StreamError> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(StreamError::Connect {
                    address: self.address(),
                    message: "no more scripted connections".to_string(),
                })
            })?;

        self.released.store(false, Ordering::SeqCst);
        let guard = ReleaseGuard(self.released.clone());
        let responses_taken = self.responses_taken.clone();
        let responses = stream::iter(script).inspect(move |_| {
            let _guard = &guard;
            responses_taken.fetch_add(1, Ordering::SeqCst);
        });
        let responses = if self.hang_after_script.load(Ordering::SeqCst) {
            responses.chain(stream::pending()).boxed()
        } else {
            responses.boxed()
        };

        Ok(TransportStream {
            connection_id: Some(format!("scripted-{}", request.starting_version)),
            responses,
        })
    }
}
