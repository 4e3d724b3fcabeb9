// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod session;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod test_utils;
pub mod transport;
pub mod utils;

pub use aptos_protos;
pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use config::TransactionStreamConfig;
pub use consumer::{ConsumerOptions, ResumableConsumer};
pub use error::{ConfigError, ConsumerError, StreamError};
pub use event::{SessionState, StreamEvent, StreamMetadata, StreamStatus, TransactionBatch};
pub use session::{fetch_chain_id, StreamSession};
pub use supervisor::{ReconnectPolicy, ReconnectSupervisor};
pub use transport::{GrpcTransactionSource, TransactionSource};
