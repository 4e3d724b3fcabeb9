// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{config::TransactionStreamConfig, error::StreamError};
use aptos_protos::indexer::v1::{
    raw_data_client::RawDataClient, GetTransactionsRequest, TransactionsResponse,
};
use futures::{stream::BoxStream, StreamExt};
use std::time::Duration;
use tonic::{
    codec::CompressionEncoding,
    metadata::{Ascii, MetadataValue},
};
use tracing::{error, info};
use url::Url;

/// GRPC request metadata key for the token ID.
const GRPC_API_GATEWAY_API_KEY_HEADER: &str = "authorization";
/// GRPC request metadata key for the request name. This is used to identify the
/// data destination.
const GRPC_REQUEST_NAME_HEADER: &str = "x-aptos-request-name";
/// GRPC connection id
const GRPC_CONNECTION_ID: &str = "x-aptos-connection-id";
/// 256MB
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024 * 256;

pub const SERVICE_TYPE: &str = "transaction_stream";

/// The version range a session asks the server for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub starting_version: u64,
    /// Inclusive.
    pub ending_version: Option<u64>,
}

impl StreamRequest {
    pub fn transactions_count(&self) -> Option<u64> {
        self.ending_version
            .map(|v| v.saturating_sub(self.starting_version).saturating_add(1))
    }
}

/// An open server stream: the raw responses plus whatever the server told us about
/// the connection.
pub struct TransportStream {
    pub connection_id: Option<String>,
    pub responses: BoxStream<'static, Result<TransactionsResponse, tonic::Status>>,
}

/// Something that can open a server-streaming transaction feed at a given version.
///
/// Implementations return once the server has acknowledged the request. They must not
/// retry on their own; retry policy lives above the session.
#[async_trait::async_trait]
pub trait TransactionSource: 'static + Send + Sync {
    /// Human readable address, used for logs and stream metadata.
    fn address(&self) -> String;

    async fn connect(&self, request: StreamRequest) -> Result<TransportStream, StreamError>;
}

/// Talks to the Aptos transaction stream service over GRPC.
#[derive(Clone, Debug)]
pub struct GrpcTransactionSource {
    transaction_stream_address: Url,
    auth_token: String,
    request_name: String,
    http2_ping_interval: Duration,
    http2_ping_timeout: Duration,
}

impl GrpcTransactionSource {
    pub fn new(config: &TransactionStreamConfig) -> Self {
        Self {
            transaction_stream_address: config.transaction_stream_address.clone(),
            auth_token: config.auth_token.clone(),
            request_name: config.request_name_header.clone(),
            http2_ping_interval: config.indexer_grpc_http2_ping_interval(),
            http2_ping_timeout: config.indexer_grpc_http2_ping_timeout(),
        }
    }

    fn connect_error(&self, message: impl ToString) -> StreamError {
        StreamError::Connect {
            address: self.transaction_stream_address.to_string(),
            message: message.to_string(),
        }
    }

    fn build_request(
        &self,
        request: StreamRequest,
    ) -> Result<tonic::Request<GetTransactionsRequest>, StreamError> {
        let mut grpc_request = tonic::Request::new(GetTransactionsRequest {
            starting_version: Some(request.starting_version),
            transactions_count: request.transactions_count(),
            ..GetTransactionsRequest::default()
        });
        let auth_header: MetadataValue<Ascii> = format!("Bearer {}", self.auth_token)
            .parse()
            .map_err(|_| self.connect_error("auth token is not a valid header value"))?;
        let request_name: MetadataValue<Ascii> = self
            .request_name
            .parse()
            .map_err(|_| self.connect_error("request name is not a valid header value"))?;
        grpc_request
            .metadata_mut()
            .insert(GRPC_API_GATEWAY_API_KEY_HEADER, auth_header);
        grpc_request
            .metadata_mut()
            .insert(GRPC_REQUEST_NAME_HEADER, request_name);
        Ok(grpc_request)
    }
}

#[async_trait::async_trait]
impl TransactionSource for GrpcTransactionSource {
    fn address(&self) -> String {
        self.transaction_stream_address.to_string()
    }

    async fn connect(&self, request: StreamRequest) -> Result<TransportStream, StreamError> {
        info!(
            service_type = SERVICE_TYPE,
            stream_address = self.transaction_stream_address.to_string(),
            start_version = request.starting_version,
            end_version = request.ending_version,
            "[Stream] Setting up rpc channel"
        );

        let channel = tonic::transport::Channel::from_shared(
            self.transaction_stream_address.to_string(),
        )
        .map_err(|e| self.connect_error(e))?
        .http2_keep_alive_interval(self.http2_ping_interval)
        .keep_alive_timeout(self.http2_ping_timeout);

        // If the scheme is https, add a TLS config.
        let channel = if self.transaction_stream_address.scheme() == "https" {
            let config = tonic::transport::channel::ClientTlsConfig::new().with_native_roots();
            channel
                .tls_config(config)
                .map_err(|e| self.connect_error(e))?
        } else {
            channel
        };

        let mut rpc_client = match RawDataClient::connect(channel).await {
            Ok(client) => client
                .accept_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Zstd)
                .send_compressed(CompressionEncoding::Zstd)
                .max_decoding_message_size(MAX_RESPONSE_SIZE)
                .max_encoding_message_size(MAX_RESPONSE_SIZE),
            Err(e) => {
                error!(
                    service_type = SERVICE_TYPE,
                    stream_address = self.transaction_stream_address.to_string(),
                    start_version = request.starting_version,
                    end_version = request.ending_version,
                    error = ?e,
                    "[Stream] Error connecting to GRPC client"
                );
                return Err(self.connect_error(e));
            },
        };

        info!(
            service_type = SERVICE_TYPE,
            stream_address = self.transaction_stream_address.to_string(),
            start_version = request.starting_version,
            end_version = request.ending_version,
            num_of_transactions = ?request.transactions_count(),
            "[Stream] Setting up GRPC stream",
        );
        let response = rpc_client
            .get_transactions(self.build_request(request)?)
            .await
            .map_err(StreamError::from)?;
        let connection_id = response
            .metadata()
            .get(GRPC_CONNECTION_ID)
            .and_then(|connection_id| connection_id.to_str().ok())
            .map(str::to_string);

        Ok(TransportStream {
            connection_id,
            responses: response.into_inner().boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> GrpcTransactionSource {
        let mut config = TransactionStreamConfig::new(
            Url::parse("http://127.0.0.1:50051").unwrap(),
            "aptoslabs_key",
        );
        config.request_name_header = "stream-consumer".to_string();
        GrpcTransactionSource::new(&config)
    }

    #[test]
    fn test_transactions_count() {
        let open_ended = StreamRequest {
            starting_version: 100,
            ending_version: None,
        };
        assert_eq!(open_ended.transactions_count(), None);

        let bounded = StreamRequest {
            starting_version: 100,
            ending_version: Some(104),
        };
        assert_eq!(bounded.transactions_count(), Some(5));
    }

    #[test]
    fn test_request_carries_auth_and_name() {
        let request = source()
            .build_request(StreamRequest {
                starting_version: 7,
                ending_version: Some(8),
            })
            .unwrap();
        assert_eq!(
            request
                .metadata()
                .get(GRPC_API_GATEWAY_API_KEY_HEADER)
                .unwrap(),
            "Bearer aptoslabs_key"
        );
        assert_eq!(
            request.metadata().get(GRPC_REQUEST_NAME_HEADER).unwrap(),
            "stream-consumer"
        );
        assert_eq!(request.get_ref().starting_version, Some(7));
        assert_eq!(request.get_ref().transactions_count, Some(2));
    }

    #[test]
    fn test_invalid_header_value_is_a_connect_error() {
        let mut source = source();
        source.auth_token = "bad\ntoken".to_string();
        let err = source
            .build_request(StreamRequest {
                starting_version: 0,
                ending_version: None,
            })
            .unwrap_err();
        assert!(matches!(err, StreamError::Connect { .. }));
    }
}
