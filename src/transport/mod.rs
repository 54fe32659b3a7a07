//! Wire transports for the KServe v2 inference protocol
//!
//! A single [`Transport`] trait hides whether calls travel over HTTP/JSON (with
//! the binary tensor extension) or gRPC. The implementation is picked once from
//! the endpoint scheme when a connection is opened.

use crate::endpoint::{Endpoint, Scheme};
use crate::error::TransportError;
use crate::model::{ModelConfig, ModelIdentity, RepositoryEntry};
use crate::tensor::TensorSet;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub mod grpc;
pub mod http;

#[cfg(test)]
pub mod mock;

pub use grpc::GrpcTransport;
pub use http::HttpTransport;

pub type TransportResult<T> = Result<T, TransportError>;

/// Request-level parameter forwarded to the server untouched
#[derive(Debug, Clone, PartialEq)]
pub enum InferParameter {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),
}

/// Optional headers and parameters attached to an inference call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferOptions {
    pub headers: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, InferParameter>,
}

impl InferOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: InferParameter) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// Fully marshalled inference call
#[derive(Debug, Clone)]
pub struct InferRequest {
    pub model: ModelIdentity,
    pub id: String,
    pub inputs: TensorSet,
    /// Output names, always requested explicitly
    pub outputs: Vec<String>,
    pub options: InferOptions,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct InferResponse {
    pub model_name: String,
    pub model_version: String,
    pub id: String,
    pub outputs: TensorSet,
}

/// RPC surface of the inference server used by the client
#[async_trait]
pub trait Transport: Send + Sync {
    fn scheme(&self) -> Scheme;

    async fn server_live(&self) -> TransportResult<bool>;

    async fn server_ready(&self) -> TransportResult<bool>;

    async fn model_ready(&self, model: &ModelIdentity) -> TransportResult<bool>;

    async fn repository_index(&self) -> TransportResult<Vec<RepositoryEntry>>;

    async fn model_config(&self, model: &ModelIdentity) -> TransportResult<ModelConfig>;

    async fn infer(&self, request: InferRequest) -> TransportResult<InferResponse>;
}

/// Build the transport matching the endpoint scheme.
///
/// No network I/O happens here; connections are established on first use.
pub fn connect(endpoint: &Endpoint, connection_timeout: Duration) -> TransportResult<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match endpoint.scheme {
        Scheme::Http => Arc::new(HttpTransport::new(endpoint, connection_timeout)?),
        Scheme::Grpc => Arc::new(GrpcTransport::new(endpoint, connection_timeout)?),
    };
    Ok(transport)
}
