//! Inference client - KServe v2 model client over HTTP and gRPC
//!
//! A thin client library layered in three parts: a [`Connection`] to an
//! inference server, a readiness tracker that waits for a model to become
//! servable, and model clients ([`ModelClient`], [`FuturesModelClient`]) that
//! validate and run inference requests against the cached model config.

pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod futures_client;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod readiness;
pub mod tensor;
pub mod transport;

pub use client::{InferInputs, ModelClient};
pub use config::{ClientConfig, ClientOptions};
pub use connection::Connection;
pub use endpoint::{Endpoint, Scheme};
pub use error::{ClientError, ClientResult, TransportError};
pub use futures_client::{FuturesModelClient, PendingRequest};
pub use model::{ModelConfig, ModelIdentity, ModelState, RepositoryEntry, TensorSpec};
pub use pool::{ConnectionPool, PoolStats};
pub use readiness::{ReadinessState, ReadinessTracker, wait_for_model};
pub use tensor::{DataType, Tensor, TensorSet};
pub use transport::{InferOptions, InferParameter, Transport};
