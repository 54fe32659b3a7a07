//! Async model client
//!
//! [`ModelClient`] layers inference on top of a [`Connection`] and the
//! readiness tracker. The model configuration is fetched once (eagerly or on
//! first use) and every request is validated against it before anything is
//! sent to the server.

use crate::config::{ClientConfig, ClientOptions};
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::model::{ModelConfig, ModelIdentity};
use crate::pool::ConnectionPool;
use crate::readiness;
use crate::tensor::{Tensor, TensorSet};
use crate::transport::{InferOptions, InferRequest};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

/// Inference arguments, given either positionally or by input name.
///
/// Positional tensors bind to model inputs in declaration order. A single call
/// must use one convention only.
#[derive(Debug, Clone, Default)]
pub struct InferInputs {
    positional: Vec<Tensor>,
    named: TensorSet,
}

impl InferInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, tensor: Tensor) -> Self {
        self.positional.push(tensor);
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.named.insert(name, tensor);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// Argument convention checks that need no model configuration
    pub fn validate(&self) -> ClientResult<()> {
        if !self.positional.is_empty() && !self.named.is_empty() {
            return Err(ClientError::Value(
                "Use either positional either keyword method arguments convention".to_string(),
            ));
        }
        if self.is_empty() {
            return Err(ClientError::Value("Provide input data".to_string()));
        }
        Ok(())
    }

    /// Resolve to named tensors using the model's declared inputs
    pub fn bind(self, config: &ModelConfig) -> ClientResult<TensorSet> {
        self.validate()?;
        if self.positional.is_empty() {
            return Ok(self.named);
        }

        if self.positional.len() > config.inputs.len() {
            return Err(ClientError::Value(format!(
                "Model {} takes {} inputs but {} positional arguments were given",
                config.name,
                config.inputs.len(),
                self.positional.len()
            )));
        }
        Ok(config
            .inputs
            .iter()
            .zip(self.positional)
            .map(|(spec, tensor)| (spec.name.clone(), tensor))
            .collect())
    }
}

impl From<TensorSet> for InferInputs {
    fn from(named: TensorSet) -> Self {
        Self {
            positional: Vec::new(),
            named,
        }
    }
}

impl From<Vec<Tensor>> for InferInputs {
    fn from(positional: Vec<Tensor>) -> Self {
        Self {
            positional,
            named: TensorSet::new(),
        }
    }
}

impl From<Tensor> for InferInputs {
    fn from(tensor: Tensor) -> Self {
        Self::new().arg(tensor)
    }
}

/// Client bound to one model on one server
pub struct ModelClient {
    connection: Connection,
    /// Clients opened from a url close their connection; pooled ones do not
    owns_connection: bool,
    model: ModelIdentity,
    options: ClientOptions,
    config: OnceCell<Arc<ModelConfig>>,
    next_request_id: AtomicU64,
}

impl std::fmt::Debug for ModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelClient")
            .field("url", &self.connection.endpoint().to_string())
            .field("model", &self.model)
            .field("options", &self.options)
            .finish()
    }
}

impl ModelClient {
    /// Client with default options for `model_name` (latest version) at `url`
    pub async fn connect(url: &str, model_name: &str) -> ClientResult<Self> {
        Self::from_config(&ClientConfig::new(url, model_name)).await
    }

    /// Build a client that owns its own connection.
    ///
    /// With `lazy_init` disabled this waits for the model before returning
    /// and fails if it does not become ready within `init_timeout_s`.
    pub async fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        let model = config.identity()?;
        let options = config.options();
        let connection = Connection::open(&config.url, options.connection_timeout)?;
        let client = Self::build(connection, true, model, options);
        client.init().await?;
        Ok(client)
    }

    /// Build a client over a shared connection; closing the client leaves it open
    pub async fn with_connection(
        connection: Connection,
        model: ModelIdentity,
        options: ClientOptions,
    ) -> ClientResult<Self> {
        let client = Self::build(connection, false, model, options);
        client.init().await?;
        Ok(client)
    }

    /// Build a client over the pool's connection for `config.url`
    pub async fn from_pool(pool: &ConnectionPool, config: &ClientConfig) -> ClientResult<Self> {
        let model = config.identity()?;
        let connection = pool.get_or_open(&config.url)?;
        Self::with_connection(connection, model, config.options()).await
    }

    fn build(
        connection: Connection,
        owns_connection: bool,
        model: ModelIdentity,
        options: ClientOptions,
    ) -> Self {
        tracing::debug!(
            url = %connection.endpoint(),
            model = %model,
            lazy_init = options.lazy_init,
            "Created model client"
        );
        Self {
            connection,
            owns_connection,
            model,
            options,
            config: OnceCell::new(),
            next_request_id: AtomicU64::new(0),
        }
    }

    async fn init(&self) -> ClientResult<()> {
        if !self.options.lazy_init {
            self.model_config().await?;
        }
        Ok(())
    }

    pub fn model(&self) -> &ModelIdentity {
        &self.model
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub async fn is_server_live(&self) -> ClientResult<bool> {
        self.connection.is_server_live().await
    }

    pub async fn is_server_ready(&self) -> ClientResult<bool> {
        self.connection.is_server_ready().await
    }

    /// Cached model configuration, waiting for the model on first use
    pub async fn model_config(&self) -> ClientResult<Arc<ModelConfig>> {
        self.config
            .get_or_try_init(|| {
                readiness::wait_for_model(&self.connection, &self.model, self.options.init_timeout)
            })
            .await
            .cloned()
    }

    /// Wait for the model with a fresh `timeout` budget.
    ///
    /// The first successful wait also fills the config cache.
    pub async fn wait_for_model(&self, timeout: Duration) -> ClientResult<Arc<ModelConfig>> {
        let config = readiness::wait_for_model(&self.connection, &self.model, timeout).await?;
        // Keep whichever config got cached first
        let _ = self.config.set(config.clone());
        Ok(self.config.get().cloned().unwrap_or(config))
    }

    /// Run one sample without a batch axis.
    ///
    /// For batching models a leading axis of size 1 is added to every input
    /// and removed from every output.
    pub async fn infer_sample(&self, inputs: impl Into<InferInputs>) -> ClientResult<TensorSet> {
        self.infer(inputs.into(), false, InferOptions::default()).await
    }

    pub async fn infer_sample_with(
        &self,
        inputs: impl Into<InferInputs>,
        options: InferOptions,
    ) -> ClientResult<TensorSet> {
        self.infer(inputs.into(), false, options).await
    }

    /// Run a batch; inputs already carry the leading batch axis
    pub async fn infer_batch(&self, inputs: impl Into<InferInputs>) -> ClientResult<TensorSet> {
        self.infer(inputs.into(), true, InferOptions::default()).await
    }

    pub async fn infer_batch_with(
        &self,
        inputs: impl Into<InferInputs>,
        options: InferOptions,
    ) -> ClientResult<TensorSet> {
        self.infer(inputs.into(), true, options).await
    }

    async fn infer(
        &self,
        inputs: InferInputs,
        batch: bool,
        options: InferOptions,
    ) -> ClientResult<TensorSet> {
        inputs.validate()?;

        let config = self.model_config().await?;
        if batch && !config.supports_batching() {
            return Err(ClientError::ModelDoesntSupportBatching {
                model: self.model.to_string(),
            });
        }

        let add_batch_axis = !batch && config.supports_batching();
        let mut tensors = inputs.bind(&config)?;
        if add_batch_axis {
            tensors = tensors.try_map(|tensor| Ok(tensor.with_batch_axis()))?;
        }
        let tensors = config.check_inputs(tensors, batch || add_batch_axis)?;

        let request = InferRequest {
            model: self.model.clone(),
            id: self.next_request_id.fetch_add(1, Ordering::Relaxed).to_string(),
            inputs: tensors,
            outputs: config.output_names(),
            options,
            timeout: Some(self.options.inference_timeout),
        };

        tracing::debug!(
            model = %self.model,
            request_id = %request.id,
            inputs = request.inputs.len(),
            batch = batch,
            "Sending inference request"
        );

        let started = Instant::now();
        let result = self.send(request).await;
        crate::metrics::record_inference(
            &self.model.name,
            crate::metrics::outcome(&result),
            started.elapsed(),
        );

        let outputs = result?.reorder(config.outputs.iter().map(|spec| spec.name.as_str()));
        if add_batch_axis {
            outputs.try_map(Tensor::without_batch_axis)
        } else {
            Ok(outputs)
        }
    }

    async fn send(&self, request: InferRequest) -> ClientResult<TensorSet> {
        let timeout = self.options.inference_timeout;
        let started = Instant::now();

        let call = self.connection.call("infer", &self.model, |transport| async move {
            transport.infer(request).await
        });
        let response = tokio::time::timeout(timeout, call).await.map_err(|_| {
            ClientError::timeout(
                format!("running inference on model {}", self.model),
                started.elapsed(),
            )
        })??;

        Ok(response.outputs)
    }

    /// Close the connection if this client opened it; safe to call repeatedly
    pub fn close(&self) {
        if self.owns_connection {
            self.connection.close();
        }
    }
}

impl Drop for ModelClient {
    fn drop(&mut self) {
        self.close();
    }
}
