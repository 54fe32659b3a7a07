//! Scripted in-memory transport for unit tests

use super::{InferRequest, InferResponse, Transport, TransportResult};
use crate::endpoint::Scheme;
use crate::error::TransportError;
use crate::model::{ModelConfig, ModelIdentity, ModelState, RepositoryEntry};
use crate::tensor::TensorSet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type InferHandler = Arc<dyn Fn(&InferRequest) -> TransportResult<InferResponse> + Send + Sync>;

/// Mock transport with per-operation call counters
pub struct MockTransport {
    live: AtomicBool,
    ready: AtomicBool,
    model_ready: AtomicBool,
    reachable: AtomicBool,
    index: Mutex<Vec<RepositoryEntry>>,
    config: Mutex<Option<ModelConfig>>,
    config_error: Mutex<Option<String>>,
    infer_delay: Mutex<Option<Duration>>,
    handler: Mutex<InferHandler>,
    calls: Mutex<HashMap<&'static str, usize>>,
    requests: Mutex<Vec<InferRequest>>,
}

impl MockTransport {
    /// Live and ready server with `config` loaded as version 1
    pub fn serving(config: ModelConfig) -> Self {
        let entry = RepositoryEntry {
            name: config.name.clone(),
            version: Some("1".to_string()),
            state: ModelState::Ready,
            reason: String::new(),
        };
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(true),
            model_ready: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            index: Mutex::new(vec![entry]),
            config: Mutex::new(Some(config)),
            config_error: Mutex::new(None),
            infer_delay: Mutex::new(None),
            handler: Mutex::new(Arc::new(echo)),
            calls: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Server that refuses every connection
    pub fn unreachable() -> Self {
        let mock = Self::serving(ModelConfig::new("unreachable", 0));
        mock.reachable.store(false, Ordering::SeqCst);
        mock
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_model_ready(&self, ready: bool) {
        self.model_ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_state(&self, state: ModelState) {
        for entry in self.index.lock().unwrap().iter_mut() {
            entry.state = state.clone();
        }
    }

    pub fn set_index(&self, entries: Vec<RepositoryEntry>) {
        *self.index.lock().unwrap() = entries;
    }

    /// Answer model config requests with an undecodable payload
    pub fn set_config_error(&self, message: &str) {
        *self.config_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_infer_delay(&self, delay: Duration) {
        *self.infer_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_handler(
        &self,
        handler: impl Fn(&InferRequest) -> TransportResult<InferResponse> + Send + Sync + 'static,
    ) {
        *self.handler.lock().unwrap() = Arc::new(handler);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<InferRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, operation: &'static str) -> TransportResult<()> {
        *self.calls.lock().unwrap().entry(operation).or_insert(0) += 1;
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::protocol("connection refused"))
        }
    }
}

/// Returns the i-th input under the i-th requested output name
fn echo(request: &InferRequest) -> TransportResult<InferResponse> {
    let outputs: TensorSet = request
        .outputs
        .iter()
        .zip(request.inputs.iter())
        .map(|(name, (_, tensor))| (name.clone(), tensor.clone()))
        .collect();
    Ok(InferResponse {
        model_name: request.model.name.clone(),
        model_version: "1".to_string(),
        id: request.id.clone(),
        outputs,
    })
}

#[async_trait]
impl Transport for MockTransport {
    fn scheme(&self) -> Scheme {
        Scheme::Http
    }

    async fn server_live(&self) -> TransportResult<bool> {
        self.record("server_live")?;
        Ok(self.live.load(Ordering::SeqCst))
    }

    async fn server_ready(&self) -> TransportResult<bool> {
        self.record("server_ready")?;
        Ok(self.ready.load(Ordering::SeqCst))
    }

    async fn model_ready(&self, _model: &ModelIdentity) -> TransportResult<bool> {
        self.record("model_ready")?;
        Ok(self.model_ready.load(Ordering::SeqCst))
    }

    async fn repository_index(&self) -> TransportResult<Vec<RepositoryEntry>> {
        self.record("repository_index")?;
        Ok(self.index.lock().unwrap().clone())
    }

    async fn model_config(&self, model: &ModelIdentity) -> TransportResult<ModelConfig> {
        self.record("model_config")?;
        if let Some(message) = self.config_error.lock().unwrap().clone() {
            return Err(TransportError::Protocol(message));
        }
        self.config
            .lock()
            .unwrap()
            .clone()
            .filter(|config| config.name == model.name)
            .ok_or_else(|| TransportError::Status {
                status: 404,
                message: format!("Request for unknown model: '{}'", model.name),
            })
    }

    async fn infer(&self, request: InferRequest) -> TransportResult<InferResponse> {
        self.record("infer")?;
        self.requests.lock().unwrap().push(request.clone());
        let delay = *self.infer_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let handler = self.handler.lock().unwrap().clone();
        handler(&request)
    }
}
