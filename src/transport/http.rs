//! KServe v2 HTTP/REST transport
//!
//! Tensors travel with the binary tensor extension: the JSON header is followed
//! by the raw tensor bytes and its length is announced in the
//! `Inference-Header-Content-Length` header.

use super::{InferParameter, InferRequest, InferResponse, Transport, TransportResult};
use crate::endpoint::{Endpoint, Scheme};
use crate::error::TransportError;
use crate::model::{
    DynamicBatcher, ModelConfig, ModelIdentity, ModelState, RepositoryEntry, TensorSpec,
};
use crate::tensor::{DataType, Tensor, TensorSet};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value, json};
use std::time::Duration;

pub const INFERENCE_HEADER_CONTENT_LENGTH: &str = "Inference-Header-Content-Length";

/// HTTP transport backed by a pooled reqwest client
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(endpoint: &Endpoint, connection_timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connection_timeout)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        tracing::debug!(url = %endpoint, "Created HTTP transport");

        Ok(Self {
            client,
            base_url: endpoint.base_url(),
        })
    }

    fn model_url(&self, model: &ModelIdentity) -> String {
        let name = urlencoding::encode(&model.name);
        match &model.version {
            Some(version) => format!("{}/v2/models/{}/versions/{}", self.base_url, name, version),
            None => format!("{}/v2/models/{}", self.base_url, name),
        }
    }

    async fn probe(&self, url: String) -> TransportResult<bool> {
        let response = self.client.get(url).send().await?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn scheme(&self) -> Scheme {
        Scheme::Http
    }

    async fn server_live(&self) -> TransportResult<bool> {
        self.probe(format!("{}/v2/health/live", self.base_url)).await
    }

    async fn server_ready(&self) -> TransportResult<bool> {
        self.probe(format!("{}/v2/health/ready", self.base_url)).await
    }

    async fn model_ready(&self, model: &ModelIdentity) -> TransportResult<bool> {
        self.probe(format!("{}/ready", self.model_url(model))).await
    }

    async fn repository_index(&self) -> TransportResult<Vec<RepositoryEntry>> {
        let response = self
            .client
            .post(format!("{}/v2/repository/index", self.base_url))
            .json(&json!({}))
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let entries: Vec<RawIndexEntry> = serde_json::from_slice(&body)
            .map_err(|e| TransportError::protocol(format!("Invalid repository index: {}", e)))?;

        Ok(entries
            .into_iter()
            .map(|entry| RepositoryEntry {
                name: entry.name,
                version: entry.version.filter(|v| !v.is_empty()),
                state: ModelState::parse(entry.state.as_deref().unwrap_or("")),
                reason: entry.reason.unwrap_or_default(),
            })
            .collect())
    }

    async fn model_config(&self, model: &ModelIdentity) -> TransportResult<ModelConfig> {
        let response = self
            .client
            .get(format!("{}/config", self.model_url(model)))
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let raw: RawModelConfig = serde_json::from_slice(&body)
            .map_err(|e| TransportError::protocol(format!("Invalid model config: {}", e)))?;
        raw.into_model_config()
    }

    async fn infer(&self, request: InferRequest) -> TransportResult<InferResponse> {
        let (body, header_length) = codec::encode_request(&request)?;

        let mut builder = self
            .client
            .post(format!("{}/infer", self.model_url(&request.model)))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(INFERENCE_HEADER_CONTENT_LENGTH, header_length.to_string())
            .body(body);
        for (name, value) in &request.options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| match request.timeout {
            Some(timeout) if e.is_timeout() => TransportError::Timeout(timeout),
            _ => TransportError::Http(e),
        })?;

        let status = response.status();
        let header_length = response
            .headers()
            .get(INFERENCE_HEADER_CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        let body = response.bytes().await.map_err(|e| match request.timeout {
            Some(timeout) if e.is_timeout() => TransportError::Timeout(timeout),
            _ => TransportError::Http(e),
        })?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        codec::decode_response(&body, header_length)
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> TransportError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| value.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    TransportError::Status {
        status: status.as_u16(),
        message,
    }
}

/// Request and response bodies for the binary tensor extension.
///
/// Both directions are exposed so the encoding can be exercised against an
/// in-process server.
pub mod codec {
    use super::*;

    /// Encode a request as JSON header plus raw tensor bytes.
    /// Returns the body and the header length.
    pub fn encode_request(request: &InferRequest) -> TransportResult<(Vec<u8>, usize)> {
        let mut binary = Vec::new();
        let inputs: Vec<Value> = request
            .inputs
            .iter()
            .map(|(name, tensor)| {
                binary.extend_from_slice(tensor.as_bytes());
                tensor_header(name, tensor)
            })
            .collect();
        let outputs: Vec<Value> = request
            .outputs
            .iter()
            .map(|name| json!({ "name": name, "parameters": { "binary_data": true } }))
            .collect();

        let mut header = json!({
            "id": request.id,
            "inputs": inputs,
            "outputs": outputs,
        });
        if !request.options.parameters.is_empty() {
            header["parameters"] = parameters_json(&request.options.parameters);
        }

        join(&header, binary)
    }

    /// Decode a request body as a server would: inputs and requested output names
    pub fn decode_request(
        body: &[u8],
        header_length: Option<usize>,
    ) -> TransportResult<(String, TensorSet, Vec<String>)> {
        let (header, binary) = split(body, header_length)?;
        let raw: RawInferRequest = serde_json::from_slice(header)
            .map_err(|e| TransportError::protocol(format!("Invalid infer request: {}", e)))?;
        let inputs = decode_tensors(raw.inputs, binary)?;
        let outputs = raw.outputs.into_iter().map(|output| output.name).collect();
        Ok((raw.id, inputs, outputs))
    }

    /// Encode a response as a server would, with every output in binary form
    pub fn encode_response(response: &InferResponse) -> TransportResult<(Vec<u8>, usize)> {
        let mut binary = Vec::new();
        let outputs: Vec<Value> = response
            .outputs
            .iter()
            .map(|(name, tensor)| {
                binary.extend_from_slice(tensor.as_bytes());
                tensor_header(name, tensor)
            })
            .collect();
        let header = json!({
            "model_name": response.model_name,
            "model_version": response.model_version,
            "id": response.id,
            "outputs": outputs,
        });
        join(&header, binary)
    }

    /// Decode a response body; outputs may be binary or inline JSON `data`
    pub fn decode_response(
        body: &[u8],
        header_length: Option<usize>,
    ) -> TransportResult<InferResponse> {
        let (header, binary) = split(body, header_length)?;
        let raw: RawInferResponse = serde_json::from_slice(header)
            .map_err(|e| TransportError::protocol(format!("Invalid infer response: {}", e)))?;
        Ok(InferResponse {
            model_name: raw.model_name,
            model_version: raw.model_version,
            id: raw.id,
            outputs: decode_tensors(raw.outputs, binary)?,
        })
    }

    fn tensor_header(name: &str, tensor: &Tensor) -> Value {
        json!({
            "name": name,
            "shape": tensor.shape(),
            "datatype": tensor.dtype().wire_name(),
            "parameters": { "binary_data_size": tensor.as_bytes().len() },
        })
    }

    fn join(header: &Value, binary: Vec<u8>) -> TransportResult<(Vec<u8>, usize)> {
        let mut body = serde_json::to_vec(header)
            .map_err(|e| TransportError::protocol(format!("Cannot encode header: {}", e)))?;
        let header_length = body.len();
        body.extend_from_slice(&binary);
        Ok((body, header_length))
    }

    fn split(body: &[u8], header_length: Option<usize>) -> TransportResult<(&[u8], &[u8])> {
        match header_length {
            Some(length) if length > body.len() => Err(TransportError::protocol(format!(
                "Header length {} exceeds body length {}",
                length,
                body.len()
            ))),
            Some(length) => Ok(body.split_at(length)),
            None => Ok((body, &[])),
        }
    }

    fn decode_tensors(raw: Vec<RawTensor>, mut binary: &[u8]) -> TransportResult<TensorSet> {
        let mut tensors = TensorSet::new();
        for tensor in raw {
            let dtype = DataType::from_wire_name(&tensor.datatype)
                .map_err(|e| TransportError::protocol(e.to_string()))?;
            let shape = tensor
                .shape
                .iter()
                .map(|&dim| usize::try_from(dim))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| {
                    TransportError::protocol(format!(
                        "Tensor {} has a negative dimension in {:?}",
                        tensor.name, tensor.shape
                    ))
                })?;

            let decoded = match tensor.parameters.get("binary_data_size").and_then(Value::as_u64) {
                Some(size) => {
                    let size = size as usize;
                    if size > binary.len() {
                        return Err(TransportError::protocol(format!(
                            "Tensor {} announces {} bytes but only {} remain",
                            tensor.name,
                            size,
                            binary.len()
                        )));
                    }
                    let (chunk, rest) = binary.split_at(size);
                    binary = rest;
                    Tensor::from_raw(dtype, shape, chunk.to_vec())
                }
                None => {
                    let data = tensor.data.as_ref().ok_or_else(|| {
                        TransportError::protocol(format!("Tensor {} carries no data", tensor.name))
                    })?;
                    Tensor::from_json(dtype, shape, data)
                }
            }
            .map_err(|e| TransportError::protocol(format!("Tensor {}: {}", tensor.name, e)))?;

            tensors.insert(tensor.name, decoded);
        }
        Ok(tensors)
    }

    fn parameters_json(parameters: &std::collections::BTreeMap<String, InferParameter>) -> Value {
        let map: Map<String, Value> = parameters
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    InferParameter::Bool(v) => Value::from(*v),
                    InferParameter::Int(v) => Value::from(*v),
                    InferParameter::Uint(v) => Value::from(*v),
                    InferParameter::Double(v) => Value::from(*v),
                    InferParameter::String(v) => Value::from(v.as_str()),
                };
                (name.clone(), value)
            })
            .collect();
        Value::Object(map)
    }
}

// ============================================================================
// Wire structures
// ============================================================================

#[derive(Deserialize)]
struct RawIndexEntry {
    name: String,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    version: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct RawTensor {
    name: String,
    datatype: String,
    #[serde(deserialize_with = "lenient_i64_vec")]
    shape: Vec<i64>,
    #[serde(default)]
    parameters: Map<String, Value>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct RawRequestedOutput {
    name: String,
}

#[derive(Deserialize)]
struct RawInferRequest {
    #[serde(default)]
    id: String,
    inputs: Vec<RawTensor>,
    #[serde(default)]
    outputs: Vec<RawRequestedOutput>,
}

#[derive(Deserialize)]
struct RawInferResponse {
    #[serde(default)]
    model_name: String,
    #[serde(default)]
    model_version: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    outputs: Vec<RawTensor>,
}

#[derive(Deserialize)]
struct RawTensorConfig {
    name: String,
    data_type: String,
    #[serde(default, deserialize_with = "lenient_i64_vec")]
    dims: Vec<i64>,
    #[serde(default)]
    optional: bool,
}

#[derive(Deserialize)]
struct RawDynamicBatching {
    #[serde(default)]
    preferred_batch_size: Vec<u32>,
    #[serde(default, deserialize_with = "lenient_u64")]
    max_queue_delay_microseconds: u64,
    #[serde(default)]
    preserve_ordering: bool,
}

#[derive(Deserialize)]
struct RawModelConfig {
    #[serde(default)]
    name: String,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    backend: String,
    #[serde(default)]
    max_batch_size: u32,
    #[serde(default)]
    input: Vec<RawTensorConfig>,
    #[serde(default)]
    output: Vec<RawTensorConfig>,
    #[serde(default)]
    dynamic_batching: Option<RawDynamicBatching>,
}

impl RawModelConfig {
    fn into_model_config(self) -> TransportResult<ModelConfig> {
        let mut config = ModelConfig::new(self.name, self.max_batch_size);
        config.platform = self.platform;
        config.backend = self.backend;
        config.inputs = self
            .input
            .into_iter()
            .map(RawTensorConfig::into_spec)
            .collect::<TransportResult<_>>()?;
        config.outputs = self
            .output
            .into_iter()
            .map(RawTensorConfig::into_spec)
            .collect::<TransportResult<_>>()?;
        config.dynamic_batcher = self.dynamic_batching.map(|batching| DynamicBatcher {
            preferred_batch_sizes: batching.preferred_batch_size,
            max_queue_delay_microseconds: batching.max_queue_delay_microseconds,
            preserve_ordering: batching.preserve_ordering,
        });
        Ok(config)
    }
}

impl RawTensorConfig {
    fn into_spec(self) -> TransportResult<TensorSpec> {
        let dtype = DataType::from_config_name(&self.data_type)
            .map_err(|e| TransportError::protocol(format!("Tensor {}: {}", self.name, e)))?;
        Ok(TensorSpec {
            name: self.name,
            dtype,
            shape: self.dims,
            optional: self.optional,
        })
    }
}

/// Protobuf JSON renders 64-bit integers as strings; accept both spellings
#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

impl IntOrString {
    fn to_i64<E: serde::de::Error>(&self) -> Result<i64, E> {
        match self {
            Self::Int(value) => Ok(*value),
            Self::Str(value) => value
                .parse()
                .map_err(|_| E::custom(format!("invalid integer '{}'", value))),
        }
    }
}

fn lenient_i64_vec<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i64>, D::Error> {
    let raw = Vec::<IntOrString>::deserialize(deserializer)?;
    raw.iter().map(IntOrString::to_i64).collect()
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = IntOrString::deserialize(deserializer)?.to_i64::<D::Error>()?;
    u64::try_from(value).map_err(serde::de::Error::custom)
}

fn lenient_opt_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<IntOrString>::deserialize(deserializer)?.map(|value| match value {
        IntOrString::Int(v) => v.to_string(),
        IntOrString::Str(v) => v,
    }))
}
