//! KServe v2 gRPC transport
//!
//! One lazily connected HTTP/2 channel is shared by all calls; tonic clients
//! are cheap clones over it.

use super::{InferParameter, InferRequest, InferResponse, Transport, TransportResult};
use crate::endpoint::{Endpoint, Scheme};
use crate::error::TransportError;
use crate::model::{
    DynamicBatcher, ModelConfig, ModelIdentity, ModelState, RepositoryEntry, TensorSpec,
};
use crate::tensor::{DataType, Element, Tensor, TensorSet};
use async_trait::async_trait;
use std::time::Duration;
use tonic::Code;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, Endpoint as ChannelEndpoint};

// Include generated proto code
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/inference.rs"));
}

use proto::grpc_inference_service_client::GrpcInferenceServiceClient;
use proto::infer_parameter::ParameterChoice;
use proto::model_infer_request::{InferInputTensor, InferRequestedOutputTensor};

/// Matches the message size limit used by the reference Triton clients
pub const MAX_MESSAGE_SIZE: usize = i32::MAX as usize;

#[derive(Clone, Debug)]
pub struct GrpcTransport {
    client: GrpcInferenceServiceClient<Channel>,
}

impl GrpcTransport {
    /// Create the transport without connecting.
    ///
    /// Must be called from within a tokio runtime context.
    pub fn new(endpoint: &Endpoint, connection_timeout: Duration) -> TransportResult<Self> {
        let channel = ChannelEndpoint::from_shared(endpoint.base_url())?
            .connect_timeout(connection_timeout)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10))
            .connect_lazy();

        let client = GrpcInferenceServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);

        tracing::debug!(url = %endpoint, "Created gRPC transport");

        Ok(Self { client })
    }

    fn client(&self) -> GrpcInferenceServiceClient<Channel> {
        self.client.clone()
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn scheme(&self) -> Scheme {
        Scheme::Grpc
    }

    async fn server_live(&self) -> TransportResult<bool> {
        let response = self
            .client()
            .server_live(proto::ServerLiveRequest {})
            .await?;
        Ok(response.into_inner().live)
    }

    async fn server_ready(&self) -> TransportResult<bool> {
        let response = self
            .client()
            .server_ready(proto::ServerReadyRequest {})
            .await?;
        Ok(response.into_inner().ready)
    }

    async fn model_ready(&self, model: &ModelIdentity) -> TransportResult<bool> {
        let response = self
            .client()
            .model_ready(proto::ModelReadyRequest {
                name: model.name.clone(),
                version: model.wire_version().to_string(),
            })
            .await?;
        Ok(response.into_inner().ready)
    }

    async fn repository_index(&self) -> TransportResult<Vec<RepositoryEntry>> {
        let response = self
            .client()
            .repository_index(proto::RepositoryIndexRequest {
                repository_name: String::new(),
                ready: false,
            })
            .await?;

        Ok(response
            .into_inner()
            .models
            .into_iter()
            .map(|entry| RepositoryEntry {
                name: entry.name,
                version: (!entry.version.is_empty()).then_some(entry.version),
                state: ModelState::parse(&entry.state),
                reason: entry.reason,
            })
            .collect())
    }

    async fn model_config(&self, model: &ModelIdentity) -> TransportResult<ModelConfig> {
        let response = self
            .client()
            .model_config(proto::ModelConfigRequest {
                name: model.name.clone(),
                version: model.wire_version().to_string(),
            })
            .await?;

        let config = response
            .into_inner()
            .config
            .ok_or_else(|| TransportError::protocol("Model config response carries no config"))?;
        convert_config(config)
    }

    async fn infer(&self, request: InferRequest) -> TransportResult<InferResponse> {
        let timeout = request.timeout;
        let request = encode_request(&request)?;

        let response = self
            .client()
            .model_infer(request)
            .await
            .map_err(|status| match (timeout, status.code()) {
                // Server side deadline, or the channel's own grpc-timeout enforcement
                (Some(timeout), Code::DeadlineExceeded | Code::Cancelled) => {
                    TransportError::Timeout(timeout)
                }
                _ => TransportError::Grpc(status),
            })?;

        decode_response(response.into_inner())
    }
}

/// Build the gRPC request; tensors go into `raw_input_contents`
pub fn encode_request(
    request: &InferRequest,
) -> TransportResult<tonic::Request<proto::ModelInferRequest>> {
    let inputs = request
        .inputs
        .iter()
        .map(|(name, tensor)| InferInputTensor {
            name: name.to_string(),
            datatype: tensor.dtype().wire_name().to_string(),
            shape: tensor.shape().iter().map(|&dim| dim as i64).collect(),
            ..Default::default()
        })
        .collect();
    let raw_input_contents = request
        .inputs
        .iter()
        .map(|(_, tensor)| tensor.as_bytes().to_vec())
        .collect();
    let outputs = request
        .outputs
        .iter()
        .map(|name| InferRequestedOutputTensor {
            name: name.clone(),
            ..Default::default()
        })
        .collect();
    let parameters = request
        .options
        .parameters
        .iter()
        .map(|(name, value)| (name.clone(), convert_parameter(value)))
        .collect();

    let mut grpc_request = tonic::Request::new(proto::ModelInferRequest {
        model_name: request.model.name.clone(),
        model_version: request.model.wire_version().to_string(),
        id: request.id.clone(),
        parameters,
        inputs,
        outputs,
        raw_input_contents,
    });

    for (name, value) in &request.options.headers {
        let key = AsciiMetadataKey::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|_| TransportError::protocol(format!("Invalid header name '{}'", name)))?;
        let value = value
            .parse::<AsciiMetadataValue>()
            .map_err(|_| TransportError::protocol(format!("Invalid value for header '{}'", name)))?;
        grpc_request.metadata_mut().insert(key, value);
    }
    if let Some(timeout) = request.timeout {
        grpc_request.set_timeout(timeout);
    }

    Ok(grpc_request)
}

/// Decode outputs from `raw_output_contents`, falling back to typed contents
pub fn decode_response(response: proto::ModelInferResponse) -> TransportResult<InferResponse> {
    let mut raw = response.raw_output_contents.into_iter();
    let mut outputs = TensorSet::new();

    for output in response.outputs {
        let dtype = DataType::from_wire_name(&output.datatype)
            .map_err(|e| TransportError::protocol(e.to_string()))?;
        let shape = output
            .shape
            .iter()
            .map(|&dim| usize::try_from(dim))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| {
                TransportError::protocol(format!(
                    "Output {} has a negative dimension in {:?}",
                    output.name, output.shape
                ))
            })?;

        let data = match raw.next() {
            Some(bytes) => bytes,
            None => {
                let contents = output.contents.unwrap_or_default();
                contents_to_bytes(dtype, contents).map_err(|e| {
                    TransportError::protocol(format!("Output {}: {}", output.name, e))
                })?
            }
        };

        let tensor = Tensor::from_raw(dtype, shape, data)
            .map_err(|e| TransportError::protocol(format!("Output {}: {}", output.name, e)))?;
        outputs.insert(output.name, tensor);
    }

    Ok(InferResponse {
        model_name: response.model_name,
        model_version: response.model_version,
        id: response.id,
        outputs,
    })
}

fn contents_to_bytes(dtype: DataType, contents: proto::InferTensorContents) -> Result<Vec<u8>, String> {
    fn pack<T: Element>(values: impl IntoIterator<Item = T>) -> Vec<u8> {
        let mut out = Vec::new();
        values.into_iter().for_each(|value| value.write_le(&mut out));
        out
    }

    fn narrow<S: Copy + std::fmt::Display, T: Element + TryFrom<S>>(values: Vec<S>) -> Result<Vec<u8>, String> {
        let narrowed = values
            .into_iter()
            .map(|value| T::try_from(value).map_err(|_| format!("value {} out of range for {}", value, T::DTYPE)))
            .collect::<Result<Vec<T>, _>>()?;
        Ok(pack(narrowed))
    }

    match dtype {
        DataType::Bool => Ok(pack(contents.bool_contents)),
        DataType::Int8 => narrow::<i32, i8>(contents.int_contents),
        DataType::Int16 => narrow::<i32, i16>(contents.int_contents),
        DataType::Int32 => Ok(pack(contents.int_contents)),
        DataType::Int64 => Ok(pack(contents.int64_contents)),
        DataType::Uint8 => narrow::<u32, u8>(contents.uint_contents),
        DataType::Uint16 => narrow::<u32, u16>(contents.uint_contents),
        DataType::Uint32 => Ok(pack(contents.uint_contents)),
        DataType::Uint64 => Ok(pack(contents.uint64_contents)),
        DataType::Fp32 => Ok(pack(contents.fp32_contents)),
        DataType::Fp64 => Ok(pack(contents.fp64_contents)),
        DataType::Fp16 | DataType::Bf16 => Err(format!("{} requires raw contents", dtype)),
    }
}

fn convert_parameter(value: &InferParameter) -> proto::InferParameter {
    let choice = match value {
        InferParameter::Bool(v) => ParameterChoice::BoolParam(*v),
        InferParameter::Int(v) => ParameterChoice::Int64Param(*v),
        InferParameter::Uint(v) => ParameterChoice::Uint64Param(*v),
        InferParameter::Double(v) => ParameterChoice::DoubleParam(*v),
        InferParameter::String(v) => ParameterChoice::StringParam(v.clone()),
    };
    proto::InferParameter {
        parameter_choice: Some(choice),
    }
}

fn convert_config(config: proto::ModelConfig) -> TransportResult<ModelConfig> {
    let mut converted = ModelConfig::new(config.name, u32::try_from(config.max_batch_size).unwrap_or(0));
    converted.platform = config.platform;
    converted.backend = config.backend;

    for input in config.input {
        let dtype = config_dtype(&input.name, input.data_type)?;
        converted.inputs.push(TensorSpec {
            name: input.name,
            dtype,
            shape: input.dims,
            optional: input.optional,
        });
    }
    for output in config.output {
        let dtype = config_dtype(&output.name, output.data_type)?;
        converted
            .outputs
            .push(TensorSpec::new(output.name, dtype, output.dims));
    }

    converted.dynamic_batcher = config.dynamic_batching.map(|batching| DynamicBatcher {
        preferred_batch_sizes: batching
            .preferred_batch_size
            .into_iter()
            .filter_map(|size| u32::try_from(size).ok())
            .collect(),
        max_queue_delay_microseconds: batching.max_queue_delay_microseconds,
        preserve_ordering: batching.preserve_ordering,
    });

    Ok(converted)
}

fn config_dtype(tensor: &str, value: i32) -> TransportResult<DataType> {
    let dtype = proto::DataType::try_from(value).map_err(|_| {
        TransportError::protocol(format!("Tensor {} has unknown data type {}", tensor, value))
    })?;
    DataType::from_config_name(dtype.as_str_name())
        .map_err(|e| TransportError::protocol(format!("Tensor {}: {}", tensor, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InferOptions;
    use proto::model_infer_response::InferOutputTensor;

    #[test]
    fn test_convert_config() {
        let config = proto::ModelConfig {
            name: "add_sub".to_string(),
            max_batch_size: 8,
            input: vec![proto::ModelInput {
                name: "a".to_string(),
                data_type: proto::DataType::TypeFp32 as i32,
                dims: vec![-1],
                optional: false,
            }],
            output: vec![proto::ModelOutput {
                name: "add".to_string(),
                data_type: proto::DataType::TypeInt64 as i32,
                dims: vec![2, 3],
            }],
            ..Default::default()
        };
        let converted = convert_config(config).unwrap();
        assert_eq!(converted.max_batch_size, Some(8));
        assert_eq!(converted.inputs[0].dtype, DataType::Fp32);
        assert_eq!(converted.outputs[0].dtype, DataType::Int64);
        assert_eq!(converted.outputs[0].shape, vec![2, 3]);
        assert!(converted.dynamic_batcher.is_none());
    }

    #[test]
    fn test_convert_config_rejects_string_tensors() {
        let config = proto::ModelConfig {
            name: "text".to_string(),
            input: vec![proto::ModelInput {
                name: "prompt".to_string(),
                data_type: proto::DataType::TypeString as i32,
                dims: vec![1],
                optional: false,
            }],
            ..Default::default()
        };
        assert!(convert_config(config).is_err());
    }

    #[test]
    fn test_encode_request_uses_raw_contents() {
        let request = InferRequest {
            model: ModelIdentity::new("add_sub", Some("2".to_string())).unwrap(),
            id: "1".to_string(),
            inputs: TensorSet::new().with("a", Tensor::from_vec(vec![1.5f32, 2.5])),
            outputs: vec!["add".to_string()],
            options: InferOptions::default()
                .header("X-Request-Source", "test")
                .parameter("priority", InferParameter::Int(1)),
            timeout: Some(Duration::from_secs(5)),
        };
        let encoded = encode_request(&request).unwrap();
        assert_eq!(
            encoded.metadata().get("x-request-source").unwrap(),
            "test"
        );
        let message = encoded.into_inner();
        assert_eq!(message.model_version, "2");
        assert_eq!(message.inputs[0].shape, vec![2]);
        assert_eq!(message.inputs[0].datatype, "FP32");
        assert_eq!(message.raw_input_contents[0].len(), 8);
        assert_eq!(message.outputs[0].name, "add");
        assert!(message.parameters.contains_key("priority"));
    }

    #[test]
    fn test_decode_response_from_typed_contents() {
        let response = proto::ModelInferResponse {
            model_name: "add_sub".to_string(),
            outputs: vec![InferOutputTensor {
                name: "idx".to_string(),
                datatype: "INT8".to_string(),
                shape: vec![3],
                contents: Some(proto::InferTensorContents {
                    int_contents: vec![-1, 0, 127],
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let decoded = decode_response(response).unwrap();
        assert_eq!(
            decoded.outputs.get("idx").unwrap().to_vec::<i8>().unwrap(),
            vec![-1, 0, 127]
        );
    }

    #[test]
    fn test_decode_response_rejects_out_of_range_contents() {
        let response = proto::ModelInferResponse {
            outputs: vec![InferOutputTensor {
                name: "idx".to_string(),
                datatype: "UINT8".to_string(),
                shape: vec![1],
                contents: Some(proto::InferTensorContents {
                    uint_contents: vec![256],
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(decode_response(response).is_err());
    }

    #[test]
    fn test_decode_response_rejects_overflowing_shape() {
        let response = proto::ModelInferResponse {
            outputs: vec![InferOutputTensor {
                name: "out".to_string(),
                datatype: "INT64".to_string(),
                shape: vec![1 << 32, 1 << 32, 2],
                ..Default::default()
            }],
            raw_output_contents: vec![Vec::new()],
            ..Default::default()
        };
        let err = decode_response(response).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)), "{err}");
    }
}
