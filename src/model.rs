//! Model identity, repository state and cached model configuration

use crate::error::{ClientError, ClientResult};
use crate::tensor::{DataType, Tensor, TensorSet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name and optional version of a served model
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub name: String,
    /// `None` selects the latest version the server has loaded
    pub version: Option<String>,
}

impl ModelIdentity {
    pub fn new(name: impl Into<String>, version: Option<String>) -> ClientResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ClientError::Value("Model name cannot be empty".to_string()));
        }
        let version = version.filter(|v| !v.is_empty());
        if let Some(ref version) = version
            && !version.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ClientError::Value(format!(
                "Model version must be a non-negative integer (got '{}')",
                version
            )));
        }
        Ok(Self { name, version })
    }

    /// Version as sent on the wire; empty means latest
    pub fn wire_version(&self) -> &str {
        self.version.as_deref().unwrap_or("")
    }

    /// Whether a repository index entry describes this model
    pub fn matches(&self, entry: &RepositoryEntry) -> bool {
        entry.name == self.name
            && match (&self.version, &entry.version) {
                (None, _) => true,
                (Some(requested), Some(indexed)) => requested == indexed,
                (Some(_), None) => false,
            }
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{} (version {})", self.name, version),
            None => write!(f, "{} (version latest)", self.name),
        }
    }
}

/// Model state as reported by the repository index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelState {
    Ready,
    Loading,
    Unloading,
    Unavailable,
    Unknown(String),
}

impl ModelState {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "READY" => Self::Ready,
            "LOADING" => Self::Loading,
            "UNLOADING" => Self::Unloading,
            "UNAVAILABLE" => Self::Unavailable,
            _ => Self::Unknown(state.to_string()),
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "READY"),
            Self::Loading => write!(f, "LOADING"),
            Self::Unloading => write!(f, "UNLOADING"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::Unknown(state) if state.is_empty() => write!(f, "UNKNOWN"),
            Self::Unknown(state) => write!(f, "{}", state),
        }
    }
}

/// One row of the model repository index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryEntry {
    pub name: String,
    pub version: Option<String>,
    pub state: ModelState,
    pub reason: String,
}

/// Input or output declaration from the model configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DataType,
    /// Per-sample dims (batch axis excluded); `-1` marks a dynamic axis
    pub shape: Vec<i64>,
    pub optional: bool,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: DataType, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            optional: false,
        }
    }

    /// Check one sample's shape (no batch axis) against the declared dims
    fn accepts_sample_shape(&self, shape: &[usize]) -> bool {
        shape.len() == self.shape.len()
            && self
                .shape
                .iter()
                .zip(shape)
                .all(|(&declared, &actual)| declared < 0 || declared as usize == actual)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicBatcher {
    pub preferred_batch_sizes: Vec<u32>,
    pub max_queue_delay_microseconds: u64,
    pub preserve_ordering: bool,
}

/// Model configuration fetched once the model is ready; immutable afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub name: String,
    pub platform: String,
    pub backend: String,
    /// `Some` when the model accepts a leading batch axis
    pub max_batch_size: Option<u32>,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub dynamic_batcher: Option<DynamicBatcher>,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, max_batch_size: u32) -> Self {
        Self {
            name: name.into(),
            platform: String::new(),
            backend: String::new(),
            max_batch_size: (max_batch_size > 0).then_some(max_batch_size),
            inputs: Vec::new(),
            outputs: Vec::new(),
            dynamic_batcher: None,
        }
    }

    pub fn with_input(mut self, spec: TensorSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    pub fn with_output(mut self, spec: TensorSpec) -> Self {
        self.outputs.push(spec);
        self
    }

    pub fn supports_batching(&self) -> bool {
        self.max_batch_size.is_some()
    }

    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|spec| spec.name.clone()).collect()
    }

    /// Validate wire-ready inputs against the declared schema and return them
    /// in declaration order.
    ///
    /// `batched` tells whether the tensors carry a leading batch axis.
    pub fn check_inputs(&self, inputs: TensorSet, batched: bool) -> ClientResult<TensorSet> {
        for (name, tensor) in inputs.iter() {
            let spec = self.input(name).ok_or_else(|| {
                ClientError::Value(format!(
                    "Model {} has no input named {} (expected one of {:?})",
                    self.name,
                    name,
                    self.inputs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()
                ))
            })?;
            check_tensor(&self.name, spec, tensor, batched, self.max_batch_size)?;
        }

        if let Some(missing) = self
            .inputs
            .iter()
            .find(|spec| !spec.optional && !inputs.contains(&spec.name))
        {
            return Err(ClientError::Value(format!(
                "Missing input {} for model {}",
                missing.name, self.name
            )));
        }

        Ok(inputs.reorder(self.inputs.iter().map(|spec| spec.name.as_str())))
    }
}

fn check_tensor(
    model: &str,
    spec: &TensorSpec,
    tensor: &Tensor,
    batched: bool,
    max_batch_size: Option<u32>,
) -> ClientResult<()> {
    if tensor.dtype() != spec.dtype {
        return Err(ClientError::Value(format!(
            "Input {} of model {} expects {} but got {}",
            spec.name,
            model,
            spec.dtype,
            tensor.dtype()
        )));
    }

    let sample_shape = if batched {
        let Some((&batch, rest)) = tensor.shape().split_first() else {
            return Err(ClientError::Value(format!(
                "Input {} of model {} is missing the batch axis",
                spec.name, model
            )));
        };
        if let Some(max) = max_batch_size
            && batch > max as usize
        {
            return Err(ClientError::Value(format!(
                "Input {} batch size {} exceeds max_batch_size {} of model {}",
                spec.name, batch, max, model
            )));
        }
        rest
    } else {
        tensor.shape()
    };

    if !spec.accepts_sample_shape(sample_shape) {
        return Err(ClientError::Value(format!(
            "Input {} of model {} expects sample shape {:?} but got {:?}",
            spec.name, model, spec.shape, sample_shape
        )));
    }
    Ok(())
}
