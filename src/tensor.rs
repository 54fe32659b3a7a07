//! Tensors and named tensor sets
//!
//! Tensor payloads are stored as contiguous little-endian bytes, which is the
//! raw layout both the gRPC `raw_*_contents` fields and the HTTP binary tensor
//! extension carry. Encoding never goes through a lossy intermediate, so
//! values round-trip bit-for-bit.

use crate::error::{ClientError, ClientResult};
use serde_json::Value;
use std::fmt;

/// Element type of a tensor, named after the KServe v2 datatype strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Fp16,
    Bf16,
    Fp32,
    Fp64,
}

impl DataType {
    /// KServe v2 wire name (`FP32`, `INT64`, ...)
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::Uint8 => "UINT8",
            Self::Uint16 => "UINT16",
            Self::Uint32 => "UINT32",
            Self::Uint64 => "UINT64",
            Self::Int8 => "INT8",
            Self::Int16 => "INT16",
            Self::Int32 => "INT32",
            Self::Int64 => "INT64",
            Self::Fp16 => "FP16",
            Self::Bf16 => "BF16",
            Self::Fp32 => "FP32",
            Self::Fp64 => "FP64",
        }
    }

    pub fn from_wire_name(name: &str) -> ClientResult<Self> {
        let dtype = match name {
            "BOOL" => Self::Bool,
            "UINT8" => Self::Uint8,
            "UINT16" => Self::Uint16,
            "UINT32" => Self::Uint32,
            "UINT64" => Self::Uint64,
            "INT8" => Self::Int8,
            "INT16" => Self::Int16,
            "INT32" => Self::Int32,
            "INT64" => Self::Int64,
            "FP16" => Self::Fp16,
            "BF16" => Self::Bf16,
            "FP32" => Self::Fp32,
            "FP64" => Self::Fp64,
            other => {
                return Err(ClientError::Value(format!(
                    "Unsupported tensor datatype {}",
                    other
                )));
            }
        };
        Ok(dtype)
    }

    /// Parse the model configuration spelling (`TYPE_FP32`)
    pub fn from_config_name(name: &str) -> ClientResult<Self> {
        match name.strip_prefix("TYPE_") {
            Some("STRING") | None => Err(ClientError::Value(format!(
                "Unsupported model config datatype {}",
                name
            ))),
            Some(wire) => Self::from_wire_name(wire),
        }
    }

    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            Self::Bool | Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 | Self::Fp16 | Self::Bf16 => 2,
            Self::Uint32 | Self::Int32 | Self::Fp32 => 4,
            Self::Uint64 | Self::Int64 | Self::Fp64 => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Rust scalar types that map onto a tensor [`DataType`]
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DataType;

    fn write_le(self, out: &mut Vec<u8>);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DataType = $dtype;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(u8, DataType::Uint8);
impl_element!(u16, DataType::Uint16);
impl_element!(u32, DataType::Uint32);
impl_element!(u64, DataType::Uint64);
impl_element!(i8, DataType::Int8);
impl_element!(i16, DataType::Int16);
impl_element!(i32, DataType::Int32);
impl_element!(i64, DataType::Int64);
impl_element!(f32, DataType::Fp32);
impl_element!(f64, DataType::Fp64);

impl Element for bool {
    const DTYPE: DataType = DataType::Bool;

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Dense n-dimensional array with a fixed element type
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DataType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    /// Build a tensor from typed values laid out in row-major order
    pub fn from_slice<T: Element>(shape: &[usize], values: &[T]) -> ClientResult<Self> {
        let expected = element_count(shape)?;
        if expected != values.len() {
            return Err(ClientError::Value(format!(
                "Shape {:?} holds {} elements but {} values were given",
                shape,
                expected,
                values.len()
            )));
        }
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.size());
        for value in values {
            value.write_le(&mut data);
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape: shape.to_vec(),
            data,
        })
    }

    /// One-dimensional tensor
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.size());
        for value in &values {
            value.write_le(&mut data);
        }
        Self {
            dtype: T::DTYPE,
            shape: vec![values.len()],
            data,
        }
    }

    /// Wrap raw little-endian bytes, checking the length against the shape
    pub fn from_raw(dtype: DataType, shape: Vec<usize>, data: Vec<u8>) -> ClientResult<Self> {
        let expected = element_count(&shape)?
            .checked_mul(dtype.size())
            .ok_or_else(|| too_large(&shape))?;
        if expected != data.len() {
            return Err(ClientError::Value(format!(
                "{} tensor of shape {:?} needs {} bytes, got {}",
                dtype,
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build a tensor from JSON numbers (or booleans), flattening nested arrays
    pub fn from_json(dtype: DataType, shape: Vec<usize>, values: &Value) -> ClientResult<Self> {
        let mut flat = Vec::new();
        flatten_json(values, &mut flat);

        let expected = element_count(&shape)?;
        if flat.len() != expected {
            return Err(ClientError::Value(format!(
                "Shape {:?} holds {} elements but {} values were given",
                shape,
                expected,
                flat.len()
            )));
        }

        let mut data = Vec::with_capacity(expected * dtype.size());
        for value in flat {
            write_json_value(dtype, value, &mut data)?;
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn num_elements(&self) -> usize {
        self.data.len() / self.dtype.size()
    }

    /// Decode the payload into typed values
    pub fn to_vec<T: Element>(&self) -> ClientResult<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(ClientError::Value(format!(
                "Tensor holds {} values, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.size())
            .map(T::read_le)
            .collect())
    }

    /// Flat JSON array of the values; half precision types are not representable
    pub fn to_json(&self) -> ClientResult<Value> {
        let values = match self.dtype {
            DataType::Bool => self.to_vec::<bool>()?.into_iter().map(Value::from).collect(),
            DataType::Uint8 => self.to_vec::<u8>()?.into_iter().map(Value::from).collect(),
            DataType::Uint16 => self.to_vec::<u16>()?.into_iter().map(Value::from).collect(),
            DataType::Uint32 => self.to_vec::<u32>()?.into_iter().map(Value::from).collect(),
            DataType::Uint64 => self.to_vec::<u64>()?.into_iter().map(Value::from).collect(),
            DataType::Int8 => self.to_vec::<i8>()?.into_iter().map(Value::from).collect(),
            DataType::Int16 => self.to_vec::<i16>()?.into_iter().map(Value::from).collect(),
            DataType::Int32 => self.to_vec::<i32>()?.into_iter().map(Value::from).collect(),
            DataType::Int64 => self.to_vec::<i64>()?.into_iter().map(Value::from).collect(),
            DataType::Fp32 => self.to_vec::<f32>()?.into_iter().map(Value::from).collect(),
            DataType::Fp64 => self.to_vec::<f64>()?.into_iter().map(Value::from).collect(),
            DataType::Fp16 | DataType::Bf16 => {
                return Err(ClientError::Value(format!(
                    "{} tensors cannot be rendered as JSON",
                    self.dtype
                )));
            }
        };
        Ok(Value::Array(values))
    }

    /// Prepend a batch axis of size 1
    pub fn with_batch_axis(mut self) -> Self {
        self.shape.insert(0, 1);
        self
    }

    /// Remove a leading batch axis of size 1
    pub fn without_batch_axis(mut self) -> ClientResult<Self> {
        match self.shape.first() {
            Some(1) => {
                self.shape.remove(0);
                Ok(self)
            }
            _ => Err(ClientError::Value(format!(
                "Expected a leading batch axis of size 1, got shape {:?}",
                self.shape
            ))),
        }
    }
}

/// Product of the dimensions; shapes come from servers, so overflow is an error
fn element_count(shape: &[usize]) -> ClientResult<usize> {
    shape
        .iter()
        .try_fold(1usize, |count, &dim| count.checked_mul(dim))
        .ok_or_else(|| too_large(shape))
}

fn too_large(shape: &[usize]) -> ClientError {
    ClientError::Value(format!("Shape {:?} is too large to address", shape))
}

fn flatten_json<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| flatten_json(item, out)),
        scalar => out.push(scalar),
    }
}

fn write_json_value(dtype: DataType, value: &Value, out: &mut Vec<u8>) -> ClientResult<()> {
    let mismatch = || ClientError::Value(format!("Value {} is not a valid {}", value, dtype));

    macro_rules! int {
        ($ty:ty) => {{
            let v = if let Some(v) = value.as_i64() {
                <$ty>::try_from(v).map_err(|_| mismatch())?
            } else {
                <$ty>::try_from(value.as_u64().ok_or_else(mismatch)?).map_err(|_| mismatch())?
            };
            v.write_le(out);
        }};
    }

    match dtype {
        DataType::Bool => value.as_bool().ok_or_else(mismatch)?.write_le(out),
        DataType::Uint8 => int!(u8),
        DataType::Uint16 => int!(u16),
        DataType::Uint32 => int!(u32),
        DataType::Uint64 => int!(u64),
        DataType::Int8 => int!(i8),
        DataType::Int16 => int!(i16),
        DataType::Int32 => int!(i32),
        DataType::Int64 => int!(i64),
        DataType::Fp32 => (value.as_f64().ok_or_else(mismatch)? as f32).write_le(out),
        DataType::Fp64 => value.as_f64().ok_or_else(mismatch)?.write_le(out),
        DataType::Fp16 | DataType::Bf16 => return Err(mismatch()),
    }
    Ok(())
}

/// Tensors keyed by name, keeping insertion order for the wire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorSet {
    entries: Vec<(String, Tensor)>,
}

impl TensorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tensor; replacing keeps the original position
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => Some(std::mem::replace(existing, tensor)),
            None => {
                self.entries.push((name, tensor));
                None
            }
        }
    }

    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, tensor)| tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    /// Apply a fallible transformation to every tensor
    pub fn try_map(self, mut f: impl FnMut(Tensor) -> ClientResult<Tensor>) -> ClientResult<Self> {
        let entries = self
            .entries
            .into_iter()
            .map(|(name, tensor)| f(tensor).map(|tensor| (name, tensor)))
            .collect::<ClientResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Reorder entries to follow `order`; names not listed keep their relative order at the end
    pub fn reorder<'a>(mut self, order: impl IntoIterator<Item = &'a str>) -> Self {
        let mut entries = Vec::with_capacity(self.entries.len());
        for name in order {
            if let Some(index) = self.entries.iter().position(|(n, _)| n == name) {
                entries.push(self.entries.remove(index));
            }
        }
        entries.append(&mut self.entries);
        Self { entries }
    }
}

impl IntoIterator for TensorSet {
    type Item = (String, Tensor);
    type IntoIter = std::vec::IntoIter<(String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<S: Into<String>> FromIterator<(S, Tensor)> for TensorSet {
    fn from_iter<I: IntoIterator<Item = (S, Tensor)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (name, tensor) in iter {
            set.insert(name, tensor);
        }
        set
    }
}
