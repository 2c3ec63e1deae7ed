//! Tensors and named parameter collections.
//!
//! A [`Tensor`] keeps the raw little-endian element bytes exactly as they were
//! read from the checkpoint, together with the storage dtype and an explicit
//! shape. Arithmetic happens in `f64` and is written back in the original
//! dtype, so a merge never changes the numeric format of a parameter.

use std::collections::BTreeMap;

use bytemuck::Pod;
use half::{bf16, f16};
use safetensors::Dtype;

use crate::{MergeError, Result};

/// Size in bytes of a single element of `dtype`, if it is a fixed-width type.
pub fn element_size(dtype: Dtype) -> Option<usize> {
    match dtype {
        Dtype::BOOL | Dtype::U8 | Dtype::I8 | Dtype::F8_E4M3 | Dtype::F8_E5M2 => Some(1),
        Dtype::I16 | Dtype::U16 | Dtype::F16 | Dtype::BF16 => Some(2),
        Dtype::I32 | Dtype::U32 | Dtype::F32 => Some(4),
        Dtype::I64 | Dtype::U64 | Dtype::F64 => Some(8),
        _ => None,
    }
}

/// A dense, fixed-shape, fixed-dtype parameter tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    /// Create a tensor from raw element bytes.
    ///
    /// Fails if the buffer length does not equal `product(shape) * size(dtype)`.
    pub fn new(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let size = element_size(dtype)
            .ok_or_else(|| MergeError::InvalidTensor(format!("unsupported dtype {:?}", dtype)))?;
        let expected = shape.iter().product::<usize>() * size;
        if data.len() != expected {
            return Err(MergeError::InvalidTensor(format!(
                "{:?} tensor of shape {:?} needs {} bytes, got {}",
                dtype,
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Create an `f32` tensor.
    pub fn from_f32(shape: &[usize], values: &[f32]) -> Result<Self> {
        Self::new(Dtype::F32, shape.to_vec(), bytemuck::cast_slice(values).to_vec())
    }

    /// Encode `values` into a tensor of the given dtype.
    ///
    /// Integer dtypes round to the nearest value and saturate at the type bounds.
    pub fn from_f64_values(dtype: Dtype, shape: &[usize], values: &[f64]) -> Result<Self> {
        let it = values.iter().copied();
        let data = match dtype {
            Dtype::F64 => encode(it),
            Dtype::F32 => encode(it.map(|v| v as f32)),
            Dtype::F16 => encode(it.map(f16::from_f64)),
            Dtype::BF16 => encode(it.map(bf16::from_f64)),
            Dtype::I64 => encode(it.map(|v| v.round() as i64)),
            Dtype::I32 => encode(it.map(|v| v.round() as i32)),
            Dtype::I16 => encode(it.map(|v| v.round() as i16)),
            Dtype::I8 => encode(it.map(|v| v.round() as i8)),
            Dtype::U64 => encode(it.map(|v| v.round() as u64)),
            Dtype::U32 => encode(it.map(|v| v.round() as u32)),
            Dtype::U16 => encode(it.map(|v| v.round() as u16)),
            Dtype::U8 => encode(it.map(|v| v.round() as u8)),
            other => {
                return Err(MergeError::InvalidTensor(format!(
                    "cannot encode numeric values as {:?}",
                    other
                )))
            }
        };
        Self::new(dtype, shape.to_vec(), data)
    }

    /// Storage dtype.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Dimension tuple.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw little-endian element bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether both tensors have identical dimension tuples.
    pub fn same_shape(&self, other: &Tensor) -> bool {
        self.shape == other.shape
    }

    /// Decode elements to `f64`. Returns `None` for non-numeric dtypes (bool, fp8).
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        let data = self.data.as_slice();
        let values = match self.dtype {
            Dtype::F64 => decode::<f64>(data).collect(),
            Dtype::F32 => decode::<f32>(data).map(f64::from).collect(),
            Dtype::F16 => decode::<f16>(data).map(|h| h.to_f64()).collect(),
            Dtype::BF16 => decode::<bf16>(data).map(|h| h.to_f64()).collect(),
            Dtype::I64 => decode::<i64>(data).map(|v| v as f64).collect(),
            Dtype::I32 => decode::<i32>(data).map(f64::from).collect(),
            Dtype::I16 => decode::<i16>(data).map(f64::from).collect(),
            Dtype::I8 => decode::<i8>(data).map(f64::from).collect(),
            Dtype::U64 => decode::<u64>(data).map(|v| v as f64).collect(),
            Dtype::U32 => decode::<u32>(data).map(f64::from).collect(),
            Dtype::U16 => decode::<u16>(data).map(f64::from).collect(),
            Dtype::U8 => data.iter().copied().map(f64::from).collect(),
            _ => return None,
        };
        Some(values)
    }

    /// Decode elements to `f32`. Returns `None` for non-numeric dtypes.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        self.to_f64_vec()
            .map(|values| values.into_iter().map(|v| v as f32).collect())
    }
}

fn decode<T: Pod>(data: &[u8]) -> impl Iterator<Item = T> + '_ {
    data.chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned::<T>)
}

fn encode<T: Pod>(values: impl Iterator<Item = T>) -> Vec<u8> {
    let values: Vec<T> = values.collect();
    bytemuck::cast_slice(&values).to_vec()
}

/// Mapping from dotted parameter key (e.g. `enc_p.emb_phone.weight`) to tensor.
///
/// Keys are kept sorted so iteration, and therefore written output, is
/// reproducible. Insertion order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterCollection {
    tensors: BTreeMap<String, Tensor>,
}

impl ParameterCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the collection holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Insert a parameter, returning the previous tensor under that key.
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(key.into(), tensor)
    }

    /// Look up a parameter.
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    /// Remove a parameter.
    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        self.tensors.remove(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// `(key, tensor)` pairs in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Total size of all tensor buffers in bytes.
    pub fn byte_size(&self) -> usize {
        self.tensors.values().map(|t| t.data().len()).sum()
    }
}

impl FromIterator<(String, Tensor)> for ParameterCollection {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ParameterCollection {
    type Item = (String, Tensor);
    type IntoIter = std::collections::btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}
