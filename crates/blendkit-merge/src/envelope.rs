//! Checkpoint envelope encoding on top of safetensors.
//!
//! A checkpoint is either a bare parameter collection or a wrapper with named
//! entries, one of which (`model`) holds the parameters. Safetensors is flat,
//! so a wrapper is stored as:
//!
//! - `__metadata__["envelope"]`: comma separated entry names, e.g. `model,optimizer`
//! - tensor names prefixed with their entry: `model/enc_p.emb_phone.weight`
//!
//! Files without the `envelope` metadata, or whose envelope has no `model`
//! entry, are read as a bare collection with tensor names used verbatim.

use std::collections::HashMap;

use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use tracing::debug;

use crate::{ParameterCollection, Result, Tensor};

/// Metadata key listing the wrapper entries.
pub const ENVELOPE_METADATA_KEY: &str = "envelope";

/// Wrapper entry holding the parameter collection.
pub const MODEL_ENTRY: &str = "model";

/// Separator between entry name and parameter key in tensor names.
pub const ENTRY_SEPARATOR: char = '/';

/// Decode a checkpoint buffer into its parameter collection.
///
/// Non-`model` entries of a wrapper are dropped.
pub fn decode_checkpoint(data: &[u8]) -> Result<ParameterCollection> {
    let (_, metadata) = SafeTensors::read_metadata(data)?;
    let entries = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(ENVELOPE_METADATA_KEY))
        .map(|v| parse_entries(v))
        .unwrap_or_default();

    let model_prefix = entries
        .iter()
        .any(|e| e == MODEL_ENTRY)
        .then(|| format!("{MODEL_ENTRY}{ENTRY_SEPARATOR}"));

    let tensors = SafeTensors::deserialize(data)?;
    let mut params = ParameterCollection::new();
    let mut dropped = 0usize;

    for (name, view) in tensors.tensors() {
        let key = match &model_prefix {
            Some(prefix) => match name.strip_prefix(prefix.as_str()) {
                Some(key) => key.to_string(),
                None => {
                    dropped += 1;
                    continue;
                }
            },
            None => name,
        };
        let tensor = Tensor::new(view.dtype(), view.shape().to_vec(), view.data().to_vec())?;
        params.insert(key, tensor);
    }

    if dropped > 0 {
        debug!("Dropped {} tensors outside the '{}' entry", dropped, MODEL_ENTRY);
    }

    Ok(params)
}

/// Encode `params` in the `{ "model": params }` envelope.
pub fn encode_checkpoint(params: &ParameterCollection) -> Result<Vec<u8>> {
    encode_envelope(&[(MODEL_ENTRY, params)])
}

/// Encode a wrapper with arbitrary named entries.
pub fn encode_envelope(entries: &[(&str, &ParameterCollection)]) -> Result<Vec<u8>> {
    let mut views = Vec::new();
    for (entry, params) in entries {
        for (key, tensor) in params.iter() {
            let view = TensorView::new(tensor.dtype(), tensor.shape().to_vec(), tensor.data())?;
            views.push((format!("{entry}{ENTRY_SEPARATOR}{key}"), view));
        }
    }

    let names: Vec<&str> = entries.iter().map(|(entry, _)| *entry).collect();
    let metadata = HashMap::from([(ENVELOPE_METADATA_KEY.to_string(), names.join(","))]);

    Ok(safetensors::serialize(views, &Some(metadata))?)
}

/// Encode `params` without a wrapper.
pub fn encode_bare(params: &ParameterCollection) -> Result<Vec<u8>> {
    let views = params
        .iter()
        .map(|(key, tensor)| {
            let view = TensorView::new(tensor.dtype(), tensor.shape().to_vec(), tensor.data())?;
            Ok((key.to_string(), view))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(safetensors::serialize(views, &None)?)
}

fn parse_entries(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(String::from)
        .collect()
}
