//! Parameter averaging across checkpoints.
//!
//! One merge stage takes an ordered list of parameter collections and a
//! weighting and produces a single collection:
//!
//! - keys present in every input with identical shapes are averaged:
//!   `merged[k] = Σ(weight[j] * input[j][k])`
//! - keys present in every input with differing shapes are a shape conflict,
//!   resolved by [`ShapeConflictPolicy`]
//! - keys present in only some inputs are copied from the first input that
//!   has them
//!
//! "First" always refers to the caller's input order, which makes the result
//! reproducible bit for bit.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{MergeError, ParameterCollection, Result, Tensor};

/// Tolerance when checking that weights sum to one.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Per-input contribution fractions for one merge stage.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeWeighting {
    weights: Vec<f64>,
}

impl MergeWeighting {
    /// Create a weighting from explicit per-input weights.
    ///
    /// Every weight must be finite and non-negative, and at least one must be
    /// positive. Weights are used as given; see [`MergeWeighting::normalized`].
    pub fn new(weights: Vec<f64>) -> Result<Self> {
        if weights.is_empty() {
            return Err(MergeError::EmptyInput);
        }
        if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(MergeError::InvalidWeights(format!(
                "weights must be finite and non-negative, got {bad}"
            )));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(MergeError::InvalidWeights(
                "weights must sum to a positive value".to_string(),
            ));
        }
        Ok(Self { weights })
    }

    /// Equal weighting `1/n` for `n` inputs.
    pub fn uniform(n: usize) -> Result<Self> {
        if n == 0 {
            return Err(MergeError::EmptyInput);
        }
        Self::new(vec![1.0 / n as f64; n])
    }

    /// Two-way split `[first, 1 - first]`.
    pub fn split(first: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&first) {
            return Err(MergeError::InvalidWeights(format!(
                "split weight must be within [0, 1], got {first}"
            )));
        }
        Self::new(vec![first, 1.0 - first])
    }

    /// The weights, in input order.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Number of weights.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Always false; a weighting has at least one entry.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Sum of all weights.
    pub fn sum(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Whether the weights sum to one within [`WEIGHT_SUM_TOLERANCE`].
    pub fn is_normalized(&self) -> bool {
        (self.sum() - 1.0).abs() <= WEIGHT_SUM_TOLERANCE
    }
}

/// What to do when a key exists in every input but the shapes differ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeConflictPolicy {
    /// Keep the first input's tensor and record a diagnostic.
    #[default]
    KeepFirst,
    /// Abort the stage with [`MergeError::ShapeConflict`].
    FailFast,
}

/// Diagnostic for a key whose shapes disagree across inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeConflict {
    /// Parameter key.
    pub key: String,
    /// Shape seen in each input, in input order.
    pub shapes: Vec<Vec<usize>>,
}

/// Diagnostics collected during one merge stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Number of input collections.
    pub inputs: usize,
    /// Keys present in every input.
    pub common_keys: usize,
    /// Common keys that were averaged.
    pub averaged_keys: usize,
    /// Common keys resolved by the shape-conflict policy.
    pub shape_conflicts: Vec<ShapeConflict>,
    /// Keys present in only some inputs, copied from the first holder.
    pub partial_keys: usize,
}

impl MergeReport {
    /// Whether any shape conflict was recorded.
    pub fn has_conflicts(&self) -> bool {
        !self.shape_conflicts.is_empty()
    }
}

/// Result of a merge stage.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The merged collection.
    pub parameters: ParameterCollection,
    /// Stage diagnostics.
    pub report: MergeReport,
}

/// Weighted-average merger for parameter collections.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterMerger {
    policy: ShapeConflictPolicy,
}

impl ParameterMerger {
    /// Create a merger using [`ShapeConflictPolicy::KeepFirst`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a merger with an explicit shape-conflict policy.
    pub fn with_policy(policy: ShapeConflictPolicy) -> Self {
        Self { policy }
    }

    /// The active shape-conflict policy.
    pub fn policy(&self) -> ShapeConflictPolicy {
        self.policy
    }

    /// Merge `collections` into one.
    ///
    /// # Arguments
    /// * `collections` - Inputs in priority order; consumed by the merge
    /// * `weights` - One weight per input, uniform `1/N` when `None`
    pub fn merge(
        &self,
        mut collections: Vec<ParameterCollection>,
        weights: Option<&MergeWeighting>,
    ) -> Result<MergeOutcome> {
        let n = collections.len();
        if n == 0 {
            return Err(MergeError::EmptyInput);
        }

        let weighting = match weights {
            Some(w) if w.len() != n => {
                return Err(MergeError::WeightCountMismatch {
                    expected: n,
                    actual: w.len(),
                });
            }
            Some(w) => w.clone(),
            None => MergeWeighting::uniform(n)?,
        };

        if n == 1 {
            let parameters = collections.pop().ok_or(MergeError::EmptyInput)?;
            let report = MergeReport {
                inputs: 1,
                common_keys: parameters.len(),
                ..Default::default()
            };
            return Ok(MergeOutcome { parameters, report });
        }

        if weights.is_none() {
            info!(
                "Merging {} models with equal weights ({:.3} each)...",
                n,
                1.0 / n as f64
            );
        } else {
            info!("Merging {} models with weights {:?}...", n, weighting.weights());
        }
        if !weighting.is_normalized() {
            warn!(
                "Merge weights sum to {:.6}, result is a weighted sum rather than a mean",
                weighting.sum()
            );
        }

        let mut all_keys = BTreeSet::new();
        for params in &collections {
            all_keys.extend(params.keys().map(String::from));
        }
        let (common, partial): (Vec<String>, Vec<String>) = all_keys
            .into_iter()
            .partition(|key| collections.iter().all(|params| params.contains_key(key)));

        info!("Found {} common parameters across all models", common.len());

        let mut merged = ParameterCollection::new();
        let mut report = MergeReport {
            inputs: n,
            common_keys: common.len(),
            ..Default::default()
        };

        for key in common {
            let tensors: Vec<&Tensor> = collections.iter().filter_map(|p| p.get(&key)).collect();
            let Some((first, rest)) = tensors.split_first() else {
                continue;
            };

            if rest.iter().all(|t| t.same_shape(first)) {
                let averaged = weighted_sum(&key, &tensors, weighting.weights())?;
                merged.insert(key, averaged);
                report.averaged_keys += 1;
                continue;
            }

            let shapes: Vec<Vec<usize>> = tensors.iter().map(|t| t.shape().to_vec()).collect();
            if self.policy == ShapeConflictPolicy::FailFast {
                return Err(MergeError::ShapeConflict { key, shapes });
            }

            warn!("Shape mismatch for {}: {:?}. Using first model.", key, shapes);
            if let Some(tensor) = collections[0].remove(&key) {
                merged.insert(key.clone(), tensor);
            }
            report.shape_conflicts.push(ShapeConflict { key, shapes });
        }

        if !partial.is_empty() {
            info!("Found {} keys not in all models", partial.len());
        }
        for key in partial {
            let source = collections.iter_mut().enumerate().find(|(_, p)| p.contains_key(&key));
            if let Some((idx, params)) = source {
                debug!("Copying {} from model {}", key, idx);
                if let Some(tensor) = params.remove(&key) {
                    merged.insert(key, tensor);
                    report.partial_keys += 1;
                }
            }
        }

        Ok(MergeOutcome {
            parameters: merged,
            report,
        })
    }
}

/// Merge with the default policy. Shorthand for [`ParameterMerger::merge`].
pub fn merge_collections(
    collections: Vec<ParameterCollection>,
    weights: Option<&MergeWeighting>,
) -> Result<MergeOutcome> {
    ParameterMerger::new().merge(collections, weights)
}

/// Weighted elementwise sum of same-shape tensors, stored in the first tensor's dtype.
fn weighted_sum(key: &str, tensors: &[&Tensor], weights: &[f64]) -> Result<Tensor> {
    let Some(first) = tensors.first() else {
        return Err(MergeError::EmptyInput);
    };

    let mut acc = vec![0.0f64; first.num_elements()];
    for (tensor, &weight) in tensors.iter().zip(weights) {
        let values = tensor.to_f64_vec().ok_or_else(|| MergeError::UnsupportedDtype {
            key: key.to_string(),
            dtype: tensor.dtype(),
        })?;
        for (a, v) in acc.iter_mut().zip(values) {
            *a += weight * v;
        }
    }

    Tensor::from_f64_values(first.dtype(), first.shape(), &acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::Dtype;

    fn single(key: &str, shape: &[usize], values: &[f32]) -> ParameterCollection {
        let mut params = ParameterCollection::new();
        params.insert(key, Tensor::from_f32(shape, values).unwrap());
        params
    }

    fn values(params: &ParameterCollection, key: &str) -> Vec<f32> {
        params.get(key).unwrap().to_f32_vec().unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!(
                (a - e).abs() <= 1e-6 * e.abs().max(1.0),
                "{actual:?} != {expected:?}"
            );
        }
    }

    #[test]
    fn test_empty_input_fails() {
        let result = merge_collections(Vec::new(), None);
        assert!(matches!(result, Err(MergeError::EmptyInput)));
    }

    #[test]
    fn test_single_collection_is_identity() {
        let mut params = single("enc_p.weight", &[2], &[0.1, 0.2]);
        params.insert("dec.bias", Tensor::from_f64_values(Dtype::F16, &[1], &[1.5]).unwrap());

        let outcome = merge_collections(vec![params.clone()], None).unwrap();
        assert_eq!(outcome.parameters, params);
        assert_eq!(outcome.report.inputs, 1);
        assert!(!outcome.report.has_conflicts());
    }

    #[test]
    fn test_identical_collections_merge_to_themselves() {
        let params = single(
            "flow.flows.0.enc.in_layers.0.weight",
            &[2, 2],
            &[0.3, -1.7, 2.9, 1e-3],
        );
        for n in 1..=5 {
            let outcome = merge_collections(vec![params.clone(); n], None).unwrap();
            assert_close(
                &values(&outcome.parameters, "flow.flows.0.enc.in_layers.0.weight"),
                &[0.3, -1.7, 2.9, 1e-3],
            );
        }
    }

    #[test]
    fn test_three_way_mean() {
        let inputs = vec![
            single("a", &[2], &[1.0, 1.0]),
            single("a", &[2], &[2.0, 2.0]),
            single("a", &[2], &[3.0, 3.0]),
        ];

        let outcome = merge_collections(inputs, None).unwrap();
        assert_close(&values(&outcome.parameters, "a"), &[2.0, 2.0]);
        assert_eq!(outcome.report.averaged_keys, 1);
        assert!(!outcome.report.has_conflicts());
    }

    #[test]
    fn test_shape_conflict_keeps_first() {
        let inputs = vec![
            single("a", &[2], &[1.0, 1.0]),
            single("a", &[2], &[2.0, 2.0]),
            single("a", &[3], &[3.0, 3.0, 3.0]),
        ];

        let outcome = merge_collections(inputs, None).unwrap();
        assert_eq!(values(&outcome.parameters, "a"), vec![1.0, 1.0]);
        assert_eq!(
            outcome.report.shape_conflicts,
            vec![ShapeConflict {
                key: "a".to_string(),
                shapes: vec![vec![2], vec![2], vec![3]],
            }]
        );
        assert_eq!(outcome.report.averaged_keys, 0);
    }

    #[test]
    fn test_shape_conflict_follows_input_order() {
        let inputs = vec![
            single("a", &[3], &[3.0, 3.0, 3.0]),
            single("a", &[2], &[1.0, 1.0]),
        ];

        let outcome = merge_collections(inputs, None).unwrap();
        assert_eq!(values(&outcome.parameters, "a"), vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_fail_fast_policy() {
        let inputs = vec![single("a", &[2], &[1.0, 1.0]), single("a", &[3], &[3.0, 3.0, 3.0])];

        let merger = ParameterMerger::with_policy(ShapeConflictPolicy::FailFast);
        match merger.merge(inputs, None) {
            Err(MergeError::ShapeConflict { key, shapes }) => {
                assert_eq!(key, "a");
                assert_eq!(shapes, vec![vec![2], vec![3]]);
            }
            other => panic!("expected ShapeConflict, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_keys_copied_from_first_holder() {
        let mut first = single("shared", &[1], &[0.0]);
        first.insert("only_first", Tensor::from_f32(&[1], &[10.0]).unwrap());
        let mut second = single("shared", &[1], &[4.0]);
        second.insert("late", Tensor::from_f32(&[1], &[20.0]).unwrap());
        let mut third = single("shared", &[1], &[8.0]);
        third.insert("late", Tensor::from_f32(&[1], &[30.0]).unwrap());

        let outcome = merge_collections(vec![first, second, third], None).unwrap();
        let params = &outcome.parameters;

        let keys: Vec<&str> = params.keys().collect();
        assert_eq!(keys, vec!["late", "only_first", "shared"]);
        assert_close(&values(params, "shared"), &[4.0]);
        assert_eq!(values(params, "only_first"), vec![10.0]);
        assert_eq!(values(params, "late"), vec![20.0]);
        assert_eq!(outcome.report.partial_keys, 2);
        assert_eq!(outcome.report.common_keys, 1);
    }

    #[test]
    fn test_explicit_weights() {
        let inputs = vec![single("w", &[2], &[1.0, 0.0]), single("w", &[2], &[0.0, 1.0])];
        let weighting = MergeWeighting::new(vec![0.75, 0.25]).unwrap();

        let outcome = merge_collections(inputs, Some(&weighting)).unwrap();
        assert_close(&values(&outcome.parameters, "w"), &[0.75, 0.25]);
    }

    #[test]
    fn test_weight_count_must_match() {
        let inputs = vec![single("w", &[1], &[1.0]), single("w", &[1], &[2.0])];
        let weighting = MergeWeighting::uniform(3).unwrap();

        let result = merge_collections(inputs, Some(&weighting));
        assert!(matches!(
            result,
            Err(MergeError::WeightCountMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_weighting_validation() {
        assert!(MergeWeighting::new(vec![0.5, -0.1]).is_err());
        assert!(MergeWeighting::new(vec![0.0, 0.0]).is_err());
        assert!(MergeWeighting::new(vec![f64::NAN]).is_err());
        assert!(MergeWeighting::uniform(0).is_err());
        assert!(MergeWeighting::split(1.5).is_err());

        let w = MergeWeighting::new(vec![2.0, 6.0]).unwrap();
        assert!(!w.is_normalized());
        assert_eq!(w.sum(), 8.0);
        assert!(MergeWeighting::split(0.3).unwrap().is_normalized());
    }

    #[test]
    fn test_merged_tensor_keeps_first_dtype() {
        let mut a = ParameterCollection::new();
        a.insert("x", Tensor::from_f64_values(Dtype::F16, &[2], &[1.0, 2.0]).unwrap());
        let mut b = ParameterCollection::new();
        b.insert("x", Tensor::from_f64_values(Dtype::F16, &[2], &[3.0, 4.0]).unwrap());

        let outcome = merge_collections(vec![a, b], None).unwrap();
        let x = outcome.parameters.get("x").unwrap();
        assert_eq!(x.dtype(), Dtype::F16);
        assert_eq!(x.to_f64_vec().unwrap(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_bool_tensor_cannot_be_averaged() {
        let mut a = ParameterCollection::new();
        a.insert("mask", Tensor::new(Dtype::BOOL, vec![2], vec![0, 1]).unwrap());
        let b = a.clone();

        let result = merge_collections(vec![a, b], None);
        assert!(matches!(result, Err(MergeError::UnsupportedDtype { .. })));
    }

    #[test]
    fn test_fp8_tensors_pass_through_unless_averaged() {
        let scale = Tensor::new(Dtype::F8_E4M3, vec![2], vec![0x38, 0x40]).unwrap();
        let mut a = single("enc_p.w", &[2], &[1.0, 2.0]);
        a.insert("emb_g.scale", scale.clone());
        let b = single("enc_p.w", &[2], &[3.0, 4.0]);

        // Only in the first input: copied verbatim.
        let outcome = merge_collections(vec![a.clone(), b], None).unwrap();
        assert_eq!(outcome.parameters.get("emb_g.scale"), Some(&scale));
        assert_close(&values(&outcome.parameters, "enc_p.w"), &[2.0, 3.0]);
        assert_eq!(outcome.report.partial_keys, 1);

        // A single input is returned unchanged.
        let outcome = merge_collections(vec![a.clone()], None).unwrap();
        assert_eq!(outcome.parameters, a);

        // Common to every input: cannot be averaged.
        let result = merge_collections(vec![a.clone(), a], None);
        assert!(matches!(
            result,
            Err(MergeError::UnsupportedDtype { key, dtype: Dtype::F8_E4M3 }) if key == "emb_g.scale"
        ));
    }

    #[test]
    fn test_output_keys_are_union() {
        let mut a = single("enc_p.a", &[1], &[1.0]);
        a.insert("dec.b", Tensor::from_f32(&[1], &[1.0]).unwrap());
        let mut b = single("enc_p.a", &[1], &[1.0]);
        b.insert("flow.c", Tensor::from_f32(&[1], &[1.0]).unwrap());
        let c = single("emb_g.d", &[1], &[1.0]);

        let outcome = merge_collections(vec![a, b, c], None).unwrap();
        let keys: Vec<&str> = outcome.parameters.keys().collect();
        assert_eq!(keys, vec!["dec.b", "emb_g.d", "enc_p.a", "flow.c"]);
    }
}
