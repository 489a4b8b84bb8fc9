//! DoRA weight decomposition.
//!
//! DoRA splits an adapted weight into a learned per-channel magnitude and a
//! unit-norm direction:
//!
//! ```text
//! W' = m * (W + s * B @ A) / ||W + s * B @ A||_c
//! ```
//!
//! where `W` is the frozen base weight, `A`/`B` are the LoRA down/up factors,
//! `s` is the scaling coefficient and `m` is initialized to `||W||_c`.
//! The norm is treated as a constant: it is detached from the gradient graph, so
//! only `m` and the numerator receive gradient (section 4.3 of the paper).
//!
//! The shared state and arithmetic live here; each [`LayerKind`] supplies its own
//! norm orientation and forward strategy in a submodule.
//!
//! Reference: <https://arxiv.org/abs/2402.09353>

pub mod conv;
pub mod embedding;
pub mod linear;

use std::fmt;

use candle_core::{DType, Device, Shape, Tensor, Var};
use tracing::{debug, warn};

use crate::base::{Dequantize, WeightShapeProvider};
use crate::config::NumericPolicy;
use crate::error::{DoraError, Result};
use crate::gather::{GatheredParams, ParamGather};

pub use embedding::embedding_lookup;

/// Structural kind of the wrapped base layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    /// Weight `(out_features, in_features)`; output channel is axis 0.
    Dense,
    /// Weight `(vocab, features)`; output channel is axis 1.
    Embedding,
    /// Weight `(out, in / groups, kh, kw)`; output channel is axis 0.
    Conv2d,
}

impl LayerKind {
    /// Short name used in errors and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::Embedding => "embedding",
            Self::Conv2d => "conv2d",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The LoRA factor pair supplied on every call.
///
/// `down` has shape `(rank, in, ...)` and `up` has shape `(out, rank, ...)`, so
/// that `up @ down` reshapes to the base weight shape. For embeddings `up` is
/// `(vocab, rank)` and `down` is `(rank, features)`.
#[derive(Debug, Clone)]
pub struct LoraFactors {
    /// Down projection ("LoRA A").
    pub down: Tensor,
    /// Up projection ("LoRA B").
    pub up: Tensor,
}

impl LoraFactors {
    /// Bundle a factor pair.
    #[must_use]
    pub fn new(down: Tensor, up: Tensor) -> Self {
        Self { down, up }
    }

    /// Copy of the pair cut off from the gradient graph.
    #[must_use]
    pub fn detach(&self) -> Self {
        Self {
            down: self.down.detach(),
            up: self.up.detach(),
        }
    }
}

/// Options for [`WeightDecomposition::update_layer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Precision handling for the norm computation.
    pub policy: NumericPolicy,
    /// Move the magnitude to host memory.
    pub place_on_cpu: bool,
}

/// Facts fixed at initialization.
#[derive(Debug, Clone)]
struct Initialized {
    weight_shape: Shape,
    reduction_dims: usize,
    magnitude: Var,
}

/// Magnitude/direction decomposition of one adapted layer.
#[derive(Debug, Clone)]
pub struct WeightDecomposition {
    kind: LayerKind,
    fan_in_fan_out: bool,
    state: Option<Initialized>,
}

impl WeightDecomposition {
    /// Create an uninitialized decomposition for the given layer kind.
    #[must_use]
    pub fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            fan_in_fan_out: false,
            state: None,
        }
    }

    /// Treat a dense base weight as stored `(in_features, out_features)`.
    ///
    /// Ignored for embedding and convolution layers.
    #[must_use]
    pub fn with_fan_in_fan_out(mut self, fan_in_fan_out: bool) -> Self {
        self.fan_in_fan_out = fan_in_fan_out && self.kind == LayerKind::Dense;
        self
    }

    /// Layer kind this decomposition was built for.
    #[must_use]
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Whether a dense base weight is transposed before use.
    #[must_use]
    pub fn fan_in_fan_out(&self) -> bool {
        self.fan_in_fan_out
    }

    /// Whether [`update_layer`](Self::update_layer) has run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Full-size shape of the reconstructed weight.
    #[must_use]
    pub fn weight_shape(&self) -> Option<&Shape> {
        self.state.as_ref().map(|state| &state.weight_shape)
    }

    /// Number of trailing axes reduced by the per-channel norm.
    #[must_use]
    pub fn reduction_dims(&self) -> Option<usize> {
        self.state.as_ref().map(|state| state.reduction_dims)
    }

    /// The trainable magnitude.
    ///
    /// # Errors
    ///
    /// Returns [`DoraError::Uninitialized`] before `update_layer`.
    pub fn magnitude(&self) -> Result<&Var> {
        self.state
            .as_ref()
            .map(|state| &state.magnitude)
            .ok_or(DoraError::Uninitialized)
    }

    /// Reconstruct the full-size weight delta `up @ down`.
    ///
    /// Trailing kernel axes are flattened into the contraction, so the same
    /// product serves dense, embedding and convolution weights.
    ///
    /// # Errors
    ///
    /// Returns an error before initialization or when the factor shapes do not
    /// multiply out to the weight shape.
    pub fn compose_weight(&self, down: &Tensor, up: &Tensor) -> Result<Tensor> {
        let shape = self.weight_shape().ok_or(DoraError::Uninitialized)?;
        let up = up.flatten_from(1)?;
        let down = down.flatten_from(1)?;
        Ok(up.matmul(&down)?.reshape(shape.clone())?)
    }

    /// Per-output-channel L2 norm, singleton-shaped to broadcast against `weight`.
    ///
    /// Dense: `(out, 1)`. Embedding: `(1, features)`. Conv2d: `(out, 1, 1, 1)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor has the wrong rank for the layer kind.
    pub fn weight_norm(&self, weight: &Tensor) -> Result<Tensor> {
        match self.kind {
            LayerKind::Dense => linear::weight_norm(weight),
            LayerKind::Embedding => embedding::weight_norm(weight),
            LayerKind::Conv2d => conv::weight_norm(weight),
        }
    }

    /// Compute and store the initial magnitude `||W||_c` from the base layer.
    ///
    /// The base weight is read under a scoped gather of `base`, released before
    /// this returns whether dequantization succeeds or not. `scaling` does not
    /// enter the initial magnitude: it is the norm of the unadapted weight.
    ///
    /// # Errors
    ///
    /// Returns [`DoraError::AlreadyInitialized`] on a second call,
    /// [`DoraError::ShapeMismatch`] when the materialized weight disagrees with
    /// the reported shape, and propagates gather and dequantization errors.
    pub fn update_layer<B>(
        &mut self,
        base: &B,
        factors: &LoraFactors,
        scaling: f64,
        gather: &dyn ParamGather<B>,
        options: InitOptions,
    ) -> Result<()>
    where
        B: Dequantize + WeightShapeProvider + ?Sized,
    {
        if self.state.is_some() {
            return Err(DoraError::AlreadyInitialized);
        }

        let info = base.weight_shape()?;
        let mut weight_shape = info.logical_shape().clone();
        if self.fan_in_fan_out {
            weight_shape = transposed_shape(&weight_shape);
        }

        let weight = {
            let _gathered = GatheredParams::acquire(gather, base)?;
            let weight = base.dequantize()?;
            self.orient(&weight)?
        };
        if weight.dims() != weight_shape.dims() {
            return Err(DoraError::ShapeMismatch {
                expected: weight_shape.dims().to_vec(),
                actual: weight.dims().to_vec(),
            });
        }

        let dtype = weight.dtype();
        let upcast = dtype == DType::F16 && options.policy.upcast_half;
        if dtype == DType::F16 && !upcast {
            warn!(kind = %self.kind, "computing DoRA magnitude in f16");
        }
        let weight = if upcast {
            weight.to_dtype(DType::F32)?
        } else {
            weight
        };

        let mut norm = self.weight_norm(&weight)?;
        if upcast {
            norm = norm.to_dtype(dtype)?;
        }
        norm = norm.to_device(factors.down.device())?;
        if options.place_on_cpu {
            norm = norm.to_device(&Device::Cpu)?;
        }

        debug!(
            kind = %self.kind,
            shape = ?weight_shape.dims(),
            quantized = info.quantization.is_some(),
            ?dtype,
            upcast,
            scaling,
            "initialized DoRA magnitude"
        );

        self.state = Some(Initialized {
            reduction_dims: weight_shape.rank().saturating_sub(1),
            weight_shape,
            magnitude: Var::from_tensor(&norm)?,
        });
        Ok(())
    }

    /// The DoRA-merged weight `m * (W + s * ΔW) / (||W + s * ΔW||_c + eps)`.
    ///
    /// `base_weight` is given in the layer's storage orientation and the merged
    /// weight is returned in the same orientation. The second tensor is the
    /// composed weight `W + s * ΔW`; keep it to [`unmerge_weight`] later. A
    /// channel with zero magnitude merges to zeros and can only be restored
    /// from it.
    ///
    /// [`unmerge_weight`]: Self::unmerge_weight
    ///
    /// # Errors
    ///
    /// Returns an error before initialization or on shape mismatch.
    pub fn merge_weight(
        &self,
        base_weight: &Tensor,
        factors: &LoraFactors,
        scaling: f64,
    ) -> Result<(Tensor, Tensor)> {
        let weight = self.orient(base_weight)?;
        let composed = self.composed_weight(&weight, factors, scaling)?;
        let scale = self.magnitude_scale(&composed)?;
        let merged = composed.broadcast_mul(&scale)?;
        Ok((self.orient(&merged)?, composed))
    }

    /// Invert [`merge_weight`](Self::merge_weight) given the composed weight it
    /// returned. `merged_weight` must be the weight that merge produced.
    ///
    /// # Errors
    ///
    /// Returns [`DoraError::ShapeMismatch`] if `merged_weight` does not match
    /// the cached composed weight, or an error before initialization.
    pub fn unmerge_weight(
        &self,
        merged_weight: &Tensor,
        factors: &LoraFactors,
        scaling: f64,
        composed: &Tensor,
    ) -> Result<Tensor> {
        let merged = self.orient(merged_weight)?;
        if merged.dims() != composed.dims() {
            return Err(DoraError::ShapeMismatch {
                expected: composed.dims().to_vec(),
                actual: merged.dims().to_vec(),
            });
        }
        let delta = self.scaled_delta(factors, scaling, composed.dtype())?;
        let weight = composed.sub(&delta)?;
        self.orient(&weight)
    }

    pub(crate) fn expect_kind(&self, expected: LayerKind) -> Result<()> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(DoraError::LayerKindMismatch {
                expected: expected.as_str(),
                actual: self.kind.as_str(),
            })
        }
    }

    /// Bring a dense `(in, out)` weight into `(out, in)` orientation (and back).
    pub(crate) fn orient(&self, weight: &Tensor) -> Result<Tensor> {
        if self.fan_in_fan_out {
            Ok(weight.t()?.contiguous()?)
        } else {
            Ok(weight.clone())
        }
    }

    fn scaled_delta(&self, factors: &LoraFactors, scaling: f64, dtype: DType) -> Result<Tensor> {
        let delta = self.compose_weight(&factors.down, &factors.up)?;
        Ok(delta.affine(scaling, 0.0)?.to_dtype(dtype)?)
    }

    /// `W + s * ΔW`, in the dtype of `base_weight`.
    pub(crate) fn composed_weight(
        &self,
        base_weight: &Tensor,
        factors: &LoraFactors,
        scaling: f64,
    ) -> Result<Tensor> {
        let delta = self.scaled_delta(factors, scaling, base_weight.dtype())?;
        Ok(base_weight.add(&delta)?)
    }

    /// `||detach(W')||_c + eps`; never receives gradient.
    fn norm_denominator(&self, composed: &Tensor) -> Result<Tensor> {
        let norm = self.weight_norm(&composed.detach())?;
        Ok(norm.affine(1.0, epsilon(norm.dtype()))?)
    }

    fn magnitude_like(&self, reference: &Tensor) -> Result<Tensor> {
        let magnitude = self.magnitude()?.as_tensor();
        Ok(magnitude
            .to_device(reference.device())?
            .to_dtype(reference.dtype())?)
    }

    /// `m / (||detach(W')||_c + eps)`.
    pub(crate) fn magnitude_scale(&self, composed: &Tensor) -> Result<Tensor> {
        let denominator = self.norm_denominator(composed)?;
        let magnitude = self.magnitude_like(composed)?;
        Ok(magnitude.broadcast_div(&denominator)?)
    }
}

/// Machine epsilon for a float dtype.
#[must_use]
pub fn epsilon(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => half::f16::EPSILON.to_f64(),
        DType::BF16 => half::bf16::EPSILON.to_f64(),
        DType::F64 => f64::EPSILON,
        _ => f64::from(f32::EPSILON),
    }
}

fn transposed_shape(shape: &Shape) -> Shape {
    let mut dims = shape.dims().to_vec();
    if dims.len() >= 2 {
        dims.swap(0, 1);
    }
    Shape::from(dims)
}

/// Per-row L2 norm reshaped to `(out, 1, ..., 1)`.
pub(crate) fn channel_norm(weight: &Tensor) -> Result<Tensor> {
    let out_channels = weight.dim(0)?;
    let mut dims = vec![1; weight.rank()];
    dims[0] = out_channels;
    let norm = weight.flatten_from(1)?.sqr()?.sum_keepdim(1)?.sqrt()?;
    Ok(norm.reshape(dims)?)
}
