//! DoRA adapter wrapping one frozen base layer.
//!
//! [`DoraLayer`] owns the trainable state of an adapted layer: the low-rank
//! factors and the [`WeightDecomposition`] holding the magnitude. The factors
//! follow the standard LoRA initialization (down ~ N(0, 1/fan_in), up = 0), so a
//! fresh adapter reproduces the base layer output.

use std::sync::{Mutex, PoisonError};

use candle_core::{DType, Tensor, Var};
use candle_nn::VarMap;
use tracing::debug;

use crate::base::{BaseLayer, WeightShapeProvider};
use crate::config::DoraConfig;
use crate::decomposition::{
    embedding_lookup, InitOptions, LayerKind, LoraFactors, WeightDecomposition,
};
use crate::error::{DoraError, Result};
use crate::gather::{LocalParams, ParamGather};
use crate::traits::{Adapter, AdapterConfig, Mergeable, Trainable};

/// DoRA layer implementing weight-decomposed low-rank adaptation.
///
/// Computes `base_op(x, m * W' / ||W'||_c)` with `W' = W + (B @ A) * scaling`.
pub struct DoraLayer {
    /// Frozen base layer
    base: BaseLayer,
    /// Down projection ("A")
    lora_down: Var,
    /// Up projection ("B")
    lora_up: Var,
    /// Magnitude and shape facts
    decomposition: WeightDecomposition,
    /// Scaling factor applied to the low-rank delta
    scaling: f64,
    /// Configuration
    config: DoraConfig,
    /// Whether gradients are disabled for the factors
    frozen: bool,
    /// Composed weight `W + s * ΔW` captured by the last `merge`
    merge_cache: Mutex<Option<Tensor>>,
}

impl DoraLayer {
    /// Wrap a base layer whose parameters are fully local.
    ///
    /// # Errors
    /// Returns error if configuration is invalid or initialization fails.
    pub fn new(base: BaseLayer, config: DoraConfig) -> Result<Self> {
        Self::new_with_gather(base, config, &LocalParams)
    }

    /// Wrap a base layer, gathering its parameters through `gather` while the
    /// initial magnitude is computed.
    ///
    /// # Errors
    /// Returns error if configuration is invalid or initialization fails.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn new_with_gather(
        base: BaseLayer,
        config: DoraConfig,
        gather: &dyn ParamGather<BaseLayer>,
    ) -> Result<Self> {
        config.validate()?;

        let info = base.weight_shape()?;
        let mut dims = info.logical_shape().dims().to_vec();
        if config.fan_in_fan_out && base.kind() == LayerKind::Dense && dims.len() == 2 {
            dims.swap(0, 1);
        }
        let shapes = FactorShapes::for_weight(base.kind(), &dims, config.r)?;

        let device = base.device();
        let std = (1.0 / shapes.fan_in as f64).sqrt();
        let down = Tensor::randn(0f32, std as f32, shapes.down, &device)?;
        let up = Tensor::zeros(shapes.up, DType::F32, &device)?;

        Self::from_factors(base, down, up, config, gather)
    }

    /// Wrap a base layer with explicit initial factors.
    ///
    /// # Errors
    /// Returns error if configuration is invalid or initialization fails.
    pub fn from_factors(
        base: BaseLayer,
        down: Tensor,
        up: Tensor,
        config: DoraConfig,
        gather: &dyn ParamGather<BaseLayer>,
    ) -> Result<Self> {
        config.validate()?;

        let scaling = config.scaling();
        let lora_down = Var::from_tensor(&down)?;
        let lora_up = Var::from_tensor(&up)?;

        let mut decomposition =
            WeightDecomposition::new(base.kind()).with_fan_in_fan_out(config.fan_in_fan_out);
        let factors = LoraFactors::new(lora_down.as_tensor().clone(), lora_up.as_tensor().clone());
        let options = InitOptions {
            policy: config.policy,
            place_on_cpu: config.place_on_cpu,
        };
        decomposition.update_layer(&base, &factors, scaling, gather, options)?;

        debug!(kind = %base.kind(), rank = config.r, scaling, "created DoRA layer");

        Ok(Self {
            base,
            lora_down,
            lora_up,
            decomposition,
            scaling,
            config,
            frozen: false,
            merge_cache: Mutex::new(None),
        })
    }

    /// Get the scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Get the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.config.r
    }

    /// The wrapped base layer.
    #[must_use]
    pub fn base(&self) -> &BaseLayer {
        &self.base
    }

    /// The magnitude/direction decomposition.
    #[must_use]
    pub fn decomposition(&self) -> &WeightDecomposition {
        &self.decomposition
    }

    /// Down projection.
    #[must_use]
    pub fn lora_down(&self) -> &Var {
        &self.lora_down
    }

    /// Up projection.
    #[must_use]
    pub fn lora_up(&self) -> &Var {
        &self.lora_up
    }

    fn factors(&self) -> LoraFactors {
        let factors = LoraFactors::new(
            self.lora_down.as_tensor().clone(),
            self.lora_up.as_tensor().clone(),
        );
        if self.frozen {
            factors.detach()
        } else {
            factors
        }
    }
}

/// Factor shapes for a base weight of a given kind.
struct FactorShapes {
    down: Vec<usize>,
    up: Vec<usize>,
    fan_in: usize,
}

impl FactorShapes {
    fn for_weight(kind: LayerKind, dims: &[usize], rank: usize) -> Result<Self> {
        match (kind, dims) {
            (LayerKind::Dense, &[out_features, in_features]) => Ok(Self {
                down: vec![rank, in_features],
                up: vec![out_features, rank],
                fan_in: in_features,
            }),
            (LayerKind::Embedding, &[vocab, features]) => Ok(Self {
                down: vec![rank, features],
                up: vec![vocab, rank],
                fan_in: features,
            }),
            (LayerKind::Conv2d, &[out_channels, in_channels, kh, kw]) => Ok(Self {
                down: vec![rank, in_channels, kh, kw],
                up: vec![out_channels, rank, 1, 1],
                fan_in: in_channels * kh * kw,
            }),
            _ => Err(DoraError::DimensionMismatch {
                message: format!("unsupported {kind} weight shape {dims:?}"),
            }),
        }
    }
}

impl Adapter for DoraLayer {
    type Config = DoraConfig;

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let factors = self.factors();
        let dora = &self.decomposition;
        match &self.base {
            BaseLayer::Linear(linear) => dora.forward_linear(input, &factors, self.scaling, linear),
            BaseLayer::QuantizedLinear(linear) => {
                dora.forward_linear(input, &factors, self.scaling, linear)
            }
            BaseLayer::Embedding(embedding) => {
                let (scale, result) = dora.forward_embedding(
                    input,
                    &factors,
                    self.scaling,
                    embedding,
                    embedding_lookup,
                )?;
                let base_output = self.base.forward_base(input)?;
                Ok(base_output.broadcast_mul(&scale)?.add(&result)?)
            }
            BaseLayer::Conv2d(conv) => dora.forward_conv2d(input, &factors, self.scaling, conv),
        }
    }

    fn num_parameters(&self) -> usize {
        let magnitude = self
            .decomposition
            .magnitude()
            .map_or(0, |magnitude| magnitude.elem_count());
        self.lora_down.elem_count() + self.lora_up.elem_count() + magnitude
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for DoraLayer {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        let factors = self.factors().detach();
        let (merged, composed) =
            self.decomposition
                .merge_weight(base_weight, &factors, self.scaling)?;
        *self
            .merge_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(composed);
        Ok(merged)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        let composed = self
            .merge_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(DoraError::NotMerged)?;
        let factors = self.factors().detach();
        self.decomposition
            .unmerge_weight(merged_weight, &factors, self.scaling, &composed)
    }
}

impl Trainable for DoraLayer {
    fn register_parameters(&self, var_map: &mut VarMap, prefix: &str) -> Result<()> {
        let magnitude = self.decomposition.magnitude()?.clone();
        let mut data = var_map.data().lock().unwrap_or_else(PoisonError::into_inner);
        data.insert(format!("{prefix}.lora_down"), self.lora_down.clone());
        data.insert(format!("{prefix}.lora_up"), self.lora_up.clone());
        data.insert(format!("{prefix}.magnitude"), magnitude);
        Ok(())
    }

    fn freeze(&mut self) {
        self.frozen = true;
    }

    fn unfreeze(&mut self) {
        self.frozen = false;
    }

    fn is_frozen(&self) -> bool {
        self.frozen
    }
}
