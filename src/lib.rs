//! # peft-dora
//!
//! DoRA (Weight-Decomposed Low-Rank Adaptation) for candle layers.
//!
//! DoRA augments a frozen base layer with a LoRA update and splits the adapted
//! weight into a learned per-output-channel **magnitude** and a unit-norm
//! **direction**. This crate provides:
//! - [`WeightDecomposition`]: the magnitude state plus weight reconstruction,
//!   per-channel norms and the forward strategies for dense, embedding and
//!   2D convolution layers
//! - [`DoraLayer`]: an adapter owning the trainable factors and the decomposition
//! - Capabilities for quantized and sharded base weights ([`Dequantize`],
//!   [`WeightShapeProvider`], [`ParamGather`])
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use peft_dora::{Adapter, BaseLayer, DoraConfig, DoraLayer};
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::Linear;
//!
//! let weight = Tensor::randn(0f32, 1f32, (768, 768), &Device::Cpu)?;
//! let base = BaseLayer::Linear(Linear::new(weight, None));
//! let layer = DoraLayer::new(base, DoraConfig::default())?;
//!
//! let input = Tensor::zeros(&[1, 10, 768], DType::F32, &Device::Cpu)?;
//! let output = layer.forward(&input)?;
//! ```
//!
//! Reference: <https://arxiv.org/abs/2402.09353>

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod base;
pub mod config;
pub mod decomposition;
pub mod error;
pub mod gather;
pub mod layer;
pub mod traits;

pub use base::{
    BaseLayer, Dequantize, LinearBase, QuantizationInfo, QuantizedLinear, ShapeFn,
    WeightShapeInfo, WeightShapeProvider,
};
pub use config::{DoraConfig, NumericPolicy};
pub use decomposition::{
    embedding_lookup, epsilon, InitOptions, LayerKind, LoraFactors, WeightDecomposition,
};
pub use error::{DoraError, Result};
pub use gather::{GatheredParams, LocalParams, ParamGather};
pub use layer::DoraLayer;
pub use traits::{Adapter, AdapterConfig, Mergeable, Trainable};
