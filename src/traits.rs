//! Core traits for DoRA adapters.

use candle_core::Tensor;
use candle_nn::VarMap;

use crate::Result;

/// Configuration trait for adapter hyperparameters.
pub trait AdapterConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// Adapter wrapping a frozen base layer.
pub trait Adapter: Send + Sync {
    /// The configuration type for this adapter.
    type Config: AdapterConfig;

    /// Forward pass through the adapted layer.
    ///
    /// The base operator is applied as part of the adapter computation, so the
    /// result replaces (rather than adds to) the base layer output.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Get the number of trainable parameters.
    #[must_use]
    fn num_parameters(&self) -> usize;

    /// Get the adapter's configuration.
    fn config(&self) -> &Self::Config;
}

/// Trait for adapters that can be merged into base weights.
pub trait Mergeable: Adapter {
    /// Merge adapter weights into base model weights.
    ///
    /// # Errors
    ///
    /// Returns an error if merging fails.
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor>;

    /// Unmerge adapter weights from merged weights.
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor>;
}

/// Trait for trainable adapters.
pub trait Trainable: Adapter {
    /// Register trainable parameters with the variable map.
    ///
    /// # Errors
    ///
    /// Returns an error if parameter registration fails.
    fn register_parameters(&self, var_map: &mut VarMap, prefix: &str) -> Result<()>;

    /// Freeze all adapter parameters (disable gradients).
    fn freeze(&mut self);

    /// Unfreeze all adapter parameters (enable gradients).
    fn unfreeze(&mut self);

    /// Check if the adapter is frozen.
    #[must_use]
    fn is_frozen(&self) -> bool;
}
