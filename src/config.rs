//! Configuration types for DoRA adapters.

use serde::{Deserialize, Serialize};

use crate::error::{DoraError, Result};
use crate::traits::AdapterConfig;

/// Numeric handling applied while computing the initial magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericPolicy {
    /// Compute norms of `f16` base weights in `f32`, then cast the result back.
    ///
    /// Some CPU kernels lose too much precision on half-precision reductions.
    #[serde(default = "default_true")]
    pub upcast_half: bool,
}

impl Default for NumericPolicy {
    fn default() -> Self {
        Self { upcast_half: true }
    }
}

/// Configuration for DoRA adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoraConfig {
    /// Rank of the low-rank decomposition.
    pub r: usize,

    /// Scaling numerator; the coefficient is `alpha / r` (or `alpha / sqrt(r)`).
    pub alpha: usize,

    /// Use rank-stabilized scaling `alpha / sqrt(r)`.
    #[serde(default)]
    pub use_rslora: bool,

    /// Set when the dense base weight is stored as `(in_features, out_features)`.
    #[serde(default)]
    pub fan_in_fan_out: bool,

    /// Keep the magnitude vector in host memory.
    #[serde(default)]
    pub place_on_cpu: bool,

    /// Precision handling during initialization.
    #[serde(default)]
    pub policy: NumericPolicy,
}

fn default_true() -> bool {
    true
}

impl Default for DoraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            alpha: 16,
            use_rslora: false,
            fan_in_fan_out: false,
            place_on_cpu: false,
            policy: NumericPolicy::default(),
        }
    }
}

impl DoraConfig {
    /// Scaling coefficient applied to the low-rank delta.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        if self.use_rslora {
            self.alpha as f64 / (self.r as f64).sqrt()
        } else {
            self.alpha as f64 / self.r as f64
        }
    }
}

impl AdapterConfig for DoraConfig {
    fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(DoraError::InvalidConfig("rank must be > 0".into()));
        }
        if self.alpha == 0 {
            return Err(DoraError::InvalidConfig("alpha must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dora_config_default() {
        let config = DoraConfig::default();
        assert_eq!(config.r, 8);
        assert_eq!(config.alpha, 16);
        assert!(config.policy.upcast_half);
        assert!(config.validate().is_ok());
        assert!((config.scaling() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_dora_config_invalid() {
        let config = DoraConfig {
            r: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DoraConfig {
            alpha: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rslora_scaling() {
        let config = DoraConfig {
            r: 16,
            alpha: 8,
            use_rslora: true,
            ..Default::default()
        };
        assert!((config.scaling() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_config_serde_defaults() -> anyhow::Result<()> {
        let config: DoraConfig = serde_json::from_str(r#"{"r": 4, "alpha": 8}"#)?;
        assert_eq!(config.r, 4);
        assert!(!config.fan_in_fan_out);
        assert!(!config.place_on_cpu);
        assert_eq!(config.policy, NumericPolicy::default());

        let json = serde_json::to_string(&config)?;
        let back: DoraConfig = serde_json::from_str(&json)?;
        assert_eq!(back.alpha, 8);
        Ok(())
    }
}
