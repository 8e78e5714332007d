//! Network and training configuration.
//!
//! [`RnnConfig`] collects the five sizing parameters that fix every buffer in
//! the network, plus the training hyperparameters. The configuration is:
//!
//! - **Serializable** - load/save from TOML or JSON files via serde
//! - **Validated** - inconsistent settings are rejected before any buffer is
//!   allocated
//! - **Defaulted** - the defaults reproduce the classic toolkit settings
//!   (hidden 30, 100 classes, learning rate 0.1, gradient cutoff 15)
//!
//! # Example
//!
//! ```rust
//! use rnnlm_rs::config::RnnConfig;
//!
//! let config = RnnConfig {
//!     hidden_size: 40,
//!     class_size: 50,
//!     bptt: 4,
//!     ..RnnConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

use crate::direct::MAX_NGRAM_ORDER;
use crate::error::{ModelError, ModelResult};

/// Payload encoding of a persisted model file.
///
/// Both encodings share the same delimiter-tagged textual header; only the
/// weight payload differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// One value per line, human-inspectable.
    Text,
    /// Little-endian `f32` per weight, compact.
    Binary,
}

impl FileType {
    /// Numeric tag used in the model file header.
    #[must_use]
    pub fn as_flag(self) -> u32 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
        }
    }

    /// Decodes the header tag.
    pub fn from_flag(flag: i64) -> ModelResult<Self> {
        match flag {
            0 => Ok(Self::Text),
            1 => Ok(Self::Binary),
            other => Err(ModelError::malformed(format!(
                "unknown file format flag {other}"
            ))),
        }
    }
}

/// How words are grouped into probability-mass classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassingScheme {
    /// Cumulative raw unigram frequency (the "old" scheme).
    Frequency,
    /// Cumulative square-root of unigram frequency. Spreads the head of the
    /// distribution over more classes, giving more balanced class widths.
    SqrtFrequency,
}

/// Complete configuration of a single model instance.
///
/// The five sizing parameters (vocabulary size arrives with the vocabulary
/// itself) determine every layer and weight buffer at network initialization;
/// nothing is resized afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RnnConfig {
    /// Hidden (recurrent state) layer size.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Compression layer size; 0 disables the layer and connects the hidden
    /// layer directly to the output.
    #[serde(default)]
    pub compression_size: usize,

    /// Number of output classes for the hierarchical softmax.
    #[serde(default = "default_class_size")]
    pub class_size: usize,

    /// Scheme used to partition sorted word ids into classes.
    #[serde(default = "default_classing")]
    pub classing: ClassingScheme,

    /// Size of the hashed direct-connection weight table; 0 disables
    /// maximum-entropy features. Must be even: the first half holds
    /// class-level features, the second half word-level features.
    #[serde(default)]
    pub direct_size: usize,

    /// Maximum n-gram order of the direct-connection features
    /// (at most [`MAX_NGRAM_ORDER`]).
    #[serde(default)]
    pub direct_order: usize,

    /// BPTT unroll depth. Values of 0 or 1 select plain backpropagation;
    /// larger values enable truncated backprop-through-time.
    #[serde(default)]
    pub bptt: usize,

    /// Number of words between BPTT unrolls when `bptt > 1`.
    #[serde(default = "default_bptt_block")]
    pub bptt_block: usize,

    /// Reset the recurrent state and n-gram history at sentence boundaries
    /// instead of carrying them across sentences.
    #[serde(default)]
    pub independent: bool,

    /// Gradient clip threshold applied by the backward matrix-vector pass;
    /// 0 disables clipping.
    #[serde(default = "default_gradient_cutoff")]
    pub gradient_cutoff: f64,

    /// Initial learning rate (alpha).
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// L2 regularization factor (beta); the effective decay per regularized
    /// update is `beta * alpha`.
    #[serde(default = "default_regularization")]
    pub regularization: f64,

    /// Apply the regularization term only every N-th global update step.
    ///
    /// The classic engine regularizes every 10th step as a performance
    /// trade-off; this is preserved as an explicit interval rather than
    /// converted to a continuous decay.
    #[serde(default = "default_regularization_interval")]
    pub regularization_interval: u64,

    /// Minimum relative improvement of the validation log-probability required
    /// to keep the learning rate; below it the rate starts halving and
    /// training stops after the first non-improving epoch at reduced rate.
    #[serde(default = "default_min_improvement")]
    pub min_improvement: f64,

    /// Save a checkpoint every this many training words; 0 disables periodic
    /// checkpointing (a checkpoint is still written after every epoch).
    #[serde(default)]
    pub checkpoint_interval: u64,

    /// Stop after a single pass over the training data, without validation.
    #[serde(default)]
    pub one_iter: bool,

    /// Seed for reproducible weight initialization.
    #[serde(default = "default_rand_seed")]
    pub rand_seed: u64,

    /// Payload encoding used when the model is saved.
    #[serde(default = "default_file_type")]
    pub file_type: FileType,

    /// Label of the training data source, recorded in the model header.
    #[serde(default = "default_source_label")]
    pub train_source: String,

    /// Label of the validation data source, recorded in the model header.
    #[serde(default = "default_source_label")]
    pub valid_source: String,
}

// Default value functions for serde
fn default_hidden_size() -> usize {
    30
}
fn default_class_size() -> usize {
    100
}
fn default_classing() -> ClassingScheme {
    ClassingScheme::SqrtFrequency
}
fn default_bptt_block() -> usize {
    10
}
fn default_gradient_cutoff() -> f64 {
    15.0
}
fn default_learning_rate() -> f64 {
    0.1
}
fn default_regularization() -> f64 {
    1e-7
}
fn default_regularization_interval() -> u64 {
    10
}
fn default_min_improvement() -> f64 {
    1.003
}
fn default_rand_seed() -> u64 {
    1
}
fn default_file_type() -> FileType {
    FileType::Text
}
fn default_source_label() -> String {
    "-".to_string()
}

impl Default for RnnConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            compression_size: 0,
            class_size: default_class_size(),
            classing: default_classing(),
            direct_size: 0,
            direct_order: 0,
            bptt: 0,
            bptt_block: default_bptt_block(),
            independent: false,
            gradient_cutoff: default_gradient_cutoff(),
            learning_rate: default_learning_rate(),
            regularization: default_regularization(),
            regularization_interval: default_regularization_interval(),
            min_improvement: default_min_improvement(),
            checkpoint_interval: 0,
            one_iter: false,
            rand_seed: default_rand_seed(),
            file_type: default_file_type(),
            train_source: default_source_label(),
            valid_source: default_source_label(),
        }
    }
}

impl RnnConfig {
    /// Checks the configuration for internally inconsistent settings.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> ModelResult<()> {
        if self.hidden_size == 0 {
            return Err(ModelError::InvalidConfig {
                detail: "hidden_size must be at least 1".to_string(),
            });
        }
        if self.class_size == 0 {
            return Err(ModelError::InvalidConfig {
                detail: "class_size must be at least 1".to_string(),
            });
        }
        if self.direct_size % 2 != 0 {
            return Err(ModelError::InvalidConfig {
                detail: format!(
                    "direct_size must be even (class half + word half), got {}",
                    self.direct_size
                ),
            });
        }
        if self.direct_size > 0 && self.direct_order == 0 {
            return Err(ModelError::InvalidConfig {
                detail: "direct_size > 0 requires direct_order >= 1".to_string(),
            });
        }
        if self.direct_order > MAX_NGRAM_ORDER {
            return Err(ModelError::InvalidConfig {
                detail: format!(
                    "direct_order {} exceeds maximum {}",
                    self.direct_order, MAX_NGRAM_ORDER
                ),
            });
        }
        if self.bptt > 1 && self.bptt_block == 0 {
            return Err(ModelError::InvalidConfig {
                detail: "bptt_block must be at least 1 when bptt > 1".to_string(),
            });
        }
        if self.gradient_cutoff < 0.0 {
            return Err(ModelError::InvalidConfig {
                detail: "gradient_cutoff must be non-negative".to_string(),
            });
        }
        if self.learning_rate <= 0.0 {
            return Err(ModelError::InvalidConfig {
                detail: "learning_rate must be positive".to_string(),
            });
        }
        if self.regularization_interval == 0 {
            return Err(ModelError::InvalidConfig {
                detail: "regularization_interval must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RnnConfig::default().validate().is_ok());
    }

    #[test]
    fn test_odd_direct_size_rejected() {
        let config = RnnConfig {
            direct_size: 101,
            direct_order: 3,
            ..RnnConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ModelError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_direct_order_bound() {
        let config = RnnConfig {
            direct_size: 1000,
            direct_order: MAX_NGRAM_ORDER + 1,
            ..RnnConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bptt_block_required() {
        let config = RnnConfig {
            bptt: 4,
            bptt_block: 0,
            ..RnnConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_type_flag_round_trip() {
        for ft in [FileType::Text, FileType::Binary] {
            assert_eq!(FileType::from_flag(i64::from(ft.as_flag())).unwrap(), ft);
        }
        assert!(FileType::from_flag(7).is_err());
    }
}
