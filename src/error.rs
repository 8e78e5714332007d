//! Error types for the language model engine.
//!
//! Every fatal condition the engine can hit has its own variant, carrying
//! enough context to diagnose the failure without a debugger. Out-of-vocabulary
//! words are deliberately *not* an error: they are represented as `None` word
//! ids throughout the crate and handled inline by the forward and backward
//! passes.
//!
//! # Fatal vs. recoverable
//!
//! - **Fatal**: I/O failures on model files, unknown model format versions,
//!   malformed model payloads, a corrupted class partition, and a non-finite
//!   running log-probability during training (numeric divergence must never be
//!   silently tolerated).
//! - **Recoverable**: OOV tokens. The class-level forward pass still runs and
//!   the backward pass simply skips the weight update for that position.
//!
//! Buffer allocation failures are not modeled here: all buffers are sized once
//! at network initialization and Rust aborts the process on allocation failure,
//! which matches the "model cannot run under-allocated" contract.

use thiserror::Error;

/// The main error type for model construction, training, and persistence.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Model file missing, unreadable, or unwritable.
    #[error("model file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The model file declares a format version this loader cannot read.
    ///
    /// Versions 4 through [`crate::persist::MODEL_VERSION`] are accepted;
    /// fields introduced after an old version are filled with documented
    /// defaults. Anything else is rejected fatally.
    #[error("unsupported model file version {found} (supported: {min}..={max})")]
    UnsupportedVersion {
        /// Version read from the file header.
        found: i64,
        /// Oldest version the compatibility shim accepts.
        min: u32,
        /// Newest version this build writes.
        max: u32,
    },

    /// The model file is structurally broken (missing delimiter, field that
    /// fails to parse, truncated payload).
    #[error("malformed model file: {detail}")]
    MalformedModel {
        /// Description of the first inconsistency encountered.
        detail: String,
    },

    /// The running log-probability became NaN or infinite during training.
    ///
    /// Signals numeric divergence; training must abort rather than continue
    /// on garbage weights.
    #[error("numerical divergence at word {position}: accumulated log10 probability is {logp}")]
    NumericalDivergence {
        /// Global word counter at the point of failure.
        position: u64,
        /// The offending accumulated value.
        logp: f64,
    },

    /// The class partition violates the contiguous-range invariant.
    ///
    /// Every component that iterates "all words in class c" relies on the
    /// class occupying the id range `[first, first + len)`. A vocabulary that
    /// breaks this (e.g. an externally edited model file) must be rejected at
    /// load time, never silently mis-indexed.
    #[error("class partition invariant violated: {detail}")]
    ClassPartition {
        /// Description of the gap, overlap, or ordering violation.
        detail: String,
    },

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {detail}")]
    InvalidConfig {
        /// Description of the offending parameter combination.
        detail: String,
    },
}

/// Convenience alias used throughout the crate.
pub type ModelResult<T> = Result<T, ModelError>;

impl ModelError {
    /// Shorthand for a malformed-model error with a formatted detail string.
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedModel {
            detail: detail.into(),
        }
    }
}
