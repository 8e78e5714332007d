//! Class-factored recurrent neural network language model.
//!
//! # Overview
//!
//! This crate implements a word-level recurrent language model with a
//! hierarchical (class-factored) softmax, optional hashed n-gram
//! maximum-entropy features, and truncated backpropagation through time.
//! Next-word probabilities factor as
//! `P(w | h) = P(class(w) | h) · P(w | class(w), h)`, which keeps each step
//! sub-linear in the vocabulary size: only the class segment and one class's
//! word range are ever touched.
//!
//! The crate deliberately stops at the model boundary. Corpus tokenization,
//! command-line handling, n-best rescoring drivers, and sampling loops are
//! external collaborators that feed pre-tokenized id streams in and consume
//! probabilities out.
//!
//! # Quick start
//!
//! ```rust
//! use rnnlm_rs::{RnnConfig, RnnLm, Vocabulary};
//!
//! let vocab = Vocabulary::from_counts([("</s>", 2u64), ("hello", 3), ("world", 1)]);
//! let config = RnnConfig {
//!     hidden_size: 10,
//!     class_size: 2,
//!     ..RnnConfig::default()
//! };
//! let mut model = RnnLm::new(config, vocab).unwrap();
//!
//! let train: Vec<Option<usize>> = ["hello", "world", "</s>"]
//!     .iter()
//!     .map(|t| model.lookup(t))
//!     .collect();
//! model.flush();
//! let mut last = model.lookup("</s>");
//! for &word in &train {
//!     model.train_step(last, word).unwrap();
//!     last = word;
//! }
//! let score = model.score(&train).unwrap();
//! assert!(score < 0.0);
//! ```
//!
//! # Module map
//!
//! - [`vocab`]: frequency-sorted vocabulary and contiguous class partition
//! - [`matvec`]: the sub-range matrix-vector kernels behind every layer
//! - [`direct`]: hashed n-gram feature addressing and the history ring
//! - [`network`]: layers, weights, BPTT ring, backup buffers
//! - [`model`]: the two-stage forward pass and probability accessors
//! - [`trainer`]: backward pass, truncated BPTT, epoch driver
//! - [`persist`]: versioned model files with atomic replace-on-save
//!
//! Logging goes through [`tracing`]; the library never installs a
//! subscriber.

pub mod config;
pub mod direct;
pub mod error;
pub mod math;
pub mod matvec;
pub mod model;
pub mod network;
pub mod persist;
pub mod trainer;
pub mod vocab;

pub use config::{ClassingScheme, FileType, RnnConfig};
pub use error::{ModelError, ModelResult};
pub use model::RnnLm;
pub use trainer::{LearningSchedule, TrainProgress};
pub use vocab::Vocabulary;
