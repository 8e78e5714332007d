//! Dense network state: layers, weight matrices, backup buffers, and the
//! truncated-BPTT ring.
//!
//! # Layout
//!
//! Four neuron layers, all `Vec<Neuron>` sized once at construction:
//!
//! - input = one-hot vocabulary segment followed by `hidden_size` feedback
//!   slots carrying the previous recurrent state
//! - hidden (the recurrent state itself)
//! - optional compression layer between hidden and output
//! - output = per-word segment `[0, vocab_size)` followed by the class
//!   segment `[vocab_size, vocab_size + class_size)`
//!
//! Weight matrices are flat row-major `Vec<f64>` keyed by destination row,
//! matching the [`crate::matvec`] kernels. Nothing is resized after
//! construction.
//!
//! # Why a feedback trait
//!
//! The copy of the hidden state into the input feedback slots is a seam:
//! alternative recurrent architectures differ exactly there (discretized
//! state, external state machines). [`HistoryFeedback`] makes the seam an
//! injected strategy instead of a hardcoded copy.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::RnnConfig;
use crate::error::ModelResult;

/// One unit: activation (forward) and error (backward).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Neuron {
    /// Activation value.
    pub ac: f64,
    /// Error (gradient) value.
    pub er: f64,
}

/// Strategy for feeding the recurrent state back into the input layer.
pub trait HistoryFeedback {
    /// Writes the hidden activations into the input feedback slots, to be
    /// consumed by the next forward pass.
    fn prepare_feedback(&mut self, hidden: &[Neuron], feedback: &mut [Neuron]);

    /// Overwrites the hidden activations from an externally restored feedback
    /// state (used when reloading a saved context).
    fn load_into_input(&mut self, stored: &[f64], feedback: &mut [Neuron]) {
        for (slot, value) in feedback.iter_mut().zip(stored) {
            slot.ac = *value;
        }
    }
}

/// Default feedback: verbatim copy of the hidden activation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectFeedback;

impl HistoryFeedback for DirectFeedback {
    fn prepare_feedback(&mut self, hidden: &[Neuron], feedback: &mut [Neuron]) {
        for (slot, h) in feedback.iter_mut().zip(hidden) {
            slot.ac = h.ac;
        }
    }
}

/// Ring buffers for truncated backpropagation through time.
///
/// `history[0]` is the most recent input word; `hidden` holds one snapshot of
/// the hidden layer per ring step (`hidden[step * hidden_size ..]`), with
/// step 0 being the current one. `syn0_delta` accumulates input-to-hidden
/// weight deltas across the unroll and is merged into the live matrix once
/// per unroll.
#[derive(Debug, Clone)]
pub struct BpttState {
    /// Unroll depth (the `bptt` setting).
    pub depth: usize,
    /// Words between unrolls (the `bptt_block` setting).
    pub block: usize,
    /// Input word ids, newest first; `None` marks OOV.
    pub history: Vec<Option<usize>>,
    /// Hidden-layer snapshots, one per ring step.
    pub hidden: Vec<Neuron>,
    /// Scratch delta matrix for the input-to-hidden weights.
    pub syn0_delta: Vec<f64>,
    hidden_size: usize,
}

impl BpttState {
    fn new(depth: usize, block: usize, layer0_size: usize, hidden_size: usize) -> Self {
        let steps = depth + block + 10;
        Self {
            depth,
            block,
            history: vec![Some(crate::vocab::BOUNDARY_ID); steps],
            hidden: vec![Neuron::default(); steps * hidden_size],
            syn0_delta: vec![0.0; layer0_size * hidden_size],
            hidden_size,
        }
    }

    /// Number of ring steps kept.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.history.len()
    }

    /// Pushes the newest word id and rotates the hidden snapshots one step
    /// towards the past. The slot for the current step is left to be filled
    /// after the forward pass.
    pub fn shift(&mut self, word: Option<usize>) {
        for i in (1..self.history.len()).rev() {
            self.history[i] = self.history[i - 1];
        }
        self.history[0] = word;
        let h = self.hidden_size;
        for step in (1..self.steps()).rev() {
            for b in 0..h {
                self.hidden[step * h + b] = self.hidden[(step - 1) * h + b];
            }
        }
    }

    /// Stores the freshly computed hidden layer as the step-0 snapshot.
    pub fn record_hidden(&mut self, hidden: &[Neuron]) {
        let h = self.hidden_size;
        self.hidden[..h].copy_from_slice(&hidden[..h]);
    }

    /// Hidden snapshot of a past ring step.
    #[must_use]
    pub fn hidden_at(&self, step: usize) -> &[Neuron] {
        let h = self.hidden_size;
        &self.hidden[step * h..(step + 1) * h]
    }

    fn reset(&mut self) {
        for slot in self.history.iter_mut().skip(1) {
            *slot = Some(crate::vocab::BOUNDARY_ID);
        }
        for n in self.hidden.iter_mut().skip(2 * self.hidden_size) {
            *n = Neuron::default();
        }
    }
}

/// All mutable network state of one model instance.
#[derive(Debug, Clone)]
pub struct NetworkState {
    /// Vocabulary size (the one-hot input segment and per-word output
    /// segment).
    pub vocab_size: usize,
    /// Hidden layer size.
    pub hidden_size: usize,
    /// Compression layer size; 0 when the layer is disabled.
    pub compression_size: usize,
    /// Number of output classes.
    pub class_size: usize,

    /// Input layer: `[0, vocab_size)` one-hot, then feedback slots.
    pub neu0: Vec<Neuron>,
    /// Hidden layer.
    pub neu1: Vec<Neuron>,
    /// Compression layer (empty when disabled).
    pub neuc: Vec<Neuron>,
    /// Output layer: word segment then class segment.
    pub neu2: Vec<Neuron>,

    /// Input-to-hidden weights, width `layer0_size()`.
    pub syn0: Vec<f64>,
    /// Hidden-to-output weights (or hidden-to-compression when the
    /// compression layer is enabled), width `hidden_size`.
    pub syn1: Vec<f64>,
    /// Compression-to-output weights, width `compression_size` (empty when
    /// the compression layer is disabled).
    pub sync: Vec<f64>,
    /// Flat direct-connection feature table.
    pub syn_d: Vec<f64>,

    /// BPTT ring, present when the unroll depth is greater than 1.
    pub bptt: Option<BpttState>,

    backup: Option<Box<Backup>>,
    context: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Backup {
    neu0: Vec<Neuron>,
    neu1: Vec<Neuron>,
    neuc: Vec<Neuron>,
    neu2: Vec<Neuron>,
    syn0: Vec<f64>,
    syn1: Vec<f64>,
    sync: Vec<f64>,
    syn_d: Vec<f64>,
}

impl NetworkState {
    /// Allocates and randomly initializes all buffers for the given sizes.
    ///
    /// Weight initialization draws each value as the sum of three uniform
    /// samples from `(-0.1, 0.1)`, seeded from `config.rand_seed` for
    /// reproducibility.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::error::ModelError::InvalidConfig`] from
    /// `config.validate()`.
    pub fn new(config: &RnnConfig, vocab_size: usize) -> ModelResult<Self> {
        config.validate()?;
        let mut state = Self::sized(config, vocab_size);
        let mut rng = ChaCha8Rng::seed_from_u64(config.rand_seed);
        for w in state
            .syn0
            .iter_mut()
            .chain(state.syn1.iter_mut())
            .chain(state.sync.iter_mut())
        {
            *w = random_weight(&mut rng);
        }
        // The direct table starts at zero: a hashed feature contributes
        // nothing until it has been observed.
        state.refresh_backup();
        Ok(state)
    }

    /// Allocates zeroed buffers for the given sizes, without initialization.
    /// Used by the persistence layer before loading saved weights.
    pub(crate) fn sized(config: &RnnConfig, vocab_size: usize) -> Self {
        let hidden = config.hidden_size;
        let compression = config.compression_size;
        let classes = config.class_size;
        let layer0 = vocab_size + hidden;
        let layer2 = vocab_size + classes;

        let syn1_rows = if compression > 0 { compression } else { layer2 };
        let mut state = Self {
            vocab_size,
            hidden_size: hidden,
            compression_size: compression,
            class_size: classes,
            neu0: vec![Neuron::default(); layer0],
            neu1: vec![Neuron::default(); hidden],
            neuc: vec![Neuron::default(); compression],
            neu2: vec![Neuron::default(); layer2],
            syn0: vec![0.0; layer0 * hidden],
            syn1: vec![0.0; hidden * syn1_rows],
            sync: vec![0.0; compression * layer2],
            syn_d: vec![0.0; config.direct_size],
            bptt: (config.bptt > 1)
                .then(|| BpttState::new(config.bptt, config.bptt_block, layer0, hidden)),
            backup: None,
            context: vec![0.0; hidden],
        };
        state.flush();
        state
    }

    /// Input layer size: one-hot segment plus feedback slots.
    #[must_use]
    pub fn layer0_size(&self) -> usize {
        self.vocab_size + self.hidden_size
    }

    /// Output layer size: word segment plus class segment.
    #[must_use]
    pub fn layer2_size(&self) -> usize {
        self.vocab_size + self.class_size
    }

    /// Index range of the feedback slots within the input layer.
    #[must_use]
    pub fn feedback_range(&self) -> std::ops::Range<usize> {
        self.vocab_size..self.layer0_size()
    }

    /// Index range of the class segment within the output layer.
    #[must_use]
    pub fn class_segment(&self) -> std::ops::Range<usize> {
        self.vocab_size..self.layer2_size()
    }

    /// Clears all activations and errors, then primes the feedback slots
    /// with the neutral activation 0.1.
    pub fn flush(&mut self) {
        for n in &mut self.neu0 {
            *n = Neuron::default();
        }
        for n in &mut self.neu0[self.vocab_size..] {
            n.ac = 0.1;
        }
        for n in self
            .neu1
            .iter_mut()
            .chain(self.neuc.iter_mut())
            .chain(self.neu2.iter_mut())
        {
            *n = Neuron::default();
        }
    }

    /// Erases the recurrent state at a sentence boundary: hidden activations
    /// to 1.0, feedback slots updated through `feedback`, and the BPTT ring
    /// history cleared to the boundary id.
    pub fn reset(&mut self, feedback: &mut dyn HistoryFeedback) {
        for n in &mut self.neu1 {
            n.ac = 1.0;
        }
        let vocab = self.vocab_size;
        feedback.prepare_feedback(&self.neu1, &mut self.neu0[vocab..]);
        if let Some(bptt) = &mut self.bptt {
            bptt.reset();
        }
    }

    /// Snapshots every weight matrix and layer for later rollback.
    pub fn save_weights(&mut self) {
        self.backup = Some(Box::new(Backup {
            neu0: self.neu0.clone(),
            neu1: self.neu1.clone(),
            neuc: self.neuc.clone(),
            neu2: self.neu2.clone(),
            syn0: self.syn0.clone(),
            syn1: self.syn1.clone(),
            sync: self.sync.clone(),
            syn_d: self.syn_d.clone(),
        }));
    }

    /// Alias for [`save_weights`](NetworkState::save_weights) used after a
    /// load, so the first rollback has something to roll back to.
    pub(crate) fn refresh_backup(&mut self) {
        self.save_weights();
    }

    /// Rolls every weight matrix and layer back to the last snapshot.
    /// No-op when no snapshot exists.
    pub fn restore_weights(&mut self) {
        if let Some(backup) = &self.backup {
            self.neu0.copy_from_slice(&backup.neu0);
            self.neu1.copy_from_slice(&backup.neu1);
            self.neuc.copy_from_slice(&backup.neuc);
            self.neu2.copy_from_slice(&backup.neu2);
            self.syn0.copy_from_slice(&backup.syn0);
            self.syn1.copy_from_slice(&backup.syn1);
            self.sync.copy_from_slice(&backup.sync);
            self.syn_d.copy_from_slice(&backup.syn_d);
        }
    }

    /// Saves only the hidden activations (cheap partial checkpoint, e.g. for
    /// rescoring several continuations of a shared prefix).
    pub fn save_context(&mut self) {
        for (slot, n) in self.context.iter_mut().zip(&self.neu1) {
            *slot = n.ac;
        }
    }

    /// Restores the hidden activations saved by
    /// [`save_context`](NetworkState::save_context) and refreshes the input
    /// feedback slots from them.
    pub fn restore_context(&mut self, feedback: &mut dyn HistoryFeedback) {
        for (n, value) in self.neu1.iter_mut().zip(&self.context) {
            n.ac = *value;
        }
        let vocab = self.vocab_size;
        feedback.load_into_input(&self.context, &mut self.neu0[vocab..]);
    }
}

fn random_weight(rng: &mut ChaCha8Rng) -> f64 {
    rng.random_range(-0.1..0.1) + rng.random_range(-0.1..0.1) + rng.random_range(-0.1..0.1)
}
