//! The language model itself: construction and the two-stage forward pass.
//!
//! # Overview
//!
//! [`RnnLm`] owns the vocabulary, the network state, the n-gram history, and
//! the training bookkeeping. A forward pass factors the next-word
//! distribution as `P(w | h) = P(class(w) | h) · P(w | class(w), h)`:
//!
//! 1. **Class stage** (always runs): input and feedback flow through the
//!    hidden layer (sigmoid), optionally through the compression layer, into
//!    a softmax over the class segment of the output layer.
//! 2. **Word stage** (runs when the target is known): the same hidden state
//!    is projected onto the target class's word range only, and a softmax is
//!    taken over that range alone. This is what keeps a step sub-linear in
//!    the vocabulary size.
//!
//! Generation-style consumers call [`RnnLm::compute`] with `target = None`,
//! sample a class from [`RnnLm::class_probs`], then run
//! [`RnnLm::compute_word_stage`] for the sampled class and sample a word
//! from its range.

use crate::config::RnnConfig;
use crate::direct::{DirectHashes, HistoryBuffer};
use crate::error::ModelResult;
use crate::matvec;
use crate::network::{DirectFeedback, HistoryFeedback, NetworkState};
use crate::trainer::{LearningSchedule, TrainProgress};
use crate::math;
use crate::vocab::Vocabulary;

/// A class-factored recurrent language model.
pub struct RnnLm {
    pub(crate) config: RnnConfig,
    pub(crate) vocab: Vocabulary,
    pub(crate) state: NetworkState,
    pub(crate) history: HistoryBuffer,
    pub(crate) feedback: Box<dyn HistoryFeedback>,
    pub(crate) schedule: LearningSchedule,
    pub(crate) progress: TrainProgress,
    // Pristine hash pointers from the last forward pass, reused by the
    // backward pass so both address the identical table slots.
    pub(crate) class_hashes: Option<DirectHashes>,
    pub(crate) word_hashes: Option<DirectHashes>,
}

impl RnnLm {
    /// Builds a model over `vocab`, assigning the class partition and
    /// initializing the network from `config.rand_seed`.
    ///
    /// # Errors
    ///
    /// Configuration validation failures and
    /// [`crate::error::ModelError::ClassPartition`] if the partition cannot
    /// be built.
    pub fn new(config: RnnConfig, mut vocab: Vocabulary) -> ModelResult<Self> {
        config.validate()?;
        vocab.assign_classes(config.class_size, config.classing)?;
        let state = NetworkState::new(&config, vocab.len())?;
        Ok(Self::from_parts(
            config,
            vocab,
            state,
            LearningSchedule::default(),
            TrainProgress::default(),
        ))
    }

    pub(crate) fn from_parts(
        config: RnnConfig,
        vocab: Vocabulary,
        state: NetworkState,
        schedule: LearningSchedule,
        progress: TrainProgress,
    ) -> Self {
        let schedule = LearningSchedule {
            starting_alpha: if schedule.starting_alpha > 0.0 {
                schedule.starting_alpha
            } else {
                config.learning_rate
            },
            alpha: if schedule.alpha > 0.0 {
                schedule.alpha
            } else {
                config.learning_rate
            },
            ..schedule
        };
        Self {
            config,
            vocab,
            state,
            history: HistoryBuffer::new(),
            feedback: Box::new(DirectFeedback),
            schedule,
            progress,
            class_hashes: None,
            word_hashes: None,
        }
    }

    /// Replaces the history-feedback strategy.
    #[must_use]
    pub fn with_feedback(mut self, feedback: Box<dyn HistoryFeedback>) -> Self {
        self.feedback = feedback;
        self
    }

    /// The configuration this model was built with.
    #[must_use]
    pub fn config(&self) -> &RnnConfig {
        &self.config
    }

    /// The vocabulary and class partition.
    #[must_use]
    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Read access to the raw network state.
    #[must_use]
    pub fn network(&self) -> &NetworkState {
        &self.state
    }

    /// Training counters (epochs finished, stream position, running score).
    #[must_use]
    pub fn progress(&self) -> &TrainProgress {
        &self.progress
    }

    /// Learning-rate state.
    #[must_use]
    pub fn schedule(&self) -> &LearningSchedule {
        &self.schedule
    }

    /// One forward pass. `last_word` is the input word of this step (`None`
    /// for OOV); `target` selects the word stage's class, or `None` to stop
    /// after the class softmax.
    ///
    /// The one-hot input activation stays set afterwards so the backward
    /// pass can see it; step drivers clear it via
    /// [`clear_input`](RnnLm::clear_input).
    pub fn compute(&mut self, last_word: Option<usize>, target: Option<usize>) {
        let state = &mut self.state;
        let layer0 = state.layer0_size();
        let hidden = state.hidden_size;
        let feedback_range = state.feedback_range();
        let class_segment = state.class_segment();

        if let Some(w) = last_word {
            state.neu0[w].ac = 1.0;
        }
        for n in &mut state.neu1 {
            n.ac = 0.0;
        }
        for n in &mut state.neuc {
            n.ac = 0.0;
        }

        // Input to hidden: recurrent feedback block, then the single one-hot
        // column (a full multiply over the vocabulary segment would be
        // wasted on zeros).
        matvec::forward(
            &mut state.neu1,
            &state.neu0,
            &state.syn0,
            layer0,
            0..hidden,
            feedback_range,
        );
        if let Some(w) = last_word {
            let ac = state.neu0[w].ac;
            for b in 0..hidden {
                state.neu1[b].ac += ac * state.syn0[w + b * layer0];
            }
        }
        for n in &mut state.neu1 {
            n.ac = math::sigmoid(math::clamp_activation(n.ac));
        }

        if state.compression_size > 0 {
            matvec::forward(
                &mut state.neuc,
                &state.neu1,
                &state.syn1,
                hidden,
                0..state.compression_size,
                0..hidden,
            );
            for n in &mut state.neuc {
                n.ac = math::sigmoid(math::clamp_activation(n.ac));
            }
        }

        // Class stage.
        for n in &mut state.neu2[class_segment.clone()] {
            n.ac = 0.0;
        }
        if state.compression_size > 0 {
            matvec::forward(
                &mut state.neu2,
                &state.neuc,
                &state.sync,
                state.compression_size,
                class_segment.clone(),
                0..state.compression_size,
            );
        } else {
            matvec::forward(
                &mut state.neu2,
                &state.neu1,
                &state.syn1,
                hidden,
                class_segment.clone(),
                0..hidden,
            );
        }

        self.class_hashes = None;
        self.word_hashes = None;
        if !state.syn_d.is_empty() && self.config.direct_order > 0 {
            let hashes = DirectHashes::class_features(
                &self.history,
                self.config.direct_order,
                state.syn_d.len(),
            );
            hashes
                .clone()
                .accumulate(&state.syn_d, &mut state.neu2, class_segment.clone(), false);
            self.class_hashes = Some(hashes);
        }

        let mut sum = 0.0;
        for n in &mut state.neu2[class_segment.clone()] {
            n.ac = math::fast_exp(math::clamp_activation(n.ac));
            sum += n.ac;
        }
        for n in &mut state.neu2[class_segment] {
            n.ac /= sum;
        }

        if let Some(word) = target {
            let class = self.vocab.class_of(word);
            self.compute_word_stage(class);
        }
    }

    /// Word stage of the forward pass for one class: projects the hidden
    /// (or compression) state onto the class's word range and normalizes
    /// over that range only.
    pub fn compute_word_stage(&mut self, class: usize) {
        let range = self.vocab.class_range(class).ids();
        let state = &mut self.state;
        let hidden = state.hidden_size;

        for n in &mut state.neu2[range.clone()] {
            n.ac = 0.0;
        }
        if state.compression_size > 0 {
            matvec::forward(
                &mut state.neu2,
                &state.neuc,
                &state.sync,
                state.compression_size,
                range.clone(),
                0..state.compression_size,
            );
        } else {
            matvec::forward(
                &mut state.neu2,
                &state.neu1,
                &state.syn1,
                hidden,
                range.clone(),
                0..hidden,
            );
        }

        self.word_hashes = None;
        if !state.syn_d.is_empty() && self.config.direct_order > 0 {
            let hashes = DirectHashes::word_features(
                &self.history,
                self.config.direct_order,
                state.syn_d.len(),
                class,
            );
            hashes
                .clone()
                .accumulate(&state.syn_d, &mut state.neu2, range.clone(), true);
            self.word_hashes = Some(hashes);
        }

        let mut sum = 0.0;
        for n in &mut state.neu2[range.clone()] {
            n.ac = math::fast_exp(math::clamp_activation(n.ac));
            sum += n.ac;
        }
        for n in &mut state.neu2[range] {
            n.ac /= sum;
        }
    }

    /// Probability of one class after the last forward pass.
    #[must_use]
    pub fn class_prob(&self, class: usize) -> f64 {
        self.state.neu2[self.state.vocab_size + class].ac
    }

    /// The full class distribution after the last forward pass.
    #[must_use]
    pub fn class_probs(&self) -> Vec<f64> {
        self.state.neu2[self.state.class_segment()]
            .iter()
            .map(|n| n.ac)
            .collect()
    }

    /// Within-class probability of a word whose class ran the word stage.
    #[must_use]
    pub fn word_prob(&self, word: usize) -> f64 {
        self.state.neu2[word].ac
    }

    /// Joint probability `P(class) · P(word | class)` of the last computed
    /// target.
    #[must_use]
    pub fn target_prob(&self, word: usize) -> f64 {
        self.word_prob(word) * self.class_prob(self.vocab.class_of(word))
    }

    /// `log10` of [`target_prob`](RnnLm::target_prob), the unit in which
    /// corpus scores accumulate.
    #[must_use]
    pub fn target_log10_prob(&self, word: usize) -> f64 {
        self.target_prob(word).log10()
    }

    /// Clears the one-hot activation set by the last
    /// [`compute`](RnnLm::compute).
    pub fn clear_input(&mut self, last_word: Option<usize>) {
        if let Some(w) = last_word {
            self.state.neu0[w].ac = 0.0;
        }
    }

    /// Copies the hidden state into the input feedback slots for the next
    /// step.
    pub(crate) fn feed_back(&mut self) {
        let NetworkState {
            neu0,
            neu1,
            vocab_size,
            ..
        } = &mut self.state;
        self.feedback.prepare_feedback(neu1, &mut neu0[*vocab_size..]);
    }

    /// Clears activations (feedback slots to 0.1) and refills the n-gram
    /// history with boundary ids. Called at the start of every training or
    /// scoring walk.
    pub fn flush(&mut self) {
        self.state.flush();
        self.history.reset();
    }

    /// Hard reset of the recurrent state at a sentence boundary (independent
    /// mode): hidden activations to 1.0 and both history rings cleared.
    pub fn reset(&mut self) {
        self.state.reset(self.feedback.as_mut());
        self.history.reset();
    }

    /// Saves the hidden state for later [`restore_context`](RnnLm::restore_context)
    /// (e.g. scoring several continuations of a shared prefix).
    pub fn save_context(&mut self) {
        self.state.save_context();
    }

    /// Restores the hidden state saved by [`save_context`](RnnLm::save_context).
    pub fn restore_context(&mut self) {
        self.state.restore_context(self.feedback.as_mut());
    }

    /// Resolves a token to its word id (`None` is out-of-vocabulary).
    #[must_use]
    pub fn lookup(&self, token: &str) -> Option<usize> {
        self.vocab.lookup(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::BOUNDARY_TOKEN;

    fn tiny_model(config: RnnConfig) -> RnnLm {
        let vocab = Vocabulary::from_counts([
            (BOUNDARY_TOKEN, 4u64),
            ("the", 10),
            ("cat", 6),
            ("sat", 3),
            ("mat", 1),
        ]);
        RnnLm::new(config, vocab).unwrap()
    }

    fn config_with(class_size: usize) -> RnnConfig {
        RnnConfig {
            hidden_size: 8,
            class_size,
            ..RnnConfig::default()
        }
    }

    #[test]
    fn test_class_distribution_normalizes() {
        let mut model = tiny_model(config_with(3));
        model.flush();
        model.compute(Some(1), None);
        let total: f64 = model.class_probs().iter().sum();
        assert!((total - 1.0).abs() < 1e-6, "class mass {total}");
    }

    #[test]
    fn test_word_distribution_normalizes_within_class() {
        let mut model = tiny_model(config_with(2));
        model.flush();
        let target = model.lookup("cat").unwrap();
        model.compute(Some(1), Some(target));
        let class = model.vocab().class_of(target);
        let total: f64 = model
            .vocab()
            .class_range(class)
            .ids()
            .map(|id| model.word_prob(id))
            .sum();
        assert!((total - 1.0).abs() < 1e-6, "word mass {total}");
    }

    #[test]
    fn test_joint_probability_bounded() {
        let mut model = tiny_model(config_with(2));
        model.flush();
        let target = model.lookup("the").unwrap();
        model.compute(None, Some(target));
        let p = model.target_prob(target);
        assert!(p > 0.0 && p < 1.0);
        assert!(model.target_log10_prob(target) < 0.0);
    }

    #[test]
    fn test_oov_input_still_produces_class_distribution() {
        let mut model = tiny_model(config_with(3));
        model.flush();
        model.compute(None, None);
        let total: f64 = model.class_probs().iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_direct_features_change_distribution() {
        let plain = {
            let mut model = tiny_model(config_with(2));
            model.flush();
            model.compute(Some(1), None);
            model.class_probs()
        };
        let with_direct = {
            let mut model = tiny_model(RnnConfig {
                direct_size: 1024,
                direct_order: 2,
                ..config_with(2)
            });
            // Zeroed direct table contributes nothing yet.
            model.flush();
            model.compute(Some(1), None);
            let before = model.class_probs();
            for w in &mut model.state.syn_d {
                *w = 0.3;
            }
            model.flush();
            model.compute(Some(1), None);
            (before, model.class_probs())
        };
        assert_eq!(plain, with_direct.0, "zero table must be a no-op");
        assert_ne!(with_direct.0, with_direct.1);
    }

    #[test]
    fn test_compression_layer_path() {
        let mut model = tiny_model(RnnConfig {
            compression_size: 4,
            ..config_with(2)
        });
        model.flush();
        let target = model.lookup("sat").unwrap();
        model.compute(Some(2), Some(target));
        let total: f64 = model.class_probs().iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(model.target_prob(target) > 0.0);
    }

    #[test]
    fn test_forward_is_deterministic_after_flush() {
        let mut model = tiny_model(config_with(2));
        model.flush();
        model.compute(Some(1), Some(2));
        let first = model.target_prob(2);
        model.clear_input(Some(1));
        model.flush();
        model.compute(Some(1), Some(2));
        assert_eq!(first, model.target_prob(2));
    }
}
