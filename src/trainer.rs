//! Training: the backward pass, truncated backpropagation through time, and
//! the epoch-level driver with validation-based learning-rate control.
//!
//! # Why the update looks the way it does
//!
//! Output errors are `indicator − probability` (the cross-entropy gradient of
//! a softmax), computed only over the target class's word range and the class
//! segment, mirroring the forward pass's sparsity. Regularization is applied
//! as weight decay folded into every N-th update step rather than every step;
//! the interval is configurable and defaults to the classic value of 10.
//!
//! With `bptt > 1` the input-to-hidden gradient is not applied immediately:
//! each step's contribution accumulates into a scratch delta matrix while the
//! error is propagated backwards through stored hidden-state snapshots, and
//! the deltas are merged into the live weights once per `bptt_block` words
//! (or at a sentence boundary in independent mode).

use std::path::Path;

use tracing::{debug, info};

use crate::error::{ModelError, ModelResult};
use crate::matvec;
use crate::model::RnnLm;
use crate::network::Neuron;
use crate::persist;
use crate::vocab::BOUNDARY_ID;

/// Learning-rate state, persisted with the model so training can resume.
#[derive(Debug, Clone, Copy)]
pub struct LearningSchedule {
    /// Learning rate at the start of training.
    pub starting_alpha: f64,
    /// Current learning rate.
    pub alpha: f64,
    /// True once validation improvement fell below the threshold; every
    /// following epoch halves the rate.
    pub dividing: bool,
}

impl Default for LearningSchedule {
    fn default() -> Self {
        // Zero rates are placeholders; model construction fills them from
        // the configured learning rate.
        Self {
            starting_alpha: 0.0,
            alpha: 0.0,
            dividing: false,
        }
    }
}

/// Training counters, persisted with the model.
#[derive(Debug, Clone, Copy)]
pub struct TrainProgress {
    /// Completed epochs.
    pub iter: u64,
    /// Position in the training stream, for resuming from a periodic
    /// checkpoint; 0 between epochs.
    pub cur_pos: u64,
    /// Global update-step counter within the current epoch.
    pub counter: u64,
    /// Accumulated log10 probability of the current epoch.
    pub logp: f64,
    /// Validation log10 probability of the previous epoch.
    pub last_logp: f64,
    /// Number of words in the training stream.
    pub train_words: u64,
}

impl Default for TrainProgress {
    fn default() -> Self {
        Self {
            iter: 0,
            cur_pos: 0,
            counter: 0,
            logp: 0.0,
            last_logp: -1e8,
            train_words: 0,
        }
    }
}

/// `matrix[rows] += alpha · er(out) ⊗ ac(input)`, with optional weight decay.
fn update_rows(
    matrix: &mut [f64],
    out: &[Neuron],
    input: &[Neuron],
    width: usize,
    rows: std::ops::Range<usize>,
    alpha: f64,
    decay: f64,
) {
    for r in rows {
        let er = out[r].er;
        let row = &mut matrix[r * width..(r + 1) * width];
        if decay > 0.0 {
            for (w, n) in row.iter_mut().zip(input) {
                *w += alpha * er * n.ac - *w * decay;
            }
        } else {
            for (w, n) in row.iter_mut().zip(input) {
                *w += alpha * er * n.ac;
            }
        }
    }
}

impl RnnLm {
    /// One backward pass for the step most recently run through
    /// [`compute`](RnnLm::compute). No-op when the target is
    /// out-of-vocabulary.
    pub(crate) fn learn(&mut self, last_word: Option<usize>, target: Option<usize>) {
        let Some(word) = target else { return };

        let alpha = self.schedule.alpha;
        let beta2 = self.config.regularization * alpha;
        let regularize = self.progress.counter % self.config.regularization_interval == 0;
        let decay = if regularize { beta2 } else { 0.0 };
        let cutoff = self.config.gradient_cutoff;
        let class = self.vocab.class_of(word);
        let word_range = self.vocab.class_range(class).ids();

        let state = &mut self.state;
        let vocab_size = state.vocab_size;
        let layer0 = state.layer0_size();
        let hidden = state.hidden_size;
        let compression = state.compression_size;
        let class_segment = state.class_segment();
        let independent = self.config.independent;

        // Output errors: cross-entropy gradient of the two softmaxes.
        for id in word_range.clone() {
            state.neu2[id].er = -state.neu2[id].ac;
        }
        state.neu2[word].er = 1.0 - state.neu2[word].ac;
        for id in class_segment.clone() {
            state.neu2[id].er = -state.neu2[id].ac;
        }
        state.neu2[vocab_size + class].er = 1.0 - state.neu2[vocab_size + class].ac;

        for n in &mut state.neu1 {
            n.er = 0.0;
        }
        for n in &mut state.neuc {
            n.er = 0.0;
        }

        // Direct features, addressed with the same pristine hash pointers
        // the forward pass used.
        if let Some(hashes) = &self.word_hashes {
            hashes.clone().update(
                &mut state.syn_d,
                &state.neu2,
                word_range.clone(),
                alpha,
                decay,
                true,
            );
        }
        if let Some(hashes) = &self.class_hashes {
            hashes.clone().update(
                &mut state.syn_d,
                &state.neu2,
                class_segment.clone(),
                alpha,
                decay,
                false,
            );
        }

        if compression == 0 {
            matvec::backward(
                &mut state.neu1,
                &state.neu2,
                &state.syn1,
                hidden,
                word_range.clone(),
                0..hidden,
                cutoff,
            );
            update_rows(
                &mut state.syn1,
                &state.neu2,
                &state.neu1,
                hidden,
                word_range,
                alpha,
                decay,
            );
            matvec::backward(
                &mut state.neu1,
                &state.neu2,
                &state.syn1,
                hidden,
                class_segment.clone(),
                0..hidden,
                cutoff,
            );
            update_rows(
                &mut state.syn1,
                &state.neu2,
                &state.neu1,
                hidden,
                class_segment,
                alpha,
                decay,
            );
        } else {
            matvec::backward(
                &mut state.neuc,
                &state.neu2,
                &state.sync,
                compression,
                word_range.clone(),
                0..compression,
                cutoff,
            );
            update_rows(
                &mut state.sync,
                &state.neu2,
                &state.neuc,
                compression,
                word_range,
                alpha,
                decay,
            );
            matvec::backward(
                &mut state.neuc,
                &state.neu2,
                &state.sync,
                compression,
                class_segment.clone(),
                0..compression,
                cutoff,
            );
            update_rows(
                &mut state.sync,
                &state.neu2,
                &state.neuc,
                compression,
                class_segment,
                alpha,
                decay,
            );
            for n in &mut state.neuc {
                n.er *= n.ac * (1.0 - n.ac);
            }
            matvec::backward(
                &mut state.neu1,
                &state.neuc,
                &state.syn1,
                hidden,
                0..compression,
                0..hidden,
                cutoff,
            );
            // The hidden-to-compression weights are never decayed.
            update_rows(
                &mut state.syn1,
                &state.neuc,
                &state.neu1,
                hidden,
                0..compression,
                alpha,
                0.0,
            );
        }

        if state.bptt.is_none() {
            // Plain backpropagation: apply the input-to-hidden gradient
            // immediately.
            for n in &mut state.neu1 {
                n.er *= n.ac * (1.0 - n.ac);
            }
            if let Some(a) = last_word {
                let ac = state.neu0[a].ac;
                for b in 0..hidden {
                    let w = &mut state.syn0[a + b * layer0];
                    *w += alpha * state.neu1[b].er * ac - *w * decay;
                }
            }
            for b in 0..hidden {
                let er = state.neu1[b].er;
                for a in vocab_size..layer0 {
                    let w = &mut state.syn0[a + b * layer0];
                    *w += alpha * er * state.neu0[a].ac - *w * decay;
                }
            }
            return;
        }

        // Truncated BPTT.
        if let Some(bptt) = &mut state.bptt {
            bptt.record_hidden(&state.neu1);

            let due = self.progress.counter % bptt.block as u64 == 0
                || (independent && word == BOUNDARY_ID);
            if !due {
                return;
            }

            let steps = bptt.depth + bptt.block - 2;
            for step in 0..steps {
                for n in &mut state.neu1 {
                    n.er *= n.ac * (1.0 - n.ac);
                }

                // One-hot input of a past step is 1.0 by construction.
                if let Some(a) = bptt.history[step] {
                    for b in 0..hidden {
                        bptt.syn0_delta[a + b * layer0] += alpha * state.neu1[b].er;
                    }
                }

                for n in &mut state.neu0[vocab_size..] {
                    n.er = 0.0;
                }
                matvec::backward(
                    &mut state.neu0,
                    &state.neu1,
                    &state.syn0,
                    layer0,
                    0..hidden,
                    vocab_size..layer0,
                    cutoff,
                );
                for b in 0..hidden {
                    let er = state.neu1[b].er;
                    for a in vocab_size..layer0 {
                        bptt.syn0_delta[a + b * layer0] += alpha * er * state.neu0[a].ac;
                    }
                }

                // Step back in time: combine the error propagated through
                // the recurrence with the error recorded at the older step,
                // then reload that step's activations.
                for b in 0..hidden {
                    state.neu1[b].er =
                        state.neu0[vocab_size + b].er + bptt.hidden[(step + 1) * hidden + b].er;
                }
                if step + 3 < bptt.depth + bptt.block {
                    for b in 0..hidden {
                        state.neu1[b].ac = bptt.hidden[(step + 1) * hidden + b].ac;
                        state.neu0[vocab_size + b].ac =
                            bptt.hidden[(step + 2) * hidden + b].ac;
                    }
                }
            }

            for n in &mut bptt.hidden[..(bptt.depth + bptt.block) * hidden] {
                n.er = 0.0;
            }
            for b in 0..hidden {
                state.neu1[b].ac = bptt.hidden[b].ac;
            }

            // Merge the accumulated deltas into the live weights, zeroing
            // the scratch as we go.
            for b in 0..hidden {
                for a in vocab_size..layer0 {
                    let idx = a + b * layer0;
                    let w = &mut state.syn0[idx];
                    *w += bptt.syn0_delta[idx] - *w * decay;
                    bptt.syn0_delta[idx] = 0.0;
                }
            }
            for b in 0..hidden {
                for step in 0..steps {
                    if let Some(a) = bptt.history[step] {
                        let idx = a + b * layer0;
                        let w = &mut state.syn0[idx];
                        *w += bptt.syn0_delta[idx] - *w * decay;
                        bptt.syn0_delta[idx] = 0.0;
                    }
                }
            }
        }
    }

    /// One full training step: forward pass, score accumulation, backward
    /// pass, state rotation.
    ///
    /// # Errors
    ///
    /// [`ModelError::NumericalDivergence`] when the accumulated
    /// log-probability stops being finite.
    pub fn train_step(
        &mut self,
        last_word: Option<usize>,
        word: Option<usize>,
    ) -> ModelResult<()> {
        self.progress.counter += 1;
        self.compute(last_word, word);
        if let Some(w) = word {
            self.progress.logp += self.target_log10_prob(w);
            if !self.progress.logp.is_finite() {
                return Err(ModelError::NumericalDivergence {
                    position: self.progress.counter,
                    logp: self.progress.logp,
                });
            }
        }
        if let Some(bptt) = &mut self.state.bptt {
            bptt.shift(last_word);
        }
        self.learn(last_word, word);
        self.feed_back();
        self.clear_input(last_word);
        self.history.push(word);
        if self.config.independent && word == Some(BOUNDARY_ID) {
            self.reset();
        }
        Ok(())
    }

    /// Multi-epoch training over pre-tokenized id streams.
    ///
    /// Each epoch walks `train_ids`, then scores `valid_ids`. When validation
    /// degrades, the weights roll back to the previous epoch's snapshot; when
    /// the relative improvement falls below `min_improvement`, the learning
    /// rate halves each epoch and training stops after the first
    /// non-improving epoch at the reduced rate. With `one_iter` set, a single
    /// epoch runs without validation.
    ///
    /// When `checkpoint` is given, the model is saved there after every epoch
    /// and (if `checkpoint_interval > 0`) every that many words within an
    /// epoch; a reloaded checkpoint resumes mid-epoch from the recorded
    /// stream position.
    ///
    /// # Errors
    ///
    /// Numeric divergence and checkpoint I/O failures.
    pub fn train(
        &mut self,
        train_ids: &[Option<usize>],
        valid_ids: &[Option<usize>],
        checkpoint: Option<&Path>,
    ) -> ModelResult<()> {
        self.progress.train_words = train_ids.len() as u64;
        self.state.save_weights();

        loop {
            let iter = self.progress.iter;
            info!(iter, alpha = self.schedule.alpha, "starting training epoch");

            let start = self.progress.cur_pos as usize;
            if start == 0 {
                self.progress.counter = 0;
                self.progress.logp = 0.0;
            }
            self.flush();

            let mut last_word = if start == 0 {
                Some(BOUNDARY_ID)
            } else {
                train_ids[start - 1]
            };
            for (pos, &word) in train_ids.iter().enumerate().skip(start) {
                self.train_step(last_word, word)?;
                self.progress.cur_pos = pos as u64 + 1;
                if let Some(path) = checkpoint {
                    let interval = self.config.checkpoint_interval;
                    if interval > 0 && self.progress.counter % interval == 0 {
                        persist::save(self, path)?;
                        debug!(
                            words = self.progress.counter,
                            "periodic checkpoint written"
                        );
                    }
                }
                last_word = word;
            }
            self.progress.cur_pos = 0;

            let words = self.progress.counter.max(1) as f64;
            let train_entropy = -self.progress.logp / f64::log10(2.0) / words;
            info!(iter, train_entropy, logp = self.progress.logp, "finished epoch");

            if self.config.one_iter {
                self.progress.iter += 1;
                if let Some(path) = checkpoint {
                    persist::save(self, path)?;
                }
                return Ok(());
            }

            let valid_logp = self.score(valid_ids)?;
            info!(iter, valid_logp, "validation pass complete");

            if valid_logp < self.progress.last_logp {
                self.state.restore_weights();
                debug!("validation degraded, weights rolled back");
            } else {
                self.state.save_weights();
            }

            if valid_logp * self.config.min_improvement < self.progress.last_logp {
                if self.schedule.dividing {
                    if let Some(path) = checkpoint {
                        persist::save(self, path)?;
                    }
                    info!(iter, "validation stopped improving, training complete");
                    return Ok(());
                }
                self.schedule.dividing = true;
                info!("improvement below threshold, halving learning rate");
            }
            if self.schedule.dividing {
                self.schedule.alpha /= 2.0;
            }
            self.progress.last_logp = valid_logp;
            self.progress.iter += 1;
            if let Some(path) = checkpoint {
                persist::save(self, path)?;
            }
        }
    }

    /// Scores a pre-tokenized id stream without learning; returns the
    /// accumulated log10 probability. Out-of-vocabulary positions propagate
    /// state but contribute nothing to the score.
    ///
    /// # Errors
    ///
    /// [`ModelError::NumericalDivergence`] if the score stops being finite.
    pub fn score(&mut self, ids: &[Option<usize>]) -> ModelResult<f64> {
        self.flush();
        let mut last_word = Some(BOUNDARY_ID);
        let mut logp = 0.0;
        let mut counted = 0u64;
        for &word in ids {
            self.compute(last_word, word);
            if let Some(w) = word {
                logp += self.target_log10_prob(w);
                counted += 1;
                if !logp.is_finite() {
                    return Err(ModelError::NumericalDivergence {
                        position: counted,
                        logp,
                    });
                }
            }
            self.feed_back();
            self.clear_input(last_word);
            self.history.push(word);
            if self.config.independent && word == Some(BOUNDARY_ID) {
                self.reset();
            }
            last_word = word;
        }
        debug!(words = counted, logp, "scoring walk complete");
        Ok(logp)
    }
}
