//! Hashed n-gram "direct connection" features (the maximum-entropy part of
//! the model).
//!
//! Recent word history is folded into one hash per n-gram order. Each hash is
//! an index into the flat direct-connection weight table, which is split into
//! two address spaces: the first half holds class-level features, the second
//! half word-level features (seeded additionally by the target word's class).
//!
//! When a feature set is applied across a contiguous id range (a class's word
//! range, or the class segment itself), the hash pointer of each order
//! advances by one slot per id, allotting one distinct table slot per order
//! per item in the range. The word half wraps modulo the table size; the
//! class half stops at the table boundary instead of wrapping.
//!
//! An out-of-vocabulary word anywhere in the consulted history truncates that
//! order and every higher order for the current step; lower orders already
//! computed stay valid.

use std::ops::Range;

use crate::network::Neuron;

/// Upper bound on the n-gram order of direct features.
pub const MAX_NGRAM_ORDER: usize = 20;

/// Odd primes mixed into the rolling hash.
const PRIMES: [u64; 36] = [
    108_641_969, 116_049_371, 125_925_907, 133_333_309, 145_678_979, 175_308_587, 197_530_793,
    234_567_803, 251_851_741, 264_197_411, 330_864_029, 399_999_781, 407_407_183, 459_258_997,
    479_012_069, 545_678_687, 560_493_491, 607_407_037, 629_629_243, 656_789_717, 716_048_933,
    718_518_067, 725_925_469, 733_332_871, 753_085_943, 755_555_077, 782_715_551, 790_122_953,
    812_345_159, 814_814_293, 893_826_581, 923_456_189, 940_740_127, 953_085_797, 985_184_539,
    990_122_807,
];

/// Fixed-capacity ring of the most recent word ids, newest first.
///
/// Slot 0 is the previous word, slot 1 the one before it, and so on. `None`
/// marks an out-of-vocabulary word.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    slots: [Option<usize>; MAX_NGRAM_ORDER],
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryBuffer {
    /// Creates a history filled with the sentence-boundary id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [Some(crate::vocab::BOUNDARY_ID); MAX_NGRAM_ORDER],
        }
    }

    /// Pushes the newest word, shifting everything one slot towards the past.
    pub fn push(&mut self, id: Option<usize>) {
        for i in (1..MAX_NGRAM_ORDER).rev() {
            self.slots[i] = self.slots[i - 1];
        }
        self.slots[0] = id;
    }

    /// Refills every slot with the sentence-boundary id.
    pub fn reset(&mut self) {
        self.slots = [Some(crate::vocab::BOUNDARY_ID); MAX_NGRAM_ORDER];
    }

    /// The id `age` steps in the past (0 = previous word).
    #[must_use]
    pub fn slot(&self, age: usize) -> Option<usize> {
        self.slots[age]
    }
}

/// Per-order hash pointers into the direct-connection table.
///
/// `slots[k]` is the starting table index of the order-`k+1` feature, or
/// `None` when that order (and every higher one) was truncated by an OOV in
/// the history.
#[derive(Debug, Clone)]
pub struct DirectHashes {
    slots: [Option<usize>; MAX_NGRAM_ORDER],
    order: usize,
}

impl DirectHashes {
    /// Hashes for the class half of the table (first `direct_size / 2`
    /// slots).
    #[must_use]
    pub fn class_features(history: &HistoryBuffer, order: usize, direct_size: usize) -> Self {
        Self::compute(history, order, direct_size, PRIMES[0].wrapping_mul(PRIMES[1]), false)
    }

    /// Hashes for the word half of the table, additionally seeded by the
    /// target word's class and mapped into the second `direct_size / 2`
    /// slots.
    #[must_use]
    pub fn word_features(
        history: &HistoryBuffer,
        order: usize,
        direct_size: usize,
        class_index: usize,
    ) -> Self {
        let seed = PRIMES[0]
            .wrapping_mul(PRIMES[1])
            .wrapping_mul(class_index as u64 + 1);
        Self::compute(history, order, direct_size, seed, true)
    }

    fn compute(
        history: &HistoryBuffer,
        order: usize,
        direct_size: usize,
        seed: u64,
        word_half: bool,
    ) -> Self {
        debug_assert!(order <= MAX_NGRAM_ORDER);
        debug_assert!(direct_size >= 2);
        let half = (direct_size / 2) as u64;

        let mut slots = [None; MAX_NGRAM_ORDER];
        for k in 0..order {
            // An OOV in the newest consulted slot kills this order and all
            // higher ones; lower orders checked the older slots already.
            if k > 0 && history.slot(k - 1).is_none() {
                break;
            }
            let mut hash = seed;
            for pos in 1..=k {
                // Slots below k-1 were vetted when the lower orders ran.
                let Some(id) = history.slot(pos - 1) else { break };
                let id = id as u64;
                let prime = PRIMES[((k as u64)
                    .wrapping_mul(PRIMES[pos % PRIMES.len()])
                    .wrapping_add(pos as u64)
                    % PRIMES.len() as u64) as usize];
                hash = hash.wrapping_add(prime.wrapping_mul(id + 1));
            }
            let index = if word_half {
                (hash % half + half) as usize
            } else {
                (hash % half) as usize
            };
            slots[k] = Some(index);
        }

        Self { slots, order }
    }

    /// Starting table index of the order-`k+1` feature, if not truncated.
    #[must_use]
    pub fn slot(&self, k: usize) -> Option<usize> {
        self.slots[k]
    }

    /// Adds the feature weights to the activations of `ids`, advancing each
    /// order's pointer one slot per id.
    ///
    /// Word-half pointers wrap modulo the table size; class-half pointers
    /// stop at the table boundary.
    pub fn accumulate(
        &mut self,
        table: &[f64],
        output: &mut [Neuron],
        ids: Range<usize>,
        wrap: bool,
    ) {
        for id in ids {
            for slot in self.slots.iter_mut().take(self.order) {
                let Some(p) = slot else { break };
                if *p >= table.len() {
                    *slot = None;
                    break;
                }
                output[id].ac += table[*p];
                *p += 1;
                if wrap {
                    *p %= table.len();
                }
            }
        }
    }

    /// Applies the gradient step `w += alpha * er - w * decay` to the feature
    /// weights addressed for `ids`, advancing pointers exactly as
    /// [`accumulate`](DirectHashes::accumulate) does.
    pub fn update(
        &mut self,
        table: &mut [f64],
        output: &[Neuron],
        ids: Range<usize>,
        alpha: f64,
        decay: f64,
        wrap: bool,
    ) {
        for id in ids {
            for slot in self.slots.iter_mut().take(self.order) {
                let Some(p) = slot else { break };
                if *p >= table.len() {
                    *slot = None;
                    break;
                }
                table[*p] += alpha * output[id].er - table[*p] * decay;
                *p += 1;
                if wrap {
                    *p %= table.len();
                }
            }
        }
    }
}
