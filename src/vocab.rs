//! Vocabulary and class partition.
//!
//! Words are dense integer ids in `[0, vocab_size)`. Id 0 is reserved for the
//! sentence-boundary token `</s>`; all other entries are sorted by descending
//! corpus frequency at construction time. On top of the sorted ids sits the
//! class partition for the hierarchical softmax: contiguous ranges of ids
//! grouped by cumulative (square-root) frequency mass.
//!
//! # Contiguity invariant
//!
//! Every component that iterates "all words in class c" does so as
//! `[first, first + len)`. The partition is therefore *validated*, never
//! assumed: [`Vocabulary::assign_classes`] checks its own output, and the
//! persistence codec re-validates after restoring a vocabulary from disk.
//! A violation is [`ModelError::ClassPartition`], not silent mis-indexing.

use std::collections::HashMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::ClassingScheme;
use crate::error::{ModelError, ModelResult};

/// Reserved id of the sentence-boundary token.
pub const BOUNDARY_ID: usize = 0;

/// Textual form of the sentence-boundary token.
pub const BOUNDARY_TOKEN: &str = "</s>";

/// One vocabulary entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabWord {
    /// The token itself.
    pub word: String,
    /// Occurrence count in the training corpus.
    pub count: u64,
    /// Index of the class this word belongs to.
    pub class_index: usize,
}

/// Contiguous id range of a single class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassRange {
    /// First word id in the class.
    pub first: usize,
    /// Number of words in the class.
    pub len: usize,
}

impl ClassRange {
    /// The id range `[first, first + len)`.
    #[must_use]
    pub fn ids(&self) -> Range<usize> {
        self.first..self.first + self.len
    }
}

/// The word table, lookup index, and class partition.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    words: Vec<VocabWord>,
    index: HashMap<String, usize>,
    classes: Vec<ClassRange>,
}

impl Vocabulary {
    /// Builds a vocabulary from `(word, count)` pairs.
    ///
    /// The boundary token `</s>` always receives id 0 (its count may be
    /// supplied in the input or defaults to 0); all other words are sorted by
    /// descending count. Duplicate words have their counts summed. Class
    /// assignment happens separately via [`assign_classes`].
    ///
    /// [`assign_classes`]: Vocabulary::assign_classes
    #[must_use]
    pub fn from_counts<I, S>(counts: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let mut boundary_count = 0u64;
        let mut merged: HashMap<String, u64> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (word, count) in counts {
            let word = word.into();
            if word == BOUNDARY_TOKEN {
                boundary_count += count;
                continue;
            }
            match merged.get_mut(&word) {
                Some(c) => *c += count,
                None => {
                    merged.insert(word.clone(), count);
                    order.push(word);
                }
            }
        }

        // Stable sort by descending count keeps input order among ties, so
        // construction is deterministic.
        order.sort_by(|a, b| merged[b].cmp(&merged[a]));

        let mut words = Vec::with_capacity(order.len() + 1);
        words.push(VocabWord {
            word: BOUNDARY_TOKEN.to_string(),
            count: boundary_count,
            class_index: 0,
        });
        for word in order {
            let count = merged[&word];
            words.push(VocabWord {
                word,
                count,
                class_index: 0,
            });
        }

        let index = words
            .iter()
            .enumerate()
            .map(|(id, w)| (w.word.clone(), id))
            .collect();

        Self {
            words,
            index,
            classes: Vec::new(),
        }
    }

    /// Rebuilds a vocabulary from persisted rows, including their class
    /// assignment, and validates the partition.
    ///
    /// `class_count` is the partition size recorded alongside the rows; it is
    /// carried rather than inferred because trailing classes may be empty.
    ///
    /// # Errors
    ///
    /// [`ModelError::ClassPartition`] if the restored class indices are not
    /// contiguous non-decreasing ranges within `class_count` classes, or
    /// [`ModelError::MalformedModel`] if id 0 is not the boundary token.
    pub fn from_rows(words: Vec<VocabWord>, class_count: usize) -> ModelResult<Self> {
        if words.first().map(|w| w.word.as_str()) != Some(BOUNDARY_TOKEN) {
            return Err(ModelError::malformed(format!(
                "vocabulary row 0 must be {BOUNDARY_TOKEN}"
            )));
        }
        let index = words
            .iter()
            .enumerate()
            .map(|(id, w)| (w.word.clone(), id))
            .collect();
        let mut vocab = Self {
            words,
            index,
            classes: Vec::new(),
        };
        vocab.build_ranges(class_count)?;
        Ok(vocab)
    }

    /// Number of distinct words (including the boundary token).
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// True when no words are present at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of classes in the partition (0 before assignment).
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Resolves a word to its id; `None` is out-of-vocabulary.
    #[must_use]
    pub fn lookup(&self, word: &str) -> Option<usize> {
        self.index.get(word).copied()
    }

    /// The entry for a word id.
    #[must_use]
    pub fn word(&self, id: usize) -> &VocabWord {
        &self.words[id]
    }

    /// All entries in id order.
    #[must_use]
    pub fn words(&self) -> &[VocabWord] {
        &self.words
    }

    /// Class index of a word id.
    #[must_use]
    pub fn class_of(&self, id: usize) -> usize {
        self.words[id].class_index
    }

    /// Contiguous id range of a class.
    #[must_use]
    pub fn class_range(&self, class: usize) -> ClassRange {
        self.classes[class]
    }

    /// Partitions the sorted ids into `class_size` classes by cumulative
    /// probability mass and validates the result.
    ///
    /// With [`ClassingScheme::Frequency`] the running sum of `count / total`
    /// decides the boundaries; with [`ClassingScheme::SqrtFrequency`] the
    /// running sum of normalized `sqrt(count / total)` is used instead.
    ///
    /// # Errors
    ///
    /// [`ModelError::ClassPartition`] if `class_size` is zero, or if the
    /// produced assignment violates the contiguity invariant (the latter
    /// cannot happen for a freshly sorted vocabulary, but the invariant is
    /// validated rather than trusted).
    pub fn assign_classes(
        &mut self,
        class_size: usize,
        scheme: ClassingScheme,
    ) -> ModelResult<()> {
        if class_size == 0 {
            return Err(ModelError::ClassPartition {
                detail: "cannot partition the vocabulary into zero classes".to_string(),
            });
        }
        if class_size > self.words.len() {
            tracing::warn!(
                class_size,
                vocab_size = self.words.len(),
                "number of classes exceeds vocabulary size"
            );
        }

        let total: f64 = self.words.iter().map(|w| w.count as f64).sum::<f64>().max(1.0);
        let mass = |w: &VocabWord| -> f64 {
            match scheme {
                ClassingScheme::Frequency => w.count as f64 / total,
                ClassingScheme::SqrtFrequency => (w.count as f64 / total).sqrt(),
            }
        };
        let norm: f64 = match scheme {
            ClassingScheme::Frequency => 1.0,
            ClassingScheme::SqrtFrequency => {
                self.words.iter().map(mass).sum::<f64>().max(f64::MIN_POSITIVE)
            }
        };

        let mut df = 0.0f64;
        let mut current = 0usize;
        for w in &mut self.words {
            df += match scheme {
                ClassingScheme::Frequency => w.count as f64 / total,
                ClassingScheme::SqrtFrequency => (w.count as f64 / total).sqrt() / norm,
            };
            if df > 1.0 {
                df = 1.0;
            }
            w.class_index = current;
            if df > (current + 1) as f64 / class_size as f64 && current < class_size - 1 {
                current += 1;
            }
        }

        self.build_ranges(class_size)
    }

    /// Derives the contiguous `[first, first + len)` range of each class from
    /// the per-word assignment and fails fast on any violation.
    fn build_ranges(&mut self, class_count: usize) -> ModelResult<()> {
        let mut ranges = vec![ClassRange { first: 0, len: 0 }; class_count];
        let mut prev_class = 0usize;
        for (id, w) in self.words.iter().enumerate() {
            let cl = w.class_index;
            if cl >= class_count {
                return Err(ModelError::ClassPartition {
                    detail: format!("word id {id} has class {cl} >= class count {class_count}"),
                });
            }
            if cl < prev_class {
                return Err(ModelError::ClassPartition {
                    detail: format!(
                        "class indices must be non-decreasing over ids (id {id}: class {cl} after {prev_class})"
                    ),
                });
            }
            if ranges[cl].len == 0 {
                ranges[cl].first = id;
            }
            ranges[cl].len += 1;
            prev_class = cl;
        }

        // Position empty classes between their neighbors so that concatenating
        // all ranges in class order still reconstructs [0, vocab_size).
        let mut next_first = self.words.len();
        for range in ranges.iter_mut().rev() {
            if range.len == 0 {
                range.first = next_first;
            } else {
                next_first = range.first;
            }
        }

        let mut expected = 0usize;
        for (cl, range) in ranges.iter().enumerate() {
            if range.first != expected {
                return Err(ModelError::ClassPartition {
                    detail: format!(
                        "class {cl} starts at id {} but id {expected} is the next uncovered id",
                        range.first
                    ),
                });
            }
            expected += range.len;
        }
        if expected != self.words.len() {
            return Err(ModelError::ClassPartition {
                detail: format!(
                    "class ranges cover {expected} ids, vocabulary has {}",
                    self.words.len()
                ),
            });
        }

        self.classes = ranges;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zipf_counts(n: usize) -> Vec<(String, u64)> {
        (0..n)
            .map(|i| (format!("w{i}"), (1000 / (i + 1)) as u64))
            .collect()
    }

    #[test]
    fn test_boundary_token_is_id_zero() {
        let vocab = Vocabulary::from_counts(vec![("the".to_string(), 50), ("cat".to_string(), 3)]);
        assert_eq!(vocab.lookup(BOUNDARY_TOKEN), Some(BOUNDARY_ID));
        assert_eq!(vocab.word(0).word, BOUNDARY_TOKEN);
        assert_eq!(vocab.len(), 3);
    }

    #[test]
    fn test_sorted_by_descending_count() {
        let vocab = Vocabulary::from_counts(vec![
            ("rare".to_string(), 1),
            ("common".to_string(), 100),
            ("mid".to_string(), 10),
        ]);
        assert_eq!(vocab.word(1).word, "common");
        assert_eq!(vocab.word(2).word, "mid");
        assert_eq!(vocab.word(3).word, "rare");
    }

    #[test]
    fn test_duplicate_counts_merged() {
        let vocab = Vocabulary::from_counts(vec![
            ("a".to_string(), 3),
            ("a".to_string(), 4),
        ]);
        assert_eq!(vocab.word(vocab.lookup("a").unwrap()).count, 7);
    }

    #[test]
    fn test_lookup_oov_is_none() {
        let vocab = Vocabulary::from_counts(vec![("a".to_string(), 1)]);
        assert_eq!(vocab.lookup("zzz"), None);
    }

    #[test]
    fn test_partition_coverage() {
        // Every id maps to exactly one class and concatenating the ranges in
        // class order reconstructs [0, vocab_size) with no gaps or overlaps.
        for vocab_size in [1usize, 2, 5, 37, 101] {
            for class_size in [1usize, 2, 5, 50, 100] {
                for scheme in [ClassingScheme::Frequency, ClassingScheme::SqrtFrequency] {
                    let mut vocab = Vocabulary::from_counts(zipf_counts(vocab_size));
                    vocab.assign_classes(class_size, scheme).unwrap();
                    assert_eq!(vocab.class_count(), class_size);

                    let mut covered = 0usize;
                    for cl in 0..vocab.class_count() {
                        let range = vocab.class_range(cl);
                        assert_eq!(range.first, covered, "gap before class {cl}");
                        for id in range.ids() {
                            assert_eq!(vocab.class_of(id), cl);
                        }
                        covered += range.len;
                    }
                    assert_eq!(covered, vocab.len());
                }
            }
        }
    }

    #[test]
    fn test_from_rows_round_trip() {
        let mut vocab = Vocabulary::from_counts(zipf_counts(20));
        vocab.assign_classes(4, ClassingScheme::SqrtFrequency).unwrap();
        let rebuilt = Vocabulary::from_rows(vocab.words().to_vec(), vocab.class_count()).unwrap();
        assert_eq!(rebuilt.len(), vocab.len());
        assert_eq!(rebuilt.class_count(), vocab.class_count());
        for cl in 0..vocab.class_count() {
            assert_eq!(rebuilt.class_range(cl), vocab.class_range(cl));
        }
    }

    #[test]
    fn test_from_rows_rejects_non_contiguous() {
        let rows = vec![
            VocabWord {
                word: BOUNDARY_TOKEN.to_string(),
                count: 0,
                class_index: 0,
            },
            VocabWord {
                word: "a".to_string(),
                count: 5,
                class_index: 1,
            },
            VocabWord {
                word: "b".to_string(),
                count: 4,
                class_index: 0,
            },
        ];
        assert!(matches!(
            Vocabulary::from_rows(rows, 2),
            Err(ModelError::ClassPartition { .. })
        ));
    }

    #[test]
    fn test_from_rows_keeps_trailing_empty_classes() {
        // Only classes 0 and 1 hold words; the recorded partition still has
        // four classes, and every one of them must stay addressable.
        let rows = vec![
            VocabWord {
                word: BOUNDARY_TOKEN.to_string(),
                count: 0,
                class_index: 0,
            },
            VocabWord {
                word: "a".to_string(),
                count: 5,
                class_index: 1,
            },
        ];
        let vocab = Vocabulary::from_rows(rows, 4).unwrap();
        assert_eq!(vocab.class_count(), 4);
        assert_eq!(vocab.class_range(2).len, 0);
        assert_eq!(vocab.class_range(3), ClassRange { first: 2, len: 0 });
    }

    #[test]
    fn test_zero_classes_rejected() {
        let mut vocab = Vocabulary::from_counts(zipf_counts(5));
        assert!(matches!(
            vocab.assign_classes(0, ClassingScheme::Frequency),
            Err(ModelError::ClassPartition { .. })
        ));
    }
}
