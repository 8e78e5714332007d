//! The matrix-vector engine: the single primitive behind every layer
//! transition.
//!
//! Both directions operate on an arbitrary sub-rectangle of a row-major weight
//! matrix, selected by an output-row range and an input-column range. The
//! range restriction is what makes the hierarchical softmax sub-linear in the
//! vocabulary size: the word stage only ever touches one class's row range.
//!
//! Results are always *added* into the destination; callers zero the
//! destination first when a fresh value is wanted.
//!
//! The kernels batch output rows (forward) or input columns (backward) in
//! groups of eight, with a scalar remainder loop. This is purely a
//! performance detail: the accumulation order per destination element is
//! identical to the naive triple loop, so results match it to within floating
//! rounding (the unit tests check 1e-9 relative error on randomized
//! sub-ranges, including widths not divisible by eight).

use std::ops::Range;

use crate::network::Neuron;

/// Forward mode: `dest[i].ac += Σ_{j ∈ cols} src[j].ac · W[j, i]` for every
/// `i ∈ rows`.
///
/// `width` is the logical width of the row-major matrix (the full input-layer
/// size), independent of the sub-ranges being computed.
pub fn forward(
    dest: &mut [Neuron],
    src: &[Neuron],
    matrix: &[f64],
    width: usize,
    rows: Range<usize>,
    cols: Range<usize>,
) {
    let row_count = rows.end - rows.start;
    let full_blocks = row_count / 8;

    for block in 0..full_blocks {
        let base = rows.start + block * 8;
        let mut acc = [0.0f64; 8];
        for j in cols.clone() {
            let ac = src[j].ac;
            for (k, slot) in acc.iter_mut().enumerate() {
                *slot += ac * matrix[j + (base + k) * width];
            }
        }
        for (k, slot) in acc.iter().enumerate() {
            dest[base + k].ac += *slot;
        }
    }

    for i in rows.start + full_blocks * 8..rows.end {
        for j in cols.clone() {
            dest[i].ac += src[j].ac * matrix[j + i * width];
        }
    }
}

/// Backward (transposed) mode: `dest[j].er += Σ_{i ∈ rows} src[i].er · W[j, i]`
/// for every `j ∈ cols`, then clamps each touched error to `[-clip, clip]`
/// when `clip > 0`.
pub fn backward(
    dest: &mut [Neuron],
    src: &[Neuron],
    matrix: &[f64],
    width: usize,
    rows: Range<usize>,
    cols: Range<usize>,
    clip: f64,
) {
    let col_count = cols.end - cols.start;
    let full_blocks = col_count / 8;

    for block in 0..full_blocks {
        let base = cols.start + block * 8;
        let mut acc = [0.0f64; 8];
        for i in rows.clone() {
            let er = src[i].er;
            for (k, slot) in acc.iter_mut().enumerate() {
                *slot += er * matrix[base + k + i * width];
            }
        }
        for (k, slot) in acc.iter().enumerate() {
            dest[base + k].er += *slot;
        }
    }

    for j in cols.start + full_blocks * 8..cols.end {
        for i in rows.clone() {
            dest[j].er += src[i].er * matrix[j + i * width];
        }
    }

    if clip > 0.0 {
        for n in &mut dest[cols] {
            n.er = n.er.clamp(-clip, clip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn naive_forward(
        dest: &mut [Neuron],
        src: &[Neuron],
        matrix: &[f64],
        width: usize,
        rows: Range<usize>,
        cols: Range<usize>,
    ) {
        for i in rows {
            for j in cols.clone() {
                dest[i].ac += src[j].ac * matrix[j + i * width];
            }
        }
    }

    fn naive_backward(
        dest: &mut [Neuron],
        src: &[Neuron],
        matrix: &[f64],
        width: usize,
        rows: Range<usize>,
        cols: Range<usize>,
        clip: f64,
    ) {
        for j in cols.clone() {
            for i in rows.clone() {
                dest[j].er += src[i].er * matrix[j + i * width];
            }
        }
        if clip > 0.0 {
            for n in &mut dest[cols] {
                n.er = n.er.clamp(-clip, clip);
            }
        }
    }

    fn random_neurons(rng: &mut ChaCha8Rng, n: usize) -> Vec<Neuron> {
        (0..n)
            .map(|_| Neuron {
                ac: rng.random_range(-1.0..1.0),
                er: rng.random_range(-1.0..1.0),
            })
            .collect()
    }

    fn assert_close(a: f64, b: f64) {
        let scale = a.abs().max(b.abs()).max(1e-12);
        assert!(
            ((a - b) / scale).abs() < 1e-9,
            "mismatch: {a} vs {b}"
        );
    }

    #[test]
    fn test_forward_matches_naive_on_random_subranges() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..50 {
            let height = rng.random_range(1..40);
            let width = rng.random_range(1..40);
            let matrix: Vec<f64> = (0..height * width)
                .map(|_| rng.random_range(-1.0..1.0))
                .collect();
            let src = random_neurons(&mut rng, width);

            let r0 = rng.random_range(0..height);
            let r1 = rng.random_range(r0..=height);
            let c0 = rng.random_range(0..width);
            let c1 = rng.random_range(c0..=width);

            let mut fast = random_neurons(&mut rng, height);
            let mut naive = fast.clone();
            forward(&mut fast, &src, &matrix, width, r0..r1, c0..c1);
            naive_forward(&mut naive, &src, &matrix, width, r0..r1, c0..c1);
            for (f, n) in fast.iter().zip(&naive) {
                assert_close(f.ac, n.ac);
            }
        }
    }

    #[test]
    fn test_backward_matches_naive_on_random_subranges() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..50 {
            let height = rng.random_range(1..40);
            let width = rng.random_range(1..40);
            let matrix: Vec<f64> = (0..height * width)
                .map(|_| rng.random_range(-1.0..1.0))
                .collect();
            let src = random_neurons(&mut rng, height);

            let r0 = rng.random_range(0..height);
            let r1 = rng.random_range(r0..=height);
            let c0 = rng.random_range(0..width);
            let c1 = rng.random_range(c0..=width);
            let clip = if rng.random_range(0..2) == 0 { 0.0 } else { 0.5 };

            let mut fast = random_neurons(&mut rng, width);
            let mut naive = fast.clone();
            backward(&mut fast, &src, &matrix, width, r0..r1, c0..c1, clip);
            naive_backward(&mut naive, &src, &matrix, width, r0..r1, c0..c1, clip);
            for (f, n) in fast.iter().zip(&naive) {
                assert_close(f.er, n.er);
            }
        }
    }

    #[test]
    fn test_forward_is_additive() {
        // The engine must accumulate, never overwrite.
        let matrix = vec![1.0, 2.0, 3.0, 4.0];
        let src = vec![Neuron { ac: 1.0, er: 0.0 }; 2];
        let mut dest = vec![Neuron { ac: 10.0, er: 0.0 }; 2];
        forward(&mut dest, &src, &matrix, 2, 0..2, 0..2);
        assert_close(dest[0].ac, 13.0);
        assert_close(dest[1].ac, 17.0);
    }

    #[test]
    fn test_backward_clips_only_touched_range() {
        let matrix = vec![10.0; 9];
        let src = vec![Neuron { ac: 0.0, er: 1.0 }; 3];
        let mut dest = vec![Neuron { ac: 0.0, er: 99.0 }; 3];
        backward(&mut dest, &src, &matrix, 3, 0..3, 1..2, 5.0);
        assert_eq!(dest[0].er, 99.0, "outside range must be untouched");
        assert_eq!(dest[1].er, 5.0, "inside range must be clipped");
        assert_eq!(dest[2].er, 99.0);
    }

    #[test]
    fn test_widths_not_multiple_of_batch() {
        // 9, 15, 17 rows exercise the remainder loop.
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        for height in [9usize, 15, 17] {
            let width = 11usize;
            let matrix: Vec<f64> = (0..height * width)
                .map(|_| rng.random_range(-1.0..1.0))
                .collect();
            let src = random_neurons(&mut rng, width);
            let mut fast = vec![Neuron::default(); height];
            let mut naive = vec![Neuron::default(); height];
            forward(&mut fast, &src, &matrix, width, 0..height, 0..width);
            naive_forward(&mut naive, &src, &matrix, width, 0..height, 0..width);
            for (f, n) in fast.iter().zip(&naive) {
                assert_close(f.ac, n.ac);
            }
        }
    }
}
