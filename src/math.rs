//! Scalar numeric helpers: activation clamping, approximate exponential,
//! logistic sigmoid.
//!
//! # Approximate exponential
//!
//! [`fast_exp`] implements the Schraudolph bit-manipulation approximation: the
//! IEEE-754 exponent field of a `f64` is set directly from a scaled input, so
//! the whole evaluation is one multiply-add and one shift. The relative error
//! is below ~4% over the clamped activation range, which is accurate enough
//! not to change model perplexity materially (softmax renormalizes, so
//! probability distributions still sum to exactly 1).
//!
//! Reproducibility caveat: swapping this approximation for an exact `exp`
//! (or a differently-tuned approximation) shifts perplexity values at the
//! least-significant digits. That is expected, not a correctness bug.

/// Activations and pre-softmax logits are clamped to this magnitude before
/// exponentiation, for numerical stability.
pub const ACTIVATION_CLAMP: f64 = 50.0;

/// Clamps a pre-activation value to `[-ACTIVATION_CLAMP, ACTIVATION_CLAMP]`.
#[inline]
#[must_use]
pub fn clamp_activation(x: f64) -> f64 {
    x.clamp(-ACTIVATION_CLAMP, ACTIVATION_CLAMP)
}

/// Fast approximate `e^x` (Schraudolph's method).
///
/// Valid for inputs roughly in `[-700, 700]`; callers clamp to
/// [`ACTIVATION_CLAMP`] long before that. Maximum relative error is about 4%.
#[inline]
#[must_use]
pub fn fast_exp(x: f64) -> f64 {
    // 2^20 / ln 2 scales x into the exponent field; 60801 centers the
    // mantissa error (Schraudolph's constant for minimal RMS error).
    const EXP_A: f64 = 1_048_576.0 / std::f64::consts::LN_2;
    const EXP_BC: f64 = 1_072_693_248.0 - 60_801.0;
    let hi = (EXP_A * x + EXP_BC) as i64;
    f64::from_bits((hi as u64) << 32)
}

/// Logistic sigmoid `1 / (1 + e^(-x))` using [`fast_exp`].
///
/// The caller is expected to clamp `x` first; see [`clamp_activation`].
#[inline]
#[must_use]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + fast_exp(-x))
}
