//! Sinusoidal positional encodings
//!
//! Even columns carry `sin(pos / 10000^(i/d_model))`, odd columns carry the
//! cosine at the frequency of the preceding even column. Pure function of
//! `(seq_len, d_model)`.

use crate::tensor::{round2, Matrix};

/// Base of the geometric frequency progression
pub const POSITIONAL_BASE: f64 = 10_000.0;

/// Encoding value for a single `(pos, i)` cell, unrounded
fn encoding_at(pos: usize, i: usize, d_model: usize) -> f64 {
    let pair = if i % 2 == 0 { i } else { i - 1 };
    let angle = pos as f64 / POSITIONAL_BASE.powf(pair as f64 / d_model as f64);
    if i % 2 == 0 {
        angle.sin()
    } else {
        angle.cos()
    }
}

/// `seq_len × d_model` encoding table, rounded to two decimals
pub fn sinusoidal_encodings(seq_len: usize, d_model: usize) -> Matrix {
    (0..seq_len)
        .map(|pos| {
            (0..d_model)
                .map(|i| round2(encoding_at(pos, i, d_model)))
                .collect()
        })
        .collect()
}
