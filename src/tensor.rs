//! Tensor primitives for the encoder forward pass
//!
//! Matrices are stored as plain nested `Vec`s so every intermediate value is
//! addressable cell by cell. Elementwise and row-wise arithmetic runs on
//! candle CPU tensors in `f64`. Matrix products sum left to right through
//! [`dot`], so a single cell can be recomputed bit for bit. Every result is
//! rounded to two decimals before it is handed back. Later operations consume
//! the rounded values, so rounding error compounds along the chain exactly as
//! the visualizer shows it.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use rand::Rng;

/// Row-major matrix of reals; every row has the same length
pub type Matrix = Vec<Vec<f64>>;

/// Vector of reals (bias terms)
pub type Vector = Vec<f64>;

/// Epsilon added to the variance in [`layer_norm`]
pub const LAYER_NORM_EPS: f64 = 1e-5;

/// Round to two decimal places
#[inline]
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// `(rows, cols)` of a matrix; an empty matrix is `(0, 0)`
pub fn shape(m: &Matrix) -> (usize, usize) {
    (m.len(), m.first().map_or(0, Vec::len))
}

/// Shape of a non-empty rectangular matrix
fn checked_shape(m: &Matrix) -> Result<(usize, usize)> {
    let (rows, cols) = shape(m);
    anyhow::ensure!(rows > 0 && cols > 0, "degenerate {rows}x{cols} matrix");
    anyhow::ensure!(
        m.iter().all(|row| row.len() == cols),
        "ragged matrix: expected {cols} columns in every row"
    );
    Ok((rows, cols))
}

/// Lift a matrix into a `(rows, cols)` f64 tensor on the CPU
fn to_tensor(m: &Matrix) -> Result<Tensor> {
    let (rows, cols) = checked_shape(m)?;
    let flat: Vec<f64> = m.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows, cols), &Device::Cpu)?)
}

/// Bring a tensor back as a matrix, rounding every element
fn to_matrix(t: &Tensor) -> Result<Matrix> {
    let rows: Vec<Vec<f64>> = t.to_dtype(DType::F64)?.to_vec2()?;
    Ok(rows
        .into_iter()
        .map(|row| row.into_iter().map(round2).collect())
        .collect())
}

/// Uniform values in `[-1, 1)`, each rounded to two decimals
pub fn random_matrix<R: Rng>(rng: &mut R, rows: usize, cols: usize) -> Matrix {
    (0..rows).map(|_| random_vector(rng, cols)).collect()
}

/// Uniform values in `[-1, 1)`, each rounded to two decimals
pub fn random_vector<R: Rng>(rng: &mut R, len: usize) -> Vector {
    (0..len).map(|_| round2(rng.gen_range(-1.0..1.0))).collect()
}

/// `Σ a[k]·b[k]` accumulated left to right, unrounded
///
/// The one summation order for matrix products; breakdowns call it too.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).fold(0.0, |acc, (x, y)| acc + x * y)
}

/// `A · B`, each result element rounded after summation
pub fn mat_mul(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    let (a_rows, a_cols) = checked_shape(a)?;
    let (b_rows, b_cols) = checked_shape(b)?;
    anyhow::ensure!(
        a_cols == b_rows,
        "matmul shape mismatch: {a_rows}x{a_cols} · {b_rows}x{b_cols}"
    );
    let columns = transpose(b);
    Ok(a.iter()
        .map(|row| columns.iter().map(|col| round2(dot(row, col))).collect())
        .collect())
}

/// Elementwise `A + B`
pub fn add(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    anyhow::ensure!(
        shape(a) == shape(b),
        "add shape mismatch: {:?} + {:?}",
        shape(a),
        shape(b)
    );
    let out = to_tensor(a)?.add(&to_tensor(b)?)?;
    to_matrix(&out)
}

/// Divide every element by `divisor`
pub fn scale(a: &Matrix, divisor: f64) -> Result<Matrix> {
    anyhow::ensure!(divisor != 0.0, "scale by zero divisor");
    let x = to_tensor(a)?;
    let (rows, cols) = x.dims2()?;
    let denom = Tensor::full(divisor, (rows, cols), &Device::Cpu)?;
    to_matrix(&x.div(&denom)?)
}

/// Row-wise softmax (max-subtracted), rounded
///
/// Rounded rows sum to approximately one.
pub fn softmax_rows(a: &Matrix) -> Result<Matrix> {
    let x = to_tensor(a)?;
    let probs = candle_nn::ops::softmax_last_dim(&x)?;
    to_matrix(&probs)
}

/// Row-wise normalization to zero mean and unit variance.
///
/// No learned gain or bias.
pub fn layer_norm(a: &Matrix) -> Result<Matrix> {
    let x = to_tensor(a)?;
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let std = variance.affine(1.0, LAYER_NORM_EPS)?.sqrt()?;
    to_matrix(&centered.broadcast_div(&std)?)
}

/// Elementwise `max(0, x)`
///
/// Inputs are already rounded, so no further rounding happens here.
pub fn relu(a: &Matrix) -> Matrix {
    a.iter()
        .map(|row| row.iter().map(|&v| v.max(0.0)).collect())
        .collect()
}

/// Add `b` to every row of `A`
pub fn add_bias(a: &Matrix, b: &Vector) -> Result<Matrix> {
    let (_, cols) = shape(a);
    anyhow::ensure!(
        cols == b.len(),
        "bias length {} does not match {} columns",
        b.len(),
        cols
    );
    let bias = Tensor::from_slice(b.as_slice(), (1, cols), &Device::Cpu)?;
    let out = to_tensor(a)?.broadcast_add(&bias)?;
    to_matrix(&out)
}

/// Transpose
pub fn transpose(a: &Matrix) -> Matrix {
    let (rows, cols) = shape(a);
    (0..cols)
        .map(|c| (0..rows).map(|r| a[r][c]).collect())
        .collect()
}

/// Concatenate matrices along columns, preserving order
pub fn concat_cols(parts: &[&Matrix]) -> Result<Matrix> {
    anyhow::ensure!(!parts.is_empty(), "nothing to concatenate");
    let tensors = parts
        .iter()
        .map(|m| to_tensor(m))
        .collect::<Result<Vec<_>>>()?;
    let out = Tensor::cat(&tensors, 1)?;
    to_matrix(&out)
}

/// Column `col` of a matrix
pub fn column(a: &Matrix, col: usize) -> Option<Vector> {
    a.iter().map(|row| row.get(col).copied()).collect()
}
