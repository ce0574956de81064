//! Encoder forward pass with full intermediate capture
//!
//! Runs embedding, positional encoding and `n_layers` encoder layers
//! (multi-head attention, Add & Norm, feed-forward, Add & Norm) and keeps
//! every intermediate matrix in a [`TransformerData`] snapshot. Weights are
//! drawn fresh on every build; only the positional table is deterministic.
//!
//! ## Layer data flow
//!
//! ```text
//! x ──► heads (Q,K,V → Scores → /√d_k → softmax → ·V) ──► concat ──► ·Wo
//!   └──────────────────────── + ──► LayerNorm ──► out₁
//! out₁ ──► ·W1 + b1 ──► ReLU ──► ·W2 + b2
//!   └──────────────────────── + ──► LayerNorm ──► out₂ (next layer's x)
//! ```

use anyhow::{Context, Result};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Dimensions;
use crate::positional::sinusoidal_encodings;
use crate::tensor::{
    add, add_bias, concat_cols, layer_norm, mat_mul, random_matrix, random_vector, relu, scale,
    softmax_rows, transpose, Matrix, Vector,
};

/// One attention head of one layer
#[derive(Debug, Clone, Serialize)]
pub struct AttentionHeadData {
    /// Query projection, `d_model × d_k`
    pub wq: Matrix,
    /// Key projection, `d_model × d_k`
    pub wk: Matrix,
    /// Value projection, `d_model × d_k`
    pub wv: Matrix,
    /// `seq_len × d_k`
    pub q: Matrix,
    /// `seq_len × d_k`
    pub k: Matrix,
    /// `seq_len × d_k`
    pub v: Matrix,
    /// `Q·Kᵗ`, `seq_len × seq_len`
    pub scores: Matrix,
    /// `Scores / √d_k`
    pub scaled_scores: Matrix,
    /// Row-wise softmax of the scaled scores
    pub attention_weights: Matrix,
    /// `AttentionWeights · V`, `seq_len × d_k`
    pub head_output: Matrix,
}

/// Multi-head attention sublayer
#[derive(Debug, Clone, Serialize)]
pub struct MultiHeadAttentionData {
    pub heads: Vec<AttentionHeadData>,
    /// Head outputs side by side in head order, `seq_len × d_model`
    pub concat_output: Matrix,
    /// Output projection, `d_model × d_model`
    pub wo: Matrix,
    /// `ConcatOutput · Wo`
    pub output: Matrix,
}

/// Residual addition followed by row normalization
#[derive(Debug, Clone, Serialize)]
pub struct AddNormData {
    pub in_residual: Matrix,
    pub in_sublayer: Matrix,
    pub out: Matrix,
}

/// Position-wise feed-forward sublayer
#[derive(Debug, Clone, Serialize)]
pub struct FFNData {
    /// `d_model × d_ff`
    pub w1: Matrix,
    pub b1: Vector,
    /// `x·W1 + b1`, `seq_len × d_ff`
    pub intermediate: Matrix,
    /// `ReLU(Intermediate)`
    pub activated: Matrix,
    /// `d_ff × d_model`
    pub w2: Matrix,
    pub b2: Vector,
    /// `Activated·W2 + b2`, `seq_len × d_model`
    pub output: Matrix,
}

/// A single encoder layer
#[derive(Debug, Clone, Serialize)]
pub struct EncoderLayerData {
    pub mha: MultiHeadAttentionData,
    pub add_norm_1: AddNormData,
    pub ffn: FFNData,
    pub add_norm_2: AddNormData,
}

impl EncoderLayerData {
    /// Input the layer was run on (residual of the first Add & Norm)
    pub fn input(&self) -> &Matrix {
        &self.add_norm_1.in_residual
    }

    /// Output handed to the next layer
    pub fn output(&self) -> &Matrix {
        &self.add_norm_2.out
    }
}

/// Complete snapshot of one forward pass
///
/// Immutable once built; a dimension change produces a new snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TransformerData {
    pub dims: Dimensions,
    pub input_embeddings: Matrix,
    pub pos_encodings: Matrix,
    pub encoder_input: Matrix,
    pub encoder_layers: Vec<EncoderLayerData>,
}

impl TransformerData {
    /// Number of encoder layers captured
    pub fn n_layers(&self) -> usize {
        self.encoder_layers.len()
    }

    /// Get a specific layer
    pub fn layer(&self, layer: usize) -> Option<&EncoderLayerData> {
        self.encoder_layers.get(layer)
    }

    /// Final encoder output (last layer's second Add & Norm)
    pub fn final_output(&self) -> &Matrix {
        self.encoder_layers
            .last()
            .map_or(&self.encoder_input, EncoderLayerData::output)
    }
}

/// Run one attention head on `x`
fn attention_head<R: Rng>(
    rng: &mut R,
    x: &Matrix,
    dims: &Dimensions,
) -> Result<AttentionHeadData> {
    let d_k = dims.d_k();
    let wq = random_matrix(rng, dims.d_model, d_k);
    let wk = random_matrix(rng, dims.d_model, d_k);
    let wv = random_matrix(rng, dims.d_model, d_k);

    let q = mat_mul(x, &wq)?;
    let k = mat_mul(x, &wk)?;
    let v = mat_mul(x, &wv)?;

    let scores = mat_mul(&q, &transpose(&k))?;
    let scaled_scores = scale(&scores, (d_k as f64).sqrt())?;
    let attention_weights = softmax_rows(&scaled_scores)?;
    let head_output = mat_mul(&attention_weights, &v)?;

    Ok(AttentionHeadData {
        wq,
        wk,
        wv,
        q,
        k,
        v,
        scores,
        scaled_scores,
        attention_weights,
        head_output,
    })
}

fn multi_head_attention<R: Rng>(
    rng: &mut R,
    x: &Matrix,
    dims: &Dimensions,
) -> Result<MultiHeadAttentionData> {
    let mut heads = Vec::with_capacity(dims.h);
    for head in 0..dims.h {
        let data = attention_head(rng, x, dims).with_context(|| format!("attention head {head}"))?;
        heads.push(data);
    }

    let outputs: Vec<&Matrix> = heads.iter().map(|h| &h.head_output).collect();
    let concat_output = concat_cols(&outputs)?;
    let wo = random_matrix(rng, dims.d_model, dims.d_model);
    let output = mat_mul(&concat_output, &wo)?;

    Ok(MultiHeadAttentionData {
        heads,
        concat_output,
        wo,
        output,
    })
}

fn add_norm(residual: &Matrix, sublayer: &Matrix) -> Result<AddNormData> {
    let out = layer_norm(&add(residual, sublayer)?)?;
    Ok(AddNormData {
        in_residual: residual.clone(),
        in_sublayer: sublayer.clone(),
        out,
    })
}

fn feed_forward<R: Rng>(rng: &mut R, x: &Matrix, dims: &Dimensions) -> Result<FFNData> {
    let w1 = random_matrix(rng, dims.d_model, dims.d_ff);
    let b1 = random_vector(rng, dims.d_ff);
    let intermediate = add_bias(&mat_mul(x, &w1)?, &b1)?;
    let activated = relu(&intermediate);
    let w2 = random_matrix(rng, dims.d_ff, dims.d_model);
    let b2 = random_vector(rng, dims.d_model);
    let output = add_bias(&mat_mul(&activated, &w2)?, &b2)?;

    Ok(FFNData {
        w1,
        b1,
        intermediate,
        activated,
        w2,
        b2,
        output,
    })
}

fn encoder_layer<R: Rng>(
    rng: &mut R,
    x: &Matrix,
    dims: &Dimensions,
) -> Result<EncoderLayerData> {
    let mha = multi_head_attention(rng, x, dims).context("multi-head attention")?;
    let add_norm_1 = add_norm(x, &mha.output).context("add & norm 1")?;
    let ffn = feed_forward(rng, &add_norm_1.out, dims).context("feed-forward")?;
    let add_norm_2 = add_norm(&add_norm_1.out, &ffn.output).context("add & norm 2")?;

    Ok(EncoderLayerData {
        mha,
        add_norm_1,
        ffn,
        add_norm_2,
    })
}

/// Build a snapshot drawing weights from `rng`.
///
/// Fails if the dimensions are invalid or any primitive rejects its operands.
pub fn build_with_rng<R: Rng>(dims: &Dimensions, rng: &mut R) -> Result<TransformerData> {
    dims.validate()?;

    let input_embeddings = random_matrix(rng, dims.seq_len, dims.d_model);
    let pos_encodings = sinusoidal_encodings(dims.seq_len, dims.d_model);
    let encoder_input = add(&input_embeddings, &pos_encodings).context("encoder input")?;

    let mut encoder_layers = Vec::with_capacity(dims.n_layers);
    let mut current = encoder_input.clone();
    for layer in 0..dims.n_layers {
        let data = encoder_layer(rng, &current, dims).with_context(|| format!("layer {layer}"))?;
        debug!("Layer {} done", layer);
        current = data.output().clone();
        encoder_layers.push(data);
    }

    Ok(TransformerData {
        dims: *dims,
        input_embeddings,
        pos_encodings,
        encoder_input,
        encoder_layers,
    })
}

/// Build a snapshot with freshly randomized weights
pub fn build(dims: &Dimensions) -> Result<TransformerData> {
    build_with_rng(dims, &mut rand::thread_rng())
}

/// Builder boundary: `None` for rejected dimensions or a failed build.
///
/// Both cases are logged and look the same to the caller.
pub fn build_snapshot(dims: &Dimensions) -> Option<TransformerData> {
    if let Err(e) = dims.validate() {
        warn!("Rejected dimensions {:?}: {}", dims, e);
        return None;
    }

    info!(
        "Building encoder: d_model={} h={} d_k={} seq_len={} n_layers={} d_ff={}",
        dims.d_model,
        dims.h,
        dims.d_k(),
        dims.seq_len,
        dims.n_layers,
        dims.d_ff
    );
    match build(dims) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!("Forward pass failed: {:#}", e);
            None
        }
    }
}
