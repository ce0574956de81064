//! Per-cell calculation breakdown
//!
//! Recomputes a selected cell from the operands stored in the snapshot and
//! reports them as steps (dot products, elementwise ops, softmax, norm) for
//! display next to the highlighted sources. Every step goes through the same
//! primitives and summation order as the forward pass, so the last step of a
//! breakdown equals the stored cell bit for bit.

use serde::Serialize;

use crate::address::{
    AddNormPart, AddNormSlot, ElementIdentifier, FfnTensor, HeadMatrix, LayerTensor, TensorPath,
};
use crate::forward::TransformerData;
use crate::tensor::{self, round2, Vector, LAYER_NORM_EPS};

/// Operation that produced a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpKind {
    MatMul,
    Add,
    Scale,
    Softmax,
    LayerNorm,
    Relu,
    /// Leaf value (weights, embeddings) or unknown cell
    Info,
}

/// One step of a breakdown: `a <op> b = result`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationStep {
    pub label: String,
    pub a: Vector,
    pub b: Vector,
    pub op: &'static str,
    pub result: f64,
}

/// Breakdown of a single cell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calculation {
    pub target: ElementIdentifier,
    pub op: OpKind,
    pub title: String,
    /// Stored value of the target, if it exists
    pub value: Option<f64>,
    pub steps: Vec<CalculationStep>,
}

fn dot_step(label: String, a: Vector, b: Vector) -> CalculationStep {
    let result = round2(tensor::dot(&a, &b));
    CalculationStep {
        label,
        a,
        b,
        op: "·",
        result,
    }
}

fn scalar_step(label: String, a: f64, op: &'static str, b: f64, result: f64) -> CalculationStep {
    CalculationStep {
        label,
        a: vec![a],
        b: vec![b],
        op,
        result,
    }
}

/// `row · column` of two stored matrices, plus an optional bias cell
fn matmul_steps(
    data: &TransformerData,
    lhs: TensorPath,
    rhs: TensorPath,
    bias: Option<TensorPath>,
    row: usize,
    col: usize,
) -> Option<Vec<CalculationStep>> {
    let a = data.lookup(&lhs)?.row(row)?;
    let b = data.lookup(&rhs)?.column(col)?;
    let product = dot_step(format!("{lhs}[{row},:] · {rhs}[:,{col}]"), a, b);
    let mut steps = Vec::with_capacity(2);
    if let Some(bias) = bias {
        let bias_value = data.lookup(&bias)?.get(0, col)?;
        let sum = round2(product.result + bias_value);
        let label = format!("+ {bias}[{col}]");
        let partial = product.result;
        steps.push(product);
        steps.push(scalar_step(label, partial, "+", bias_value, sum));
    } else {
        steps.push(product);
    }
    Some(steps)
}

struct Breakdown {
    op: OpKind,
    title: String,
    steps: Vec<CalculationStep>,
}

impl Breakdown {
    fn new(op: OpKind, title: &str, steps: Vec<CalculationStep>) -> Self {
        Self {
            op,
            title: title.to_string(),
            steps,
        }
    }
}

fn head_breakdown(
    data: &TransformerData,
    layer: usize,
    head: usize,
    matrix: HeadMatrix,
    row: usize,
    col: usize,
) -> Option<Breakdown> {
    let at = |m: HeadMatrix| TensorPath::head(layer, head, m);
    let input = TensorPath::add_norm(layer, AddNormSlot::First, AddNormPart::InResidual);

    match matrix {
        HeadMatrix::Q | HeadMatrix::K | HeadMatrix::V => {
            let weight = at(matrix.projection_weight()?);
            let steps = matmul_steps(data, input, weight, None, row, col)?;
            Some(Breakdown::new(OpKind::MatMul, "Input projection", steps))
        }
        HeadMatrix::Scores => {
            let q = data.lookup(&at(HeadMatrix::Q))?.row(row)?;
            let k = data.lookup(&at(HeadMatrix::K))?.row(col)?;
            let label = format!("{}[{row},:] · {}[{col},:]", at(HeadMatrix::Q), at(HeadMatrix::K));
            Some(Breakdown::new(
                OpKind::MatMul,
                "Attention score",
                vec![dot_step(label, q, k)],
            ))
        }
        HeadMatrix::ScaledScores => {
            let score = data.lookup(&at(HeadMatrix::Scores))?.get(row, col)?;
            let divisor = (data.dims.d_k() as f64).sqrt();
            let label = format!("{}[{row},{col}] / √d_k", at(HeadMatrix::Scores));
            Some(Breakdown::new(
                OpKind::Scale,
                "Scaled score",
                vec![scalar_step(label, score, "/", divisor, round2(score / divisor))],
            ))
        }
        HeadMatrix::AttentionWeights => {
            let scores = data.lookup(&at(HeadMatrix::ScaledScores))?.row(row)?;
            let probs = tensor::softmax_rows(&vec![scores.clone()]).ok()?;
            let result = *probs.first()?.get(col)?;
            Some(Breakdown::new(
                OpKind::Softmax,
                "Attention weight",
                vec![CalculationStep {
                    label: format!("softmax({}[{row},:])[{col}]", at(HeadMatrix::ScaledScores)),
                    a: scores,
                    b: Vec::new(),
                    op: "softmax",
                    result,
                }],
            ))
        }
        HeadMatrix::HeadOutput => {
            let steps = matmul_steps(
                data,
                at(HeadMatrix::AttentionWeights),
                at(HeadMatrix::V),
                None,
                row,
                col,
            )?;
            Some(Breakdown::new(OpKind::MatMul, "Head output", steps))
        }
        HeadMatrix::Wq | HeadMatrix::Wk | HeadMatrix::Wv => None,
    }
}

fn add_norm_breakdown(
    data: &TransformerData,
    layer: usize,
    slot: AddNormSlot,
    row: usize,
    col: usize,
) -> Option<Breakdown> {
    let residual_path = TensorPath::add_norm(layer, slot, AddNormPart::InResidual);
    let sublayer_path = TensorPath::add_norm(layer, slot, AddNormPart::InSublayer);
    let residual = data.lookup(&residual_path)?.row(row)?;
    let sublayer = data.lookup(&sublayer_path)?.row(row)?;

    let summed = tensor::add(&vec![residual.clone()], &vec![sublayer.clone()])
        .ok()?
        .pop()?;
    let normalized = *tensor::layer_norm(&vec![summed.clone()]).ok()?.first()?.get(col)?;
    // Shown alongside the step only; the result above comes from the primitive.
    let n = summed.len() as f64;
    let mean = summed.iter().sum::<f64>() / n;
    let variance = summed.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let std = (variance + LAYER_NORM_EPS).sqrt();

    let add = CalculationStep {
        label: format!("{residual_path}[{row},:] + {sublayer_path}[{row},:]"),
        result: *summed.get(col)?,
        a: residual,
        b: sublayer,
        op: "+",
    };
    let norm = CalculationStep {
        label: format!("LayerNorm(sum[{row},:])[{col}]"),
        a: summed,
        b: vec![mean, std],
        op: "layernorm",
        result: normalized,
    };
    Some(Breakdown::new(OpKind::LayerNorm, "Residual add & norm", vec![add, norm]))
}

fn ffn_breakdown(
    data: &TransformerData,
    layer: usize,
    tensor: FfnTensor,
    row: usize,
    col: usize,
) -> Option<Breakdown> {
    let at = |t: FfnTensor| TensorPath::ffn(layer, t);
    let input = TensorPath::add_norm(layer, AddNormSlot::First, AddNormPart::Out);

    match tensor {
        FfnTensor::Intermediate => {
            let steps = matmul_steps(
                data,
                input,
                at(FfnTensor::W1),
                Some(at(FfnTensor::B1)),
                row,
                col,
            )?;
            Some(Breakdown::new(OpKind::MatMul, "First linear layer", steps))
        }
        FfnTensor::Activated => {
            let x = data.lookup(&at(FfnTensor::Intermediate))?.get(row, col)?;
            let label = format!("max(0, {}[{row},{col}])", at(FfnTensor::Intermediate));
            Some(Breakdown::new(
                OpKind::Relu,
                "ReLU activation",
                vec![scalar_step(label, x, "relu", 0.0, x.max(0.0))],
            ))
        }
        FfnTensor::Output => {
            let steps = matmul_steps(
                data,
                at(FfnTensor::Activated),
                at(FfnTensor::W2),
                Some(at(FfnTensor::B2)),
                row,
                col,
            )?;
            Some(Breakdown::new(OpKind::MatMul, "Second linear layer", steps))
        }
        FfnTensor::W1 | FfnTensor::B1 | FfnTensor::W2 | FfnTensor::B2 => None,
    }
}

fn breakdown(
    data: &TransformerData,
    path: &TensorPath,
    row: usize,
    col: usize,
) -> Option<Breakdown> {
    match *path {
        TensorPath::EncoderInput => {
            let emb = data.input_embeddings.get(row)?.get(col).copied()?;
            let pos = data.pos_encodings.get(row)?.get(col).copied()?;
            let label = format!("inputEmbeddings[{row},{col}] + posEncodings[{row},{col}]");
            Some(Breakdown::new(
                OpKind::Add,
                "Embedding plus position",
                vec![scalar_step(label, emb, "+", pos, round2(emb + pos))],
            ))
        }
        TensorPath::InputEmbeddings | TensorPath::PosEncodings => None,
        TensorPath::Layer { layer, tensor } => match tensor {
            LayerTensor::Head { head, matrix } => {
                head_breakdown(data, layer, head, matrix, row, col)
            }
            LayerTensor::MhaOutput => {
                let lhs = TensorPath::Layer {
                    layer,
                    tensor: LayerTensor::ConcatOutput,
                };
                let rhs = TensorPath::Layer {
                    layer,
                    tensor: LayerTensor::Wo,
                };
                let steps = matmul_steps(data, lhs, rhs, None, row, col)?;
                Some(Breakdown::new(OpKind::MatMul, "Output projection", steps))
            }
            LayerTensor::AddNorm {
                slot,
                part: AddNormPart::Out,
            } => add_norm_breakdown(data, layer, slot, row, col),
            LayerTensor::Ffn(t) => ffn_breakdown(data, layer, t, row, col),
            LayerTensor::AddNorm { .. } | LayerTensor::ConcatOutput | LayerTensor::Wo => None,
        },
    }
}

/// Explain how the selected cell was computed.
///
/// Leaves and unresolvable selections come back as [`OpKind::Info`] with
/// no steps.
pub fn explain(data: &TransformerData, target: &ElementIdentifier) -> Calculation {
    let value = data.cell(target);
    let found = value
        .and(target.path())
        .and_then(|path| breakdown(data, &path, target.row, target.col));
    let Breakdown { op, title, steps } =
        found.unwrap_or_else(|| Breakdown::new(OpKind::Info, &target.name, Vec::new()));

    Calculation {
        target: target.clone(),
        op,
        title,
        value,
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dimensions;
    use crate::forward::build_with_rng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn snapshot() -> TransformerData {
        build_with_rng(&Dimensions::default(), &mut StdRng::seed_from_u64(5)).unwrap()
    }

    fn last_result(c: &Calculation) -> f64 {
        c.steps.last().map(|s| s.result).unwrap()
    }

    #[test]
    fn test_breakdown_ops() {
        let data = snapshot();
        for (name, op) in [
            ("encoderInput", OpKind::Add),
            ("encoder.0.mha.h0.Q", OpKind::MatMul),
            ("encoder.0.mha.h1.Scores", OpKind::MatMul),
            ("encoder.0.mha.h1.ScaledScores", OpKind::Scale),
            ("encoder.0.mha.h0.AttentionWeights", OpKind::Softmax),
            ("encoder.0.mha.h0.HeadOutput", OpKind::MatMul),
            ("encoder.0.mha.Output", OpKind::MatMul),
            ("encoder.0.add_norm_1_out", OpKind::LayerNorm),
            ("encoder.0.ffn.Intermediate", OpKind::MatMul),
            ("encoder.0.ffn.Activated", OpKind::Relu),
            ("encoder.0.ffn.Output", OpKind::MatMul),
            ("encoder.0.add_norm_2.out", OpKind::LayerNorm),
        ] {
            let calc = explain(&data, &ElementIdentifier::new(name, 1, 2));
            assert_eq!(calc.op, op, "{name}");
            assert_eq!(Some(last_result(&calc)), calc.value, "{name}");
        }
    }

    #[test]
    fn test_every_breakdown_matches_stored_cell() {
        let dims = Dimensions::new(16, 4, 5, 2);
        for seed in 0..4 {
            let data = build_with_rng(&dims, &mut StdRng::seed_from_u64(seed)).unwrap();
            for path in data.paths() {
                let (rows, cols) = data.lookup(&path).unwrap().shape();
                for row in 0..rows {
                    for col in 0..cols {
                        let calc = explain(&data, &path.at(row, col));
                        if let Some(step) = calc.steps.last() {
                            assert_eq!(
                                Some(step.result),
                                calc.value,
                                "seed {seed}: {}",
                                calc.target
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_scores_operands() {
        let data = snapshot();
        let calc = explain(&data, &ElementIdentifier::new("encoder.0.mha.h0.Scores", 2, 0));
        let head = &data.encoder_layers[0].mha.heads[0];
        assert_eq!(calc.steps.len(), 1);
        assert_eq!(calc.steps[0].a, head.q[2]);
        assert_eq!(calc.steps[0].b, head.k[0]);
    }

    #[test]
    fn test_bias_step() {
        let data = snapshot();
        let calc = explain(&data, &ElementIdentifier::new("encoder.0.ffn.Output", 0, 1));
        assert_eq!(calc.steps.len(), 2);
        assert_eq!(calc.steps[1].op, "+");
        assert_eq!(calc.steps[1].b, vec![data.encoder_layers[0].ffn.b2[1]]);
    }

    #[test]
    fn test_leaves_and_unknowns_are_info() {
        let data = snapshot();
        let weight = explain(&data, &ElementIdentifier::new("encoder.0.mha.h0.Wq", 0, 0));
        assert_eq!(weight.op, OpKind::Info);
        assert!(weight.steps.is_empty());
        assert_eq!(weight.value, Some(data.encoder_layers[0].mha.heads[0].wq[0][0]));

        let missing = explain(&data, &ElementIdentifier::new("encoder.3.ffn.Output", 0, 0));
        assert_eq!(missing.op, OpKind::Info);
        assert_eq!(missing.value, None);

        let outside = explain(&data, &ElementIdentifier::new("encoder.0.mha.h0.Q", 0, 99));
        assert_eq!(outside.op, OpKind::Info);
    }
}
