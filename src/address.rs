//! Dotted-path addressing into a forward-pass snapshot
//!
//! Every matrix in a [`TransformerData`] has a stable name such as
//! `encoder.0.mha.h1.Scores` or `encoder.2.add_norm_1_out`. Names are parsed
//! into a closed [`TensorPath`] variant and resolved by lookup, so consumers
//! never hold references into the snapshot's object graph.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::forward::{AddNormData, EncoderLayerData, TransformerData};
use crate::tensor::{Matrix, Vector};

/// Prefix segment of every per-layer path
pub const ENCODER_MARKER: &str = "encoder";

/// A single cell of a named matrix
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementIdentifier {
    /// Dotted path, e.g. `encoder.0.mha.h0.Q`
    pub name: String,
    pub row: usize,
    pub col: usize,
}

impl ElementIdentifier {
    pub fn new(name: impl Into<String>, row: usize, col: usize) -> Self {
        Self {
            name: name.into(),
            row,
            col,
        }
    }

    /// Parse the name; `None` if it does not follow the path grammar
    pub fn path(&self) -> Option<TensorPath> {
        self.name.parse().ok()
    }
}

impl fmt::Display for ElementIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{},{}]", self.name, self.row, self.col)
    }
}

/// Matrices owned by one attention head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadMatrix {
    Wq,
    Wk,
    Wv,
    Q,
    K,
    V,
    Scores,
    ScaledScores,
    AttentionWeights,
    HeadOutput,
}

impl HeadMatrix {
    pub const ALL: [HeadMatrix; 10] = [
        HeadMatrix::Wq,
        HeadMatrix::Wk,
        HeadMatrix::Wv,
        HeadMatrix::Q,
        HeadMatrix::K,
        HeadMatrix::V,
        HeadMatrix::Scores,
        HeadMatrix::ScaledScores,
        HeadMatrix::AttentionWeights,
        HeadMatrix::HeadOutput,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HeadMatrix::Wq => "Wq",
            HeadMatrix::Wk => "Wk",
            HeadMatrix::Wv => "Wv",
            HeadMatrix::Q => "Q",
            HeadMatrix::K => "K",
            HeadMatrix::V => "V",
            HeadMatrix::Scores => "Scores",
            HeadMatrix::ScaledScores => "ScaledScores",
            HeadMatrix::AttentionWeights => "AttentionWeights",
            HeadMatrix::HeadOutput => "HeadOutput",
        }
    }

    /// Projection weight that produces this matrix, for `Q`, `K` and `V`
    pub fn projection_weight(self) -> Option<HeadMatrix> {
        match self {
            HeadMatrix::Q => Some(HeadMatrix::Wq),
            HeadMatrix::K => Some(HeadMatrix::Wk),
            HeadMatrix::V => Some(HeadMatrix::Wv),
            _ => None,
        }
    }
}

/// Tensors owned by the feed-forward sublayer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfnTensor {
    W1,
    B1,
    Intermediate,
    Activated,
    W2,
    B2,
    Output,
}

impl FfnTensor {
    pub const ALL: [FfnTensor; 7] = [
        FfnTensor::W1,
        FfnTensor::B1,
        FfnTensor::Intermediate,
        FfnTensor::Activated,
        FfnTensor::W2,
        FfnTensor::B2,
        FfnTensor::Output,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FfnTensor::W1 => "W1",
            FfnTensor::B1 => "b1",
            FfnTensor::Intermediate => "Intermediate",
            FfnTensor::Activated => "Activated",
            FfnTensor::W2 => "W2",
            FfnTensor::B2 => "b2",
            FfnTensor::Output => "Output",
        }
    }
}

/// Which of the two Add & Norm blocks in a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddNormSlot {
    /// After multi-head attention
    First,
    /// After the feed-forward sublayer
    Second,
}

impl AddNormSlot {
    pub fn number(self) -> usize {
        match self {
            AddNormSlot::First => 1,
            AddNormSlot::Second => 2,
        }
    }

    fn from_number(n: &str) -> Option<Self> {
        match n {
            "1" => Some(AddNormSlot::First),
            "2" => Some(AddNormSlot::Second),
            _ => None,
        }
    }
}

/// The three matrices of an Add & Norm block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddNormPart {
    InResidual,
    InSublayer,
    Out,
}

impl AddNormPart {
    pub fn name(self) -> &'static str {
        match self {
            AddNormPart::InResidual => "in_residual",
            AddNormPart::InSublayer => "in_sublayer",
            AddNormPart::Out => "out",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        match s {
            "in_residual" => Some(AddNormPart::InResidual),
            "in_sublayer" => Some(AddNormPart::InSublayer),
            "out" => Some(AddNormPart::Out),
            _ => None,
        }
    }
}

/// A tensor inside one encoder layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerTensor {
    Head { head: usize, matrix: HeadMatrix },
    ConcatOutput,
    Wo,
    MhaOutput,
    AddNorm { slot: AddNormSlot, part: AddNormPart },
    Ffn(FfnTensor),
}

impl LayerTensor {
    fn parse(parts: &[&str]) -> Result<Self> {
        match parts {
            ["mha", "Wo"] => Ok(LayerTensor::Wo),
            ["mha", "Output"] => Ok(LayerTensor::MhaOutput),
            ["mha", "ConcatOutput"] => Ok(LayerTensor::ConcatOutput),
            ["mha", head, matrix] => {
                let head = head
                    .strip_prefix('h')
                    .and_then(|n| n.parse().ok())
                    .with_context(|| format!("bad head segment '{head}'"))?;
                let matrix = HeadMatrix::ALL
                    .into_iter()
                    .find(|m| m.name() == *matrix)
                    .with_context(|| format!("unknown head matrix '{matrix}'"))?;
                Ok(LayerTensor::Head { head, matrix })
            }
            ["ffn", name] => FfnTensor::ALL
                .into_iter()
                .find(|t| t.name() == *name)
                .map(LayerTensor::Ffn)
                .with_context(|| format!("unknown ffn tensor '{name}'")),
            [component, part] => {
                let slot = component
                    .strip_prefix("add_norm_")
                    .and_then(AddNormSlot::from_number)
                    .with_context(|| format!("unknown component '{component}'"))?;
                let part = AddNormPart::from_name(part)
                    .with_context(|| format!("unknown add & norm part '{part}'"))?;
                Ok(LayerTensor::AddNorm { slot, part })
            }
            // add_norm_1_in_residual, the spelling used for rendering
            [joined] => {
                let (slot, part) = joined
                    .strip_prefix("add_norm_")
                    .and_then(|rest| rest.split_once('_'))
                    .and_then(|(n, p)| {
                        Some((AddNormSlot::from_number(n)?, AddNormPart::from_name(p)?))
                    })
                    .with_context(|| format!("unknown component '{joined}'"))?;
                Ok(LayerTensor::AddNorm { slot, part })
            }
            _ => anyhow::bail!("unrecognized layer path '{}'", parts.join(".")),
        }
    }
}

/// Address of any tensor in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorPath {
    InputEmbeddings,
    PosEncodings,
    EncoderInput,
    Layer { layer: usize, tensor: LayerTensor },
}

impl TensorPath {
    pub fn head(layer: usize, head: usize, matrix: HeadMatrix) -> Self {
        TensorPath::Layer {
            layer,
            tensor: LayerTensor::Head { head, matrix },
        }
    }

    pub fn add_norm(layer: usize, slot: AddNormSlot, part: AddNormPart) -> Self {
        TensorPath::Layer {
            layer,
            tensor: LayerTensor::AddNorm { slot, part },
        }
    }

    pub fn ffn(layer: usize, tensor: FfnTensor) -> Self {
        TensorPath::Layer {
            layer,
            tensor: LayerTensor::Ffn(tensor),
        }
    }

    /// Build a cell identifier on this path
    pub fn at(&self, row: usize, col: usize) -> ElementIdentifier {
        ElementIdentifier::new(self.to_string(), row, col)
    }
}

impl FromStr for TensorPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            ["inputEmbeddings"] => Ok(TensorPath::InputEmbeddings),
            ["posEncodings"] => Ok(TensorPath::PosEncodings),
            ["encoderInput"] => Ok(TensorPath::EncoderInput),
            [ENCODER_MARKER, layer, rest @ ..] => {
                let layer = layer
                    .parse()
                    .with_context(|| format!("bad layer index '{layer}' in '{s}'"))?;
                let tensor = LayerTensor::parse(rest).with_context(|| format!("in '{s}'"))?;
                Ok(TensorPath::Layer { layer, tensor })
            }
            _ => anyhow::bail!("unrecognized tensor path '{s}'"),
        }
    }
}

impl fmt::Display for TensorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (layer, tensor) = match self {
            TensorPath::InputEmbeddings => return f.write_str("inputEmbeddings"),
            TensorPath::PosEncodings => return f.write_str("posEncodings"),
            TensorPath::EncoderInput => return f.write_str("encoderInput"),
            TensorPath::Layer { layer, tensor } => (layer, tensor),
        };
        write!(f, "{ENCODER_MARKER}.{layer}.")?;
        match tensor {
            LayerTensor::Head { head, matrix } => write!(f, "mha.h{head}.{}", matrix.name()),
            LayerTensor::ConcatOutput => f.write_str("mha.ConcatOutput"),
            LayerTensor::Wo => f.write_str("mha.Wo"),
            LayerTensor::MhaOutput => f.write_str("mha.Output"),
            LayerTensor::AddNorm { slot, part } => {
                write!(f, "add_norm_{}_{}", slot.number(), part.name())
            }
            LayerTensor::Ffn(t) => write!(f, "ffn.{}", t.name()),
        }
    }
}

/// Borrowed view of an addressed tensor
#[derive(Debug, Clone, Copy)]
pub enum TensorRef<'a> {
    Matrix(&'a Matrix),
    /// Bias vectors, addressed as a single row
    Vector(&'a Vector),
}

impl TensorRef<'_> {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            TensorRef::Matrix(m) => crate::tensor::shape(m),
            TensorRef::Vector(v) => (1, v.len()),
        }
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        match self {
            TensorRef::Matrix(m) => m.get(row)?.get(col).copied(),
            TensorRef::Vector(v) if row == 0 => v.get(col).copied(),
            TensorRef::Vector(_) => None,
        }
    }

    /// The whole of `row`
    pub fn row(&self, row: usize) -> Option<Vector> {
        match self {
            TensorRef::Matrix(m) => m.get(row).cloned(),
            TensorRef::Vector(v) if row == 0 => Some(v.to_vec()),
            TensorRef::Vector(_) => None,
        }
    }

    /// The whole of `col`
    pub fn column(&self, col: usize) -> Option<Vector> {
        match self {
            TensorRef::Matrix(m) => crate::tensor::column(m, col),
            TensorRef::Vector(v) => v.get(col).map(|&x| vec![x]),
        }
    }
}

fn add_norm_part(block: &AddNormData, part: AddNormPart) -> &Matrix {
    match part {
        AddNormPart::InResidual => &block.in_residual,
        AddNormPart::InSublayer => &block.in_sublayer,
        AddNormPart::Out => &block.out,
    }
}

fn layer_tensor(layer: &EncoderLayerData, tensor: LayerTensor) -> Option<TensorRef<'_>> {
    let m = match tensor {
        LayerTensor::Head { head, matrix } => {
            let h = layer.mha.heads.get(head)?;
            match matrix {
                HeadMatrix::Wq => &h.wq,
                HeadMatrix::Wk => &h.wk,
                HeadMatrix::Wv => &h.wv,
                HeadMatrix::Q => &h.q,
                HeadMatrix::K => &h.k,
                HeadMatrix::V => &h.v,
                HeadMatrix::Scores => &h.scores,
                HeadMatrix::ScaledScores => &h.scaled_scores,
                HeadMatrix::AttentionWeights => &h.attention_weights,
                HeadMatrix::HeadOutput => &h.head_output,
            }
        }
        LayerTensor::ConcatOutput => &layer.mha.concat_output,
        LayerTensor::Wo => &layer.mha.wo,
        LayerTensor::MhaOutput => &layer.mha.output,
        LayerTensor::AddNorm { slot, part } => {
            let block = match slot {
                AddNormSlot::First => &layer.add_norm_1,
                AddNormSlot::Second => &layer.add_norm_2,
            };
            add_norm_part(block, part)
        }
        LayerTensor::Ffn(FfnTensor::B1) => return Some(TensorRef::Vector(&layer.ffn.b1)),
        LayerTensor::Ffn(FfnTensor::B2) => return Some(TensorRef::Vector(&layer.ffn.b2)),
        LayerTensor::Ffn(FfnTensor::W1) => &layer.ffn.w1,
        LayerTensor::Ffn(FfnTensor::Intermediate) => &layer.ffn.intermediate,
        LayerTensor::Ffn(FfnTensor::Activated) => &layer.ffn.activated,
        LayerTensor::Ffn(FfnTensor::W2) => &layer.ffn.w2,
        LayerTensor::Ffn(FfnTensor::Output) => &layer.ffn.output,
    };
    Some(TensorRef::Matrix(m))
}

impl TransformerData {
    /// Resolve a path; `None` when a layer or head index is out of range
    pub fn lookup(&self, path: &TensorPath) -> Option<TensorRef<'_>> {
        match path {
            TensorPath::InputEmbeddings => Some(TensorRef::Matrix(&self.input_embeddings)),
            TensorPath::PosEncodings => Some(TensorRef::Matrix(&self.pos_encodings)),
            TensorPath::EncoderInput => Some(TensorRef::Matrix(&self.encoder_input)),
            TensorPath::Layer { layer, tensor } => layer_tensor(self.layer(*layer)?, *tensor),
        }
    }

    /// Resolve a dotted name
    pub fn tensor(&self, name: &str) -> Option<TensorRef<'_>> {
        self.lookup(&name.parse().ok()?)
    }

    /// Value of a single cell
    pub fn cell(&self, id: &ElementIdentifier) -> Option<f64> {
        self.tensor(&id.name)?.get(id.row, id.col)
    }

    /// Every addressable path in this snapshot, in forward order
    pub fn paths(&self) -> Vec<TensorPath> {
        let mut paths = vec![
            TensorPath::InputEmbeddings,
            TensorPath::PosEncodings,
            TensorPath::EncoderInput,
        ];
        for (layer, data) in self.encoder_layers.iter().enumerate() {
            for head in 0..data.mha.heads.len() {
                paths.extend(
                    HeadMatrix::ALL
                        .into_iter()
                        .map(|matrix| TensorPath::head(layer, head, matrix)),
                );
            }
            for tensor in [LayerTensor::ConcatOutput, LayerTensor::Wo, LayerTensor::MhaOutput] {
                paths.push(TensorPath::Layer { layer, tensor });
            }
            let parts = [AddNormPart::InResidual, AddNormPart::InSublayer, AddNormPart::Out];
            paths.extend(
                parts
                    .into_iter()
                    .map(|part| TensorPath::add_norm(layer, AddNormSlot::First, part)),
            );
            paths.extend(FfnTensor::ALL.into_iter().map(|t| TensorPath::ffn(layer, t)));
            paths.extend(
                parts
                    .into_iter()
                    .map(|part| TensorPath::add_norm(layer, AddNormSlot::Second, part)),
            );
        }
        paths
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
        build_with_rng(&Dimensions::default(), &mut StdRng::seed_from_u64(3)).unwrap()
    }

    #[test]
    fn test_parse_head_path() {
        let path: TensorPath = "encoder.0.mha.h1.Scores".parse().unwrap();
        assert_eq!(path, TensorPath::head(0, 1, HeadMatrix::Scores));
        assert_eq!(path.to_string(), "encoder.0.mha.h1.Scores");
    }

    #[test]
    fn test_both_add_norm_spellings() {
        let dotted: TensorPath = "encoder.2.add_norm_1.out".parse().unwrap();
        let joined: TensorPath = "encoder.2.add_norm_1_out".parse().unwrap();
        assert_eq!(dotted, joined);
        assert_eq!(
            dotted,
            TensorPath::add_norm(2, AddNormSlot::First, AddNormPart::Out)
        );
        assert_eq!(dotted.to_string(), "encoder.2.add_norm_1_out");

        let residual: TensorPath = "encoder.0.add_norm_2_in_residual".parse().unwrap();
        assert_eq!(
            residual,
            TensorPath::add_norm(0, AddNormSlot::Second, AddNormPart::InResidual)
        );
    }

    #[test]
    fn test_parse_rejects_unknown() {
        for bad in [
            "",
            "decoder.0.mha.h0.Q",
            "encoder.x.mha.h0.Q",
            "encoder.0.mha.hx.Q",
            "encoder.0.mha.h0.Z",
            "encoder.0.attn.out",
            "encoder.0.add_norm_3.out",
            "encoder.0.add_norm_1_sum",
            "encoder.0.ffn.W3",
            "encoder.0",
        ] {
            assert!(bad.parse::<TensorPath>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_display_round_trips_every_snapshot_path() {
        let data = snapshot();
        for path in data.paths() {
            let reparsed: TensorPath = path.to_string().parse().unwrap();
            assert_eq!(reparsed, path);
            assert!(data.lookup(&path).is_some(), "{path} not resolvable");
        }
    }

    #[test]
    fn test_lookup_and_cell() {
        let data = snapshot();
        let head = &data.encoder_layers[0].mha.heads[1];
        let id = ElementIdentifier::new("encoder.0.mha.h1.Q", 2, 3);
        assert_eq!(data.cell(&id), Some(head.q[2][3]));

        let b1 = ElementIdentifier::new("encoder.0.ffn.b1", 0, 5);
        assert_eq!(data.cell(&b1), Some(data.encoder_layers[0].ffn.b1[5]));
        assert_eq!(data.cell(&ElementIdentifier::new("encoder.0.ffn.b1", 1, 5)), None);

        assert_eq!(
            data.tensor("encoder.0.add_norm_1.in_sublayer").map(|t| t.shape()),
            Some((3, 8))
        );
    }

    #[test]
    fn test_out_of_range_lookups() {
        let data = snapshot();
        assert!(data.tensor("encoder.1.mha.Wo").is_none());
        assert!(data.tensor("encoder.0.mha.h2.Q").is_none());
        assert!(data.cell(&ElementIdentifier::new("encoder.0.mha.h0.Q", 3, 0)).is_none());
        assert!(data.cell(&ElementIdentifier::new("encoder.0.mha.h0.Q", 0, 4)).is_none());
    }

    #[test]
    fn test_tensor_ref_row_and_column() {
        let data = snapshot();
        let wo = data.tensor("encoder.0.mha.Wo").unwrap();
        assert_eq!(wo.row(0).map(|r| r.len()), Some(8));
        assert_eq!(wo.column(7).map(|c| c.len()), Some(8));
        assert!(wo.column(8).is_none());
    }
}
