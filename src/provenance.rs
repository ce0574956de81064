//! Provenance resolution: which cells produced this one?
//!
//! Given a snapshot and a selected cell, returns the source cells that feed
//! it through one step of the forward pass. The tracing rule depends only on
//! the kind of matrix selected:
//!
//! | Target | Sources (per iteration) |
//! |---|---|
//! | `Q`, `K`, `V` | residual-input row, projection-weight column (× d_model) |
//! | `Scores` | `Q` row `row`, `K` row `col` (× d_k) |
//! | `HeadOutput` | `AttentionWeights` row, `V` column (× seq_len) |
//! | Add & Norm `out` | `in_residual` row, `in_sublayer` row |
//! | `ffn.Output` | first Add & Norm `out` row |
//!
//! Everything else is a leaf and yields no sources. Sources are returned in
//! generation order and are not de-duplicated.

use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use crate::address::{
    AddNormPart, AddNormSlot, ElementIdentifier, FfnTensor, HeadMatrix, LayerTensor, TensorPath,
};
use crate::config::Dimensions;
use crate::forward::TransformerData;

/// Number of leading path segments that name a component
const COMPONENT_SEGMENTS: usize = 3;

/// A cell (or whole row/column) that feeds the target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HighlightSource {
    #[serde(flatten)]
    pub element: ElementIdentifier,
    /// The entire row `element.row` is a source
    pub highlight_row: bool,
    /// The entire column `element.col` is a source
    pub highlight_col: bool,
}

impl HighlightSource {
    pub fn cell(path: &TensorPath, row: usize, col: usize) -> Self {
        Self {
            element: path.at(row, col),
            highlight_row: false,
            highlight_col: false,
        }
    }

    pub fn whole_row(path: &TensorPath, row: usize, col: usize) -> Self {
        Self {
            highlight_row: true,
            ..Self::cell(path, row, col)
        }
    }

    pub fn whole_col(path: &TensorPath, row: usize, col: usize) -> Self {
        Self {
            highlight_col: true,
            ..Self::cell(path, row, col)
        }
    }

    /// What the source covers, ignoring the unused coordinate of a
    /// whole-row or whole-column source
    fn extent(&self) -> (&str, Option<usize>, Option<usize>) {
        let name = self.element.name.as_str();
        match (self.highlight_row, self.highlight_col) {
            (true, true) => (name, None, None),
            (true, false) => (name, Some(self.element.row), None),
            (false, true) => (name, None, Some(self.element.col)),
            (false, false) => (name, Some(self.element.row), Some(self.element.col)),
        }
    }

    /// Whether this source covers `(name, row, col)`
    pub fn covers(&self, name: &str, row: usize, col: usize) -> bool {
        if !same_tensor(&self.element.name, name) {
            return false;
        }
        (self.highlight_row && self.element.row == row)
            || (self.highlight_col && self.element.col == col)
            || (self.element.row == row && self.element.col == col)
    }
}

/// Names refer to the same tensor, accepting either Add & Norm spelling
fn same_tensor(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (a.parse::<TensorPath>(), b.parse::<TensorPath>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

/// How a cell should be rendered under the current highlight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CellRole {
    Target,
    Source,
    None,
}

/// Result of one selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HighlightState {
    /// First three segments of the target path, e.g. `encoder.0.mha`
    pub active_component: Option<String>,
    pub target: Option<ElementIdentifier>,
    pub sources: Vec<HighlightSource>,
}

impl HighlightState {
    /// Role of `(name, row, col)`; the target wins over sources
    pub fn role_of(&self, name: &str, row: usize, col: usize) -> CellRole {
        if let Some(target) = &self.target {
            if target.row == row && target.col == col && same_tensor(&target.name, name) {
                return CellRole::Target;
            }
        }
        if self.sources.iter().any(|s| s.covers(name, row, col)) {
            CellRole::Source
        } else {
            CellRole::None
        }
    }

    /// Sources with repeats removed, keeping first occurrences in order.
    ///
    /// Whole-row (whole-column) sources on the same row (column) of the
    /// same matrix count once, whatever their other coordinate.
    pub fn distinct_sources(&self) -> Vec<&HighlightSource> {
        let mut seen = HashSet::new();
        self.sources
            .iter()
            .filter(|s| seen.insert(s.extent()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_none()
    }
}

/// Truncate a dotted path to its component prefix
pub fn active_component(name: &str) -> String {
    name.split('.')
        .take(COMPONENT_SEGMENTS)
        .collect::<Vec<_>>()
        .join(".")
}

/// Resolve the sources of a selected cell.
///
/// Never fails: an unparseable name, an out-of-range layer, head, row or
/// column, or a leaf matrix all produce an empty source list with the
/// target recorded.
pub fn resolve(data: &TransformerData, target: &ElementIdentifier) -> HighlightState {
    let sources = match target.path() {
        Some(path) if data.cell(target).is_some() => trace(data, &path, target.row, target.col),
        Some(_) => {
            debug!("Selection {} is outside the snapshot", target);
            Vec::new()
        }
        None => {
            debug!("Unparseable selection '{}'", target.name);
            Vec::new()
        }
    };

    HighlightState {
        active_component: Some(active_component(&target.name)),
        target: Some(target.clone()),
        sources,
    }
}

fn trace(
    data: &TransformerData,
    path: &TensorPath,
    row: usize,
    col: usize,
) -> Vec<HighlightSource> {
    let TensorPath::Layer { layer, tensor } = *path else {
        return Vec::new();
    };
    let Some(layer_data) = data.layer(layer) else {
        debug!("Selection {} is beyond layer {}", path, data.n_layers());
        return Vec::new();
    };
    let dims = &data.dims;

    match tensor {
        LayerTensor::Head { head, matrix } => {
            if head >= layer_data.mha.heads.len() {
                debug!("Selection {} is beyond head {}", path, layer_data.mha.heads.len());
                return Vec::new();
            }
            trace_head(dims, layer, head, matrix, row, col)
        }
        LayerTensor::AddNorm {
            slot,
            part: AddNormPart::Out,
        } => vec![
            HighlightSource::whole_row(
                &TensorPath::add_norm(layer, slot, AddNormPart::InResidual),
                row,
                col,
            ),
            HighlightSource::whole_row(
                &TensorPath::add_norm(layer, slot, AddNormPart::InSublayer),
                row,
                col,
            ),
        ],
        LayerTensor::Ffn(FfnTensor::Output) => vec![HighlightSource::whole_row(
            &TensorPath::add_norm(layer, AddNormSlot::First, AddNormPart::Out),
            row,
            col,
        )],
        LayerTensor::AddNorm { .. }
        | LayerTensor::Ffn(_)
        | LayerTensor::ConcatOutput
        | LayerTensor::Wo
        | LayerTensor::MhaOutput => Vec::new(),
    }
}

fn trace_head(
    dims: &Dimensions,
    layer: usize,
    head: usize,
    matrix: HeadMatrix,
    row: usize,
    col: usize,
) -> Vec<HighlightSource> {
    let at = |m: HeadMatrix| TensorPath::head(layer, head, m);

    match matrix {
        HeadMatrix::Q | HeadMatrix::K | HeadMatrix::V => {
            let Some(weight) = matrix.projection_weight() else {
                return Vec::new();
            };
            let residual = TensorPath::add_norm(layer, AddNormSlot::First, AddNormPart::InResidual);
            (0..dims.d_model)
                .flat_map(|i| {
                    [
                        HighlightSource::whole_row(&residual, row, i),
                        HighlightSource::whole_col(&at(weight), i, col),
                    ]
                })
                .collect()
        }
        HeadMatrix::Scores => (0..dims.d_k())
            .flat_map(|i| {
                [
                    HighlightSource::whole_row(&at(HeadMatrix::Q), row, i),
                    HighlightSource::whole_row(&at(HeadMatrix::K), col, i),
                ]
            })
            .collect(),
        HeadMatrix::HeadOutput => (0..dims.seq_len)
            .flat_map(|i| {
                [
                    HighlightSource::whole_row(&at(HeadMatrix::AttentionWeights), row, i),
                    HighlightSource::whole_col(&at(HeadMatrix::V), i, col),
                ]
            })
            .collect(),
        HeadMatrix::Wq
        | HeadMatrix::Wk
        | HeadMatrix::Wv
        | HeadMatrix::ScaledScores
        | HeadMatrix::AttentionWeights => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::build_with_rng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn snapshot() -> TransformerData {
        build_with_rng(&Dimensions::default(), &mut StdRng::seed_from_u64(11)).unwrap()
    }

    #[test]
    fn test_scores_sources() {
        let data = snapshot();
        let state = resolve(&data, &ElementIdentifier::new("encoder.0.mha.h0.Scores", 1, 0));
        assert_eq!(state.sources.len(), 8);

        let q: Vec<_> = state
            .sources
            .iter()
            .filter(|s| s.element.name == "encoder.0.mha.h0.Q")
            .collect();
        let k: Vec<_> = state
            .sources
            .iter()
            .filter(|s| s.element.name == "encoder.0.mha.h0.K")
            .collect();
        assert_eq!(q.len(), 4);
        assert_eq!(k.len(), 4);
        assert!(q.iter().all(|s| s.element.row == 1 && s.highlight_row));
        assert!(k.iter().all(|s| s.element.row == 0 && s.highlight_row));
        assert_eq!(state.distinct_sources().len(), 2);
    }

    #[test]
    fn test_add_norm_sources() {
        let data = snapshot();
        let state = resolve(&data, &ElementIdentifier::new("encoder.0.add_norm_1.out", 0, 3));
        assert_eq!(state.sources.len(), 2);
        assert_eq!(state.sources[0].element.name, "encoder.0.add_norm_1_in_residual");
        assert_eq!(state.sources[1].element.name, "encoder.0.add_norm_1_in_sublayer");
        for s in &state.sources {
            assert_eq!(s.element.row, 0);
            assert!(s.highlight_row);
            assert!(!s.highlight_col);
        }
        assert_eq!(state.active_component.as_deref(), Some("encoder.0.add_norm_1"));
    }

    #[test]
    fn test_qkv_sources() {
        let data = snapshot();
        let state = resolve(&data, &ElementIdentifier::new("encoder.0.mha.h1.V", 2, 3));
        assert_eq!(state.sources.len(), 2 * 8);
        let weights: Vec<_> = state
            .sources
            .iter()
            .filter(|s| s.element.name == "encoder.0.mha.h1.Wv")
            .collect();
        assert_eq!(weights.len(), 8);
        assert!(weights.iter().all(|s| s.element.col == 3 && s.highlight_col));
        let residual: Vec<_> = state
            .sources
            .iter()
            .filter(|s| s.element.name == "encoder.0.add_norm_1_in_residual")
            .collect();
        assert!(residual.iter().all(|s| s.element.row == 2 && s.highlight_row));
    }

    #[test]
    fn test_head_output_sources() {
        let data = snapshot();
        let state = resolve(&data, &ElementIdentifier::new("encoder.0.mha.h0.HeadOutput", 1, 2));
        assert_eq!(state.sources.len(), 2 * 3);
        assert!(state.role_of("encoder.0.mha.h0.AttentionWeights", 1, 0) == CellRole::Source);
        assert!(state.role_of("encoder.0.mha.h0.V", 0, 2) == CellRole::Source);
        assert!(state.role_of("encoder.0.mha.h0.V", 0, 1) == CellRole::None);
        assert!(state.role_of("encoder.0.mha.h0.HeadOutput", 1, 2) == CellRole::Target);
    }

    #[test]
    fn test_ffn_output_sources() {
        let data = snapshot();
        let state = resolve(&data, &ElementIdentifier::new("encoder.0.ffn.Output", 2, 5));
        assert_eq!(state.sources.len(), 1);
        assert_eq!(state.sources[0].element.name, "encoder.0.add_norm_1_out");
        assert!(state.sources[0].highlight_row);
        // Either spelling of the name matches when rendering.
        assert_eq!(state.role_of("encoder.0.add_norm_1.out", 2, 0), CellRole::Source);
    }

    #[test]
    fn test_leaves_have_no_sources() {
        let data = snapshot();
        for name in [
            "encoder.0.mha.h0.Wq",
            "encoder.0.mha.Wo",
            "encoder.0.mha.Output",
            "encoder.0.ffn.Intermediate",
            "encoder.0.ffn.Activated",
            "encoder.0.add_norm_2_in_sublayer",
            "encoderInput",
        ] {
            let id = ElementIdentifier::new(name, 0, 0);
            let state = resolve(&data, &id);
            assert!(state.sources.is_empty(), "{name} should be a leaf");
            assert_eq!(state.target, Some(id));
        }
    }

    #[test]
    fn test_unresolvable_selection() {
        let data = snapshot();
        for name in ["encoder.5.mha.h0.Q", "encoder.0.mha.h9.Scores", "encoder.0.attn.x", "bogus"] {
            let state = resolve(&data, &ElementIdentifier::new(name, 0, 0));
            assert!(state.sources.is_empty());
            assert!(state.target.is_some());
        }
    }

    #[test]
    fn test_out_of_range_cell_has_no_sources() {
        let data = snapshot();
        for (name, row, col) in [
            ("encoder.0.mha.h0.Scores", 7, 0),
            ("encoder.0.mha.h0.Scores", 0, 3),
            ("encoder.0.mha.h1.Q", 0, 4),
            ("encoder.0.add_norm_2.out", 3, 0),
            ("encoder.0.ffn.Output", 0, 8),
        ] {
            let id = ElementIdentifier::new(name, row, col);
            let state = resolve(&data, &id);
            assert!(state.sources.is_empty(), "{id}");
            assert_eq!(state.target, Some(id));
            assert_eq!(state.active_component.as_deref(), Some(active_component(name).as_str()));
        }
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let data = snapshot();
        let id = ElementIdentifier::new("encoder.0.mha.h1.Scores", 2, 1);
        assert_eq!(resolve(&data, &id), resolve(&data, &id));
    }

    #[test]
    fn test_active_component() {
        assert_eq!(active_component("encoder.0.mha.h0.Q"), "encoder.0.mha");
        assert_eq!(active_component("encoderInput"), "encoderInput");
        assert!(HighlightState::default().is_empty());
    }
}
