//! Encoder dimensions
//!
//! The only configuration the engine consumes. Values arrive from the UI
//! (or the CLI) and are validated before any forward pass is built.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Ratio between the feed-forward width and `d_model` kept by the UI
pub const UI_FFN_RATIO: usize = 4;

/// Dimensions of the toy encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "DimensionsFile")]
pub struct Dimensions {
    /// Hidden width of every token representation
    pub d_model: usize,
    /// Number of attention heads
    pub h: usize,
    /// Number of token positions
    pub seq_len: usize,
    /// Number of stacked encoder layers
    pub n_layers: usize,
    /// Hidden width of the feed-forward sublayer
    pub d_ff: usize,
}

/// On-disk form of [`Dimensions`]; `d_ff` may be left out
#[derive(Deserialize)]
struct DimensionsFile {
    d_model: usize,
    h: usize,
    seq_len: usize,
    n_layers: usize,
    #[serde(default)]
    d_ff: Option<usize>,
}

impl From<DimensionsFile> for Dimensions {
    fn from(file: DimensionsFile) -> Self {
        let dims = Self::new(file.d_model, file.h, file.seq_len, file.n_layers);
        match file.d_ff {
            Some(d_ff) => Self { d_ff, ..dims },
            None => dims,
        }
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            d_model: 8,
            h: 2,
            seq_len: 3,
            n_layers: 1,
            d_ff: 32,
        }
    }
}

impl Dimensions {
    /// Create dimensions with `d_ff` coupled to `d_model` the way the UI does
    pub fn new(d_model: usize, h: usize, seq_len: usize, n_layers: usize) -> Self {
        Self {
            d_model,
            h,
            seq_len,
            n_layers,
            d_ff: d_model * UI_FFN_RATIO,
        }
    }

    /// Re-derive `d_ff` from `d_model`
    pub fn with_ui_d_ff(mut self) -> Self {
        self.d_ff = self.d_model * UI_FFN_RATIO;
        self
    }

    /// Per-head key/query/value width
    ///
    /// Only meaningful after [`Dimensions::validate`] succeeds.
    pub fn d_k(&self) -> usize {
        if self.h == 0 {
            0
        } else {
            self.d_model / self.h
        }
    }

    /// Check the preconditions of the forward pass builder.
    ///
    /// The engine only needs positive sizes and `d_model % h == 0`; the UI
    /// ranges are checked separately by [`Dimensions::check_ui_ranges`].
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.h > 0, "h must be positive");
        anyhow::ensure!(self.d_model > 0, "d_model must be positive");
        anyhow::ensure!(self.seq_len > 0, "seq_len must be positive");
        anyhow::ensure!(self.n_layers > 0, "n_layers must be positive");
        anyhow::ensure!(self.d_ff > 0, "d_ff must be positive");
        anyhow::ensure!(
            self.d_model % self.h == 0,
            "d_model ({}) must be divisible by h ({})",
            self.d_model,
            self.h
        );
        Ok(())
    }

    /// Whether the builder may run for these dimensions
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Check the ranges enforced by the UI controls.
    pub fn check_ui_ranges(&self) -> Result<()> {
        anyhow::ensure!(
            (2..=16).contains(&self.d_model),
            "d_model {} outside UI range [2, 16]",
            self.d_model
        );
        anyhow::ensure!(
            (1..=self.d_model).contains(&self.h),
            "h {} outside UI range [1, {}]",
            self.h,
            self.d_model
        );
        anyhow::ensure!(
            (2..=5).contains(&self.seq_len),
            "seq_len {} outside UI range [2, 5]",
            self.seq_len
        );
        anyhow::ensure!(
            (1..=3).contains(&self.n_layers),
            "n_layers {} outside UI range [1, 3]",
            self.n_layers
        );
        anyhow::ensure!(
            self.d_ff == self.d_model * UI_FFN_RATIO,
            "d_ff {} is not {}·d_model",
            self.d_ff,
            UI_FFN_RATIO
        );
        Ok(())
    }

    /// Load dimensions from a JSON file.
    ///
    /// A missing `d_ff` is filled in as `4·d_model`.
    pub fn load(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
        Self::from_json(&content)
    }

    /// Parse dimensions from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("parsing dimensions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_start_up_values() {
        let dims = Dimensions::default();
        assert_eq!(dims.d_model, 8);
        assert_eq!(dims.h, 2);
        assert_eq!(dims.d_k(), 4);
        assert!(dims.validate().is_ok());
        assert!(dims.check_ui_ranges().is_ok());
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let dims = Dimensions::new(9, 2, 3, 1);
        let err = dims.validate().unwrap_err();
        assert!(err.to_string().contains("divisible"));
        assert!(!dims.is_valid());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(Dimensions::new(8, 0, 3, 1).validate().is_err());
        assert!(Dimensions::new(8, 2, 0, 1).validate().is_err());
        assert!(Dimensions::new(8, 2, 3, 0).validate().is_err());
        assert_eq!(Dimensions::new(8, 0, 3, 1).d_k(), 0);
    }

    #[test]
    fn test_ui_ranges_are_separate_from_engine() {
        // Engine accepts it, the UI would not offer it.
        let dims = Dimensions::new(32, 4, 10, 6);
        assert!(dims.validate().is_ok());
        assert!(dims.check_ui_ranges().is_err());
    }

    #[test]
    fn test_from_json_fills_d_ff() {
        let dims =
            Dimensions::from_json(r#"{"d_model": 6, "h": 3, "seq_len": 4, "n_layers": 2}"#)
                .unwrap();
        assert_eq!(dims.d_ff, 24);
        assert_eq!(dims.d_k(), 2);

        let explicit = Dimensions::from_json(
            r#"{"d_model": 6, "h": 3, "seq_len": 4, "n_layers": 2, "d_ff": 10}"#,
        )
        .unwrap();
        assert_eq!(explicit.d_ff, 10);
    }

    #[test]
    fn test_from_json_keeps_explicit_zero_d_ff() {
        let dims = Dimensions::from_json(
            r#"{"d_model": 8, "h": 2, "seq_len": 3, "n_layers": 1, "d_ff": 0}"#,
        )
        .unwrap();
        assert_eq!(dims.d_ff, 0);
        assert!(dims.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_d_ff() {
        let dims = Dimensions {
            d_ff: 7,
            ..Dimensions::default()
        };
        let json = serde_json::to_string(&dims).unwrap();
        assert_eq!(Dimensions::from_json(&json).unwrap(), dims);
    }
}
