// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64 intentional in ML
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // HighlightState in provenance.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::trivially_copy_pass_by_ref)] // &Dimensions for API consistency

//! encoder-trace: a single-encoder Transformer you can click through
//!
//! Runs a toy encoder forward pass, keeps every intermediate matrix, and
//! answers "which inputs produced this cell?" for any cell.
//!
//! ## Architecture
//!
//! - `config`: Encoder dimensions and their validation
//! - `tensor`: Rounded tensor primitives on candle (matmul, softmax, norm, ...)
//! - `positional`: Sinusoidal positional encodings
//! - `forward`: Forward pass builder producing an immutable snapshot
//! - `address`: Dotted-path names for every matrix in a snapshot
//! - `provenance`: Backward tracing of a selected cell to its sources
//! - `explain`: Step-by-step recomputation of a selected cell
//! - `session`: Current dimensions, cached snapshot and highlight

pub mod address;
pub mod config;
pub mod explain;
pub mod forward;
pub mod positional;
pub mod provenance;
pub mod session;
pub mod tensor;

pub use address::{
    AddNormPart, AddNormSlot, ElementIdentifier, FfnTensor, HeadMatrix, LayerTensor, TensorPath,
    TensorRef,
};
pub use config::Dimensions;
pub use explain::{explain, Calculation, CalculationStep, OpKind};
pub use forward::{
    build, build_snapshot, build_with_rng, AddNormData, AttentionHeadData, EncoderLayerData,
    FFNData, MultiHeadAttentionData, TransformerData,
};
pub use positional::sinusoidal_encodings;
pub use provenance::{resolve, CellRole, HighlightSource, HighlightState};
pub use session::Session;
pub use tensor::{Matrix, Vector};
