//! Interactive session state
//!
//! One session holds the current dimensions, the snapshot built for them
//! and the highlight from the last selection. Exactly two transitions
//! mutate it: a dimension change (replaces the snapshot) and a selection
//! (replaces the highlight).

use std::sync::Arc;
use tracing::{debug, info};

use crate::address::ElementIdentifier;
use crate::config::Dimensions;
use crate::explain::{explain, Calculation};
use crate::forward::{build_snapshot, TransformerData};
use crate::provenance::{resolve, HighlightState};

/// Current dimensions, snapshot and highlight
#[derive(Debug)]
pub struct Session {
    dims: Dimensions,
    /// `None` when the dimensions were rejected or the build failed
    snapshot: Option<Arc<TransformerData>>,
    highlight: HighlightState,
}

impl Session {
    /// Start a session, building the snapshot for `dims`
    pub fn new(dims: Dimensions) -> Self {
        Self {
            dims,
            snapshot: build_snapshot(&dims).map(Arc::new),
            highlight: HighlightState::default(),
        }
    }

    /// Switch dimensions.
    ///
    /// Unchanged dimensions keep the cached snapshot and highlight; any
    /// change rebuilds with fresh weights and clears the highlight.
    /// Returns whether a rebuild happened.
    pub fn set_dimensions(&mut self, dims: Dimensions) -> bool {
        if dims == self.dims {
            debug!("Dimensions unchanged, keeping snapshot");
            return false;
        }
        info!("Dimensions changed: {:?} -> {:?}", self.dims, dims);
        self.dims = dims;
        self.snapshot = build_snapshot(&dims).map(Arc::new);
        self.highlight = HighlightState::default();
        true
    }

    /// Select a cell and trace its sources.
    ///
    /// Ignored (returns `None`) while there is no valid snapshot.
    pub fn select(&mut self, element: ElementIdentifier) -> Option<&HighlightState> {
        let snapshot = self.snapshot.as_ref()?;
        self.highlight = resolve(snapshot, &element);
        debug!(
            "Selected {} -> {} sources",
            element,
            self.highlight.sources.len()
        );
        Some(&self.highlight)
    }

    /// Breakdown of the currently selected cell
    pub fn explain_selection(&self) -> Option<Calculation> {
        let snapshot = self.snapshot.as_ref()?;
        let target = self.highlight.target.as_ref()?;
        Some(explain(snapshot, target))
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dims
    }

    /// Shared handle to the current snapshot
    pub fn snapshot(&self) -> Option<Arc<TransformerData>> {
        self.snapshot.clone()
    }

    pub fn highlight(&self) -> &HighlightState {
        &self.highlight
    }

    /// Whether a snapshot exists for the current dimensions
    pub fn is_valid(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Dimensions::default())
    }
}
