//! Selection bounds: the rectangle drawn around selected or hovered layers.
//!
//! Callers resolve which layers count as "selected" with the precedence
//! implemented by [`selection_bounds`]: the local user's active selection
//! wins; if it is empty, the single hovered layer is used; otherwise no
//! bounds are shown.

#[cfg(test)]
#[path = "bounds_test.rs"]
mod bounds_test;

use std::collections::BTreeSet;

pub use crate::layer::Rect;
use crate::layer::{Layer, LayerId};

/// Minimal axis-aligned rectangle covering every layer. `None` for no layers.
pub fn bounding_box<'a>(layers: impl IntoIterator<Item = &'a Layer>) -> Option<Rect> {
    layers
        .into_iter()
        .map(Layer::bounds)
        .reduce(|acc, next| acc.union(&next))
}

/// Bounds for the local selection, falling back to the hovered layer.
///
/// `lookup` resolves ids against the replica; ids that no longer resolve
/// (removed by a peer) are skipped.
pub fn selection_bounds<'a, F>(lookup: F, active: &BTreeSet<LayerId>, hovered: Option<&LayerId>) -> Option<Rect>
where
    F: Fn(&LayerId) -> Option<&'a Layer>,
{
    let selected: Vec<&Layer> = active.iter().filter_map(&lookup).collect();
    if !selected.is_empty() {
        return bounding_box(selected);
    }
    hovered.and_then(&lookup).map(Layer::bounds)
}
