//! Layer entity model: drawable board elements, edges, and sparse patches.
//!
//! DESIGN
//! ======
//! A `Layer` is one of five closed variants. Box-shaped variants carry an
//! `x`/`y`/`width`/`height` frame; paths carry an origin plus points relative
//! to it. Every way of producing a `Layer`, deserialization included, runs
//! through `Layer::validate`, so a `Layer` value in memory always satisfies
//! the geometry invariants.
//!
//! Updates are expressed as `LayerPatch` values. Only present fields are
//! applied, and applying a patch yields the inverse patch holding the prior
//! value of exactly those fields. The layer `type` can never be patched.

#[cfg(test)]
#[path = "layer_test.rs"]
mod layer_test;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Board-scoped layer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(String);

impl LayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier for a newly drawn layer.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LayerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for LayerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Board-scoped edge identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(String);

impl EdgeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EdgeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// A malformed layer, edge, or local intent. Rejected locally; never
/// published and never recorded in history.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("layer id must not be empty")]
    EmptyId,
    #[error("{field} must be non-negative, got {value}")]
    NegativeDimension { field: &'static str, value: f64 },
    #[error("{field} must be a finite number")]
    NonFinite { field: &'static str },
    #[error("path layer requires at least one point")]
    EmptyPath,
    #[error("{field} does not apply to {kind} layers")]
    FieldNotApplicable { field: &'static str, kind: LayerKind },
    #[error("patch carries no changes")]
    EmptyPatch,
    #[error("layer already exists: {0}")]
    DuplicateLayer(LayerId),
    #[error("layer not found: {0}")]
    UnknownLayer(LayerId),
    #[error("edge already exists: {0}")]
    DuplicateEdge(EdgeId),
    #[error("edge not found: {0}")]
    UnknownEdge(EdgeId),
    #[error("edge {edge} references missing layer {layer}")]
    DanglingEdge { edge: EdgeId, layer: LayerId },
}

// =============================================================================
// GEOMETRY PRIMITIVES
// =============================================================================

/// A 2D point in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    #[must_use]
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    #[must_use]
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    #[must_use]
    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Smallest rectangle covering both `self` and `other`.
    #[must_use]
    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect { x, y, width: right - x, height: bottom - y }
    }
}

/// Fill color as an RGB triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Canonical lowercase `#rrggbb`.
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

// =============================================================================
// SHAPES
// =============================================================================

/// Variant tag of a layer. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Rectangle,
    Ellipse,
    Path,
    Note,
    Text,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rectangle => "rectangle",
            Self::Ellipse => "ellipse",
            Self::Path => "path",
            Self::Note => "note",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

/// Frame of a box-shaped layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxGeometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Freehand stroke: an origin plus points relative to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathGeometry {
    pub x: f64,
    pub y: f64,
    pub points: Vec<Point>,
}

/// Kind-specific geometry. Serialized inline with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Shape {
    Rectangle(BoxGeometry),
    Ellipse(BoxGeometry),
    Path(PathGeometry),
    Note(BoxGeometry),
    Text(BoxGeometry),
}

impl Shape {
    #[must_use]
    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Rectangle(_) => LayerKind::Rectangle,
            Self::Ellipse(_) => LayerKind::Ellipse,
            Self::Path(_) => LayerKind::Path,
            Self::Note(_) => LayerKind::Note,
            Self::Text(_) => LayerKind::Text,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Rectangle(frame) | Self::Ellipse(frame) | Self::Note(frame) | Self::Text(frame) => {
                finite("x", frame.x)?;
                finite("y", frame.y)?;
                dimension("width", frame.width)?;
                dimension("height", frame.height)
            }
            Self::Path(path) => {
                finite("x", path.x)?;
                finite("y", path.y)?;
                if path.points.is_empty() {
                    return Err(ValidationError::EmptyPath);
                }
                for point in &path.points {
                    finite("points", point.x)?;
                    finite("points", point.y)?;
                }
                Ok(())
            }
        }
    }

    fn bounds(&self) -> Rect {
        match self {
            Self::Rectangle(frame) | Self::Ellipse(frame) | Self::Note(frame) | Self::Text(frame) => {
                Rect::new(frame.x, frame.y, frame.width, frame.height)
            }
            Self::Path(path) => {
                let mut min = Point::new(f64::INFINITY, f64::INFINITY);
                let mut max = Point::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
                for p in &path.points {
                    min.x = min.x.min(p.x);
                    min.y = min.y.min(p.y);
                    max.x = max.x.max(p.x);
                    max.y = max.y.max(p.y);
                }
                if path.points.is_empty() {
                    return Rect::new(path.x, path.y, 0.0, 0.0);
                }
                Rect::new(path.x + min.x, path.y + min.y, max.x - min.x, max.y - min.y)
            }
        }
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() { Ok(()) } else { Err(ValidationError::NonFinite { field }) }
}

fn dimension(field: &'static str, value: f64) -> Result<(), ValidationError> {
    finite(field, value)?;
    if value < 0.0 {
        return Err(ValidationError::NegativeDimension { field, value });
    }
    Ok(())
}

// =============================================================================
// LAYER
// =============================================================================

/// A validated drawable element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LayerRepr")]
pub struct Layer {
    id: LayerId,
    #[serde(flatten)]
    shape: Shape,
    #[serde(skip_serializing_if = "Option::is_none")]
    fill: Option<Rgb>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

/// Unvalidated wire shape of a layer.
#[derive(Deserialize)]
struct LayerRepr {
    id: LayerId,
    #[serde(flatten)]
    shape: Shape,
    #[serde(default)]
    fill: Option<Rgb>,
    #[serde(default)]
    value: Option<String>,
}

impl TryFrom<LayerRepr> for Layer {
    type Error = ValidationError;

    fn try_from(repr: LayerRepr) -> Result<Self, Self::Error> {
        let layer = Layer { id: repr.id, shape: repr.shape, fill: repr.fill, value: repr.value };
        layer.validate()?;
        Ok(layer)
    }
}

impl Layer {
    /// Build a layer from arbitrary geometry, validating it.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the id is empty or the geometry is malformed.
    pub fn from_shape(id: impl Into<LayerId>, shape: Shape) -> Result<Self, ValidationError> {
        let layer = Layer { id: id.into(), shape, fill: None, value: None };
        layer.validate()?;
        Ok(layer)
    }

    /// # Errors
    ///
    /// Rejects negative or non-finite dimensions.
    pub fn rectangle(id: impl Into<LayerId>, x: f64, y: f64, width: f64, height: f64) -> Result<Self, ValidationError> {
        Self::from_shape(id, Shape::Rectangle(BoxGeometry { x, y, width, height }))
    }

    /// # Errors
    ///
    /// Rejects negative or non-finite dimensions.
    pub fn ellipse(id: impl Into<LayerId>, x: f64, y: f64, width: f64, height: f64) -> Result<Self, ValidationError> {
        Self::from_shape(id, Shape::Ellipse(BoxGeometry { x, y, width, height }))
    }

    /// # Errors
    ///
    /// Rejects negative or non-finite dimensions.
    pub fn note(id: impl Into<LayerId>, x: f64, y: f64, width: f64, height: f64) -> Result<Self, ValidationError> {
        Self::from_shape(id, Shape::Note(BoxGeometry { x, y, width, height }))
    }

    /// # Errors
    ///
    /// Rejects negative or non-finite dimensions.
    pub fn text(id: impl Into<LayerId>, x: f64, y: f64, width: f64, height: f64) -> Result<Self, ValidationError> {
        Self::from_shape(id, Shape::Text(BoxGeometry { x, y, width, height }))
    }

    /// Freehand path with `points` relative to `(x, y)`.
    ///
    /// # Errors
    ///
    /// Rejects an empty point sequence or non-finite coordinates.
    pub fn path(id: impl Into<LayerId>, x: f64, y: f64, points: Vec<Point>) -> Result<Self, ValidationError> {
        Self::from_shape(id, Shape::Path(PathGeometry { x, y, points }))
    }

    #[must_use]
    pub fn with_fill(mut self, fill: Rgb) -> Self {
        self.fill = Some(fill);
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> &LayerId {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> LayerKind {
        self.shape.kind()
    }

    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[must_use]
    pub fn fill(&self) -> Option<Rgb> {
        self.fill
    }

    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// World-space extent. For paths this is the extent of the points.
    #[must_use]
    pub fn bounds(&self) -> Rect {
        self.shape.bounds()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.id.as_str().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        self.shape.validate()
    }

    /// Apply a shallow patch, returning the patched layer and the inverse patch.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyPatch`] for a patch with no fields,
    /// [`ValidationError::FieldNotApplicable`] when the patch touches geometry
    /// this variant does not have, and any geometry error of the result.
    pub fn patched(&self, patch: &LayerPatch) -> Result<(Layer, LayerPatch), ValidationError> {
        if patch.is_empty() {
            return Err(ValidationError::EmptyPatch);
        }

        let kind = self.kind();
        let mut next = self.clone();
        let mut inverse = LayerPatch::default();

        match &mut next.shape {
            Shape::Path(path) => {
                if patch.width.is_some() {
                    return Err(ValidationError::FieldNotApplicable { field: "width", kind });
                }
                if patch.height.is_some() {
                    return Err(ValidationError::FieldNotApplicable { field: "height", kind });
                }
                if let Some(x) = patch.x {
                    inverse.x = Some(std::mem::replace(&mut path.x, x));
                }
                if let Some(y) = patch.y {
                    inverse.y = Some(std::mem::replace(&mut path.y, y));
                }
                if let Some(points) = &patch.points {
                    inverse.points = Some(std::mem::replace(&mut path.points, points.clone()));
                }
            }
            Shape::Rectangle(frame) | Shape::Ellipse(frame) | Shape::Note(frame) | Shape::Text(frame) => {
                if patch.points.is_some() {
                    return Err(ValidationError::FieldNotApplicable { field: "points", kind });
                }
                if let Some(x) = patch.x {
                    inverse.x = Some(std::mem::replace(&mut frame.x, x));
                }
                if let Some(y) = patch.y {
                    inverse.y = Some(std::mem::replace(&mut frame.y, y));
                }
                if let Some(width) = patch.width {
                    inverse.width = Some(std::mem::replace(&mut frame.width, width));
                }
                if let Some(height) = patch.height {
                    inverse.height = Some(std::mem::replace(&mut frame.height, height));
                }
            }
        }

        if let Some(fill) = patch.fill {
            inverse.fill = Some(std::mem::replace(&mut next.fill, fill));
        }
        if let Some(value) = &patch.value {
            inverse.value = Some(std::mem::replace(&mut next.value, value.clone()));
        }

        next.validate()?;
        Ok((next, inverse))
    }
}

// =============================================================================
// PATCH
// =============================================================================

/// Sparse update for a layer. Only present fields are applied.
///
/// `fill` and `value` are doubly optional: absent leaves the field alone,
/// `Some(None)` (JSON `null`) clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "deserialize_present")]
    pub fill: Option<Option<Rgb>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "deserialize_present")]
    pub value: Option<Option<String>>,
}

impl LayerPatch {
    /// Patch that moves a layer to `(x, y)`.
    #[must_use]
    pub fn position(x: f64, y: f64) -> Self {
        Self { x: Some(x), y: Some(y), ..Self::default() }
    }

    /// Patch that resizes a box-shaped layer.
    #[must_use]
    pub fn size(width: f64, height: f64) -> Self {
        Self { width: Some(width), height: Some(height), ..Self::default() }
    }

    #[must_use]
    pub fn with_fill(mut self, fill: Option<Rgb>) -> Self {
        self.fill = Some(fill);
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: Option<String>) -> Self {
        self.value = Some(value);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_none()
            && self.y.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.points.is_none()
            && self.fill.is_none()
            && self.value.is_none()
    }
}

/// A present key always yields `Some`, so `null` becomes `Some(None)`.
fn deserialize_present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

// =============================================================================
// EDGE
// =============================================================================

/// Connector between two layers. Removed when either endpoint is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EdgeId,
    pub from_layer_id: LayerId,
    pub to_layer_id: LayerId,
}

impl Edge {
    pub fn new(id: impl Into<EdgeId>, from: impl Into<LayerId>, to: impl Into<LayerId>) -> Self {
        Self { id: id.into(), from_layer_id: from.into(), to_layer_id: to.into() }
    }

    /// True if either endpoint is `layer`.
    #[must_use]
    pub fn touches(&self, layer: &LayerId) -> bool {
        &self.from_layer_id == layer || &self.to_layer_id == layer
    }
}
