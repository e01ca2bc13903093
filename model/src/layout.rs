use std::ops::Range;

use serde::{Deserialize, Serialize};

/// The dimensions of a single tensor, an empty shape is a scalar.
pub type Shape = Vec<usize>;

/// Describes how an ordered list of tensors is laid out in a flat buffer.
///
/// Only the shapes go over the wire, offsets are recomputed on arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Shape>", into = "Vec<Shape>")]
pub struct Layout {
    shapes: Vec<Shape>,
    offsets: Vec<usize>,
}

impl Layout {
    /// Creates a new `Layout`.
    ///
    /// # Arguments
    /// * `shapes` - The shape of every tensor, in order.
    ///
    /// # Returns
    /// A new `Layout` instance.
    pub fn new(shapes: Vec<Shape>) -> Self {
        let mut offsets = Vec::with_capacity(shapes.len() + 1);
        let mut acc = 0usize;
        offsets.push(acc);

        for shape in &shapes {
            acc = acc.saturating_add(numel(shape));
            offsets.push(acc);
        }

        Self { shapes, offsets }
    }

    /// The amount of tensors described.
    pub fn num_layers(&self) -> usize {
        self.shapes.len()
    }

    /// The total amount of elements across every tensor.
    pub fn len(&self) -> usize {
        self.offsets.last().copied().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    /// Returns the shape of the `layer`-th tensor.
    ///
    /// # Panics
    /// If `layer` is out of bounds.
    pub fn shape(&self, layer: usize) -> &[usize] {
        &self.shapes[layer]
    }

    /// The amount of elements of the `layer`-th tensor.
    ///
    /// # Panics
    /// If `layer` is out of bounds.
    pub fn layer_len(&self, layer: usize) -> usize {
        self.offsets[layer + 1] - self.offsets[layer]
    }

    /// The position of the `layer`-th tensor inside the flat buffer.
    ///
    /// # Panics
    /// If `layer` is out of bounds.
    pub fn range(&self, layer: usize) -> Range<usize> {
        self.offsets[layer]..self.offsets[layer + 1]
    }
}

impl From<Vec<Shape>> for Layout {
    fn from(shapes: Vec<Shape>) -> Self {
        Self::new(shapes)
    }
}

impl From<Layout> for Vec<Shape> {
    fn from(layout: Layout) -> Self {
        layout.shapes
    }
}

/// The amount of elements of a tensor of the given shape.
///
/// Saturates instead of overflowing so absurd shapes can never match a real buffer.
fn numel(shape: &[usize]) -> usize {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_shapes() {
        let layout = Layout::new(vec![vec![2, 3], vec![], vec![4]]);

        assert_eq!(layout.num_layers(), 3);
        assert_eq!(layout.len(), 11);
        assert_eq!(layout.range(0), 0..6);
        assert_eq!(layout.range(1), 6..7);
        assert_eq!(layout.range(2), 7..11);
    }

    #[test]
    fn zero_sized_dimension_is_empty() {
        let layout = Layout::new(vec![vec![3, 0]]);
        assert_eq!(layout.layer_len(0), 0);
        assert!(layout.is_empty());
    }

    #[test]
    fn serializes_as_shapes() {
        let layout = Layout::new(vec![vec![2], vec![1, 1]]);
        let json = serde_json::to_string(&layout).unwrap();
        assert_eq!(json, "[[2],[1,1]]");

        let back: Layout = serde_json::from_str(&json).unwrap();
        assert_eq!(back, layout);
    }
}
