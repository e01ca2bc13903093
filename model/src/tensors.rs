use serde::{Deserialize, Serialize};

use crate::{Layout, Shape, ShapeErr};

/// The shared parameter set, as seen by the coordination layer.
pub type ModelState = Tensors;

/// An ordered list of `f32` tensors stored back to back in one flat buffer.
///
/// Values are only reachable through the layout, so a `Tensors` never holds
/// a buffer whose length disagrees with its shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorsRepr")]
pub struct Tensors {
    layout: Layout,
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct TensorsRepr {
    layout: Layout,
    values: Vec<f32>,
}

impl TryFrom<TensorsRepr> for Tensors {
    type Error = ShapeErr;

    fn try_from(repr: TensorsRepr) -> Result<Self, Self::Error> {
        Self::new(repr.layout, repr.values)
    }
}

impl Tensors {
    /// Creates a new `Tensors` from a layout and a flat buffer.
    ///
    /// # Arguments
    /// * `layout` - The shapes of the tensors.
    /// * `values` - Every tensor's values, in layout order.
    ///
    /// # Returns
    /// A `ShapeErr` if `values` doesn't hold exactly `layout.len()` elements.
    pub fn new(layout: Layout, values: Vec<f32>) -> Result<Self, ShapeErr> {
        if values.len() != layout.len() {
            return Err(ShapeErr::ValuesLength {
                expected: layout.len(),
                got: values.len(),
            });
        }

        Ok(Self { layout, values })
    }

    /// Creates a new `Tensors` where every value is `value`.
    pub fn filled(layout: Layout, value: f32) -> Self {
        let values = vec![value; layout.len()];
        Self { layout, values }
    }

    /// Creates a new `Tensors` full of zeros.
    pub fn zeros(layout: Layout) -> Self {
        Self::filled(layout, 0.)
    }

    /// Builds a `Tensors` out of individual `(shape, values)` layers.
    ///
    /// # Returns
    /// A `ShapeErr` if any layer's values don't match its shape.
    pub fn from_layers<I>(layers: I) -> Result<Self, ShapeErr>
    where
        I: IntoIterator<Item = (Shape, Vec<f32>)>,
    {
        let mut shapes = Vec::new();
        let mut values = Vec::new();

        for (shape, layer) in layers {
            shapes.push(shape);
            values.extend(layer);
        }

        Self::new(Layout::new(shapes), values)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The flat buffer with every value.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn num_layers(&self) -> usize {
        self.layout.num_layers()
    }

    /// Returns the values of the `layer`-th tensor.
    ///
    /// # Panics
    /// If `layer` is out of bounds.
    pub fn layer(&self, layer: usize) -> &[f32] {
        &self.values[self.layout.range(layer)]
    }

    /// Returns the mutable values of the `layer`-th tensor.
    ///
    /// # Panics
    /// If `layer` is out of bounds.
    pub fn layer_mut(&mut self, layer: usize) -> &mut [f32] {
        let range = self.layout.range(layer);
        &mut self.values[range]
    }

    /// Iterates every tensor's values in order.
    pub fn layers(&self) -> impl ExactSizeIterator<Item = &[f32]> + '_ {
        (0..self.num_layers()).map(|i| self.layer(i))
    }

    /// Checks that `self` has exactly the same shapes as `layout`.
    ///
    /// # Returns
    /// The first mismatch found, if any.
    pub fn conforms_to(&self, layout: &Layout) -> Result<(), ShapeErr> {
        if self.num_layers() != layout.num_layers() {
            return Err(ShapeErr::LayerCount {
                expected: layout.num_layers(),
                got: self.num_layers(),
            });
        }

        let mismatch = self
            .layout
            .shapes()
            .iter()
            .zip(layout.shapes())
            .position(|(got, expected)| got != expected);

        match mismatch {
            Some(layer) => Err(ShapeErr::LayerShape {
                layer,
                expected: layout.shape(layer).to_vec(),
                got: self.layout.shape(layer).to_vec(),
            }),
            None => Ok(()),
        }
    }

    /// Splits `self` into its layout and its flat buffer.
    pub fn into_parts(self) -> (Layout, Vec<f32>) {
        (self.layout, self.values)
    }
}
