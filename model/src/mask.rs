use serde::{Deserialize, Serialize};

use crate::{Layout, ShapeErr};

/// Per position weighting a client applies to its own update.
///
/// Each layer either has one entry per element of its tensor or a single
/// entry broadcast to the whole tensor. All ones means no masking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MaskRepr")]
pub struct Mask {
    lens: Vec<usize>,
    values: Vec<f32>,
    #[serde(skip)]
    offsets: Vec<usize>,
}

#[derive(Deserialize)]
struct MaskRepr {
    lens: Vec<usize>,
    values: Vec<f32>,
}

impl TryFrom<MaskRepr> for Mask {
    type Error = ShapeErr;

    fn try_from(repr: MaskRepr) -> Result<Self, Self::Error> {
        Self::from_parts(repr.lens, repr.values)
    }
}

/// A borrowed view over a single layer of a `Mask`.
#[derive(Debug, Clone, Copy)]
pub struct MaskLayer<'a>(&'a [f32]);

impl<'a> MaskLayer<'a> {
    /// The mask value for the `pos`-th element of the tensor.
    #[inline]
    pub fn at(&self, pos: usize) -> f32 {
        match self.0 {
            [scalar] => *scalar,
            values => values[pos],
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.0.len() == 1
    }

    pub fn values(&self) -> &'a [f32] {
        self.0
    }
}

impl Mask {
    /// Creates a `Mask` from per layer lengths and the flat values.
    ///
    /// # Returns
    /// A `ShapeErr` if the lengths don't add up to the amount of values.
    pub fn from_parts(lens: Vec<usize>, values: Vec<f32>) -> Result<Self, ShapeErr> {
        let mut offsets = Vec::with_capacity(lens.len() + 1);
        let mut acc = 0usize;
        offsets.push(acc);

        for len in &lens {
            acc = acc.saturating_add(*len);
            offsets.push(acc);
        }

        if acc != values.len() {
            return Err(ShapeErr::ValuesLength {
                expected: acc,
                got: values.len(),
            });
        }

        Ok(Self {
            lens,
            values,
            offsets,
        })
    }

    /// The compact "no masking" mask for `layout`, one scalar `1.0` per layer.
    pub fn ones(layout: &Layout) -> Self {
        let n = layout.num_layers();

        Self {
            lens: vec![1; n],
            values: vec![1.; n],
            offsets: (0..=n).collect(),
        }
    }

    /// Builds a mask out of individual layers.
    pub fn from_layers<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Vec<f32>>,
    {
        let mut lens = Vec::new();
        let mut values = Vec::new();

        for layer in layers {
            lens.push(layer.len());
            values.extend(layer);
        }

        let mut offsets = Vec::with_capacity(lens.len() + 1);
        offsets.push(0);
        offsets.extend(lens.iter().scan(0, |acc, len| {
            *acc += len;
            Some(*acc)
        }));

        Self {
            lens,
            values,
            offsets,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.lens.len()
    }

    pub fn lens(&self) -> &[usize] {
        &self.lens
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Returns a view over the `layer`-th mask entry.
    ///
    /// # Panics
    /// If `layer` is out of bounds.
    pub fn layer(&self, layer: usize) -> MaskLayer<'_> {
        MaskLayer(&self.values[self.offsets[layer]..self.offsets[layer + 1]])
    }

    pub fn is_all_ones(&self) -> bool {
        self.values.iter().all(|&v| v == 1.)
    }

    /// Checks that every layer is either a scalar or the size of its tensor in `layout`.
    pub fn conforms_to(&self, layout: &Layout) -> Result<(), ShapeErr> {
        if self.num_layers() != layout.num_layers() {
            return Err(ShapeErr::LayerCount {
                expected: layout.num_layers(),
                got: self.num_layers(),
            });
        }

        for (layer, &len) in self.lens.iter().enumerate() {
            let expected = layout.layer_len(layer);

            if len != 1 && len != expected {
                return Err(ShapeErr::MaskLength {
                    layer,
                    expected,
                    got: len,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_layers_broadcast() {
        let mask = Mask::from_layers([vec![0.5], vec![1., 0., 1.]]);

        assert!(mask.layer(0).is_scalar());
        assert_eq!(mask.layer(0).at(7), 0.5);
        assert_eq!(mask.layer(1).at(1), 0.);
        assert_eq!(mask.layer(1).at(2), 1.);
    }

    #[test]
    fn ones_conforms_to_any_layout() {
        let layout = Layout::new(vec![vec![4, 4], vec![], vec![2]]);
        let mask = Mask::ones(&layout);

        assert!(mask.is_all_ones());
        assert!(mask.conforms_to(&layout).is_ok());
    }

    #[test]
    fn rejects_partial_layers() {
        let layout = Layout::new(vec![vec![3]]);
        let mask = Mask::from_layers([vec![1., 1.]]);

        let err = mask.conforms_to(&layout).unwrap_err();
        assert_eq!(
            err,
            ShapeErr::MaskLength {
                layer: 0,
                expected: 3,
                got: 2
            }
        );
    }

    #[test]
    fn parts_must_add_up() {
        assert!(Mask::from_parts(vec![2, 1], vec![1.; 3]).is_ok());
        assert!(Mask::from_parts(vec![2, 2], vec![1.; 3]).is_err());
    }

    #[test]
    fn deserialization_rebuilds_offsets() {
        let mask = Mask::from_layers([vec![1.], vec![0., 1.]]);
        let json = serde_json::to_string(&mask).unwrap();
        let back: Mask = serde_json::from_str(&json).unwrap();

        assert_eq!(back, mask);
        assert_eq!(back.layer(1).at(0), 0.);
    }
}
