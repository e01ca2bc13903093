use std::{
    error::Error,
    fmt::{self, Display},
};

/// Raised whenever tensors, masks or layouts don't line up, or hold values
/// that can't be aggregated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeErr {
    /// The flat value buffer doesn't hold exactly the elements the layout describes.
    ValuesLength { expected: usize, got: usize },
    /// Two layouts (or a layout and a mask) disagree on the amount of layers.
    LayerCount { expected: usize, got: usize },
    /// A layer's shape differs from the reference layout.
    LayerShape {
        layer: usize,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// A mask layer is neither a scalar nor the size of its tensor.
    MaskLength {
        layer: usize,
        expected: usize,
        got: usize,
    },
    /// A NaN or infinite value in the deltas or the mask.
    NonFinite {
        part: &'static str,
        layer: usize,
        pos: usize,
    },
    /// Masks weigh positions, they can't be negative.
    NegativeMask { layer: usize, pos: usize },
}

impl Display for ShapeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeErr::ValuesLength { expected, got } => {
                write!(f, "value buffer holds {got} elements, the layout expects {expected}")
            }
            ShapeErr::LayerCount { expected, got } => {
                write!(f, "got {got} layers, expected {expected}")
            }
            ShapeErr::LayerShape {
                layer,
                expected,
                got,
            } => write!(f, "layer {layer} has shape {got:?}, expected {expected:?}"),
            ShapeErr::MaskLength {
                layer,
                expected,
                got,
            } => write!(
                f,
                "mask layer {layer} has {got} entries, expected 1 or {expected}"
            ),
            ShapeErr::NonFinite { part, layer, pos } => {
                write!(f, "{part} of layer {layer} hold a non finite value at {pos}")
            }
            ShapeErr::NegativeMask { layer, pos } => {
                write!(f, "mask layer {layer} is negative at {pos}")
            }
        }
    }
}

impl Error for ShapeErr {}

/// Failure of an operator supplied policy.
///
/// Policies are plain functions of their inputs, so the only information
/// carried is a human readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyErr(String);

impl PolicyErr {
    /// Creates a new `PolicyErr`.
    ///
    /// # Arguments
    /// * `reason` - Why the policy failed.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    /// The reason of the failure.
    pub fn reason(&self) -> &str {
        &self.0
    }
}

impl Display for PolicyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for PolicyErr {}

impl From<ShapeErr> for PolicyErr {
    fn from(value: ShapeErr) -> Self {
        Self(value.to_string())
    }
}
