//! Domain types shared between the federation server and its clients.
//!
//! Model state is opaque to the coordination layer: an ordered list of
//! tensors stored back to back in one flat arena, described by a `Layout`.

mod client;
mod error;
mod layout;
mod mask;
mod tensors;
mod update;

pub use client::{ClientId, Metadata, Scalar};
pub use error::{PolicyErr, ShapeErr};
pub use layout::{Layout, Shape};
pub use mask::{Mask, MaskLayer};
pub use tensors::{ModelState, Tensors};
pub use update::ClientUpdate;

/// Monotonic identifier of a round, starting at `0`.
pub type RoundId = u64;
