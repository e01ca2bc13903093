use serde::{Deserialize, Serialize};

use crate::{ClientId, Layout, Mask, RoundId, ShapeErr, Tensors};

/// What a client sends back at the end of its local work for a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientUpdate {
    pub client_id: ClientId,
    pub round_id: RoundId,
    pub deltas: Tensors,
    pub mask: Mask,
}

impl ClientUpdate {
    /// Checks that both the deltas and the mask fit the model's `layout`,
    /// that every value is finite and that no mask entry is negative.
    pub fn validate(&self, layout: &Layout) -> Result<(), ShapeErr> {
        self.deltas.conforms_to(layout)?;
        self.mask.conforms_to(layout)?;

        for (layer, deltas) in self.deltas.layers().enumerate() {
            if let Some(pos) = deltas.iter().position(|delta| !delta.is_finite()) {
                return Err(ShapeErr::NonFinite {
                    part: "deltas",
                    layer,
                    pos,
                });
            }
        }

        for layer in 0..self.mask.num_layers() {
            let mask = self.mask.layer(layer).values();

            if let Some(pos) = mask.iter().position(|m| !m.is_finite()) {
                return Err(ShapeErr::NonFinite {
                    part: "mask",
                    layer,
                    pos,
                });
            }

            if let Some(pos) = mask.iter().position(|&m| m < 0.) {
                return Err(ShapeErr::NegativeMask { layer, pos });
            }
        }

        Ok(())
    }
}
