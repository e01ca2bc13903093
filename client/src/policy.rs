//! Local update policies: what a client does with the model of a round.

use model::{Mask, ModelState, PolicyErr, RoundId, Tensors};

use crate::config::LocalPolicySpec;

/// Turns the broadcast model into this client's update for the round.
///
/// Runs on the blocking thread pool, so it may take as long as local training does.
pub trait LocalUpdatePolicy: Send + Sync {
    /// # Arguments
    /// * `round_id` - The round the model was broadcast for.
    /// * `model` - The current global model.
    ///
    /// # Returns
    /// The deltas to apply to `model` and the mask to weigh them with.
    fn update(&self, round_id: RoundId, model: &ModelState) -> Result<(Tensors, Mask), PolicyErr>;
}

impl<F> LocalUpdatePolicy for F
where
    F: Fn(RoundId, &ModelState) -> Result<(Tensors, Mask), PolicyErr> + Send + Sync,
{
    fn update(&self, round_id: RoundId, model: &ModelState) -> Result<(Tensors, Mask), PolicyErr> {
        self(round_id, model)
    }
}

/// Contributes nothing: zero deltas under an all ones mask.
pub struct Noop;

impl LocalUpdatePolicy for Noop {
    fn update(&self, _: RoundId, model: &ModelState) -> Result<(Tensors, Mask), PolicyErr> {
        let layout = model.layout();
        Ok((Tensors::zeros(layout.clone()), Mask::ones(layout)))
    }
}

/// Pushes every parameter by the same amount.
pub struct Constant {
    delta: f32,
}

impl Constant {
    pub fn new(delta: f32) -> Self {
        Self { delta }
    }
}

impl LocalUpdatePolicy for Constant {
    fn update(&self, _: RoundId, model: &ModelState) -> Result<(Tensors, Mask), PolicyErr> {
        let layout = model.layout();
        Ok((Tensors::filled(layout.clone(), self.delta), Mask::ones(layout)))
    }
}

/// Builds the built-in policy named by `spec`.
pub fn from_spec(spec: &LocalPolicySpec) -> Box<dyn LocalUpdatePolicy> {
    match *spec {
        LocalPolicySpec::Noop => Box::new(Noop),
        LocalPolicySpec::Constant { delta } => Box::new(Constant::new(delta)),
    }
}
