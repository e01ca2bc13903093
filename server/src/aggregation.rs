use std::{
    collections::{BTreeMap, BTreeSet},
    error::Error,
    fmt,
};

use log::debug;
use model::{ClientId, ClientUpdate, ModelState, ShapeErr};
use rayon::prelude::*;

/// Failures of the aggregation of a round.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationErr {
    /// An update doesn't fit the layout of the current model.
    ShapeMismatch { client_id: ClientId, source: ShapeErr },
    /// The same client handed in more than one update.
    DuplicateClient(ClientId),
    /// Every update was excluded by its weight.
    NoContributors,
}

impl fmt::Display for AggregationErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationErr::ShapeMismatch { client_id, source } => {
                write!(f, "update of {client_id} doesn't match the model: {source}")
            }
            AggregationErr::DuplicateClient(client_id) => {
                write!(f, "more than one update from {client_id}")
            }
            AggregationErr::NoContributors => f.write_str("no update with a positive weight"),
        }
    }
}

impl Error for AggregationErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AggregationErr::ShapeMismatch { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A contributing update and its weight.
struct Contribution<'a> {
    weight: f64,
    update: &'a ClientUpdate,
}

/// Combines the client updates of a round into a new model.
///
/// Every position of every layer becomes
/// `current + Σ w·m·δ / Σ w·m`, summed over the contributing clients in
/// ascending id order. Positions where the denominator is zero keep their
/// current value. Layers are reduced in parallel, the order of the sums
/// within a layer never depends on the order of `updates`, so the result is
/// bit reproducible.
///
/// # Arguments
/// * `current` - The model the deltas were computed against.
/// * `updates` - The updates collected for the round.
/// * `weights` - The weight of every client, missing or non positive weights exclude the client.
///
/// # Returns
/// The new model or an `AggregationErr`.
pub fn aggregate(
    current: &ModelState,
    updates: &[ClientUpdate],
    weights: &BTreeMap<ClientId, f64>,
) -> Result<ModelState, AggregationErr> {
    let mut seen = BTreeSet::new();
    let mut contributions = Vec::with_capacity(updates.len());

    for update in updates {
        if !seen.insert(&update.client_id) {
            return Err(AggregationErr::DuplicateClient(update.client_id.clone()));
        }

        let weight = weights.get(&update.client_id).copied().unwrap_or(0.);

        if !(weight > 0.) {
            debug!(client_id = update.client_id.as_str(), weight = weight; "excluded from aggregation");
            continue;
        }

        update
            .validate(current.layout())
            .map_err(|source| AggregationErr::ShapeMismatch {
                client_id: update.client_id.clone(),
                source,
            })?;

        contributions.push(Contribution { weight, update });
    }

    if contributions.is_empty() {
        return Err(AggregationErr::NoContributors);
    }

    contributions.sort_by(|a, b| a.update.client_id.cmp(&b.update.client_id));

    let mut next = current.clone();
    let mut layers = Vec::with_capacity(next.num_layers());
    let mut rest = next.values_mut();

    for layer in 0..current.num_layers() {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(current.layout().layer_len(layer));
        layers.push(head);
        rest = tail;
    }

    layers
        .into_par_iter()
        .enumerate()
        .for_each(|(layer, out)| reduce_layer(layer, out, &contributions));

    Ok(next)
}

/// Reduces a single layer in place.
fn reduce_layer(layer: usize, out: &mut [f32], contributions: &[Contribution<'_>]) {
    let mut num = vec![0f64; out.len()];
    let mut den = vec![0f64; out.len()];

    for Contribution { weight, update } in contributions {
        let deltas = update.deltas.layer(layer);
        let mask = update.mask.layer(layer);

        for (pos, delta) in deltas.iter().enumerate() {
            let effective = weight * f64::from(mask.at(pos));

            // Masked out positions count towards neither sum.
            if effective == 0. {
                continue;
            }

            num[pos] += effective * f64::from(*delta);
            den[pos] += effective;
        }
    }

    for (pos, value) in out.iter_mut().enumerate() {
        if den[pos] != 0. {
            *value = (f64::from(*value) + num[pos] / den[pos]) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use model::{Layout, Mask, Tensors};

    use super::*;

    fn update(id: &str, deltas: Vec<f32>, mask: Vec<f32>) -> ClientUpdate {
        let len = deltas.len();
        ClientUpdate {
            client_id: id.into(),
            round_id: 0,
            deltas: Tensors::from_layers([(vec![len], deltas)]).unwrap(),
            mask: Mask::from_layers([mask]),
        }
    }

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<ClientId, f64> {
        pairs.iter().map(|(id, w)| (ClientId::from(*id), *w)).collect()
    }

    #[test]
    fn masked_weighted_mean() {
        let current = Tensors::zeros(Layout::new(vec![vec![2]]));
        let updates = [
            update("c1", vec![1., 1.], vec![1., 1.]),
            update("c2", vec![2., 2.], vec![1., 0.]),
            update("c3", vec![3., 3.], vec![1., 1.]),
        ];
        let weights = weights(&[("c1", 0.2), ("c2", 0.3), ("c3", 0.5)]);

        let next = aggregate(&current, &updates, &weights).unwrap();
        let layer = next.layer(0);

        assert!((layer[0] - 2.3).abs() < 1e-6);
        // c2 is masked out of the second position: (0.2 * 1 + 0.5 * 3) / 0.7
        assert!((layer[1] - 1.7 / 0.7).abs() < 1e-6);
    }

    #[test]
    fn input_order_doesnt_change_the_bits() {
        let current = Tensors::filled(Layout::new(vec![vec![3]]), 0.1);
        let a = update("a", vec![0.3, -1.7, 1e-3], vec![0.5, 1., 1.]);
        let b = update("b", vec![2.9, 0.11, -4.], vec![1., 0.25, 1.]);
        let c = update("c", vec![-0.7, 8.5, 0.6], vec![1., 1., 0.]);
        let weights = weights(&[("a", 0.13), ("b", 0.61), ("c", 0.26)]);

        let forward = aggregate(&current, &[a.clone(), b.clone(), c.clone()], &weights).unwrap();
        let backward = aggregate(&current, &[c, a, b], &weights).unwrap();

        let bits = |t: &Tensors| t.values().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&forward), bits(&backward));
    }

    #[test]
    fn all_ones_masks_reduce_to_a_weighted_sum() {
        let current = Tensors::from_layers([(vec![2], vec![1., -1.]), (vec![], vec![0.5])]).unwrap();
        let ones = Mask::ones(current.layout());
        let updates = [
            ClientUpdate {
                client_id: "a".into(),
                round_id: 0,
                deltas: Tensors::from_layers([(vec![2], vec![1., 2.]), (vec![], vec![4.])])
                    .unwrap(),
                mask: ones.clone(),
            },
            ClientUpdate {
                client_id: "b".into(),
                round_id: 0,
                deltas: Tensors::from_layers([(vec![2], vec![3., 0.]), (vec![], vec![-4.])])
                    .unwrap(),
                mask: ones,
            },
        ];

        let next = aggregate(&current, &updates, &weights(&[("a", 0.25), ("b", 0.75)])).unwrap();

        assert_eq!(next.layer(0), &[1. + 0.25 + 2.25, -1. + 0.5]);
        assert_eq!(next.layer(1), &[0.5 + 1. - 3.]);
    }

    #[test]
    fn fully_masked_position_is_unchanged() {
        let current = Tensors::filled(Layout::new(vec![vec![2]]), 7.);
        let updates = [
            update("a", vec![1e30, 1.], vec![0., 1.]),
            update("b", vec![5., 1.], vec![0., 1.]),
        ];

        let next = aggregate(&current, &updates, &weights(&[("a", 1.), ("b", 1.)])).unwrap();

        assert_eq!(next.layer(0), &[7., 8.]);
    }

    #[test]
    fn non_positive_weights_are_excluded() {
        let current = Tensors::zeros(Layout::new(vec![vec![1]]));
        let updates = [update("a", vec![1.], vec![1.]), update("b", vec![100.], vec![1.])];

        let next = aggregate(&current, &updates, &weights(&[("a", 1.), ("b", 0.)])).unwrap();
        assert_eq!(next.layer(0), &[1.]);

        let err = aggregate(&current, &updates, &weights(&[("a", -1.)])).unwrap_err();
        assert_eq!(err, AggregationErr::NoContributors);
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let current = Tensors::zeros(Layout::new(vec![vec![2]]));
        let updates = [update("a", vec![1., 2., 3.], vec![1.])];

        let err = aggregate(&current, &updates, &weights(&[("a", 1.)])).unwrap_err();
        assert!(matches!(err, AggregationErr::ShapeMismatch { .. }));
    }

    #[test]
    fn non_finite_masks_are_rejected() {
        let current = Tensors::zeros(Layout::new(vec![vec![2]]));
        let updates = [
            update("a", vec![1., 1.], vec![1., 1.]),
            update("b", vec![1., 1.], vec![f32::NAN, 1.]),
        ];

        let err = aggregate(&current, &updates, &weights(&[("a", 1.), ("b", 1.)])).unwrap_err();
        assert!(matches!(
            err,
            AggregationErr::ShapeMismatch {
                source: ShapeErr::NonFinite { part: "mask", .. },
                ..
            }
        ));
    }

    #[test]
    fn duplicate_updates_are_an_error() {
        let current = Tensors::zeros(Layout::new(vec![vec![1]]));
        let updates = [update("a", vec![1.], vec![1.]), update("a", vec![2.], vec![1.])];

        let err = aggregate(&current, &updates, &weights(&[("a", 1.)])).unwrap_err();
        assert_eq!(err, AggregationErr::DuplicateClient("a".into()));
    }
}
