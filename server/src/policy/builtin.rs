use std::collections::BTreeMap;

use model::{ClientId, PolicyErr, RoundId};
use rand::{SeedableRng, rngs::StdRng, seq::index};

use super::{AdmissionPolicy, Candidate, Contribution, SelectionPolicy, WeightPolicy};

/// Admits every client.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AdmissionPolicy for AcceptAll {
    fn admit(&self, pending: &[Candidate]) -> Result<Vec<ClientId>, PolicyErr> {
        Ok(pending.iter().map(|(id, _)| id.clone()).collect())
    }
}

/// Admits the clients whose metadata carries every one of `keys`.
#[derive(Debug, Clone, Default)]
pub struct RequireKeys {
    keys: Vec<String>,
}

impl RequireKeys {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }
}

impl AdmissionPolicy for RequireKeys {
    fn admit(&self, pending: &[Candidate]) -> Result<Vec<ClientId>, PolicyErr> {
        let accepted = pending
            .iter()
            .filter(|(_, metadata)| self.keys.iter().all(|key| metadata.contains_key(key)))
            .map(|(id, _)| id.clone())
            .collect();

        Ok(accepted)
    }
}

/// Selects every eligible client.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectAll;

impl SelectionPolicy for SelectAll {
    fn select(&self, _: RoundId, eligible: &[Candidate]) -> Result<Vec<ClientId>, PolicyErr> {
        Ok(eligible.iter().map(|(id, _)| id.clone()).collect())
    }
}

/// Selects a random `fraction` of the eligible clients, never fewer than `min`.
///
/// The draw only depends on the seed, the round id and the eligible ids, so
/// the same round over the same population always selects the same clients.
#[derive(Debug, Clone)]
pub struct Sample {
    fraction: f64,
    min: usize,
    seed: u64,
}

impl Sample {
    /// Creates a new `Sample` policy.
    ///
    /// # Arguments
    /// * `fraction` - The share of the eligible clients to select, in `(0, 1]`.
    /// * `min` - The least amount of clients to select when available.
    /// * `seed` - The base seed of the draws.
    pub fn new(fraction: f64, min: usize, seed: u64) -> Self {
        Self {
            fraction,
            min,
            seed,
        }
    }

    /// The amount of clients to draw out of `eligible`.
    fn amount(&self, eligible: usize) -> usize {
        let share = (self.fraction * eligible as f64).ceil() as usize;
        share.max(self.min).min(eligible)
    }
}

impl SelectionPolicy for Sample {
    fn select(&self, round_id: RoundId, eligible: &[Candidate]) -> Result<Vec<ClientId>, PolicyErr> {
        let amount = self.amount(eligible.len());
        let mut rng = StdRng::seed_from_u64(self.seed ^ round_id.rotate_left(32));

        let mut picked: Vec<_> = index::sample(&mut rng, eligible.len(), amount)
            .into_iter()
            .collect();
        picked.sort_unstable();

        Ok(picked.into_iter().map(|i| eligible[i].0.clone()).collect())
    }
}

/// Weighs every contribution equally.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uniform;

impl WeightPolicy for Uniform {
    fn weigh(&self, contributions: &[Contribution<'_>]) -> Result<BTreeMap<ClientId, f64>, PolicyErr> {
        Ok(contributions
            .iter()
            .map(|c| (c.client_id.clone(), 1.))
            .collect())
    }
}

/// Weighs every contribution by a numeric metadata entry, such as the
/// amount of local examples for federated averaging.
///
/// Clients missing the key, or with a non numeric value, get a weight of zero.
#[derive(Debug, Clone)]
pub struct MetadataKey {
    key: String,
}

impl MetadataKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl WeightPolicy for MetadataKey {
    fn weigh(&self, contributions: &[Contribution<'_>]) -> Result<BTreeMap<ClientId, f64>, PolicyErr> {
        let weights = contributions
            .iter()
            .map(|c| {
                let weight = c
                    .metadata
                    .get(&self.key)
                    .and_then(|value| value.as_f64())
                    .unwrap_or(0.);

                (c.client_id.clone(), weight)
            })
            .collect();

        Ok(weights)
    }
}

#[cfg(test)]
mod tests {
    use model::{Metadata, Scalar};

    use super::*;

    fn population(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| (ClientId::new(format!("client-{i:03}")), Metadata::new()))
            .collect()
    }

    #[test]
    fn require_keys_filters_on_metadata() {
        let mut metadata = Metadata::new();
        metadata.insert("region".into(), Scalar::from("eu"));
        let pending = vec![
            (ClientId::from("a"), metadata),
            (ClientId::from("b"), Metadata::new()),
        ];

        let accepted = RequireKeys::new(vec!["region".into()]).admit(&pending).unwrap();
        assert_eq!(accepted, vec![ClientId::from("a")]);
    }

    #[test]
    fn sample_is_reproducible_per_round() {
        let eligible = population(20);
        let policy = Sample::new(0.25, 2, 7);

        let first = policy.select(3, &eligible).unwrap();
        let again = policy.select(3, &eligible).unwrap();

        assert_eq!(first.len(), 5);
        assert_eq!(first, again);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn sample_respects_min_and_population() {
        assert_eq!(Sample::new(0.1, 3, 0).select(0, &population(10)).unwrap().len(), 3);
        assert_eq!(Sample::new(0.1, 3, 0).select(0, &population(2)).unwrap().len(), 2);
        assert!(Sample::new(0.5, 0, 0).select(0, &[]).unwrap().is_empty());
    }
}
