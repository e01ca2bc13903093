//! Operator supplied policies and the host that invokes them.
//!
//! Every policy is a plain function of its arguments. The `PolicyHost` turns
//! panics into `PolicyErr`s and checks the answers, so a misbehaving policy
//! can only fail the round it was called for.

mod builder;
mod builtin;

use std::{
    any::Any,
    collections::{BTreeMap, BTreeSet},
    panic::{self, AssertUnwindSafe},
};

use model::{ClientId, Metadata, PolicyErr, RoundId, Tensors};

pub use builder::PolicyBuilder;
pub use builtin::{AcceptAll, MetadataKey, RequireKeys, Sample, SelectAll, Uniform};

/// A client id paired with the metadata it connected with.
pub type Candidate = (ClientId, Metadata);

/// The deltas a client handed in for a round, as seen by the weighting policy.
#[derive(Debug, Clone, Copy)]
pub struct Contribution<'a> {
    pub client_id: &'a ClientId,
    pub deltas: &'a Tensors,
    pub metadata: &'a Metadata,
}

/// Decides which of the clients waiting for admission are accepted.
pub trait AdmissionPolicy: Send + Sync {
    /// # Arguments
    /// * `pending` - Every client waiting for admission, in ascending id order.
    ///
    /// # Returns
    /// The accepted subset.
    fn admit(&self, pending: &[Candidate]) -> Result<Vec<ClientId>, PolicyErr>;
}

/// Decides which eligible clients take part in a round.
pub trait SelectionPolicy: Send + Sync {
    /// # Arguments
    /// * `round_id` - The round being selected for.
    /// * `eligible` - The connected clients, in ascending id order.
    ///
    /// # Returns
    /// The selected subset, empty to skip the round.
    fn select(&self, round_id: RoundId, eligible: &[Candidate]) -> Result<Vec<ClientId>, PolicyErr>;
}

/// Assigns an aggregation weight to every contribution of a round.
pub trait WeightPolicy: Send + Sync {
    /// # Arguments
    /// * `contributions` - The updates received on time, in ascending id order.
    ///
    /// # Returns
    /// A weight per client, a weight of zero or less excludes the client.
    fn weigh(&self, contributions: &[Contribution<'_>]) -> Result<BTreeMap<ClientId, f64>, PolicyErr>;
}

impl<F> AdmissionPolicy for F
where
    F: Fn(&[Candidate]) -> Result<Vec<ClientId>, PolicyErr> + Send + Sync,
{
    fn admit(&self, pending: &[Candidate]) -> Result<Vec<ClientId>, PolicyErr> {
        self(pending)
    }
}

impl<F> SelectionPolicy for F
where
    F: Fn(RoundId, &[Candidate]) -> Result<Vec<ClientId>, PolicyErr> + Send + Sync,
{
    fn select(&self, round_id: RoundId, eligible: &[Candidate]) -> Result<Vec<ClientId>, PolicyErr> {
        self(round_id, eligible)
    }
}

impl<F> WeightPolicy for F
where
    F: Fn(&[Contribution<'_>]) -> Result<BTreeMap<ClientId, f64>, PolicyErr> + Send + Sync,
{
    fn weigh(&self, contributions: &[Contribution<'_>]) -> Result<BTreeMap<ClientId, f64>, PolicyErr> {
        self(contributions)
    }
}

/// Holds the session's policies and validates what they return.
pub struct PolicyHost {
    admission: Box<dyn AdmissionPolicy>,
    selection: Box<dyn SelectionPolicy>,
    weighting: Box<dyn WeightPolicy>,
}

impl Default for PolicyHost {
    fn default() -> Self {
        Self::new(AcceptAll, SelectAll, Uniform)
    }
}

impl PolicyHost {
    /// Creates a new `PolicyHost`.
    ///
    /// # Arguments
    /// * `admission` - Accepts or rejects connecting clients.
    /// * `selection` - Picks the participants of each round.
    /// * `weighting` - Weighs the received updates.
    pub fn new<A, S, W>(admission: A, selection: S, weighting: W) -> Self
    where
        A: AdmissionPolicy + 'static,
        S: SelectionPolicy + 'static,
        W: WeightPolicy + 'static,
    {
        Self {
            admission: Box::new(admission),
            selection: Box::new(selection),
            weighting: Box::new(weighting),
        }
    }

    /// Runs the admission policy over a batch of pending clients.
    ///
    /// # Returns
    /// The accepted ids, a subset of `pending`.
    pub fn admit(&self, pending: &[Candidate]) -> Result<BTreeSet<ClientId>, PolicyErr> {
        let accepted = guarded("admission", || self.admission.admit(pending))?;
        subset("admission", accepted, pending.iter().map(|(id, _)| id))
    }

    /// Runs the selection policy for `round_id`.
    ///
    /// # Returns
    /// The selected ids in ascending order, a subset of `eligible`.
    pub fn select(&self, round_id: RoundId, eligible: &[Candidate]) -> Result<Vec<ClientId>, PolicyErr> {
        let selected = guarded("selection", || self.selection.select(round_id, eligible))?;
        let selected = subset("selection", selected, eligible.iter().map(|(id, _)| id))?;
        Ok(selected.into_iter().collect())
    }

    /// Runs the weighting policy over the contributions of a round.
    ///
    /// # Returns
    /// A finite weight for every contribution, zero for the ones the policy left out.
    pub fn weigh(&self, contributions: &[Contribution<'_>]) -> Result<BTreeMap<ClientId, f64>, PolicyErr> {
        let mut weights = guarded("weighting", || self.weighting.weigh(contributions))?;

        let mut checked = BTreeMap::new();
        for Contribution { client_id, .. } in contributions {
            let weight = weights.remove(*client_id).unwrap_or(0.);

            if !weight.is_finite() {
                return Err(PolicyErr::new(format!(
                    "weighting policy returned {weight} for {client_id}"
                )));
            }

            checked.insert((*client_id).clone(), weight);
        }

        if let Some(unknown) = weights.into_keys().next() {
            return Err(PolicyErr::new(format!(
                "weighting policy returned a weight for {unknown}, which didn't contribute"
            )));
        }

        Ok(checked)
    }
}

/// Invokes `f`, turning a panic into a `PolicyErr`.
fn guarded<T>(name: &str, f: impl FnOnce() -> Result<T, PolicyErr>) -> Result<T, PolicyErr> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(res) => res,
        Err(payload) => Err(PolicyErr::new(format!(
            "{name} policy panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic payload"
    }
}

/// De-duplicates `ids` and checks they all come from `allowed`.
fn subset<'a>(
    name: &str,
    ids: Vec<ClientId>,
    allowed: impl Iterator<Item = &'a ClientId>,
) -> Result<BTreeSet<ClientId>, PolicyErr> {
    let allowed: BTreeSet<_> = allowed.collect();

    let mut set = BTreeSet::new();
    for id in ids {
        if !allowed.contains(&id) {
            return Err(PolicyErr::new(format!(
                "{name} policy returned {id}, which wasn't offered"
            )));
        }

        set.insert(id);
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use model::{Layout, Scalar};

    use super::*;

    fn candidates(ids: &[&str]) -> Vec<Candidate> {
        ids.iter()
            .map(|id| (ClientId::from(*id), Metadata::new()))
            .collect()
    }

    #[test]
    fn selection_is_sorted_and_deduplicated() {
        let selection = |_: RoundId, _: &[Candidate]| -> Result<Vec<ClientId>, PolicyErr> {
            Ok(vec!["b".into(), "a".into(), "b".into()])
        };
        let host = PolicyHost::new(AcceptAll, selection, Uniform);

        let selected = host.select(0, &candidates(&["a", "b", "c"])).unwrap();
        assert_eq!(selected, vec![ClientId::from("a"), ClientId::from("b")]);
    }

    #[test]
    fn ids_that_werent_offered_are_rejected() {
        let admission =
            |_: &[Candidate]| -> Result<Vec<ClientId>, PolicyErr> { Ok(vec!["mallory".into()]) };
        let host = PolicyHost::new(admission, SelectAll, Uniform);

        let err = host.admit(&candidates(&["a"])).unwrap_err();
        assert!(err.reason().contains("mallory"));
    }

    #[test]
    fn panics_become_policy_errors() {
        let selection =
            |_: RoundId, _: &[Candidate]| -> Result<Vec<ClientId>, PolicyErr> { panic!("boom") };
        let host = PolicyHost::new(AcceptAll, selection, Uniform);

        let err = host.select(3, &candidates(&["a"])).unwrap_err();
        assert_eq!(err.reason(), "selection policy panicked: boom");
    }

    #[test]
    fn weights_are_completed_and_checked() {
        let deltas = Tensors::zeros(Layout::new(vec![vec![1]]));
        let empty = Metadata::new();
        let mut metadata = Metadata::new();
        metadata.insert("num_examples".into(), Scalar::Int(3));

        let (a, b) = (ClientId::from("a"), ClientId::from("b"));
        let contributions = [
            Contribution {
                client_id: &a,
                deltas: &deltas,
                metadata: &metadata,
            },
            Contribution {
                client_id: &b,
                deltas: &deltas,
                metadata: &empty,
            },
        ];

        let host = PolicyHost::new(AcceptAll, SelectAll, MetadataKey::new("num_examples"));
        let weights = host.weigh(&contributions).unwrap();
        assert_eq!(weights[&a], 3.);
        assert_eq!(weights[&b], 0.);

        let weighting = |c: &[Contribution<'_>]| -> Result<BTreeMap<ClientId, f64>, PolicyErr> {
            Ok(c.iter().map(|c| (c.client_id.clone(), f64::NAN)).collect())
        };
        let host = PolicyHost::new(AcceptAll, SelectAll, weighting);
        assert!(host.weigh(&contributions).is_err());
    }
}
