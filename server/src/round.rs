//! The lifecycle of a single round.

use std::{collections::BTreeMap, io, path::PathBuf, sync::Arc, time::Duration};

use log::{debug, info, warn};
use model::{ClientId, ClientUpdate, Metadata, RoundId};
use serde::Serialize;
use tokio::{task, time::Instant};

use crate::{
    aggregation,
    checkpoint::{CheckpointRecord, CheckpointStore},
    connection::{ConnId, Outgoing},
    error::{Result, RoundFailure, SessionErr},
    policy::{Contribution, PolicyHost},
    registry::{ConnState, now_ms},
    session::{Inbox, SessionState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Selecting,
    Broadcasting,
    Collecting,
    Aggregating,
    Committed,
    Failed,
}

/// The outcome of one attempt of a round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundRecord {
    pub round_id: RoundId,
    /// Failed attempts keep the round id, the attempt counts them.
    pub attempt: u32,
    pub status: RoundStatus,
    pub selected: Vec<ClientId>,
    pub responded: Vec<ClientId>,
    pub started_ms: u64,
    pub deadline_ms: Option<u64>,
    /// Why the attempt failed.
    pub failure: Option<String>,
    /// Where the resulting model was persisted, once committed.
    pub checkpoint: Option<PathBuf>,
}

impl RoundRecord {
    fn new(round_id: RoundId, attempt: u32) -> Self {
        Self {
            round_id,
            attempt,
            status: RoundStatus::Selecting,
            selected: Vec::new(),
            responded: Vec::new(),
            started_ms: now_ms(),
            deadline_ms: None,
            failure: None,
            checkpoint: None,
        }
    }

    fn fail(mut self, failure: RoundFailure) -> Self {
        warn!(round_id = self.round_id, attempt = self.attempt; "round failed: {failure}");
        self.status = RoundStatus::Failed;
        self.failure = Some(failure.to_string());
        self
    }
}

/// Where committed rounds go.
pub(crate) struct Persistence<'s> {
    pub store: &'s CheckpointStore,
    pub server_id: &'s str,
    pub archive_updates: bool,
}

/// Drives one round through select, broadcast, collect, aggregate and commit.
///
/// It is the only writer of the session's model and round id while it runs.
pub(crate) struct RoundManager<'s> {
    pub state: &'s mut SessionState,
    pub policies: &'s PolicyHost,
    pub inbox: &'s mut Inbox,
    pub persistence: Option<Persistence<'s>>,
    pub min_clients: usize,
    pub deadline: Duration,
}

impl RoundManager<'_> {
    /// Runs an attempt of the session's next round.
    ///
    /// # Arguments
    /// * `attempt` - How many attempts of this round failed before.
    ///
    /// # Returns
    /// The record of the attempt, committed or failed, or a `SessionErr` if
    /// the committed round couldn't be persisted.
    pub async fn run(mut self, attempt: u32) -> Result<RoundRecord> {
        let round_id = self.state.next_round;
        let mut record = RoundRecord::new(round_id, attempt);

        let eligible = self.state.registry.eligible_clients();
        let selected = match self.policies.select(round_id, &eligible) {
            Ok(selected) => selected,
            Err(e) => return Ok(record.fail(e.into())),
        };

        record.selected = selected.clone();
        debug!(round_id = round_id, eligible = eligible.len(); "selected {} clients", selected.len());

        if selected.is_empty() {
            return Ok(record.fail(RoundFailure::NoClientsSelected));
        }

        if selected.len() < self.min_clients {
            return Ok(record.fail(self.quorum_failure(selected.len())));
        }

        record.status = RoundStatus::Broadcasting;
        let active = self.broadcast(round_id, selected);

        if active.len() < self.min_clients {
            self.release(&active);
            return Ok(record.fail(self.quorum_failure(active.len())));
        }

        record.status = RoundStatus::Collecting;
        record.deadline_ms = Some(record.started_ms + self.deadline.as_millis() as u64);
        let received = self.collect(round_id, active).await;
        record.responded = received.keys().cloned().collect();

        if received.len() < self.min_clients {
            return Ok(record.fail(self.quorum_failure(received.len())));
        }

        record.status = RoundStatus::Aggregating;
        let updates: Vec<ClientUpdate> = received.into_values().collect();

        let weights = match self.weigh(&updates) {
            Ok(weights) => weights,
            Err(failure) => return Ok(record.fail(failure)),
        };

        let current = Arc::clone(&self.state.model);
        let (updates, next) = task::spawn_blocking(move || {
            let next = aggregation::aggregate(&current, &updates, &weights);
            (updates, next)
        })
        .await
        .map_err(|e| SessionErr::Io(io::Error::other(format!("aggregation task failed: {e}"))))?;

        let next = match next {
            Ok(next) => next,
            Err(e) => return Ok(record.fail(e.into())),
        };

        if let Some(persistence) = &self.persistence {
            let ckpt = CheckpointRecord {
                server_id: persistence.server_id.to_string(),
                round_id,
                attempt,
                model: next,
                selected: record.selected.clone(),
                responded: record.responded.clone(),
                timestamp_ms: now_ms(),
                updates: persistence.archive_updates.then_some(updates),
            };

            let store = persistence.store.clone();
            let (ckpt, saved) = task::spawn_blocking(move || {
                let saved = store.save_round(&ckpt);
                (ckpt, saved)
            })
            .await
            .map_err(|e| SessionErr::Io(io::Error::other(format!("checkpoint task failed: {e}"))))?;

            record.checkpoint = Some(saved?);
            self.state.model = Arc::new(ckpt.model);
        } else {
            self.state.model = Arc::new(next);
        }

        self.state.next_round += 1;
        for client_id in &record.responded {
            self.state.registry.participated(client_id, round_id);
        }

        record.status = RoundStatus::Committed;
        info!(round_id = round_id, attempt = attempt, responded = record.responded.len(); "round committed");

        Ok(record)
    }

    fn quorum_failure(&self, active: usize) -> RoundFailure {
        RoundFailure::QuorumNotMet {
            active,
            required: self.min_clients,
        }
    }

    /// Pushes the current model to every selected client.
    ///
    /// # Returns
    /// The clients the task was queued for, with the connection they were selected on.
    fn broadcast(&mut self, round_id: RoundId, selected: Vec<ClientId>) -> BTreeMap<ClientId, ConnId> {
        let registry = &mut self.state.registry;
        let mut active = BTreeMap::new();

        for client_id in selected {
            let Some(conn) = registry.conn(&client_id) else {
                registry.record_disconnect(&client_id);
                continue;
            };

            registry.set_state(&client_id, ConnState::InRound);
            let task = Outgoing::Task(round_id, Arc::clone(&self.state.model));

            if registry.send(&client_id, task) {
                active.insert(client_id, conn);
            } else {
                warn!(round_id = round_id, client_id = client_id.as_str(); "broadcast failed");
                registry.record_disconnect(&client_id);
            }
        }

        active
    }

    /// Waits for the results of the active clients until all of them
    /// answered or the deadline passes.
    ///
    /// Clients that didn't answer in time are dropped.
    async fn collect(
        &mut self,
        round_id: RoundId,
        mut active: BTreeMap<ClientId, ConnId>,
    ) -> BTreeMap<ClientId, ClientUpdate> {
        let deadline = Instant::now() + self.deadline;
        let mut received = BTreeMap::new();

        while received.len() < active.len() {
            let Some(events) = self.inbox.next_batch(deadline).await else {
                break;
            };

            for event in events {
                if let Some((conn, update)) = self.state.absorb(event) {
                    self.accept(round_id, &mut active, &mut received, conn, update);
                }
            }

            self.state.admit(self.policies);

            let registry = &self.state.registry;
            active.retain(|client_id, conn| {
                received.contains_key(client_id) || registry.conn(client_id) == Some(*conn)
            });
        }

        for client_id in active.keys().filter(|id| !received.contains_key(*id)) {
            info!(round_id = round_id, client_id = client_id.as_str(); "missed the round deadline");
            self.state.registry.record_disconnect(client_id);
        }

        self.release(&active);
        received
    }

    /// Decides whether a received update belongs to this round.
    fn accept(
        &mut self,
        round_id: RoundId,
        active: &mut BTreeMap<ClientId, ConnId>,
        received: &mut BTreeMap<ClientId, ClientUpdate>,
        conn: ConnId,
        update: ClientUpdate,
    ) {
        let client_id = &update.client_id;
        let registry = &mut self.state.registry;

        if update.round_id != round_id {
            debug!(round_id = round_id, client_id = client_id.as_str(); "discarded result of round {}", update.round_id);
            return;
        }

        let expected = active.get(client_id) == Some(&conn) && registry.conn(client_id) == Some(conn);
        if !expected || received.contains_key(client_id) {
            debug!(round_id = round_id, client_id = client_id.as_str(), conn = conn; "discarded unexpected result");
            return;
        }

        if let Err(e) = update.validate(self.state.model.layout()) {
            warn!(round_id = round_id, client_id = client_id.as_str(); "malformed update: {e}");
            registry.record_disconnect(client_id);
            active.remove(client_id);
            return;
        }

        received.insert(client_id.clone(), update);
    }

    /// Returns the clients still in the round to the connected pool.
    fn release(&mut self, active: &BTreeMap<ClientId, ConnId>) {
        let registry = &mut self.state.registry;

        for client_id in active.keys() {
            if registry.state(client_id) == Some(ConnState::InRound) {
                registry.set_state(client_id, ConnState::Connected);
            }
        }
    }

    /// Asks the weighting policy for the weight of every update.
    fn weigh(&self, updates: &[ClientUpdate]) -> std::result::Result<BTreeMap<ClientId, f64>, RoundFailure> {
        let registry = &self.state.registry;
        let empty = Metadata::new();

        let contributions: Vec<_> = updates
            .iter()
            .map(|update| Contribution {
                client_id: &update.client_id,
                deltas: &update.deltas,
                metadata: registry
                    .get(&update.client_id)
                    .map(|record| &record.metadata)
                    .unwrap_or(&empty),
            })
            .collect();

        Ok(self.policies.weigh(&contributions)?)
    }
}
