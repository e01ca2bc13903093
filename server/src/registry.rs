//! Known clients, their connection state and their audit trail.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info};
use model::{ClientId, Metadata, PolicyErr, RoundId};
use serde::Serialize;

use crate::{
    connection::{ConnId, Link, Outgoing},
    policy::{Candidate, PolicyHost},
};

/// The connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Disconnected,
    PendingAdmission,
    Connected,
    InRound,
    Dropped,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Disconnected => "disconnected",
            ConnState::PendingAdmission => "pending_admission",
            ConnState::Connected => "connected",
            ConnState::InRound => "in_round",
            ConnState::Dropped => "dropped",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientRecord {
    pub id: ClientId,
    pub state: ConnState,
    /// What the client reported on its current, or last, connection.
    pub metadata: Metadata,
    pub last_round: Option<RoundId>,
}

/// A single state change of a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub client_id: ClientId,
    /// `None` the first time the client is seen.
    pub from: Option<ConnState>,
    pub to: ConnState,
    pub at_ms: u64,
}

/// The outcome of an admission evaluation for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected,
}

/// Tracks every client the session has seen.
///
/// Records are only removed through `deregister`, a client that went away
/// stays visible with its last state.
pub struct ClientRegistry {
    records: BTreeMap<ClientId, ClientRecord>,
    links: HashMap<ClientId, Link>,
    transitions: VecDeque<Transition>,
    capacity: usize,
}

impl ClientRegistry {
    /// Creates a new `ClientRegistry`.
    ///
    /// # Arguments
    /// * `capacity` - How many transitions the audit log keeps.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            links: HashMap::new(),
            transitions: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Registers a connection attempt, the client waits for admission.
    ///
    /// A client that was already connected has its previous connection
    /// superseded, which closes it and drops any round slot it held.
    ///
    /// # Arguments
    /// * `client_id` - The connecting client.
    /// * `metadata` - What it reported about itself.
    /// * `link` - The new connection.
    pub fn request(&mut self, client_id: ClientId, metadata: Metadata, link: Link) {
        if let Some(old) = self.links.insert(client_id.clone(), link) {
            debug!(client_id = client_id.as_str(), conn = old.conn; "connection superseded");
        }

        match self.records.get_mut(&client_id) {
            Some(record) => record.metadata = metadata,
            None => {
                let record = ClientRecord {
                    id: client_id.clone(),
                    state: ConnState::Disconnected,
                    metadata,
                    last_round: None,
                };

                self.records.insert(client_id.clone(), record);
                self.log(&client_id, None, ConnState::Disconnected);
            }
        }

        self.transition(&client_id, ConnState::PendingAdmission);
    }

    /// The clients waiting for admission, in ascending id order.
    pub fn pending(&self) -> Vec<Candidate> {
        self.in_state(ConnState::PendingAdmission)
    }

    /// Evaluates the admission policy once over every pending client.
    ///
    /// Accepted clients become `Connected`, rejected ones are told so and
    /// their connection is closed. When the policy fails every client stays
    /// pending for the next evaluation.
    ///
    /// # Returns
    /// The decision taken for every pending client.
    pub fn admit_pending(
        &mut self,
        policies: &PolicyHost,
    ) -> Result<Vec<(ClientId, Admission)>, PolicyErr> {
        let pending = self.pending();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let accepted = policies.admit(&pending)?;
        let mut decisions = Vec::with_capacity(pending.len());

        for (client_id, _) in pending {
            if accepted.contains(&client_id) {
                self.transition(&client_id, ConnState::Connected);

                if !self.send(&client_id, Outgoing::Admission(true)) {
                    self.record_disconnect(&client_id);
                }

                info!(client_id = client_id.as_str(); "client admitted");
                decisions.push((client_id, Admission::Accepted));
            } else {
                if let Some(link) = self.links.remove(&client_id) {
                    link.send(Outgoing::Admission(false));
                }

                self.transition(&client_id, ConnState::Disconnected);
                info!(client_id = client_id.as_str(); "client rejected");
                decisions.push((client_id, Admission::Rejected));
            }
        }

        Ok(decisions)
    }

    /// Handles the close of connection `conn` of `client_id`.
    ///
    /// # Returns
    /// false if `conn` was already superseded and nothing changed.
    pub fn connection_closed(&mut self, client_id: &ClientId, conn: ConnId) -> bool {
        match self.links.get(client_id) {
            Some(link) if link.conn == conn => {
                self.record_disconnect(client_id);
                true
            }
            _ => false,
        }
    }

    /// Marks the client as dropped and closes its connection.
    ///
    /// It is no longer eligible, its history is kept.
    pub fn record_disconnect(&mut self, client_id: &ClientId) {
        self.links.remove(client_id);

        if self.records.contains_key(client_id) {
            self.transition(client_id, ConnState::Dropped);
        }
    }

    /// The clients that can be selected for a round, in ascending id order.
    pub fn eligible_clients(&self) -> Vec<Candidate> {
        self.in_state(ConnState::Connected)
    }

    /// The connection currently serving `client_id`.
    pub fn conn(&self, client_id: &ClientId) -> Option<ConnId> {
        self.links.get(client_id).map(|link| link.conn)
    }

    /// Queues `msg` on the client's connection.
    ///
    /// # Returns
    /// false if the client has no live connection.
    pub fn send(&self, client_id: &ClientId, msg: Outgoing) -> bool {
        self.links
            .get(client_id)
            .is_some_and(|link| link.send(msg))
    }

    /// Moves the client into or out of a round.
    pub fn set_state(&mut self, client_id: &ClientId, state: ConnState) {
        if self.records.contains_key(client_id) {
            self.transition(client_id, state);
        }
    }

    /// Records that the client took part in `round_id`.
    pub fn participated(&mut self, client_id: &ClientId, round_id: RoundId) {
        if let Some(record) = self.records.get_mut(client_id) {
            record.last_round = Some(round_id);
        }
    }

    /// Removes every trace of the client, closing its connection.
    pub fn deregister(&mut self, client_id: &ClientId) -> Option<ClientRecord> {
        self.links.remove(client_id);
        self.records.remove(client_id)
    }

    /// Closes every connection, records keep their state.
    pub fn close_all(&mut self) {
        self.links.clear();
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&ClientRecord> {
        self.records.get(client_id)
    }

    pub fn state(&self, client_id: &ClientId) -> Option<ConnState> {
        self.records.get(client_id).map(|record| record.state)
    }

    pub fn records(&self) -> impl Iterator<Item = &ClientRecord> {
        self.records.values()
    }

    /// The most recent transitions, oldest first.
    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter()
    }

    /// Counts the clients in `state`.
    pub fn count(&self, state: ConnState) -> usize {
        self.records.values().filter(|r| r.state == state).count()
    }

    fn in_state(&self, state: ConnState) -> Vec<Candidate> {
        self.records
            .values()
            .filter(|record| record.state == state)
            .map(|record| (record.id.clone(), record.metadata.clone()))
            .collect()
    }

    fn transition(&mut self, client_id: &ClientId, to: ConnState) {
        let Some(record) = self.records.get_mut(client_id) else {
            return;
        };

        let from = record.state;
        if from == to {
            return;
        }

        record.state = to;
        self.log(client_id, Some(from), to);
    }

    fn log(&mut self, client_id: &ClientId, from: Option<ConnState>, to: ConnState) {
        if self.capacity == 0 {
            return;
        }

        if self.transitions.len() == self.capacity {
            self.transitions.pop_front();
        }

        self.transitions.push_back(Transition {
            client_id: client_id.clone(),
            from,
            to,
            at_ms: now_ms(),
        });
    }
}

/// Milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use model::Scalar;
    use tokio::sync::mpsc;

    use super::*;
    use crate::policy::{AcceptAll, RequireKeys, SelectAll, Uniform};

    fn link(conn: ConnId) -> (Link, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Link::new(conn, tx), rx)
    }

    #[test]
    fn admission_is_evaluated_per_batch() {
        let mut registry = ClientRegistry::new(16);
        let policies = PolicyHost::new(RequireKeys::new(vec!["token".into()]), SelectAll, Uniform);

        let mut metadata = Metadata::new();
        metadata.insert("token".into(), Scalar::from("x"));

        let (a, mut a_rx) = link(0);
        let (b, mut b_rx) = link(1);
        registry.request("a".into(), metadata, a);
        registry.request("b".into(), Metadata::new(), b);

        let decisions = registry.admit_pending(&policies).unwrap();
        assert_eq!(
            decisions,
            vec![
                (ClientId::from("a"), Admission::Accepted),
                (ClientId::from("b"), Admission::Rejected),
            ]
        );

        assert!(matches!(a_rx.try_recv(), Ok(Outgoing::Admission(true))));
        assert!(matches!(b_rx.try_recv(), Ok(Outgoing::Admission(false))));
        // b's link was dropped, its connection closes.
        assert!(b_rx.try_recv().is_err());

        let eligible: Vec<_> = registry.eligible_clients().into_iter().map(|(id, _)| id).collect();
        assert_eq!(eligible, vec![ClientId::from("a")]);
        assert_eq!(registry.state(&"b".into()), Some(ConnState::Disconnected));
    }

    #[test]
    fn superseded_connection_close_is_ignored() {
        let mut registry = ClientRegistry::new(16);
        let policies = PolicyHost::new(AcceptAll, SelectAll, Uniform);

        let (first, _first_rx) = link(0);
        registry.request("a".into(), Metadata::new(), first);
        registry.admit_pending(&policies).unwrap();

        let (second, _second_rx) = link(1);
        registry.request("a".into(), Metadata::new(), second);
        assert_eq!(registry.state(&"a".into()), Some(ConnState::PendingAdmission));

        assert!(!registry.connection_closed(&"a".into(), 0));
        assert_eq!(registry.conn(&"a".into()), Some(1));

        assert!(registry.connection_closed(&"a".into(), 1));
        assert_eq!(registry.state(&"a".into()), Some(ConnState::Dropped));
        assert!(registry.get(&"a".into()).is_some());
    }

    #[test]
    fn transition_log_is_bounded() {
        let mut registry = ClientRegistry::new(3);

        let (a, _rx) = link(0);
        registry.request("a".into(), Metadata::new(), a);
        registry.record_disconnect(&"a".into());

        let log: Vec<_> = registry.transitions().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            log,
            vec![
                (None, ConnState::Disconnected),
                (Some(ConnState::Disconnected), ConnState::PendingAdmission),
                (Some(ConnState::PendingAdmission), ConnState::Dropped),
            ]
        );

        registry.set_state(&"a".into(), ConnState::Connected);
        assert_eq!(registry.transitions().count(), 3);
        assert_eq!(
            registry.transitions().last().map(|t| t.to),
            Some(ConnState::Connected)
        );
    }

    #[test]
    fn deregister_is_the_only_removal() {
        let mut registry = ClientRegistry::new(0);
        let (a, _rx) = link(0);
        registry.request("a".into(), Metadata::new(), a);
        registry.record_disconnect(&"a".into());

        assert_eq!(registry.records().count(), 1);
        assert!(registry.deregister(&"a".into()).is_some());
        assert_eq!(registry.records().count(), 0);
    }
}
