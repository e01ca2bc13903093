//! The session coordinator: admission, the round loop, and its observable report.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use comms::{FrameReceiver, FrameSender};
use log::{debug, info, warn};
use model::{ClientUpdate, ModelState, RoundId};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::{self, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    checkpoint::CheckpointStore,
    config::SessionConfig,
    connection::{self, ConnId, Event, Link},
    error::{Result, SessionErr},
    policy::PolicyHost,
    registry::{ClientRecord, ClientRegistry, ConnState},
    round::{Persistence, RoundManager, RoundRecord, RoundStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    AwaitingQuorum,
    RoundActive,
    Completed,
    Aborted,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::AwaitingQuorum => "awaiting_quorum",
            SessionStatus::RoundActive => "round_active",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        };

        f.write_str(name)
    }
}

/// The only mutable state of a session.
pub struct SessionState {
    pub(crate) next_round: RoundId,
    pub(crate) model: Arc<ModelState>,
    pub(crate) registry: ClientRegistry,
    pub(crate) status: SessionStatus,
}

impl SessionState {
    /// The id the next round will run with.
    pub fn next_round(&self) -> RoundId {
        self.next_round
    }

    /// The current model.
    pub fn model(&self) -> &Arc<ModelState> {
        &self.model
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Applies a connection event to the registry.
    ///
    /// # Returns
    /// The received update, for `Result` events.
    pub(crate) fn absorb(&mut self, event: Event) -> Option<(ConnId, ClientUpdate)> {
        match event {
            Event::Connected {
                conn,
                client_id,
                metadata,
                outbox,
            } => {
                self.registry
                    .request(client_id, metadata, Link::new(conn, outbox));
                None
            }
            Event::Closed { conn, client_id } => {
                if self.registry.connection_closed(&client_id, conn) {
                    info!(client_id = client_id.as_str(), conn = conn; "client dropped");
                }

                None
            }
            Event::Result { conn, update } => Some((conn, update)),
        }
    }

    /// Evaluates the admission policy over the pending clients.
    pub(crate) fn admit(&mut self, policies: &PolicyHost) {
        if let Err(e) = self.registry.admit_pending(policies) {
            warn!("admission policy failed, clients stay pending: {e}");
        }
    }

    /// Absorbs a batch of events outside of a round's collection.
    fn absorb_idle(&mut self, events: Vec<Event>, policies: &PolicyHost) {
        for event in events {
            if let Some((conn, update)) = self.absorb(event) {
                debug!(
                    client_id = update.client_id.as_str(),
                    conn = conn;
                    "discarded late result of round {}", update.round_id
                );
            }
        }

        self.admit(policies);
    }
}

/// The coordinator's end of the connection event queue.
pub(crate) struct Inbox {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Inbox {
    /// Waits for at least one event, then drains every queued one.
    ///
    /// # Returns
    /// The events in arrival order or `None` once `until` passes.
    pub(crate) async fn next_batch(&mut self, until: Instant) -> Option<Vec<Event>> {
        let first = match time::timeout_at(until, self.rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                time::sleep_until(until).await;
                return None;
            }
            Err(_) => return None,
        };

        let mut events = vec![first];
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }

        Some(events)
    }
}

/// A snapshot of the session, as seen from the outside.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub server_id: String,
    pub status: SessionStatus,
    pub next_round: RoundId,
    /// The round the session was resumed from, if any.
    pub resumed_from: Option<RoundId>,
    /// Every attempt, committed or failed, in order.
    pub rounds: Vec<RoundRecord>,
    pub clients: Vec<ClientRecord>,
    /// The reason of the last failure, or of the abort.
    pub reason: Option<String>,
}

impl SessionReport {
    /// The committed rounds, in order.
    pub fn committed(&self) -> impl Iterator<Item = &RoundRecord> {
        self.rounds
            .iter()
            .filter(|record| record.status == RoundStatus::Committed)
    }
}

/// A cloneable handle to a running session.
///
/// Connections are handed to the session through it, and its report can be
/// read at any time.
#[derive(Clone)]
pub struct SessionHandle {
    report: Arc<RwLock<SessionReport>>,
    events: mpsc::UnboundedSender<Event>,
    closing: CancellationToken,
    stop: CancellationToken,
    tracker: TaskTracker,
    next_conn: Arc<AtomicU64>,
}

impl SessionHandle {
    /// Binds a new client connection to the session and spawns its worker.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    ///
    /// # Returns
    /// The id of the new connection.
    pub fn spawn<R, W>(&self, rx: FrameReceiver<R>, tx: FrameSender<W>) -> ConnId
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let events = self.events.clone();
        let closing = self.closing.clone();

        self.tracker.spawn(async move {
            if let Err(e) = connection::serve(conn, rx, tx, events, closing).await {
                debug!(conn = conn; "connection worker failed: {e}");
            }
        });

        conn
    }

    pub fn report(&self) -> SessionReport {
        self.report.read().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.report.read().status
    }

    /// Asks the session to stop between rounds, it ends as aborted.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Whether the session reached a terminal state.
    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Waits until the session reaches a terminal state.
    pub async fn closed(&self) {
        self.closing.cancelled().await
    }

    fn update(&self, f: impl FnOnce(&mut SessionReport)) {
        f(&mut self.report.write());
    }
}

/// Owns the session lifecycle across rounds.
pub struct SessionCoordinator {
    config: SessionConfig,
    policies: PolicyHost,
    store: Option<CheckpointStore>,
    state: SessionState,
    inbox: Inbox,
    handle: SessionHandle,
}

impl SessionCoordinator {
    /// Creates a new session, resuming from the latest checkpoint if there is one.
    ///
    /// # Arguments
    /// * `config` - The session settings.
    /// * `policies` - The operator policies.
    ///
    /// # Returns
    /// The coordinator or a `SessionErr` if the config is invalid or the
    /// checkpoint can't be read.
    pub fn initialize(config: SessionConfig, policies: PolicyHost) -> Result<Self> {
        config.validate()?;

        let store = config
            .checkpoint
            .as_ref()
            .map(|ckpt| CheckpointStore::open(&ckpt.path, ckpt.keep_last))
            .transpose()?;

        let mut model = config.initial_model.clone();
        let mut next_round = 0;
        let mut resumed_from = None;

        if let Some(latest) = store.as_ref().map(CheckpointStore::load_latest).transpose()?.flatten() {
            if latest.server_id != config.server_id {
                warn!("resuming from a checkpoint of server {}", latest.server_id);
            }

            if latest.model.layout() != config.initial_model.layout() {
                warn!(round_id = latest.round_id; "checkpointed model layout differs from the configured one");
            }

            info!(round_id = latest.round_id; "resuming from checkpoint");
            next_round = latest.round_id + 1;
            resumed_from = Some(latest.round_id);
            model = latest.model;
        }

        let (events, rx) = mpsc::unbounded_channel();
        let report = SessionReport {
            server_id: config.server_id.clone(),
            status: SessionStatus::Initializing,
            next_round,
            resumed_from,
            rounds: Vec::new(),
            clients: Vec::new(),
            reason: None,
        };

        let handle = SessionHandle {
            report: Arc::new(RwLock::new(report)),
            events,
            closing: CancellationToken::new(),
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_conn: Arc::new(AtomicU64::new(0)),
        };

        let state = SessionState {
            next_round,
            model: Arc::new(model),
            registry: ClientRegistry::new(config.transition_log_capacity),
            status: SessionStatus::Initializing,
        };

        Ok(Self {
            config,
            policies,
            store,
            state,
            inbox: Inbox { rx },
            handle,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Runs the session to completion.
    ///
    /// On return every connection was told the session ended and closed.
    ///
    /// # Returns
    /// The final report once `Completed`, or why the session was aborted.
    pub async fn start(mut self) -> Result<SessionReport> {
        let res = self.run().await;

        let status = match &res {
            Ok(()) => SessionStatus::Completed,
            Err(_) => SessionStatus::Aborted,
        };

        match &res {
            Ok(()) => info!(rounds = self.state.next_round; "session completed"),
            Err(e) => warn!("session aborted: {e}"),
        }

        self.set_status(status);
        if let Err(e) = &res {
            let reason = e.to_string();
            self.handle.update(|report| report.reason = Some(reason));
        }

        self.handle.closing.cancel();
        self.state.registry.close_all();
        self.handle.tracker.close();
        self.handle.tracker.wait().await;

        res.map(|()| self.handle.report())
    }

    async fn run(&mut self) -> Result<()> {
        self.set_status(SessionStatus::AwaitingQuorum);
        self.await_quorum().await?;
        self.set_status(SessionStatus::RoundActive);

        let mut attempt = 0;
        while self.state.next_round < self.config.num_rounds {
            if self.handle.stop.is_cancelled() {
                return Err(SessionErr::Stopped);
            }

            if let Some(events) = self.inbox.next_batch(Instant::now()).await {
                self.state.absorb_idle(events, &self.policies);
            }

            let round_id = self.state.next_round;
            let manager = RoundManager {
                state: &mut self.state,
                policies: &self.policies,
                inbox: &mut self.inbox,
                persistence: self.store.as_ref().map(|store| Persistence {
                    store,
                    server_id: &self.config.server_id,
                    archive_updates: self
                        .config
                        .checkpoint
                        .as_ref()
                        .is_some_and(|ckpt| ckpt.archive_updates),
                }),
                min_clients: self.config.min_connected_clients,
                deadline: self.config.round_deadline,
            };

            let record = manager.run(attempt).await?;
            let failure = record.failure.clone();
            self.publish(record);

            let Some(reason) = failure else {
                attempt = 0;
                continue;
            };

            attempt += 1;
            if attempt > self.config.retry_limit {
                return Err(SessionErr::Aborted { round_id, reason });
            }

            self.idle(self.config.retry_backoff).await?;
        }

        Ok(())
    }

    /// Blocks until enough clients are connected or the admission timeout passes.
    async fn await_quorum(&mut self) -> Result<()> {
        let until = Instant::now() + self.config.admission_timeout;
        let required = self.config.min_connected_clients;

        loop {
            let connected = self.state.registry.count(ConnState::Connected);
            if connected >= required {
                info!(connected = connected; "quorum reached");
                return Ok(());
            }

            let stop = self.handle.stop.clone();
            let events = tokio::select! {
                events = self.inbox.next_batch(until) => events,
                _ = stop.cancelled() => return Err(SessionErr::Stopped),
            };

            match events {
                Some(events) => self.state.absorb_idle(events, &self.policies),
                None => return Err(SessionErr::QuorumNotMet { connected, required }),
            }
        }
    }

    /// Keeps servicing connections for `backoff`.
    async fn idle(&mut self, backoff: time::Duration) -> Result<()> {
        let until = Instant::now() + backoff;
        let stop = self.handle.stop.clone();

        loop {
            let events = tokio::select! {
                events = self.inbox.next_batch(until) => events,
                _ = stop.cancelled() => return Err(SessionErr::Stopped),
            };

            match events {
                Some(events) => self.state.absorb_idle(events, &self.policies),
                None => return Ok(()),
            }
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.state.status = status;
        let clients: Vec<_> = self.state.registry.records().cloned().collect();

        self.handle.update(|report| {
            report.status = status;
            report.clients = clients;
        });
    }

    fn publish(&self, record: RoundRecord) {
        let next_round = self.state.next_round;
        let clients: Vec<_> = self.state.registry.records().cloned().collect();

        self.handle.update(|report| {
            if let Some(reason) = &record.failure {
                report.reason = Some(reason.clone());
            }

            report.next_round = next_round;
            report.clients = clients;
            report.rounds.push(record);
        });
    }
}
