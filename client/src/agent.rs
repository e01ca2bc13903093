use std::{mem, sync::Arc, time::Duration};

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload, RoundResult},
};
use log::{debug, info, warn};
use model::{ClientUpdate, ModelState, RoundId};
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    task, time,
};

use crate::{
    checkpoint::{LocalCheckpoint, LocalState},
    config::ClientConfig,
    error::{ClientErr, Result},
    policy::LocalUpdatePolicy,
};

/// How a single connection to the server ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The server ended the session.
    Ended,
    /// The server's admission policy turned the client down.
    Rejected,
    /// The client participated in its configured amount of rounds and left.
    Left,
}

/// A federation participant.
///
/// Connects to the server, waits for round tasks, answers them with the
/// output of its `LocalUpdatePolicy` and reconnects whenever the connection
/// is lost.
pub struct ClientAgent {
    config: ClientConfig,
    policy: Arc<dyn LocalUpdatePolicy>,
    state: LocalState,
    store: Option<LocalCheckpoint>,
    admitted: bool,
}

impl ClientAgent {
    /// Creates a new agent, reloading its local state if it has a checkpoint.
    ///
    /// # Arguments
    /// * `config` - The client settings.
    /// * `policy` - Computes this client's update for every round.
    ///
    /// # Returns
    /// A new agent or a `ClientErr` if the config is invalid or the stored
    /// state can't be read.
    pub fn initialize(config: ClientConfig, policy: Box<dyn LocalUpdatePolicy>) -> Result<Self> {
        config.validate()?;

        let store = config.checkpoint_path.as_ref().map(LocalCheckpoint::new);
        let state = match store.as_ref().map(LocalCheckpoint::load).transpose()?.flatten() {
            Some(state) if state.client_id != config.client_id => {
                return Err(ClientErr::InvalidConfig(format!(
                    "the local checkpoint belongs to {}, not {}",
                    state.client_id, config.client_id
                )));
            }
            Some(state) => {
                info!(
                    client_id = config.client_id.as_str(),
                    rounds_completed = state.rounds_completed;
                    "resuming local state"
                );
                state
            }
            None => LocalState::new(config.client_id.clone()),
        };

        Ok(Self {
            config,
            policy: Arc::from(policy),
            state,
            store,
            admitted: false,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> &LocalState {
        &self.state
    }

    /// Participates in the server's session over tcp until it ends.
    ///
    /// Lost connections are retried with an exponential backoff, re-sending
    /// this client's metadata every time.
    ///
    /// # Returns
    /// How the last session ended, or a `ClientErr` if admission was rejected,
    /// the reconnect attempts ran out or the server broke the protocol.
    pub async fn start(&mut self) -> Result<SessionOutcome> {
        let mut failures = 0;

        loop {
            let res = match TcpStream::connect(&self.config.server_addr).await {
                Ok(stream) => {
                    let (rx, tx) = stream.into_split();
                    let (rx, tx) = comms::channel(rx, tx);
                    self.run_session(rx, tx).await
                }
                Err(e) => Err(e.into()),
            };

            if mem::take(&mut self.admitted) {
                failures = 0;
            }

            let e = match res {
                Ok(SessionOutcome::Rejected) => return Err(ClientErr::Rejected),
                Ok(outcome) => return Ok(outcome),
                Err(ClientErr::Io(e)) => e,
                Err(e) => return Err(e),
            };

            if let Some(max) = self.config.reconnect.max_attempts
                && failures >= max
            {
                warn!(client_id = self.config.client_id.as_str(); "giving up after {failures} reconnect attempts");
                return Err(e.into());
            }

            let backoff = self.backoff(failures);
            failures += 1;

            warn!(
                client_id = self.config.client_id.as_str(),
                attempt = failures;
                "connection lost: {e}, reconnecting in {backoff:?}"
            );
            time::sleep(backoff).await;
        }
    }

    /// Runs a single connection to the server.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    ///
    /// # Returns
    /// How the session ended, `ClientErr::Io` if the connection was lost.
    pub async fn run_session<R, W>(
        &mut self,
        mut rx: FrameReceiver<R>,
        mut tx: FrameSender<W>,
    ) -> Result<SessionOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let client_id = self.config.client_id.clone();
        let connect = Msg::Control(Command::Connect {
            client_id: client_id.clone(),
            metadata: self.config.metadata.clone(),
        });

        tx.send(&connect).await?;

        let mut buf: Vec<u32> = Vec::new();
        match rx.recv_into(&mut buf).await? {
            Msg::Control(Command::ConnectResponse { accepted: true }) => {
                info!(client_id = client_id.as_str(); "admitted");
                self.admitted = true;
            }
            Msg::Control(Command::ConnectResponse { accepted: false }) => {
                info!(client_id = client_id.as_str(); "admission rejected");
                return Ok(SessionOutcome::Rejected);
            }
            Msg::Control(Command::SessionEnd) => return Ok(SessionOutcome::Ended),
            Msg::Err(text) => return Err(ClientErr::Protocol(text.into_owned())),
            msg => {
                return Err(ClientErr::Protocol(format!(
                    "expected ConnectResponse, got {}",
                    msg.kind()
                )));
            }
        }

        let mut participated = 0;

        loop {
            if self.config.max_rounds.is_some_and(|max| participated >= max) {
                info!(client_id = client_id.as_str(); "leaving after {participated} rounds");
                tx.send(&Msg::Control(Command::Disconnect)).await?;
                tx.shutdown().await?;
                return Ok(SessionOutcome::Left);
            }

            let (round_id, model) = match rx.recv_into(&mut buf).await? {
                Msg::Data(Payload::Task(task)) => (task.round_id, task.to_model()?),
                Msg::Control(Command::SessionEnd) => {
                    info!(client_id = client_id.as_str(); "session ended");
                    return Ok(SessionOutcome::Ended);
                }
                Msg::Err(text) => {
                    warn!(client_id = client_id.as_str(); "server error: {text}");
                    continue;
                }
                msg => {
                    warn!(client_id = client_id.as_str(); "unexpected {} message", msg.kind());
                    continue;
                }
            };

            debug!(client_id = client_id.as_str(), round_id = round_id; "received round task");

            let Some(update) = self.local_update(round_id, model).await else {
                continue;
            };

            let msg = Msg::Data(Payload::Result(RoundResult::new(&update)));
            tx.send(&msg).await?;
            participated += 1;

            self.completed(round_id)?;
        }
    }

    /// Runs the local policy on the blocking pool and checks its output.
    ///
    /// # Returns
    /// The update to send, or `None` if this round has to be skipped.
    async fn local_update(&self, round_id: RoundId, model: ModelState) -> Option<ClientUpdate> {
        let client_id = &self.config.client_id;
        let policy = Arc::clone(&self.policy);

        let res = task::spawn_blocking(move || {
            let out = policy.update(round_id, &model);
            (model, out)
        })
        .await;

        let (model, out) = match res {
            Ok(res) => res,
            Err(e) => {
                warn!(client_id = client_id.as_str(), round_id = round_id; "local update panicked: {e}");
                return None;
            }
        };

        let (deltas, mask) = match out {
            Ok(out) => out,
            Err(e) => {
                warn!(client_id = client_id.as_str(), round_id = round_id; "local update failed: {e}");
                return None;
            }
        };

        let update = ClientUpdate {
            client_id: client_id.clone(),
            round_id,
            deltas,
            mask,
        };

        if let Err(e) = update.validate(model.layout()) {
            warn!(client_id = client_id.as_str(), round_id = round_id; "malformed local update: {e}");
            return None;
        }

        Some(update)
    }

    fn completed(&mut self, round_id: RoundId) -> Result<()> {
        self.state.last_round = Some(round_id);
        self.state.rounds_completed += 1;

        match &self.store {
            Some(store) => store.save(&self.state),
            None => Ok(()),
        }
    }

    /// The `failures`-th backoff, with up to a quarter of random jitter.
    fn backoff(&self, failures: u32) -> Duration {
        let base = self.config.reconnect.backoff(failures);
        let jitter = rand::rng().random_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter)
    }
}
