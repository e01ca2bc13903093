//! Per connection workers.
//!
//! Every connection is served by its own task. The task only talks to the
//! coordinator through the event queue and its outbox, it never touches the
//! session state.

use std::{io, sync::Arc};

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload, Task},
};
use log::{debug, warn};
use model::{ClientId, ClientUpdate, Metadata, ModelState, RoundId};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// Identifies a single connection, a reconnecting client gets a new one.
pub type ConnId = u64;

/// What a connection worker reports to the coordinator.
#[derive(Debug)]
pub enum Event {
    Connected {
        conn: ConnId,
        client_id: ClientId,
        metadata: Metadata,
        outbox: Outbox,
    },
    Result {
        conn: ConnId,
        update: ClientUpdate,
    },
    Closed {
        conn: ConnId,
        client_id: ClientId,
    },
}

/// What the coordinator asks a connection worker to send.
#[derive(Debug)]
pub enum Outgoing {
    Admission(bool),
    Task(RoundId, Arc<ModelState>),
}

pub type Outbox = mpsc::UnboundedSender<Outgoing>;

/// The coordinator's side of an admitted or pending connection.
///
/// Dropping it closes the connection once its queued messages are sent.
#[derive(Debug)]
pub struct Link {
    pub conn: ConnId,
    outbox: Outbox,
}

impl Link {
    pub fn new(conn: ConnId, outbox: Outbox) -> Self {
        Self { conn, outbox }
    }

    /// Queues `msg` for sending.
    ///
    /// # Returns
    /// false if the connection worker is already gone.
    pub fn send(&self, msg: Outgoing) -> bool {
        self.outbox.send(msg).is_ok()
    }
}

/// Serves a single client connection until it closes or the session ends.
///
/// # Arguments
/// * `conn` - The id of this connection.
/// * `rx` - The receiving end of the communication.
/// * `tx` - The sending end of the communication.
/// * `events` - The coordinator's event queue.
/// * `closing` - Cancelled when the session reaches a terminal state.
pub async fn serve<R, W>(
    conn: ConnId,
    mut rx: FrameReceiver<R>,
    mut tx: FrameSender<W>,
    events: mpsc::UnboundedSender<Event>,
    closing: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf: Vec<u32> = Vec::new();

    let first = tokio::select! {
        msg = rx.recv_into::<Msg, _>(&mut buf) => msg?,
        _ = closing.cancelled() => {
            tx.send(&Msg::Control(Command::SessionEnd)).await?;
            return tx.shutdown().await;
        }
    };

    let Msg::Control(Command::Connect {
        client_id,
        metadata,
    }) = first
    else {
        let kind = first.kind();
        warn!(conn = conn; "expected Connect, got {kind}");
        let text = format!("expected Connect, got {kind}");
        tx.send(&Msg::Err(text.into())).await?;
        return tx.shutdown().await;
    };

    debug!(conn = conn, client_id = client_id.as_str(); "connect request");

    let (outbox, inbox) = mpsc::unbounded_channel();
    let connected = Event::Connected {
        conn,
        client_id: client_id.clone(),
        metadata,
        outbox,
    };

    if events.send(connected).is_err() {
        return Ok(());
    }

    let res = tokio::select! {
        res = read_loop(conn, &client_id, rx, buf, &events) => res,
        res = write_loop(&mut tx, inbox, &closing) => res,
    };

    if let Err(e) = &res {
        debug!(conn = conn, client_id = client_id.as_str(); "connection ended: {e}");
    }

    let _ = events.send(Event::Closed { conn, client_id });
    let _ = tx.shutdown().await;
    res
}

/// Decodes the client's messages and forwards its results.
async fn read_loop<R>(
    conn: ConnId,
    client_id: &ClientId,
    mut rx: FrameReceiver<R>,
    mut buf: Vec<u32>,
    events: &mpsc::UnboundedSender<Event>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        match rx.recv_into::<Msg, _>(&mut buf).await? {
            Msg::Data(Payload::Result(result)) => {
                if &*result.client_id != client_id {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{client_id} sent a result as {}", result.client_id),
                    ));
                }

                let update = result.to_update()?;
                if events.send(Event::Result { conn, update }).is_err() {
                    return Ok(());
                }
            }
            Msg::Control(Command::Disconnect) => {
                debug!(conn = conn, client_id = client_id.as_str(); "client disconnected");
                return Ok(());
            }
            Msg::Err(text) => warn!(conn = conn, client_id = client_id.as_str(); "client error: {text}"),
            msg => warn!(conn = conn, client_id = client_id.as_str(); "unexpected {} message", msg.kind()),
        }
    }
}

/// Sends what the coordinator queues, then `SessionEnd` once the session closes.
async fn write_loop<W>(
    tx: &mut FrameSender<W>,
    mut inbox: mpsc::UnboundedReceiver<Outgoing>,
    closing: &CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = closing.cancelled() => None,
            next = inbox.recv() => next,
        };

        let Some(next) = next else {
            if closing.is_cancelled() {
                // Admission answers still go out, tasks of a finished session don't.
                while let Ok(queued) = inbox.try_recv() {
                    if let Outgoing::Admission(accepted) = queued {
                        let msg = Msg::Control(Command::ConnectResponse { accepted });
                        tx.send(&msg).await?;
                    }
                }

                tx.send(&Msg::Control(Command::SessionEnd)).await?;
            }

            return Ok(());
        };

        match next {
            Outgoing::Admission(accepted) => {
                let msg = Msg::Control(Command::ConnectResponse { accepted });
                tx.send(&msg).await?;
            }
            Outgoing::Task(round_id, model) => {
                let msg = Msg::Data(Payload::Task(Task::new(round_id, &model)));
                tx.send(&msg).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use model::{Layout, Tensors};
    use tokio::io;

    use super::*;

    #[tokio::test]
    async fn closing_flushes_admissions_but_not_tasks() {
        let (one, two) = io::duplex(1 << 16);
        let (rx, tx) = io::split(one);
        let (_, mut tx) = comms::channel(rx, tx);

        let (outbox, inbox) = mpsc::unbounded_channel();
        let model = Arc::new(Tensors::zeros(Layout::new(vec![vec![1]])));
        outbox.send(Outgoing::Task(0, model)).unwrap();
        outbox.send(Outgoing::Admission(true)).unwrap();

        let closing = CancellationToken::new();
        closing.cancel();
        write_loop(&mut tx, inbox, &closing).await.unwrap();
        drop(tx);

        let (rx, tx) = io::split(two);
        let (mut rx, _) = comms::channel(rx, tx);
        let mut buf: Vec<u32> = Vec::new();
        let mut sent = Vec::new();

        while let Ok(msg) = rx.recv_into::<Msg, _>(&mut buf).await {
            match msg {
                Msg::Control(cmd) => sent.push(cmd),
                msg => panic!("unexpected {} message", msg.kind()),
            }
        }

        assert_eq!(
            sent,
            vec![Command::ConnectResponse { accepted: true }, Command::SessionEnd]
        );
    }
}
