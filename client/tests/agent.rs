use client::{
    ClientAgent, ClientConfig, ClientErr, ReconnectConfig, SessionOutcome,
    policy::{Constant, Noop},
};
use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload, Task},
};
use model::{ClientUpdate, Layout, Mask, ModelState, PolicyErr, RoundId, Scalar, Tensors};
use tokio::{
    io::{self, DuplexStream, ReadHalf, WriteHalf},
    net::TcpListener,
};

const SIZE: usize = 1 << 16;

type Rx<S> = FrameReceiver<ReadHalf<S>>;
type Tx<S> = FrameSender<WriteHalf<S>>;

fn pipe() -> ((Rx<DuplexStream>, Tx<DuplexStream>), (Rx<DuplexStream>, Tx<DuplexStream>)) {
    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let client = comms::channel(rx, tx);
    let (rx, tx) = io::split(two);
    let server = comms::channel(rx, tx);
    (client, server)
}

fn model() -> ModelState {
    Tensors::filled(Layout::new(vec![vec![2], vec![]]), 1.)
}

/// Expects a `Connect` from `client_id` and answers it.
async fn admit<R, W>(rx: &mut FrameReceiver<R>, tx: &mut FrameSender<W>, client_id: &str, accepted: bool)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf: Vec<u32> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Control(Command::Connect { client_id: id, .. }) => assert_eq!(id.as_str(), client_id),
        msg => panic!("expected Connect, got {msg:?}"),
    }

    let msg = Msg::Control(Command::ConnectResponse { accepted });
    tx.send(&msg).await.unwrap();
}

async fn push_task(tx: &mut Tx<DuplexStream>, round_id: RoundId, model: &ModelState) {
    tx.send(&Msg::Data(Payload::Task(Task::new(round_id, model))))
        .await
        .unwrap();
}

async fn pull_result(rx: &mut Rx<DuplexStream>) -> ClientUpdate {
    let mut buf: Vec<u32> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Data(Payload::Result(result)) => result.to_update().unwrap(),
        msg => panic!("expected a result, got {msg:?}"),
    }
}

async fn end_session(tx: &mut Tx<DuplexStream>) {
    tx.send(&Msg::Control(Command::SessionEnd)).await.unwrap();
}

#[tokio::test]
async fn answers_every_task_until_the_session_ends() {
    let ((crx, ctx), (mut srx, mut stx)) = pipe();
    let mut agent =
        ClientAgent::initialize(ClientConfig::new("a", "unused"), Box::new(Constant::new(0.5))).unwrap();
    let model = model();

    let server = async {
        admit(&mut srx, &mut stx, "a", true).await;

        let mut updates = Vec::new();
        for round_id in 0..3 {
            push_task(&mut stx, round_id, &model).await;
            updates.push(pull_result(&mut srx).await);
        }

        end_session(&mut stx).await;
        updates
    };

    let (outcome, updates) = tokio::join!(agent.run_session(crx, ctx), server);

    assert_eq!(outcome.unwrap(), SessionOutcome::Ended);
    assert_eq!(updates.len(), 3);

    for (round_id, update) in (0..).zip(&updates) {
        assert_eq!(update.round_id, round_id);
        assert_eq!(update.client_id.as_str(), "a");
        assert_eq!(update.deltas.values(), &[0.5, 0.5, 0.5]);
        assert!(update.mask.is_all_ones());
    }

    assert_eq!(agent.state().rounds_completed, 3);
    assert_eq!(agent.state().last_round, Some(2));
}

#[tokio::test]
async fn metadata_is_sent_with_the_connect() {
    let ((crx, ctx), (mut srx, mut stx)) = pipe();

    let mut config = ClientConfig::new("b", "unused");
    config.metadata.insert("num_examples".into(), Scalar::Int(42));
    let mut agent = ClientAgent::initialize(config, Box::new(Noop)).unwrap();

    let server = async {
        let mut buf: Vec<u32> = Vec::new();
        let metadata = match srx.recv_into(&mut buf).await.unwrap() {
            Msg::Control(Command::Connect { metadata, .. }) => metadata,
            msg => panic!("expected Connect, got {msg:?}"),
        };

        stx.send(&Msg::Control(Command::ConnectResponse { accepted: false }))
            .await
            .unwrap();
        metadata
    };

    let (outcome, metadata) = tokio::join!(agent.run_session(crx, ctx), server);

    assert_eq!(outcome.unwrap(), SessionOutcome::Rejected);
    assert_eq!(metadata["num_examples"], Scalar::Int(42));
}

#[tokio::test]
async fn failed_and_malformed_local_updates_skip_the_round() {
    let ((crx, ctx), (mut srx, mut stx)) = pipe();

    let policy = |round_id: RoundId, model: &ModelState| -> Result<(Tensors, Mask), PolicyErr> {
        let layout = model.layout();
        match round_id {
            1 => Err(PolicyErr::new("out of memory")),
            2 => Ok((Tensors::zeros(layout.clone()), Mask::from_layers([vec![1., 0., 1.]]))),
            _ => Ok((Tensors::filled(layout.clone(), 1.), Mask::ones(layout))),
        }
    };

    let mut agent = ClientAgent::initialize(ClientConfig::new("c", "unused"), Box::new(policy)).unwrap();
    let model = model();

    let server = async {
        admit(&mut srx, &mut stx, "c", true).await;

        for round_id in 0..4 {
            push_task(&mut stx, round_id, &model).await;
        }

        let first = pull_result(&mut srx).await;
        let second = pull_result(&mut srx).await;
        end_session(&mut stx).await;
        (first.round_id, second.round_id)
    };

    let (outcome, answered) = tokio::join!(agent.run_session(crx, ctx), server);

    assert_eq!(outcome.unwrap(), SessionOutcome::Ended);
    assert_eq!(answered, (0, 3));
    assert_eq!(agent.state().rounds_completed, 2);
}

#[tokio::test]
async fn leaves_after_max_rounds() {
    let ((crx, ctx), (mut srx, mut stx)) = pipe();

    let mut config = ClientConfig::new("d", "unused");
    config.max_rounds = Some(1);
    let mut agent = ClientAgent::initialize(config, Box::new(Noop)).unwrap();
    let model = model();

    let server = async {
        admit(&mut srx, &mut stx, "d", true).await;
        push_task(&mut stx, 0, &model).await;
        pull_result(&mut srx).await;

        let mut buf: Vec<u32> = Vec::new();
        let msg: Msg = srx.recv_into(&mut buf).await.unwrap();
        matches!(msg, Msg::Control(Command::Disconnect))
    };

    let (outcome, disconnected) = tokio::join!(agent.run_session(crx, ctx), server);

    assert_eq!(outcome.unwrap(), SessionOutcome::Left);
    assert!(disconnected);
}

#[tokio::test]
async fn lost_connection_is_an_io_error() {
    let ((crx, ctx), (mut srx, mut stx)) = pipe();
    let mut agent = ClientAgent::initialize(ClientConfig::new("e", "unused"), Box::new(Noop)).unwrap();

    let server = async move {
        admit(&mut srx, &mut stx, "e", true).await;
        drop((srx, stx));
    };

    let (outcome, ()) = tokio::join!(agent.run_session(crx, ctx), server);

    match outcome {
        Err(ClientErr::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
        other => panic!("expected an io error, got {other:?}"),
    }
}

#[tokio::test]
async fn local_state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ClientConfig::new("f", "unused");
    config.checkpoint_path = Some(dir.path().join("state.json"));

    let ((crx, ctx), (mut srx, mut stx)) = pipe();
    let mut agent = ClientAgent::initialize(config.clone(), Box::new(Noop)).unwrap();
    let model = model();

    let server = async {
        admit(&mut srx, &mut stx, "f", true).await;
        for round_id in [4, 5] {
            push_task(&mut stx, round_id, &model).await;
            pull_result(&mut srx).await;
        }
        end_session(&mut stx).await;
    };

    let (outcome, ()) = tokio::join!(agent.run_session(crx, ctx), server);
    assert_eq!(outcome.unwrap(), SessionOutcome::Ended);

    let restarted = ClientAgent::initialize(config.clone(), Box::new(Noop)).unwrap();
    assert_eq!(restarted.state().rounds_completed, 2);
    assert_eq!(restarted.state().last_round, Some(5));

    config.client_id = "someone-else".into();
    let err = ClientAgent::initialize(config, Box::new(Noop)).err().unwrap();
    assert!(matches!(err, ClientErr::InvalidConfig(_)));
}

#[tokio::test]
async fn reconnects_after_losing_the_server() {
    let list = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = list.local_addr().unwrap();

    let mut config = ClientConfig::new("g", addr.to_string());
    config.reconnect = ReconnectConfig {
        initial_backoff_ms: 10,
        max_backoff_ms: 20,
        max_attempts: Some(3),
    };
    let mut agent = ClientAgent::initialize(config, Box::new(Noop)).unwrap();

    let server = async {
        let (stream, _) = list.accept().await.unwrap();
        let (rx, tx) = stream.into_split();
        let (mut rx, mut tx) = comms::channel(rx, tx);
        admit(&mut rx, &mut tx, "g", true).await;
        drop((rx, tx));

        let (stream, _) = list.accept().await.unwrap();
        let (rx, tx) = stream.into_split();
        let (mut rx, mut tx) = comms::channel(rx, tx);
        admit(&mut rx, &mut tx, "g", true).await;
        tx.send(&Msg::Control(Command::SessionEnd)).await.unwrap();
    };

    let (outcome, ()) = tokio::join!(agent.start(), server);
    assert_eq!(outcome.unwrap(), SessionOutcome::Ended);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let list = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = list.local_addr().unwrap();
    drop(list);

    let mut config = ClientConfig::new("h", addr.to_string());
    config.reconnect = ReconnectConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
        max_attempts: Some(2),
    };
    let mut agent = ClientAgent::initialize(config, Box::new(Noop)).unwrap();

    assert!(matches!(agent.start().await, Err(ClientErr::Io(_))));
}
