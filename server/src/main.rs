use std::{env, io};

use log::{info, warn};
use server::{PolicyBuilder, ServerConfig, SessionCoordinator};
use tokio::{net::TcpListener, signal};

const CONFIG_VAR: &str = "FL_SERVER_CONFIG";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_VAR).ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("usage: fl-server <config.json> (or set {CONFIG_VAR})"),
            )
        })?;

    let config = ServerConfig::from_path(path)?;

    let policies = PolicyBuilder::new().build(&config.policies)?;
    let coordinator = SessionCoordinator::initialize(config.session()?, policies)?;
    let handle = coordinator.handle();

    let list = TcpListener::bind(&config.listen_addr).await?;
    info!("listening at {}", config.listen_addr);

    let session = tokio::spawn(coordinator.start());

    loop {
        tokio::select! {
            accepted = list.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept a connection: {e}");
                        continue;
                    }
                };

                let (rx, tx) = stream.into_split();
                let (rx, tx) = comms::channel(rx, tx);
                let conn = handle.spawn(rx, tx);
                info!(conn = conn; "client connected from {addr}");
            }
            _ = handle.closed() => break,
            _ = signal::ctrl_c() => {
                info!("received SIGINT, stopping the session");
                handle.request_stop();
                break;
            }
        }
    }

    let report = session.await.map_err(io::Error::other)??;
    info!(
        rounds = report.next_round;
        "session {} {}", report.server_id, report.status
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(io::Error::other)?
    );

    Ok(())
}
