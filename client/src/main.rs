use std::{env, io};

use client::{ClientAgent, ClientConfig, policy};
use log::info;
use tokio::signal;

const CONFIG_VAR: &str = "FL_CLIENT_CONFIG";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_VAR).ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("usage: fl-client <config.json> (or set {CONFIG_VAR})"),
            )
        })?;

    let config = ClientConfig::from_path(path)?;
    let policy = policy::from_spec(&config.policy);
    let mut agent = ClientAgent::initialize(config, policy)?;

    tokio::select! {
        outcome = agent.start() => {
            info!("session over: {:?}", outcome?);
        }
        _ = signal::ctrl_c() => {
            info!("received SIGINT");
        }
    }

    let state = agent.state();
    info!(
        rounds_completed = state.rounds_completed;
        "last round: {:?}", state.last_round
    );

    Ok(())
}
