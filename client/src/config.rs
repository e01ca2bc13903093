//! The client's json configuration file.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use model::{ClientId, Metadata};
use serde::{Deserialize, Serialize};

use crate::error::{ClientErr, Result};

/// How the agent reconnects after losing the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed connections before giving up, none retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// The backoff before the `attempt`-th reconnection, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);

        Duration::from_millis(ms)
    }
}

/// One of the built-in local update policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalPolicySpec {
    /// Zero deltas, all ones mask.
    #[default]
    Noop,
    /// Every delta equals `delta`.
    Constant { delta: f32 },
}

/// The client configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub client_id: ClientId,
    pub server_addr: String,
    /// Sent once per connection, the server's policies read it.
    pub metadata: Metadata,
    /// Where to persist the local state, none keeps it in memory.
    pub checkpoint_path: Option<PathBuf>,
    /// Leave the session after submitting this many results on one connection.
    pub max_rounds: Option<u64>,
    pub reconnect: ReconnectConfig,
    pub policy: LocalPolicySpec,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: ClientId::new("client"),
            server_addr: "127.0.0.1:8765".into(),
            metadata: Metadata::new(),
            checkpoint_path: None,
            max_rounds: None,
            reconnect: ReconnectConfig::default(),
            policy: LocalPolicySpec::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a `ClientConfig` with the defaults for everything but the ids.
    ///
    /// # Arguments
    /// * `client_id` - The id to connect with.
    /// * `server_addr` - Where the server listens.
    pub fn new(client_id: impl Into<ClientId>, server_addr: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            server_addr: server_addr.into(),
            ..Self::default()
        }
    }

    /// Reads and parses the configuration file at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ClientErr::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;

        Self::from_json(&content)
    }

    /// Parses a configuration from its json text, validating it.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| ClientErr::InvalidConfig(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.as_str().is_empty() {
            return Err(ClientErr::InvalidConfig("client_id can't be empty".into()));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_backoff_ms == 0 || reconnect.max_backoff_ms < reconnect.initial_backoff_ms {
            return Err(ClientErr::InvalidConfig(format!(
                "invalid reconnect backoff: initial {}ms, max {}ms",
                reconnect.initial_backoff_ms, reconnect.max_backoff_ms
            )));
        }

        if let LocalPolicySpec::Constant { delta } = self.policy
            && !delta.is_finite()
        {
            return Err(ClientErr::InvalidConfig(format!(
                "constant policy delta must be finite, got {delta}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use model::Scalar;

    use super::*;

    #[test]
    fn full_config_parses() {
        let config = ClientConfig::from_json(
            r#"{
                "client_id": "hospital-3",
                "server_addr": "10.0.0.1:8765",
                "metadata": { "num_examples": 1200, "region": "eu" },
                "checkpoint_path": "/var/lib/fl/state.json",
                "reconnect": { "initial_backoff_ms": 100, "max_backoff_ms": 800, "max_attempts": 5 },
                "policy": { "kind": "constant", "delta": 0.5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.client_id.as_str(), "hospital-3");
        assert_eq!(config.metadata["num_examples"], Scalar::Int(1200));
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.policy, LocalPolicySpec::Constant { delta: 0.5 });
    }

    #[test]
    fn missing_fields_take_the_defaults() {
        let config = ClientConfig::from_json(r#"{ "client_id": "a" }"#).unwrap();
        assert_eq!(config, ClientConfig::new("a", "127.0.0.1:8765"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = ClientConfig::from_json(r#"{ "client_id": "a", "rounds": 3 }"#).unwrap_err();
        assert!(matches!(err, ClientErr::InvalidConfig(_)));
    }

    #[test]
    fn backoff_doubles_up_to_the_max() {
        let reconnect = ReconnectConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            max_attempts: None,
        };

        let backoffs: Vec<_> = (0..6).map(|n| reconnect.backoff(n).as_millis()).collect();
        assert_eq!(backoffs, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(reconnect.backoff(200), Duration::from_millis(1_000));
    }
}
