//! The server's json configuration file.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use model::{Layout, ModelState, Shape, Tensors};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionErr};

/// Where and how committed rounds are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    /// How many round records to keep on disk, 0 keeps all of them.
    pub keep_last: usize,
    /// Also stores the client updates of every committed round.
    pub archive_updates: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("checkpoints"),
            keep_last: 3,
            archive_updates: false,
        }
    }
}

/// How the initial model of a fresh session is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    /// Every layer filled with `value`.
    Constant { shapes: Vec<Shape>, value: f32 },
    /// Explicit values for every layer.
    Layers { layers: Vec<LayerSpec> },
}

impl Default for ModelSpec {
    fn default() -> Self {
        ModelSpec::Constant {
            shapes: Vec::new(),
            value: 0.,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub shape: Shape,
    pub values: Vec<f32>,
}

impl ModelSpec {
    /// Builds the model this spec describes.
    pub fn build(&self) -> Result<ModelState> {
        let model = match self {
            ModelSpec::Constant { shapes, value } => {
                Tensors::filled(Layout::new(shapes.clone()), *value)
            }
            ModelSpec::Layers { layers } => Tensors::from_layers(
                layers
                    .iter()
                    .map(|layer| (layer.shape.clone(), layer.values.clone())),
            )
            .map_err(|e| SessionErr::InvalidConfig(format!("initial model: {e}")))?,
        };

        if model.layout().num_layers() == 0 {
            return Err(SessionErr::InvalidConfig(
                "the initial model has no layers".into(),
            ));
        }

        Ok(model)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdmissionSpec {
    #[default]
    AcceptAll,
    RequireKeys { keys: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionSpec {
    #[default]
    All,
    Sample {
        fraction: f64,
        #[serde(default)]
        min: usize,
        #[serde(default)]
        seed: u64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightingSpec {
    #[default]
    Uniform,
    MetadataKey { key: String },
}

/// The built-in policies of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub admission: AdmissionSpec,
    pub selection: SelectionSpec,
    pub weighting: WeightingSpec,
}

/// Everything a session needs to run, already resolved.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_id: String,
    /// Total amount of round ids of the session, resumed sessions included.
    pub num_rounds: u64,
    pub min_connected_clients: usize,
    pub initial_model: ModelState,
    pub checkpoint: Option<CheckpointConfig>,
    pub round_deadline: Duration,
    /// Consecutive failed attempts of a round before the session aborts.
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    pub admission_timeout: Duration,
    pub transition_log_capacity: usize,
}

impl SessionConfig {
    /// Creates a `SessionConfig` with the default timings and no checkpointing.
    ///
    /// # Arguments
    /// * `server_id` - The name of this server, stored in every checkpoint.
    /// * `initial_model` - The model of round 0.
    pub fn new(server_id: impl Into<String>, initial_model: ModelState) -> Self {
        let defaults = ServerConfig::default();

        Self {
            server_id: server_id.into(),
            num_rounds: defaults.num_rounds,
            min_connected_clients: defaults.min_connected_clients,
            initial_model,
            checkpoint: None,
            round_deadline: Duration::from_millis(defaults.round_deadline_ms),
            retry_limit: defaults.retry_limit,
            retry_backoff: Duration::from_millis(defaults.retry_backoff_ms),
            admission_timeout: Duration::from_millis(defaults.admission_timeout_ms),
            transition_log_capacity: defaults.transition_log_capacity,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_connected_clients == 0 {
            return Err(SessionErr::InvalidConfig(
                "min_connected_clients must be at least 1".into(),
            ));
        }

        if self.round_deadline.is_zero() {
            return Err(SessionErr::InvalidConfig(
                "round_deadline must be positive".into(),
            ));
        }

        if self.initial_model.num_layers() == 0 {
            return Err(SessionErr::InvalidConfig(
                "the initial model has no layers".into(),
            ));
        }

        Ok(())
    }
}

/// The server configuration file.
///
/// Durations are given in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub server_id: String,
    pub listen_addr: String,
    pub num_rounds: u64,
    pub min_connected_clients: usize,
    pub initial_model: ModelSpec,
    /// Leave out to run without persistence.
    pub checkpoint: Option<CheckpointConfig>,
    pub round_deadline_ms: u64,
    pub retry_limit: u32,
    pub retry_backoff_ms: u64,
    pub admission_timeout_ms: u64,
    pub transition_log_capacity: usize,
    pub policies: PolicyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: "server".into(),
            listen_addr: "127.0.0.1:8765".into(),
            num_rounds: 10,
            min_connected_clients: 1,
            initial_model: ModelSpec::default(),
            checkpoint: None,
            round_deadline_ms: 30_000,
            retry_limit: 3,
            retry_backoff_ms: 1_000,
            admission_timeout_ms: 60_000,
            transition_log_capacity: 1024,
            policies: PolicyConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads and parses the configuration file at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SessionErr::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;

        Self::from_json(&content)
    }

    /// Parses a configuration from its json text.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| SessionErr::InvalidConfig(format!("invalid JSON: {e}")))
    }

    /// Resolves the runtime settings of the session, validating them.
    pub fn session(&self) -> Result<SessionConfig> {
        let session = SessionConfig {
            server_id: self.server_id.clone(),
            num_rounds: self.num_rounds,
            min_connected_clients: self.min_connected_clients,
            initial_model: self.initial_model.build()?,
            checkpoint: self.checkpoint.clone(),
            round_deadline: Duration::from_millis(self.round_deadline_ms),
            retry_limit: self.retry_limit,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            admission_timeout: Duration::from_millis(self.admission_timeout_ms),
            transition_log_capacity: self.transition_log_capacity,
        };

        session.validate()?;
        Ok(session)
    }
}
