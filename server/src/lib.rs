//! The federated learning server.
//!
//! A `SessionCoordinator` admits clients, runs rounds over the admitted ones
//! and persists every committed model through a `CheckpointStore`.

pub mod aggregation;
pub mod checkpoint;
pub mod config;
mod connection;
pub mod error;
pub mod policy;
pub mod registry;
mod round;
mod session;

pub use aggregation::{AggregationErr, aggregate};
pub use checkpoint::{CheckpointErr, CheckpointRecord, CheckpointStore};
pub use config::{CheckpointConfig, ModelSpec, PolicyConfig, ServerConfig, SessionConfig};
pub use connection::ConnId;
pub use error::{Result, RoundFailure, SessionErr};
pub use policy::{AdmissionPolicy, PolicyBuilder, PolicyHost, SelectionPolicy, WeightPolicy};
pub use registry::{ClientRecord, ClientRegistry, ConnState, Transition};
pub use round::{RoundRecord, RoundStatus};
pub use session::{SessionCoordinator, SessionHandle, SessionReport, SessionState, SessionStatus};
