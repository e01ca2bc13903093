//! The federated learning client.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod policy;

pub use agent::{ClientAgent, SessionOutcome};
pub use config::{ClientConfig, LocalPolicySpec, ReconnectConfig};
pub use error::{ClientErr, Result};
pub use policy::LocalUpdatePolicy;
