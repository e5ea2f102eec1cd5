//! ruo - Rolling Upgrade Orchestrator.
//!
//! Builds a staged plan from a cluster topology and drives it across the
//! hosts' agents with per-host serialization, holding on failures until the
//! caller retries or aborts.

pub mod agent;
pub mod config;
pub mod directive;
pub mod error;
pub mod executor;
pub mod logging;
pub mod machine;
pub mod notify;
pub mod orchestrator;
pub mod plan;
pub mod resource;
pub mod run;
pub mod telemetry;
pub mod topology;

pub use config::EngineConfig;
pub use error::RuoError;
pub use orchestrator::Orchestrator;
