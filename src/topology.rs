//! Cluster topology supplied to the plan builder.
//!
//! The engine never discovers hosts itself. A topology lists services in
//! declared upgrade order, each with components and the hosts they run on.

use std::collections::BTreeSet;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::RuoError;

/// Desired rollout of a cluster from `source_version` to `target_version`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    /// Cluster name, used in logs, metrics and notifications.
    pub name: String,

    /// Version currently installed on every host.
    pub source_version: String,

    /// Version to roll out.
    pub target_version: String,

    /// Services in upgrade order.
    #[serde(default)]
    pub services: Vec<Service>,
}

/// A service and its components.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,

    /// Failures in this service's group do not block go/no-go reporting.
    #[serde(default)]
    pub skippable: bool,

    #[serde(default)]
    pub components: Vec<Component>,
}

/// A component deployed on one or more hosts.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,

    #[serde(default)]
    pub hosts: Vec<String>,

    /// Component has no versioned binaries; it only needs a restart.
    #[serde(default)]
    pub restart_only: bool,
}

impl Topology {
    /// Parse a topology from YAML (JSON is accepted as well).
    pub fn from_yaml(source: &str) -> Result<Self, RuoError> {
        let topology: Self = serde_yaml::from_str(source)
            .map_err(|e| RuoError::InvalidTopology(e.to_string()))?;
        topology.validate()?;
        Ok(topology)
    }

    /// Load and validate a topology file.
    pub fn load(path: &Path) -> Result<Self, RuoError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| RuoError::InvalidTopology(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&source)
    }

    /// Total number of (component, host) placements.
    pub fn placement_count(&self) -> usize {
        self.services
            .iter()
            .flat_map(|s| &s.components)
            .map(|c| c.hosts.len())
            .sum()
    }

    /// Distinct hosts across all services.
    pub fn hosts(&self) -> BTreeSet<&str> {
        self.services
            .iter()
            .flat_map(|s| &s.components)
            .flat_map(|c| c.hosts.iter().map(String::as_str))
            .collect()
    }

    /// Structural validation. Host emptiness is checked by the plan builder.
    pub fn validate(&self) -> Result<(), RuoError> {
        if self.name.trim().is_empty() {
            return Err(RuoError::InvalidTopology("name must not be empty".into()));
        }
        if self.source_version.trim().is_empty() || self.target_version.trim().is_empty() {
            return Err(RuoError::InvalidTopology(format!(
                "{}: sourceVersion and targetVersion are required",
                self.name
            )));
        }

        let mut services = BTreeSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(RuoError::InvalidTopology(format!(
                    "{}: service name must not be empty",
                    self.name
                )));
            }
            if !services.insert(service.name.as_str()) {
                return Err(RuoError::InvalidTopology(format!(
                    "{}: duplicate service {}",
                    self.name, service.name
                )));
            }

            let mut components = BTreeSet::new();
            for component in &service.components {
                if !components.insert(component.name.as_str()) {
                    return Err(RuoError::InvalidTopology(format!(
                        "{}: duplicate component {}/{}",
                        self.name, service.name, component.name
                    )));
                }
                let mut hosts = BTreeSet::new();
                for host in &component.hosts {
                    if host.trim().is_empty() || !hosts.insert(host.as_str()) {
                        return Err(RuoError::InvalidTopology(format!(
                            "{}: invalid or duplicate host '{}' for {}/{}",
                            self.name, host, service.name, component.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
