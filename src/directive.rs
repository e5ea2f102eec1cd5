//! Request-time directives and the immutable execution policy they produce.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::RuoError;
use crate::resource::ResourceType;
use crate::run::RunId;

/// Reverse a previous forward run.
pub const DOWNGRADE_DIRECTIVE: &str = "downgrade";

/// Drop every `check` task from the plan.
pub const SKIP_SERVICE_CHECKS_DIRECTIVE: &str = "skip_service_checks";

/// Raw directive flags as received from the request layer.
pub type RawDirectives = BTreeMap<String, String>;

/// Direction of a run. A downgrade always names the forward run it reverses.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(tag = "direction", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Upgrade,
    Downgrade { of: RunId },
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upgrade => write!(f, "UPGRADE"),
            Self::Downgrade { .. } => write!(f, "DOWNGRADE"),
        }
    }
}

/// Execution policy for one run. Fixed for the run's lifetime.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(flatten)]
    pub direction: Direction,
    pub skip_service_checks: bool,
}

impl Policy {
    /// Forward run with default flags.
    pub const fn upgrade() -> Self {
        Self {
            direction: Direction::Upgrade,
            skip_service_checks: false,
        }
    }

    pub const fn is_downgrade(&self) -> bool {
        matches!(self.direction, Direction::Downgrade { .. })
    }

    /// The forward run a downgrade reverses.
    pub const fn downgrade_of(&self) -> Option<RunId> {
        match self.direction {
            Direction::Downgrade { of } => Some(of),
            Direction::Upgrade => None,
        }
    }
}

/// Parse raw directive flags into a [`Policy`].
///
/// `reference` is the forward run id a downgrade must name. Whether that run
/// exists is checked by the orchestrator, which owns the run registry.
pub fn parse(raw: &RawDirectives, reference: Option<RunId>) -> Result<Policy, RuoError> {
    let accepted = ResourceType::Upgrade.create_directives();
    if let Some(key) = raw.keys().find(|k| !accepted.contains(&k.as_str())) {
        return Err(RuoError::UnsupportedDirective(key.clone()));
    }

    let downgrade = flag(raw, DOWNGRADE_DIRECTIVE)?;
    let skip_service_checks = flag(raw, SKIP_SERVICE_CHECKS_DIRECTIVE)?;

    let direction = match (downgrade, reference) {
        (true, Some(of)) => Direction::Downgrade { of },
        (true, None) => {
            return Err(RuoError::IncompatibleDirective(
                "downgrade requires the id of an existing forward run".into(),
            ));
        }
        (false, Some(of)) => {
            return Err(RuoError::IncompatibleDirective(format!(
                "a fresh upgrade cannot reference run {of}; set {DOWNGRADE_DIRECTIVE}=true"
            )));
        }
        (false, None) => Direction::Upgrade,
    };

    Ok(Policy {
        direction,
        skip_service_checks,
    })
}

fn flag(raw: &RawDirectives, key: &str) -> Result<bool, RuoError> {
    let Some(value) = raw.get(key) else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(RuoError::InvalidDirective(
            key.to_string(),
            format!("expected true or false, got '{other}'"),
        )),
    }
}
