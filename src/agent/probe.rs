//! Liveness probe messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ping sent to a host agent.
///
/// `immediate` asks the agent to answer synchronously instead of on its next
/// polling tick. The supervisor sets it for on-demand probes before dispatch.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub username: String,
    pub instance_name: String,
    pub immediate: bool,
}

impl PingRequest {
    pub fn new(username: &str, instance_name: &str, immediate: bool) -> Self {
        Self {
            username: username.to_string(),
            instance_name: instance_name.to_string(),
            immediate,
        }
    }
}

/// Successful ping answer.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PingReply {
    pub contacted_at: DateTime<Utc>,
}

impl PingReply {
    pub fn now() -> Self {
        Self {
            contacted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_request_wire_format() {
        let ping = PingRequest::new("ruo", "ruo-prod", true);
        let json = serde_json::to_value(&ping).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"username": "ruo", "instanceName": "ruo-prod", "immediate": true})
        );
    }

    #[test]
    fn test_ping_reply_parses() {
        let reply: PingReply =
            serde_json::from_str(r#"{"contactedAt":"2026-01-02T03:04:05Z"}"#).unwrap();
        assert_eq!(reply.contacted_at.to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }
}
