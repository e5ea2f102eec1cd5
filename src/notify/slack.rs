//! Delivery of run notices to a Slack Incoming Webhook.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::run::{RunId, RunState};

/// Slack rejects section blocks with more fields than this.
const SECTION_FIELD_LIMIT: usize = 10;

/// Failed task shown under a holding notice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedTaskRow {
    pub host: String,
    /// `SERVICE/COMPONENT`.
    pub target: String,
    pub status: String,
    pub error: String,
}

/// Lifecycle notice for one run, rendered as Block Kit.
#[derive(Clone, Debug)]
pub struct RunNotice {
    pub run_id: RunId,
    pub state: RunState,
    pub title: String,
    pub facts: Vec<(String, String)>,
    pub failed: Vec<FailedTaskRow>,
    /// Failed tasks left out of `failed`.
    pub more_failed: usize,
}

/// Slack webhook client. The webhook URL embeds a token and is kept secret.
pub struct SlackNotifier {
    webhook_url: SecretString,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: SecretString) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Post `notice`. Delivery failures are logged; a run never waits on Slack.
    pub async fn send(&self, notice: &RunNotice) {
        let result = self
            .client
            .post(self.webhook_url.expose_secret())
            .json(&render(notice))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match result {
            Ok(_) => info!(
                run_id = %notice.run_id,
                state = %notice.state,
                "Slack notification sent"
            ),
            Err(e) => warn!(
                run_id = %notice.run_id,
                state = %notice.state,
                error = %e.without_url(),
                "Failed to send Slack notification"
            ),
        }
    }
}

const fn state_emoji(state: RunState) -> &'static str {
    match state {
        RunState::Pending | RunState::Running => ":arrow_forward:",
        RunState::Holding => ":warning:",
        RunState::Suspended => ":double_vertical_bar:",
        RunState::Completed => ":white_check_mark:",
        RunState::Aborted => ":x:",
    }
}

fn render(notice: &RunNotice) -> Value {
    let title = format!("{} {}", state_emoji(notice.state), notice.title);

    let mut blocks = vec![json!({
        "type": "header",
        "text": { "type": "plain_text", "text": title, "emoji": true }
    })];

    blocks.extend(notice.facts.chunks(SECTION_FIELD_LIMIT).map(|chunk| {
        let fields: Vec<Value> = chunk
            .iter()
            .map(|(label, value)| json!({ "type": "mrkdwn", "text": format!("*{label}*\n{value}") }))
            .collect();
        json!({ "type": "section", "fields": fields })
    }));

    if !notice.failed.is_empty() {
        let mut lines: Vec<String> = notice
            .failed
            .iter()
            .map(|row| format!("• `{}` {} *{}*: {}", row.host, row.target, row.status, row.error))
            .collect();
        if notice.more_failed > 0 {
            lines.push(format!("_and {} more failed tasks_", notice.more_failed));
        }
        blocks.push(json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": lines.join("\n") }
        }));
    }

    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": format!("ruo | Upgrade/{} | {}", notice.run_id, notice.state)
        }]
    }));

    json!({
        "text": format!("{} (Upgrade/{})", notice.title, notice.run_id),
        "blocks": blocks
    })
}
