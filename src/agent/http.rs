//! HTTP transport to host agents.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::agent::probe::{PingReply, PingRequest};
use crate::agent::transport::{AgentTransport, CommandReply, TaskCommand};
use crate::error::RuoError;

/// Talks to the agent listening on `{scheme}://{host}:{port}`.
///
/// No request timeout is set on the client. Probe and task deadlines are
/// enforced by the supervisor and the executor.
pub struct HttpAgentTransport {
    client: reqwest::Client,
    scheme: String,
    port: u16,
}

impl HttpAgentTransport {
    pub fn new(scheme: &str, port: u16) -> Result<Self, RuoError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| RuoError::Fatal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            scheme: scheme.to_string(),
            port,
        })
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("{}://{}:{}{}", self.scheme, host, self.port, path)
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn ping(&self, host: &str, request: &PingRequest) -> Result<PingReply, RuoError> {
        let url = self.url(host, "/v1/ping");
        debug!(host, url = %url, immediate = request.immediate, "Sending ping");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| RuoError::transport(host, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RuoError::Transport(
                host.to_string(),
                format!("ping returned HTTP {status}"),
            ));
        }

        response
            .json::<PingReply>()
            .await
            .map_err(|e| RuoError::transport(host, e))
    }

    async fn execute(&self, host: &str, command: &TaskCommand) -> Result<(), RuoError> {
        let url = self.url(host, "/v1/commands");
        debug!(
            host,
            url = %url,
            task_id = command.task_id,
            operation = %command.operation,
            "Sending command"
        );

        let response = self
            .client
            .post(&url)
            .json(command)
            .send()
            .await
            .map_err(|e| RuoError::transport(host, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuoError::CommandRejected(
                host.to_string(),
                format!("HTTP {status}: {}", body.trim()),
            ));
        }

        let reply = response
            .json::<CommandReply>()
            .await
            .map_err(|e| RuoError::transport(host, e))?;

        if reply.accepted {
            Ok(())
        } else {
            Err(RuoError::CommandRejected(
                host.to_string(),
                reply
                    .message
                    .unwrap_or_else(|| "rejected without message".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Direction;
    use crate::plan::OperationKind;
    use crate::run::RunId;
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use tokio::net::TcpListener;

    async fn fake_agent(app: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn command(operation: OperationKind) -> TaskCommand {
        TaskCommand {
            run_id: RunId::new(),
            task_id: 0,
            host: "127.0.0.1".to_string(),
            service: "HDFS".to_string(),
            component: "NAMENODE".to_string(),
            operation,
            version: "3.1.0".to_string(),
            direction: Direction::Upgrade,
            attempt: 1,
        }
    }

    fn agent_routes() -> Router {
        Router::new()
            .route(
                "/v1/ping",
                post(|Json(req): Json<PingRequest>| async move {
                    assert_eq!(req.username, "ruo");
                    Json(PingReply::now())
                }),
            )
            .route(
                "/v1/commands",
                post(|Json(cmd): Json<TaskCommand>| async move {
                    match cmd.operation {
                        OperationKind::Check => (
                            StatusCode::OK,
                            Json(CommandReply {
                                accepted: false,
                                message: Some("service check failed".to_string()),
                            }),
                        ),
                        OperationKind::Restart => (
                            StatusCode::SERVICE_UNAVAILABLE,
                            Json(CommandReply {
                                accepted: false,
                                message: None,
                            }),
                        ),
                        _ => (
                            StatusCode::OK,
                            Json(CommandReply {
                                accepted: true,
                                message: None,
                            }),
                        ),
                    }
                }),
            )
    }

    #[tokio::test]
    async fn test_ping_and_execute() {
        let port = fake_agent(agent_routes()).await;
        let transport = HttpAgentTransport::new("http", port).unwrap();

        let ping = PingRequest::new("ruo", "ruo", true);
        transport.ping("127.0.0.1", &ping).await.unwrap();

        transport
            .execute("127.0.0.1", &command(OperationKind::Install))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let port = fake_agent(agent_routes()).await;
        let transport = HttpAgentTransport::new("http", port).unwrap();

        let err = transport
            .execute("127.0.0.1", &command(OperationKind::Check))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RuoError::CommandRejected("127.0.0.1".into(), "service check failed".into())
        );

        let err = transport
            .execute("127.0.0.1", &command(OperationKind::Restart))
            .await
            .unwrap_err();
        assert!(matches!(err, RuoError::CommandRejected(_, msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpAgentTransport::new("http", port).unwrap();
        let err = transport
            .ping("127.0.0.1", &PingRequest::new("ruo", "ruo", false))
            .await
            .unwrap_err();
        assert!(matches!(err, RuoError::Transport(host, _) if host == "127.0.0.1"));
    }
}
