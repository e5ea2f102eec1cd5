//! Agent supervision: liveness probing and the command channel to remote hosts.

pub mod http;
pub mod probe;
pub mod supervisor;
pub mod transport;

pub use http::HttpAgentTransport;
pub use probe::{PingReply, PingRequest};
pub use supervisor::{AgentSession, AgentSupervisors, ProbeConfig};
pub use transport::{AgentTransport, CommandReply, TaskCommand};
