pub mod config;
pub mod daemon;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod status;

pub use config::AgentConfig;
pub use heartbeat::{Heartbeater, HeartbeatSettings};
pub use protocol::AgentProtocol;
pub use registry::TaskRegistry;
pub use status::{AgentStatus, OperationMode};
