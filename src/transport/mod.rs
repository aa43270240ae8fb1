pub mod client;
pub mod connection;
pub mod controller;
pub mod message;

pub use client::{run_endpoint, Backoff};
pub use connection::{
    Connection, ConnectionConfig, ConnectionHandle, ConnectionHandler, PendingCommand, Responder,
};
pub use controller::{ControllerClient, HeartbeatApi};
pub use message::{Inbound, Outbound, RpcCommand, PROTOCOL_VERSION};
