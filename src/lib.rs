pub mod agent;
pub mod commands;
pub mod error;
pub mod hardware;
pub mod tasks;
pub mod transport;
pub mod utils;

pub use error::{AgentError, Result};

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
