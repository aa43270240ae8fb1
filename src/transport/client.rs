use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::connection::{Connection, ConnectionConfig, ConnectionHandler};

/// Reconnect delay policy: starts at `floor`, doubles after each failed
/// attempt up to `ceiling`, and drops back to `floor` once a connection is
/// established.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// The delay to wait now; the next call returns double, capped.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(120))
    }
}

/// Keep one outbound connection to `address` alive until `shutdown` fires.
///
/// Each established connection is handed to `handler`; when it ends, for any
/// reason, we wait out the backoff and dial again.
pub async fn run_endpoint(
    address: String,
    config: ConnectionConfig,
    handler: Arc<dyn ConnectionHandler>,
    mut backoff: Backoff,
    shutdown: CancellationToken,
) {
    info!(endpoint = %address, "starting endpoint client");

    loop {
        let attempt = tokio::select! {
            _ = shutdown.cancelled() => break,
            attempt = TcpStream::connect(address.as_str()) => attempt,
        };

        match attempt {
            Ok(stream) => {
                backoff.reset();
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(endpoint = %address, error = %e, "could not set TCP_NODELAY");
                }
                let connection = Connection::new(stream, address.clone(), config, Arc::clone(&handler));
                let handle = connection.handle();
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        handle.close();
                        break;
                    }
                    outcome = connection.run() => {
                        if let Err(e) = outcome {
                            warn!(endpoint = %address, error = %e, "connection ended with error");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(endpoint = %address, error = %e, "connection attempt failed");
            }
        }

        let delay = backoff.next_delay();
        debug!(endpoint = %address, delay_secs = delay.as_secs_f64(), "reconnecting after delay");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(endpoint = %address, "endpoint client stopped");
}
