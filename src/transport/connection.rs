use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{AgentError, Result};
use crate::transport::message::{
    decode, id_key, Inbound, Outbound, RpcCommand, UNKNOWN_MESSAGE_ID, UNSUPPORTED_COMMAND,
};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_LINE_LENGTH: usize = 512 * 1024;
const OUTGOING_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Abort when nothing was read for this long.
    pub idle_timeout: Duration,
    /// Longest accepted line in bytes, delimiter excluded.
    pub max_line_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// The two notifications a connection delivers to the layer above it.
///
/// Methods are called from the connection task and must not block.
pub trait ConnectionHandler: Send + Sync {
    /// Fired exactly once, when the connection is established.
    fn on_connect(&self, connection: ConnectionHandle);

    /// Whether `command` is in the local handler set. Unsupported commands
    /// are connection-fatal.
    fn supports(&self, command: &RpcCommand) -> bool;

    /// A supported command arrived; answer it through `responder`.
    fn on_command(&self, command: RpcCommand, responder: Responder);
}

type Completion = oneshot::Sender<Result<Value>>;

enum Outgoing {
    Command(RpcCommand, Completion),
    Reply(Outbound),
}

/// Cheap handle for talking to a running connection from other tasks.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: String,
    tx: mpsc::Sender<Outgoing>,
    closed: CancellationToken,
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outgoing::Command(cmd, _) => f.debug_tuple("Command").field(&cmd.id).finish(),
            Outgoing::Reply(out) => f.debug_tuple("Reply").field(out).finish(),
        }
    }
}

impl ConnectionHandle {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a command for the peer. Returns as soon as it is queued; await
    /// the returned [`PendingCommand`] for the peer's answer.
    pub async fn send_command(&self, method: &str, params: Map<String, Value>) -> Result<PendingCommand> {
        let command = RpcCommand::new(method, params);
        let id = command.id.clone();
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Outgoing::Command(command, tx))
            .await
            .map_err(|_| AgentError::ConnectionClosed)?;
        Ok(PendingCommand { id, rx })
    }

    /// Ask the connection to shut down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has ended.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Completion handle for an outbound command. Resolves exactly once: with the
/// peer's `result`, with `AgentError::Remote` carrying its `error`, or with
/// `ConnectionClosed` if the connection ended first.
#[derive(Debug)]
pub struct PendingCommand {
    id: Value,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCommand {
    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl Future for PendingCommand {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(AgentError::ConnectionClosed)))
    }
}

/// Answers one inbound command.
#[derive(Debug)]
pub struct Responder {
    id: Value,
    version: Value,
    tx: mpsc::Sender<Outgoing>,
}

impl Responder {
    pub fn id(&self) -> &Value {
        &self.id
    }

    pub async fn send_result(self, result: Value) {
        let reply = Outbound::Result {
            id: self.id,
            version: self.version,
            result,
        };
        if self.tx.send(Outgoing::Reply(reply)).await.is_err() {
            debug!("connection gone, dropping command result");
        }
    }

    pub async fn send_error(self, error: Value) {
        let reply = Outbound::Error {
            id: self.id,
            version: self.version,
            error,
        };
        if self.tx.send(Outgoing::Reply(reply)).await.is_err() {
            debug!("connection gone, dropping command error");
        }
    }
}

/// One RPC connection: newline-delimited JSON over a byte stream.
///
/// Owns the pending-request table. Runs as a single task multiplexing reads,
/// outbound commands and replies; nothing executed on behalf of the peer runs
/// on this task.
pub struct Connection<S> {
    framed: Framed<S, LinesCodec>,
    config: ConnectionConfig,
    handler: Arc<dyn ConnectionHandler>,
    handle: ConnectionHandle,
    rx: mpsc::Receiver<Outgoing>,
    pending: HashMap<String, Completion>,
    fatal_sent: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        config: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(OUTGOING_QUEUE);
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(config.max_line_length)),
            config,
            handler,
            handle: ConnectionHandle {
                peer: peer.into(),
                tx,
                closed: CancellationToken::new(),
            },
            rx,
            pending: HashMap::new(),
            fatal_sent: false,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Drive the connection until the peer hangs up, the handle is closed, or
    /// a fatal condition aborts it. Pending commands resolve with
    /// `ConnectionClosed` when this returns.
    pub async fn run(mut self) -> Result<()> {
        let peer = self.handle.peer.clone();
        info!(peer = %peer, "connection established");
        self.handler.on_connect(self.handle.clone());

        let outcome = self.serve().await;

        self.handle.closed.cancel();
        let abandoned = self.pending.len();
        self.pending.clear();
        match &outcome {
            Ok(()) => info!(peer = %peer, abandoned, "connection closed"),
            Err(e) if e.is_fatal() => warn!(peer = %peer, abandoned, error = %e, "connection aborted"),
            Err(e) => error!(peer = %peer, abandoned, error = %e, "connection failed"),
        }
        outcome
    }

    async fn serve(&mut self) -> Result<()> {
        let idle = self.config.idle_timeout;
        let mut deadline = Instant::now() + idle;

        loop {
            tokio::select! {
                _ = self.handle.closed.cancelled() => return Ok(()),
                _ = sleep_until(deadline) => {
                    warn!(peer = %self.handle.peer, timeout_secs = idle.as_secs_f64(), "connection timed out");
                    return Err(AgentError::TransportTimeout(idle));
                }
                frame = self.framed.next() => {
                    deadline = Instant::now() + idle;
                    match frame {
                        None => return Ok(()),
                        Some(Ok(line)) => {
                            if let ControlFlow::Break(outcome) = self.handle_line(&line).await {
                                return outcome;
                            }
                        }
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            let err = AgentError::protocol(format!(
                                "protocol error: message exceeds {} bytes",
                                self.config.max_line_length
                            ));
                            return Err(err);
                        }
                        Some(Err(LinesCodecError::Io(e))) => {
                            return Err(AgentError::Transport(e.to_string()));
                        }
                    }
                }
                Some(outgoing) = self.rx.recv() => {
                    self.send_outgoing(outgoing).await?;
                }
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> ControlFlow<Result<()>> {
        trace!(peer = %self.handle.peer, line = %line, "got line");

        let message = match decode(line) {
            Ok(Some(message)) => message,
            Ok(None) => return ControlFlow::Continue(()),
            Err(e) => return ControlFlow::Break(self.fatal_error(e).await),
        };

        match message {
            Inbound::Fatal(reason) => {
                error!(peer = %self.handle.peer, error_msg = %reason, "fatal transport error occurred");
                ControlFlow::Break(Err(AgentError::protocol(format!(
                    "peer sent fatal error: {reason}"
                ))))
            }
            Inbound::Command(command) => {
                if !self.handler.supports(&command) {
                    warn!(peer = %self.handle.peer, method = %command.method, "unsupported command");
                    return ControlFlow::Break(
                        self.fatal_error(AgentError::protocol(UNSUPPORTED_COMMAND)).await,
                    );
                }
                debug!(peer = %self.handle.peer, id = %command.id, method = %command.method, "command received");
                let responder = Responder {
                    id: command.id.clone(),
                    version: command.version.clone(),
                    tx: self.handle.tx.clone(),
                };
                self.handler.on_command(command, responder);
                ControlFlow::Continue(())
            }
            Inbound::Result { id, result, .. } => self.complete(&id, Ok(result)).await,
            Inbound::Error { id, error, .. } => {
                self.complete(&id, Err(AgentError::Remote(error))).await
            }
        }
    }

    async fn complete(&mut self, id: &Value, outcome: Result<Value>) -> ControlFlow<Result<()>> {
        match self.pending.remove(&id_key(id)) {
            Some(completion) => {
                if completion.send(outcome).is_err() {
                    debug!(peer = %self.handle.peer, id = %id, "response arrived for an abandoned command");
                }
                ControlFlow::Continue(())
            }
            None => ControlFlow::Break(
                self.fatal_error(AgentError::protocol(UNKNOWN_MESSAGE_ID)).await,
            ),
        }
    }

    async fn send_outgoing(&mut self, outgoing: Outgoing) -> Result<()> {
        match outgoing {
            Outgoing::Command(command, completion) => {
                debug!(peer = %self.handle.peer, id = %command.id, method = %command.method, "sending command");
                self.pending.insert(id_key(&command.id), completion);
                self.write(&Outbound::Command(command)).await
            }
            Outgoing::Reply(reply) => self.write(&reply).await,
        }
    }

    async fn write(&mut self, message: &Outbound) -> Result<()> {
        let line = message.encode()?;
        self.framed
            .send(line)
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))
    }

    /// Send `fatal_error` (at most once per connection) and hand back the
    /// error that aborts the connection.
    async fn fatal_error(&mut self, err: AgentError) -> Result<()> {
        info!(peer = %self.handle.peer, message = %err, "sending a fatal error");
        if !self.fatal_sent {
            self.fatal_sent = true;
            let fatal = Outbound::Fatal {
                fatal_error: err.to_string(),
            };
            if let Err(write_err) = self.write(&fatal).await {
                debug!(peer = %self.handle.peer, error = %write_err, "could not deliver fatal error");
            }
        }
        Err(err)
    }
}
