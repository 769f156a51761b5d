//! TCP accept loop for miner connections.
//!
//! [`TcpServer`] owns the listening socket. Each accepted connection is
//! handed to a [`ConnectionHandler`] on its own task; the server itself knows
//! nothing about Stratum. Cancelling the token passed to [`TcpServer::run`]
//! stops accepting, closes the socket, cancels every session, and waits a
//! bounded time for them to finish.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Back-off after running out of file descriptors.
const FD_EXHAUSTED_BACKOFF: Duration = Duration::from_millis(100);

/// Serves one accepted connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handle `stream` until it closes. `token` is cancelled when the server
    /// shuts down.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> Result<()>;
}

/// Server lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    /// Claimed by a call to `run`, socket not bound yet.
    Binding,
    Listening(SocketAddr),
    Closed,
}

pub struct TcpServer {
    addr: String,
    handler: Option<Arc<dyn ConnectionHandler>>,
    shutdown_grace: Duration,
    state: watch::Sender<ServerState>,
}

impl TcpServer {
    pub fn new(addr: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        Self {
            addr: addr.into(),
            handler: None,
            shutdown_grace: Duration::from_secs(5),
            state,
        }
    }

    /// How long `run` waits for sessions after cancellation.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Install the handler for accepted connections. Without one,
    /// connections are accepted and immediately dropped.
    pub fn set_connection_handler(&mut self, handler: Arc<dyn ConnectionHandler>) {
        self.handler = Some(handler);
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Wait until the server is listening and return its bound address.
    pub async fn listening(&self) -> Result<SocketAddr> {
        let mut state = self.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                ServerState::Listening(addr) => return Ok(addr),
                ServerState::Closed => return Err(Error::Closed("server")),
                ServerState::Created | ServerState::Binding => {}
            }
            state
                .changed()
                .await
                .map_err(|_| Error::Closed("server"))?;
        }
    }

    /// Accept connections until `token` is cancelled or the listener fails.
    ///
    /// Returns [`Error::Cancelled`] after a requested shutdown. A server runs
    /// once; calling `run` again fails with [`Error::Closed`].
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let addr: SocketAddr = self.addr.parse().map_err(|e| {
            Error::Config(format!("invalid listen address {:?}: {e}", self.addr))
        })?;

        let claimed = self.state.send_if_modified(|state| {
            if *state != ServerState::Created {
                return false;
            }
            *state = ServerState::Binding;
            true
        });
        if !claimed {
            return Err(Error::Closed("server"));
        }

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state.send_replace(ServerState::Closed);
                return Err(e.into());
            }
        };
        let local = listener.local_addr()?;
        self.state.send_replace(ServerState::Listening(local));
        info!(addr = %local, "Listening for miners");

        let sessions = token.child_token();
        let tracker = TaskTracker::new();

        let result = loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break Err(Error::Cancelled),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.dispatch(&tracker, stream, peer, &sessions),
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "Accept failed, continuing");
                    if is_fd_exhaustion(&e) {
                        sleep(FD_EXHAUSTED_BACKOFF).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Listener failed");
                    break Err(e.into());
                }
            }
        };

        drop(listener);
        self.state.send_replace(ServerState::Closed);

        sessions.cancel();
        tracker.close();
        if timeout(self.shutdown_grace, tracker.wait()).await.is_err() {
            warn!(
                remaining = tracker.len(),
                grace = ?self.shutdown_grace,
                "Sessions still running after shutdown grace"
            );
        }
        info!(addr = %local, "Server closed");

        result
    }

    fn dispatch(
        &self,
        tracker: &TaskTracker,
        stream: TcpStream,
        peer: SocketAddr,
        sessions: &CancellationToken,
    ) {
        let Some(handler) = self.handler.clone() else {
            debug!(peer = %peer, "No connection handler, dropping connection");
            return;
        };
        debug!(peer = %peer, "Accepted connection");

        let token = sessions.child_token();
        tracker.spawn(async move {
            match handler.handle_connection(stream, peer, token).await {
                Ok(()) => trace!(peer = %peer, "Connection finished"),
                Err(e) if e.is_disconnect() => {
                    debug!(peer = %peer, error = %e, "Connection closed")
                }
                Err(e) => warn!(peer = %peer, error = %e, "Connection failed"),
            }
        });
    }
}

/// Errors that concern one pending connection rather than the listener.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_fd_exhaustion(e)
}

// EMFILE / ENFILE
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23) | Some(24))
}
