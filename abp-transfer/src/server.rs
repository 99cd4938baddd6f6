//! Dispatch loop: one datagram at a time, start to finish.
//!
//! ```text
//!   recv_from ──▶ Message::decode ──▶ Engine::handle ──▶ send_to(reply)
//!       ▲                                                    │
//!       └────────────────────────────────────────────────────┘
//! ```
//!
//! The loop owns the [`Engine`] (and through it every session), so nothing is
//! shared and nothing is locked.  The only await point that can block for
//! long is the receive; writing a completed file happens inline.
//!
//! A datagram that cannot be decoded, or that carries a server-only kind, is
//! logged and dropped.  It never stops the loop, so one bad sender cannot take
//! down transfers from anyone else.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use crate::config::ServerConfig;
use crate::engine::{Engine, EngineMetrics};
use crate::packet::Message;
use crate::socket::{Socket, SocketError};

/// Summary returned when [`Server::run`] stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions that were still in progress and were discarded unsaved.
    pub abandoned_sessions: usize,
    pub metrics: EngineMetrics,
}

/// A bound UDP server driving one [`Engine`].
pub struct Server {
    socket: Socket,
    engine: Engine,
}

impl Server {
    /// Bind according to `config` and build a disk-backed engine.
    pub async fn bind(config: &ServerConfig) -> Result<Self, SocketError> {
        let socket = Socket::bind(config.bind)
            .await?
            .with_recv_len(config.recv_buffer_len());
        log::info!(
            "[server] {}: listening (max {} session(s), {} byte segments)",
            socket.local_addr,
            config.max_sessions,
            config.segment_size
        );
        Ok(Self::with_engine(socket, Engine::from_config(config)))
    }

    /// Use an already bound socket and a caller-built engine.
    pub fn with_engine(socket: Socket, engine: Engine) -> Self {
        Self { socket, engine }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Serve until `shutdown` resolves.
    ///
    /// On shutdown the socket is closed and unfinished sessions are dropped
    /// without writing anything.  Only an unrecoverable receive error ends the
    /// loop early.
    pub async fn run<F>(mut self, shutdown: F) -> Result<ShutdownReport, SocketError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = self.socket.recv_from() => {
                    if let Err(e) = self.dispatch(received).await {
                        log::error!("[server] {}: receive failed: {e}", self.socket.local_addr);
                        return Err(e);
                    }
                }
            }
        }

        let abandoned_sessions = self.engine.shutdown();
        let metrics = self.engine.metrics().clone();
        log::info!(
            "[server] {}: shutting down; {} unfinished session(s) discarded, {} file(s) received",
            self.socket.local_addr,
            abandoned_sessions,
            metrics.completed
        );
        log::debug!("[server] final metrics: {metrics:?}");
        Ok(ShutdownReport {
            abandoned_sessions,
            metrics,
        })
    }

    /// Serve until the process receives Ctrl-C.
    pub async fn run_until_ctrl_c(self) -> Result<ShutdownReport, SocketError> {
        self.run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("[server] cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Handle one receive result.  Only errors that should stop the server
    /// are returned.
    async fn dispatch(
        &mut self,
        received: Result<(Message, SocketAddr), SocketError>,
    ) -> Result<(), SocketError> {
        let (message, from) = match received {
            Ok(pair) => pair,
            Err(SocketError::Malformed { from, source }) => {
                log::warn!("[server] {from}: dropping datagram: {source}");
                return Ok(());
            }
            Err(SocketError::Io(e)) if is_transient(&e) => {
                log::debug!("[server] transient receive error: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        log::debug!("[server] {from}: <- {message}");

        let reply = match self.engine.handle(from, message) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("[server] dropping datagram: {e}");
                return Ok(());
            }
        };

        log::debug!("[server] {from}: -> {reply}");
        if let Err(e) = self.socket.send_to(&reply, from).await {
            // Fire-and-forget: the sender retransmits if the reply is lost.
            log::warn!("[server] {from}: reply not sent: {e}");
        }
        Ok(())
    }
}

/// Errors a UDP receive can report because of a previous send (ICMP
/// unreachable) rather than a broken socket.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
