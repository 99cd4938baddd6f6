//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Message`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{Message, PacketError, MAX_DATAGRAM};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// A datagram arrived but could not be decoded.  The peer is kept so the
    /// caller can log it and carry on.
    #[error("malformed datagram from {from}: {source}")]
    Malformed {
        from: SocketAddr,
        #[source]
        source: PacketError,
    },
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, message-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks if needed.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
    recv_len: usize,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner,
            recv_len: MAX_DATAGRAM,
        })
    }

    /// Grow the receive buffer to at least `len` bytes.  Datagrams longer than
    /// the buffer are truncated by the OS.
    pub fn with_recv_len(mut self, len: usize) -> Self {
        self.recv_len = self.recv_len.max(len);
        self
    }

    /// Encode `message` and send it as a single UDP datagram to `dest`.
    pub async fn send_to(&self, message: &Message, dest: SocketAddr) -> Result<(), SocketError> {
        self.inner.send_to(&message.encode(), dest).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Message`].
    ///
    /// Returns `(message, sender_address)`.  Datagrams that fail to decode are
    /// returned as [`SocketError::Malformed`]; the caller decides whether to
    /// keep going.
    pub async fn recv_from(&self) -> Result<(Message, SocketAddr), SocketError> {
        let mut buf = vec![0u8; self.recv_len];
        let (n, from) = self.inner.recv_from(&mut buf).await?;
        let message =
            Message::decode(&buf[..n]).map_err(|source| SocketError::Malformed { from, source })?;
        Ok((message, from))
    }
}
