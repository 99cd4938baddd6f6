//! Server configuration.
//!
//! Everything the dispatch loop and engine need at startup lives in
//! [`ServerConfig`].  `main.rs` fills it from the command line; tests build it
//! directly and override the fields they care about.

use std::net::{Ipv4Addr, SocketAddr};

use crate::packet::{DATA_OVERHEAD, MAX_DATAGRAM, MAX_SEGMENT_SIZE};
use crate::registry::AdmissionPolicy;
use crate::store::OutputPolicy;

/// Port used when none is given.
pub const DEFAULT_PORT: u16 = 9000;

/// Session cap used when none is given.
pub const DEFAULT_MAX_SESSIONS: usize = 16;

/// Startup parameters for [`crate::server::Server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Local address to bind.
    pub bind: SocketAddr,
    /// Admission cap: a handshake that brings the registry to this size is
    /// refused.
    pub max_sessions: usize,
    /// Maximum payload bytes per Data message.  Sender and server must agree
    /// on this out of band; it is not negotiated.
    pub segment_size: usize,
    /// Whether refused handshakes still occupy a slot.
    pub admission: AdmissionPolicy,
    /// Where completed files are written.
    pub output: OutputPolicy,
}

impl ServerConfig {
    /// Receive buffer large enough for a full Data message.
    pub fn recv_buffer_len(&self) -> usize {
        (self.segment_size + DATA_OVERHEAD).max(MAX_DATAGRAM)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_sessions: DEFAULT_MAX_SESSIONS,
            segment_size: MAX_SEGMENT_SIZE,
            admission: AdmissionPolicy::Permissive,
            output: OutputPolicy::Verbatim,
        }
    }
}
