//! Active sessions keyed by sender address, with an admission cap.
//!
//! The registry is owned by the dispatch loop and is never shared, so it is a
//! plain `HashMap` with no locking.  It enforces one session per identity and
//! decides whether a newly admitted session pushes the server to its limit.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::session::Session;

/// What happens to a session whose admission reaches the cap.
///
/// Both policies give the same reply (the admitting handshake is refused once
/// the registry is at or above `max_sessions`); they differ only in whether
/// the refused session is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Register the session anyway.  It occupies a slot even though its
    /// sender was told no, which keeps existing senders compatible.
    #[default]
    Permissive,
    /// Do not register a session whose handshake is refused.
    Strict,
}

/// Map from sender identity to its [`Session`].
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SocketAddr, Session>,
    max_sessions: usize,
    policy: AdmissionPolicy,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self::with_policy(max_sessions, AdmissionPolicy::default())
    }

    pub fn with_policy(max_sessions: usize, policy: AdmissionPolicy) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
            policy,
        }
    }

    pub fn find(&self, identity: &SocketAddr) -> Option<&Session> {
        self.sessions.get(identity)
    }

    pub fn find_mut(&mut self, identity: &SocketAddr) -> Option<&mut Session> {
        self.sessions.get_mut(identity)
    }

    pub fn contains(&self, identity: &SocketAddr) -> bool {
        self.sessions.contains_key(identity)
    }

    /// `true` when one more session would reach `max_sessions`, i.e. the
    /// next handshake must be refused.
    pub fn at_capacity(&self) -> bool {
        self.sessions.len() + 1 >= self.max_sessions
    }

    /// Register `session`.
    ///
    /// Returns `true` when the registry is at or above `max_sessions` with
    /// this session counted, meaning the admitting handshake must be refused.
    /// Under [`AdmissionPolicy::Strict`] a refused session is not stored.
    ///
    /// The caller must have checked that the identity is not registered yet.
    pub fn admit(&mut self, session: Session) -> bool {
        debug_assert!(!self.contains(&session.identity()));
        let at_capacity = self.at_capacity();
        if at_capacity && self.policy == AdmissionPolicy::Strict {
            return true;
        }
        self.sessions.insert(session.identity(), session);
        at_capacity
    }

    /// Deregister the session for `identity`, handing it back to the caller.
    pub fn remove(&mut self, identity: &SocketAddr) -> Option<Session> {
        self.sessions.remove(identity)
    }

    /// Drop every session without persisting anything.  Returns how many
    /// were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.sessions.len();
        self.sessions.clear();
        n
    }

    pub fn identities(&self) -> impl Iterator<Item = &SocketAddr> {
        self.sessions.keys()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}
