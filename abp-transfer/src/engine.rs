//! Protocol engine: the alternating-bit state machine for every sender.
//!
//! Given one decoded [`Message`] and the address it came from, the
//! [`Engine`] consults and mutates the [`SessionRegistry`], persists finished
//! files through its [`FileStore`], and returns the reply to send.  It never
//! touches the socket, so every transition can be exercised without a
//! network.
//!
//! # Transitions
//!
//! Let `bit'` be the toggle of the inbound bit.  Every reply carries `bit'`.
//!
//! | Inbound | Condition                          | Effect                          | Reply   |
//! |---------|------------------------------------|---------------------------------|---------|
//! | Start   | identity already has a session     | none                            | Ack     |
//! | Start   | declared size is 0, under the cap  | empty file persisted            | Ack     |
//! | Start   | declared size is 0, at the cap     | none                            | Nack    |
//! | Start   | admission reaches the cap          | session created (policy-dependent) | Nack |
//! | Start   | otherwise                          | session created                 | Ack     |
//! | Data    | no session                         | none                            | Nack    |
//! | Data    | bit == last accepted bit           | none (duplicate)                | Ack     |
//! | Data    | new bit, more segments expected    | payload appended                | Ack     |
//! | Data    | new bit, final segment             | file persisted, session removed | Ack     |
//! | Data    | final segment, persistence fails   | session removed                 | Nack    |
//! | Ack/Nack| always                             | none                            | —       |
//!
//! Ack and Nack are server-only kinds; receiving one is a protocol violation
//! reported as [`EngineError`] and confined to that datagram.

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ServerConfig;
use crate::packet::{Bit, Kind, Message};
use crate::registry::SessionRegistry;
use crate::session::{SegmentOutcome, Session};
use crate::state::TransferState;
use crate::store::{DiskStore, FileStore};

// ---------------------------------------------------------------------------
// Errors and metrics
// ---------------------------------------------------------------------------

/// A message the engine cannot act on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("{from} sent server-only message type '{kind}'")]
    UnexpectedKind { kind: Kind, from: SocketAddr },
}

/// Counters describing everything the engine has processed.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct EngineMetrics {
    pub handshakes: u64,          // sessions created
    pub rehandshakes: u64,        // Start from an identity that already had a session
    pub rejected_handshakes: u64, // Start answered with Nack
    pub segments_accepted: u64,   // Data appended to a buffer
    pub duplicates: u64,          // Data discarded as retransmission
    pub oversized_segments: u64,  // Data longer than segment_size
    pub unknown_peer_data: u64,   // Data with no session
    pub completed: u64,           // files persisted
    pub persist_failures: u64,    // completions that could not be written
    pub protocol_errors: u64,     // inbound Ack/Nack
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs the per-identity state machine over a [`SessionRegistry`].
pub struct Engine {
    registry: SessionRegistry,
    store: Box<dyn FileStore>,
    segment_size: usize,
    metrics: EngineMetrics,
}

impl Engine {
    pub fn new(registry: SessionRegistry, store: Box<dyn FileStore>, segment_size: usize) -> Self {
        Self {
            registry,
            store,
            segment_size,
            metrics: EngineMetrics::default(),
        }
    }

    /// Engine writing to disk according to `config.output`.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            SessionRegistry::with_policy(config.max_sessions, config.admission),
            Box::new(DiskStore::new(config.output.clone())),
            config.segment_size,
        )
    }

    /// Process one inbound message from `from` and return the reply.
    pub fn handle(&mut self, from: SocketAddr, message: Message) -> Result<Message, EngineError> {
        match message {
            Message::Start {
                bit,
                filename,
                file_size,
            } => Ok(self.on_start(from, bit, filename, file_size)),
            Message::Data { bit, payload } => Ok(self.on_data(from, bit, &payload)),
            other => {
                self.metrics.protocol_errors += 1;
                Err(EngineError::UnexpectedKind {
                    kind: other.kind(),
                    from,
                })
            }
        }
    }

    pub fn state_of(&self, identity: &SocketAddr) -> TransferState {
        if self.registry.contains(identity) {
            TransferState::Active
        } else {
            TransferState::Unregistered
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Discard every in-progress session without persisting it.  Returns how
    /// many were dropped.
    pub fn shutdown(&mut self) -> usize {
        for identity in self.registry.identities() {
            log::debug!("[engine] {identity}: dropping unfinished session");
        }
        self.registry.clear()
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    fn on_start(&mut self, from: SocketAddr, bit: Bit, filename: String, file_size: u64) -> Message {
        let reply_bit = bit.toggled();

        if let Some(existing) = self.registry.find(&from) {
            self.metrics.rehandshakes += 1;
            log::info!(
                "[engine] {from}: already transferring {}; ignoring request for {filename}",
                existing.filename()
            );
            return Message::Ack { bit: reply_bit };
        }

        let session = Session::new(from, filename, file_size, self.segment_size, bit);

        // Nothing to wait for: the transfer is complete at the handshake.
        // The cap still applies; a refused empty upload is never written.
        if session.is_complete() {
            if self.registry.at_capacity() {
                self.metrics.rejected_handshakes += 1;
                log::warn!(
                    "[engine] {from}: session limit of {} reached; refusing empty {}",
                    self.registry.max_sessions(),
                    session.filename()
                );
                return Message::Nack { bit: reply_bit };
            }
            self.metrics.handshakes += 1;
            return if self.persist(session) {
                Message::Ack { bit: reply_bit }
            } else {
                Message::Nack { bit: reply_bit }
            };
        }

        log::debug!(
            "[engine] {from}: {} -> {} ({} in {} segment(s))",
            TransferState::Unregistered,
            TransferState::Active,
            session.filename(),
            session.total_segments()
        );
        self.metrics.handshakes += 1;

        if self.registry.admit(session) {
            self.metrics.rejected_handshakes += 1;
            log::warn!(
                "[engine] {from}: session limit of {} reached; refusing handshake",
                self.registry.max_sessions()
            );
            Message::Nack { bit: reply_bit }
        } else {
            Message::Ack { bit: reply_bit }
        }
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    fn on_data(&mut self, from: SocketAddr, bit: Bit, payload: &[u8]) -> Message {
        let reply_bit = bit.toggled();

        let Some(session) = self.registry.find_mut(&from) else {
            self.metrics.unknown_peer_data += 1;
            log::warn!("[engine] {from}: data without a session");
            return Message::Nack { bit: reply_bit };
        };

        let outcome = session.accept(bit, payload);
        if outcome != SegmentOutcome::Duplicate && payload.len() > session.segment_size() {
            self.metrics.oversized_segments += 1;
            log::warn!(
                "[engine] {from}: {} byte segment exceeds the {} byte segment size; appended as is",
                payload.len(),
                session.segment_size()
            );
        }

        match outcome {
            SegmentOutcome::Duplicate => {
                self.metrics.duplicates += 1;
                log::debug!("[engine] {from}: duplicate segment bit={bit}; re-acknowledging");
                Message::Ack { bit: reply_bit }
            }
            SegmentOutcome::Accepted => {
                self.metrics.segments_accepted += 1;
                log::debug!(
                    "[engine] {from}: segment {}/{} ({} bytes)",
                    session.accepted_segments(),
                    session.total_segments(),
                    payload.len()
                );
                Message::Ack { bit: reply_bit }
            }
            SegmentOutcome::Completed => {
                self.metrics.segments_accepted += 1;
                let Some(session) = self.registry.remove(&from) else {
                    return Message::Nack { bit: reply_bit };
                };
                if self.persist(session) {
                    Message::Ack { bit: reply_bit }
                } else {
                    Message::Nack { bit: reply_bit }
                }
            }
        }
    }

    /// Write a finished session to the store.  The session is already out of
    /// the registry, so a failure only costs this one transfer.
    fn persist(&mut self, session: Session) -> bool {
        let from = session.identity();
        let filename = session.filename().to_owned();
        let declared = session.file_size();
        let contents = session.into_buffer();

        if contents.len() as u64 != declared {
            log::warn!(
                "[engine] {from}: {filename} declared {declared} bytes but {} arrived",
                contents.len()
            );
        }

        match self.store.persist(&filename, &contents) {
            Ok(path) => {
                self.metrics.completed += 1;
                log::info!(
                    "[engine] {from}: received {filename} ({} bytes) -> {}",
                    contents.len(),
                    path.display()
                );
                log::debug!(
                    "[engine] {from}: {} -> {}",
                    TransferState::Active,
                    TransferState::Completed
                );
                true
            }
            Err(e) => {
                self.metrics.persist_failures += 1;
                log::error!("[engine] {from}: could not save {filename}: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use crate::registry::AdmissionPolicy;
    use crate::store::StoreError;
    use Bit::{One, Zero};

    /// In-memory store recording every write.
    #[derive(Clone, Default)]
    struct MemoryStore {
        files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        writes: Arc<Mutex<u32>>,
        fail: bool,
    }

    impl MemoryStore {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn file(&self, name: &str) -> Option<Vec<u8>> {
            self.files.lock().unwrap().get(name).cloned()
        }

        fn writes(&self) -> u32 {
            *self.writes.lock().unwrap()
        }
    }

    impl FileStore for MemoryStore {
        fn persist(&mut self, filename: &str, contents: &[u8]) -> Result<PathBuf, StoreError> {
            if self.fail {
                return Err(StoreError::Io {
                    path: PathBuf::from(filename),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                });
            }
            *self.writes.lock().unwrap() += 1;
            self.files
                .lock()
                .unwrap()
                .insert(filename.to_owned(), contents.to_vec());
            Ok(PathBuf::from(filename))
        }
    }

    fn peer(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn engine(max_sessions: usize, policy: AdmissionPolicy, store: &MemoryStore) -> Engine {
        Engine::new(
            SessionRegistry::with_policy(max_sessions, policy),
            Box::new(store.clone()),
            10,
        )
    }

    fn start(bit: Bit, name: &str, size: u64) -> Message {
        Message::Start {
            bit,
            filename: name.into(),
            file_size: size,
        }
    }

    fn data(bit: Bit, payload: &[u8]) -> Message {
        Message::Data {
            bit,
            payload: payload.to_vec(),
        }
    }

    fn ack(bit: Bit) -> Message {
        Message::Ack { bit }
    }

    fn nack(bit: Bit) -> Message {
        Message::Nack { bit }
    }

    #[test]
    fn three_segment_transfer_completes() {
        let store = MemoryStore::default();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);
        let p = peer(4000);

        assert_eq!(eng.handle(p, start(Zero, "out.bin", 25)).unwrap(), ack(One));
        assert_eq!(eng.state_of(&p), TransferState::Active);
        assert_eq!(eng.handle(p, data(One, b"0123456789")).unwrap(), ack(Zero));
        assert_eq!(eng.handle(p, data(Zero, b"abcdefghij")).unwrap(), ack(One));
        assert_eq!(eng.handle(p, data(One, b"XYZ!?")).unwrap(), ack(Zero));

        assert_eq!(
            store.file("out.bin").unwrap(),
            b"0123456789abcdefghijXYZ!?".to_vec()
        );
        assert_eq!(store.writes(), 1);
        assert_eq!(eng.state_of(&p), TransferState::Unregistered);
        assert!(eng.registry().is_empty());
        assert_eq!(eng.metrics().completed, 1);
    }

    #[test]
    fn duplicate_segment_is_acked_but_stored_once() {
        let store = MemoryStore::default();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);
        let p = peer(4001);

        eng.handle(p, start(Zero, "dup.bin", 25)).unwrap();
        eng.handle(p, data(One, b"0123456789")).unwrap();
        assert_eq!(eng.handle(p, data(Zero, b"abcdefghij")).unwrap(), ack(One));
        for _ in 0..3 {
            assert_eq!(eng.handle(p, data(Zero, b"abcdefghij")).unwrap(), ack(One));
        }

        let session = eng.registry().find(&p).unwrap();
        assert_eq!(session.accepted_segments(), 2);
        assert_eq!(session.buffer(), b"0123456789abcdefghij");

        eng.handle(p, data(One, b"XYZ!?")).unwrap();
        assert_eq!(
            store.file("dup.bin").unwrap(),
            b"0123456789abcdefghijXYZ!?".to_vec()
        );
        assert_eq!(eng.metrics().duplicates, 3);
    }

    #[test]
    fn data_matching_handshake_bit_is_a_duplicate() {
        let store = MemoryStore::default();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);
        let p = peer(4002);

        eng.handle(p, start(One, "f", 20)).unwrap();
        assert_eq!(eng.handle(p, data(One, b"0123456789")).unwrap(), ack(Zero));
        assert_eq!(eng.registry().find(&p).unwrap().accepted_segments(), 0);
    }

    #[test]
    fn data_without_session_is_refused() {
        let store = MemoryStore::default();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);
        let p = peer(4003);

        assert_eq!(eng.handle(p, data(Zero, b"stray")).unwrap(), nack(One));
        assert_eq!(eng.handle(p, data(One, b"stray")).unwrap(), nack(Zero));
        assert!(eng.registry().is_empty());
        assert_eq!(eng.metrics().unknown_peer_data, 2);
    }

    #[test]
    fn data_after_completion_is_refused() {
        let store = MemoryStore::default();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);
        let p = peer(4004);

        eng.handle(p, start(Zero, "small", 4)).unwrap();
        assert_eq!(eng.handle(p, data(One, b"tiny")).unwrap(), ack(Zero));
        // Final ack lost; sender retransmits the last segment.
        assert_eq!(eng.handle(p, data(One, b"tiny")).unwrap(), nack(Zero));
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn rehandshake_leaves_session_untouched() {
        let store = MemoryStore::default();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);
        let p = peer(4005);

        eng.handle(p, start(Zero, "keep.txt", 30)).unwrap();
        eng.handle(p, data(One, b"0123456789")).unwrap();
        let before = eng.registry().find(&p).unwrap().clone();

        assert_eq!(eng.handle(p, start(One, "other.txt", 999)).unwrap(), ack(Zero));
        assert_eq!(eng.handle(p, start(Zero, "keep.txt", 30)).unwrap(), ack(One));

        assert_eq!(eng.registry().find(&p).unwrap(), &before);
        assert_eq!(eng.registry().len(), 1);
        assert_eq!(eng.metrics().rehandshakes, 2);
    }

    #[test]
    fn permissive_admission_registers_refused_session() {
        let store = MemoryStore::default();
        let mut eng = engine(2, AdmissionPolicy::Permissive, &store);

        assert_eq!(eng.handle(peer(1), start(Zero, "a", 10)).unwrap(), ack(One));
        assert_eq!(eng.handle(peer(2), start(One, "b", 10)).unwrap(), nack(Zero));
        assert_eq!(eng.handle(peer(3), start(Zero, "c", 10)).unwrap(), nack(One));

        assert_eq!(eng.registry().len(), 3);
        assert_eq!(eng.state_of(&peer(3)), TransferState::Active);
        assert_eq!(eng.metrics().rejected_handshakes, 2);

        // The refused sender can still upload if it ignores the Nack.
        assert_eq!(eng.handle(peer(3), data(One, b"0123456789")).unwrap(), ack(Zero));
        assert_eq!(store.file("c").unwrap(), b"0123456789".to_vec());
    }

    #[test]
    fn strict_admission_forgets_refused_session() {
        let store = MemoryStore::default();
        let mut eng = engine(2, AdmissionPolicy::Strict, &store);

        assert_eq!(eng.handle(peer(1), start(Zero, "a", 10)).unwrap(), ack(One));
        assert_eq!(eng.handle(peer(2), start(One, "b", 10)).unwrap(), nack(Zero));

        assert_eq!(eng.registry().len(), 1);
        assert_eq!(eng.state_of(&peer(2)), TransferState::Unregistered);
        assert_eq!(eng.handle(peer(2), data(Zero, b"0123456789")).unwrap(), nack(One));
    }

    #[test]
    fn completion_frees_a_slot() {
        let store = MemoryStore::default();
        let mut eng = engine(2, AdmissionPolicy::Permissive, &store);

        assert_eq!(eng.handle(peer(1), start(Zero, "a", 3)).unwrap(), ack(One));
        eng.handle(peer(1), data(One, b"abc")).unwrap();
        assert_eq!(eng.handle(peer(2), start(Zero, "b", 3)).unwrap(), ack(One));
    }

    #[test]
    fn zero_length_file_is_written_at_handshake() {
        let store = MemoryStore::default();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);
        let p = peer(4006);

        assert_eq!(eng.handle(p, start(Zero, "empty", 0)).unwrap(), ack(One));
        assert_eq!(store.file("empty").unwrap(), Vec::<u8>::new());
        assert!(eng.registry().is_empty());
    }

    #[test]
    fn zero_length_file_at_the_cap_is_refused_and_not_written() {
        for policy in [AdmissionPolicy::Permissive, AdmissionPolicy::Strict] {
            let store = MemoryStore::default();
            let mut eng = engine(2, policy, &store);

            assert_eq!(eng.handle(peer(1), start(Zero, "a", 10)).unwrap(), ack(One));
            assert_eq!(eng.handle(peer(2), start(Zero, "b", 10)).unwrap(), nack(One));
            let held = eng.registry().len();

            assert_eq!(eng.handle(peer(3), start(Zero, "empty", 0)).unwrap(), nack(One));
            assert_eq!(store.file("empty"), None, "{policy:?}");
            assert_eq!(store.writes(), 0);
            assert_eq!(eng.registry().len(), held);
            assert_eq!(eng.state_of(&peer(3)), TransferState::Unregistered);
            assert_eq!(eng.metrics().rejected_handshakes, 2);
        }
    }

    #[test]
    fn oversized_segment_is_counted_and_kept() {
        let store = MemoryStore::default();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);
        let p = peer(4010);

        eng.handle(p, start(Zero, "big", 12)).unwrap();
        assert_eq!(eng.handle(p, data(One, b"0123456789AB")).unwrap(), ack(Zero));
        assert_eq!(eng.metrics().oversized_segments, 1);

        // A retransmission of the same segment is not counted again.
        eng.handle(p, data(One, b"0123456789AB")).unwrap();
        assert_eq!(eng.metrics().oversized_segments, 1);

        eng.handle(p, data(Zero, b"!")).unwrap();
        assert_eq!(store.file("big").unwrap(), b"0123456789AB!".to_vec());
    }

    #[test]
    fn persistence_failure_removes_session_and_refuses() {
        let store = MemoryStore::failing();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);
        let p = peer(4007);

        eng.handle(p, start(Zero, "/readonly/out", 5)).unwrap();
        assert_eq!(eng.handle(p, data(One, b"bytes")).unwrap(), nack(Zero));
        assert!(eng.registry().is_empty());
        assert_eq!(eng.metrics().persist_failures, 1);
        assert_eq!(eng.metrics().completed, 0);
    }

    #[test]
    fn server_only_kinds_are_protocol_errors() {
        let store = MemoryStore::default();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);
        let p = peer(4008);

        let err = eng.handle(p, ack(One)).unwrap_err();
        assert_eq!(
            err,
            EngineError::UnexpectedKind {
                kind: Kind::Ack,
                from: p
            }
        );
        assert!(eng.handle(p, nack(Zero)).is_err());
        assert_eq!(eng.metrics().protocol_errors, 2);
    }

    #[test]
    fn interleaved_senders_stay_independent() {
        let store = MemoryStore::default();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);
        let (a, b) = (peer(5001), peer(5002));

        eng.handle(a, start(Zero, "a.txt", 15)).unwrap();
        eng.handle(b, start(One, "b.txt", 15)).unwrap();
        eng.handle(a, data(One, b"AAAAAAAAAA")).unwrap();
        eng.handle(b, data(Zero, b"BBBBBBBBBB")).unwrap();
        eng.handle(b, data(One, b"bbbbb")).unwrap();
        eng.handle(a, data(Zero, b"aaaaa")).unwrap();

        assert_eq!(store.file("a.txt").unwrap(), b"AAAAAAAAAAaaaaa".to_vec());
        assert_eq!(store.file("b.txt").unwrap(), b"BBBBBBBBBBbbbbb".to_vec());
    }

    #[test]
    fn shutdown_drops_unfinished_sessions_without_writing() {
        let store = MemoryStore::default();
        let mut eng = engine(10, AdmissionPolicy::Permissive, &store);

        eng.handle(peer(1), start(Zero, "half", 20)).unwrap();
        eng.handle(peer(1), data(One, b"0123456789")).unwrap();
        eng.handle(peer(2), start(Zero, "none", 20)).unwrap();

        assert_eq!(eng.shutdown(), 2);
        assert!(eng.registry().is_empty());
        assert_eq!(store.writes(), 0);
    }
}
