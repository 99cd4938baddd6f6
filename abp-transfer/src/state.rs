//! Transfer finite-state-machine types.
//!
//! Every sender identity is in exactly one of these states from the server's
//! point of view.  Transitions are driven by [`crate::engine::Engine`]; this
//! module only names them so the engine can log and report them.
//!
//! ```text
//!                 Start                 last Data accepted
//!  UNREGISTERED ─────────▶ ACTIVE ───────────────────────▶ COMPLETED
//!       ▲                   │  ▲                                │
//!       │                   │  │ Data (new bit or duplicate)    │
//!       │                   └──┘                                │
//!       └───────────── session removed, file persisted ─────────┘
//! ```
//!
//! `Completed` is terminal and never stored: the session is removed in the
//! same step, so the next message from that identity sees `Unregistered`.

/// Server-side state of one sender identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    /// No session exists for the identity.
    #[default]
    Unregistered,
    /// Handshake accepted; segments are being collected.
    Active,
    /// Every declared segment arrived; the file has been handed to storage.
    Completed,
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferState::Unregistered => "UNREGISTERED",
            TransferState::Active => "ACTIVE",
            TransferState::Completed => "COMPLETED",
        };
        f.write_str(name)
    }
}
