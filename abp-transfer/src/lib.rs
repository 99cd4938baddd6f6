//! `abp-transfer` — alternating-bit (stop-and-wait) file upload over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  s|b|name|size, d|b|bytes   ┌──────────────────────────┐
//!  │ Uploader │────────────────────────────▶│ Server (dispatch loop)   │
//!  └──────────┘◀────────────────────────────│  recv → decode → handle  │
//!                  a|b'  /  n|b'            └────────────┬─────────────┘
//!                                                        │
//!                                           ┌────────────▼─────────────┐
//!                                           │ Engine                   │
//!                                           │  SessionRegistry ─ cap   │
//!                                           │  Session per peer        │
//!                                           │  FileStore on completion │
//!                                           └──────────────────────────┘
//! ```
//!
//! The server is single-threaded and holds all state inside the [`engine`];
//! nothing is locked.  Every reply carries the toggled bit `b' = b + 1 mod 2`.
//!
//! Modules:
//! - [`packet`]    — wire format (encode / decode)
//! - [`session`]   — per-peer reassembly and duplicate detection
//! - [`registry`]  — sessions keyed by peer address, admission cap
//! - [`store`]     — writing finished files
//! - [`state`]     — per-peer transfer state
//! - [`engine`]    — protocol rules: one message in, one reply out
//! - [`config`]    — server startup parameters
//! - [`socket`]    — async UDP socket abstraction
//! - [`server`]    — dispatch loop and shutdown
//! - [`timer`]     — sender retransmit timer
//! - [`uploader`]  — reference stop-and-wait sender
//! - [`simulator`] — lossy relay for testing retransmission

pub mod config;
pub mod engine;
pub mod packet;
pub mod registry;
pub mod server;
pub mod session;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod store;
pub mod timer;
pub mod uploader;
