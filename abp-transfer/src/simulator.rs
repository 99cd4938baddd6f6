//! Lossy UDP relay for exercising retransmission.
//!
//! A [`Simulator`] sits between one sender and the server and forwards
//! datagrams in both directions, applying a seeded fault model on the way:
//!
//! | Fault       | Description                                           |
//! |-------------|-------------------------------------------------------|
//! | Loss        | Drop a datagram with probability `loss_rate`.         |
//! | Duplication | Deliver a datagram twice with probability `duplicate_rate`. |
//!
//! ```text
//!  sender ──▶ front ─[faults]─▶ back ──▶ server
//!  sender ◀── front ◀─[faults?]─ back ◀── server
//! ```
//!
//! Faults apply to the upstream direction always and to replies only when
//! `faults_downstream` is set.  The server forgets a session as soon as the
//! last segment arrives, so a lost final Ack leaves the sender with nobody to
//! retransmit to; keep downstream faults off when the upload must succeed.
//!
//! The relay serves a single sender: replies go to whoever sent last.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Fault model for a [`Simulator`].
///
/// Probabilities are clamped to `[0.0, 1.0]`; a non-finite rate counts as 0.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that a datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a forwarded datagram is sent twice.
    pub duplicate_rate: f64,
    /// Apply faults to server replies as well.
    pub faults_downstream: bool,
    /// RNG seed, so a failing run can be replayed.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // Transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            faults_downstream: false,
            seed: 0,
        }
    }
}

/// Counters shared with the relay task.
#[derive(Debug, Default)]
pub struct SimulatorStats {
    pub forwarded: AtomicU64,
    pub dropped: AtomicU64,
    pub duplicated: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Drop,
    Deliver,
    Duplicate,
}

/// Clamp `rate` into `[0.0, 1.0]`; NaN and infinities disable the fault.
fn probability(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn decide(rng: &mut StdRng, config: &SimulatorConfig) -> Fate {
    if rng.random_bool(probability(config.loss_rate)) {
        Fate::Drop
    } else if rng.random_bool(probability(config.duplicate_rate)) {
        Fate::Duplicate
    } else {
        Fate::Deliver
    }
}

/// A running relay.  Dropping it stops the relay task.
pub struct Simulator {
    /// Address senders should target instead of the server.
    pub local_addr: SocketAddr,
    stats: Arc<SimulatorStats>,
    task: JoinHandle<()>,
}

impl Simulator {
    /// Bind a loopback relay in front of `server` and start forwarding.
    pub async fn spawn(server: SocketAddr, config: SimulatorConfig) -> std::io::Result<Self> {
        let front = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let back = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = front.local_addr()?;
        let stats = Arc::new(SimulatorStats::default());
        log::debug!("[sim] {local_addr} relaying to {server} ({config:?})");
        let task = tokio::spawn(relay(front, back, server, config, Arc::clone(&stats)));
        Ok(Self {
            local_addr,
            stats,
            task,
        })
    }

    pub fn stats(&self) -> &SimulatorStats {
        &self.stats
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn relay(
    front: UdpSocket,
    back: UdpSocket,
    server: SocketAddr,
    config: SimulatorConfig,
    stats: Arc<SimulatorStats>,
) {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut client: Option<SocketAddr> = None;
    let mut up = vec![0u8; 65_536];
    let mut down = vec![0u8; 65_536];

    loop {
        tokio::select! {
            received = front.recv_from(&mut up) => {
                let Ok((n, from)) = received else { continue };
                client = Some(from);
                let fate = decide(&mut rng, &config);
                forward(&back, &up[..n], server, fate, &stats).await;
            }
            received = back.recv_from(&mut down) => {
                let Ok((n, _)) = received else { continue };
                let Some(to) = client else { continue };
                let fate = if config.faults_downstream {
                    decide(&mut rng, &config)
                } else {
                    Fate::Deliver
                };
                forward(&front, &down[..n], to, fate, &stats).await;
            }
        }
    }
}

async fn forward(socket: &UdpSocket, datagram: &[u8], to: SocketAddr, fate: Fate, stats: &SimulatorStats) {
    let copies = match fate {
        Fate::Drop => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("[sim] dropped {} bytes for {to}", datagram.len());
            return;
        }
        Fate::Deliver => 1,
        Fate::Duplicate => {
            stats.duplicated.fetch_add(1, Ordering::Relaxed);
            2
        }
    };
    for _ in 0..copies {
        if let Err(e) = socket.send_to(datagram, to).await {
            log::debug!("[sim] forward to {to} failed: {e}");
            return;
        }
    }
    stats.forwarded.fetch_add(1, Ordering::Relaxed);
}
