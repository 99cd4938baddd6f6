//! Retransmit timer for the stop-and-wait sender.
//!
//! The server never retransmits; the sender owns recovery.  After each send it
//! waits [`RetransmitTimer::rto`] for the matching acknowledgment and resends
//! the same message if none arrives.
//!
//! RTO follows RFC 6298:
//!   `RTO = SRTT + 4 × RTTVAR`
//! doubles on each consecutive timeout (exponential back-off) up to
//! [`TimerConfig::max_rto`], and gives up after [`TimerConfig::max_retries`]
//! consecutive timeouts.  RTT samples are only taken from messages that were
//! sent exactly once (Karn's rule), since an ack for a retransmitted message
//! cannot be matched to a particular transmission.

use std::time::Duration;

/// Adjustable timeout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// Lower bound applied to computed RTOs.
    pub min_rto: Duration,
    /// Upper bound reached by back-off.
    pub max_rto: Duration,
    /// Consecutive timeouts tolerated for one message.
    pub max_retries: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(500),
            min_rto: Duration::from_millis(50),
            max_rto: Duration::from_secs(10),
            max_retries: 8,
        }
    }
}

/// RTO estimator and retry budget for one sender.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    pub config: TimerConfig,
    current_rto: Duration,
    srtt: Option<Duration>,
    rttvar: Duration,
    retries: u32,
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        Self::new(TimerConfig::default())
    }
}

impl RetransmitTimer {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            current_rto: config.initial_rto,
            config,
            srtt: None,
            rttvar: Duration::ZERO,
            retries: 0,
        }
    }

    /// How long to wait for the current message's acknowledgment.
    pub fn rto(&self) -> Duration {
        self.current_rto
    }

    /// Consecutive timeouts for the current message.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Fold a new RTT sample into SRTT / RTTVAR (RFC 6298 §2) and clear the
    /// retry count.
    pub fn on_ack(&mut self, sample: Option<Duration>) {
        if let Some(r) = sample {
            match self.srtt {
                None => {
                    self.srtt = Some(r);
                    self.rttvar = r / 2;
                }
                Some(srtt) => {
                    self.rttvar = self.rttvar * 3 / 4 + r.abs_diff(srtt) / 4;
                    self.srtt = Some(srtt * 7 / 8 + r / 8);
                }
            }
        }
        self.retries = 0;
        self.current_rto = match self.srtt {
            Some(srtt) => (srtt + self.rttvar * 4).clamp(self.config.min_rto, self.config.max_rto),
            None => self.config.initial_rto,
        };
    }

    /// Record a timeout and double the RTO (RFC 6298 §5.5).
    ///
    /// Returns `false` once the retry budget is exhausted; the caller should
    /// give up instead of retransmitting.
    pub fn on_timeout(&mut self) -> bool {
        self.retries += 1;
        self.current_rto = (self.current_rto * 2).min(self.config.max_rto);
        self.retries <= self.config.max_retries
    }
}
