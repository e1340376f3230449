//! Per-link statistics and health.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::LinkError;
use crate::types::LinkHealth;

/// Snapshot of one link's counters and estimates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkStats {
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    pub receive_failures: u64,
    pub consecutive_failures: u32,
    pub health: LinkHealth,
    /// Smoothed round-trip time, once a sample exists.
    pub srtt: Option<Duration>,
    pub rtt_var: Duration,
    /// Fraction of recent probes that went unanswered on this link.
    pub loss_ratio: f64,
    pub last_send: Option<Instant>,
    pub last_recv: Option<Instant>,
    pub last_error: Option<String>,
}

/// Smoothed RTT estimator (Jacobson/Karels).
#[derive(Debug, Default)]
struct RttTracker {
    smoothed_rtt: Option<Duration>,
    rtt_var: Duration,
}

impl RttTracker {
    fn add_sample(&mut self, rtt: Duration) {
        match self.smoothed_rtt {
            None => {
                self.smoothed_rtt = Some(rtt);
                self.rtt_var = rtt / 2;
            }
            Some(srtt) => {
                let rtt_f = rtt.as_secs_f64();
                let srtt_f = srtt.as_secs_f64();
                let rttvar_f = self.rtt_var.as_secs_f64();

                let delta = (rtt_f - srtt_f).abs();
                self.rtt_var = Duration::from_secs_f64(rttvar_f * 0.75 + delta * 0.25);
                self.smoothed_rtt = Some(Duration::from_secs_f64(srtt_f * 0.875 + rtt_f * 0.125));
            }
        }
    }
}

/// Loss ratio over the most recent probe outcomes.
#[derive(Debug)]
struct LossTracker {
    outcomes: VecDeque<bool>,
    window_size: usize,
    lost: usize,
}

impl LossTracker {
    fn new(window_size: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(window_size),
            window_size,
            lost: 0,
        }
    }

    fn record(&mut self, delivered: bool) {
        if self.outcomes.len() >= self.window_size {
            if let Some(false) = self.outcomes.pop_front() {
                self.lost -= 1;
            }
        }
        self.outcomes.push_back(delivered);
        if !delivered {
            self.lost += 1;
        }
    }

    fn loss_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.lost as f64 / self.outcomes.len() as f64
        }
    }
}

/// Number of probe outcomes the loss ratio is computed over.
const LOSS_WINDOW: usize = 64;

/// Mutable per-link bookkeeping owned by the link set.
#[derive(Debug)]
pub(crate) struct LinkMonitor {
    stats: LinkStats,
    rtt: RttTracker,
    loss: LossTracker,
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self {
            stats: LinkStats::default(),
            rtt: RttTracker::default(),
            loss: LossTracker::new(LOSS_WINDOW),
        }
    }
}

impl LinkMonitor {
    /// Links are used until they fail permanently.
    pub fn is_open(&self) -> bool {
        self.stats.health.is_open()
    }

    pub fn health(&self) -> LinkHealth {
        self.stats.health
    }

    pub fn snapshot(&self) -> LinkStats {
        self.stats.clone()
    }

    pub fn record_send(&mut self, bytes: usize, now: Instant) {
        self.stats.datagrams_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        self.stats.last_send = Some(now);
        self.record_success();
    }

    pub fn record_recv(&mut self, bytes: usize, now: Instant) {
        self.stats.datagrams_received += 1;
        self.stats.bytes_received += bytes as u64;
        self.stats.last_recv = Some(now);
        self.record_success();
    }

    pub fn record_send_failure(&mut self, error: &LinkError) {
        self.stats.send_failures += 1;
        self.record_failure(error);
    }

    pub fn record_receive_failure(&mut self, error: &LinkError) {
        self.stats.receive_failures += 1;
        self.record_failure(error);
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        self.rtt.add_sample(rtt);
        self.stats.srtt = self.rtt.smoothed_rtt;
        self.stats.rtt_var = self.rtt.rtt_var;
    }

    pub fn record_probe(&mut self, delivered: bool) {
        self.loss.record(delivered);
        self.stats.loss_ratio = self.loss.loss_ratio();
        self.update_health();
    }

    fn record_failure(&mut self, error: &LinkError) {
        self.stats.consecutive_failures += 1;
        self.stats.last_error = Some(error.to_string());

        if error.is_permanent() {
            self.stats.health = LinkHealth::Down;
            return;
        }
        self.update_health();
    }

    fn record_success(&mut self) {
        if self.stats.health == LinkHealth::Down {
            return;
        }
        self.stats.consecutive_failures = 0;
        self.update_health();
    }

    fn update_health(&mut self) {
        if self.stats.health == LinkHealth::Down {
            return;
        }

        let by_failures = match self.stats.consecutive_failures {
            0..=2 => LinkHealth::Healthy,
            3..=5 => LinkHealth::Degraded,
            _ => LinkHealth::Unhealthy,
        };
        let loss = self.stats.loss_ratio;
        let by_loss = if loss > 0.3 {
            LinkHealth::Unhealthy
        } else if loss > 0.1 {
            LinkHealth::Degraded
        } else {
            LinkHealth::Healthy
        };

        self.stats.health = if by_failures == LinkHealth::Unhealthy || by_loss == LinkHealth::Unhealthy
        {
            LinkHealth::Unhealthy
        } else if by_failures == LinkHealth::Degraded || by_loss == LinkHealth::Degraded {
            LinkHealth::Degraded
        } else {
            LinkHealth::Healthy
        };
    }
}
