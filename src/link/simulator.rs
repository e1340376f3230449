//! Network impairment simulator.
//!
//! [`LinkSimulator`] sits in front of another link and decides, per outgoing
//! datagram, whether to drop, delay, duplicate or reorder it. Every decision
//! comes from a ChaCha8 RNG seeded from the config, and every decision draws
//! the same number of values, so a given seed and send sequence always
//! produces the same impairments.
//!
//! Delayed datagrams wait in a queue until [`Link::service`] is called with a
//! time at or past their release instant. Nothing releases them in the
//! background: held datagrams (delayed, duplicated or reordered) only reach
//! the wire while the sending endpoint keeps driving its loop through
//! `Endpoint::drive` or `Endpoint::poll_received`, both of which service
//! every link. An endpoint that sends and then goes idle leaves them queued.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::Link;
use crate::error::{Error, LinkError, Result};

/// Longest delay the simulator will hold a datagram for.
pub const MAX_SIMULATED_DELAY: Duration = Duration::from_secs(600);

/// Upper bound for [`SimulatorConfig::jitter_factor`].
pub const MAX_JITTER_FACTOR: f64 = 10.0;

/// Impairments applied to outgoing datagrams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Probability in [0, 1] that a datagram is dropped.
    #[serde(default)]
    pub loss_rate: f64,

    /// Lower bound of the base one-way delay.
    #[serde(default, with = "humantime_serde")]
    pub min_latency: Duration,

    /// Upper bound of the base one-way delay.
    #[serde(default, with = "humantime_serde")]
    pub max_latency: Duration,

    /// Extra delay as a fraction of the base delay, scaled by a uniform draw.
    #[serde(default)]
    pub jitter_factor: f64,

    /// Probability that a datagram is sent twice.
    #[serde(default)]
    pub duplicate_rate: f64,

    /// Probability that a datagram swaps release times with the newest
    /// datagram already queued.
    #[serde(default)]
    pub reorder_rate: f64,

    /// RNG seed.
    #[serde(default)]
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self::lossless()
    }
}

impl SimulatorConfig {
    /// Perfect link: no loss, no delay.
    pub fn lossless() -> Self {
        Self {
            loss_rate: 0.0,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            jitter_factor: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            seed: 0,
        }
    }

    /// Drops every datagram.
    pub fn blackhole() -> Self {
        Self {
            loss_rate: 1.0,
            ..Self::lossless()
        }
    }

    /// Independent loss with the given probability and no delay.
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Self::lossless()
        }
    }

    /// A congested mobile uplink.
    pub fn cellular() -> Self {
        Self {
            loss_rate: 0.05,
            min_latency: Duration::from_millis(30),
            max_latency: Duration::from_millis(80),
            jitter_factor: 0.5,
            duplicate_rate: 0.01,
            reorder_rate: 0.05,
            seed: 0,
        }
    }

    /// A geostationary satellite hop.
    pub fn satellite() -> Self {
        Self {
            loss_rate: 0.02,
            min_latency: Duration::from_millis(550),
            max_latency: Duration::from_millis(650),
            jitter_factor: 0.1,
            duplicate_rate: 0.0,
            reorder_rate: 0.01,
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min;
        self.max_latency = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("loss_rate", self.loss_rate),
            ("duplicate_rate", self.duplicate_rate),
            ("reorder_rate", self.reorder_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::InvalidConfig(format!(
                    "simulator {name} must be within [0, 1], got {rate}"
                )));
            }
        }
        if !(0.0..=MAX_JITTER_FACTOR).contains(&self.jitter_factor) {
            return Err(Error::InvalidConfig(format!(
                "simulator jitter_factor must be within [0, {MAX_JITTER_FACTOR}], got {}",
                self.jitter_factor
            )));
        }
        if self.max_latency > MAX_SIMULATED_DELAY {
            return Err(Error::InvalidConfig(format!(
                "simulator max_latency {:?} exceeds the {MAX_SIMULATED_DELAY:?} limit",
                self.max_latency
            )));
        }
        if self.min_latency > self.max_latency {
            return Err(Error::InvalidConfig(format!(
                "simulator min_latency {:?} exceeds max_latency {:?}",
                self.min_latency, self.max_latency
            )));
        }
        Ok(())
    }
}

/// What the simulator does with one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimDecision {
    pub drop: bool,
    pub delay: Duration,
    /// Delay of the second copy, if the datagram is duplicated.
    pub duplicate: Option<Duration>,
    pub reorder: bool,
}

/// Seeded source of [`SimDecision`]s.
#[derive(Debug, Clone)]
pub struct ImpairmentModel {
    config: SimulatorConfig,
    rng: ChaCha8Rng,
}

impl ImpairmentModel {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Replace the impairment parameters. The RNG stream continues.
    pub fn set_config(&mut self, config: SimulatorConfig) {
        self.config = config;
    }

    /// Decide the fate of the next datagram.
    pub fn decide(&mut self) -> SimDecision {
        // Draw everything up front so the stream position never depends on
        // earlier outcomes.
        let loss: f64 = self.rng.gen();
        let latency: f64 = self.rng.gen();
        let jitter: f64 = self.rng.gen();
        let duplicate: f64 = self.rng.gen();
        let duplicate_latency: f64 = self.rng.gen();
        let duplicate_jitter: f64 = self.rng.gen();
        let reorder: f64 = self.rng.gen();

        if loss < self.config.loss_rate {
            return SimDecision {
                drop: true,
                delay: Duration::ZERO,
                duplicate: None,
                reorder: false,
            };
        }

        SimDecision {
            drop: false,
            delay: self.delay(latency, jitter),
            duplicate: (duplicate < self.config.duplicate_rate)
                .then(|| self.delay(duplicate_latency, duplicate_jitter)),
            reorder: reorder < self.config.reorder_rate,
        }
    }

    /// Base latency plus jitter, capped at [`MAX_SIMULATED_DELAY`] even for
    /// configs that never went through [`SimulatorConfig::validate`].
    fn delay(&self, latency: f64, jitter: f64) -> Duration {
        let min = self.config.min_latency.min(MAX_SIMULATED_DELAY);
        let max = self.config.max_latency.min(MAX_SIMULATED_DELAY);
        let base = if max <= min {
            min
        } else {
            min + (max - min).mul_f64(latency)
        };

        let jitter_factor = self.config.jitter_factor;
        if base.is_zero() || jitter_factor == 0.0 {
            return base;
        }
        let scaled = base.as_secs_f64() * (1.0 + jitter_factor * jitter);
        Duration::try_from_secs_f64(scaled)
            .map_or(MAX_SIMULATED_DELAY, |delay| delay.min(MAX_SIMULATED_DELAY))
    }
}

/// Counters kept by a simulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    /// Datagrams offered to the simulator.
    pub offered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
    /// Datagrams queued for later release.
    pub delayed: u64,
    /// Datagrams handed to the inner link.
    pub released: u64,
    /// Releases the inner link refused.
    pub release_failures: u64,
}

#[derive(Debug)]
struct SimState {
    model: ImpairmentModel,
    /// Release instant and insertion sequence to datagram.
    pending: BTreeMap<(Instant, u64), Bytes>,
    seq: u64,
    stats: SimulatorStats,
}

impl SimState {
    fn schedule(&mut self, at: Instant, datagram: Bytes) -> (Instant, u64) {
        let key = (at, self.seq);
        self.seq += 1;
        self.pending.insert(key, datagram);
        self.stats.delayed += 1;
        key
    }

    /// Swap the release time of `key` with the latest other queued datagram.
    fn swap_with_latest(&mut self, key: (Instant, u64)) -> bool {
        let Some(&other) = self.pending.keys().rev().find(|k| **k != key) else {
            return false;
        };
        let (Some(mine), Some(theirs)) = (self.pending.remove(&key), self.pending.remove(&other))
        else {
            return false;
        };
        self.pending.insert((other.0, key.1), mine);
        self.pending.insert((key.0, other.1), theirs);
        true
    }

    fn take_due(&mut self, now: Instant) -> Vec<Bytes> {
        let later = self.pending.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut self.pending, later);
        due.into_values().collect()
    }
}

/// Shared view of a simulator's state, usable after the link has been
/// handed to a link set.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatorHandle {
    pub fn stats(&self) -> SimulatorStats {
        self.state.lock().stats
    }

    /// Datagrams waiting for release.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn config(&self) -> SimulatorConfig {
        self.state.lock().model.config().clone()
    }

    /// Change the impairments of a live link.
    pub fn set_config(&self, config: SimulatorConfig) {
        self.state.lock().model.set_config(config);
    }
}

/// A link wrapped with simulated impairments on its send path.
#[derive(Debug)]
pub struct LinkSimulator<L> {
    inner: L,
    state: Arc<Mutex<SimState>>,
}

impl<L: Link> LinkSimulator<L> {
    pub fn new(inner: L, config: SimulatorConfig) -> Self {
        tracing::debug!(
            link = %inner.label(),
            loss = config.loss_rate,
            min_latency = ?config.min_latency,
            max_latency = ?config.max_latency,
            seed = config.seed,
            "Link simulator attached"
        );

        Self {
            inner,
            state: Arc::new(Mutex::new(SimState {
                model: ImpairmentModel::new(config),
                pending: BTreeMap::new(),
                seq: 0,
                stats: SimulatorStats::default(),
            })),
        }
    }

    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn stats(&self) -> SimulatorStats {
        self.state.lock().stats
    }
}

#[async_trait]
impl<L: Link> Link for LinkSimulator<L> {
    fn mtu(&self) -> usize {
        self.inner.mtu()
    }

    async fn send(&self, datagram: &[u8]) -> std::result::Result<(), LinkError> {
        if datagram.len() > self.inner.mtu() {
            return Err(LinkError::MtuExceeded {
                size: datagram.len(),
                max: self.inner.mtu(),
            });
        }

        let now = Instant::now();
        let passthrough = {
            let mut state = self.state.lock();
            let decision = state.model.decide();
            state.stats.offered += 1;

            if decision.drop {
                state.stats.dropped += 1;
                tracing::trace!(link = %self.inner.label(), len = datagram.len(), "Simulated loss");
                return Ok(());
            }

            let immediate = decision.delay.is_zero()
                && decision.duplicate.is_none()
                && !decision.reorder
                && state.pending.is_empty();

            if !immediate {
                let bytes = Bytes::copy_from_slice(datagram);
                let key = state.schedule(now + decision.delay, bytes.clone());
                if decision.reorder && state.swap_with_latest(key) {
                    state.stats.reordered += 1;
                }
                if let Some(delay) = decision.duplicate {
                    state.schedule(now + delay, bytes);
                    state.stats.duplicated += 1;
                }
            }
            immediate
        };

        if passthrough {
            self.inner.send(datagram).await?;
            self.state.lock().stats.released += 1;
        }
        Ok(())
    }

    fn try_recv(&self) -> std::result::Result<Option<Bytes>, LinkError> {
        self.inner.try_recv()
    }

    async fn readable(&self) -> std::result::Result<(), LinkError> {
        self.inner.readable().await
    }

    async fn service(&self, now: Instant) -> std::result::Result<(), LinkError> {
        let due = self.state.lock().take_due(now);
        let mut last_error = None;

        for datagram in due {
            match self.inner.send(&datagram).await {
                Ok(()) => self.state.lock().stats.released += 1,
                Err(e) => {
                    self.state.lock().stats.release_failures += 1;
                    last_error = Some(e);
                }
            }
        }

        self.inner.service(now).await?;
        last_error.map_or(Ok(()), Err)
    }

    fn next_deadline(&self) -> Option<Instant> {
        let own = self.state.lock().pending.keys().next().map(|(at, _)| *at);
        match (own, self.inner.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn kind(&self) -> &'static str {
        "simulated"
    }

    fn label(&self) -> String {
        format!("sim({})", self.inner.label())
    }
}
