//! Reference workload generator (supplemental to the core spec): a
//! Poisson arrival process over a configurable tenant/SLO mix,
//! producing a plain `Iterator<Item = Request>` the way a real load
//! generator or trace replayer would, so `blis-engine::submit` never
//! needs to know which one it's fed by.
//!
//! Every draw comes from one `blis-rng::RngStream`, including the
//! request id itself (`RequestId::from_u64_pair`) — a workload run is
//! as reproducible as any other subsystem for the same seed.

use blis_rng::RngStream;
use blis_types::{Request, RequestId, SloClass, TenantId, Ticks};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantMix {
    weights: Vec<(TenantId, f64)>,
}

impl TenantMix {
    pub fn new(weights: Vec<(TenantId, f64)>) -> Self {
        assert!(!weights.is_empty(), "tenant mix must name at least one tenant");
        assert!(weights.iter().all(|(_, w)| *w > 0.0), "tenant weights must be positive");
        Self { weights }
    }

    /// Same invariant `new` asserts, as a check callers that build a
    /// `TenantMix` from deserialized config can run before trusting it.
    pub fn is_valid(&self) -> bool {
        !self.weights.is_empty() && self.weights.iter().all(|(_, w)| *w > 0.0 && w.is_finite())
    }

    fn sample(&self, rng: &mut RngStream) -> TenantId {
        weighted_pick(&self.weights, rng).clone()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SloMix {
    weights: Vec<(SloClass, f64)>,
}

impl SloMix {
    pub fn new(weights: Vec<(SloClass, f64)>) -> Self {
        assert!(!weights.is_empty(), "slo mix must name at least one class");
        assert!(weights.iter().all(|(_, w)| *w > 0.0), "slo weights must be positive");
        Self { weights }
    }

    /// Same invariant `new` asserts, as a check callers that build an
    /// `SloMix` from deserialized config can run before trusting it.
    pub fn is_valid(&self) -> bool {
        !self.weights.is_empty() && self.weights.iter().all(|(_, w)| *w > 0.0 && w.is_finite())
    }

    fn sample(&self, rng: &mut RngStream) -> SloClass {
        *weighted_pick(&self.weights, rng)
    }
}

fn weighted_pick<'a, T>(weights: &'a [(T, f64)], rng: &mut RngStream) -> &'a T {
    let total: f64 = weights.iter().map(|(_, w)| w).sum();
    let mut draw = rng.next_f64() * total;
    for (item, w) in weights {
        if draw < *w {
            return item;
        }
        draw -= w;
    }
    &weights.last().expect("weights is non-empty").0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Mean arrivals per tick.
    pub arrival_rate: f64,
    pub tenants: TenantMix,
    pub slo_mix: SloMix,
    pub input_len_range: (u32, u32),
    pub output_len_range: (u32, u32),
    pub model_tag: String,
    /// Stop generating once the next arrival would land past this tick.
    pub horizon: Ticks,
}

/// A Poisson arrival process: inter-arrival gaps are drawn
/// `exponential(arrival_rate)` and rounded up to at least one tick, so
/// two requests never share exactly the same arrival time.
pub struct PoissonWorkload {
    rng: RngStream,
    config: WorkloadConfig,
    next_arrival: Ticks,
}

impl PoissonWorkload {
    pub fn new(rng: RngStream, config: WorkloadConfig) -> Self {
        Self { rng, config, next_arrival: 0 }
    }
}

impl Iterator for PoissonWorkload {
    type Item = Request;

    fn next(&mut self) -> Option<Request> {
        let arrival = self.next_arrival;
        if arrival > self.config.horizon {
            return None;
        }

        let gap_ticks = self.rng.exponential(self.config.arrival_rate).round().max(1.0) as Ticks;
        self.next_arrival = arrival + gap_ticks;

        let tenant = self.config.tenants.sample(&mut self.rng);
        let slo_class = self.config.slo_mix.sample(&mut self.rng);
        let input_len = self.rng.uniform_range(self.config.input_len_range.0 as u64, self.config.input_len_range.1 as u64 + 1) as u32;
        let output_len = self.rng.uniform_range(self.config.output_len_range.0 as u64, self.config.output_len_range.1 as u64 + 1) as u32;
        let id = RequestId::from_u64_pair(self.rng.next_u64(), self.rng.next_u64());

        Some(Request::new(
            id,
            arrival,
            (0..input_len).collect(),
            (0..output_len).collect(),
            tenant,
            slo_class,
            self.config.model_tag.clone(),
        ))
    }
}
