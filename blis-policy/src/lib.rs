//! Policy plane (§4.7): admission, priority, and routing decisions as
//! small, swappable, mostly-pure components. Mirrors the ancestor
//! kernel's `PolicyDecision`/`PolicyEngine` split — a decision is always
//! an explicit enum a caller must match on, never a bare bool — and its
//! `Router` trait of one pluggable decision behind a narrow interface.

use blis_types::{InstanceId, Request, RoutingSnapshot};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("routing weights must be finite, non-negative, and not all zero")]
    InvalidWeights,
    #[error("routing requires at least one candidate instance")]
    NoCandidates,
}

/// Outcome of an admission check. `Reject` always carries a reason so
/// it can be surfaced in metrics and decision traces without the
/// caller having to reconstruct why.
#[derive(Clone, Debug, PartialEq)]
pub enum AdmissionDecision {
    Admit,
    Reject(String),
}

pub trait AdmissionPolicy {
    fn admit(&self, request: &Request, cluster_queue_depth: u32) -> AdmissionDecision;
}

/// Admits everything; the degenerate baseline.
#[derive(Default)]
pub struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn admit(&self, _request: &Request, _cluster_queue_depth: u32) -> AdmissionDecision {
        AdmissionDecision::Admit
    }
}

/// Rejects once the whole cluster's wait queues exceed a fixed depth,
/// the simplest load-shedding policy a real deployment would run.
pub struct QueueDepthAdmission {
    pub max_total_queue_depth: u32,
}

impl AdmissionPolicy for QueueDepthAdmission {
    fn admit(&self, _request: &Request, cluster_queue_depth: u32) -> AdmissionDecision {
        if cluster_queue_depth >= self.max_total_queue_depth {
            AdmissionDecision::Reject(format!(
                "cluster queue depth {cluster_queue_depth} at or above limit {}",
                self.max_total_queue_depth
            ))
        } else {
            AdmissionDecision::Admit
        }
    }
}

/// Assigns a request's scheduling priority. Kept distinct from
/// admission and routing so a priority scheme can be swapped without
/// touching either.
pub trait PriorityPolicy {
    fn priority(&self, request: &Request) -> f64;
}

/// Fixed priority per SLO class; the common case.
pub struct SloClassPriority {
    pub interactive: f64,
    pub standard: f64,
    pub best_effort: f64,
}

impl Default for SloClassPriority {
    fn default() -> Self {
        Self { interactive: 100.0, standard: 10.0, best_effort: 1.0 }
    }
}

impl PriorityPolicy for SloClassPriority {
    fn priority(&self, request: &Request) -> f64 {
        use blis_types::SloClass::*;
        match request.slo_class {
            Interactive => self.interactive,
            Standard => self.standard,
            BestEffort => self.best_effort,
        }
    }
}

/// One signal contributing to a routing score. Implementations must be
/// pure functions of the snapshot and request — no hidden state, no
/// clock reads — so routing stays reproducible from a trace alone.
pub trait RouteScorer {
    fn score(&self, snapshot: &RoutingSnapshot, request: &Request) -> f64;
    fn name(&self) -> &'static str;
}

/// Prefers instances with a shorter wait queue.
pub struct QueueDepthScorer;
impl RouteScorer for QueueDepthScorer {
    fn score(&self, snapshot: &RoutingSnapshot, _request: &Request) -> f64 {
        -(snapshot.queue_depth as f64)
    }
    fn name(&self) -> &'static str {
        "queue_depth"
    }
}

/// Prefers instances with more free KV capacity.
pub struct KvUtilizationScorer;
impl RouteScorer for KvUtilizationScorer {
    fn score(&self, snapshot: &RoutingSnapshot, _request: &Request) -> f64 {
        -snapshot.kv_utilization
    }
    fn name(&self) -> &'static str {
        "kv_utilization"
    }
}

/// Prefers instances the router has already dispatched to but whose
/// `Enqueue` event hasn't fired yet — the causal pending-request
/// correction described in §4.7, without which a burst of
/// simultaneous arrivals all pile onto the one instance that looked
/// least loaded at snapshot time.
pub struct PendingRoutesScorer;
impl RouteScorer for PendingRoutesScorer {
    fn score(&self, snapshot: &RoutingSnapshot, _request: &Request) -> f64 {
        -(snapshot.pending_routes as f64)
    }
    fn name(&self) -> &'static str {
        "pending_routes"
    }
}

/// Prefers instances that are likely to already hold this request's
/// prefix in their KV cache.
pub struct CacheAffinityScorer;
impl RouteScorer for CacheAffinityScorer {
    fn score(&self, snapshot: &RoutingSnapshot, _request: &Request) -> f64 {
        snapshot.cache_hit_rate.unwrap_or(0.0)
    }
    fn name(&self) -> &'static str {
        "cache_affinity"
    }
}

/// A routing decision together with every candidate's score, for
/// collaborators (the decision trace) that need to explain the pick,
/// not just act on it.
#[derive(Clone, Debug)]
pub struct ScoredRoute {
    pub chosen: InstanceId,
    pub scores: Vec<(InstanceId, f64)>,
}

/// Routes by weighted sum of scorers, argmax over candidates, ties
/// broken by lowest `InstanceId` for reproducibility.
pub struct WeightedRoutingPolicy {
    scorers: Vec<(Box<dyn RouteScorer + Send + Sync>, f64)>,
}

impl WeightedRoutingPolicy {
    pub fn new(scorers: Vec<(Box<dyn RouteScorer + Send + Sync>, f64)>) -> Result<Self, PolicyError> {
        if scorers.is_empty() || scorers.iter().all(|(_, w)| *w == 0.0) {
            return Err(PolicyError::InvalidWeights);
        }
        if scorers.iter().any(|(_, w)| !w.is_finite() || *w < 0.0) {
            return Err(PolicyError::InvalidWeights);
        }
        Ok(Self { scorers })
    }

    pub fn route(&self, candidates: &[RoutingSnapshot], request: &Request) -> Result<InstanceId, PolicyError> {
        self.route_scored(candidates, request).map(|r| r.chosen)
    }

    /// Same decision as [`Self::route`], plus every candidate's score,
    /// so a caller recording a decision trace (§4.8) has something to
    /// record beyond the winner's id.
    pub fn route_scored(&self, candidates: &[RoutingSnapshot], request: &Request) -> Result<ScoredRoute, PolicyError> {
        if candidates.is_empty() {
            return Err(PolicyError::NoCandidates);
        }
        let scores: Vec<(InstanceId, f64)> = candidates
            .iter()
            .map(|snapshot| {
                let total: f64 = self
                    .scorers
                    .iter()
                    .map(|(scorer, weight)| weight * scorer.score(snapshot, request))
                    .sum();
                (snapshot.instance, total)
            })
            .collect();

        let mut best: Option<(InstanceId, f64)> = None;
        for &(id, total) in &scores {
            best = Some(match best {
                None => (id, total),
                Some((best_id, best_score)) => {
                    if total > best_score || (total == best_score && id < best_id) {
                        (id, total)
                    } else {
                        (best_id, best_score)
                    }
                }
            });
        }
        let chosen = best.expect("candidates is non-empty").0;
        Ok(ScoredRoute { chosen, scores })
    }
}

/// A balanced, load-aware default: queue depth and KV pressure matter
/// most, pending routes correct for in-flight burstiness, cache
/// affinity breaks near-ties.
pub fn sane_bundle() -> WeightedRoutingPolicy {
    WeightedRoutingPolicy::new(vec![
        (Box::new(QueueDepthScorer), 1.0),
        (Box::new(KvUtilizationScorer), 1.0),
        (Box::new(PendingRoutesScorer), 1.0),
        (Box::new(CacheAffinityScorer), 0.25),
    ])
    .expect("bundle weights are valid by construction")
}

/// A deliberately load-blind routing policy: scores purely on cache
/// affinity, ignoring queue depth and KV pressure entirely. Used by
/// §8's dominance law to demonstrate that a sane policy statistically
/// beats a pathological one — this bundle piles every request with a
/// shared prefix onto whichever single instance first cached it.
pub fn pathological_bundle() -> WeightedRoutingPolicy {
    WeightedRoutingPolicy::new(vec![(Box::new(CacheAffinityScorer), 1.0)])
        .expect("bundle weights are valid by construction")
}

#[cfg(test)]
mod tests {
    use super::*;
    use blis_types::{RequestId, SloClass, TenantId};

    fn req() -> Request {
        Request::new(
            RequestId::new_v4(),
            0,
            vec![1, 2, 3],
            vec![1],
            TenantId("t".into()),
            SloClass::Interactive,
            "m",
        )
    }

    fn snap(instance: u32, queue_depth: u32, kv_utilization: f64, pending_routes: u32) -> RoutingSnapshot {
        RoutingSnapshot {
            instance: InstanceId(instance),
            queue_depth,
            batch_size: 0,
            kv_utilization,
            pending_routes,
            recent_ttft_ticks: None,
            recent_itl_ticks: None,
            cache_hit_rate: None,
        }
    }

    #[test]
    fn queue_depth_admission_rejects_once_at_limit() {
        let policy = QueueDepthAdmission { max_total_queue_depth: 10 };
        assert_eq!(policy.admit(&req(), 9), AdmissionDecision::Admit);
        assert!(matches!(policy.admit(&req(), 10), AdmissionDecision::Reject(_)));
    }

    #[test]
    fn slo_priority_orders_interactive_above_best_effort() {
        let policy = SloClassPriority::default();
        let mut interactive = req();
        interactive.slo_class = SloClass::Interactive;
        let mut best_effort = req();
        best_effort.slo_class = SloClass::BestEffort;
        assert!(policy.priority(&interactive) > policy.priority(&best_effort));
    }

    #[test]
    fn weighted_routing_rejects_all_zero_weights() {
        let err = WeightedRoutingPolicy::new(vec![(Box::new(QueueDepthScorer), 0.0)]).unwrap_err();
        assert_eq!(err, PolicyError::InvalidWeights);
    }

    #[test]
    fn weighted_routing_picks_least_loaded_instance() {
        let policy = sane_bundle();
        let candidates = vec![snap(1, 5, 0.5, 0), snap(2, 0, 0.1, 0)];
        assert_eq!(policy.route(&candidates, &req()).unwrap(), InstanceId(2));
    }

    #[test]
    fn weighted_routing_breaks_ties_by_lowest_instance_id() {
        let policy = sane_bundle();
        let candidates = vec![snap(7, 0, 0.0, 0), snap(3, 0, 0.0, 0)];
        assert_eq!(policy.route(&candidates, &req()).unwrap(), InstanceId(3));
    }

    #[test]
    fn pathological_bundle_ignores_load_entirely() {
        let policy = pathological_bundle();
        // Heavily loaded instance 1 has cache affinity; idle instance 2 does not.
        let mut loaded = snap(1, 50, 0.95, 0);
        loaded.cache_hit_rate = Some(0.9);
        let idle = snap(2, 0, 0.0, 0);
        assert_eq!(policy.route(&[loaded, idle], &req()).unwrap(), InstanceId(1));
    }
}
