//! Routing pipeline orchestration (§4.7): turns a routing policy into
//! a stateful pipeline with a staleness-bounded snapshot cache and
//! causal pending-request accounting, then applies a configured
//! dispatch latency before the chosen instance actually sees the
//! request.
//!
//! Grounded on the ancestor kernel's `ConfigRouter`, which likewise
//! wraps a pure decision (`EscalationPolicy`/tier selection) in a
//! stateful shell that reads live configuration; here the "live" input
//! is per-instance load snapshots instead of a YAML tier table.

use std::collections::HashMap;

use blis_policy::{PolicyError, WeightedRoutingPolicy};
use blis_types::{InstanceId, Request, RoutingSnapshot, Ticks};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RouterError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// How often the router is willing to look at fresh per-instance load.
#[derive(Clone, Copy, Debug)]
pub enum SnapshotStaleness {
    /// Re-fetch on every routing decision: the router always sees the
    /// latest state, at the cost of coupling every route to every
    /// instance's current snapshot computation.
    Immediate,
    /// Re-fetch at most once per `refresh_interval` ticks; decisions
    /// made between refreshes see whatever was current at the last one.
    Coarse { refresh_interval: Ticks },
}

struct SnapshotCache {
    staleness: SnapshotStaleness,
    last_refreshed: Option<Ticks>,
    snapshots: HashMap<InstanceId, RoutingSnapshot>,
}

impl SnapshotCache {
    fn new(staleness: SnapshotStaleness) -> Self {
        Self { staleness, last_refreshed: None, snapshots: HashMap::new() }
    }

    fn needs_refresh(&self, now: Ticks) -> bool {
        match self.staleness {
            SnapshotStaleness::Immediate => true,
            SnapshotStaleness::Coarse { refresh_interval } => match self.last_refreshed {
                None => true,
                Some(last) => now.saturating_sub(last) >= refresh_interval,
            },
        }
    }

    fn get(&mut self, now: Ticks, fetch: impl FnOnce() -> Vec<RoutingSnapshot>) -> &HashMap<InstanceId, RoutingSnapshot> {
        if self.needs_refresh(now) {
            self.snapshots = fetch().into_iter().map(|s| (s.instance, s)).collect();
            self.last_refreshed = Some(now);
        }
        &self.snapshots
    }
}

/// Tracks requests the router has dispatched to an instance whose
/// `Enqueue` event hasn't fired on the engine's event queue yet.
/// Decremented only when that specific request's `Enqueue` event
/// actually runs (§4.7) — never by a queue-depth delta heuristic,
/// which would double-count under the same burst it's meant to correct
/// for.
#[derive(Default)]
pub struct PendingTracker {
    pending: HashMap<InstanceId, u32>,
}

impl PendingTracker {
    pub fn increment(&mut self, instance: InstanceId) {
        *self.pending.entry(instance).or_insert(0) += 1;
    }

    pub fn decrement(&mut self, instance: InstanceId) {
        if let Some(count) = self.pending.get_mut(&instance) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn count(&self, instance: InstanceId) -> u32 {
        self.pending.get(&instance).copied().unwrap_or(0)
    }
}

/// Result of one routing decision: which instance, when its `Enqueue`
/// event should fire, and every candidate's score (for the decision
/// trace, §4.8).
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingOutcome {
    pub instance: InstanceId,
    pub enqueue_at: Ticks,
    pub scores: Vec<(InstanceId, f64)>,
}

pub struct RoutingPipeline {
    policy: WeightedRoutingPolicy,
    snapshots: SnapshotCache,
    pending: PendingTracker,
    dispatch_latency: Ticks,
}

impl RoutingPipeline {
    pub fn new(policy: WeightedRoutingPolicy, staleness: SnapshotStaleness, dispatch_latency: Ticks) -> Self {
        Self {
            policy,
            snapshots: SnapshotCache::new(staleness),
            pending: PendingTracker::default(),
            dispatch_latency,
        }
    }

    /// Routes `request` as of `now`. `fetch` is only invoked when the
    /// snapshot cache actually needs a refresh.
    pub fn route(
        &mut self,
        request: &Request,
        now: Ticks,
        fetch: impl FnOnce() -> Vec<RoutingSnapshot>,
    ) -> Result<RoutingOutcome, RouterError> {
        let pending = &self.pending;
        let candidates: Vec<RoutingSnapshot> = self
            .snapshots
            .get(now, fetch)
            .values()
            .map(|snap| RoutingSnapshot {
                pending_routes: snap.pending_routes + pending.count(snap.instance),
                ..*snap
            })
            .collect();

        let scored = self.policy.route_scored(&candidates, request)?;
        self.pending.increment(scored.chosen);
        Ok(RoutingOutcome {
            instance: scored.chosen,
            enqueue_at: now + self.dispatch_latency,
            scores: scored.scores,
        })
    }

    /// Must be called exactly when a routed request's `Enqueue` event
    /// fires, to keep the pending-route correction causally accurate.
    pub fn on_enqueued(&mut self, instance: InstanceId) {
        self.pending.decrement(instance);
    }
}
