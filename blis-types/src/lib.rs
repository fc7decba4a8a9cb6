//! Shared data model for BLIS: requests, instances, events, and the
//! structural types the scheduling/routing/KV crates pass between each
//! other. Nothing in this crate performs simulation logic; it only
//! defines the shapes §3 of the specification names.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One virtual microsecond of simulated time.
pub type Ticks = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds an id from two caller-supplied 64-bit words instead of the
    /// OS RNG, so a workload generator drawing from a named
    /// `blis-rng` substream can mint request ids that are themselves a
    /// pure function of the master seed.
    pub fn from_u64_pair(hi: u64, lo: u64) -> Self {
        Self(Uuid::from_u64_pair(hi, lo))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replica identifier; dense and small, so a `u32` rather than a `Uuid`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

/// SLO class, used by priority/admission policies. Named after the
/// ancestor kernel's `TaskClass` (Interactive/Background/Maintenance)
/// but scoped to inference-serving semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SloClass {
    Interactive,
    Standard,
    BestEffort,
}

/// Request lifecycle state (§3 invariants: monotonic modulo the
/// `Running -> Preempted -> Running` cycle, terminal at `Completed`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    Queued,
    Running,
    Preempted,
    Completed,
}

/// Per-phase timestamps, §3: arrival <= route <= enqueue <= schedule <=
/// first_token <= completion.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PhaseTimestamps {
    pub arrival: Option<Ticks>,
    pub route: Option<Ticks>,
    pub enqueue: Option<Ticks>,
    pub schedule: Option<Ticks>,
    pub first_token: Option<Ticks>,
    pub completion: Option<Ticks>,
}

impl PhaseTimestamps {
    /// Checks causal ordering of whichever timestamps are set. Used by
    /// tests and by the instance simulator's invariant checks.
    pub fn is_causally_ordered(&self) -> bool {
        let stages = [
            self.arrival,
            self.route,
            self.enqueue,
            self.schedule,
            self.first_token,
            self.completion,
        ];
        let mut last = None;
        for stage in stages.into_iter().flatten() {
            if let Some(prev) = last {
                if stage < prev {
                    return false;
                }
            }
            last = Some(stage);
        }
        true
    }
}

/// A single logical inference request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub arrival: Ticks,
    pub input_tokens: Vec<u32>,
    /// Ground-truth output token ids the workload wants generated; its
    /// length is the number of decode steps the request needs.
    pub output_tokens: Vec<u32>,
    /// Number of input + output tokens computed so far.
    pub progress: usize,
    pub state: RequestState,
    pub priority: f64,
    pub tenant: TenantId,
    pub slo_class: SloClass,
    pub model_tag: String,
    pub streaming: bool,
    pub assigned_instance: Option<InstanceId>,
    pub timestamps: PhaseTimestamps,
}

impl Request {
    pub fn new(
        id: RequestId,
        arrival: Ticks,
        input_tokens: Vec<u32>,
        output_tokens: Vec<u32>,
        tenant: TenantId,
        slo_class: SloClass,
        model_tag: impl Into<String>,
    ) -> Self {
        Self {
            id,
            arrival,
            input_tokens,
            output_tokens,
            progress: 0,
            state: RequestState::Queued,
            priority: 0.0,
            tenant,
            slo_class,
            model_tag: model_tag.into(),
            streaming: false,
            assigned_instance: None,
            timestamps: PhaseTimestamps {
                arrival: Some(arrival),
                ..Default::default()
            },
        }
    }

    pub fn input_len(&self) -> usize {
        self.input_tokens.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_tokens.len()
    }

    pub fn total_len(&self) -> usize {
        self.input_len() + self.output_len()
    }

    pub fn is_prefill(&self) -> bool {
        self.progress < self.input_len()
    }

    pub fn remaining_prefill(&self) -> usize {
        self.input_len().saturating_sub(self.progress)
    }

    pub fn is_done(&self) -> bool {
        self.progress >= self.total_len()
    }
}

/// Fixed-size KV block identifier, dense within one instance's pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KvBlockId(pub u32);

/// KV pool sizing for one instance.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct KvConfig {
    pub total_blocks: u32,
    pub block_size: u32,
}

/// Static configuration for one replica (§6 deployment surface).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: InstanceId,
    pub kv: KvConfig,
    pub token_budget: u32,
    pub max_batch: u32,
    pub max_running_requests: u32,
    pub chunked_prefill_threshold: u32,
}

/// Per-instance observation bundle the router reads (§3, §4.7).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub instance: InstanceId,
    pub queue_depth: u32,
    pub batch_size: u32,
    pub kv_utilization: f64,
    pub pending_routes: u32,
    pub recent_ttft_ticks: Option<Ticks>,
    pub recent_itl_ticks: Option<Ticks>,
    pub cache_hit_rate: Option<f64>,
}

/// One routing decision, captured when tracing is enabled (§4.8).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceRecord {
    pub clock: Ticks,
    pub request: RequestId,
    pub candidate_scores: Vec<(InstanceId, f64)>,
    pub chosen: InstanceId,
    pub reason: String,
    pub top_k_counterfactual: Vec<(InstanceId, f64)>,
}

/// Fixed total order over event kinds (§4.2): arrival < admission <
/// routing < enqueue < step < completion < scale-check. Declaration
/// order is the ordering; `derive(Ord)` on a field-less enum orders by
/// discriminant, which is exactly this sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Arrival,
    Admission,
    Routing,
    Enqueue,
    Step,
    Completion,
    ScaleCheck,
}

/// Typed event payload. `Admission`/`Routing` are processed synchronously
/// as part of handling an `Arrival` (see `blis-engine`); their payload
/// variants exist so the total order over `EventKind` is exercised
/// directly by ordering tests without requiring the engine to actually
/// enqueue them as separate entries.
#[derive(Clone, Debug)]
pub enum EventPayload {
    Arrival(Request),
    Admission(RequestId),
    Routing(RequestId),
    /// The "joins a wait queue" event for the initial dispatch from the
    /// router. A preemption re-enqueue does *not* go through this
    /// variant — it's folded into the same `Step` that evicted the
    /// request, as an instance-internal state transition (see
    /// DESIGN.md's Open Question resolution).
    Enqueue {
        request: RequestId,
        instance: InstanceId,
    },
    Step {
        instance: InstanceId,
    },
    Completion {
        request: RequestId,
        instance: InstanceId,
    },
    ScaleCheck,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Arrival(_) => EventKind::Arrival,
            EventPayload::Admission(_) => EventKind::Admission,
            EventPayload::Routing(_) => EventKind::Routing,
            EventPayload::Enqueue { .. } => EventKind::Enqueue,
            EventPayload::Step { .. } => EventKind::Step,
            EventPayload::Completion { .. } => EventKind::Completion,
            EventPayload::ScaleCheck => EventKind::ScaleCheck,
        }
    }
}

/// A scheduled event: `(time, kind, id)` ordering per §4.2, with `id`
/// assigned strictly monotonically at insertion time.
#[derive(Clone, Debug)]
pub struct Event {
    pub time: Ticks,
    pub id: u64,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    fn sort_key(&self) -> (Ticks, EventKind, u64) {
        (self.time, self.kind(), self.id)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_total_order_matches_spec() {
        assert!(EventKind::Arrival < EventKind::Admission);
        assert!(EventKind::Admission < EventKind::Routing);
        assert!(EventKind::Routing < EventKind::Enqueue);
        assert!(EventKind::Enqueue < EventKind::Step);
        assert!(EventKind::Step < EventKind::Completion);
        assert!(EventKind::Completion < EventKind::ScaleCheck);
    }

    #[test]
    fn event_ordering_breaks_ties_by_kind_then_id() {
        let a = Event {
            time: 10,
            id: 5,
            payload: EventPayload::ScaleCheck,
        };
        let b = Event {
            time: 10,
            id: 1,
            payload: EventPayload::Arrival(Request::new(
                RequestId::new_v4(),
                10,
                vec![1],
                vec![1],
                TenantId("t".into()),
                SloClass::Interactive,
                "m",
            )),
        };
        assert!(b < a, "lower type-priority wins at equal timestamp");
    }

    #[test]
    fn phase_timestamps_detect_out_of_order() {
        let mut ts = PhaseTimestamps {
            arrival: Some(10),
            route: Some(20),
            enqueue: Some(15),
            ..Default::default()
        };
        assert!(!ts.is_causally_ordered());
        ts.enqueue = Some(25);
        assert!(ts.is_causally_ordered());
    }
}
