//! Discrete-event simulation kernel (§4.2) and the cluster simulator
//! that owns it (§2 item 8). The event queue is a min-priority queue
//! ordered by `(time, kind, id)`; the cluster simulator drains it one
//! event at a time, driving the routing pipeline and the per-instance
//! step loop.
//!
//! The `step`/`run` shape — pop one event, advance the clock, stop once
//! a horizon or event-count limit is hit — is grounded on the VOPR-style
//! `Simulation::step`/`run` loop other deterministic-simulation crates
//! in this ecosystem use; `run` here additionally reports a typed error
//! rather than panicking when a routing decision fails outright, since
//! an empty instance pool is a configuration mistake, not a fatal
//! invariant violation the way a schedule-into-the-past call is.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use blis_instance::Instance;
use blis_policy::{AdmissionDecision, AdmissionPolicy, PolicyError, PriorityPolicy};
use blis_rng::{RngService, RngStream};
use blis_router::{RouterError, RoutingPipeline, SnapshotStaleness};
use blis_trace::{DecisionTrace, TraceError, TraceSink};
use blis_types::{Event, EventPayload, InstanceId, Request, RequestId, Ticks, TraceRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("routing decision failed: {0}")]
    Routing(#[from] RouterError),
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("decision trace write failed: {0}")]
    Trace(#[from] TraceError),
}

/// Min-priority queue over `Event`, ordered ascending by `(time, kind,
/// id)` via `Event`'s own `Ord` impl.
#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<Event>>,
    next_id: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `payload` at `time`. Fatal if `time` is behind
    /// `current_time`: a discrete-event simulator that lets an event be
    /// scheduled into the past has already lost determinism, and
    /// continuing would silently corrupt every downstream timestamp.
    pub fn schedule(&mut self, time: Ticks, current_time: Ticks, payload: EventPayload) -> u64 {
        assert!(
            time >= current_time,
            "cannot schedule event at {time} when the clock is already at {current_time}"
        );
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse(Event { time, id, payload }));
        id
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.heap.pop().map(|Reverse(e)| e)
    }

    fn push_back(&mut self, event: Event) {
        self.heap.push(Reverse(event));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClusterMetrics {
    pub rejections: u64,
    pub completed: u64,
    pub preemptions: u64,
    pub priority_inversions: u64,
    pub hol_blocking: u64,
}

#[derive(Clone, Debug)]
pub struct ClusterSummary {
    pub events_processed: u64,
    pub final_time: Ticks,
    pub metrics: ClusterMetrics,
}

pub struct ClusterSimulator<S: TraceSink> {
    clock: Ticks,
    horizon: Ticks,
    max_events: u64,
    events_processed: u64,
    queue: EventQueue,
    instances: HashMap<InstanceId, Instance>,
    instance_step_scheduled: HashSet<InstanceId>,
    router: RoutingPipeline,
    admission: Box<dyn AdmissionPolicy>,
    priority: Box<dyn PriorityPolicy>,
    pending_routed: HashMap<RequestId, (Request, InstanceId)>,
    trace: DecisionTrace<S>,
    metrics: ClusterMetrics,
    rng: RngService,
}

impl<S: TraceSink> ClusterSimulator<S> {
    pub fn new(
        seed: u64,
        horizon: Ticks,
        max_events: u64,
        instances: HashMap<InstanceId, Instance>,
        router: RoutingPipeline,
        admission: Box<dyn AdmissionPolicy>,
        priority: Box<dyn PriorityPolicy>,
        trace: DecisionTrace<S>,
    ) -> Self {
        Self {
            clock: 0,
            horizon,
            max_events,
            events_processed: 0,
            queue: EventQueue::new(),
            instances,
            instance_step_scheduled: HashSet::new(),
            router,
            admission,
            priority,
            pending_routed: HashMap::new(),
            trace,
            metrics: ClusterMetrics::default(),
            rng: RngService::new(seed),
        }
    }

    pub fn clock(&self) -> Ticks {
        self.clock
    }

    /// Hands out the named RNG substream (§4.1) for subsystems driven
    /// from outside the engine, such as a workload generator feeding
    /// `submit`, to draw from — keeping every random choice in the
    /// run traceable to one master seed.
    pub fn rng_stream(&mut self, name: &str) -> &mut RngStream {
        self.rng.stream(name)
    }

    pub fn metrics(&self) -> &ClusterMetrics {
        &self.metrics
    }

    pub fn trace(&self) -> &DecisionTrace<S> {
        &self.trace
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    /// Schedules a workload-generated request's `Arrival` event.
    pub fn submit(&mut self, request: Request) {
        let time = request.arrival;
        self.queue.schedule(time, self.clock, EventPayload::Arrival(request));
    }

    /// Pops and processes exactly one event. Returns `None` once the
    /// queue is empty, the event-count budget is spent, or the next
    /// event lies beyond the horizon — in the last case the event is
    /// put back so a caller inspecting the queue afterward sees it.
    pub fn step(&mut self) -> Result<Option<Event>, EngineError> {
        if self.events_processed >= self.max_events {
            return Ok(None);
        }
        let Some(event) = self.queue.pop() else {
            return Ok(None);
        };
        if event.time > self.horizon {
            self.queue.push_back(event);
            return Ok(None);
        }

        self.clock = event.time;
        self.events_processed += 1;
        let time = event.time;
        let processed = event.clone();
        match event.payload {
            EventPayload::Arrival(request) => self.handle_arrival(request, time)?,
            EventPayload::Enqueue { request, instance } => self.handle_enqueue(request, instance, time),
            EventPayload::Step { instance } => self.handle_step(instance, time),
            EventPayload::Completion { .. } => self.metrics.completed += 1,
            EventPayload::Admission(_) | EventPayload::Routing(_) | EventPayload::ScaleCheck => {}
        }
        Ok(Some(processed))
    }

    fn handle_arrival(&mut self, mut request: Request, now: Ticks) -> Result<(), EngineError> {
        let cluster_queue_depth: u32 = self.instances.values().map(|i| i.routing_snapshot().queue_depth).sum();
        match self.admission.admit(&request, cluster_queue_depth) {
            AdmissionDecision::Reject(reason) => {
                tracing::warn!(request = %request.id, %reason, "rejected request at admission");
                self.metrics.rejections += 1;
                return Ok(());
            }
            AdmissionDecision::Admit => {}
        }
        request.priority = self.priority.priority(&request);
        request.timestamps.route = Some(now);

        let instances = &self.instances;
        let outcome = self.router.route(&request, now, || {
            instances.values().map(|i| i.routing_snapshot()).collect()
        })?;
        let request_id = request.id;

        let mut runner_up = outcome.scores.clone();
        runner_up.retain(|(id, _)| *id != outcome.instance);
        runner_up.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        self.trace.record(TraceRecord {
            clock: now,
            request: request_id,
            candidate_scores: outcome.scores.clone(),
            chosen: outcome.instance,
            reason: "highest weighted routing score".into(),
            top_k_counterfactual: runner_up.into_iter().take(2).collect(),
        })?;

        self.pending_routed.insert(request_id, (request, outcome.instance));
        self.queue.schedule(
            outcome.enqueue_at,
            now,
            EventPayload::Enqueue { request: request_id, instance: outcome.instance },
        );
        Ok(())
    }

    fn handle_enqueue(&mut self, request_id: RequestId, instance_id: InstanceId, now: Ticks) {
        self.router.on_enqueued(instance_id);
        let Some((request, routed_to)) = self.pending_routed.remove(&request_id) else {
            return;
        };
        debug_assert_eq!(routed_to, instance_id, "enqueue event fired for the wrong instance");
        if let Some(instance) = self.instances.get_mut(&instance_id) {
            instance.enqueue(request, now);
            if self.instance_step_scheduled.insert(instance_id) {
                self.queue.schedule(now, now, EventPayload::Step { instance: instance_id });
            }
        }
    }

    fn handle_step(&mut self, instance_id: InstanceId, now: Ticks) {
        self.instance_step_scheduled.remove(&instance_id);
        let Some(instance) = self.instances.get_mut(&instance_id) else {
            return;
        };
        let outcome = instance.step(now);
        self.metrics.preemptions += outcome.preempted.len() as u64;
        let completion_time = now + outcome.step_time;
        for request in outcome.completed {
            self.queue.schedule(
                completion_time,
                now,
                EventPayload::Completion { request, instance: instance_id },
            );
        }
        if instance.has_work() && self.instance_step_scheduled.insert(instance_id) {
            self.queue.schedule(completion_time, now, EventPayload::Step { instance: instance_id });
        }
    }

    /// Drains the event queue until exhaustion, the event budget, or the
    /// horizon is reached.
    pub fn run(&mut self) -> Result<ClusterSummary, EngineError> {
        while self.step()?.is_some() {}
        let mut metrics = self.metrics.clone();
        for instance in self.instances.values() {
            metrics.priority_inversions += instance.metrics().priority_inversion_count;
            metrics.hol_blocking += instance.metrics().hol_blocking_count;
        }
        Ok(ClusterSummary { events_processed: self.events_processed, final_time: self.clock, metrics })
    }
}

pub use blis_router::SnapshotStaleness as RoutingStaleness;

#[cfg(test)]
mod tests {
    use super::*;
    use blis_instance::Instance;
    use blis_latency::ZeroLatencyModel;
    use blis_policy::{sane_bundle, AlwaysAdmit, SloClassPriority};
    use blis_sched::{ContinuousBatchingStrategy, PriorityQueueOrder};
    use blis_trace::InMemorySink;
    use blis_types::{InstanceConfig, KvConfig, RequestId, SloClass, TenantId};

    fn make_instance(id: u32) -> Instance {
        let config = InstanceConfig {
            id: InstanceId(id),
            kv: KvConfig { total_blocks: 64, block_size: 4 },
            token_budget: 64,
            max_batch: 8,
            max_running_requests: 8,
            chunked_prefill_threshold: 8,
        };
        Instance::new(
            config,
            Box::new(PriorityQueueOrder::default()),
            Box::new(ContinuousBatchingStrategy),
            Box::new(ZeroLatencyModel),
        )
    }

    fn simulator() -> ClusterSimulator<InMemorySink> {
        let mut instances = HashMap::new();
        instances.insert(InstanceId(0), make_instance(0));
        instances.insert(InstanceId(1), make_instance(1));
        let router = RoutingPipeline::new(sane_bundle(), SnapshotStaleness::Immediate, 0);
        ClusterSimulator::new(
            42,
            1_000_000,
            10_000,
            instances,
            router,
            Box::new(AlwaysAdmit),
            Box::new(SloClassPriority::default()),
            DecisionTrace::new(false, InMemorySink::default()),
        )
    }

    fn simulator_with_trace() -> ClusterSimulator<InMemorySink> {
        let mut instances = HashMap::new();
        instances.insert(InstanceId(0), make_instance(0));
        instances.insert(InstanceId(1), make_instance(1));
        let router = RoutingPipeline::new(sane_bundle(), SnapshotStaleness::Immediate, 0);
        ClusterSimulator::new(
            42,
            1_000_000,
            10_000,
            instances,
            router,
            Box::new(AlwaysAdmit),
            Box::new(SloClassPriority::default()),
            DecisionTrace::new(true, InMemorySink::default()),
        )
    }

    fn req(arrival: Ticks) -> Request {
        Request::new(
            RequestId::new_v4(),
            arrival,
            vec![1, 2, 3, 4],
            vec![1],
            TenantId("t".into()),
            SloClass::Interactive,
            "m",
        )
    }

    #[test]
    fn a_single_request_runs_to_completion() {
        let mut sim = simulator();
        sim.submit(req(0));
        let summary = sim.run().unwrap();
        assert_eq!(summary.metrics.completed, 1);
        assert_eq!(summary.metrics.rejections, 0);
    }

    #[test]
    fn event_budget_stops_the_run_early() {
        let mut sim = simulator();
        sim.submit(req(0));
        sim.submit(req(0));
        sim.max_events = 1;
        let summary = sim.run().unwrap();
        assert_eq!(summary.events_processed, 1);
    }

    #[test]
    fn enabling_trace_records_one_routing_decision_per_arrival() {
        let mut sim = simulator_with_trace();
        sim.submit(req(0));
        sim.submit(req(0));
        sim.run().unwrap();
        let records = sim.trace().sink().records();
        assert_eq!(records.len(), 2, "one trace record per routed arrival");
        for record in records {
            assert_eq!(record.candidate_scores.len(), 2, "both instances should be scored");
        }
    }

    #[test]
    fn clock_is_monotonic_across_steps() {
        let mut sim = simulator();
        sim.submit(req(0));
        sim.submit(req(5));
        let mut last = 0;
        while let Some(event) = sim.step().unwrap() {
            assert!(event.time >= last);
            last = event.time;
        }
    }
}
