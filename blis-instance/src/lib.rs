//! Single-replica instance simulator (§4.6): one instance's wait queue,
//! running batch, and KV cache, advanced one `Step` event at a time.
//! Wires together `blis-sched`'s batch formation, `blis-kv`'s block
//! allocator, and `blis-latency`'s step-time model behind the narrow
//! `enqueue`/`step` surface the engine drives.

use std::collections::HashMap;

use blis_kv::KvCache;
use blis_latency::{BatchShape, LatencyModel};
use blis_sched::{BatchFormationInput, BatchFormationStrategy, CandidateRequest, QueueOrder};
use blis_types::{InstanceConfig, InstanceId, KvBlockId, Request, RequestId, RoutingSnapshot, Ticks};

/// What happened during one `step()` call, for the engine to turn into
/// `Completion` events and metrics updates.
#[derive(Clone, Debug, Default)]
pub struct StepOutcome {
    pub step_time: Ticks,
    pub completed: Vec<RequestId>,
    pub preempted: Vec<RequestId>,
}

#[derive(Clone, Debug, Default)]
pub struct InstanceMetrics {
    pub completed_count: u64,
    pub queue_depth_samples: Vec<u32>,
    pub peak_batch_size: u32,
    pub kv_utilization_samples: Vec<f64>,
    pub preemption_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Times a step admitted a later-arrived waiting request while a
    /// lower-`SloClass` one was left behind in the queue.
    pub priority_inversion_count: u64,
    /// Times a step admitted a waiting request while one that arrived
    /// earlier stayed queued, per request pair.
    pub hol_blocking_count: u64,
}

/// Higher means more important; `Interactive` always outranks
/// `BestEffort`. Used only to detect priority inversions, not to order
/// the queue itself — that's `QueueOrder`'s job.
fn slo_rank(class: blis_types::SloClass) -> u8 {
    match class {
        blis_types::SloClass::Interactive => 2,
        blis_types::SloClass::Standard => 1,
        blis_types::SloClass::BestEffort => 0,
    }
}

pub struct Instance {
    id: InstanceId,
    config: InstanceConfig,
    kv: KvCache,
    queue_order: Box<dyn QueueOrder + Send>,
    batch_strategy: Box<dyn BatchFormationStrategy + Send>,
    latency_model: Box<dyn LatencyModel + Send>,
    requests: HashMap<RequestId, Request>,
    running: Vec<RequestId>,
    metrics: InstanceMetrics,
    /// Final state of every request that has completed on this
    /// instance, retained so a reporting layer can still build
    /// per-request metrics after the run — `requests` drops a request
    /// the moment it finishes.
    completed_requests: Vec<Request>,
}

impl Instance {
    pub fn new(
        config: InstanceConfig,
        queue_order: Box<dyn QueueOrder + Send>,
        batch_strategy: Box<dyn BatchFormationStrategy + Send>,
        latency_model: Box<dyn LatencyModel + Send>,
    ) -> Self {
        let kv = KvCache::new(config.kv);
        Self {
            id: config.id,
            config,
            kv,
            queue_order,
            batch_strategy,
            latency_model,
            requests: HashMap::new(),
            running: Vec::new(),
            metrics: InstanceMetrics::default(),
            completed_requests: Vec::new(),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn metrics(&self) -> &InstanceMetrics {
        &self.metrics
    }

    /// Final state of every request this instance has completed so
    /// far, in completion order — the source a reporting layer builds
    /// per-request metrics from once a run is done.
    pub fn completed_requests(&self) -> &[Request] {
        &self.completed_requests
    }

    /// Handles an `Enqueue` event: the request joins this instance's
    /// wait queue (or rejoins it, if this is a preemption re-enqueue).
    pub fn enqueue(&mut self, mut request: Request, now: Ticks) {
        request.timestamps.enqueue = Some(now);
        request.assigned_instance = Some(self.id);
        self.queue_order.submit(request.id, request.slo_class);
        self.requests.insert(request.id, request);
    }

    /// A read-only view of load, for the router's snapshot cache.
    pub fn routing_snapshot(&self) -> RoutingSnapshot {
        let total_decode_samples = self.metrics.cache_hits + self.metrics.cache_misses;
        let cache_hit_rate = if total_decode_samples > 0 {
            Some(self.metrics.cache_hits as f64 / total_decode_samples as f64)
        } else {
            None
        };
        RoutingSnapshot {
            instance: self.id,
            queue_depth: self.queue_order.len() as u32,
            batch_size: self.running.len() as u32,
            kv_utilization: self.kv.kv_utilization(),
            pending_routes: 0, // filled in by the router's PendingTracker
            recent_ttft_ticks: None,
            recent_itl_ticks: None,
            cache_hit_rate,
        }
    }

    fn blocks_needed_estimate(&self, remaining_tokens: usize) -> u32 {
        let block_size = self.config.kv.block_size.max(1) as usize;
        ((remaining_tokens + block_size - 1) / block_size) as u32
    }

    /// Advances the instance by one `Step` event: admits waiting
    /// requests, runs one batch-formation decision, applies the
    /// resulting latency, and advances every scheduled request's
    /// progress.
    pub fn step(&mut self, now: Ticks) -> StepOutcome {
        self.metrics.queue_depth_samples.push(self.queue_order.len() as u32);

        let running_candidates: Vec<CandidateRequest> = self
            .running
            .iter()
            .map(|id| {
                let r = &self.requests[id];
                // A decode step only needs a fresh block once the
                // current tail block is exactly full; anywhere else in
                // a partial block, the next token just lands in it.
                let resident = self.kv.tokens_resident(*id);
                let block_size = self.config.kv.block_size.max(1) as usize;
                let needs_new_block = resident == 0 || resident % block_size == 0;
                CandidateRequest {
                    id: *id,
                    remaining_prefill: r.remaining_prefill(),
                    kv_blocks_needed_estimate: if needs_new_block { 1 } else { 0 },
                }
            })
            .collect();

        let mut admit_order = Vec::new();
        while let Some(id) = self.queue_order.next() {
            admit_order.push(id);
        }
        let waiting_candidates: Vec<CandidateRequest> = admit_order
            .iter()
            .map(|id| {
                let r = &self.requests[id];
                let remaining = r.remaining_prefill().min(self.config.chunked_prefill_threshold as usize);
                CandidateRequest {
                    id: *id,
                    remaining_prefill: r.remaining_prefill(),
                    kv_blocks_needed_estimate: self.blocks_needed_estimate(remaining),
                }
            })
            .collect();

        let input = BatchFormationInput {
            running: running_candidates,
            waiting: waiting_candidates,
            token_budget: self.config.token_budget,
            max_batch: self.config.max_batch,
            chunked_prefill_threshold: self.config.chunked_prefill_threshold,
            free_kv_blocks: self.kv.free_blocks(),
        };
        let plan = self.batch_strategy.form_batch(&input);

        // Anything not in the plan's scheduled set goes back to the
        // wait queue in its original order.
        let scheduled_ids: std::collections::HashSet<RequestId> =
            plan.scheduled.iter().map(|c| c.request).collect();

        let scheduled_waiting: Vec<RequestId> =
            admit_order.iter().copied().filter(|id| scheduled_ids.contains(id)).collect();
        let skipped_waiting: Vec<RequestId> =
            admit_order.iter().copied().filter(|id| !scheduled_ids.contains(id)).collect();
        for &admitted in &scheduled_waiting {
            let admitted_req = &self.requests[&admitted];
            for &left_behind in &skipped_waiting {
                let left_behind_req = &self.requests[&left_behind];
                if left_behind_req.arrival < admitted_req.arrival {
                    self.metrics.hol_blocking_count += 1;
                }
                if slo_rank(left_behind_req.slo_class) > slo_rank(admitted_req.slo_class) {
                    self.metrics.priority_inversion_count += 1;
                }
            }
        }

        for id in &admit_order {
            if !scheduled_ids.contains(id) {
                let slo = self.requests[id].slo_class;
                self.queue_order.submit(*id, slo);
            }
        }

        for id in &plan.preempted {
            self.metrics.preemption_count += 1;
            self.kv.release(*id);
            if let Some(r) = self.requests.get_mut(id) {
                r.state = blis_types::RequestState::Preempted;
                self.queue_order.submit(*id, r.slo_class);
                // Back in the wait queue: the lifecycle passes through
                // `Queued` again before it can next become `Running`.
                r.state = blis_types::RequestState::Queued;
            }
            self.running.retain(|r| r != id);
        }

        // Cache lookups happen before the latency model is asked for a
        // duration: only net-new (cache-miss) tokens count toward the
        // prefill term, and only newly-admitted requests count toward
        // the admission/queueing term, so both must be known up front.
        let block_size = self.config.kv.block_size.max(1) as usize;
        struct ChunkPrep {
            cached: Vec<KvBlockId>,
            net_new_tokens: usize,
            newly_admitted: bool,
        }
        let mut prep: Vec<ChunkPrep> = Vec::with_capacity(plan.scheduled.len());
        let mut cache_miss_prefill_tokens = 0u32;
        let mut decode_tokens = 0u32;
        let mut admitted_this_step = 0u32;
        let mut admission_input_tokens = 0u32;
        let mut admission_output_tokens = 0u32;

        for chunk in &plan.scheduled {
            let newly_admitted = !self.running.contains(&chunk.request);
            let input_tokens = &self.requests[&chunk.request].input_tokens;
            let cached = if newly_admitted { self.kv.lookup_prefix(input_tokens) } else { Vec::new() };
            if !cached.is_empty() {
                self.metrics.cache_hits += 1;
            } else if newly_admitted {
                self.metrics.cache_misses += 1;
            }

            let cached_token_coverage = cached.len() * block_size;
            let net_new_tokens = (chunk.tokens as usize).saturating_sub(cached_token_coverage);

            if chunk.is_decode {
                decode_tokens += chunk.tokens;
            } else {
                cache_miss_prefill_tokens += net_new_tokens as u32;
            }
            if newly_admitted {
                admitted_this_step += 1;
                let request = &self.requests[&chunk.request];
                admission_input_tokens += request.input_len() as u32;
                admission_output_tokens += request.output_tokens.len() as u32;
            }

            prep.push(ChunkPrep { cached, net_new_tokens, newly_admitted });
        }

        let shape = BatchShape {
            cache_miss_prefill_tokens,
            decode_tokens,
            batch_size: plan.scheduled.len() as u32,
            kv_blocks_read: self.kv.in_use_blocks(),
            admitted_this_step,
            admission_input_tokens,
            admission_output_tokens,
        };
        let step_time = self.latency_model.step_time(&shape);
        let completion_time = now + step_time;

        let mut completed = Vec::new();
        for (chunk, prep) in plan.scheduled.iter().zip(prep.into_iter()) {
            let input_tokens = self.requests[&chunk.request].input_tokens.clone();

            let outcome = self
                .kv
                .allocate(chunk.request, &input_tokens, prep.net_new_tokens, &prep.cached)
                .expect("batch formation must not admit a chunk the KV pool cannot hold");
            tracing::debug!(
                instance = %self.id,
                request = %chunk.request,
                new_blocks = outcome.new_blocks.len(),
                "allocated kv blocks for scheduled chunk"
            );

            if prep.newly_admitted {
                self.running.push(chunk.request);
            }

            let request = self.requests.get_mut(&chunk.request).expect("scheduled request must be tracked");
            request.progress += chunk.tokens as usize;
            request.state = blis_types::RequestState::Running;
            if request.timestamps.schedule.is_none() {
                request.timestamps.schedule = Some(now);
            }

            let prefill_just_finished = request.progress >= request.input_len();
            let zero_output = request.output_tokens.is_empty();
            if prefill_just_finished && request.timestamps.first_token.is_none() {
                // Zero-output requests never take a decode step, so
                // first-token must be recorded here or it never would be.
                if zero_output || chunk.is_decode {
                    request.timestamps.first_token = Some(completion_time);
                }
            }

            if request.is_done() {
                request.state = blis_types::RequestState::Completed;
                request.timestamps.completion = Some(completion_time);
                self.kv.release(chunk.request);
                self.running.retain(|r| r != &chunk.request);
                self.metrics.completed_count += 1;
                completed.push(chunk.request);
            }
        }

        self.metrics.peak_batch_size = self.metrics.peak_batch_size.max(self.running.len() as u32);
        self.metrics.kv_utilization_samples.push(self.kv.kv_utilization());

        for id in &completed {
            if let Some(finished) = self.requests.remove(id) {
                self.completed_requests.push(finished);
            }
        }

        StepOutcome { step_time, completed, preempted: plan.preempted }
    }

    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(&id)
    }

    pub fn has_work(&self) -> bool {
        !self.queue_order.is_empty() || !self.running.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blis_latency::ZeroLatencyModel;
    use blis_sched::{ContinuousBatchingStrategy, PriorityQueueOrder};
    use blis_types::{KvConfig, SloClass, TenantId};

    fn instance() -> Instance {
        let config = InstanceConfig {
            id: InstanceId(0),
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

    fn req(input_len: usize, output_len: usize) -> Request {
        Request::new(
            RequestId::new_v4(),
            0,
            (0..input_len as u32).collect(),
            (0..output_len as u32).collect(),
            TenantId("t".into()),
            SloClass::Interactive,
            "m",
        )
    }

    #[test]
    fn zero_output_request_gets_first_token_and_completes_on_prefill_step() {
        let mut inst = instance();
        let r = req(4, 0);
        let id = r.id;
        inst.enqueue(r, 0);

        let outcome = inst.step(10);
        assert_eq!(outcome.completed, vec![id]);
        assert!(inst.request(id).is_none(), "completed requests are removed");
        assert_eq!(inst.metrics().completed_count, 1);
    }

    #[test]
    fn completed_requests_retain_causally_ordered_timestamps_after_removal() {
        let mut inst = instance();
        let r = req(4, 2);
        let id = r.id;
        inst.enqueue(r, 0);
        inst.step(1);
        inst.step(2);
        inst.step(3);

        assert!(inst.request(id).is_none());
        let finished = inst.completed_requests().iter().find(|r| r.id == id).expect("kept after completion");
        assert!(finished.timestamps.is_causally_ordered());
        assert!(finished.timestamps.completion.is_some());
    }

    #[test]
    fn normal_request_completes_after_prefill_and_decode_steps() {
        let mut inst = instance();
        let r = req(4, 2);
        let id = r.id;
        inst.enqueue(r, 0);

        inst.step(1); // prefill, 4 tokens in one chunk (threshold 8)
        assert!(inst.request(id).unwrap().timestamps.first_token.is_none());

        let out1 = inst.step(2); // first decode token
        assert!(out1.completed.is_empty());
        assert!(inst.request(id).unwrap().timestamps.first_token.is_some());

        let out2 = inst.step(3); // second decode token, done
        assert_eq!(out2.completed, vec![id]);
    }

    #[test]
    fn insufficient_kv_for_the_older_higher_priority_request_counts_as_inversion_and_hol_blocking() {
        let config = InstanceConfig {
            id: InstanceId(0),
            kv: KvConfig { total_blocks: 3, block_size: 4 },
            token_budget: 64,
            max_batch: 8,
            max_running_requests: 8,
            chunked_prefill_threshold: 100,
        };
        let mut inst = Instance::new(
            config,
            Box::new(blis_sched::FifoQueueOrder::default()),
            Box::new(ContinuousBatchingStrategy),
            Box::new(ZeroLatencyModel),
        );

        let mut older_interactive = req(16, 0);
        older_interactive.arrival = 0;
        older_interactive.slo_class = SloClass::Interactive;
        let mut newer_best_effort = req(4, 0);
        newer_best_effort.arrival = 1;
        newer_best_effort.slo_class = SloClass::BestEffort;

        inst.enqueue(older_interactive, 0);
        inst.enqueue(newer_best_effort, 0);

        inst.step(0);
        assert!(inst.metrics().hol_blocking_count >= 1);
        assert!(inst.metrics().priority_inversion_count >= 1);
    }

    #[test]
    fn running_request_needing_a_fresh_block_is_preempted_instead_of_panicking() {
        // One block total, block_size 4: a single running request whose
        // tail block is exactly full (4 tokens resident) needs a new
        // block for its next decode token, but none are free. It must be
        // preempted, not passed to `KvCache::allocate` and panic.
        let config = InstanceConfig {
            id: InstanceId(0),
            kv: KvConfig { total_blocks: 1, block_size: 4 },
            token_budget: 64,
            max_batch: 8,
            max_running_requests: 8,
            chunked_prefill_threshold: 100,
        };
        let mut inst = Instance::new(
            config,
            Box::new(PriorityQueueOrder::default()),
            Box::new(ContinuousBatchingStrategy),
            Box::new(ZeroLatencyModel),
        );

        let r = req(4, 4);
        let id = r.id;
        inst.enqueue(r, 0);

        inst.step(0); // prefill fills the one block exactly (4 tokens)
        assert_eq!(inst.kv.tokens_resident(id), 4);

        inst.step(1); // decode step needs a fresh block; none free
        assert!(inst.metrics().preemption_count >= 1, "must preempt rather than panic on allocate");
    }

    #[test]
    fn kv_conservation_holds_across_enqueue_step_and_completion() {
        let mut inst = instance();
        for _ in 0..5 {
            inst.enqueue(req(4, 1), 0);
        }
        for t in 0..10 {
            inst.step(t);
            assert!(inst.kv.check_conservation());
        }
    }
}
