//! In-instance scheduling (§4.5, §4.6): picking which queued requests
//! join the running batch, and in what order a wait queue drains.
//!
//! Split into two independent concerns, mirroring the ancestor kernel's
//! `Scheduler` trait (`submit`/`next`, weighted by `TaskClass`): a
//! [`QueueOrder`] that decides which waiting request is next in line,
//! and a [`BatchFormationStrategy`] that turns "what's waiting" plus
//! "what's already running" into one step's batch, including chunked
//! prefill and preemption.

use std::collections::{HashMap, VecDeque};

use blis_types::{RequestId, SloClass};

/// Decides dequeue order for one instance's wait queue. Implementations
/// own no knowledge of batch formation or KV capacity — just priority.
pub trait QueueOrder {
    fn submit(&mut self, request: RequestId, slo_class: SloClass);
    fn next(&mut self) -> Option<RequestId>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plain arrival-order queue, ignoring `SloClass` entirely. The
/// degenerate case other orderings are compared against.
#[derive(Default)]
pub struct FifoQueueOrder {
    queue: VecDeque<RequestId>,
}

impl QueueOrder for FifoQueueOrder {
    fn submit(&mut self, request: RequestId, _slo_class: SloClass) {
        self.queue.push_back(request);
    }

    fn next(&mut self) -> Option<RequestId> {
        self.queue.pop_front()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Strict-priority queue: `Interactive` always drains before
/// `Standard`, which always drains before `BestEffort`. FIFO within a
/// class. Mirrors the ancestor scheduler's weighted `TaskClass` queues
/// with weights so lopsided (`[1000.0, 10.0, 1.0]`) that the highest
/// non-empty class always wins.
#[derive(Default)]
pub struct PriorityQueueOrder {
    interactive: VecDeque<RequestId>,
    standard: VecDeque<RequestId>,
    best_effort: VecDeque<RequestId>,
}

impl PriorityQueueOrder {
    fn queue_for(&mut self, slo_class: SloClass) -> &mut VecDeque<RequestId> {
        match slo_class {
            SloClass::Interactive => &mut self.interactive,
            SloClass::Standard => &mut self.standard,
            SloClass::BestEffort => &mut self.best_effort,
        }
    }
}

impl QueueOrder for PriorityQueueOrder {
    fn submit(&mut self, request: RequestId, slo_class: SloClass) {
        self.queue_for(slo_class).push_back(request);
    }

    fn next(&mut self) -> Option<RequestId> {
        self.interactive
            .pop_front()
            .or_else(|| self.standard.pop_front())
            .or_else(|| self.best_effort.pop_front())
    }

    fn len(&self) -> usize {
        self.interactive.len() + self.standard.len() + self.best_effort.len()
    }
}

/// Wraps a [`PriorityQueueOrder`] with a per-class work-in-progress cap,
/// so a flood of interactive traffic cannot starve lower classes
/// indefinitely — the ancestor's `QoSScheduler` over `InMemoryScheduler`.
pub struct WipLimitedQueueOrder {
    inner: PriorityQueueOrder,
    limits: HashMap<SloClass, u32>,
    in_flight: HashMap<SloClass, u32>,
    starved: VecDeque<SloClass>,
}

impl WipLimitedQueueOrder {
    pub fn new(limits: HashMap<SloClass, u32>) -> Self {
        Self {
            inner: PriorityQueueOrder::default(),
            limits,
            in_flight: HashMap::new(),
            starved: VecDeque::new(),
        }
    }

    /// Call when a request dequeued via `next` leaves the running batch
    /// (completed or preempted), freeing its class's WIP slot.
    pub fn release(&mut self, slo_class: SloClass) {
        if let Some(count) = self.in_flight.get_mut(&slo_class) {
            *count = count.saturating_sub(1);
        }
    }

    fn under_limit(&self, slo_class: SloClass) -> bool {
        match self.limits.get(&slo_class) {
            Some(&limit) => self.in_flight.get(&slo_class).copied().unwrap_or(0) < limit,
            None => true,
        }
    }
}

impl QueueOrder for WipLimitedQueueOrder {
    fn submit(&mut self, request: RequestId, slo_class: SloClass) {
        self.inner.submit(request, slo_class);
    }

    fn next(&mut self) -> Option<RequestId> {
        for class in [SloClass::Interactive, SloClass::Standard, SloClass::BestEffort] {
            if self.under_limit(class) {
                let popped = match class {
                    SloClass::Interactive => self.inner.interactive.pop_front(),
                    SloClass::Standard => self.inner.standard.pop_front(),
                    SloClass::BestEffort => self.inner.best_effort.pop_front(),
                };
                if let Some(id) = popped {
                    *self.in_flight.entry(class).or_insert(0) += 1;
                    return Some(id);
                }
            } else {
                self.starved.push_back(class);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// One request's contribution to the candidate pool for this step.
#[derive(Clone, Copy, Debug)]
pub struct CandidateRequest {
    pub id: RequestId,
    /// Input tokens not yet computed. Zero once prefill is complete.
    pub remaining_prefill: usize,
    /// Rough estimate of new KV blocks this request will need if it
    /// makes it into this step's batch; used only to decide whether
    /// admitting it risks preemption, not to perform the allocation.
    pub kv_blocks_needed_estimate: u32,
}

/// One request's share of a formed batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub request: RequestId,
    /// Number of tokens computed this step: 1 for a decode step, up to
    /// `chunked_prefill_threshold` for a prefill chunk.
    pub tokens: u32,
    pub is_decode: bool,
}

/// Everything a [`BatchFormationStrategy`] needs to decide one step's
/// batch; owned by the instance simulator, handed in fresh each step.
#[derive(Clone, Debug)]
pub struct BatchFormationInput {
    /// Requests already in the running batch, most-recently-admitted last.
    pub running: Vec<CandidateRequest>,
    /// Requests waiting, in the order `QueueOrder` would drain them.
    pub waiting: Vec<CandidateRequest>,
    pub token_budget: u32,
    pub max_batch: u32,
    pub chunked_prefill_threshold: u32,
    pub free_kv_blocks: u32,
}

/// Result of one step's batch formation.
#[derive(Clone, Debug, Default)]
pub struct BatchPlan {
    pub scheduled: Vec<ScheduledChunk>,
    /// Running requests forced back into the wait queue to free KV
    /// capacity for higher-priority admissions this step.
    pub preempted: Vec<RequestId>,
}

/// Turns "what's running" + "what's waiting" into one step's batch.
pub trait BatchFormationStrategy {
    fn form_batch(&self, input: &BatchFormationInput) -> BatchPlan;
}

/// Default vLLM-style strategy (§4.5): continuing (already-running)
/// requests always go first — one decode token if their prefill is
/// already done, otherwise another chunked-prefill-capped slice; if KV
/// pressure from admitting a new request would exceed capacity, the
/// most-recently admitted running request is preempted first (LIFO —
/// it has the least sunk progress to lose); remaining budget is then
/// spent on waiting requests via chunked prefill, in `waiting`'s given
/// order.
#[derive(Default)]
pub struct ContinuousBatchingStrategy;

impl BatchFormationStrategy for ContinuousBatchingStrategy {
    fn form_batch(&self, input: &BatchFormationInput) -> BatchPlan {
        let mut plan = BatchPlan::default();
        let mut tokens_used = 0u32;
        let mut batch_slots_used = 0u32;
        let mut free_kv = input.free_kv_blocks;
        let mut running = input.running.clone();

        // Continuing requests take priority; preempt from the tail
        // (most recently admitted) if KV can't cover everyone.
        while running.len() as u32 > input.max_batch {
            if let Some(victim) = running.pop() {
                plan.preempted.push(victim.id);
            }
        }

        for r in &running {
            if free_kv < r.kv_blocks_needed_estimate {
                plan.preempted.push(r.id);
                continue;
            }
            if tokens_used >= input.token_budget || batch_slots_used >= input.max_batch {
                plan.preempted.push(r.id);
                continue;
            }

            if r.remaining_prefill > 0 {
                let remaining_budget = input.token_budget.saturating_sub(tokens_used);
                let chunk = (r.remaining_prefill as u32)
                    .min(input.chunked_prefill_threshold)
                    .min(remaining_budget);
                if chunk == 0 {
                    plan.preempted.push(r.id);
                    continue;
                }
                free_kv -= r.kv_blocks_needed_estimate;
                tokens_used += chunk;
                batch_slots_used += 1;
                plan.scheduled.push(ScheduledChunk { request: r.id, tokens: chunk, is_decode: false });
            } else {
                free_kv -= r.kv_blocks_needed_estimate;
                tokens_used += 1;
                batch_slots_used += 1;
                plan.scheduled.push(ScheduledChunk { request: r.id, tokens: 1, is_decode: true });
            }
        }

        // Once anything has been preempted this step, stop admitting new
        // waiting requests: growing the batch further while it's already
        // under KV pressure just invites another preemption next step.
        if !plan.preempted.is_empty() {
            return plan;
        }

        for w in &input.waiting {
            if batch_slots_used >= input.max_batch {
                break;
            }
            if free_kv < w.kv_blocks_needed_estimate {
                continue;
            }
            let remaining_budget = input.token_budget.saturating_sub(tokens_used);
            if remaining_budget == 0 {
                break;
            }
            let chunk = (w.remaining_prefill as u32)
                .min(input.chunked_prefill_threshold)
                .min(remaining_budget);
            if chunk == 0 {
                continue;
            }
            free_kv -= w.kv_blocks_needed_estimate;
            tokens_used += chunk;
            batch_slots_used += 1;
            plan.scheduled.push(ScheduledChunk { request: w.id, tokens: chunk, is_decode: false });
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid() -> RequestId {
        RequestId::new_v4()
    }

    #[test]
    fn priority_queue_drains_interactive_before_best_effort() {
        let mut q = PriorityQueueOrder::default();
        let background = rid();
        let interactive = rid();
        q.submit(background, SloClass::BestEffort);
        q.submit(interactive, SloClass::Interactive);
        assert_eq!(q.next(), Some(interactive));
        assert_eq!(q.next(), Some(background));
    }

    #[test]
    fn wip_limit_skips_saturated_class_but_keeps_it_queued() {
        let mut limits = HashMap::new();
        limits.insert(SloClass::Interactive, 1);
        let mut q = WipLimitedQueueOrder::new(limits);
        let a = rid();
        let b = rid();
        q.submit(a, SloClass::Interactive);
        q.submit(b, SloClass::Interactive);

        assert_eq!(q.next(), Some(a));
        assert_eq!(q.next(), None, "second interactive request blocked by WIP cap");
        q.release(SloClass::Interactive);
        assert_eq!(q.next(), Some(b));
    }

    #[test]
    fn continuous_batching_prioritizes_running_requests() {
        let running = CandidateRequest { id: rid(), remaining_prefill: 0, kv_blocks_needed_estimate: 1 };
        let waiting = CandidateRequest { id: rid(), remaining_prefill: 100, kv_blocks_needed_estimate: 1 };
        let input = BatchFormationInput {
            running: vec![running],
            waiting: vec![waiting],
            token_budget: 10,
            max_batch: 4,
            chunked_prefill_threshold: 8,
            free_kv_blocks: 10,
        };
        let plan = ContinuousBatchingStrategy.form_batch(&input);
        assert_eq!(plan.scheduled[0].request, running.id);
        assert!(plan.scheduled[0].is_decode);
        assert_eq!(plan.scheduled[1].request, waiting.id);
        assert_eq!(plan.scheduled[1].tokens, 8, "capped at chunked_prefill_threshold");
    }

    #[test]
    fn continuing_request_still_in_prefill_gets_a_chunked_slice_not_a_decode_token() {
        let running = CandidateRequest { id: rid(), remaining_prefill: 20, kv_blocks_needed_estimate: 1 };
        let input = BatchFormationInput {
            running: vec![running],
            waiting: vec![],
            token_budget: 10,
            max_batch: 4,
            chunked_prefill_threshold: 8,
            free_kv_blocks: 10,
        };
        let plan = ContinuousBatchingStrategy.form_batch(&input);
        assert_eq!(plan.scheduled.len(), 1);
        assert_eq!(plan.scheduled[0].request, running.id);
        assert!(!plan.scheduled[0].is_decode);
        assert_eq!(plan.scheduled[0].tokens, 8, "capped at chunked_prefill_threshold");
    }

    #[test]
    fn insufficient_kv_preempts_running_request_to_admit_nothing_new() {
        let running = CandidateRequest { id: rid(), remaining_prefill: 0, kv_blocks_needed_estimate: 5 };
        let input = BatchFormationInput {
            running: vec![running],
            waiting: vec![],
            token_budget: 10,
            max_batch: 4,
            chunked_prefill_threshold: 8,
            free_kv_blocks: 0,
        };
        let plan = ContinuousBatchingStrategy.form_batch(&input);
        assert!(plan.scheduled.is_empty());
        assert_eq!(plan.preempted, vec![running.id]);
    }

    #[test]
    fn a_preemption_blocks_new_admissions_in_the_same_step() {
        let running = CandidateRequest { id: rid(), remaining_prefill: 0, kv_blocks_needed_estimate: 5 };
        let waiting = CandidateRequest { id: rid(), remaining_prefill: 20, kv_blocks_needed_estimate: 0 };
        let input = BatchFormationInput {
            running: vec![running],
            waiting: vec![waiting],
            token_budget: 10,
            max_batch: 4,
            chunked_prefill_threshold: 8,
            free_kv_blocks: 0,
        };
        let plan = ContinuousBatchingStrategy.form_batch(&input);
        assert_eq!(plan.preempted, vec![running.id]);
        assert!(plan.scheduled.is_empty(), "waiting request must not be admitted in a step that preempted");
    }

    #[test]
    fn exceeding_max_batch_preempts_from_the_tail() {
        let r1 = CandidateRequest { id: rid(), remaining_prefill: 0, kv_blocks_needed_estimate: 0 };
        let r2 = CandidateRequest { id: rid(), remaining_prefill: 0, kv_blocks_needed_estimate: 0 };
        let input = BatchFormationInput {
            running: vec![r1, r2],
            waiting: vec![],
            token_budget: 10,
            max_batch: 1,
            chunked_prefill_threshold: 8,
            free_kv_blocks: 10,
        };
        let plan = ContinuousBatchingStrategy.form_batch(&input);
        assert_eq!(plan.preempted, vec![r2.id]);
        assert_eq!(plan.scheduled[0].request, r1.id);
    }
}
