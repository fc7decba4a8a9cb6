//! Metrics surface (§6): per-request, per-instance, and cluster
//! aggregate views built from whatever a run already tracked in
//! `blis-instance`/`blis-engine`. Kept as a standalone reporting layer
//! rather than threading itself through the engine, so the kernel
//! stays free of a metrics dependency it doesn't otherwise need —
//! `blis-cli` is what actually wires a finished run's state into a
//! `MetricsReport`.
//!
//! `MetricsReport`'s `Serialize` derive is what the determinism law
//! (§8: "byte-identical serialized per-request metrics" across two
//! runs of the same seed) is checked against: struct fields serialize
//! in declaration order, so as long as the `Vec`s inside are built by
//! iterating in a fixed order, the same seed produces the same bytes.

use blis_types::{InstanceId, Request, RequestId, SloClass, TenantId, Ticks};
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct RequestMetric {
    pub request: RequestId,
    pub tenant: TenantId,
    pub slo_class: SloClass,
    pub model_tag: String,
    pub arrival: Ticks,
    pub ttft: Option<Ticks>,
    pub end_to_end: Option<Ticks>,
    pub assigned_instance: Option<InstanceId>,
}

impl RequestMetric {
    pub fn from_request(request: &Request) -> Self {
        let ts = &request.timestamps;
        Self {
            request: request.id,
            tenant: request.tenant.clone(),
            slo_class: request.slo_class,
            model_tag: request.model_tag.clone(),
            arrival: request.arrival,
            ttft: ts.first_token.zip(ts.arrival).map(|(ft, a)| ft.saturating_sub(a)),
            end_to_end: ts.completion.zip(ts.arrival).map(|(c, a)| c.saturating_sub(a)),
            assigned_instance: request.assigned_instance,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct InstanceMetricSummary {
    pub instance: Option<InstanceId>,
    pub completed_count: u64,
    pub peak_queue_depth: u32,
    pub mean_queue_depth: f64,
    pub peak_batch_size: u32,
    pub mean_kv_utilization: f64,
    pub preemption_count: u64,
    pub cache_hit_rate: Option<f64>,
}

impl InstanceMetricSummary {
    pub fn summarize(
        instance: InstanceId,
        completed_count: u64,
        queue_depth_samples: &[u32],
        peak_batch_size: u32,
        kv_utilization_samples: &[f64],
        preemption_count: u64,
        cache_hits: u64,
        cache_misses: u64,
    ) -> Self {
        let mean = |xs: &[f64]| -> f64 {
            if xs.is_empty() {
                0.0
            } else {
                xs.iter().sum::<f64>() / xs.len() as f64
            }
        };
        let total_cache_samples = cache_hits + cache_misses;
        Self {
            instance: Some(instance),
            completed_count,
            peak_queue_depth: queue_depth_samples.iter().copied().max().unwrap_or(0),
            mean_queue_depth: mean(&queue_depth_samples.iter().map(|&x| x as f64).collect::<Vec<_>>()),
            peak_batch_size,
            mean_kv_utilization: mean(kv_utilization_samples),
            preemption_count,
            cache_hit_rate: if total_cache_samples > 0 {
                Some(cache_hits as f64 / total_cache_samples as f64)
            } else {
                None
            },
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ClusterAggregate {
    pub rejection_count: u64,
    pub priority_inversion_count: u64,
    pub hol_blocking_count: u64,
    pub completed_count: u64,
    pub final_time: Ticks,
}

impl ClusterAggregate {
    /// Completed requests per tick of simulated wall time; `0.0` for a
    /// run that never advanced the clock.
    pub fn throughput(&self) -> f64 {
        if self.final_time == 0 {
            0.0
        } else {
            self.completed_count as f64 / self.final_time as f64
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsReport {
    pub requests: Vec<RequestMetric>,
    pub instances: Vec<InstanceMetricSummary>,
    pub cluster: ClusterAggregate,
}

impl MetricsReport {
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
