//! Scenario runner for the cluster simulator. Mirrors the ancestor
//! kernel's `clap`-based `Parser`/`Subcommand` CLI shape (`Demo`,
//! `Receipts { Tail, Verify }`): a couple of subcommands, each doing
//! one obvious thing, flags defaulted to values that work out of the
//! box.
//!
//! `sweep` is the one place in this whole workspace that reaches for
//! `tokio`: running N independent seeded simulations concurrently is
//! embarrassingly parallel — no shared mutable state crosses a run
//! boundary — which is exactly the condition under which the kernel's
//! single-threaded determinism requirement doesn't apply.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use blis_engine::ClusterSimulator;
use blis_instance::Instance;
use blis_latency::{LearnedLinearModel, LatencyModel};
use blis_metrics::{ClusterAggregate, InstanceMetricSummary, MetricsReport, RequestMetric};
use blis_policy::{sane_bundle, AlwaysAdmit, SloClassPriority};
use blis_router::{RoutingPipeline, SnapshotStaleness};
use blis_sched::{ContinuousBatchingStrategy, PriorityQueueOrder};
use blis_trace::{DecisionTrace, InMemorySink};
use blis_types::{InstanceConfig, InstanceId, KvConfig, SloClass, TenantId, Ticks};
use blis_workload::{PoissonWorkload, SloMix, TenantMix, WorkloadConfig};

#[derive(Parser)]
#[command(name = "blis", about = "Deterministic multi-replica inference cluster simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs one seeded simulation end to end and prints a summary.
    Run {
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 50_000)]
        horizon: Ticks,
        #[arg(long, default_value_t = 200)]
        requests: usize,
        #[arg(long, default_value_t = 4)]
        instances: u32,
        #[arg(long)]
        trace: bool,
        /// Print the full per-request/per-instance metrics report as JSON
        /// instead of the one-line summary.
        #[arg(long)]
        json: bool,
        /// YAML deployment descriptor (instance topology + workload mix).
        /// Overrides --instances and the built-in reference workload when
        /// given; see `DeploymentConfig` for the shape. Policy/scheduler
        /// selection is not configurable this way — see DESIGN.md.
        #[arg(long)]
        config: Option<std::path::PathBuf>,
    },
    /// Runs the same scenario across several seeds concurrently and
    /// prints one summary line per seed.
    Sweep {
        #[arg(long, value_delimiter = ',', default_value = "42,123,456")]
        seeds: Vec<u64>,
        #[arg(long, default_value_t = 50_000)]
        horizon: Ticks,
        #[arg(long, default_value_t = 200)]
        requests: usize,
        #[arg(long, default_value_t = 4)]
        instances: u32,
    },
}

/// Deployment/workload descriptor, loaded from YAML the way the ancestor
/// kernel's `ConfigRouter::from_path` loads its YAML config (spec.md §6:
/// "YAML/JSON loading of workload specs and hardware/model descriptors"
/// is named explicitly as an external-collaborator contract). Policy,
/// routing, and scheduler *selections* stay out of this file — spec.md
/// §1 scopes "policy configurations themselves" out, so those remain the
/// hardcoded `sane_bundle()`/`ContinuousBatchingStrategy`/
/// `PriorityQueueOrder` defaults regardless of what this file contains.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct DeploymentConfig {
    instances: Vec<InstanceConfig>,
    workload: WorkloadConfig,
}

fn load_deployment_config(path: &Path) -> Result<DeploymentConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading deployment config {}", path.display()))?;
    let config: DeploymentConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing deployment config {}", path.display()))?;
    anyhow::ensure!(!config.instances.is_empty(), "deployment config must declare at least one instance");
    for instance in &config.instances {
        anyhow::ensure!(instance.kv.total_blocks > 0, "instance {:?}: kv.total_blocks must be positive", instance.id);
        anyhow::ensure!(instance.kv.block_size > 0, "instance {:?}: kv.block_size must be positive", instance.id);
        anyhow::ensure!(instance.max_batch > 0, "instance {:?}: max_batch must be positive", instance.id);
    }
    anyhow::ensure!(config.workload.tenants.is_valid(), "workload.tenants must name at least one tenant with a positive, finite weight");
    anyhow::ensure!(config.workload.slo_mix.is_valid(), "workload.slo_mix must name at least one SLO class with a positive, finite weight");
    anyhow::ensure!(config.workload.arrival_rate > 0.0, "workload.arrival_rate must be positive");
    Ok(config)
}

fn default_latency_model() -> LearnedLinearModel {
    LearnedLinearModel::new(50.0, 2.0, 8.0, 5.0, 20.0, 0.1, 0.1).expect("built-in coefficients are valid")
}

fn default_instance_configs(count: u32) -> Vec<InstanceConfig> {
    (0..count)
        .map(|id| InstanceConfig {
            id: InstanceId(id),
            kv: KvConfig { total_blocks: 4096, block_size: 16 },
            token_budget: 2048,
            max_batch: 64,
            max_running_requests: 64,
            chunked_prefill_threshold: 512,
        })
        .collect()
}

fn build_instances(configs: &[InstanceConfig]) -> HashMap<InstanceId, Instance> {
    configs
        .iter()
        .map(|config| {
            let instance = Instance::new(
                config.clone(),
                Box::new(PriorityQueueOrder::default()),
                Box::new(ContinuousBatchingStrategy),
                Box::new(default_latency_model()) as Box<dyn LatencyModel + Send>,
            );
            (config.id, instance)
        })
        .collect()
}

fn workload_config(requests: usize, horizon: Ticks) -> WorkloadConfig {
    let _ = requests; // request count is enforced by `.take` at the call site
    WorkloadConfig {
        arrival_rate: 0.05,
        tenants: TenantMix::new(vec![(TenantId("default".into()), 1.0)]),
        slo_mix: SloMix::new(vec![(SloClass::Interactive, 2.0), (SloClass::Standard, 3.0), (SloClass::BestEffort, 1.0)]),
        input_len_range: (32, 512),
        output_len_range: (1, 128),
        model_tag: "reference-7b".into(),
        horizon,
    }
}

fn run_once(
    seed: u64,
    horizon: Ticks,
    requests: usize,
    instances: u32,
    trace: bool,
    deployment: Option<&DeploymentConfig>,
) -> anyhow::Result<(blis_engine::ClusterSummary, MetricsReport)> {
    let instance_configs = match deployment {
        Some(d) => d.instances.clone(),
        None => default_instance_configs(instances),
    };
    let instance_ids: Vec<InstanceId> = instance_configs.iter().map(|c| c.id).collect();

    let router = RoutingPipeline::new(sane_bundle(), SnapshotStaleness::Coarse { refresh_interval: 10 }, 2);
    let mut sim = ClusterSimulator::new(
        seed,
        horizon,
        1_000_000,
        build_instances(&instance_configs),
        router,
        Box::new(AlwaysAdmit),
        Box::new(SloClassPriority::default()),
        DecisionTrace::new(trace, InMemorySink::default()),
    );

    let workload_rng = sim.rng_stream("workload").clone();
    let config = match deployment {
        Some(d) => {
            let mut c = d.workload.clone();
            c.horizon = horizon;
            c
        }
        None => workload_config(requests, horizon),
    };
    for request in PoissonWorkload::new(workload_rng, config).take(requests) {
        sim.submit(request);
    }

    let summary = sim.run()?;
    let report = build_metrics_report(&sim, &summary, &instance_ids);
    Ok((summary, report))
}

/// Assembles the reporting-layer view from a finished run's final
/// state: per-instance summaries plus every request each instance
/// completed, sorted by id so the serialized report is a pure function
/// of simulation state (no hash-map iteration order leaking in).
fn build_metrics_report(
    sim: &ClusterSimulator<InMemorySink>,
    summary: &blis_engine::ClusterSummary,
    instance_ids: &[InstanceId],
) -> MetricsReport {
    let mut requests = Vec::new();
    let mut instance_summaries = Vec::new();
    for &instance_id in instance_ids {
        let Some(instance) = sim.instance(instance_id) else { continue };
        for request in instance.completed_requests() {
            requests.push(RequestMetric::from_request(request));
        }
        let metrics = instance.metrics();
        instance_summaries.push(InstanceMetricSummary::summarize(
            instance_id,
            metrics.completed_count,
            &metrics.queue_depth_samples,
            metrics.peak_batch_size,
            &metrics.kv_utilization_samples,
            metrics.preemption_count,
            metrics.cache_hits,
            metrics.cache_misses,
        ));
    }
    requests.sort_by_key(|r| r.request);

    MetricsReport {
        requests,
        instances: instance_summaries,
        cluster: ClusterAggregate {
            rejection_count: summary.metrics.rejections,
            priority_inversion_count: summary.metrics.priority_inversions,
            hol_blocking_count: summary.metrics.hol_blocking,
            completed_count: summary.metrics.completed,
            final_time: summary.final_time,
        },
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { seed, horizon, requests, instances, trace, json, config } => {
            let deployment = config.as_deref().map(load_deployment_config).transpose()?;
            let (summary, report) = run_once(seed, horizon, requests, instances, trace, deployment.as_ref())?;
            if json {
                println!("{}", report.to_canonical_json()?);
            } else {
                println!(
                    "seed={seed} events_processed={} final_time={} completed={} rejections={} preemptions={} priority_inversions={} hol_blocking={}",
                    summary.events_processed,
                    summary.final_time,
                    summary.metrics.completed,
                    summary.metrics.rejections,
                    summary.metrics.preemptions,
                    summary.metrics.priority_inversions,
                    summary.metrics.hol_blocking,
                );
            }
        }
        Command::Sweep { seeds, horizon, requests, instances } => {
            let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            let results = runtime.block_on(async move {
                let handles: Vec<_> = seeds
                    .into_iter()
                    .map(|seed| {
                        tokio::task::spawn_blocking(move || {
                            run_once(seed, horizon, requests, instances, false, None).map(|(s, _)| (seed, s))
                        })
                    })
                    .collect();
                let mut out = Vec::new();
                for handle in handles {
                    out.push(handle.await??);
                }
                Ok::<_, anyhow::Error>(out)
            })?;
            for (seed, summary) in results {
                println!(
                    "seed={seed} events_processed={} final_time={} completed={} rejections={}",
                    summary.events_processed, summary.final_time, summary.metrics.completed, summary.metrics.rejections
                );
            }
        }
    }
    Ok(())
}
