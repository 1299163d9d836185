use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use squall_core::prelude::TimeWindow;
use squall_harvester::assemble::{assemble, AssemblyConfig, AssemblyError};
use squall_harvester::backend::{MonitoringBackend, PrometheusBackend};
use squall_harvester::cli::{
    AssembleArgs, CheckArgs, Cli, CollectArgs, CombineArgs, Command, SimulateArgs, WorkloadKind,
};
use squall_harvester::collect::collect;
use squall_harvester::dataset::{
    load_processed_rows, split_rows, write_datasets, write_processed_row, write_raw_snapshot,
    RawSnapshot, SnapshotMetadata,
};
use squall_harvester::flatten::{flatten, FeatureSchema};
use squall_harvester::registry::{self, CategorySpec};
use squall_harvester::report;
use squall_runner::prelude::{
    start, start_abort_listener, start_monitor, LocalWorkload, PodWorkload, RunPlan,
    WorkloadBackend,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Assemble(args) => run_assemble(args).await,
        Command::Collect(args) => run_collect(args).await,
        Command::Simulate(args) => run_simulate(args).await,
        Command::Check(args) => run_check(args).await,
        Command::Combine(args) => run_combine(args),
    }
}

async fn run_assemble(args: AssembleArgs) -> anyhow::Result<()> {
    let backend: Arc<dyn MonitoringBackend> =
        Arc::new(PrometheusBackend::new(args.prometheus_url)?);
    let workload = workload_backend(args.workload)?;

    let abort = start_abort_listener();
    if args.workload == WorkloadKind::Pod {
        start_monitor(abort.new_listener());
    }

    let config = AssemblyConfig {
        scenarios: args.scenarios,
        iterations: args.iterations,
        patterns: args.patterns,
        collect_namespaces: vec![args.namespace.clone()],
        namespace: args.namespace,
        duration_range: args.duration_range,
        pods_range: args.pods_range,
        cooldown_range: args.cooldown_range,
        step_seconds: args.step,
        test_fraction: args.test_fraction,
        split_seed: args.seed,
        degraded_policy: args.on_degraded,
        output_dir: args.output_dir,
        skip_combine: args.skip_combine,
        progress: !args.no_progress,
    };

    let outcome = assemble(config, backend, workload, abort).await?;

    report::print_iteration_summary(&outcome.reports);
    report::print_label_distribution(&outcome.rows);
    if let Some(datasets) = &outcome.datasets {
        println!("Training data: {}", datasets.training.display());
        println!("Testing data: {}", datasets.testing.display());
    }

    Ok(())
}

async fn run_collect(args: CollectArgs) -> anyhow::Result<()> {
    let backend = PrometheusBackend::new(args.prometheus_url)?;
    if !backend.ping().await {
        return Err(AssemblyError::Connectivity.into());
    }

    let categories: Vec<CategorySpec> = if args.categories.is_empty() {
        registry::CATEGORIES.to_vec()
    } else {
        args.categories
            .iter()
            .filter_map(|name| registry::category(name))
            .copied()
            .collect()
    };

    let window = TimeWindow::ending_now(Duration::from_secs(args.duration_mins * 60));
    let collected = collect(&backend, &window, &categories, &args.namespaces, args.step).await;

    let unavailable: Vec<&str> = collected
        .iter()
        .filter(|(_, result)| !result.is_available())
        .map(|(name, _)| name.as_str())
        .collect();
    if !unavailable.is_empty() {
        log::warn!("Unavailable categories: {}", unavailable.join(", "));
    }

    let schema = FeatureSchema::global();
    let run_id = squall_run_model::new_run_id();
    let row = flatten(&run_id, &args.cluster_issue, false, &collected, &schema)?;

    let (window_start, window_end) = window.unix_bounds();
    let snapshot = RawSnapshot {
        metadata: SnapshotMetadata {
            run_id,
            label: args.cluster_issue.clone(),
            window_start,
            window_end,
            step_seconds: args.step,
            namespaces: args.namespaces.clone(),
            schema_fingerprint: schema.fingerprint().to_string(),
            run_fingerprint: None,
            run: None,
        },
        categories: collected,
    };

    let raw_path = write_raw_snapshot(&snapshot, &args.output_dir)?;
    let processed_path = write_processed_row(&row, &schema, &args.output_dir)?;

    println!("Raw snapshot: {}", raw_path.display());
    println!("Processed row: {}", processed_path.display());

    Ok(())
}

async fn run_simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let workload = workload_backend(args.workload)?;

    let abort = start_abort_listener();
    if args.workload == WorkloadKind::Pod {
        start_monitor(abort.new_listener());
    }

    let plan = RunPlan::new(
        args.scenario,
        args.pattern,
        args.pods as usize,
        Duration::from_secs(args.duration),
    )
    .with_namespace(args.namespace)
    .with_progress(!args.no_progress);

    let active = start(workload, plan).await?;

    let run_stop = active.stop_handle();
    let mut abort_listener = abort.new_listener();
    let relay = tokio::spawn(async move {
        abort_listener.wait_for_stop().await;
        run_stop.stop();
    });

    let completed = active.wait().await;
    relay.abort();

    let record = completed.into_record(env!("CARGO_PKG_VERSION"));
    println!(
        "Run {} ({}) finished after {}s with {} of {} units{}",
        record.run_id,
        record.scenario,
        record.ended_at - record.started_at,
        record.units_started,
        record.participant_count,
        if record.degraded() { ", degraded" } else { "" }
    );

    Ok(())
}

async fn run_check(args: CheckArgs) -> anyhow::Result<()> {
    let backend = PrometheusBackend::new(args.prometheus_url.clone())?;
    if !backend.ping().await {
        return Err(AssemblyError::Connectivity.into());
    }

    println!("Monitoring backend at {} is reachable", args.prometheus_url);

    Ok(())
}

fn run_combine(args: CombineArgs) -> anyhow::Result<()> {
    let schema = FeatureSchema::global();
    let rows = load_processed_rows(&args.output_dir, &schema)?;
    if rows.is_empty() {
        return Err(AssemblyError::NoRows.into());
    }

    let split = split_rows(rows.clone(), args.test_fraction, args.seed)?;
    let datasets = write_datasets(&split, &schema, &args.output_dir)?;

    report::print_label_distribution(&rows);
    println!(
        "Training data: {} ({} rows)",
        datasets.training.display(),
        split.train.len()
    );
    println!(
        "Testing data: {} ({} rows)",
        datasets.testing.display(),
        split.test.len()
    );

    Ok(())
}

fn workload_backend(kind: WorkloadKind) -> anyhow::Result<Arc<dyn WorkloadBackend>> {
    Ok(match kind {
        WorkloadKind::Local => Arc::new(LocalWorkload::new()),
        WorkloadKind::Pod => Arc::new(PodWorkload::new()?),
    })
}
