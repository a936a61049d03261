//! opsflow CLI
//!
//! Drives the orchestrator against the in-memory backends. Published events
//! are printed to stdout as JSON lines; logs go to stderr.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use notify::{EventBus, NotifyEvent, Subscription, Topic};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use opsflow::alerts::{AlertKey, ClusterEngine, NewAlert, Severity};
use opsflow::patch::{
    ApprovalDecision, CannedSuggestions, PatchRun, RunId, RunStatus, SimulatedExecutor,
    SuggestionProvider,
};
use opsflow::queue::MemoryQueue;
use opsflow::store::{MemoryStore, Store};
use opsflow::{Orchestrator, OrchestratorConfig};

/// Alert clustering and patch rollout orchestration
#[derive(Parser)]
#[command(name = "opsflow")]
#[command(about = "Alert clustering and patch rollout orchestration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true, env = "OPSFLOW_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run clustering and a patch rollout end to end, printing every event
    Demo {
        /// Distinct alert fingerprints to ingest
        #[arg(long, default_value_t = 4)]
        fingerprints: usize,

        /// Alerts per fingerprint
        #[arg(long, default_value_t = 5)]
        per_fingerprint: usize,

        /// Fail the plan at this step (1-based) and roll the run back
        #[arg(long)]
        fail_step: Option<usize>,

        /// Run the plan without approving it first
        #[arg(long)]
        auto_execute: bool,

        /// Client the alerts and plan belong to
        #[arg(long, default_value = "acme")]
        client: String,

        /// Products to patch
        #[arg(long, value_delimiter = ',', default_value = "openssl,nginx")]
        products: Vec<String>,

        /// Seconds to wait for each asynchronous stage
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Ingest alerts from a JSON file, run one clustering pass, print the clusters
    Cluster {
        /// JSON array of alerts
        #[arg(long)]
        alerts: PathBuf,
    },
}

struct DemoOptions {
    fingerprints: usize,
    per_fingerprint: usize,
    fail_step: Option<usize>,
    auto_execute: bool,
    client: String,
    products: Vec<String>,
    wait: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Demo {
            fingerprints,
            per_fingerprint,
            fail_step,
            auto_execute,
            client,
            products,
            timeout,
        } => {
            run_demo(DemoOptions {
                fingerprints,
                per_fingerprint,
                fail_step,
                auto_execute,
                client,
                products,
                wait: Duration::from_secs(timeout),
            })
            .await
        }
        Commands::Cluster { alerts } => run_cluster(&alerts).await,
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("opsflow=debug,notify=debug")
        } else {
            EnvFilter::new("opsflow=info,notify=info")
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

async fn run_demo(opts: DemoOptions) -> Result<()> {
    let mut config = OrchestratorConfig::from_env();
    if opts.auto_execute {
        config = config.with_auto_execute(true);
    }

    let bus = Arc::new(EventBus::from_env());
    let printing = CancellationToken::new();
    let printers: Vec<JoinHandle<()>> = Topic::all()
        .into_iter()
        .map(|topic| spawn_printer(bus.subscribe(topic), printing.clone()))
        .collect();

    let plan_request = CannedSuggestions
        .propose_patch_plan(&opts.client, &opts.products)
        .await
        .context("Failed to build demo plan")?
        .into_plan(&opts.client, "demo");

    let mut executor = SimulatedExecutor::new().with_step_delay(Duration::from_millis(50));
    if let Some(step) = opts.fail_step {
        let target = step
            .checked_sub(1)
            .and_then(|index| plan_request.steps.get(index))
            .ok_or_else(|| {
                anyhow!(
                    "--fail-step {step} is outside the plan's {} steps",
                    plan_request.steps.len()
                )
            })?;
        info!(step, kind = target.kind(), "Plan will fail at step");
        executor = executor.failing_on(target.kind());
    }

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryQueue::new(config.queue)),
        bus.clone(),
        Arc::new(executor),
        Arc::new(CannedSuggestions),
    );
    let workers = orchestrator.start_workers(CancellationToken::new());
    info!(workers = workers.size(), "Workers started");

    // Clustering
    let alerts = demo_alerts(&opts.client, opts.fingerprints, opts.per_fingerprint);
    orchestrator.ingest_alerts(alerts).await?;

    let mut clustered = bus.subscribe(Topic::AlertClustered);
    let first = orchestrator.trigger_clustering().await?;
    let second = orchestrator.trigger_clustering().await?;
    info!(
        job_id = %first.job_id,
        coalesced = second.coalesced,
        "Clustering triggered twice"
    );
    tokio::time::timeout(opts.wait, clustered.recv())
        .await
        .context("Timed out waiting for clustering")?;

    for cluster in orchestrator.list_clusters().await? {
        info!(
            fingerprint = %cluster.fingerprint,
            size = cluster.size,
            top_severity = %cluster.top_severity,
            "Cluster"
        );
    }

    // Patch rollout
    let plan = orchestrator.submit_plan(plan_request).await?;
    if !orchestrator.config().auto_execute {
        if let Err(e) = orchestrator.request_run(plan.id).await {
            let (kind, message) = e.into_parts();
            info!(%kind, %message, "Run refused before approval");
        }
        orchestrator
            .approve_plan(plan.id, ApprovalDecision::Approve)
            .await?;
    }

    let run_id = orchestrator.request_run(plan.id).await?;
    let run = wait_for_run(&orchestrator, run_id, |status| status.is_terminal(), opts.wait).await?;
    info!(run_id = %run_id, status = %run.status, "Run finished");

    if run.status == RunStatus::Failed {
        orchestrator.request_rollback(run_id).await?;
        let run = wait_for_run(
            &orchestrator,
            run_id,
            |status| status == RunStatus::RolledBack,
            opts.wait,
        )
        .await?;
        info!(run_id = %run_id, status = %run.status, "Run rolled back");
    }

    workers.shutdown().await;
    printing.cancel();
    for printer in printers {
        printer.await?;
    }
    Ok(())
}

async fn run_cluster(path: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let alerts: Vec<NewAlert> =
        serde_json::from_str(&raw).context("Failed to parse alerts file")?;

    let store = Arc::new(MemoryStore::new());
    for alert in alerts {
        store.upsert_alert(alert).await?;
    }

    let report = ClusterEngine::new(store.clone()).run_pass().await?;
    if !report.is_complete() {
        warn!(skipped = ?report.skipped, "Some fingerprint groups were skipped");
    }

    let clusters = store.list_clusters().await?;
    println!("{}", serde_json::to_string_pretty(&clusters)?);
    Ok(())
}

/// `per_fingerprint` alerts for each of `fingerprints` fingerprints, with
/// severities cycling LOW, MED, HIGH, CRITICAL within each group.
fn demo_alerts(client: &str, fingerprints: usize, per_fingerprint: usize) -> Vec<NewAlert> {
    const CYCLE: [Severity; 4] = [
        Severity::Low,
        Severity::Med,
        Severity::High,
        Severity::Critical,
    ];

    (0..fingerprints)
        .flat_map(|group| {
            (0..per_fingerprint).map(move |member| {
                NewAlert::new(
                    client,
                    AlertKey::new("demo", format!("alert-{group}-{member}")),
                    CYCLE[member % CYCLE.len()],
                    format!("fp-{group}"),
                )
            })
        })
        .collect()
}

async fn wait_for_run(
    orchestrator: &Orchestrator,
    run_id: RunId,
    done: impl Fn(RunStatus) -> bool,
    wait: Duration,
) -> Result<PatchRun> {
    let deadline = Instant::now() + wait;
    loop {
        let run = orchestrator.get_run(run_id).await?;
        if done(run.status) {
            return Ok(run);
        }
        if Instant::now() >= deadline {
            bail!("Run {run_id} still {} after {wait:?}", run.status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn spawn_printer(mut subscription: Subscription, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) => print_event(&event),
                    None => break,
                },
                () = stop.cancelled() => {
                    while let Some(event) = subscription.try_recv() {
                        print_event(&event);
                    }
                    break;
                }
            }
        }
    })
}

fn print_event(event: &NotifyEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "Failed to serialize event"),
    }
}
