use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use ceph_node_maintenance::client::{ClusterClient, KubeClusterClient};
use ceph_node_maintenance::config::Config;
use ceph_node_maintenance::controller::maintenance::types::by_category;
use ceph_node_maintenance::controller::maintenance::{
    Confirmation, ConflictWarning, Decision, DownPhase, DownReview, MaintenancePhase, Orchestrator,
    PhaseExecution, PhaseOutcome, PhaseState, ProgressEvent, StepStatus, UpReview,
    ValidationResults,
};
use ceph_node_maintenance::controller::monitor::{ClusterMonitor, MonitorSnapshot};
use ceph_node_maintenance::error::NextAction;
use ceph_node_maintenance::telemetry::{init_tracing, LogFormat};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true, env = "CEPH_MAINT_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace of the storage cluster
    #[arg(long, global = true, env = "ROOK_NAMESPACE")]
    namespace: Option<String>,

    /// Namespace of the storage operator
    #[arg(long, global = true, env = "ROOK_OPERATOR_NAMESPACE")]
    operator_namespace: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, env = "LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Take a node out of service
    Down(PhaseArgs),
    /// Bring a node back into service
    Up(PhaseArgs),
    /// Show the down and up plans for a node without changing anything
    Plan(PlanArgs),
    /// Watch node and storage health
    Monitor(MonitorArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct PhaseArgs {
    /// Node to act on
    node: String,

    /// Confirm the plan without prompting
    #[arg(long, short = 'y')]
    yes: bool,

    /// Continue even if other nodes appear to be in maintenance
    #[arg(long)]
    acknowledge_conflicts: bool,

    /// Skip planned workloads that no longer exist (up only)
    #[arg(long)]
    skip_missing: bool,
}

#[derive(Parser, Debug)]
struct PlanArgs {
    node: String,

    /// Print the plans as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct MonitorArgs {
    node: String,

    /// Seconds between printed snapshots
    #[arg(long, default_value_t = 5)]
    interval: u64,

    /// Print snapshots as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Commands::Version = args.command {
        println!("ceph-maint v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_config(&args)?;
    // Spans are flushed when the guard drops, including on early returns
    let _tracing = init_tracing(args.log_format)?;

    let client = KubeClusterClient::try_default(&config.maintenance)
        .await
        .context("connecting to the Kubernetes cluster")?;
    let client: Arc<dyn ClusterClient> = Arc::new(client);
    info!("Connected to Kubernetes cluster");

    match args.command {
        Commands::Down(phase) => run_down(Orchestrator::new(client, config.maintenance), phase).await,
        Commands::Up(phase) => run_up(Orchestrator::new(client, config.maintenance), phase).await,
        Commands::Plan(plan) => run_plan(Orchestrator::new(client, config.maintenance), plan).await,
        Commands::Monitor(monitor) => run_monitor(client, config, monitor).await,
        Commands::Version => Ok(()),
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(namespace) = &args.namespace {
        config.maintenance.namespace = namespace.clone();
    }
    if let Some(namespace) = &args.operator_namespace {
        config.maintenance.operator_namespace = namespace.clone();
    }
    config.maintenance.validate()?;
    Ok(config)
}

async fn run_down(orch: Orchestrator, args: PhaseArgs) -> anyhow::Result<()> {
    let review = orch.prepare_down(&args.node).await?;
    print_down_review(&review);

    if review.state() == DownPhase::NothingToDo {
        println!("\nNode {} is already in maintenance, nothing to do.", args.node);
        return Ok(());
    }

    let has_conflicts = review.conflicts.has_conflicts();
    let decision = decide(&args, has_conflicts).await?;
    let confirmed = match review.confirm(decision)? {
        Confirmation::Confirmed(confirmed) => confirmed,
        Confirmation::Declined => {
            println!("Declined, nothing was changed.");
            return Ok(());
        }
        Confirmation::NothingToDo => return Ok(()),
    };

    let cancel = CancellationToken::new();
    let mut outcome = drive(orch.execute_down(&confirmed, cancel.clone()), cancel).await?;
    loop {
        println!("\nDown phase {}", outcome);
        let retry = match outcome.next_action() {
            NextAction::None => return Ok(()),
            NextAction::Retry => prompt("Retry from preflight with the same plan?").await?,
            _ => false,
        };
        if !retry {
            bail!(
                "down phase for {} did not complete ({})",
                args.node,
                outcome.next_action()
            );
        }
        let cancel = CancellationToken::new();
        outcome = drive(orch.retry_down(&confirmed, &outcome, cancel.clone()), cancel).await?;
    }
}

async fn run_up(orch: Orchestrator, args: PhaseArgs) -> anyhow::Result<()> {
    let review = orch.prepare_up(&args.node).await?;
    print_up_review(&review);

    let has_conflicts = !review.conflicts.other_nodes.is_empty();
    let decision = decide(&args, has_conflicts).await?;
    let mut confirmed = match review.confirm(decision)? {
        Confirmation::Confirmed(confirmed) => confirmed,
        Confirmation::Declined => {
            println!("Declined, nothing was changed.");
            return Ok(());
        }
        Confirmation::NothingToDo => return Ok(()),
    };

    let cancel = CancellationToken::new();
    let mut outcome = drive(orch.execute_up(&confirmed, cancel.clone()), cancel).await?;
    loop {
        println!("\nUp phase {}", outcome);
        let retry = match (&outcome, outcome.next_action()) {
            (_, NextAction::None) => return Ok(()),
            (PhaseOutcome::MissingWorkloads(missing), NextAction::AcknowledgeAndContinue) => {
                let skip = args.skip_missing
                    || prompt("Skip the missing workloads and continue?").await?;
                if skip {
                    confirmed = confirmed.acknowledge_missing(missing.clone());
                }
                skip
            }
            (_, NextAction::Retry) => prompt("Retry from preflight with the same plan?").await?,
            _ => false,
        };
        if !retry {
            bail!(
                "up phase for {} did not complete ({})",
                args.node,
                outcome.next_action()
            );
        }
        let cancel = CancellationToken::new();
        outcome = drive(orch.retry_up(&confirmed, &outcome, cancel.clone()), cancel).await?;
    }
}

async fn run_plan(orch: Orchestrator, args: PlanArgs) -> anyhow::Result<()> {
    let (down, up) = tokio::join!(orch.prepare_down(&args.node), orch.prepare_up(&args.node));
    let (down, up) = (down?, up?);

    if args.json {
        let plans = serde_json::json!({
            "down": down.plan.as_ref(),
            "down_state": down.state().label(),
            "up": up.plan.as_ref(),
            "conflicts": &down.conflicts,
        });
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }

    print_down_review(&down);
    println!();
    print_up_review(&up);
    Ok(())
}

async fn run_monitor(
    client: Arc<dyn ClusterClient>,
    config: Config,
    args: MonitorArgs,
) -> anyhow::Result<()> {
    let monitor = ClusterMonitor::new(
        client,
        &config.maintenance.namespace,
        &args.node,
        config.monitor,
    );
    monitor.start();

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                let snapshot = monitor.snapshot();
                if args.json {
                    println!("{}", serde_json::to_string(snapshot.as_ref())?);
                } else {
                    print_snapshot(monitor.node(), &snapshot);
                }
            }
        }
    }

    monitor.stop().await;
    Ok(())
}

/// Stream progress until the phase ends; Ctrl-C requests cancellation
async fn drive<S>(
    mut exec: PhaseExecution<S>,
    cancel: CancellationToken,
) -> anyhow::Result<PhaseOutcome>
where
    S: PhaseState + Into<MaintenancePhase>,
{
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let direction = current_phase(&exec).direction();

    loop {
        tokio::select! {
            Some(event) = exec.events.recv() => print_event(direction, &event),
            outcome = &mut exec.handle => {
                while let Ok(event) = exec.events.try_recv() {
                    print_event(direction, &event);
                }
                if exec.dropped_events() > 0 {
                    warn!("{} progress event(s) were not displayed", exec.dropped_events());
                }
                let last = current_phase(&exec);
                if last.is_halted() {
                    println!("Stopped in {}: {}", last, last.description());
                }
                return outcome.context("maintenance task failed");
            }
            _ = &mut ctrl_c, if !cancel.is_cancelled() => {
                eprintln!("Cancelling; the step in progress will finish first");
                cancel.cancel();
            }
        }
    }
}

fn current_phase<S>(exec: &PhaseExecution<S>) -> MaintenancePhase
where
    S: PhaseState + Into<MaintenancePhase>,
{
    (*exec.states.borrow()).into()
}

async fn decide(args: &PhaseArgs, has_conflicts: bool) -> anyhow::Result<Decision> {
    let accept = args.yes || prompt("Proceed with this plan?").await?;
    if !accept {
        return Ok(Decision::Decline);
    }

    let acknowledge_conflicts = !has_conflicts
        || args.acknowledge_conflicts
        || (!args.yes && prompt("Other maintenance appears to be in progress. Continue anyway?").await?);
    Ok(Decision::Accept {
        acknowledge_conflicts,
    })
}

async fn prompt(question: &str) -> anyhow::Result<bool> {
    let question = question.to_string();
    tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
        print!("{question} [y/N] ");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
    })
    .await?
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn print_down_review(review: &DownReview) {
    let plan = &review.plan;
    println!("Down plan for {} (captured {})", plan.node(), plan.captured_at().to_rfc3339());
    println!("  Node cordoned:      {}", yes_no(plan.node_cordoned()));
    println!(
        "  Safety flag:        {} ({})",
        yes_no(plan.safety_flag_set()),
        plan.safety_flag()
    );
    match plan.operator() {
        Some(op) => println!("  Operator:           {} ({} replica(s))", op.id(), op.replicas),
        None => println!("  Operator:           not found"),
    }

    let grouped = by_category(plan.workloads());
    let counts: Vec<String> = grouped
        .iter()
        .map(|(category, workloads)| format!("{category}: {}", workloads.len()))
        .collect();
    println!("  Workloads:          {}", plan.workloads().len());
    if !counts.is_empty() {
        println!("                      {}", counts.join(", "));
    }
    for (i, w) in plan.workloads().iter().enumerate() {
        println!("    {:>2}. {} [{}] {} replica(s)", i + 1, w.id(), w.category, w.replicas);
    }

    print_validation(&review.validation);
    print_conflicts(&review.conflicts);
}

fn print_up_review(review: &UpReview) {
    let plan = &review.plan;
    println!("Up plan for {} (captured {})", plan.node(), plan.captured_at().to_rfc3339());
    match plan.operator() {
        Some(op) => println!(
            "  Operator:           {} (restore to {} replica(s))",
            op.id(),
            op.restore_replicas
        ),
        None => println!("  Operator:           not found"),
    }
    if plan.leave_safety_flag() {
        println!("  {} flag will be left set: other nodes are in maintenance", plan.safety_flag());
    }
    println!("  Workloads:          {}", plan.targets().len());
    for (i, t) in plan.targets().iter().enumerate() {
        println!(
            "    {:>2}. {} [{}] restore to {} replica(s)",
            i + 1,
            t.workload.id(),
            t.workload.category,
            t.replicas
        );
    }

    print_validation(&review.validation);
    print_conflicts(&review.conflicts);
}

fn print_validation(validation: &ValidationResults) {
    println!("Preflight:");
    for result in &validation.results {
        let marker = if result.passed { "ok" } else { "FAIL" };
        println!("  [{:>4}] {}: {}", marker, result.check, result.message);
    }
}

fn print_conflicts(conflicts: &ConflictWarning) {
    if conflicts.has_conflicts() {
        println!("Warnings:");
        for line in conflicts.summary().lines() {
            println!("  ! {line}");
        }
    }
}

fn print_event(direction: &str, event: &ProgressEvent) {
    let marker = match event.status {
        StepStatus::Running => "..",
        StepStatus::Success => "ok",
        StepStatus::Skipped => "--",
        StepStatus::Warning => "!!",
        StepStatus::Error => "xx",
    };
    match &event.workload {
        Some(workload) => println!(
            "[{}] {:<4} {:<21} {}: {}",
            marker, direction, event.stage, workload, event.description
        ),
        None => println!(
            "[{}] {:<4} {:<21} {}",
            marker, direction, event.stage, event.description
        ),
    }
}

fn print_snapshot(node: &str, snapshot: &MonitorSnapshot) {
    let as_of = snapshot
        .updated_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    println!("{} {}: {}", as_of, node, snapshot.summary.status);
    for reason in &snapshot.summary.reasons {
        println!("    {reason}");
    }
}
