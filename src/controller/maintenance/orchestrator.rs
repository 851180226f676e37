//! Phase orchestration
//!
//! `prepare_*` builds a review (plan, preflight warm-up, conflicts) without
//! touching the cluster. `execute_*` runs a confirmed plan on a background
//! task and hands back a [`PhaseExecution`] with the progress queue, a watch
//! on the current phase state and the task's outcome.
//!
//! There is no rollback. A failure or cancellation leaves completed steps in
//! place and `retry_*` runs the same confirmed plan again from preflight.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use super::conflict::check_other_nodes_in_maintenance;
use super::discovery::list_pinned;
use super::phase::{DownPhase, PhaseState, PhaseTracker, UpPhase};
use super::plan::{build_down_plan, build_up_plan, ConfirmedDown, ConfirmedUp, DownReview, UpReview};
use super::preflight::PreflightValidator;
use super::progress::{DroppedEvents, ProgressEvent, ProgressSink, StepStatus};
use super::types::ValidationResults;
use crate::client::{ClusterClient, ReplicaAnnotation};
use crate::config::MaintenanceConfig;
use crate::error::{Error, NextAction, Result};

/// Summary of a phase that ran to completion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionSummary {
    /// Workloads scaled down or restored
    pub workloads_scaled: usize,
    pub elapsed: Duration,
    /// Workloads skipped after the operator acknowledged them as missing
    pub skipped: Vec<String>,
}

/// Where and why a phase stopped
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub stage: &'static str,
    pub workload: Option<String>,
    pub message: String,
}

/// How a phase run ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed(CompletionSummary),
    Cancelled { stage: &'static str },
    Failed(ExecutionFailure),
    /// Preflight failed; nothing was changed by this run
    ValidationFailed(ValidationResults),
    /// Planned workloads that no longer exist, by `namespace/name`
    MissingWorkloads(Vec<String>),
}

impl PhaseOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PhaseOutcome::Completed(_))
    }

    pub fn next_action(&self) -> NextAction {
        match self {
            PhaseOutcome::Completed(_) => NextAction::None,
            PhaseOutcome::Cancelled { .. }
            | PhaseOutcome::Failed(_)
            | PhaseOutcome::ValidationFailed(_) => NextAction::Retry,
            PhaseOutcome::MissingWorkloads(_) => NextAction::AcknowledgeAndContinue,
        }
    }

    pub fn message(&self) -> String {
        match self {
            PhaseOutcome::Completed(summary) => {
                let mut message = format!(
                    "completed in {:.1}s, {} workload(s) scaled",
                    summary.elapsed.as_secs_f64(),
                    summary.workloads_scaled
                );
                if !summary.skipped.is_empty() {
                    message.push_str(&format!(", skipped: {}", summary.skipped.join(", ")));
                }
                message
            }
            PhaseOutcome::Cancelled { stage } => {
                format!("cancelled during {stage}; completed steps were left in place")
            }
            PhaseOutcome::Failed(failure) => match &failure.workload {
                Some(workload) => format!(
                    "failed during {} on {}: {}",
                    failure.stage, workload, failure.message
                ),
                None => format!("failed during {}: {}", failure.stage, failure.message),
            },
            PhaseOutcome::ValidationFailed(results) => {
                format!("preflight checks failed:\n{}", results.failure_summary())
            }
            PhaseOutcome::MissingWorkloads(missing) => format!(
                "planned workloads no longer exist: {}",
                missing.join(", ")
            ),
        }
    }
}

impl std::fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Handle on a running phase
pub struct PhaseExecution<S> {
    /// Best-effort progress; events are dropped when this is not drained
    pub events: mpsc::Receiver<ProgressEvent>,
    /// Current phase state; never misses the latest transition
    pub states: watch::Receiver<S>,
    pub handle: JoinHandle<PhaseOutcome>,
    dropped: DroppedEvents,
}

impl<S> PhaseExecution<S> {
    /// Wait for the phase to finish
    pub async fn outcome(self) -> Result<PhaseOutcome> {
        Ok(self.handle.await?)
    }

    /// Progress events dropped so far because the queue was full
    pub fn dropped_events(&self) -> u64 {
        self.dropped.get()
    }
}

/// Entry point for planning and running maintenance phases
#[derive(Clone)]
pub struct Orchestrator {
    client: Arc<dyn ClusterClient>,
    config: Arc<MaintenanceConfig>,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn ClusterClient>, config: MaintenanceConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Discover and order the node's pinned workloads, detect conflicts and
    /// warm up preflight, all concurrently
    #[instrument(skip(self))]
    pub async fn prepare_down(&self, node: &str) -> Result<DownReview> {
        let client = self.client.as_ref();
        let validator = PreflightValidator::new(client, &self.config);

        let (plan, conflicts, validation) = tokio::join!(
            build_down_plan(client, &self.config, node),
            check_other_nodes_in_maintenance(client, &self.config, node),
            validator.validate_down(node),
        );

        let review = DownReview {
            plan: Arc::new(plan?),
            validation,
            conflicts,
        };
        info!(
            "Prepared down plan for {}: {} workload(s), state {}",
            node,
            review.plan.workloads().len(),
            review.state().label()
        );
        Ok(review)
    }

    /// Discover the node's scaled-down workloads and their restore targets
    #[instrument(skip(self))]
    pub async fn prepare_up(&self, node: &str) -> Result<UpReview> {
        let client = self.client.as_ref();
        let validator = PreflightValidator::new(client, &self.config);

        let plan_and_conflicts = async {
            let conflicts = check_other_nodes_in_maintenance(client, &self.config, node).await;
            let plan = build_up_plan(client, &self.config, node, &conflicts).await;
            (plan, conflicts)
        };
        let ((plan, conflicts), validation) =
            tokio::join!(plan_and_conflicts, validator.validate_up(node));

        let review = UpReview {
            plan: Arc::new(plan?),
            validation,
            conflicts,
        };
        info!(
            "Prepared up plan for {}: {} workload(s)",
            node,
            review.plan.targets().len()
        );
        Ok(review)
    }

    /// Run a confirmed down plan
    #[instrument(skip_all, fields(node = %confirmed.plan().node()))]
    pub fn execute_down(
        &self,
        confirmed: &ConfirmedDown,
        cancel: CancellationToken,
    ) -> PhaseExecution<DownPhase> {
        self.spawn_down(confirmed.clone(), cancel, DownPhase::Confirm)
    }

    /// Run the same confirmed down plan again from preflight
    #[instrument(skip_all, fields(node = %confirmed.plan().node()))]
    pub fn retry_down(
        &self,
        confirmed: &ConfirmedDown,
        previous: &PhaseOutcome,
        cancel: CancellationToken,
    ) -> PhaseExecution<DownPhase> {
        self.spawn_down(confirmed.clone(), cancel, halted_state(previous))
    }

    /// Run a confirmed up plan
    #[instrument(skip_all, fields(node = %confirmed.plan().node()))]
    pub fn execute_up(
        &self,
        confirmed: &ConfirmedUp,
        cancel: CancellationToken,
    ) -> PhaseExecution<UpPhase> {
        self.spawn_up(confirmed.clone(), cancel, UpPhase::Confirm)
    }

    /// Run the same confirmed up plan again from preflight, e.g. after
    /// acknowledging missing workloads
    #[instrument(skip_all, fields(node = %confirmed.plan().node()))]
    pub fn retry_up(
        &self,
        confirmed: &ConfirmedUp,
        previous: &PhaseOutcome,
        cancel: CancellationToken,
    ) -> PhaseExecution<UpPhase> {
        self.spawn_up(confirmed.clone(), cancel, halted_state(previous))
    }

    fn spawn_down(
        &self,
        confirmed: ConfirmedDown,
        cancel: CancellationToken,
        from: DownPhase,
    ) -> PhaseExecution<DownPhase> {
        let span = info_span!("down_phase", node = %confirmed.plan().node());
        self.spawn(from, cancel, span, move |run| async move {
            let result = run_down(&run, &confirmed).await;
            (run, result)
        })
    }

    fn spawn_up(
        &self,
        confirmed: ConfirmedUp,
        cancel: CancellationToken,
        from: UpPhase,
    ) -> PhaseExecution<UpPhase> {
        let span = info_span!("up_phase", node = %confirmed.plan().node());
        self.spawn(from, cancel, span, move |run| async move {
            let result = run_up(&run, &confirmed).await;
            (run, result)
        })
    }

    fn spawn<S, F, Fut>(
        &self,
        from: S,
        cancel: CancellationToken,
        span: tracing::Span,
        steps: F,
    ) -> PhaseExecution<S>
    where
        S: PhaseState,
        F: FnOnce(PhaseRun<S>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = (PhaseRun<S>, std::result::Result<CompletionSummary, Halt>)>
            + Send
            + 'static,
    {
        let (progress, events) = ProgressSink::channel(self.config.progress_buffer);
        let (state_tx, states) = watch::channel(from);
        let dropped = progress.dropped_counter();

        let run = PhaseRun {
            client: self.client.clone(),
            config: self.config.clone(),
            tracker: std::sync::Mutex::new(PhaseTracker::new(from)),
            state_tx,
            progress,
            cancel,
            started: Instant::now(),
        };

        let handle = tokio::spawn(
            async move {
                let (run, result) = steps(run).await;
                run.finish(result)
            }
            .instrument(span),
        );

        PhaseExecution {
            events,
            states,
            handle,
            dropped,
        }
    }
}

/// State a retry resumes from, given how the previous run ended
fn halted_state<S: PhaseState>(previous: &PhaseOutcome) -> S {
    match previous {
        PhaseOutcome::Cancelled { .. } => S::CANCELLED,
        _ => S::ERROR,
    }
}

/// Why a run stopped before completing
#[derive(Debug)]
enum Halt {
    Cancelled,
    Failed {
        workload: Option<String>,
        message: String,
    },
    Validation(ValidationResults),
    Missing(Vec<String>),
}

impl Halt {
    fn failed(workload: Option<String>, error: Error) -> Self {
        Halt::Failed {
            workload,
            message: error.to_string(),
        }
    }
}

impl From<Error> for Halt {
    fn from(error: Error) -> Self {
        Halt::failed(None, error)
    }
}

type StepResult<T = ()> = std::result::Result<T, Halt>;

/// State shared by the steps of one phase run
struct PhaseRun<S: PhaseState> {
    client: Arc<dyn ClusterClient>,
    config: Arc<MaintenanceConfig>,
    tracker: std::sync::Mutex<PhaseTracker<S>>,
    state_tx: watch::Sender<S>,
    progress: ProgressSink,
    cancel: CancellationToken,
    started: Instant,
}

impl<S: PhaseState> PhaseRun<S> {
    fn current(&self) -> S {
        match self.tracker.lock() {
            Ok(tracker) => tracker.current(),
            Err(poisoned) => poisoned.into_inner().current(),
        }
    }

    /// Move to `next`, publish it and announce it on the progress queue
    fn enter(&self, next: S) -> Result<()> {
        {
            let mut tracker = match self.tracker.lock() {
                Ok(tracker) => tracker,
                Err(poisoned) => poisoned.into_inner(),
            };
            tracker.transition(next)?;
        }
        self.state_tx.send_replace(next);
        debug!("Entered {}", next.label());

        let status = if next == S::COMPLETE {
            StepStatus::Success
        } else if next == S::ERROR {
            StepStatus::Error
        } else if next == S::CANCELLED {
            StepStatus::Warning
        } else {
            StepStatus::Running
        };
        self.emit(ProgressEvent::new(next.label(), status, next.description()));
        Ok(())
    }

    fn emit(&self, event: ProgressEvent) {
        self.progress.emit(event);
    }

    fn step(&self, status: StepStatus, description: impl Into<String>) -> ProgressEvent {
        ProgressEvent::new(self.current().label(), status, description)
    }

    /// Stop before issuing a mutation once cancellation was requested
    fn ensure_not_cancelled(&self) -> StepResult {
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        Ok(())
    }

    /// Run a read-only future, abandoning it if cancellation is requested
    async fn read<T>(&self, fut: impl std::future::Future<Output = T>) -> StepResult<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            value = fut => Ok(value),
        }
    }

    fn finish(self, result: StepResult<CompletionSummary>) -> PhaseOutcome {
        let stage = self.current().label();
        let (next, outcome) = match result {
            Ok(summary) => (S::COMPLETE, PhaseOutcome::Completed(summary)),
            Err(Halt::Cancelled) => (S::CANCELLED, PhaseOutcome::Cancelled { stage }),
            Err(Halt::Failed { workload, message }) => (
                S::ERROR,
                PhaseOutcome::Failed(ExecutionFailure {
                    stage,
                    workload,
                    message,
                }),
            ),
            Err(Halt::Validation(results)) => (S::ERROR, PhaseOutcome::ValidationFailed(results)),
            Err(Halt::Missing(missing)) => (S::ERROR, PhaseOutcome::MissingWorkloads(missing)),
        };

        if let Err(e) = self.enter(next) {
            error!("Could not record final state {}: {}", next.label(), e);
        }
        match &outcome {
            PhaseOutcome::Completed(_) => info!("Phase {}", outcome),
            _ => warn!("Phase {}", outcome),
        }
        if self.progress.dropped() > 0 {
            debug!("{} progress event(s) were dropped", self.progress.dropped());
        }
        outcome
    }
}

async fn run_down(run: &PhaseRun<DownPhase>, confirmed: &ConfirmedDown) -> StepResult<CompletionSummary> {
    let plan = confirmed.plan();
    let node = plan.node();
    let client = run.client.as_ref();
    let config = run.config.as_ref();

    run.enter(DownPhase::PreFlight)?;
    let validator = PreflightValidator::new(client, config);
    let validation = run.read(validator.validate_down(node)).await?;
    if !validation.all_passed() {
        return Err(Halt::Validation(validation));
    }
    run.emit(run.step(StepStatus::Success, "all preflight checks passed"));

    run.enter(DownPhase::Cordoning)?;
    run.ensure_not_cancelled()?;
    client.set_node_unschedulable(node, true).await?;
    run.emit(run.step(StepStatus::Success, format!("node {node} cordoned")));

    run.enter(DownPhase::SettingSafetyFlag)?;
    run.ensure_not_cancelled()?;
    client.set_safety_flag(plan.safety_flag(), true).await?;
    run.emit(run.step(StepStatus::Success, format!("{} flag set", plan.safety_flag())));

    run.enter(DownPhase::ScalingOperator)?;
    match plan.operator() {
        None => run.emit(run.step(StepStatus::Skipped, "operator deployment not found")),
        Some(operator) if operator.replicas == 0 => run.emit(
            run.step(StepStatus::Skipped, "operator already scaled to zero")
                .for_workload(operator.id()),
        ),
        Some(operator) => {
            run.ensure_not_cancelled()?;
            client
                .scale_deployment(
                    &operator.namespace,
                    &operator.name,
                    0,
                    ReplicaAnnotation::Record(operator.replicas),
                )
                .await
                .map_err(|e| Halt::failed(Some(operator.id()), e))?;
            run.emit(
                run.step(StepStatus::Success, "operator scaled to zero")
                    .for_workload(operator.id()),
            );
        }
    }

    run.enter(DownPhase::DiscoveringWorkloads)?;
    run.emit(run.step(
        StepStatus::Success,
        format!("{} workload(s) in the confirmed plan", plan.workloads().len()),
    ));
    let current = run
        .read(list_pinned(client, &config.namespace, node, &config.workload_prefixes))
        .await?;
    match current {
        Ok(current) => {
            let planned: BTreeSet<String> = plan.workloads().iter().map(|w| w.id()).collect();
            for new in current
                .iter()
                .filter(|w| !w.category.is_management() && !planned.contains(&w.id()))
            {
                warn!("{} appeared after the plan was confirmed", new.id());
                run.emit(
                    run.step(
                        StepStatus::Warning,
                        "appeared after the plan was confirmed; not acted on",
                    )
                    .for_workload(new.id()),
                );
            }
        }
        Err(e) => {
            warn!("Drift check failed: {}", e);
            run.emit(run.step(StepStatus::Warning, format!("drift check failed: {e}")));
        }
    }

    run.enter(DownPhase::ScalingWorkloads)?;
    let mut scaled = 0;
    for workload in plan.workloads() {
        run.ensure_not_cancelled()?;
        let id = workload.id();
        run.emit(run.step(StepStatus::Running, "scaling to zero").for_workload(&id));

        let annotation = if workload.replicas > 0 {
            ReplicaAnnotation::Record(workload.replicas)
        } else {
            ReplicaAnnotation::Keep
        };
        if let Err(e) = client
            .scale_deployment(&workload.namespace, &workload.name, 0, annotation)
            .await
        {
            run.emit(run.step(StepStatus::Error, e.to_string()).for_workload(&id));
            return Err(Halt::failed(Some(id), e));
        }
        run.emit(run.step(StepStatus::Success, "scaled to zero").for_workload(&id));
        scaled += 1;
    }

    Ok(CompletionSummary {
        workloads_scaled: scaled,
        elapsed: run.started.elapsed(),
        skipped: Vec::new(),
    })
}

async fn run_up(run: &PhaseRun<UpPhase>, confirmed: &ConfirmedUp) -> StepResult<CompletionSummary> {
    let plan = confirmed.plan();
    let node = plan.node();
    let client = run.client.as_ref();
    let config = run.config.as_ref();

    run.enter(UpPhase::PreFlight)?;
    let validator = PreflightValidator::new(client, config);
    let validation = run.read(validator.validate_up(node)).await?;
    if !validation.all_passed() {
        return Err(Halt::Validation(validation));
    }

    let lookups = plan
        .targets()
        .iter()
        .filter(|t| !confirmed.is_skipped(&t.workload))
        .map(|t| async move {
            let found = client
                .get_deployment(&t.workload.namespace, &t.workload.name)
                .await;
            (t.workload.id(), found)
        });
    let mut missing = Vec::new();
    for (id, found) in run.read(join_all(lookups)).await? {
        match found {
            Ok(Some(_)) => {}
            Ok(None) => missing.push(id),
            Err(e) => return Err(Halt::failed(Some(id), e)),
        }
    }
    if !missing.is_empty() {
        return Err(Halt::Missing(missing));
    }
    run.emit(run.step(StepStatus::Success, "all preflight checks passed"));

    run.enter(UpPhase::Uncordoning)?;
    run.ensure_not_cancelled()?;
    client.set_node_unschedulable(node, false).await?;
    run.emit(run.step(StepStatus::Success, format!("node {node} uncordoned")));

    run.enter(UpPhase::RestoringWorkloads)?;
    let mut restored = 0;
    let mut skipped = Vec::new();
    for target in plan.targets() {
        let id = target.workload.id();
        if confirmed.is_skipped(&target.workload) {
            run.emit(
                run.step(StepStatus::Skipped, "acknowledged as missing")
                    .for_workload(&id),
            );
            skipped.push(id);
            continue;
        }

        run.ensure_not_cancelled()?;
        run.emit(
            run.step(
                StepStatus::Running,
                format!("restoring to {} replica(s)", target.replicas),
            )
            .for_workload(&id),
        );
        if let Err(e) = client
            .scale_deployment(
                &target.workload.namespace,
                &target.workload.name,
                target.replicas,
                ReplicaAnnotation::Clear,
            )
            .await
        {
            run.emit(run.step(StepStatus::Error, e.to_string()).for_workload(&id));
            return Err(Halt::failed(Some(id), e));
        }
        run.emit(
            run.step(
                StepStatus::Success,
                format!("restored to {} replica(s)", target.replicas),
            )
            .for_workload(&id),
        );
        restored += 1;
    }

    run.enter(UpPhase::ScalingOperator)?;
    match plan.operator() {
        None => run.emit(run.step(StepStatus::Skipped, "operator deployment not found")),
        Some(operator) => {
            run.ensure_not_cancelled()?;
            client
                .scale_deployment(
                    &operator.namespace,
                    &operator.name,
                    operator.restore_replicas,
                    ReplicaAnnotation::Clear,
                )
                .await
                .map_err(|e| Halt::failed(Some(operator.id()), e))?;
            run.emit(
                run.step(
                    StepStatus::Success,
                    format!("operator restored to {} replica(s)", operator.restore_replicas),
                )
                .for_workload(operator.id()),
            );
        }
    }

    run.enter(UpPhase::UnsettingSafetyFlag)?;
    if plan.leave_safety_flag() {
        run.emit(run.step(
            StepStatus::Skipped,
            format!(
                "{} flag left set, other nodes are still in maintenance",
                plan.safety_flag()
            ),
        ));
    } else {
        run.ensure_not_cancelled()?;
        client.set_safety_flag(plan.safety_flag(), false).await?;
        run.emit(run.step(StepStatus::Success, format!("{} flag unset", plan.safety_flag())));
    }

    Ok(CompletionSummary {
        workloads_scaled: restored,
        elapsed: run.started.elapsed(),
        skipped,
    })
}
