//! Tests for planning, confirmation and phase execution

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::PodSpec;
    use tokio_test::assert_ok;
    use tokio_util::sync::CancellationToken;

    use crate::client::fake::{deployment, pinned, with_original, FakeCluster};
    use crate::config::MaintenanceConfig;
    use crate::controller::maintenance::orchestrator::{Orchestrator, PhaseExecution, PhaseOutcome};
    use crate::controller::maintenance::phase::{DownPhase, PhaseState, UpPhase};
    use crate::controller::maintenance::plan::{
        Confirmation, ConfirmedDown, ConfirmedUp, Decision, DownReview, UpReview,
    };
    use crate::controller::maintenance::progress::{ProgressEvent, StepStatus};
    use crate::error::{Error, NextAction};

    const NS: &str = "rook-ceph";
    const NODE: &str = "worker-01";

    fn base_cluster() -> FakeCluster {
        let fake = FakeCluster::new();
        fake.add_node(NODE, true, false);
        fake.add_node("worker-02", true, false);
        fake.add_deployment(deployment(NS, "rook-ceph-tools", Some(1), PodSpec::default()));
        fake.add_deployment(deployment(NS, "rook-ceph-operator", Some(1), PodSpec::default()));
        fake
    }

    /// worker-01 running osd-0, mon-a, exporter and crashcollector
    fn down_cluster() -> Arc<FakeCluster> {
        let fake = base_cluster();
        fake.add_deployment(pinned(NS, "rook-ceph-exporter-worker-01", NODE, Some(1)));
        fake.add_deployment(pinned(NS, "rook-ceph-crashcollector-worker-01", NODE, Some(1)));
        fake.add_deployment(pinned(NS, "rook-ceph-mon-a", NODE, Some(1)));
        fake.add_deployment(pinned(NS, "rook-ceph-osd-0", NODE, Some(2)));
        fake.add_deployment(pinned(NS, "rook-ceph-osd-1", "worker-02", Some(1)));
        Arc::new(fake)
    }

    /// worker-01 after a completed down phase
    fn up_cluster() -> Arc<FakeCluster> {
        let fake = FakeCluster::new();
        fake.add_node(NODE, true, true);
        fake.add_node("worker-02", true, false);
        fake.set_flag("noout");
        fake.add_deployment(with_original(
            deployment(NS, "rook-ceph-operator", Some(0), PodSpec::default()),
            1,
        ));
        fake.add_deployment(with_original(pinned(NS, "rook-ceph-osd-0", NODE, Some(0)), 2));
        fake.add_deployment(with_original(pinned(NS, "rook-ceph-mon-a", NODE, Some(0)), 1));
        fake.add_deployment(pinned(NS, "rook-ceph-exporter-worker-01", NODE, Some(0)));
        Arc::new(fake)
    }

    fn orchestrator(fake: &Arc<FakeCluster>) -> Orchestrator {
        Orchestrator::new(fake.clone(), MaintenanceConfig::default())
    }

    fn accept_down(review: DownReview) -> ConfirmedDown {
        match assert_ok!(review.confirm(Decision::Accept {
            acknowledge_conflicts: true,
        })) {
            Confirmation::Confirmed(confirmed) => confirmed,
            other => panic!("expected a confirmed plan, got {other:?}"),
        }
    }

    fn accept_up(review: UpReview) -> ConfirmedUp {
        match assert_ok!(review.confirm(Decision::Accept {
            acknowledge_conflicts: true,
        })) {
            Confirmation::Confirmed(confirmed) => confirmed,
            other => panic!("expected a confirmed plan, got {other:?}"),
        }
    }

    async fn run_to_end<S: PhaseState>(
        mut exec: PhaseExecution<S>,
    ) -> (PhaseOutcome, Vec<ProgressEvent>, S) {
        let outcome = assert_ok!((&mut exec.handle).await);
        let mut events = Vec::new();
        while let Some(event) = exec.events.recv().await {
            events.push(event);
        }
        let state = *exec.states.borrow();
        (outcome, events, state)
    }

    fn workload_scales(mutations: &[String]) -> Vec<&str> {
        mutations
            .iter()
            .map(String::as_str)
            .filter(|m| m.starts_with("scale ") && !m.contains("operator"))
            .collect()
    }

    #[tokio::test]
    async fn test_prepare_down_orders_plan_and_excludes_management() {
        let fake = down_cluster();
        fake.add_deployment(pinned(NS, "rook-ceph-tools-pinned", NODE, Some(1)));

        let review = orchestrator(&fake).prepare_down(NODE).await.unwrap();
        let names: Vec<&str> = review.plan.workloads().iter().map(|w| w.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "rook-ceph-osd-0",
                "rook-ceph-mon-a",
                "rook-ceph-exporter-worker-01",
                "rook-ceph-crashcollector-worker-01"
            ]
        );
        assert_eq!(review.state(), DownPhase::Confirm);
        assert!(review.validation.all_passed());
        assert!(!review.conflicts.has_conflicts());
        assert_eq!(review.plan.operator().map(|o| o.replicas), Some(1));
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_down_discovery_error() {
        let fake = down_cluster();
        fake.fail("list_deployments");

        let err = orchestrator(&fake).prepare_down(NODE).await.unwrap_err();
        assert!(matches!(err, Error::DiscoveryError(_)));
        assert_eq!(err.next_action(), NextAction::Retry);
    }

    #[tokio::test]
    async fn test_nothing_to_do() {
        let fake = base_cluster();
        fake.with(|s| s.nodes[0].cordoned = true);
        fake.set_flag("noout");
        fake.remove_deployment("rook-ceph-operator");
        fake.add_deployment(pinned(NS, "rook-ceph-osd-0", NODE, Some(0)));
        fake.add_deployment(pinned(NS, "rook-ceph-mon-a", NODE, Some(0)));
        let fake = Arc::new(fake);

        let review = orchestrator(&fake).prepare_down(NODE).await.unwrap();
        assert_eq!(review.state(), DownPhase::NothingToDo);
        assert!(matches!(
            review
                .confirm(Decision::Accept {
                    acknowledge_conflicts: false
                })
                .unwrap(),
            Confirmation::NothingToDo
        ));
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_decline_changes_nothing() {
        let fake = down_cluster();
        let review = orchestrator(&fake).prepare_down(NODE).await.unwrap();

        assert!(matches!(
            review.confirm(Decision::Decline).unwrap(),
            Confirmation::Declined
        ));
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_conflicts_require_acknowledgement() {
        let fake = down_cluster();
        fake.add_deployment(pinned(NS, "rook-ceph-osd-7", "worker-02", Some(0)));
        let orch = orchestrator(&fake);

        let review = orch.prepare_down(NODE).await.unwrap();
        assert!(review.conflicts.has_conflicts());
        let err = review
            .confirm(Decision::Accept {
                acknowledge_conflicts: false,
            })
            .unwrap_err();
        assert!(matches!(err, Error::ConflictNotAcknowledged(ref s) if s.contains("worker-02")));
        assert_eq!(err.next_action(), NextAction::AcknowledgeAndContinue);

        let review = orch.prepare_down(NODE).await.unwrap();
        accept_down(review);
    }

    #[tokio::test]
    async fn test_down_phase_runs_in_order() {
        let fake = down_cluster();
        let orch = orchestrator(&fake);
        let confirmed = accept_down(orch.prepare_down(NODE).await.unwrap());

        let exec = orch.execute_down(&confirmed, CancellationToken::new());
        let (outcome, events, state) = run_to_end(exec).await;

        match &outcome {
            PhaseOutcome::Completed(summary) => assert_eq!(summary.workloads_scaled, 4),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(outcome.next_action(), NextAction::None);
        assert_eq!(state, DownPhase::Complete);
        assert_eq!(
            fake.mutations(),
            vec![
                "cordon worker-01",
                "set noout",
                "scale rook-ceph-operator 0",
                "scale rook-ceph-osd-0 0",
                "scale rook-ceph-mon-a 0",
                "scale rook-ceph-exporter-worker-01 0",
                "scale rook-ceph-crashcollector-worker-01 0",
            ]
        );
        assert_eq!(fake.replicas("rook-ceph-osd-1"), Some(1));
        assert_eq!(fake.annotation("rook-ceph-osd-0").as_deref(), Some("2"));
        assert_eq!(fake.annotation("rook-ceph-operator").as_deref(), Some("1"));

        // Running precedes Success for each workload
        let osd: Vec<StepStatus> = events
            .iter()
            .filter(|e| e.workload.as_deref() == Some("rook-ceph/rook-ceph-osd-0"))
            .map(|e| e.status)
            .collect();
        assert_eq!(osd, vec![StepStatus::Running, StepStatus::Success]);

        let stages: Vec<&str> = events
            .iter()
            .filter(|e| e.workload.is_none() && e.status == StepStatus::Running)
            .map(|e| e.stage)
            .collect();
        assert_eq!(events.last().map(|e| e.stage), Some("Complete"));
        assert_eq!(
            stages,
            vec![
                "PreFlight",
                "Cordoning",
                "SettingSafetyFlag",
                "ScalingOperator",
                "DiscoveringWorkloads",
                "ScalingWorkloads"
            ]
        );
    }

    #[tokio::test]
    async fn test_down_failure_then_retry_reissues_whole_plan() {
        let fake = base_cluster();
        for name in [
            "rook-ceph-osd-0",
            "rook-ceph-osd-1",
            "rook-ceph-mon-a",
            "rook-ceph-mgr-a",
            "rook-ceph-exporter-worker-01",
        ] {
            fake.add_deployment(pinned(NS, name, NODE, Some(1)));
        }
        let fake = Arc::new(fake);
        fake.fail("scale:rook-ceph-mon-a");
        let orch = orchestrator(&fake);
        let confirmed = accept_down(orch.prepare_down(NODE).await.unwrap());

        let (outcome, events, state) =
            run_to_end(orch.execute_down(&confirmed, CancellationToken::new())).await;
        match &outcome {
            PhaseOutcome::Failed(failure) => {
                assert_eq!(failure.stage, "ScalingWorkloads");
                assert_eq!(failure.workload.as_deref(), Some("rook-ceph/rook-ceph-mon-a"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(outcome.next_action(), NextAction::Retry);
        assert_eq!(state, DownPhase::Error);
        assert!(events
            .iter()
            .any(|e| e.status == StepStatus::Error
                && e.workload.as_deref() == Some("rook-ceph/rook-ceph-mon-a")));

        // No rollback, and nothing after the failing workload was touched
        assert_eq!(fake.replicas("rook-ceph-osd-0"), Some(0));
        assert_eq!(fake.replicas("rook-ceph-osd-1"), Some(0));
        assert_eq!(fake.replicas("rook-ceph-mgr-a"), Some(1));
        assert_eq!(fake.replicas("rook-ceph-exporter-worker-01"), Some(1));
        let first_run = fake.mutations().len();

        fake.heal("scale:rook-ceph-mon-a");
        let (outcome, _, state) =
            run_to_end(orch.retry_down(&confirmed, &outcome, CancellationToken::new())).await;
        assert!(outcome.is_completed());
        assert_eq!(state, DownPhase::Complete);

        let mutations = fake.mutations();
        assert_eq!(
            workload_scales(&mutations[first_run..]),
            vec![
                "scale rook-ceph-osd-0 0",
                "scale rook-ceph-osd-1 0",
                "scale rook-ceph-mon-a 0",
                "scale rook-ceph-mgr-a 0",
                "scale rook-ceph-exporter-worker-01 0",
            ]
        );
        // The recorded count survives being scaled to zero twice
        assert_eq!(fake.annotation("rook-ceph-osd-0").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_confirmed_plan_ignores_later_cluster_changes() {
        let fake = down_cluster();
        let orch = orchestrator(&fake);
        let confirmed = accept_down(orch.prepare_down(NODE).await.unwrap());
        let planned = confirmed.plan().clone();

        fake.add_deployment(pinned(NS, "rook-ceph-mgr-b", NODE, Some(1)));

        let (outcome, events, _) =
            run_to_end(orch.execute_down(&confirmed, CancellationToken::new())).await;
        assert!(outcome.is_completed());
        assert_eq!(fake.replicas("rook-ceph-mgr-b"), Some(1));
        assert!(events.iter().any(|e| e.status == StepStatus::Warning
            && e.stage == "DiscoveringWorkloads"
            && e.workload.as_deref() == Some("rook-ceph/rook-ceph-mgr-b")));
        assert!(Arc::ptr_eq(&planned, confirmed.plan()));
        assert_eq!(planned.workloads().len(), 4);
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_mutation() {
        let fake = down_cluster();
        let orch = orchestrator(&fake);
        let confirmed = accept_down(orch.prepare_down(NODE).await.unwrap());

        let token = CancellationToken::new();
        fake.cancel_after(2, token.clone());
        let (outcome, _, state) = run_to_end(orch.execute_down(&confirmed, token)).await;

        assert_eq!(
            outcome,
            PhaseOutcome::Cancelled {
                stage: "ScalingOperator"
            }
        );
        assert_eq!(state, DownPhase::Cancelled);
        assert_eq!(fake.mutations(), vec!["cordon worker-01", "set noout"]);

        let (outcome, _, state) =
            run_to_end(orch.retry_down(&confirmed, &outcome, CancellationToken::new())).await;
        assert!(outcome.is_completed());
        assert_eq!(state, DownPhase::Complete);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_issues_nothing() {
        let fake = down_cluster();
        let orch = orchestrator(&fake);
        let confirmed = accept_down(orch.prepare_down(NODE).await.unwrap());

        let token = CancellationToken::new();
        token.cancel();
        let (outcome, _, _) = run_to_end(orch.execute_down(&confirmed, token)).await;
        assert_eq!(outcome, PhaseOutcome::Cancelled { stage: "PreFlight" });
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_preflight_failure_halts_before_mutation() {
        let fake = down_cluster();
        let orch = orchestrator(&fake);
        let confirmed = accept_down(orch.prepare_down(NODE).await.unwrap());

        fake.remove_deployment("rook-ceph-tools");
        let (outcome, _, state) =
            run_to_end(orch.execute_down(&confirmed, CancellationToken::new())).await;
        match &outcome {
            PhaseOutcome::ValidationFailed(results) => assert!(!results.all_passed()),
            other => panic!("expected validation failure, got {other:?}"),
        }
        assert_eq!(state, DownPhase::Error);
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_absent_operator_is_skipped() {
        let fake = down_cluster();
        fake.remove_deployment("rook-ceph-operator");
        let orch = orchestrator(&fake);
        let review = orch.prepare_down(NODE).await.unwrap();
        assert!(review.plan.operator().is_none());
        let confirmed = accept_down(review);

        let (outcome, events, _) =
            run_to_end(orch.execute_down(&confirmed, CancellationToken::new())).await;
        assert!(outcome.is_completed());
        assert!(events
            .iter()
            .any(|e| e.stage == "ScalingOperator" && e.status == StepStatus::Skipped));
    }

    #[tokio::test]
    async fn test_full_progress_queue_never_blocks() {
        let fake = down_cluster();
        let config = MaintenanceConfig {
            progress_buffer: 1,
            ..Default::default()
        };
        let orch = Orchestrator::new(fake.clone(), config);
        let confirmed = accept_down(orch.prepare_down(NODE).await.unwrap());

        let mut exec = orch.execute_down(&confirmed, CancellationToken::new());
        let outcome = (&mut exec.handle).await.unwrap();
        assert!(outcome.is_completed());
        assert!(exec.dropped_events() > 0);
        assert_eq!(*exec.states.borrow(), DownPhase::Complete);
    }

    #[tokio::test]
    async fn test_prepare_up_restore_targets() {
        let fake = up_cluster();
        let review = orchestrator(&fake).prepare_up(NODE).await.unwrap();

        let targets: Vec<(&str, i32)> = review
            .plan
            .targets()
            .iter()
            .map(|t| (t.workload.name.as_str(), t.replicas))
            .collect();
        assert_eq!(
            targets,
            vec![
                ("rook-ceph-mon-a", 1),
                ("rook-ceph-osd-0", 2),
                ("rook-ceph-exporter-worker-01", 1)
            ]
        );
        assert_eq!(review.plan.operator().map(|o| o.restore_replicas), Some(1));
        assert!(!review.plan.leave_safety_flag());
        assert_eq!(review.state(), UpPhase::Confirm);
    }

    #[tokio::test]
    async fn test_up_phase_restores_in_order() {
        let fake = up_cluster();
        let orch = orchestrator(&fake);
        let confirmed = accept_up(orch.prepare_up(NODE).await.unwrap());

        let (outcome, _, state) =
            run_to_end(orch.execute_up(&confirmed, CancellationToken::new())).await;
        assert!(outcome.is_completed(), "{outcome}");
        assert_eq!(state, UpPhase::Complete);
        assert_eq!(
            fake.mutations(),
            vec![
                "uncordon worker-01",
                "scale rook-ceph-mon-a 1",
                "scale rook-ceph-osd-0 2",
                "scale rook-ceph-exporter-worker-01 1",
                "scale rook-ceph-operator 1",
                "unset noout",
            ]
        );
        assert_eq!(fake.annotation("rook-ceph-osd-0"), None);
        assert_eq!(fake.annotation("rook-ceph-operator"), None);
    }

    #[tokio::test]
    async fn test_up_leaves_flag_when_other_nodes_in_maintenance() {
        let fake = up_cluster();
        fake.add_deployment(pinned(NS, "rook-ceph-osd-4", "worker-02", Some(0)));
        let orch = orchestrator(&fake);

        let review = orch.prepare_up(NODE).await.unwrap();
        assert!(review.plan.leave_safety_flag());
        let err = review
            .clone()
            .confirm(Decision::Accept {
                acknowledge_conflicts: false,
            })
            .unwrap_err();
        assert!(matches!(err, Error::ConflictNotAcknowledged(_)));

        let confirmed = accept_up(review);
        let (outcome, events, _) =
            run_to_end(orch.execute_up(&confirmed, CancellationToken::new())).await;
        assert!(outcome.is_completed());
        assert!(!fake.mutations().iter().any(|m| m == "unset noout"));
        assert!(events
            .iter()
            .any(|e| e.stage == "UnsettingSafetyFlag" && e.status == StepStatus::Skipped));
    }

    #[tokio::test]
    async fn test_missing_workload_needs_acknowledgement() {
        let fake = up_cluster();
        let orch = orchestrator(&fake);
        let confirmed = accept_up(orch.prepare_up(NODE).await.unwrap());

        fake.remove_deployment("rook-ceph-mon-a");
        let (outcome, _, state) =
            run_to_end(orch.execute_up(&confirmed, CancellationToken::new())).await;
        let missing = match &outcome {
            PhaseOutcome::MissingWorkloads(missing) => missing.clone(),
            other => panic!("expected missing workloads, got {other:?}"),
        };
        assert_eq!(missing, vec!["rook-ceph/rook-ceph-mon-a"]);
        assert_eq!(outcome.next_action(), NextAction::AcknowledgeAndContinue);
        assert_eq!(state, UpPhase::Error);
        assert!(fake.mutations().is_empty());

        let acknowledged = confirmed.acknowledge_missing(missing);
        let (outcome, events, _) =
            run_to_end(orch.retry_up(&acknowledged, &outcome, CancellationToken::new())).await;
        match &outcome {
            PhaseOutcome::Completed(summary) => {
                assert_eq!(summary.workloads_scaled, 2);
                assert_eq!(summary.skipped, vec!["rook-ceph/rook-ceph-mon-a"]);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(events.iter().any(|e| e.status == StepStatus::Skipped
            && e.workload.as_deref() == Some("rook-ceph/rook-ceph-mon-a")));
        assert!(!fake.mutations().iter().any(|m| m.contains("rook-ceph-mon-a")));
    }

    #[tokio::test]
    async fn test_up_failure_reports_workload() {
        let fake = up_cluster();
        fake.fail("scale:rook-ceph-osd-0");
        let orch = orchestrator(&fake);
        let confirmed = accept_up(orch.prepare_up(NODE).await.unwrap());

        let (outcome, _, state) =
            run_to_end(orch.execute_up(&confirmed, CancellationToken::new())).await;
        match &outcome {
            PhaseOutcome::Failed(failure) => {
                assert_eq!(failure.stage, "RestoringWorkloads");
                assert_eq!(failure.workload.as_deref(), Some("rook-ceph/rook-ceph-osd-0"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(state, UpPhase::Error);
        assert_eq!(fake.replicas("rook-ceph-mon-a"), Some(1));
        assert_eq!(fake.replicas("rook-ceph-exporter-worker-01"), Some(0));
        assert!(fake.with(|s| s.flags.contains("noout")));
    }
}
