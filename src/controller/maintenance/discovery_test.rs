//! Tests for pinned workload discovery, classification and ordering

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        Affinity, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, PodSpec,
        PreferredSchedulingTerm,
    };

    use crate::client::fake::{affinity_pinned, deployment, pinned, FakeCluster};
    use crate::config::HOSTNAME_LABEL;
    use crate::controller::maintenance::discovery::{
        list_pinned, list_scaled_down, resolve_target_node,
    };
    use crate::controller::maintenance::ordering::{order_for_down, order_for_up};
    use crate::controller::maintenance::types::{ManagedWorkload, WorkloadCategory};

    const NS: &str = "rook-ceph";

    fn names(workloads: &[ManagedWorkload]) -> Vec<&str> {
        workloads.iter().map(|w| w.name.as_str()).collect()
    }

    fn workload(name: &str) -> ManagedWorkload {
        ManagedWorkload::from_deployment(&pinned(NS, name, "worker-01", Some(1)), None)
    }

    fn worker_01_cluster() -> FakeCluster {
        let fake = FakeCluster::new();
        fake.add_deployment(pinned(NS, "rook-ceph-osd-0", "worker-01", Some(1)));
        fake.add_deployment(pinned(NS, "rook-ceph-mon-a", "worker-01", Some(1)));
        fake.add_deployment(pinned(NS, "rook-ceph-osd-1", "worker-02", Some(1)));
        fake.add_deployment(pinned(NS, "rook-ceph-exporter-worker-01", "worker-01", Some(0)));
        fake.add_deployment(deployment(NS, "rook-ceph-mgr-a", Some(1), PodSpec::default()));
        fake
    }

    #[test]
    fn test_classify_categories() {
        assert_eq!(WorkloadCategory::classify("rook-ceph-osd-0"), WorkloadCategory::Osd);
        assert_eq!(WorkloadCategory::classify("rook-ceph-mon-a"), WorkloadCategory::Mon);
        assert_eq!(WorkloadCategory::classify("rook-ceph-mgr-b"), WorkloadCategory::Mgr);
        assert_eq!(
            WorkloadCategory::classify("rook-ceph-mds-myfs-a"),
            WorkloadCategory::Mds
        );
        assert_eq!(
            WorkloadCategory::classify("rook-ceph-rgw-store-a"),
            WorkloadCategory::Rgw
        );
        assert_eq!(
            WorkloadCategory::classify("rook-ceph-crashcollector-worker-01"),
            WorkloadCategory::CrashCollector
        );
        assert_eq!(WorkloadCategory::classify("rook-ceph-tools"), WorkloadCategory::Tools);
        assert_eq!(
            WorkloadCategory::classify("rook-ceph-operator"),
            WorkloadCategory::Operator
        );
        assert_eq!(WorkloadCategory::classify("csi-rbdplugin"), WorkloadCategory::Other);
    }

    #[test]
    fn test_classify_longest_prefix_wins() {
        assert_eq!(
            WorkloadCategory::classify("rook-ceph-osd-prepare-worker-01"),
            WorkloadCategory::OsdPrepare
        );
        // Prefixes only match on a '-' boundary
        assert_eq!(
            WorkloadCategory::classify("rook-ceph-monitoring"),
            WorkloadCategory::Other
        );
    }

    #[test]
    fn test_selector_takes_precedence_over_affinity() {
        let mut d = pinned(NS, "rook-ceph-osd-3", "worker-02", Some(1));
        if let Some(spec) = d.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
            spec.affinity = Some(crate::client::fake::required_affinity(
                HOSTNAME_LABEL,
                "In",
                vec!["worker-03"],
            ));
        }
        assert_eq!(resolve_target_node(&d).as_deref(), Some("worker-02"));
    }

    #[test]
    fn test_affinity_pin_resolution() {
        let d = affinity_pinned(NS, "a", HOSTNAME_LABEL, "In", vec!["worker-03", "worker-04"], Some(1));
        assert_eq!(resolve_target_node(&d).as_deref(), Some("worker-03"));

        let other_key = affinity_pinned(NS, "b", "topology.kubernetes.io/zone", "In", vec!["z1"], Some(1));
        assert_eq!(resolve_target_node(&other_key), None);

        let not_in = affinity_pinned(NS, "c", HOSTNAME_LABEL, "NotIn", vec!["worker-03"], Some(1));
        assert_eq!(resolve_target_node(&not_in), None);

        let empty = affinity_pinned(NS, "d", HOSTNAME_LABEL, "In", vec![], Some(1));
        assert_eq!(resolve_target_node(&empty), None);

        let unpinned = deployment(NS, "e", Some(1), PodSpec::default());
        assert_eq!(resolve_target_node(&unpinned), None);
    }

    /// Deployment that only prefers `node`, without requiring it
    fn preferred_only(name: &str, node: &str) -> k8s_openapi::api::apps::v1::Deployment {
        let preference = NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: HOSTNAME_LABEL.to_string(),
                operator: "In".to_string(),
                values: Some(vec![node.to_string()]),
            }]),
            ..Default::default()
        };
        let spec = PodSpec {
            affinity: Some(Affinity {
                node_affinity: Some(NodeAffinity {
                    preferred_during_scheduling_ignored_during_execution: Some(vec![
                        PreferredSchedulingTerm {
                            weight: 100,
                            preference,
                        },
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        deployment(NS, name, Some(1), spec)
    }

    #[tokio::test]
    async fn test_preferred_only_affinity_is_not_a_pin() {
        let d = preferred_only("rook-ceph-mgr-a", "worker-01");
        assert_eq!(resolve_target_node(&d), None);

        let fake = FakeCluster::new();
        fake.add_deployment(d);
        assert!(list_pinned(&fake, NS, "worker-01", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_pinned_for_node() {
        let fake = worker_01_cluster();

        let pinned = list_pinned(&fake, NS, "worker-01", &[]).await.unwrap();
        assert_eq!(
            names(&pinned),
            vec!["rook-ceph-osd-0", "rook-ceph-mon-a", "rook-ceph-exporter-worker-01"]
        );
        let exporter = &pinned[2];
        assert_eq!(exporter.replicas, 0);
        assert_eq!(exporter.target_node.as_deref(), Some("worker-01"));
        assert_eq!(exporter.category, WorkloadCategory::Exporter);
    }

    #[tokio::test]
    async fn test_list_pinned_prefix_filter() {
        let fake = worker_01_cluster();
        let prefixes = vec!["rook-ceph-mon".to_string()];

        let pinned = list_pinned(&fake, NS, "worker-01", &prefixes).await.unwrap();
        assert_eq!(names(&pinned), vec!["rook-ceph-mon-a"]);
    }

    #[tokio::test]
    async fn test_list_scaled_down_requires_explicit_zero() {
        let fake = worker_01_cluster();
        fake.add_deployment(pinned(NS, "rook-ceph-mgr-b", "worker-01", None));

        let scaled_down = list_scaled_down(&fake, NS, "worker-01", &[]).await.unwrap();
        assert_eq!(names(&scaled_down), vec!["rook-ceph-exporter-worker-01"]);

        // Unset replicas are reported as the API default
        let all = list_pinned(&fake, NS, "worker-01", &[]).await.unwrap();
        let mgr = all.iter().find(|w| w.name == "rook-ceph-mgr-b").unwrap();
        assert_eq!(mgr.replicas, 1);
    }

    #[tokio::test]
    async fn test_list_pinned_propagates_errors() {
        let fake = worker_01_cluster();
        fake.fail("list_deployments");

        assert!(list_pinned(&fake, NS, "worker-01", &[]).await.is_err());
        assert!(list_scaled_down(&fake, NS, "worker-01", &[]).await.is_err());
    }

    #[test]
    fn test_order_for_down_and_up() {
        let discovered = vec![
            workload("rook-ceph-exporter-worker-01"),
            workload("rook-ceph-crashcollector-worker-01"),
            workload("rook-ceph-mon-a"),
            workload("rook-ceph-osd-0"),
        ];

        let down = order_for_down(discovered.clone());
        assert_eq!(
            names(&down),
            vec![
                "rook-ceph-osd-0",
                "rook-ceph-mon-a",
                "rook-ceph-exporter-worker-01",
                "rook-ceph-crashcollector-worker-01"
            ]
        );

        let up = order_for_up(discovered);
        assert_eq!(
            names(&up),
            vec![
                "rook-ceph-mon-a",
                "rook-ceph-osd-0",
                "rook-ceph-exporter-worker-01",
                "rook-ceph-crashcollector-worker-01"
            ]
        );
    }

    #[test]
    fn test_ordering_is_permutation_with_unranked_last() {
        let discovered = vec![
            workload("csi-cephfsplugin"),
            workload("rook-ceph-osd-2"),
            workload("rook-ceph-osd-prepare-worker-01"),
            workload("rook-ceph-osd-1"),
            workload("csi-rbdplugin"),
        ];

        let down = order_for_down(discovered.clone());
        assert_eq!(down.len(), discovered.len());
        assert_eq!(
            names(&down),
            vec![
                "rook-ceph-osd-1",
                "rook-ceph-osd-2",
                "csi-cephfsplugin",
                "rook-ceph-osd-prepare-worker-01",
                "csi-rbdplugin"
            ]
        );
    }

    #[test]
    fn test_restore_replicas_defaults() {
        let mut w = workload("rook-ceph-osd-0");
        w.replicas = 0;
        assert_eq!(w.restore_replicas(), 1);

        w.original_replicas = Some(3);
        assert_eq!(w.restore_replicas(), 3);

        w.original_replicas = Some(0);
        assert_eq!(w.restore_replicas(), 1);
    }
}
