//! Read-only preflight checks
//!
//! Every check runs, concurrently, and reports its own result; a failing
//! check never hides the others. Nothing here mutates the cluster.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, warn};

use super::types::{ValidationResult, ValidationResults};
use crate::client::{ClusterClient, PermissionCheck};
use crate::config::MaintenanceConfig;

/// Check name for node existence
pub const CHECK_NODE_EXISTS: &str = "Node existence";
/// Check name for toolbox readiness
pub const CHECK_TOOLBOX_READY: &str = "Toolbox ready";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Down,
    Up,
}

pub struct PreflightValidator<'a> {
    client: &'a dyn ClusterClient,
    config: &'a MaintenanceConfig,
}

impl<'a> PreflightValidator<'a> {
    pub fn new(client: &'a dyn ClusterClient, config: &'a MaintenanceConfig) -> Self {
        Self { client, config }
    }

    /// Checks required before taking `node` out of service
    pub async fn validate_down(&self, node: &str) -> ValidationResults {
        self.run(node, Direction::Down).await
    }

    /// Checks required before bringing `node` back into service
    pub async fn validate_up(&self, node: &str) -> ValidationResults {
        self.run(node, Direction::Up).await
    }

    async fn run(&self, node: &str, direction: Direction) -> ValidationResults {
        let mut checks: Vec<BoxFuture<'_, ValidationResult>> = vec![self.node_exists(node).boxed()];

        for namespace in self.namespaces() {
            checks.push(self.namespace_exists(namespace).boxed());
        }
        if direction == Direction::Down {
            checks.push(self.toolbox_ready().boxed());
        }
        for permission in self.required_permissions() {
            checks.push(self.permission(permission).boxed());
        }

        let results = ValidationResults::new(join_all(checks).await);
        for failed in results.failures() {
            warn!("Preflight check '{}' failed: {}", failed.check, failed.message);
        }
        debug!(
            "Preflight for {} ({:?}): {} checks, all passed: {}",
            node,
            direction,
            results.results.len(),
            results.all_passed()
        );
        results
    }

    fn namespaces(&self) -> Vec<&'a str> {
        let mut namespaces = vec![self.config.namespace.as_str()];
        if self.config.operator_namespace != self.config.namespace {
            namespaces.push(self.config.operator_namespace.as_str());
        }
        namespaces
    }

    /// The mutations the phases issue, expressed as authorization queries
    fn required_permissions(&self) -> Vec<PermissionCheck> {
        let mut permissions = vec![
            PermissionCheck::new("", "nodes", "patch"),
            PermissionCheck::new("apps", "deployments", "patch").in_namespace(&self.config.namespace),
        ];
        if self.config.operator_namespace != self.config.namespace {
            permissions.push(
                PermissionCheck::new("apps", "deployments", "patch")
                    .in_namespace(&self.config.operator_namespace),
            );
        }
        permissions.push(
            PermissionCheck::new("", "pods", "create")
                .subresource("exec")
                .in_namespace(&self.config.namespace),
        );
        permissions
    }

    async fn node_exists(&self, node: &str) -> ValidationResult {
        match self.client.get_node(node).await {
            Ok(Some(_)) => ValidationResult::pass(CHECK_NODE_EXISTS, format!("node {node} found")),
            Ok(None) => ValidationResult::fail(
                CHECK_NODE_EXISTS,
                format!("node {node} does not exist in the cluster"),
            ),
            Err(e) => ValidationResult::fail(
                CHECK_NODE_EXISTS,
                format!("could not look up node {node}: {e}"),
            ),
        }
    }

    async fn namespace_exists(&self, namespace: &str) -> ValidationResult {
        let check = format!("Namespace {namespace}");
        match self.client.namespace_exists(namespace).await {
            Ok(true) => ValidationResult::pass(check, format!("namespace {namespace} exists")),
            Ok(false) => ValidationResult::fail(check, format!("namespace {namespace} not found")),
            Err(e) => ValidationResult::fail(
                check,
                format!("could not look up namespace {namespace}: {e}"),
            ),
        }
    }

    async fn toolbox_ready(&self) -> ValidationResult {
        let namespace = &self.config.namespace;
        let name = &self.config.toolbox_deployment;
        match self.client.get_deployment(namespace, name).await {
            Ok(Some(deployment)) => {
                let ready = deployment
                    .status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0);
                if ready > 0 {
                    ValidationResult::pass(
                        CHECK_TOOLBOX_READY,
                        format!("{namespace}/{name} has {ready} ready replica(s)"),
                    )
                } else {
                    ValidationResult::fail(
                        CHECK_TOOLBOX_READY,
                        format!("{namespace}/{name} has no ready replicas"),
                    )
                }
            }
            Ok(None) => ValidationResult::fail(
                CHECK_TOOLBOX_READY,
                format!("toolbox deployment {namespace}/{name} not found"),
            ),
            Err(e) => ValidationResult::fail(
                CHECK_TOOLBOX_READY,
                format!("could not read toolbox deployment {namespace}/{name}: {e}"),
            ),
        }
    }

    async fn permission(&self, permission: PermissionCheck) -> ValidationResult {
        let check = format!("Permission: {}", permission.describe());
        match self.client.can_i(&permission).await {
            Ok(true) => ValidationResult::pass(check, "allowed"),
            Ok(false) => ValidationResult::fail(
                check,
                format!("not allowed to {}", permission.describe()),
            ),
            // A failed authorization query counts as "not allowed"
            Err(e) => ValidationResult::fail(check, format!("authorization query failed: {e}")),
        }
    }
}
