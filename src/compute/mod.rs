//! Provisioning orchestrator.
//!
//! [`ComputeService`] drives a [`ComputeBackend`] through batch creation,
//! readiness polling, bootstrap scripts, reboots and best-effort teardown.
//! The service keeps no node state of its own: the tag is the unit of batch
//! identity, and any service over the same provider account sees the same
//! nodes.

mod catalog;

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::backend::{ClassifiedError, ComputeBackend, FailureKind};
use crate::location::{Location, LocationError, LocationRegistry};
use crate::node::{NodeError, NodeMetadata, NodeState};
use crate::retry::{BoundedRetry, DEFAULT_SOCKET_PERIOD, RetryablePredicate};
use crate::script::{RunScriptOptions, ScriptExecutor, ScriptFailure, ScriptResults};
use crate::socket::{SocketProbe, wait_for_socket};
use crate::ssh::{ExecResponse, SshClientFactory};
use crate::template::{
    Catalog, Image, Size, Template, TemplateBuilder, TemplateError, TemplateOptions,
};
use crate::types::NodeId;

pub use catalog::CatalogCache;

/// Default time a node may take to reach `RUNNING`.
pub const DEFAULT_NODE_RUNNING_TIMEOUT: Duration = Duration::from_secs(600);

/// Default interval between node state polls.
pub const DEFAULT_NODE_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Default lifetime of a catalog snapshot.
pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(60);

/// Timing knobs for the orchestrator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ComputeSettings {
    /// Budget for a node to settle after creation or reboot.
    pub node_running_timeout: Duration,
    /// Interval between node state polls.
    pub node_poll_period: Duration,
    /// Lifetime of a catalog snapshot.
    pub catalog_ttl: Duration,
    /// Socket readiness policy used before bootstrap scripts run.
    pub socket_wait: RetryablePredicate,
    /// Retry policy for [`ComputeService::verify_node`].
    pub verify: BoundedRetry,
}

impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            node_running_timeout: DEFAULT_NODE_RUNNING_TIMEOUT,
            node_poll_period: DEFAULT_NODE_POLL_PERIOD,
            catalog_ttl: DEFAULT_CATALOG_TTL,
            socket_wait: RetryablePredicate::socket_default(),
            verify: BoundedRetry::default(),
        }
    }
}

/// Errors that fail a whole orchestrator call.
#[derive(Debug, Error)]
pub enum ComputeError<E: ClassifiedError> {
    /// Raised when the provider rejects the caller's credentials.
    #[error("provider rejected the credentials during {operation}")]
    Authorization {
        /// Operation that was attempted.
        operation: &'static str,
        /// Provider error.
        #[source]
        source: E,
    },
    /// Raised for any other provider failure of a whole-call operation.
    #[error("provider call {operation} failed")]
    Backend {
        /// Operation that was attempted.
        operation: &'static str,
        /// Provider error.
        #[source]
        source: E,
    },
    /// Raised when a template cannot be resolved.
    #[error(transparent)]
    NoMatch(#[from] TemplateError),
    /// Raised when the provider reports an inconsistent location tree.
    #[error(transparent)]
    Location(#[from] LocationError),
    /// Raised when the request itself is unusable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Raised when the provider returns a record that does not match the one
    /// asked about.
    #[error("node {id} came back with {field} {actual:?}, expected {expected:?}")]
    Inconsistent {
        /// Node that was asked about.
        id: NodeId,
        /// Field that differs.
        field: &'static str,
        /// Value held by the caller.
        expected: String,
        /// Value the provider returned.
        actual: String,
    },
}

impl<E: ClassifiedError> ComputeError<E> {
    fn from_backend(operation: &'static str, source: E) -> Self {
        if source.kind() == FailureKind::Authorization {
            Self::Authorization { operation, source }
        } else {
            Self::Backend { operation, source }
        }
    }

    /// Returns `true` when the provider rejected the credentials.
    #[must_use]
    pub const fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization { .. })
    }
}

/// Why one node of a batch did not make it.
#[derive(Debug, Error)]
pub enum NodeFailure<E: ClassifiedError> {
    /// The provider refused to create a node.
    #[error("node creation failed")]
    Create {
        /// Provider error.
        #[source]
        source: E,
    },
    /// The node settled in a state other than `RUNNING`.
    #[error("node {id} settled in {state}")]
    Settled {
        /// Affected node.
        id: NodeId,
        /// State it ended in.
        state: NodeState,
    },
    /// The node did not settle within the budget.
    #[error("node {id} still {state} after {waited:?}")]
    Timeout {
        /// Affected node.
        id: NodeId,
        /// Last state observed.
        state: NodeState,
        /// Budget that was spent.
        waited: Duration,
    },
    /// Polling the node failed.
    #[error("polling node {id} failed")]
    Poll {
        /// Affected node.
        id: NodeId,
        /// Provider error.
        #[source]
        source: E,
    },
    /// The node broke a metadata invariant.
    #[error("node {id} is malformed")]
    Invalid {
        /// Affected node.
        id: NodeId,
        /// Broken invariant.
        #[source]
        source: NodeError,
    },
    /// The port requested with `block_on_port` never opened.
    #[error("port {port} on node {id} never opened")]
    PortClosed {
        /// Affected node.
        id: NodeId,
        /// Port that was probed.
        port: u16,
    },
    /// The bootstrap script failed.
    #[error("bootstrap script failed on node {}", .source.node())]
    Script {
        /// Execution failure.
        #[source]
        source: ScriptFailure,
    },
}

impl<E: ClassifiedError> NodeFailure<E> {
    /// Node the failure belongs to; `None` when creation itself failed.
    #[must_use]
    pub const fn node(&self) -> Option<&NodeId> {
        match self {
            Self::Create { .. } => None,
            Self::Settled { id, .. }
            | Self::Timeout { id, .. }
            | Self::Poll { id, .. }
            | Self::Invalid { id, .. }
            | Self::PortClosed { id, .. } => Some(id),
            Self::Script { source } => Some(source.node()),
        }
    }
}

/// Result of [`ComputeService::run_nodes_with_tag`].
#[derive(Debug)]
pub struct CreateNodesOutcome<E: ClassifiedError> {
    /// Nodes that are `RUNNING` and bootstrapped, ordered by id.
    pub nodes: Vec<NodeMetadata>,
    /// Everything that went wrong, one entry per affected node.
    pub failures: Vec<NodeFailure<E>>,
}

impl<E: ClassifiedError> CreateNodesOutcome<E> {
    /// Returns `true` when every requested node is up.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of a tag-wide reboot or destroy.
#[derive(Debug)]
pub struct BatchOutcome<E> {
    /// Nodes the operation succeeded on and that reached the expected state.
    pub succeeded: Vec<NodeId>,
    /// Unsupported or transient per-node errors that were tolerated.
    pub swallowed: Vec<(NodeId, E)>,
    /// Per-node errors that were not tolerated.
    pub failed: Vec<(NodeId, E)>,
    /// Nodes the provider accepted the operation for that did not reach the
    /// expected state afterwards: still present and not `TERMINATED` after a
    /// destroy, or not `RUNNING` again after a reboot. Disjoint from
    /// `succeeded`.
    pub unsettled: Vec<NodeId>,
}

impl<E> Default for BatchOutcome<E> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            swallowed: Vec::new(),
            failed: Vec::new(),
            unsettled: Vec::new(),
        }
    }
}

impl<E> BatchOutcome<E> {
    /// Returns `true` when nothing failed and nothing is left over.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.swallowed.is_empty() && self.unsettled.is_empty()
    }
}

/// Per-node results of a script run.
#[derive(Debug, Default)]
pub struct ScriptReport {
    /// Results keyed by node.
    pub results: ScriptResults,
}

impl ScriptReport {
    /// Responses of the nodes the script completed on.
    pub fn responses(&self) -> impl Iterator<Item = (&NodeId, &ExecResponse)> {
        self.results
            .iter()
            .filter_map(|(id, result)| result.as_ref().ok().map(|response| (id, response)))
    }

    /// Failures, keyed by node.
    pub fn failures(&self) -> impl Iterator<Item = (&NodeId, &ScriptFailure)> {
        self.results
            .iter()
            .filter_map(|(id, result)| result.as_ref().err().map(|failure| (id, failure)))
    }

    /// Nodes that rejected the credentials.
    #[must_use]
    pub fn auth_failures(&self) -> BTreeSet<NodeId> {
        self.failures()
            .filter(|(_, failure)| failure.is_auth_failure())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns `true` when the script completed everywhere.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.results.values().all(Result::is_ok)
    }
}

enum Settle<E> {
    Running(NodeMetadata),
    Invalid(NodeId, NodeError),
    Stopped(NodeId, NodeState),
    TimedOut(NodeId, NodeState),
    Failed(NodeId, E),
}

/// Orchestrates provisioning against one provider account.
#[derive(Debug)]
pub struct ComputeService<B, F, P> {
    backend: B,
    executor: ScriptExecutor<F, P>,
    settings: ComputeSettings,
    catalog: CatalogCache,
}

impl<B, F, P> ComputeService<B, F, P>
where
    B: ComputeBackend,
    F: SshClientFactory,
    P: SocketProbe,
{
    /// Creates a service over `backend`, opening sessions through `factory`
    /// and probing sockets through `probe`.
    #[must_use]
    pub fn new(backend: B, factory: F, probe: P, settings: ComputeSettings) -> Self {
        Self {
            backend,
            executor: ScriptExecutor::new(factory, probe),
            catalog: CatalogCache::new(settings.catalog_ttl),
            settings,
        }
    }

    /// Provider adapter in use.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Script executor in use.
    #[must_use]
    pub const fn executor(&self) -> &ScriptExecutor<F, P> {
        &self.executor
    }

    /// Timing settings in use.
    #[must_use]
    pub const fn settings(&self) -> &ComputeSettings {
        &self.settings
    }

    async fn fetch_catalog(&self) -> Result<Catalog, ComputeError<B::Error>> {
        let backend = &self.backend;
        let (images, sizes, offered) = futures::try_join!(
            async {
                backend
                    .list_images()
                    .await
                    .map_err(|err| ComputeError::from_backend("list_images", err))
            },
            async {
                backend
                    .list_sizes()
                    .await
                    .map_err(|err| ComputeError::from_backend("list_sizes", err))
            },
            async {
                backend
                    .list_assignable_locations()
                    .await
                    .map_err(|err| ComputeError::from_backend("list_assignable_locations", err))
            },
        )?;
        let locations = LocationRegistry::new(offered)?;
        locations.validate()?;
        debug!(
            provider = backend.provider_name(),
            images = images.len(),
            sizes = sizes.len(),
            locations = locations.len(),
            "catalog loaded"
        );
        Ok(Catalog {
            images,
            sizes,
            locations,
        })
    }

    async fn load_catalog(&self) -> Result<Catalog, ComputeError<B::Error>> {
        self.catalog.get_or_load(|| self.fetch_catalog()).await
    }

    /// Current catalog snapshot, served from cache while fresh.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Authorization`] or [`ComputeError::Backend`]
    /// when a listing fails and [`ComputeError::Location`] when the provider
    /// location tree is malformed: a dangling or cyclic parent, or a location
    /// that does not resolve to a provider.
    pub async fn catalog(&self) -> Result<Catalog, ComputeError<B::Error>> {
        self.load_catalog().await
    }

    /// Starts a template builder over the current catalog.
    ///
    /// # Errors
    ///
    /// As for [`ComputeService::catalog`].
    pub async fn template_builder(&self) -> Result<TemplateBuilder, ComputeError<B::Error>> {
        Ok(TemplateBuilder::new(self.load_catalog().await?))
    }

    /// Bootable images.
    ///
    /// # Errors
    ///
    /// As for [`ComputeService::catalog`].
    pub async fn list_images(&self) -> Result<Vec<Image>, ComputeError<B::Error>> {
        Ok(self.load_catalog().await?.images)
    }

    /// Hardware profiles.
    ///
    /// # Errors
    ///
    /// As for [`ComputeService::catalog`].
    pub async fn list_sizes(&self) -> Result<Vec<Size>, ComputeError<B::Error>> {
        Ok(self.load_catalog().await?.sizes)
    }

    /// Assignable locations, ordered by id.
    ///
    /// # Errors
    ///
    /// As for [`ComputeService::catalog`].
    pub async fn list_assignable_locations(
        &self,
    ) -> Result<Vec<Location>, ComputeError<B::Error>> {
        Ok(self.load_catalog().await?.locations.iter().cloned().collect())
    }

    /// Creates `count` nodes tagged `tag` from `template` and brings them up.
    ///
    /// Each node is polled until it settles, its `block_on_port` port is
    /// awaited and its bootstrap script is run. Nodes that fail any step are
    /// reported in [`CreateNodesOutcome::failures`] and left in place.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::InvalidRequest`] for a blank tag and
    /// [`ComputeError::Authorization`] when the provider rejects the
    /// credentials for any create call.
    #[instrument(skip(self, template), fields(provider = self.backend.provider_name(), image = %template.image.id))]
    pub async fn run_nodes_with_tag(
        &self,
        tag: &str,
        count: usize,
        template: &Template,
    ) -> Result<CreateNodesOutcome<B::Error>, ComputeError<B::Error>> {
        if tag.trim().is_empty() {
            return Err(ComputeError::InvalidRequest(String::from(
                "tag must not be blank",
            )));
        }

        let mut failures = Vec::new();
        let mut created = Vec::with_capacity(count);
        for result in self.backend.create_nodes(tag, count, template).await {
            match result {
                Ok(node) => created.push(node),
                Err(err) if err.kind() == FailureKind::Authorization => {
                    return Err(ComputeError::from_backend("create_node", err));
                }
                Err(err) => {
                    warn!(error = %err, "node creation failed");
                    failures.push(NodeFailure::Create { source: err });
                }
            }
        }

        let brought_up = join_all(created.iter().map(|node| self.bring_up(node, template))).await;
        let mut nodes = Vec::with_capacity(brought_up.len());
        for result in brought_up {
            match result {
                Ok(node) => nodes.push(node),
                Err(failure) => {
                    warn!(error = %failure, "node did not come up");
                    failures.push(failure);
                }
            }
        }
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        info!(running = nodes.len(), failed = failures.len(), "nodes provisioned");
        Ok(CreateNodesOutcome { nodes, failures })
    }

    async fn bring_up(
        &self,
        node: &NodeMetadata,
        template: &Template,
    ) -> Result<NodeMetadata, NodeFailure<B::Error>> {
        let running = match self.await_running(&node.id, node.state).await {
            Settle::Running(running) => running,
            Settle::Stopped(id, state) => return Err(NodeFailure::Settled { id, state }),
            Settle::TimedOut(id, state) => {
                return Err(NodeFailure::Timeout {
                    id,
                    state,
                    waited: self.settings.node_running_timeout,
                });
            }
            Settle::Failed(id, source) => return Err(NodeFailure::Poll { id, source }),
            Settle::Invalid(id, source) => return Err(NodeFailure::Invalid { id, source }),
        };

        let options = &template.options;
        if let Some(wait) = options.port_wait() {
            let opened = match running.primary_address() {
                Some(ip) => {
                    let policy = RetryablePredicate::new(wait.timeout, DEFAULT_SOCKET_PERIOD);
                    wait_for_socket(
                        self.executor.probe(),
                        SocketAddr::new(ip, wait.port),
                        &policy,
                    )
                    .await
                }
                None => false,
            };
            if !opened {
                return Err(NodeFailure::PortClosed {
                    id: running.id,
                    port: wait.port,
                });
            }
        }

        if let Some(script) = options.script() {
            self.executor
                .run_on_node(&running, script, &self.script_options(options))
                .await
                .map_err(|source| NodeFailure::Script { source })?;
        }
        Ok(running)
    }

    fn script_options(&self, options: &TemplateOptions) -> RunScriptOptions {
        let mut script_options = RunScriptOptions::new().socket_wait(self.settings.socket_wait);
        if let Some(credentials) = options.override_credentials() {
            script_options = script_options.override_credentials_with(credentials.clone());
        }
        if let Some(key) = options.private_key() {
            script_options = script_options.private_key(key);
        }
        self.with_login_account(script_options)
    }

    /// Fills in the provider's login account for nodes whose record carries
    /// no credentials, unless the caller named one.
    fn with_login_account(&self, options: RunScriptOptions) -> RunScriptOptions {
        match self.backend.default_login_account() {
            Some(account) if options.fallback_account().is_none() => {
                options.fallback_account_of(account)
            }
            _ => options,
        }
    }

    /// Polls `id` until it settles, starting from the last known `from`
    /// state. A poll reporting a move the lifecycle forbids ends the wait.
    async fn await_running(&self, id: &NodeId, from: NodeState) -> Settle<B::Error> {
        let observed: Mutex<Option<Result<NodeMetadata, B::Error>>> = Mutex::new(None);
        let previous = Mutex::new(from);
        let illegal: Mutex<Option<NodeError>> = Mutex::new(None);
        let (last, previous_ref, illegal_ref) = (&observed, &previous, &illegal);
        let backend = &self.backend;
        let policy = RetryablePredicate::new(
            self.settings.node_running_timeout,
            self.settings.node_poll_period,
        );
        let settled = policy
            .apply(id, |_| async move {
                let fetched = backend.get_node(id).await;
                let done = match &fetched {
                    Ok(node) => {
                        let mut prior = previous_ref.lock().unwrap_or_else(PoisonError::into_inner);
                        if prior.can_transition_to(node.state) {
                            *prior = node.state;
                            node.state.is_settled()
                        } else {
                            *illegal_ref.lock().unwrap_or_else(PoisonError::into_inner) =
                                Some(NodeError::IllegalTransition {
                                    id: node.id.clone(),
                                    from: *prior,
                                    to: node.state,
                                });
                            true
                        }
                    }
                    Err(err) => matches!(
                        err.kind(),
                        FailureKind::Authorization | FailureKind::NotFound
                    ),
                };
                *last.lock().unwrap_or_else(PoisonError::into_inner) = Some(fetched);
                done
            })
            .await;

        if let Some(err) = illegal.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Settle::Invalid(id.clone(), err);
        }
        match observed.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(Ok(node)) if settled && node.state == NodeState::Running => {
                match node.check_invariants() {
                    Ok(()) => Settle::Running(node),
                    Err(err) => Settle::Invalid(node.id, err),
                }
            }
            Some(Ok(node)) if settled => Settle::Stopped(node.id, node.state),
            Some(Ok(node)) => Settle::TimedOut(node.id, node.state),
            Some(Err(err)) => Settle::Failed(id.clone(), err),
            None => Settle::TimedOut(id.clone(), NodeState::Unknown),
        }
    }

    /// Every node in the account, terminated ones included.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Authorization`] or [`ComputeError::Backend`]
    /// when the listing fails.
    pub async fn list_nodes(&self) -> Result<Vec<NodeMetadata>, ComputeError<B::Error>> {
        self.backend
            .list_nodes(None)
            .await
            .map_err(|err| ComputeError::from_backend("list_nodes", err))
    }

    /// Nodes carrying `tag`.
    ///
    /// # Errors
    ///
    /// As for [`ComputeService::list_nodes`].
    pub async fn list_nodes_with_tag(
        &self,
        tag: &str,
    ) -> Result<Vec<NodeMetadata>, ComputeError<B::Error>> {
        self.backend
            .list_nodes(Some(tag))
            .await
            .map_err(|err| ComputeError::from_backend("list_nodes", err))
    }

    /// Nodes for which `predicate` holds.
    ///
    /// # Errors
    ///
    /// As for [`ComputeService::list_nodes`].
    pub async fn list_nodes_matching(
        &self,
        predicate: impl Fn(&NodeMetadata) -> bool,
    ) -> Result<Vec<NodeMetadata>, ComputeError<B::Error>> {
        let mut nodes = self.list_nodes().await?;
        nodes.retain(predicate);
        Ok(nodes)
    }

    /// Fresh view of `node`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Inconsistent`] when the provider answers with
    /// a record for a different id, tag, image or location, or with a state
    /// the lifecycle cannot reach from the cached one, and the usual provider
    /// errors.
    pub async fn get_node_metadata(
        &self,
        node: &NodeMetadata,
    ) -> Result<NodeMetadata, ComputeError<B::Error>> {
        let fresh = self
            .backend
            .get_node(&node.id)
            .await
            .map_err(|err| ComputeError::from_backend("get_node", err))?;
        if fresh.id != node.id {
            return Err(ComputeError::Inconsistent {
                id: node.id.clone(),
                field: "id",
                expected: node.id.to_string(),
                actual: fresh.id.to_string(),
            });
        }
        if fresh.tag != node.tag {
            return Err(ComputeError::Inconsistent {
                id: node.id.clone(),
                field: "tag",
                expected: node.tag.clone(),
                actual: fresh.tag,
            });
        }
        if fresh.image != node.image {
            return Err(ComputeError::Inconsistent {
                id: node.id.clone(),
                field: "image",
                expected: node.image.to_string(),
                actual: fresh.image.to_string(),
            });
        }
        if fresh.location != node.location {
            return Err(ComputeError::Inconsistent {
                id: node.id.clone(),
                field: "location",
                expected: node.location.to_string(),
                actual: fresh.location.to_string(),
            });
        }
        if !node.state.can_transition_to(fresh.state) {
            return Err(ComputeError::Inconsistent {
                id: node.id.clone(),
                field: "state",
                expected: format!("a state reachable from {}", node.state),
                actual: fresh.state.to_string(),
            });
        }
        Ok(fresh)
    }

    /// Reboots every non-terminated node carrying `tag` and waits for each
    /// to run again.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Authorization`] when the provider rejects the
    /// credentials and [`ComputeError::Backend`] when the tag cannot be
    /// listed.
    #[instrument(skip(self), fields(provider = self.backend.provider_name()))]
    pub async fn reboot_nodes_with_tag(
        &self,
        tag: &str,
    ) -> Result<BatchOutcome<B::Error>, ComputeError<B::Error>> {
        let results = self
            .backend
            .reboot_nodes(tag)
            .await
            .map_err(|err| ComputeError::from_backend("reboot_nodes", err))?;

        let mut outcome = BatchOutcome::default();
        let mut rebooted = Vec::new();
        for (id, result) in results {
            match result {
                Ok(()) => rebooted.push(id),
                Err(err) if err.kind() == FailureKind::Authorization => {
                    return Err(ComputeError::from_backend("reboot_node", err));
                }
                Err(err) => {
                    warn!(node = %id, error = %err, "reboot failed");
                    outcome.failed.push((id, err));
                }
            }
        }

        let settled = join_all(
            rebooted
                .iter()
                .map(|id| self.await_running(id, NodeState::Running)),
        )
        .await;
        for (id, settle) in rebooted.into_iter().zip(settled) {
            if matches!(settle, Settle::Running(_)) {
                outcome.succeeded.push(id);
            } else {
                warn!(node = %id, "node did not come back after reboot");
                outcome.unsettled.push(id);
            }
        }
        info!(
            rebooted = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            unsettled = outcome.unsettled.len(),
            "reboot finished"
        );
        Ok(outcome)
    }

    /// Destroys every non-terminated node carrying `tag`, tolerating
    /// unsupported and transient per-node errors.
    ///
    /// A node that is already gone counts as destroyed. Afterwards the tag
    /// is listed again and destroyed nodes still present in a
    /// non-terminated state are reported in [`BatchOutcome::unsettled`].
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Authorization`] when the provider rejects the
    /// credentials and [`ComputeError::Backend`] when the tag cannot be
    /// listed.
    #[instrument(skip(self), fields(provider = self.backend.provider_name()))]
    pub async fn destroy_nodes_with_tag(
        &self,
        tag: &str,
    ) -> Result<BatchOutcome<B::Error>, ComputeError<B::Error>> {
        let results = self
            .backend
            .destroy_nodes(tag)
            .await
            .map_err(|err| ComputeError::from_backend("destroy_nodes", err))?;

        let mut outcome = BatchOutcome::default();
        for (id, result) in results {
            let Err(err) = result else {
                outcome.succeeded.push(id);
                continue;
            };
            match err.kind() {
                FailureKind::NotFound => outcome.succeeded.push(id),
                FailureKind::Authorization => {
                    return Err(ComputeError::from_backend("destroy_node", err));
                }
                FailureKind::Unsupported | FailureKind::Transient => {
                    warn!(node = %id, error = %err, "ignoring destroy failure");
                    outcome.swallowed.push((id, err));
                }
                FailureKind::Fatal => {
                    warn!(node = %id, error = %err, "destroy failed");
                    outcome.failed.push((id, err));
                }
            }
        }

        let destroyed: BTreeSet<&NodeId> = outcome.succeeded.iter().collect();
        let remaining: BTreeMap<NodeId, NodeState> = self
            .list_nodes_with_tag(tag)
            .await?
            .into_iter()
            .filter(|node| destroyed.contains(&node.id) && !node.state.is_terminated())
            .map(|node| (node.id, node.state))
            .collect();
        for (id, state) in &remaining {
            warn!(node = %id, %state, "node survived destroy");
        }
        outcome.succeeded.retain(|id| !remaining.contains_key(id));
        outcome.unsettled = remaining.into_keys().collect();
        info!(
            destroyed = outcome.succeeded.len(),
            swallowed = outcome.swallowed.len(),
            failed = outcome.failed.len(),
            residual = outcome.unsettled.len(),
            "destroy finished"
        );
        Ok(outcome)
    }

    /// Runs `script` on every node for which `predicate` holds.
    ///
    /// # Errors
    ///
    /// Returns provider errors from the listing; per-node failures land in
    /// the report.
    #[instrument(skip_all, fields(provider = self.backend.provider_name()))]
    pub async fn run_script_on_nodes_matching(
        &self,
        predicate: impl Fn(&NodeMetadata) -> bool,
        script: &str,
        options: &RunScriptOptions,
    ) -> Result<ScriptReport, ComputeError<B::Error>> {
        let nodes = self.list_nodes_matching(predicate).await?;
        let options = self.with_login_account(options.clone());
        let results = self.executor.run_on_nodes(&nodes, script, &options).await;
        let report = ScriptReport { results };
        info!(
            nodes = nodes.len(),
            failed = report.failures().count(),
            "script run finished"
        );
        Ok(report)
    }

    /// Runs `command` on `node` until its output contains `marker`.
    ///
    /// # Errors
    ///
    /// Returns the last [`ScriptFailure`] once the verification retry policy
    /// is exhausted.
    pub async fn verify_node(
        &self,
        node: &NodeMetadata,
        command: &str,
        marker: &str,
        options: &RunScriptOptions,
    ) -> Result<ExecResponse, ScriptFailure> {
        let options = self.with_login_account(options.clone());
        self.executor
            .verify(node, command, marker, &options, &self.settings.verify)
            .await
    }
}
