//! In-memory provider.
//!
//! A [`StubAccount`] plays the part of a provider account: every
//! [`StubBackend`] connected to the same account sees the same nodes, the way
//! two clients of a real cloud would. Nodes boot after a configurable number
//! of polls, and faults can be injected per operation.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{BackendFuture, ClassifiedError, ComputeBackend, FailureKind};
use crate::location::{Location, LocationRegistry, LocationScope};
use crate::node::{Credentials, NodeError, NodeMetadata, NodeState};
use crate::template::{Catalog, Image, OsFamily, Size, Template};
use crate::types::{ImageId, LocationId, NodeId, SizeId};

const PROVIDER_NAME: &str = "stub";
const LOGIN_ACCOUNT: &str = "root";
const DEFAULT_BOOT_POLLS: u32 = 1;

/// Errors raised by the in-memory provider.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StubError {
    /// Raised when the client identity or secret does not match the account.
    #[error("authorization failed for identity {identity}")]
    Unauthorized {
        /// Identity presented by the client.
        identity: String,
    },
    /// Raised when a node identifier is unknown.
    #[error("node {id} not found")]
    NodeNotFound {
        /// Requested node.
        id: NodeId,
    },
    /// Raised when a node cannot make the requested state change.
    #[error("node {id} in state {state} cannot {operation}")]
    InvalidState {
        /// Target node.
        id: NodeId,
        /// Current state.
        state: NodeState,
        /// Operation attempted.
        operation: &'static str,
    },
    /// Raised when a state change breaks the node lifecycle.
    #[error("node lifecycle violated")]
    Lifecycle(#[from] NodeError),
    /// Raised when the template cannot be placed.
    #[error("no zone available under location {location}")]
    NoPlacement {
        /// Location named by the template.
        location: LocationId,
    },
    /// Raised once the simulated address pool is used up.
    #[error("address pool exhausted")]
    AddressPoolExhausted,
    /// Raised by a fault injected through [`StubAccount`].
    #[error("injected {kind:?} failure during {operation}")]
    Injected {
        /// Operation that failed.
        operation: &'static str,
        /// Classification reported for the failure.
        kind: FailureKind,
    },
}

impl ClassifiedError for StubError {
    fn kind(&self) -> FailureKind {
        match self {
            Self::Unauthorized { .. } => FailureKind::Authorization,
            Self::NodeNotFound { .. } => FailureKind::NotFound,
            Self::InvalidState { .. }
            | Self::Lifecycle(_)
            | Self::NoPlacement { .. }
            | Self::AddressPoolExhausted => FailureKind::Fatal,
            Self::Injected { kind, .. } => *kind,
        }
    }
}

#[derive(Debug)]
struct StubNode {
    metadata: NodeMetadata,
    polls_until_settled: u32,
    fails_to_boot: bool,
}

#[derive(Debug)]
struct AccountState {
    catalog: Catalog,
    identity: String,
    secret: String,
    nodes: BTreeMap<NodeId, StubNode>,
    tags: BTreeMap<String, BTreeSet<NodeId>>,
    next_index: u32,
    boot_polls: u32,
    failing_creates: u32,
    failing_boots: u32,
    destroy_faults: BTreeMap<NodeId, FailureKind>,
    lingering: BTreeSet<NodeId>,
    catalog_reads: u32,
    withhold_credentials: bool,
}

impl AccountState {
    fn advance(&mut self, id: &NodeId) -> Result<(), StubError> {
        let Some(node) = self.nodes.get_mut(id) else {
            return Ok(());
        };
        if node.metadata.state != NodeState::Pending {
            return Ok(());
        }
        if node.polls_until_settled > 0 {
            node.polls_until_settled -= 1;
            return Ok(());
        }
        node.metadata.transition_to(if node.fails_to_boot {
            NodeState::Error
        } else {
            NodeState::Running
        })?;
        debug!(node = %id, state = %node.metadata.state, "stub node settled");
        Ok(())
    }

    /// Node record as a client sees it.
    fn view(&self, node: &StubNode) -> NodeMetadata {
        let mut metadata = node.metadata.clone();
        if self.withhold_credentials {
            metadata.credentials = None;
        }
        metadata
    }

    fn placement(&self, template: &Template) -> Result<LocationId, StubError> {
        let registry = &self.catalog.locations;
        let location = &template.location;
        match location.scope {
            LocationScope::Zone | LocationScope::Host => Ok(location.id.clone()),
            LocationScope::Region | LocationScope::Provider => registry
                .children_of(&location.id)
                .find(|child| child.scope == LocationScope::Zone)
                .or_else(|| registry.default_location())
                .map(|zone| zone.id.clone())
                .ok_or_else(|| StubError::NoPlacement {
                    location: location.id.clone(),
                }),
        }
    }
}

/// Shared provider account backing any number of [`StubBackend`] clients.
#[derive(Clone, Debug)]
pub struct StubAccount {
    state: Arc<Mutex<AccountState>>,
}

impl StubAccount {
    /// Creates an account offering `catalog` to clients presenting
    /// `identity` and `secret`.
    #[must_use]
    pub fn new(catalog: Catalog, identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(AccountState {
                catalog,
                identity: identity.into(),
                secret: secret.into(),
                nodes: BTreeMap::new(),
                tags: BTreeMap::new(),
                next_index: 0,
                boot_polls: DEFAULT_BOOT_POLLS,
                failing_creates: 0,
                failing_boots: 0,
                destroy_faults: BTreeMap::new(),
                lingering: BTreeSet::new(),
                catalog_reads: 0,
                withhold_credentials: false,
            })),
        }
    }

    /// Creates an account offering [`default_catalog`].
    #[must_use]
    pub fn with_default_catalog(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::new(default_catalog(), identity, secret)
    }

    fn lock(&self) -> MutexGuard<'_, AccountState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets how many polls a new or rebooted node stays pending for.
    pub fn set_boot_polls(&self, polls: u32) {
        self.lock().boot_polls = polls;
    }

    /// Makes the next `count` create calls fail transiently.
    pub fn fail_next_creates(&self, count: u32) {
        self.lock().failing_creates = count;
    }

    /// Makes the next `count` created nodes settle in the error state.
    pub fn fail_next_boots(&self, count: u32) {
        self.lock().failing_boots = count;
    }

    /// Makes destroying `id` fail with the given classification.
    pub fn fail_destroy_of(&self, id: &NodeId, kind: FailureKind) {
        self.lock().destroy_faults.insert(id.clone(), kind);
    }

    /// Accepts destroy requests for `id` without ever terminating it.
    pub fn linger_after_destroy(&self, id: &NodeId) {
        self.lock().lingering.insert(id.clone());
    }

    /// Stops returning node credentials from listings and lookups, the way
    /// providers that only reveal a login at creation behave.
    pub fn withhold_credentials(&self) {
        self.lock().withhold_credentials = true;
    }

    /// Number of catalog listings served so far.
    #[must_use]
    pub fn catalog_reads(&self) -> u32 {
        self.lock().catalog_reads
    }

    /// Returns `true` when `account` and `key` open a session on the node
    /// reachable at `addr`.
    #[must_use]
    pub fn accepts_login(&self, addr: IpAddr, account: &str, key: &str) -> bool {
        self.lock().nodes.values().any(|node| {
            let metadata = &node.metadata;
            let reachable = metadata.public_addresses.contains(&addr)
                || metadata.private_addresses.contains(&addr);
            reachable
                && metadata.state == NodeState::Running
                && metadata
                    .credentials
                    .as_ref()
                    .is_some_and(|credentials| {
                        credentials.account == account && credentials.key == key
                    })
        })
    }

    /// Snapshot of every node ever created, destroyed ones included.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeMetadata> {
        self.lock()
            .nodes
            .values()
            .map(|node| node.metadata.clone())
            .collect()
    }
}

/// Client of a [`StubAccount`].
#[derive(Clone, Debug)]
pub struct StubBackend {
    account: StubAccount,
    identity: String,
    secret: String,
}

impl StubBackend {
    /// Connects to `account`. Credentials are checked on every call, so a
    /// client with the wrong secret only fails once it is used.
    #[must_use]
    pub fn new(
        account: StubAccount,
        identity: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            account,
            identity: identity.into(),
            secret: secret.into(),
        }
    }

    /// Account this client is connected to.
    #[must_use]
    pub const fn account(&self) -> &StubAccount {
        &self.account
    }

    fn session(&self) -> Result<MutexGuard<'_, AccountState>, StubError> {
        let state = self.account.lock();
        if state.identity == self.identity && state.secret == self.secret {
            Ok(state)
        } else {
            Err(StubError::Unauthorized {
                identity: self.identity.clone(),
            })
        }
    }

    fn create(&self, tag: &str, template: &Template) -> Result<NodeMetadata, StubError> {
        let mut state = self.session()?;
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(StubError::Injected {
                operation: "create",
                kind: FailureKind::Transient,
            });
        }

        let location = state.placement(template)?;
        state.next_index = state.next_index.saturating_add(1);
        let host = u8::try_from(state.next_index)
            .ok()
            .filter(|octet| *octet < u8::MAX)
            .ok_or(StubError::AddressPoolExhausted)?;

        let key = template
            .options
            .private_key()
            .map_or_else(|| format!("stub-key-{}", Uuid::new_v4().simple()), str::to_owned);
        let id = NodeId::new(format!("stub-{}", state.next_index));
        let metadata = NodeMetadata {
            id: id.clone(),
            tag: tag.to_owned(),
            name: format!("{tag}-{}", state.next_index),
            state: NodeState::Pending,
            image: template.image.id.clone(),
            location,
            public_addresses: BTreeSet::from([IpAddr::V4(Ipv4Addr::new(198, 51, 100, host))]),
            private_addresses: BTreeSet::from([IpAddr::V4(Ipv4Addr::new(10, 0, 0, host))]),
            credentials: Some(Credentials::new(LOGIN_ACCOUNT, key)),
            user_metadata: template.descriptive_metadata(),
        };

        let fails_to_boot = state.failing_boots > 0;
        if fails_to_boot {
            state.failing_boots -= 1;
        }
        let polls_until_settled = state.boot_polls;
        state.nodes.insert(
            id.clone(),
            StubNode {
                metadata: metadata.clone(),
                polls_until_settled,
                fails_to_boot,
            },
        );
        state.tags.entry(tag.to_owned()).or_default().insert(id);
        debug!(node = %metadata.id, tag, "stub node created");
        Ok(metadata)
    }

    fn list(&self, tag: Option<&str>) -> Result<Vec<NodeMetadata>, StubError> {
        let mut state = self.session()?;
        let ids: Vec<NodeId> = match tag {
            Some(wanted) => state
                .tags
                .get(wanted)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default(),
            None => state.nodes.keys().cloned().collect(),
        };
        let mut nodes = Vec::with_capacity(ids.len());
        for id in &ids {
            state.advance(id)?;
            if let Some(node) = state.nodes.get(id) {
                nodes.push(state.view(node));
            }
        }
        Ok(nodes)
    }

    fn get(&self, id: &NodeId) -> Result<NodeMetadata, StubError> {
        let mut state = self.session()?;
        state.advance(id)?;
        state
            .nodes
            .get(id)
            .map(|node| state.view(node))
            .ok_or_else(|| StubError::NodeNotFound { id: id.clone() })
    }

    fn reboot(&self, id: &NodeId) -> Result<(), StubError> {
        let mut state = self.session()?;
        let boot_polls = state.boot_polls;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| StubError::NodeNotFound { id: id.clone() })?;
        if node.metadata.state != NodeState::Running {
            return Err(StubError::InvalidState {
                id: id.clone(),
                state: node.metadata.state,
                operation: "reboot",
            });
        }
        node.metadata.transition_to(NodeState::Pending)?;
        node.polls_until_settled = boot_polls;
        node.fails_to_boot = false;
        Ok(())
    }

    fn destroy(&self, id: &NodeId) -> Result<(), StubError> {
        let mut state = self.session()?;
        if let Some(kind) = state.destroy_faults.get(id).copied() {
            return Err(StubError::Injected {
                operation: "destroy",
                kind,
            });
        }
        if state.lingering.contains(id) {
            debug!(node = %id, "stub node ignoring destroy");
            return Ok(());
        }
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| StubError::NodeNotFound { id: id.clone() })?;
        if node.metadata.state.is_terminated() {
            debug!(node = %id, "stub node already terminated");
            return Ok(());
        }
        node.metadata.transition_to(NodeState::Terminated)?;
        debug!(node = %id, "stub node terminated");
        Ok(())
    }

    fn read_catalog<T>(&self, read: impl FnOnce(&Catalog) -> T) -> Result<T, StubError> {
        let mut state = self.session()?;
        state.catalog_reads = state.catalog_reads.saturating_add(1);
        Ok(read(&state.catalog))
    }
}

impl ComputeBackend for StubBackend {
    type Error = StubError;

    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn default_login_account(&self) -> Option<&str> {
        Some(LOGIN_ACCOUNT)
    }

    fn create_node<'a>(
        &'a self,
        tag: &'a str,
        template: &'a Template,
    ) -> BackendFuture<'a, NodeMetadata, Self::Error> {
        Box::pin(async move { self.create(tag, template) })
    }

    fn list_nodes<'a>(
        &'a self,
        tag: Option<&'a str>,
    ) -> BackendFuture<'a, Vec<NodeMetadata>, Self::Error> {
        Box::pin(async move { self.list(tag) })
    }

    fn get_node<'a>(&'a self, id: &'a NodeId) -> BackendFuture<'a, NodeMetadata, Self::Error> {
        Box::pin(async move { self.get(id) })
    }

    fn reboot_node<'a>(&'a self, id: &'a NodeId) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.reboot(id) })
    }

    fn destroy_node<'a>(&'a self, id: &'a NodeId) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.destroy(id) })
    }

    fn list_images(&self) -> BackendFuture<'_, Vec<Image>, Self::Error> {
        Box::pin(async move { self.read_catalog(|catalog| catalog.images.clone()) })
    }

    fn list_sizes(&self) -> BackendFuture<'_, Vec<Size>, Self::Error> {
        Box::pin(async move { self.read_catalog(|catalog| catalog.sizes.clone()) })
    }

    fn list_assignable_locations(&self) -> BackendFuture<'_, Vec<Location>, Self::Error> {
        Box::pin(async move {
            self.read_catalog(|catalog| catalog.locations.iter().cloned().collect())
        })
    }
}

/// Catalog served by [`StubAccount::with_default_catalog`]: one region with
/// two zones, an Ubuntu and a `CentOS` image, and three sizes.
#[must_use]
pub fn default_catalog() -> Catalog {
    let provider = Location::provider(PROVIDER_NAME, "In-memory provider");
    let region = Location::child_of(&provider, "stub-region", LocationScope::Region, "Region");
    let zone_a = Location::child_of(&region, "stub-zone-a", LocationScope::Zone, "Zone A");
    let zone_b = Location::child_of(&region, "stub-zone-b", LocationScope::Zone, "Zone B");
    let locations = LocationRegistry::new([provider, region, zone_a, zone_b]).unwrap_or_default();

    let image = |id: &str, name: &str, version: &str| Image {
        id: ImageId::from(id),
        name: name.to_owned(),
        os_family: OsFamily::detect(name),
        os_description: name.to_owned(),
        architecture: String::from("x86_64"),
        version: version.to_owned(),
        location: None,
    };
    let size = |id: &str, cores: u32, ram_mb: u64, disk_gb: u64| Size {
        id: SizeId::from(id),
        cores,
        ram_mb,
        disk_gb,
        supported_architectures: vec![String::from("x86_64")],
    };

    Catalog {
        images: vec![
            image("ubuntu-22.04", "Ubuntu 22.04 LTS", "22.04"),
            image("centos-stream-9", "CentOS Stream 9", "9"),
        ],
        sizes: vec![
            size("stub.small", 1, 1024, 20),
            size("stub.medium", 2, 4096, 40),
            size("stub.large", 8, 16384, 160),
        ],
        locations,
    }
}
