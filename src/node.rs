//! Node metadata and the node lifecycle state machine.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use crate::types::{ImageId, LocationId, NodeId};

/// Lifecycle state of a node as seen by callers.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum NodeState {
    /// Requested but not yet usable (booting or rebooting).
    Pending,
    /// Booted and reachable.
    Running,
    /// Destroyed; final.
    Terminated,
    /// The provider reported an unrecoverable failure.
    Error,
    /// The provider reported something that cannot be classified.
    Unknown,
}

impl NodeState {
    /// Classifies a provider state string.
    ///
    /// The vocabulary covers the common spellings used by EC2-like and
    /// VPS-like APIs; anything else is [`NodeState::Unknown`].
    #[must_use]
    pub fn from_provider(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "starting" | "booting" | "provisioning" | "rebooting" | "building"
            | "new" => Self::Pending,
            "running" | "active" | "on" | "ready" => Self::Running,
            "terminated" | "deleted" | "destroyed" | "terminating" | "shutting-down" => {
                Self::Terminated
            }
            "error" | "failed" | "locked" | "crashed" => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// Returns `true` for [`NodeState::Terminated`].
    #[must_use]
    pub const fn is_terminated(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Returns `true` once no further progress is expected without caller
    /// action.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Running | Self::Terminated | Self::Error)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Terminated, Self::Terminated) => true,
            (Self::Terminated, _) => false,
            (_, Self::Unknown) | (Self::Unknown, _) => true,
            (Self::Pending, Self::Pending | Self::Running | Self::Error | Self::Terminated)
            | (Self::Running, Self::Running | Self::Pending | Self::Error | Self::Terminated)
            | (Self::Error, Self::Error | Self::Terminated) => true,
            (Self::Error, Self::Pending | Self::Running) => false,
        }
    }

    /// Upper-case name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Terminated => "TERMINATED",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Login material for a node.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Credentials {
    /// Login account, for example `root`.
    pub account: String,
    /// Password or private key text.
    pub key: String,
}

impl Credentials {
    /// Creates credentials.
    #[must_use]
    pub fn new(account: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            key: key.into(),
        }
    }

    /// Returns `true` when both halves are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.account.trim().is_empty() && !self.key.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Errors raised when a node record breaks its invariants.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NodeError {
    /// Raised when a running node exposes no address.
    #[error("running node {id} has no public or private address")]
    Unreachable {
        /// Node identifier.
        id: NodeId,
    },
    /// Raised when credentials carry only one of account and key.
    #[error("node {id} has incomplete credentials")]
    IncompleteCredentials {
        /// Node identifier.
        id: NodeId,
    },
    /// Raised when a state change is not permitted.
    #[error("node {id} cannot move from {from} to {to}")]
    IllegalTransition {
        /// Node identifier.
        id: NodeId,
        /// Current state.
        from: NodeState,
        /// Requested state.
        to: NodeState,
    },
}

/// Provider view of a node.
///
/// Records order by identifier so node sets are stable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeMetadata {
    /// Provider-unique identifier.
    pub id: NodeId,
    /// Batch identity shared by nodes created together.
    pub tag: String,
    /// Provider-side display name.
    pub name: String,
    /// Current lifecycle state.
    pub state: NodeState,
    /// Image the node was created from.
    pub image: ImageId,
    /// Placement of the node.
    pub location: LocationId,
    /// Publicly routable addresses.
    pub public_addresses: BTreeSet<IpAddr>,
    /// Provider-internal addresses.
    pub private_addresses: BTreeSet<IpAddr>,
    /// Login material reported at creation, when known.
    pub credentials: Option<Credentials>,
    /// Descriptive key/value pairs attached at creation.
    pub user_metadata: BTreeMap<String, String>,
}

impl NodeMetadata {
    /// Address used to reach the node: the first public address, else the
    /// first private one.
    #[must_use]
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.public_addresses
            .iter()
            .chain(self.private_addresses.iter())
            .next()
            .copied()
    }

    /// Returns `true` when the node exposes at least one address.
    #[must_use]
    pub fn has_address(&self) -> bool {
        !self.public_addresses.is_empty() || !self.private_addresses.is_empty()
    }

    /// Checks the running-node and credential invariants.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Unreachable`] for an address-less running node
    /// and [`NodeError::IncompleteCredentials`] for half-filled credentials.
    pub fn check_invariants(&self) -> Result<(), NodeError> {
        if self.state == NodeState::Running && !self.has_address() {
            return Err(NodeError::Unreachable {
                id: self.id.clone(),
            });
        }
        if self
            .credentials
            .as_ref()
            .is_some_and(|credentials| !credentials.is_complete())
        {
            return Err(NodeError::IncompleteCredentials {
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Moves the node to `next`, refusing illegal transitions.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::IllegalTransition`] when the state machine does
    /// not allow the move.
    pub fn transition_to(&mut self, next: NodeState) -> Result<(), NodeError> {
        if !self.state.can_transition_to(next) {
            return Err(NodeError::IllegalTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

impl PartialOrd for NodeMetadata {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeMetadata {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.tag.cmp(&other.tag))
            .then_with(|| self.state.cmp(&other.state))
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.image.cmp(&other.image))
            .then_with(|| self.location.cmp(&other.location))
            .then_with(|| self.public_addresses.cmp(&other.public_addresses))
            .then_with(|| self.private_addresses.cmp(&other.private_addresses))
            .then_with(|| {
                let key = |node: &Self| {
                    node.credentials
                        .as_ref()
                        .map(|credentials| (credentials.account.clone(), credentials.key.clone()))
                };
                key(self).cmp(&key(other))
            })
    }
}

/// Matches running nodes carrying `tag`.
#[must_use]
pub fn running_in_tag(tag: &str) -> impl Fn(&NodeMetadata) -> bool + '_ {
    move |node| node.state == NodeState::Running && node.tag == tag
}

/// Matches nodes that have not been destroyed.
#[must_use]
pub fn not_terminated() -> impl Fn(&NodeMetadata) -> bool {
    |node| !node.state.is_terminated()
}
