//! Provider capability interface.
//!
//! Every cloud adapter implements [`ComputeBackend`]. The orchestrator only
//! depends on this trait, so adapters can be swapped (or stubbed) freely.
//! Adapters own the mapping from tag to node identifiers.

use std::future::Future;
use std::pin::Pin;

use futures::future::join_all;

use crate::location::Location;
use crate::node::NodeMetadata;
use crate::template::{Image, Size, Template};
use crate::types::NodeId;

/// Future returned by fallible backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Future returned by batch operations that keep per-node results.
pub type BatchFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-node results of a batch operation, keyed by node.
pub type NodeResults<E> = Vec<(NodeId, Result<(), E>)>;

/// How the orchestrator should treat a provider failure.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FailureKind {
    /// Credentials were rejected; fatal for the operation.
    Authorization,
    /// The target does not exist (any more).
    NotFound,
    /// The provider does not implement the operation.
    Unsupported,
    /// A retry may succeed.
    Transient,
    /// Anything else.
    Fatal,
}

/// Error type that can report its [`FailureKind`].
pub trait ClassifiedError: std::error::Error + Send + Sync + 'static {
    /// Classifies the failure.
    fn kind(&self) -> FailureKind;
}

/// Operations a cloud provider adapter must supply.
pub trait ComputeBackend: Send + Sync {
    /// Provider specific error type.
    type Error: ClassifiedError;

    /// Short provider name used in logs.
    fn provider_name(&self) -> &str;

    /// Account images of this provider log in with, used when a node record
    /// carries no credentials of its own.
    fn default_login_account(&self) -> Option<&str> {
        None
    }

    /// Creates one node carrying `tag` from `template`.
    fn create_node<'a>(
        &'a self,
        tag: &'a str,
        template: &'a Template,
    ) -> BackendFuture<'a, NodeMetadata, Self::Error>;

    /// Lists nodes, restricted to `tag` when given.
    fn list_nodes<'a>(
        &'a self,
        tag: Option<&'a str>,
    ) -> BackendFuture<'a, Vec<NodeMetadata>, Self::Error>;

    /// Fetches the current view of one node.
    fn get_node<'a>(&'a self, id: &'a NodeId) -> BackendFuture<'a, NodeMetadata, Self::Error>;

    /// Requests a reboot; the node passes through a pending state.
    fn reboot_node<'a>(&'a self, id: &'a NodeId) -> BackendFuture<'a, (), Self::Error>;

    /// Requests destruction of the node.
    fn destroy_node<'a>(&'a self, id: &'a NodeId) -> BackendFuture<'a, (), Self::Error>;

    /// Lists bootable images.
    fn list_images(&self) -> BackendFuture<'_, Vec<Image>, Self::Error>;

    /// Lists hardware profiles.
    fn list_sizes(&self) -> BackendFuture<'_, Vec<Size>, Self::Error>;

    /// Lists locations nodes can be placed in, parents included.
    fn list_assignable_locations(&self) -> BackendFuture<'_, Vec<Location>, Self::Error>;

    /// Creates `count` nodes concurrently, keeping each creation result.
    fn create_nodes<'a>(
        &'a self,
        tag: &'a str,
        count: usize,
        template: &'a Template,
    ) -> BatchFuture<'a, Vec<Result<NodeMetadata, Self::Error>>> {
        Box::pin(join_all((0..count).map(move |_| self.create_node(tag, template))))
    }

    /// Reboots every non-terminated node carrying `tag`.
    fn reboot_nodes<'a>(
        &'a self,
        tag: &'a str,
    ) -> BackendFuture<'a, NodeResults<Self::Error>, Self::Error> {
        Box::pin(async move {
            let targets = live_node_ids(self.list_nodes(Some(tag)).await?);
            Ok(join_all(targets.into_iter().map(|id| async move {
                let outcome = self.reboot_node(&id).await;
                (id, outcome)
            }))
            .await)
        })
    }

    /// Destroys every non-terminated node carrying `tag`.
    fn destroy_nodes<'a>(
        &'a self,
        tag: &'a str,
    ) -> BackendFuture<'a, NodeResults<Self::Error>, Self::Error> {
        Box::pin(async move {
            let targets = live_node_ids(self.list_nodes(Some(tag)).await?);
            Ok(join_all(targets.into_iter().map(|id| async move {
                let outcome = self.destroy_node(&id).await;
                (id, outcome)
            }))
            .await)
        })
    }
}

fn live_node_ids(nodes: Vec<NodeMetadata>) -> Vec<NodeId> {
    nodes
        .into_iter()
        .filter(|node| !node.state.is_terminated())
        .map(|node| node.id)
        .collect()
}
