//! Core library for provisioning and managing compute nodes across cloud
//! providers.
//!
//! Callers resolve a [`Template`] (image, size, location and bootstrap
//! options) from a provider catalog, then ask a [`ComputeService`] for a
//! tagged batch of nodes. The service drives every node through the
//! lifecycle (create → wait until running → wait for the port → run the
//! bootstrap script) and keeps per-node outcomes so one failing node does not
//! sink its siblings. Providers plug in through [`ComputeBackend`]; an
//! in-memory provider and a Scaleway adapter ship with the crate.

pub mod backend;
pub mod compute;
pub mod config;
pub mod location;
pub mod node;
pub mod retry;
pub mod scaleway;
pub mod script;
pub mod socket;
pub mod ssh;
pub mod stub;
pub mod template;
pub mod test_support;
pub mod types;

pub use backend::{ClassifiedError, ComputeBackend, FailureKind};
pub use compute::{
    BatchOutcome, ComputeError, ComputeService, ComputeSettings, CreateNodesOutcome, NodeFailure,
    ScriptReport,
};
pub use config::{ComputeConfig, ConfigError, ScalewayConfig};
pub use location::{Location, LocationError, LocationRegistry, LocationScope};
pub use node::{Credentials, NodeError, NodeMetadata, NodeState, not_terminated, running_in_tag};
pub use retry::{BoundedRetry, RetryablePredicate};
pub use scaleway::{ScalewayBackend, ScalewayBackendError};
pub use script::{ExecutionStage, RunScriptOptions, ScriptExecutor, ScriptFailure};
pub use socket::{SocketProbe, TcpSocketProbe};
pub use ssh::{ExecResponse, SshClientFactory, SshConfig, SshError, SshSession, SystemSshFactory};
pub use stub::{StubAccount, StubBackend, StubError};
pub use template::{
    Catalog, Image, OsFamily, Size, Template, TemplateBuilder, TemplateError, TemplateOptions,
    bootstrap_script,
};
pub use types::{ImageId, LocationId, NodeId, SizeId};
