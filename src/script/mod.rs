//! Remote script execution.
//!
//! Each node goes through `AWAIT_SOCKET → CONNECTING → EXECUTING` and ends in
//! `DONE`, `AUTH_FAILED` or `TRANSPORT_FAILED`. Batches run nodes
//! concurrently; one node failing never affects its siblings. Execution only
//! reads node records, it never updates them.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use futures::future::join_all;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::node::{Credentials, NodeMetadata};
use crate::retry::{BoundedRetry, RetryablePredicate};
use crate::socket::{SocketProbe, wait_for_socket};
use crate::ssh::{ExecResponse, SshClientFactory, SshError, SshSession};
use crate::types::NodeId;

/// Port scripts are delivered over unless overridden.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Progress of one node through script execution.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ExecutionStage {
    /// Waiting for the login port to accept connections.
    AwaitSocket,
    /// Opening the session.
    Connecting,
    /// Uploading and running the script.
    Executing,
    /// Finished; output captured.
    Done,
    /// Credentials were rejected.
    AuthFailed,
    /// The node could not be reached or the session broke.
    TransportFailed,
}

impl ExecutionStage {
    /// Upper-case stage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AwaitSocket => "AWAIT_SOCKET",
            Self::Connecting => "CONNECTING",
            Self::Executing => "EXECUTING",
            Self::Done => "DONE",
            Self::AuthFailed => "AUTH_FAILED",
            Self::TransportFailed => "TRANSPORT_FAILED",
        }
    }
}

impl fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call execution options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunScriptOptions {
    override_credentials: Option<Credentials>,
    private_key: Option<String>,
    fallback_account: Option<String>,
    port: u16,
    socket_wait: RetryablePredicate,
}

impl Default for RunScriptOptions {
    fn default() -> Self {
        Self {
            override_credentials: None,
            private_key: None,
            fallback_account: None,
            port: DEFAULT_SSH_PORT,
            socket_wait: RetryablePredicate::socket_default(),
        }
    }
}

impl RunScriptOptions {
    /// Options with the default port and socket policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs in with `credentials` for this call only.
    #[must_use]
    pub fn override_credentials_with(mut self, credentials: Credentials) -> Self {
        self.override_credentials = Some(credentials);
        self
    }

    /// Authenticates with `key` under the node's own account.
    #[must_use]
    pub fn private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    /// Logs in as `account` on nodes whose record carries no credentials,
    /// such as nodes created by another client.
    #[must_use]
    pub fn fallback_account_of(mut self, account: impl Into<String>) -> Self {
        self.fallback_account = Some(account.into());
        self
    }

    /// Account used for nodes without credentials, if any.
    #[must_use]
    pub fn fallback_account(&self) -> Option<&str> {
        self.fallback_account.as_deref()
    }

    /// Connects to `port` instead of 22.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Replaces the socket readiness policy.
    #[must_use]
    pub fn socket_wait(mut self, policy: RetryablePredicate) -> Self {
        self.socket_wait = policy;
        self
    }

    /// Target port.
    #[must_use]
    pub const fn target_port(&self) -> u16 {
        self.port
    }

    /// Resolves the login for `node`.
    ///
    /// An override supplies both account and key. Otherwise the node's
    /// account (or the fallback account when the node has none) is used with
    /// the configured private key, falling back to the node's own key.
    /// Returns `None` when no complete login can be formed.
    #[must_use]
    pub fn credentials_for(&self, node: &NodeMetadata) -> Option<Credentials> {
        if let Some(credentials) = self.override_credentials.as_ref() {
            return Some(credentials.clone()).filter(Credentials::is_complete);
        }
        let own = node.credentials.as_ref();
        let account = own
            .map(|credentials| credentials.account.as_str())
            .or(self.fallback_account.as_deref())?;
        let key = self
            .private_key
            .as_deref()
            .or_else(|| own.map(|credentials| credentials.key.as_str()))?;
        Some(Credentials::new(account, key)).filter(Credentials::is_complete)
    }
}

/// Why a node's execution ended early.
#[derive(Debug, Error)]
pub enum ScriptFailure {
    /// Raised when the node exposes no address.
    #[error("node {node} has no address")]
    NoAddress {
        /// Target node.
        node: NodeId,
    },
    /// Raised when the login port never opened within the budget.
    #[error("port {} on node {node} did not open in time", .addr.port())]
    SocketTimeout {
        /// Target node.
        node: NodeId,
        /// Address probed.
        addr: SocketAddr,
    },
    /// Raised when neither the node nor the options provide a login.
    #[error("node {node} has no credentials to log in with")]
    MissingCredentials {
        /// Target node.
        node: NodeId,
    },
    /// Raised when the node rejects the credentials.
    #[error("authentication to node {node} failed")]
    AuthFailed {
        /// Target node.
        node: NodeId,
        /// Transport error reporting the rejection.
        #[source]
        source: SshError,
    },
    /// Raised for any other transport failure.
    #[error("transport to node {node} failed while {stage}")]
    Transport {
        /// Target node.
        node: NodeId,
        /// Stage the failure happened in.
        stage: ExecutionStage,
        /// Underlying transport error.
        #[source]
        source: SshError,
    },
    /// Raised when the script could not be written to the node.
    #[error("upload of {path} to node {node} exited with {status:?}: {error}")]
    UploadRejected {
        /// Target node.
        node: NodeId,
        /// Remote path written.
        path: String,
        /// Exit status of the upload command.
        status: Option<i32>,
        /// Standard error of the upload command.
        error: String,
    },
    /// Raised by verification when the expected marker never shows up.
    #[error("output of `{command}` on node {node} never contained {marker:?}")]
    MarkerMissing {
        /// Target node.
        node: NodeId,
        /// Command that was run.
        command: String,
        /// Text that was expected.
        marker: String,
        /// Last response received.
        last: ExecResponse,
    },
}

impl ScriptFailure {
    /// Node the failure belongs to.
    #[must_use]
    pub const fn node(&self) -> &NodeId {
        match self {
            Self::NoAddress { node }
            | Self::SocketTimeout { node, .. }
            | Self::MissingCredentials { node }
            | Self::AuthFailed { node, .. }
            | Self::Transport { node, .. }
            | Self::UploadRejected { node, .. }
            | Self::MarkerMissing { node, .. } => node,
        }
    }

    /// Terminal stage the node ended in.
    #[must_use]
    pub const fn stage(&self) -> ExecutionStage {
        match self {
            Self::AuthFailed { .. } => ExecutionStage::AuthFailed,
            _ => ExecutionStage::TransportFailed,
        }
    }

    /// Returns `true` for rejected credentials.
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthFailed { .. })
    }

    fn from_transport(node: &NodeId, stage: ExecutionStage, source: SshError) -> Self {
        if source.is_auth_failure() {
            Self::AuthFailed {
                node: node.clone(),
                source,
            }
        } else {
            Self::Transport {
                node: node.clone(),
                stage,
                source,
            }
        }
    }
}

/// Results of a batch, keyed by node.
pub type ScriptResults = BTreeMap<NodeId, Result<ExecResponse, ScriptFailure>>;

/// Drives scripts onto nodes through a session factory.
#[derive(Clone, Debug)]
pub struct ScriptExecutor<F, P> {
    factory: F,
    probe: P,
}

impl<F: SshClientFactory, P: SocketProbe> ScriptExecutor<F, P> {
    /// Creates an executor using `factory` for sessions and `probe` for
    /// socket readiness.
    #[must_use]
    pub const fn new(factory: F, probe: P) -> Self {
        Self { factory, probe }
    }

    /// Session factory in use.
    #[must_use]
    pub const fn factory(&self) -> &F {
        &self.factory
    }

    /// Socket probe in use.
    #[must_use]
    pub const fn probe(&self) -> &P {
        &self.probe
    }

    async fn open_session(
        &self,
        node: &NodeMetadata,
        options: &RunScriptOptions,
    ) -> Result<F::Session, ScriptFailure> {
        let ip = node.primary_address().ok_or_else(|| ScriptFailure::NoAddress {
            node: node.id.clone(),
        })?;
        let addr = SocketAddr::new(ip, options.port);

        debug!(node = %node.id, %addr, stage = %ExecutionStage::AwaitSocket, "waiting for socket");
        if !wait_for_socket(&self.probe, addr, &options.socket_wait).await {
            return Err(ScriptFailure::SocketTimeout {
                node: node.id.clone(),
                addr,
            });
        }

        let credentials =
            options
                .credentials_for(node)
                .ok_or_else(|| ScriptFailure::MissingCredentials {
                    node: node.id.clone(),
                })?;
        debug!(node = %node.id, account = %credentials.account, stage = %ExecutionStage::Connecting, "connecting");
        let mut session = self.factory.create(addr, &credentials);
        if let Err(err) = session.connect().await {
            session.disconnect();
            return Err(ScriptFailure::from_transport(
                &node.id,
                ExecutionStage::Connecting,
                err,
            ));
        }
        Ok(session)
    }

    async fn upload_and_run(
        session: &mut F::Session,
        node: &NodeId,
        script: &str,
    ) -> Result<ExecResponse, ScriptFailure> {
        let path = format!("/tmp/cumulus-{}.sh", Uuid::new_v4().simple());
        let upload = session
            .exec(&upload_command(&path, script))
            .await
            .map_err(|err| ScriptFailure::from_transport(node, ExecutionStage::Executing, err))?;
        if upload.exit_status != Some(0) {
            return Err(ScriptFailure::UploadRejected {
                node: node.clone(),
                path,
                status: upload.exit_status,
                error: upload.error,
            });
        }
        session
            .exec(&run_command(&path))
            .await
            .map_err(|err| ScriptFailure::from_transport(node, ExecutionStage::Executing, err))
    }

    /// Uploads `script` to a unique path under `/tmp` on `node` and runs it.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptFailure::AuthFailed`] when the login is rejected and
    /// another [`ScriptFailure`] for every other way the node can fail.
    pub async fn run_on_node(
        &self,
        node: &NodeMetadata,
        script: &str,
        options: &RunScriptOptions,
    ) -> Result<ExecResponse, ScriptFailure> {
        let mut session = self.open_session(node, options).await?;
        debug!(node = %node.id, stage = %ExecutionStage::Executing, "running script");
        let outcome = Self::upload_and_run(&mut session, &node.id, script).await;
        session.disconnect();
        log_outcome(&node.id, &outcome);
        outcome
    }

    /// Runs `command` on `node` as-is, without uploading anything.
    ///
    /// # Errors
    ///
    /// As for [`ScriptExecutor::run_on_node`].
    pub async fn exec_on_node(
        &self,
        node: &NodeMetadata,
        command: &str,
        options: &RunScriptOptions,
    ) -> Result<ExecResponse, ScriptFailure> {
        let mut session = self.open_session(node, options).await?;
        let outcome = session
            .exec(command)
            .await
            .map_err(|err| ScriptFailure::from_transport(&node.id, ExecutionStage::Executing, err));
        session.disconnect();
        log_outcome(&node.id, &outcome);
        outcome
    }

    /// Runs `script` on every node concurrently.
    pub async fn run_on_nodes(
        &self,
        nodes: &[NodeMetadata],
        script: &str,
        options: &RunScriptOptions,
    ) -> ScriptResults {
        join_all(nodes.iter().map(|node| async move {
            let outcome = self.run_on_node(node, script, options).await;
            (node.id.clone(), outcome)
        }))
        .await
        .into_iter()
        .collect()
    }

    /// Runs `command` until its output contains `marker`, under `retry`.
    ///
    /// # Errors
    ///
    /// Returns the failure of the last attempt, which is
    /// [`ScriptFailure::MarkerMissing`] when the command ran but never
    /// printed the marker.
    pub async fn verify(
        &self,
        node: &NodeMetadata,
        command: &str,
        marker: &str,
        options: &RunScriptOptions,
        retry: &BoundedRetry,
    ) -> Result<ExecResponse, ScriptFailure> {
        retry
            .run(|attempt| async move {
                debug!(node = %node.id, attempt, command, "verifying node");
                let response = self.exec_on_node(node, command, options).await?;
                if response.contains(marker) {
                    Ok(response)
                } else {
                    Err(ScriptFailure::MarkerMissing {
                        node: node.id.clone(),
                        command: command.to_owned(),
                        marker: marker.to_owned(),
                        last: response,
                    })
                }
            })
            .await
    }
}

fn log_outcome(node: &NodeId, outcome: &Result<ExecResponse, ScriptFailure>) {
    match outcome {
        Ok(response) => {
            debug!(node = %node, stage = %ExecutionStage::Done, exit = ?response.exit_status, "script finished");
        }
        Err(failure) => {
            warn!(node = %node, stage = %failure.stage(), error = %failure, "script failed");
        }
    }
}

/// Shell command running the script at `path`, removing it afterwards and
/// exiting with the script's status.
#[must_use]
pub fn run_command(path: &str) -> String {
    let escaped = escape(path.into());
    format!("/bin/sh {escaped}; status=$?; rm -f {escaped}; exit $status")
}

/// Shell command writing `script` to `path` and marking it executable.
#[must_use]
pub fn upload_command(path: &str, script: &str) -> String {
    let delimiter = format!("CUMULUS_EOF_{}", Uuid::new_v4().simple());
    let escaped = escape(path.into());
    let body = script.strip_suffix('\n').unwrap_or(script);
    format!("cat > {escaped} <<'{delimiter}'\n{body}\n{delimiter}\nchmod 0755 {escaped}")
}

#[cfg(test)]
mod tests;
