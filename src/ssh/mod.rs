//! Remote session transport.
//!
//! [`SshClientFactory`] and [`SshSession`] are the contract the script
//! executor drives. [`SystemSshFactory`] fulfils it by invoking the OpenSSH
//! client through a [`CommandRunner`], one process per command.

mod command;
mod config;
mod system;

use std::error::Error as StdError;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use thiserror::Error;

use crate::node::Credentials;

pub use command::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{SshConfig, SshConfigError};
pub use system::{SystemSshFactory, SystemSshSession};

/// Root-cause fragments that identify rejected credentials.
pub const AUTH_FAILURE_MARKERS: [&str; 4] = [
    "Auth fail",
    "Permission denied",
    "Too many authentication failures",
    "authentication failed",
];

/// Future returned by session operations.
pub type SshFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SshError>> + Send + 'a>>;

/// Captured result of a remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecResponse {
    /// Standard output, verbatim.
    pub output: String,
    /// Standard error, verbatim.
    pub error: String,
    /// Exit status, when the remote side reported one.
    pub exit_status: Option<i32>,
}

impl ExecResponse {
    /// Returns `true` when stdout or stderr contains `marker`.
    #[must_use]
    pub fn contains(&self, marker: &str) -> bool {
        self.output.contains(marker) || self.error.contains(marker)
    }
}

/// Errors raised by session transports.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when the remote host cannot be reached.
    #[error("cannot connect to {host}: {message}")]
    Connect {
        /// Target address.
        host: String,
        /// Transport diagnostic.
        message: String,
    },
    /// Raised when the remote host rejects the credentials.
    #[error("{account}@{host} rejected: {message}")]
    Auth {
        /// Login account.
        account: String,
        /// Target address.
        host: String,
        /// Transport diagnostic.
        message: String,
    },
    /// Raised when a command is issued on a session that is not connected.
    #[error("session to {host} is not connected")]
    NotConnected {
        /// Target address.
        host: String,
    },
    /// Raised when the local client process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the private key cannot be staged for the client.
    #[error("cannot stage private key: {message}")]
    KeyFile {
        /// I/O error string.
        message: String,
    },
}

impl SshError {
    /// Returns `true` when this error, or its root cause, reports rejected
    /// credentials.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Auth { .. }) || is_auth_failure(&root_cause(self).to_string())
    }
}

/// Returns `true` when `message` contains any [`AUTH_FAILURE_MARKERS`] entry.
#[must_use]
pub fn is_auth_failure(message: &str) -> bool {
    AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Follows `source()` links to the innermost error.
#[must_use]
pub fn root_cause<'a>(err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current
}

/// One login session on a remote host.
pub trait SshSession: Send {
    /// Opens the session.
    fn connect(&mut self) -> SshFuture<'_, ()>;

    /// Runs `command` and captures its output.
    fn exec<'a>(&'a mut self, command: &'a str) -> SshFuture<'a, ExecResponse>;

    /// Releases the session. Safe to call more than once.
    fn disconnect(&mut self);
}

/// Creates sessions for a host and login.
pub trait SshClientFactory: Send + Sync {
    /// Session type produced by the factory.
    type Session: SshSession;

    /// Prepares a session to `addr` as `credentials.account`, authenticating
    /// with `credentials.key`. No connection is made until
    /// [`SshSession::connect`].
    fn create(&self, addr: SocketAddr, credentials: &Credentials) -> Self::Session;
}
