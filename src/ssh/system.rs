//! Session transport backed by the OpenSSH client binary.

use std::ffi::OsString;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::debug;

use super::{
    CommandOutput, CommandRunner, ExecResponse, ProcessCommandRunner, SshClientFactory, SshConfig,
    SshConfigError, SshError, SshFuture, SshSession, is_auth_failure,
};
use crate::node::Credentials;

/// Exit status OpenSSH reserves for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Factory producing [`SystemSshSession`]s.
#[derive(Clone, Debug)]
pub struct SystemSshFactory<R: CommandRunner> {
    config: Arc<SshConfig>,
    runner: R,
}

impl SystemSshFactory<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::MissingField`] when validation fails.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, SshConfigError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner + Clone + 'static> SystemSshFactory<R> {
    /// Creates a factory running the client through `runner`.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::MissingField`] when validation fails.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, SshConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            runner,
        })
    }
}

impl<R: CommandRunner + Clone + 'static> SshClientFactory for SystemSshFactory<R> {
    type Session = SystemSshSession<R>;

    fn create(&self, addr: SocketAddr, credentials: &Credentials) -> Self::Session {
        SystemSshSession {
            config: Arc::clone(&self.config),
            runner: self.runner.clone(),
            addr,
            credentials: credentials.clone(),
            key_file: None,
        }
    }
}

/// One login to a host; every command spawns a fresh `ssh` process.
///
/// The private key is staged in a mode `0600` temporary file while the
/// session is connected.
#[derive(Debug)]
pub struct SystemSshSession<R: CommandRunner> {
    config: Arc<SshConfig>,
    runner: R,
    addr: SocketAddr,
    credentials: Credentials,
    key_file: Option<NamedTempFile>,
}

impl<R: CommandRunner + Clone + 'static> SystemSshSession<R> {
    fn stage_key(&self) -> Result<NamedTempFile, SshError> {
        let to_error = |err: std::io::Error| SshError::KeyFile {
            message: err.to_string(),
        };
        let mut file = NamedTempFile::new().map_err(to_error)?;
        file.write_all(self.credentials.key.as_bytes())
            .map_err(to_error)?;
        if !self.credentials.key.ends_with('\n') {
            file.write_all(b"\n").map_err(to_error)?;
        }
        file.flush().map_err(to_error)?;
        Ok(file)
    }

    fn build_args(&self, key_path: OsString, remote_command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.addr.port().to_string()),
            OsString::from("-i"),
            key_path,
            OsString::from("-o"),
            OsString::from("IdentitiesOnly=yes"),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout_secs
            )),
        ];

        if self.config.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.known_hosts_file
            )));
        }

        args.push(OsString::from(format!(
            "{}@{}",
            self.credentials.account,
            self.addr.ip()
        )));
        args.push(OsString::from(remote_command));
        args
    }

    async fn run_ssh(&self, remote_command: &str) -> Result<CommandOutput, SshError> {
        let key_path = self
            .key_file
            .as_ref()
            .map(|file| file.path().as_os_str().to_owned())
            .ok_or_else(|| SshError::NotConnected {
                host: self.addr.to_string(),
            })?;
        let args = self.build_args(key_path, remote_command);
        let runner = self.runner.clone();
        let program = self.config.ssh_bin.clone();
        tokio::task::spawn_blocking(move || runner.run(&program, &args))
            .await
            .map_err(|err| SshError::Spawn {
                program: self.config.ssh_bin.clone(),
                message: err.to_string(),
            })?
    }

    fn classify(&self, output: CommandOutput) -> Result<ExecResponse, SshError> {
        if output.code == Some(SSH_TRANSPORT_FAILURE) {
            let message = output.stderr.trim().to_owned();
            let host = self.addr.to_string();
            return Err(if is_auth_failure(&message) {
                SshError::Auth {
                    account: self.credentials.account.clone(),
                    host,
                    message,
                }
            } else {
                SshError::Connect { host, message }
            });
        }
        Ok(ExecResponse::from(output))
    }
}

impl<R: CommandRunner + Clone + 'static> SshSession for SystemSshSession<R> {
    fn connect(&mut self) -> SshFuture<'_, ()> {
        Box::pin(async move {
            if self.key_file.is_none() {
                self.key_file = Some(self.stage_key()?);
            }
            debug!(host = %self.addr, account = %self.credentials.account, "opening ssh session");
            let probe = self.run_ssh("true").await;
            match probe.and_then(|output| self.classify(output)) {
                Ok(_) => Ok(()),
                Err(err) => {
                    self.disconnect();
                    Err(err)
                }
            }
        })
    }

    fn exec<'a>(&'a mut self, command: &'a str) -> SshFuture<'a, ExecResponse> {
        Box::pin(async move {
            let output = self.run_ssh(command).await?;
            self.classify(output)
        })
    }

    fn disconnect(&mut self) {
        self.key_file = None;
    }
}
