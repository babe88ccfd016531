//! Test doubles shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, MutexGuard};

use crate::node::Credentials;
use crate::socket::{ProbeFuture, SocketProbe};
use crate::ssh::{
    CommandOutput, CommandRunner, ExecResponse, SshClientFactory, SshError, SshFuture, SshSession,
};
use crate::stub::StubAccount;

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<std::sync::Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<std::sync::Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SshError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| SshError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Something that happened on a [`ScriptedSshFactory`] session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SshEvent {
    /// A connection attempt.
    Connect {
        /// Target address.
        addr: SocketAddr,
        /// Login account.
        account: String,
        /// Whether the login was accepted.
        accepted: bool,
    },
    /// A command run on an open session.
    Exec {
        /// Target address.
        addr: SocketAddr,
        /// Command text.
        command: String,
    },
    /// A session being released.
    Disconnect {
        /// Target address.
        addr: SocketAddr,
    },
}

#[derive(Debug, Default)]
struct ScriptedSsh {
    rules: Vec<(String, ExecResponse)>,
    events: Vec<SshEvent>,
    unreachable: BTreeSet<IpAddr>,
}

/// Session factory whose logins are checked against a [`StubAccount`] and
/// whose command output is scripted by substring rules.
///
/// Rejected logins fail with a plain transport error whose message is
/// `Auth fail`, so callers must classify them by message.
#[derive(Clone, Debug)]
pub struct ScriptedSshFactory {
    account: Option<StubAccount>,
    state: Arc<std::sync::Mutex<ScriptedSsh>>,
}

impl ScriptedSshFactory {
    /// Creates a factory accepting only the credentials `account` issued.
    #[must_use]
    pub fn for_account(account: StubAccount) -> Self {
        Self {
            account: Some(account),
            state: Arc::default(),
        }
    }

    /// Creates a factory accepting any credentials.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            account: None,
            state: Arc::default(),
        }
    }

    /// Answers commands containing `needle` with `response`. Earlier rules
    /// win.
    pub fn respond_to(&self, needle: impl Into<String>, response: ExecResponse) {
        lock(&self.state).rules.push((needle.into(), response));
    }

    /// Makes connections to `ip` fail as unreachable.
    pub fn make_unreachable(&self, ip: IpAddr) {
        lock(&self.state).unreachable.insert(ip);
    }

    /// Snapshot of everything sessions have done so far.
    #[must_use]
    pub fn events(&self) -> Vec<SshEvent> {
        lock(&self.state).events.clone()
    }

    /// Commands executed against `addr`, in order.
    #[must_use]
    pub fn commands_for(&self, addr: IpAddr) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SshEvent::Exec { addr: target, command } if target.ip() == addr => Some(command),
                _ => None,
            })
            .collect()
    }
}

impl SshClientFactory for ScriptedSshFactory {
    type Session = ScriptedSshSession;

    fn create(&self, addr: SocketAddr, credentials: &Credentials) -> Self::Session {
        ScriptedSshSession {
            factory: self.clone(),
            addr,
            credentials: credentials.clone(),
            connected: false,
        }
    }
}

/// Session produced by [`ScriptedSshFactory`].
#[derive(Debug)]
pub struct ScriptedSshSession {
    factory: ScriptedSshFactory,
    addr: SocketAddr,
    credentials: Credentials,
    connected: bool,
}

impl ScriptedSshSession {
    fn try_connect(&mut self) -> Result<(), SshError> {
        let host = self.addr.to_string();
        let accepted = self.factory.account.as_ref().is_none_or(|account| {
            account.accepts_login(
                self.addr.ip(),
                &self.credentials.account,
                &self.credentials.key,
            )
        });
        let mut state = lock(&self.factory.state);
        if state.unreachable.contains(&self.addr.ip()) {
            return Err(SshError::Connect {
                host,
                message: String::from("Connection refused"),
            });
        }
        state.events.push(SshEvent::Connect {
            addr: self.addr,
            account: self.credentials.account.clone(),
            accepted,
        });
        if !accepted {
            return Err(SshError::Connect {
                host,
                message: String::from("Auth fail"),
            });
        }
        self.connected = true;
        Ok(())
    }

    fn try_exec(&self, command: &str) -> Result<ExecResponse, SshError> {
        if !self.connected {
            return Err(SshError::NotConnected {
                host: self.addr.to_string(),
            });
        }
        let mut state = lock(&self.factory.state);
        state.events.push(SshEvent::Exec {
            addr: self.addr,
            command: command.to_owned(),
        });
        let response = state
            .rules
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map_or_else(
                || ExecResponse {
                    exit_status: Some(0),
                    ..ExecResponse::default()
                },
                |(_, response)| response.clone(),
            );
        Ok(response)
    }
}

impl SshSession for ScriptedSshSession {
    fn connect(&mut self) -> SshFuture<'_, ()> {
        Box::pin(async move { self.try_connect() })
    }

    fn exec<'a>(&'a mut self, command: &'a str) -> SshFuture<'a, ExecResponse> {
        Box::pin(async move { self.try_exec(command) })
    }

    fn disconnect(&mut self) {
        self.connected = false;
        lock(&self.factory.state)
            .events
            .push(SshEvent::Disconnect { addr: self.addr });
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    opens_after: u32,
    closed: BTreeSet<IpAddr>,
    attempts: BTreeMap<SocketAddr, u32>,
}

/// Socket probe with scripted reachability.
#[derive(Clone, Debug, Default)]
pub struct ScriptedSocketProbe {
    state: Arc<std::sync::Mutex<ProbeState>>,
}

impl ScriptedSocketProbe {
    /// Probe reporting every socket open immediately.
    #[must_use]
    pub fn always_open() -> Self {
        Self::default()
    }

    /// Probe reporting each socket open from its `failures + 1`th attempt.
    #[must_use]
    pub fn opening_after(failures: u32) -> Self {
        let probe = Self::default();
        lock(&probe.state).opens_after = failures;
        probe
    }

    /// Keeps every port on `ip` closed.
    pub fn close(&self, ip: IpAddr) {
        lock(&self.state).closed.insert(ip);
    }

    /// Attempts made against `addr` so far.
    #[must_use]
    pub fn attempts(&self, addr: SocketAddr) -> u32 {
        lock(&self.state).attempts.get(&addr).copied().unwrap_or(0)
    }
}

impl SocketProbe for ScriptedSocketProbe {
    fn is_open(&self, addr: SocketAddr) -> ProbeFuture<'_> {
        let open = {
            let mut state = lock(&self.state);
            let opens_after = state.opens_after;
            let closed = state.closed.contains(&addr.ip());
            let seen = state.attempts.entry(addr).or_insert(0);
            *seen = seen.saturating_add(1);
            !closed && *seen > opens_after
        };
        Box::pin(async move { open })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
