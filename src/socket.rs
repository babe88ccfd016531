//! Socket reachability probes.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::retry::RetryablePredicate;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Future returned by [`SocketProbe::is_open`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Boolean test reporting whether a socket accepts connections.
pub trait SocketProbe: Send + Sync {
    /// Returns `true` when a connection to `addr` can be opened right now.
    fn is_open(&self, addr: SocketAddr) -> ProbeFuture<'_>;
}

impl<P: SocketProbe + ?Sized> SocketProbe for std::sync::Arc<P> {
    fn is_open(&self, addr: SocketAddr) -> ProbeFuture<'_> {
        (**self).is_open(addr)
    }
}

/// Probe that attempts a TCP connection and drops it immediately.
#[derive(Clone, Copy, Debug)]
pub struct TcpSocketProbe {
    connect_timeout: Duration,
}

impl TcpSocketProbe {
    /// Creates a probe with the default two second connect timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Overrides the per-attempt connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for TcpSocketProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketProbe for TcpSocketProbe {
    fn is_open(&self, addr: SocketAddr) -> ProbeFuture<'_> {
        Box::pin(async move {
            let connect = timeout(self.connect_timeout, TcpStream::connect(addr)).await;
            matches!(connect, Ok(Ok(_)))
        })
    }
}

/// Polls `probe` for `addr` under `policy`, returning whether it opened.
pub async fn wait_for_socket<P: SocketProbe + ?Sized>(
    probe: &P,
    addr: SocketAddr,
    policy: &RetryablePredicate,
) -> bool {
    policy
        .apply(&addr, |target| probe.is_open(*target))
        .await
}
