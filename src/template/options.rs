//! Bootstrap and readiness options carried by a template.

use std::fmt;
use std::time::Duration;

use crate::node::Credentials;

/// Port a node must accept connections on before it is handed back.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PortWait {
    /// TCP port to probe.
    pub port: u16,
    /// Total time allowed for the port to open.
    pub timeout: Duration,
}

/// Immutable option set; every setter returns a new value.
///
/// Setting an option twice keeps the last value. Credentials overrides
/// replace each other wholesale.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct TemplateOptions {
    private_key: Option<String>,
    public_key: Option<String>,
    run_script: Option<String>,
    override_credentials: Option<Credentials>,
    block_on_port: Option<PortWait>,
    include_metadata: bool,
}

impl TemplateOptions {
    /// Creates an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `key` as the login private key on created nodes.
    #[must_use]
    pub fn install_private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    /// Authorises `key` for logins on created nodes.
    #[must_use]
    pub fn authorize_public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    /// Runs `script` on each node once it is reachable.
    #[must_use]
    pub fn run_script(mut self, script: impl Into<String>) -> Self {
        self.run_script = Some(script.into());
        self
    }

    /// Logs in with `credentials` instead of the node's own.
    #[must_use]
    pub fn override_credentials_with(mut self, credentials: Credentials) -> Self {
        self.override_credentials = Some(credentials);
        self
    }

    /// Waits up to `timeout` for `port` to open before returning a node.
    #[must_use]
    pub fn block_on_port(mut self, port: u16, timeout: Duration) -> Self {
        self.block_on_port = Some(PortWait { port, timeout });
        self
    }

    /// Asks the provider to attach descriptive metadata to nodes.
    #[must_use]
    pub fn with_metadata(mut self) -> Self {
        self.include_metadata = true;
        self
    }

    /// Private key to install, if any.
    #[must_use]
    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref()
    }

    /// Public key to authorise, if any.
    #[must_use]
    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    /// Script to run after boot, if any.
    #[must_use]
    pub fn script(&self) -> Option<&str> {
        self.run_script.as_deref()
    }

    /// Credentials override, if any.
    #[must_use]
    pub const fn override_credentials(&self) -> Option<&Credentials> {
        self.override_credentials.as_ref()
    }

    /// Port readiness requirement, if any.
    #[must_use]
    pub const fn port_wait(&self) -> Option<PortWait> {
        self.block_on_port
    }

    /// Whether provider metadata was requested.
    #[must_use]
    pub const fn includes_metadata(&self) -> bool {
        self.include_metadata
    }
}

impl fmt::Debug for TemplateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateOptions")
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("public_key", &self.public_key)
            .field("run_script", &self.run_script.as_ref().map(String::len))
            .field("override_credentials", &self.override_credentials)
            .field("block_on_port", &self.block_on_port)
            .field("include_metadata", &self.include_metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_return_new_values() {
        let base = TemplateOptions::new();
        let with_script = base.clone().run_script("echo hi");
        assert_eq!(base.script(), None);
        assert_eq!(with_script.script(), Some("echo hi"));
    }

    #[test]
    fn later_override_replaces_earlier() {
        let options = TemplateOptions::new()
            .override_credentials_with(Credentials::new("root", "one"))
            .override_credentials_with(Credentials::new("admin", "two"));
        assert_eq!(
            options.override_credentials(),
            Some(&Credentials::new("admin", "two"))
        );
    }

    #[test]
    fn options_compose() {
        let options = TemplateOptions::new()
            .install_private_key("PRIVATE")
            .authorize_public_key("PUBLIC")
            .block_on_port(22, Duration::from_secs(120))
            .with_metadata();
        assert_eq!(options.private_key(), Some("PRIVATE"));
        assert_eq!(options.public_key(), Some("PUBLIC"));
        assert_eq!(
            options.port_wait(),
            Some(PortWait {
                port: 22,
                timeout: Duration::from_secs(120)
            })
        );
        assert!(options.includes_metadata());
        assert!(!format!("{options:?}").contains("PRIVATE"));
    }
}
