//! Settings for the system `ssh` transport.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::config::FieldMetadata;

/// OpenSSH client settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CUMULUS_SSH",
    discovery(
        app_name = "cumulus",
        env_var = "CUMULUS_CONFIG_PATH",
        config_file_name = "cumulus.toml",
        dotfile_name = ".cumulus.toml",
        project_file_name = "cumulus.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Whether to force batch mode so the client never prompts.
    #[ortho_config(default = true)]
    pub batch_mode: bool,
    /// Whether to enforce host key checking; off by default because nodes
    /// are freshly created.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file; `/dev/null` keeps throwaway hosts out of the
    /// user's file.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
    /// Seconds the client may spend establishing a connection.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
}

impl SshConfig {
    /// Built-in settings, identical to what loading yields with no sources.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            connect_timeout_secs: 10,
        }
    }
}

/// Errors raised when SSH settings are unusable.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshConfigError {
    /// Raised when a required value is blank.
    #[error("{0}")]
    MissingField(String),
    /// Raised when layered sources cannot be merged.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl SshConfig {
    /// Loads settings from defaults, configuration files and environment
    /// variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SshConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("cumulus")])
            .map_err(|err| SshConfigError::Parse(err.to_string()))
    }

    /// Checks that required values are present.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::MissingField`] naming the environment
    /// variable and TOML key to set.
    pub fn validate(&self) -> Result<(), SshConfigError> {
        FieldMetadata::new("ssh executable", "CUMULUS_SSH_SSH_BIN", "ssh_bin")
            .require(&self.ssh_bin)
            .map_err(SshConfigError::MissingField)
    }
}
