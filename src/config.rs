//! Configuration loading via `ortho-config`.
//!
//! Every structure layers built-in defaults, `cumulus.toml` and environment
//! variables, in that order of precedence. Validation errors name both the
//! environment variable and the TOML key to set.

use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::compute::ComputeSettings;
use crate::retry::{BoundedRetry, RetryablePredicate};
use crate::script::RunScriptOptions;

/// Name of the configuration file discovered by every loader.
pub const CONFIG_FILE_NAME: &str = "cumulus.toml";

/// Longest accepted timeout, period or TTL: one week.
pub const MAX_WAIT_SECS: u64 = 7 * 24 * 60 * 60;

/// Most accepted attempts for socket waits and verification.
pub const MAX_ATTEMPTS: u32 = 10_000;

/// Metadata for a configuration field, used to generate actionable error
/// messages.
pub(crate) struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    pub(crate) const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    /// Fails with a message naming the field's sources when `value` is
    /// blank.
    pub(crate) fn require(&self, value: &str) -> Result<(), String> {
        if value.trim().is_empty() {
            return Err(format!(
                "missing {}: set {} or add {} to {CONFIG_FILE_NAME}",
                self.description, self.env_var, self.toml_key
            ));
        }
        Ok(())
    }

    /// Fails with a message naming the field's sources when `value` is zero.
    pub(crate) fn require_positive(&self, value: u64) -> Result<(), String> {
        if value == 0 {
            return Err(format!(
                "{} must be greater than zero: set {} or {} in {CONFIG_FILE_NAME}",
                self.description, self.env_var, self.toml_key
            ));
        }
        Ok(())
    }

    /// Fails with a message naming the field's sources when `value` exceeds
    /// `max`.
    pub(crate) fn require_at_most(&self, value: u64, max: u64) -> Result<(), String> {
        if value > max {
            return Err(format!(
                "{} must be at most {max}: set {} or {} in {CONFIG_FILE_NAME}",
                self.description, self.env_var, self.toml_key
            ));
        }
        Ok(())
    }
}

/// Orchestrator timing and credential settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CUMULUS",
    discovery(
        app_name = "cumulus",
        env_var = "CUMULUS_CONFIG_PATH",
        config_file_name = "cumulus.toml",
        dotfile_name = ".cumulus.toml",
        project_file_name = "cumulus.toml"
    )
)]
pub struct ComputeConfig {
    /// Seconds a node may take to reach `RUNNING` after creation or reboot.
    #[ortho_config(default = 600)]
    pub node_running_timeout_secs: u64,
    /// Seconds between node state polls.
    #[ortho_config(default = 1)]
    pub node_poll_period_secs: u64,
    /// Seconds a catalog snapshot stays fresh; zero disables caching.
    #[ortho_config(default = 60)]
    pub catalog_ttl_secs: u64,
    /// Attempts made while waiting for the login port.
    #[ortho_config(default = 60)]
    pub socket_attempts: u32,
    /// Seconds between login port probes.
    #[ortho_config(default = 1)]
    pub socket_period_secs: u64,
    /// Attempts made by node verification.
    #[ortho_config(default = 5)]
    pub verify_attempts: u32,
    /// Seconds between verification attempts.
    #[ortho_config(default = 10)]
    pub verify_backoff_secs: u64,
    /// Private key used for node logins when a template installs none.
    pub ssh_key_file: Option<String>,
}

impl ComputeConfig {
    /// Built-in settings, identical to what loading yields with no sources.
    #[must_use]
    pub const fn with_defaults() -> Self {
        Self {
            node_running_timeout_secs: 600,
            node_poll_period_secs: 1,
            catalog_ttl_secs: 60,
            socket_attempts: 60,
            socket_period_secs: 1,
            verify_attempts: 5,
            verify_backoff_secs: 10,
            ssh_key_file: None,
        }
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("cumulus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that every period and budget is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] or [`ConfigError::OutOfRange`]
    /// naming the environment variable and TOML key of the first offending
    /// value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (
                FieldMetadata::new(
                    "node running timeout",
                    "CUMULUS_NODE_RUNNING_TIMEOUT_SECS",
                    "node_running_timeout_secs",
                ),
                self.node_running_timeout_secs,
            ),
            (
                FieldMetadata::new(
                    "node poll period",
                    "CUMULUS_NODE_POLL_PERIOD_SECS",
                    "node_poll_period_secs",
                ),
                self.node_poll_period_secs,
            ),
            (
                FieldMetadata::new(
                    "socket attempts",
                    "CUMULUS_SOCKET_ATTEMPTS",
                    "socket_attempts",
                ),
                u64::from(self.socket_attempts),
            ),
            (
                FieldMetadata::new(
                    "socket period",
                    "CUMULUS_SOCKET_PERIOD_SECS",
                    "socket_period_secs",
                ),
                self.socket_period_secs,
            ),
            (
                FieldMetadata::new(
                    "verification attempts",
                    "CUMULUS_VERIFY_ATTEMPTS",
                    "verify_attempts",
                ),
                u64::from(self.verify_attempts),
            ),
        ];
        for (field, value) in &checks {
            field
                .require_positive(*value)
                .map_err(ConfigError::MissingField)?;
        }
        let ceilings = [
            (
                FieldMetadata::new(
                    "node running timeout",
                    "CUMULUS_NODE_RUNNING_TIMEOUT_SECS",
                    "node_running_timeout_secs",
                ),
                self.node_running_timeout_secs,
                MAX_WAIT_SECS,
            ),
            (
                FieldMetadata::new(
                    "node poll period",
                    "CUMULUS_NODE_POLL_PERIOD_SECS",
                    "node_poll_period_secs",
                ),
                self.node_poll_period_secs,
                MAX_WAIT_SECS,
            ),
            (
                FieldMetadata::new(
                    "catalog TTL",
                    "CUMULUS_CATALOG_TTL_SECS",
                    "catalog_ttl_secs",
                ),
                self.catalog_ttl_secs,
                MAX_WAIT_SECS,
            ),
            (
                FieldMetadata::new(
                    "socket attempts",
                    "CUMULUS_SOCKET_ATTEMPTS",
                    "socket_attempts",
                ),
                u64::from(self.socket_attempts),
                u64::from(MAX_ATTEMPTS),
            ),
            (
                FieldMetadata::new(
                    "socket period",
                    "CUMULUS_SOCKET_PERIOD_SECS",
                    "socket_period_secs",
                ),
                self.socket_period_secs,
                MAX_WAIT_SECS,
            ),
            (
                FieldMetadata::new(
                    "verification attempts",
                    "CUMULUS_VERIFY_ATTEMPTS",
                    "verify_attempts",
                ),
                u64::from(self.verify_attempts),
                u64::from(MAX_ATTEMPTS),
            ),
            (
                FieldMetadata::new(
                    "verification backoff",
                    "CUMULUS_VERIFY_BACKOFF_SECS",
                    "verify_backoff_secs",
                ),
                self.verify_backoff_secs,
                MAX_WAIT_SECS,
            ),
        ];
        for (field, value, max) in &ceilings {
            field
                .require_at_most(*value, *max)
                .map_err(ConfigError::OutOfRange)?;
        }
        if let Some(path) = self.ssh_key_file.as_deref() {
            FieldMetadata::new("SSH key file", "CUMULUS_SSH_KEY_FILE", "ssh_key_file")
                .require(path)
                .map_err(ConfigError::MissingField)?;
        }
        Ok(())
    }

    /// Orchestrator settings described by this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn settings(&self) -> Result<ComputeSettings, ConfigError> {
        self.validate()?;
        Ok(ComputeSettings {
            node_running_timeout: Duration::from_secs(self.node_running_timeout_secs),
            node_poll_period: Duration::from_secs(self.node_poll_period_secs),
            catalog_ttl: Duration::from_secs(self.catalog_ttl_secs),
            socket_wait: RetryablePredicate::from_attempts(
                self.socket_attempts,
                Duration::from_secs(self.socket_period_secs),
            ),
            verify: BoundedRetry::new(
                self.verify_attempts,
                Duration::from_secs(self.verify_backoff_secs),
            ),
        })
    }

    /// Reads the configured private key, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::KeyFile`] when the file cannot be read and
    /// [`ConfigError::MissingField`] when it is empty.
    pub fn load_private_key(&self) -> Result<Option<String>, ConfigError> {
        let Some(raw) = self.ssh_key_file.as_deref() else {
            return Ok(None);
        };
        let key = read_key_file(Utf8Path::new(raw))?;
        FieldMetadata::new("SSH key contents", "CUMULUS_SSH_KEY_FILE", "ssh_key_file")
            .require(&key)
            .map_err(ConfigError::MissingField)?;
        Ok(Some(key))
    }
}

impl ComputeConfig {
    /// Script options carrying the configured socket policy and private key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails or the key file cannot
    /// be read.
    pub fn run_script_options(&self) -> Result<RunScriptOptions, ConfigError> {
        let options = RunScriptOptions::new().socket_wait(self.settings()?.socket_wait);
        if let Some(key) = self.load_private_key()? {
            return Ok(options.private_key(key));
        }
        Ok(options)
    }
}

fn read_key_file(path: &Utf8Path) -> Result<String, ConfigError> {
    let key_error = |err: &io::Error| ConfigError::KeyFile {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| ConfigError::KeyFile {
        path: path.to_path_buf(),
        message: String::from("key file path is missing a filename"),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| key_error(&err))?;
    dir.read_to_string(file_name).map_err(|err| key_error(&err))
}

/// Scaleway account settings derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application; informational only.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project new servers are billed to.
    pub default_project_id: String,
    /// Availability zone the adapter manages. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// CPU architecture images are listed for.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("cumulus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                FieldMetadata::new("Scaleway API secret key", "SCW_SECRET_KEY", "secret_key"),
                &self.secret_key,
            ),
            (
                FieldMetadata::new(
                    "Scaleway project ID",
                    "SCW_DEFAULT_PROJECT_ID",
                    "default_project_id",
                ),
                &self.default_project_id,
            ),
            (
                FieldMetadata::new("availability zone", "SCW_DEFAULT_ZONE", "default_zone"),
                &self.default_zone,
            ),
            (
                FieldMetadata::new(
                    "CPU architecture",
                    "SCW_DEFAULT_ARCHITECTURE",
                    "default_architecture",
                ),
                &self.default_architecture,
            ),
        ];
        for (field, value) in required {
            field.require(value).map_err(ConfigError::MissingField)?;
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty, missing or zero.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a timeout, period or attempt count beyond the accepted
    /// ceiling.
    #[error("configuration value out of range: {0}")]
    OutOfRange(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when the configured key file cannot be read.
    #[error("cannot read key file {path}: {message}")]
    KeyFile {
        /// Path that was configured.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        message: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::test_support::EnvGuard;

    #[test]
    fn defaults_produce_default_settings() {
        let settings = ComputeConfig::with_defaults()
            .settings()
            .unwrap_or_else(|err| panic!("defaults should validate: {err}"));
        assert_eq!(settings, ComputeSettings::default());
    }

    #[rstest]
    #[case::poll("node_poll_period_secs", "CUMULUS_NODE_POLL_PERIOD_SECS")]
    #[case::attempts("socket_attempts", "CUMULUS_SOCKET_ATTEMPTS")]
    #[case::verify("verify_attempts", "CUMULUS_VERIFY_ATTEMPTS")]
    fn zero_values_are_rejected_with_their_sources(#[case] key: &str, #[case] env_var: &str) {
        let mut config = ComputeConfig::with_defaults();
        match key {
            "node_poll_period_secs" => config.node_poll_period_secs = 0,
            "socket_attempts" => config.socket_attempts = 0,
            _ => config.verify_attempts = 0,
        }
        let message = config
            .validate()
            .err()
            .unwrap_or_else(|| panic!("{key} = 0 should be rejected"))
            .to_string();
        assert!(message.contains(env_var), "{message}");
        assert!(message.contains(key), "{message}");
        assert!(message.contains(CONFIG_FILE_NAME), "{message}");
    }

    #[rstest]
    #[case::timeout("node_running_timeout_secs", "CUMULUS_NODE_RUNNING_TIMEOUT_SECS")]
    #[case::socket("socket_period_secs", "CUMULUS_SOCKET_PERIOD_SECS")]
    #[case::backoff("verify_backoff_secs", "CUMULUS_VERIFY_BACKOFF_SECS")]
    fn unbounded_waits_are_rejected(#[case] key: &str, #[case] env_var: &str) {
        let mut config = ComputeConfig::with_defaults();
        match key {
            "node_running_timeout_secs" => config.node_running_timeout_secs = u64::MAX,
            "socket_period_secs" => config.socket_period_secs = u64::MAX,
            _ => config.verify_backoff_secs = u64::MAX,
        }
        let err = config
            .settings()
            .err()
            .unwrap_or_else(|| panic!("{key} = u64::MAX should be rejected"));
        let ConfigError::OutOfRange(message) = &err else {
            panic!("expected OutOfRange, got {err:?}");
        };
        assert!(message.contains(env_var), "{message}");
        assert!(message.contains(key), "{message}");
    }

    #[test]
    fn ceilings_are_inclusive() {
        let config = ComputeConfig {
            node_running_timeout_secs: MAX_WAIT_SECS,
            socket_attempts: MAX_ATTEMPTS,
            ..ComputeConfig::with_defaults()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn private_key_is_read_from_the_configured_file() {
        let mut file = NamedTempFile::new().unwrap_or_else(|err| panic!("tempfile: {err}"));
        file.write_all(b"-----BEGIN KEY-----\n")
            .unwrap_or_else(|err| panic!("write: {err}"));
        let path = file.path().to_string_lossy().into_owned();
        let config = ComputeConfig {
            ssh_key_file: Some(path),
            ..ComputeConfig::with_defaults()
        };
        let key = config
            .load_private_key()
            .unwrap_or_else(|err| panic!("read: {err}"));
        assert_eq!(key.as_deref(), Some("-----BEGIN KEY-----\n"));

        let options = config
            .run_script_options()
            .unwrap_or_else(|err| panic!("options: {err}"));
        assert_eq!(
            options,
            RunScriptOptions::new().private_key("-----BEGIN KEY-----\n")
        );
    }

    #[test]
    fn missing_key_file_is_reported() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = dir.path().join("absent").to_string_lossy().into_owned();
        let config = ComputeConfig {
            ssh_key_file: Some(path),
            ..ComputeConfig::with_defaults()
        };
        let err = config
            .load_private_key()
            .err()
            .unwrap_or_else(|| panic!("absent file should fail"));
        assert!(matches!(err, ConfigError::KeyFile { .. }));
    }

    #[test]
    fn no_key_file_means_no_key() {
        let key = ComputeConfig::with_defaults()
            .load_private_key()
            .unwrap_or_else(|err| panic!("read: {err}"));
        assert_eq!(key, None);
    }

    #[rstest]
    #[tokio::test]
    async fn environment_overrides_defaults() {
        let _guard = EnvGuard::set_vars(&[
            ("CUMULUS_NODE_POLL_PERIOD_SECS", "5"),
            ("CUMULUS_CATALOG_TTL_SECS", "0"),
        ])
        .await;
        let config = ComputeConfig::load_without_cli_args()
            .unwrap_or_else(|err| panic!("load: {err}"));
        assert_eq!(config.node_poll_period_secs, 5);
        assert_eq!(config.catalog_ttl_secs, 0);
        assert_eq!(config.verify_attempts, 5);
    }

    #[test]
    fn scaleway_secret_is_required() {
        let config = ScalewayConfig {
            access_key: None,
            secret_key: String::new(),
            default_organization_id: None,
            default_project_id: String::from("11111111-2222-3333-4444-555555555555"),
            default_zone: String::from("fr-par-1"),
            default_architecture: String::from("x86_64"),
        };
        let err = config
            .validate()
            .err()
            .unwrap_or_else(|| panic!("blank secret should fail"));
        let ConfigError::MissingField(message) = &err else {
            panic!("expected MissingField, got {err:?}");
        };
        assert!(message.contains("SCW_SECRET_KEY"), "{message}");
        assert!(message.contains("secret_key"), "{message}");
    }
}
