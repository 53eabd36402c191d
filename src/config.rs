//! Configuration loading via `ortho-config`.
//!
//! [`MultiSshConfig`] merges defaults, `multissh.toml`, `MULTISSH_*`
//! environment variables and CLI flags, then converts into the settings
//! consumed by [`ProcessConnector`](crate::session::ProcessConnector) and
//! [`WorkerPool`](crate::pool::WorkerPool).

use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::pool::PoolSettings;
use crate::session::{HostKeyPolicy, ProcessConnectorSettings};

/// Runner and SSH client settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "MULTISSH",
    discovery(
        app_name = "multissh",
        env_var = "MULTISSH_CONFIG_PATH",
        config_file_name = "multissh.toml",
        dotfile_name = ".multissh.toml",
        project_file_name = "multissh.toml"
    )
)]
pub struct MultiSshConfig {
    /// Maximum number of hosts contacted at once.
    #[ortho_config(default = 8)]
    pub concurrency: usize,
    /// Seconds allowed for establishing each connection.
    #[ortho_config(default = 60)]
    pub connect_timeout_secs: u64,
    /// Seconds in-flight jobs may continue after an interrupt.
    #[ortho_config(default = 10)]
    pub cancel_grace_secs: u64,
    /// Seconds allowed for closing each session.
    #[ortho_config(default = 5)]
    pub close_timeout_secs: u64,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Login user applied when a job does not name one.
    pub ssh_user: Option<String>,
    /// SSH port; the client default (22) applies when absent.
    pub ssh_port: Option<u16>,
    /// Private key used when a job does not name one. Supports tilde
    /// expansion (`~/.ssh/id_ed25519`).
    pub ssh_identity_file: Option<String>,
    /// Whether to force batch mode so the client never prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Host key policy: `yes`, `accept-new` or `no`.
    #[ortho_config(default = "accept-new".to_owned())]
    pub ssh_host_key_policy: String,
    /// Known hosts file override.
    pub ssh_known_hosts_file: Option<String>,
    /// Directory holding control master sockets; the system temporary
    /// directory applies when absent.
    pub control_dir: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn guidance(&self) -> String {
        format!(
            "set {} or add {} to multissh.toml",
            self.env_var, self.toml_key
        )
    }
}

const CONCURRENCY: FieldMetadata =
    FieldMetadata::new("concurrency", "MULTISSH_CONCURRENCY", "concurrency");
const CONNECT_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "connect timeout",
    "MULTISSH_CONNECT_TIMEOUT_SECS",
    "connect_timeout_secs",
);
const CLOSE_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "close timeout",
    "MULTISSH_CLOSE_TIMEOUT_SECS",
    "close_timeout_secs",
);
const SSH_BIN: FieldMetadata = FieldMetadata::new("ssh executable", "MULTISSH_SSH_BIN", "ssh_bin");
const SSH_USER: FieldMetadata = FieldMetadata::new("SSH user", "MULTISSH_SSH_USER", "ssh_user");
const SSH_PORT: FieldMetadata = FieldMetadata::new("SSH port", "MULTISSH_SSH_PORT", "ssh_port");
const SSH_IDENTITY_FILE: FieldMetadata = FieldMetadata::new(
    "SSH identity file",
    "MULTISSH_SSH_IDENTITY_FILE",
    "ssh_identity_file",
);
const SSH_HOST_KEY_POLICY: FieldMetadata = FieldMetadata::new(
    "host key policy",
    "MULTISSH_SSH_HOST_KEY_POLICY",
    "ssh_host_key_policy",
);
const SSH_KNOWN_HOSTS_FILE: FieldMetadata = FieldMetadata::new(
    "known hosts file",
    "MULTISSH_SSH_KNOWN_HOSTS_FILE",
    "ssh_known_hosts_file",
);
const CONTROL_DIR: FieldMetadata =
    FieldMetadata::new("control socket directory", "MULTISSH_CONTROL_DIR", "control_dir");

impl MultiSshConfig {
    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("multissh")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and the `multissh.toml` key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a string value is blank and
    /// [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        reject_zero(self.concurrency == 0, &CONCURRENCY)?;
        reject_zero(self.connect_timeout_secs == 0, &CONNECT_TIMEOUT)?;
        reject_zero(self.close_timeout_secs == 0, &CLOSE_TIMEOUT)?;
        require_value(&self.ssh_bin, &SSH_BIN)?;
        require_optional_value(self.ssh_user.as_deref(), &SSH_USER)?;
        require_optional_value(self.ssh_identity_file.as_deref(), &SSH_IDENTITY_FILE)?;
        require_optional_value(self.ssh_known_hosts_file.as_deref(), &SSH_KNOWN_HOSTS_FILE)?;
        require_optional_value(self.control_dir.as_deref(), &CONTROL_DIR)?;
        if self.ssh_port == Some(0) {
            return Err(invalid(&SSH_PORT, "port 0 is not usable"));
        }
        self.host_key_policy()?;
        Ok(())
    }

    /// Parsed host key policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for values other than `yes`,
    /// `accept-new` and `no`.
    pub fn host_key_policy(&self) -> Result<HostKeyPolicy, ConfigError> {
        HostKeyPolicy::from_option(&self.ssh_host_key_policy).ok_or_else(|| {
            invalid(
                &SSH_HOST_KEY_POLICY,
                &format!(
                    "expected yes, accept-new or no, got {:?}",
                    self.ssh_host_key_policy
                ),
            )
        })
    }

    /// Default connection timeout for jobs.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Builds the SSH client settings after validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn connector_settings(&self) -> Result<ProcessConnectorSettings, ConfigError> {
        self.validate()?;
        let defaults = ProcessConnectorSettings::default();
        Ok(ProcessConnectorSettings {
            ssh_bin: self.ssh_bin.clone(),
            default_user: self.ssh_user.clone(),
            port: self.ssh_port,
            identity_file: self.ssh_identity_file.as_deref().map(Utf8PathBuf::from),
            batch_mode: self.ssh_batch_mode,
            host_key_policy: self.host_key_policy()?,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            control_dir: self
                .control_dir
                .as_deref()
                .map_or(defaults.control_dir, Utf8PathBuf::from),
        })
    }

    /// Builds the worker pool settings after validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn pool_settings(&self) -> Result<PoolSettings, ConfigError> {
        self.validate()?;
        let concurrency = NonZeroUsize::new(self.concurrency)
            .ok_or_else(|| invalid(&CONCURRENCY, "must be greater than zero"))?;
        Ok(PoolSettings {
            concurrency,
            grace_period: Duration::from_secs(self.cancel_grace_secs),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
        })
    }
}

fn require_optional_value(
    value: Option<&str>,
    metadata: &FieldMetadata,
) -> Result<(), ConfigError> {
    match value {
        Some(text) if text.trim().is_empty() => Err(ConfigError::MissingField(format!(
            "missing {}: {}",
            metadata.description,
            metadata.guidance()
        ))),
        _ => Ok(()),
    }
}

fn require_value(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    require_optional_value(Some(value), metadata)
}

fn reject_zero(is_zero: bool, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if is_zero {
        return Err(invalid(metadata, "must be greater than zero"));
    }
    Ok(())
}

fn invalid(metadata: &FieldMetadata, detail: &str) -> ConfigError {
    ConfigError::Invalid(format!(
        "{} {detail}: {}",
        metadata.description,
        metadata.guidance()
    ))
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a configured string value is blank.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configured value is out of range or unrecognised.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
