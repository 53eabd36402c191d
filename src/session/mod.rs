//! Session capability consumed by the job executor.
//!
//! A [`Connector`] opens one authenticated connection per job and hands back
//! a [`Session`]. Sessions run commands to completion on fresh channels and
//! are always closed by the executor once the job finishes. The production
//! implementation in [`process`] drives the system OpenSSH client; tests use
//! the scripted implementation from [`crate::test_support`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

mod askpass;
mod process;
mod shell;
mod util;

pub use process::{HostKeyPolicy, ProcessConnector, ProcessConnectorSettings, ProcessSession};
pub use shell::ShellChannel;
pub use util::expand_tilde;

/// Default bound applied to connection establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Future returned by session operations that may fail.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SessionError>> + Send + 'a>>;

/// Future returned by [`Session::close`]; closing never fails.
pub type CloseFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Password or key passphrase supplied with a job.
///
/// The value is redacted from `Debug` output.
#[derive(Clone, Eq, PartialEq)]
pub struct Password(String);

impl Password {
    /// Wraps a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Everything a connector needs to reach and authenticate against one host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectTarget {
    /// Hostname or address of the remote machine.
    pub host: String,
    /// Login user; the connector default applies when absent.
    pub username: Option<String>,
    /// Password or key passphrase.
    pub password: Option<Password>,
    /// Private key file used for authentication.
    pub key_file: Option<Utf8PathBuf>,
    /// Upper bound for establishing the connection.
    pub connect_timeout: Duration,
}

impl ConnectTarget {
    /// Creates a target for `host` with no credentials and the default
    /// connection timeout.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
            key_file: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Exit status and fully captured output of one remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandResult {
    /// Exit status reported by the remote command.
    pub exit_status: i32,
    /// Captured standard output bytes.
    pub stdout: Vec<u8>,
    /// Captured standard error bytes.
    pub stderr: Vec<u8>,
}

impl CommandResult {
    /// Builds a result from textual output.
    #[must_use]
    pub fn new(exit_status: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_status,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Returns `true` when the exit status equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_status == 0
    }

    /// Standard output decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Connection and transport failures raised by a session capability.
///
/// A non-zero remote exit status is not an error; it is reported through
/// [`CommandResult::exit_status`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// Raised when the connection could not be established.
    #[error("failed to connect to {host}: {message}")]
    Connect {
        /// Host that could not be reached.
        host: String,
        /// Reason reported by the transport.
        message: String,
    },
    /// Raised when connection establishment exceeds its bound.
    #[error("connection to {host} timed out after {} seconds", timeout.as_secs())]
    Timeout {
        /// Host that did not answer in time.
        host: String,
        /// Bound that was exceeded.
        timeout: Duration,
    },
    /// Raised when the job carries a credential the connector cannot use.
    #[error("unsupported credential for {host}: {message}")]
    UnsupportedCredential {
        /// Host the credential was meant for.
        host: String,
        /// Explanation of the limitation.
        message: String,
    },
    /// Raised when a local helper process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when an established connection breaks.
    #[error("connection to {host} lost: {message}")]
    Transport {
        /// Host whose connection broke.
        host: String,
        /// Reason reported by the transport.
        message: String,
    },
    /// Raised when the session was already closed.
    #[error("session to {host} is closed")]
    Closed {
        /// Host of the closed session.
        host: String,
    },
}

/// Opens sessions against remote hosts.
pub trait Connector: Send + Sync + 'static {
    /// Session type produced by this connector.
    type Session: Session;

    /// Opens an authenticated session to `target.host`.
    ///
    /// Implementations should honour `target.connect_timeout`; the executor
    /// enforces the same bound from the outside.
    fn open<'a>(&'a self, target: &'a ConnectTarget) -> SessionFuture<'a, Self::Session>;
}

/// An open, authenticated connection to a single host.
///
/// Sessions are never shared between jobs. Implementations must release
/// their resources when dropped without [`Session::close`], because a
/// forcefully aborted worker drops its session mid-flight.
pub trait Session: Send + 'static {
    /// Runs `command` on a fresh channel and captures its exit status and
    /// both output streams in full.
    fn run_command<'a>(&'a mut self, command: &'a str) -> SessionFuture<'a, CommandResult>;

    /// Closes the session. Calling it more than once is harmless and it
    /// never fails.
    fn close(&mut self) -> CloseFuture<'_>;
}
