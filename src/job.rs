//! Job descriptors and outcomes.
//!
//! A [`JobDescriptor`] describes what to do against one host. Its payload is
//! exactly one of a single command, a command sequence, or an interaction
//! handler; [`JobBuilder::build`] enforces that invariant so an invalid
//! descriptor never reaches the pool.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::session::{
    CommandResult, ConnectTarget, DEFAULT_CONNECT_TIMEOUT, Password, SessionError,
};

/// Error type interaction handlers may return.
pub type InteractionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Future returned by [`Interaction::interact`].
pub type InteractionFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, InteractionError>> + Send + 'a>>;

/// Caller-supplied logic that takes over an open session.
///
/// `S` is the session type of the connector in use, so handlers can reach
/// capabilities beyond [`crate::session::Session`], such as
/// [`crate::session::ProcessSession::open_shell`]. The handler must leave the
/// session closable; the executor closes it afterwards whatever the result.
pub trait Interaction<S>: Send + Sync {
    /// Value produced by a successful interaction.
    type Output: Send + 'static;

    /// Drives the session for `host` and returns the interaction result.
    fn interact<'a>(&'a self, session: &'a mut S, host: &'a str)
    -> InteractionFuture<'a, Self::Output>;
}

/// Any function shaped like `(session, host) -> future` is a handler, so a
/// plain `fn` item can be passed wherever an [`Interaction`] is expected.
impl<S, T, F> Interaction<S> for F
where
    F: for<'a> Fn(&'a mut S, &'a str) -> InteractionFuture<'a, T> + Send + Sync,
    T: Send + 'static,
{
    type Output = T;

    fn interact<'a>(&'a self, session: &'a mut S, host: &'a str) -> InteractionFuture<'a, T> {
        self(session, host)
    }
}

/// Shared handle to an interaction handler producing `T`.
pub type InteractionHandler<S, T> = Arc<dyn Interaction<S, Output = T>>;

/// What a job does once its session is open.
pub enum Payload<S, T> {
    /// Run one command.
    Command(String),
    /// Run each command in order, each on its own channel.
    Sequence(Vec<String>),
    /// Hand the session to caller-supplied logic.
    Interaction(InteractionHandler<S, T>),
}

impl<S, T> Payload<S, T> {
    /// Short label used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Sequence(_) => "sequence",
            Self::Interaction(_) => "interaction",
        }
    }
}

impl<S, T> Clone for Payload<S, T> {
    fn clone(&self) -> Self {
        match self {
            Self::Command(command) => Self::Command(command.clone()),
            Self::Sequence(commands) => Self::Sequence(commands.clone()),
            Self::Interaction(handler) => Self::Interaction(Arc::clone(handler)),
        }
    }
}

impl<S, T> fmt::Debug for Payload<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(command) => f.debug_tuple("Command").field(command).finish(),
            Self::Sequence(commands) => f.debug_tuple("Sequence").field(commands).finish(),
            Self::Interaction(_) => f.write_str("Interaction(..)"),
        }
    }
}

/// Immutable description of the work to perform against one host.
pub struct JobDescriptor<S, T> {
    target: ConnectTarget,
    payload: Payload<S, T>,
}

impl<S, T> JobDescriptor<S, T> {
    /// Starts a builder for a job against `host`.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> JobBuilder<S, T> {
        JobBuilder::new(host)
    }

    /// Host this job targets.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.target.host
    }

    /// Connection parameters for this job.
    #[must_use]
    pub const fn target(&self) -> &ConnectTarget {
        &self.target
    }

    /// Work performed once connected.
    #[must_use]
    pub const fn payload(&self) -> &Payload<S, T> {
        &self.payload
    }

    /// Bound applied to connection establishment.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.target.connect_timeout
    }
}

impl<S, T> Clone for JobDescriptor<S, T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            payload: self.payload.clone(),
        }
    }
}

impl<S, T> fmt::Debug for JobDescriptor<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("target", &self.target)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Errors raised when a job is registered.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JobError {
    /// Raised when no command, command sequence, or interaction was given.
    #[error("job for {host} has no command, command sequence, or interaction")]
    MissingPayload {
        /// Host named by the rejected job.
        host: String,
    },
    /// Raised when more than one payload kind was given.
    #[error("job for {host} sets both a {first} and a {second}; choose one")]
    ConflictingPayload {
        /// Host named by the rejected job.
        host: String,
        /// Payload kind set first.
        first: &'static str,
        /// Payload kind set afterwards.
        second: &'static str,
    },
    /// Raised when the host is blank.
    #[error("job host must not be empty")]
    MissingHost,
    /// Raised when the connection timeout is zero.
    #[error("connect timeout for {host} must be greater than zero")]
    ZeroTimeout {
        /// Host named by the rejected job.
        host: String,
    },
}

/// Builder for [`JobDescriptor`] that defers validation to [`JobBuilder::build`].
pub struct JobBuilder<S, T> {
    host: String,
    username: Option<String>,
    password: Option<Password>,
    key_file: Option<Utf8PathBuf>,
    connect_timeout: Duration,
    payloads: Vec<Payload<S, T>>,
}

impl<S, T> JobBuilder<S, T> {
    /// Creates a builder for `host` with the default connection timeout.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
            key_file: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            payloads: Vec::new(),
        }
    }

    /// Sets the login user.
    #[must_use]
    pub fn username(mut self, value: impl Into<String>) -> Self {
        self.username = Some(value.into());
        self
    }

    /// Sets the password or key passphrase.
    #[must_use]
    pub fn password(mut self, value: impl Into<String>) -> Self {
        self.password = Some(Password::new(value));
        self
    }

    /// Sets the private key file.
    #[must_use]
    pub fn key_file(mut self, value: impl Into<Utf8PathBuf>) -> Self {
        self.key_file = Some(value.into());
        self
    }

    /// Overrides the connection timeout (60 seconds by default).
    #[must_use]
    pub const fn connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    /// Runs a single command.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.payloads.push(Payload::Command(command.into()));
        self
    }

    /// Runs several commands in order.
    #[must_use]
    pub fn commands<I, C>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.payloads.push(Payload::Sequence(
            commands.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Hands the session to `handler`.
    #[must_use]
    pub fn interaction(mut self, handler: InteractionHandler<S, T>) -> Self {
        self.payloads.push(Payload::Interaction(handler));
        self
    }

    /// Validates and builds the descriptor, trimming the host.
    ///
    /// Blank commands and empty sequences count as missing.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::MissingPayload`] when no usable payload was given,
    /// [`JobError::ConflictingPayload`] when more than one was given,
    /// [`JobError::MissingHost`] for a blank host and
    /// [`JobError::ZeroTimeout`] for a zero connection timeout.
    pub fn build(self) -> Result<JobDescriptor<S, T>, JobError> {
        let host = self.host.trim().to_owned();
        if host.is_empty() {
            return Err(JobError::MissingHost);
        }
        if self.connect_timeout.is_zero() {
            return Err(JobError::ZeroTimeout { host });
        }

        let mut usable = self.payloads.into_iter().filter(has_content);
        let Some(payload) = usable.next() else {
            return Err(JobError::MissingPayload { host });
        };
        if let Some(extra) = usable.next() {
            return Err(JobError::ConflictingPayload {
                host,
                first: payload.kind(),
                second: extra.kind(),
            });
        }

        Ok(JobDescriptor {
            target: ConnectTarget {
                host,
                username: self.username,
                password: self.password,
                key_file: self.key_file,
                connect_timeout: self.connect_timeout,
            },
            payload,
        })
    }
}

fn has_content<S, T>(payload: &Payload<S, T>) -> bool {
    match payload {
        Payload::Command(command) => !command.trim().is_empty(),
        Payload::Sequence(commands) => !commands.is_empty(),
        Payload::Interaction(_) => true,
    }
}

/// Why a job produced no outcome.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AbsenceReason {
    /// The session could not be opened.
    Connect(SessionError),
    /// Opening the session exceeded the job's connection timeout.
    ConnectTimeout(Duration),
    /// The connection broke while commands were running.
    Transport(SessionError),
    /// The interaction handler returned an error.
    Interaction(String),
    /// The job panicked.
    Panicked,
    /// The run was cancelled before the job finished.
    Cancelled,
    /// The run was cancelled before the job was dispatched.
    NotStarted,
}

impl fmt::Display for AbsenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(err) | Self::Transport(err) => write!(f, "{err}"),
            Self::ConnectTimeout(timeout) => {
                write!(f, "connection timed out after {} seconds", timeout.as_secs())
            }
            Self::Interaction(message) => write!(f, "interaction failed: {message}"),
            Self::Panicked => f.write_str("job panicked"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::NotStarted => f.write_str("not started"),
        }
    }
}

/// Result of executing one job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobOutcome<T> {
    /// Output of a single command.
    Command(CommandResult),
    /// One result per command of a sequence, in order.
    Sequence(Vec<CommandResult>),
    /// Value returned by the interaction handler.
    Interaction(T),
    /// No outcome; the job could not be completed.
    Absent(AbsenceReason),
}

impl<T> JobOutcome<T> {
    /// Returns `true` when the job produced no outcome.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent(_))
    }

    /// Reason for an absent outcome.
    #[must_use]
    pub const fn absence(&self) -> Option<&AbsenceReason> {
        match self {
            Self::Absent(reason) => Some(reason),
            _ => None,
        }
    }

    /// Single-command result, if this outcome is one.
    #[must_use]
    pub const fn as_command(&self) -> Option<&CommandResult> {
        match self {
            Self::Command(result) => Some(result),
            _ => None,
        }
    }

    /// Command-sequence results, if this outcome is one.
    #[must_use]
    pub fn as_sequence(&self) -> Option<&[CommandResult]> {
        match self {
            Self::Sequence(results) => Some(results),
            _ => None,
        }
    }

    /// Interaction value, if this outcome is one.
    #[must_use]
    pub const fn as_interaction(&self) -> Option<&T> {
        match self {
            Self::Interaction(value) => Some(value),
            _ => None,
        }
    }
}
