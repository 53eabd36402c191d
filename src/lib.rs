//! Parallel SSH job execution.
//!
//! Register one job per host on a [`Runner`], then call [`Runner::run`].
//! Each job opens its own session, runs a command, a sequence of commands or
//! a caller-supplied [`Interaction`], and closes the session again. Up to a
//! configured number of jobs run at once. The outcome list always lines up
//! with the registration order, and a host that fails never affects the
//! others: its slot simply holds [`JobOutcome::Absent`].
//!
//! Sessions come from a [`Connector`]. [`ProcessConnector`] drives the
//! system OpenSSH client; [`test_support::ScriptedConnector`] simulates hosts
//! in memory.

pub mod config;
pub mod executor;
pub mod job;
pub mod pool;
pub mod runner;
pub mod session;
pub mod shutdown;
pub mod test_support;

pub use config::{ConfigError, MultiSshConfig};
pub use executor::JobExecutor;
pub use job::{
    AbsenceReason, Interaction, InteractionError, InteractionFuture, InteractionHandler,
    JobBuilder, JobDescriptor, JobError, JobOutcome, Payload,
};
pub use pool::{PoolError, PoolSettings, WorkerPool};
pub use runner::Runner;
pub use session::{
    CommandResult, ConnectTarget, Connector, HostKeyPolicy, Password, ProcessConnector,
    ProcessConnectorSettings, ProcessSession, Session, SessionError, ShellChannel,
};
pub use shutdown::install_shutdown_handler;
