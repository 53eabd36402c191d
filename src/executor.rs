//! Executes a single job end to end.
//!
//! The executor opens one session, performs the job's payload, and always
//! closes the session before returning. Every failure is reduced to an
//! [`AbsenceReason`]; nothing is propagated to the pool.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::job::{AbsenceReason, Interaction, JobDescriptor, JobOutcome, Payload};
use crate::session::{CommandResult, Connector, Session};

/// Runs jobs against sessions opened by `C`.
#[derive(Debug)]
pub struct JobExecutor<C> {
    connector: Arc<C>,
    cancel: CancellationToken,
    close_timeout: Duration,
}

impl<C: Connector> JobExecutor<C> {
    /// Creates an executor that abandons work once `cancel` fires and waits
    /// at most `close_timeout` for a session to close.
    #[must_use]
    pub const fn new(
        connector: Arc<C>,
        cancel: CancellationToken,
        close_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            cancel,
            close_timeout,
        }
    }

    /// Executes `job` and returns its outcome.
    ///
    /// The session is closed on every path once it has been opened. A
    /// non-zero exit status is part of the outcome, not a failure.
    pub async fn execute<T>(&self, job: &JobDescriptor<C::Session, T>) -> JobOutcome<T>
    where
        T: Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return JobOutcome::Absent(AbsenceReason::Cancelled);
        }

        let mut session = match self.open(job).await {
            Ok(session) => session,
            Err(reason) => {
                tracing::warn!(reason = %reason, "could not open session");
                return JobOutcome::Absent(reason);
            }
        };

        let outcome = self.drive(&mut session, job).await;
        self.release(&mut session).await;
        outcome
    }

    async fn open<T>(
        &self,
        job: &JobDescriptor<C::Session, T>,
    ) -> Result<C::Session, AbsenceReason> {
        let opening = timeout(job.connect_timeout(), self.connector.open(job.target()));
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AbsenceReason::Cancelled),
            opened = opening => match opened {
                Ok(Ok(session)) => Ok(session),
                Ok(Err(err)) => Err(AbsenceReason::Connect(err)),
                Err(_) => Err(AbsenceReason::ConnectTimeout(job.connect_timeout())),
            },
        }
    }

    async fn drive<T>(
        &self,
        session: &mut C::Session,
        job: &JobDescriptor<C::Session, T>,
    ) -> JobOutcome<T>
    where
        T: Send + 'static,
    {
        match job.payload() {
            Payload::Command(command) => match self.run_one(session, command).await {
                Ok(result) => JobOutcome::Command(result),
                Err(reason) => abandon(reason),
            },
            Payload::Sequence(commands) => self.run_sequence(session, commands).await,
            Payload::Interaction(handler) => {
                self.interact(session, handler.as_ref(), job.host()).await
            }
        }
    }

    async fn run_one(
        &self,
        session: &mut C::Session,
        command: &str,
    ) -> Result<CommandResult, AbsenceReason> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AbsenceReason::Cancelled),
            result = session.run_command(command) => {
                result.map_err(AbsenceReason::Transport)
            }
        }
    }

    async fn run_sequence<T>(
        &self,
        session: &mut C::Session,
        commands: &[String],
    ) -> JobOutcome<T> {
        let mut results = Vec::with_capacity(commands.len());
        for (position, command) in commands.iter().enumerate() {
            match self.run_one(session, command).await {
                Ok(result) => {
                    if !result.is_success() {
                        tracing::debug!(
                            position,
                            exit_status = result.exit_status,
                            "command in sequence exited non-zero; continuing"
                        );
                    }
                    results.push(result);
                }
                Err(reason) => return abandon(reason),
            }
        }
        JobOutcome::Sequence(results)
    }

    async fn interact<T>(
        &self,
        session: &mut C::Session,
        handler: &dyn Interaction<C::Session, Output = T>,
        host: &str,
    ) -> JobOutcome<T>
    where
        T: Send + 'static,
    {
        let guarded = AssertUnwindSafe(handler.interact(session, host)).catch_unwind();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => JobOutcome::Absent(AbsenceReason::Cancelled),
            result = guarded => match result {
                Ok(Ok(value)) => JobOutcome::Interaction(value),
                Ok(Err(err)) => abandon(AbsenceReason::Interaction(err.to_string())),
                Err(_) => abandon(AbsenceReason::Panicked),
            },
        }
    }

    async fn release(&self, session: &mut C::Session) {
        if timeout(self.close_timeout, session.close()).await.is_err() {
            tracing::debug!(
                timeout_ms = self.close_timeout.as_millis(),
                "session close did not finish in time"
            );
        }
    }
}

fn abandon<T>(reason: AbsenceReason) -> JobOutcome<T> {
    if !matches!(reason, AbsenceReason::Cancelled) {
        tracing::warn!(reason = %reason, "job failed after connecting");
    }
    JobOutcome::Absent(reason)
}
