//! Bounded worker pool that executes jobs concurrently.
//!
//! Jobs are dispatched in registration order while a semaphore limits how
//! many run at once. Results are written into the slot matching each job's
//! index, so the returned vector lines up with the input whatever order the
//! jobs finish in.

use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::executor::JobExecutor;
use crate::job::{AbsenceReason, JobDescriptor, JobOutcome};
use crate::session::Connector;

/// Default number of jobs run at once.
pub const DEFAULT_CONCURRENCY: NonZeroUsize = match NonZeroUsize::new(8) {
    Some(value) => value,
    None => NonZeroUsize::MIN,
};

/// Default time in-flight jobs get to wind down after cancellation.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Default bound on closing one session.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tuning knobs for [`WorkerPool`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolSettings {
    /// Upper bound on jobs running at the same time.
    pub concurrency: NonZeroUsize,
    /// How long in-flight jobs may keep running once the run is cancelled.
    pub grace_period: Duration,
    /// How long the executor waits for a session to close.
    pub close_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            grace_period: DEFAULT_GRACE_PERIOD,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Failures that prevent the pool from running at all.
///
/// Individual job failures never surface here; they become
/// [`JobOutcome::Absent`] entries.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PoolError {
    /// Raised when no Tokio runtime is available to spawn workers on.
    #[error("no Tokio runtime is available; run jobs from within a Tokio runtime")]
    NoRuntime,
    /// Raised when the requested worker count exceeds what the semaphore
    /// supports.
    #[error("cannot start {requested} workers; at most {max} are supported")]
    TooManyWorkers {
        /// Workers requested for this run.
        requested: usize,
        /// Largest supported worker count.
        max: usize,
    },
    /// Raised when the dispatch semaphore closed unexpectedly.
    #[error("worker pool closed before all jobs were dispatched")]
    Closed,
}

/// Runs batches of jobs with bounded concurrency.
#[derive(Debug)]
pub struct WorkerPool<C> {
    connector: Arc<C>,
    settings: PoolSettings,
}

impl<C: Connector> WorkerPool<C> {
    /// Creates a pool that opens sessions through `connector`.
    #[must_use]
    pub const fn new(connector: Arc<C>, settings: PoolSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// Settings this pool runs with.
    #[must_use]
    pub const fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Runs every job and returns one outcome per job, in input order.
    ///
    /// Once `cancel` fires no further jobs are dispatched; jobs already
    /// running get the grace period to finish and are then aborted. Jobs
    /// that never started report [`AbsenceReason::NotStarted`] and jobs cut
    /// short report [`AbsenceReason::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NoRuntime`] outside a Tokio runtime,
    /// [`PoolError::TooManyWorkers`] when the worker count cannot be
    /// represented and [`PoolError::Closed`] if dispatch breaks down.
    pub async fn run<T>(
        &self,
        jobs: &[Arc<JobDescriptor<C::Session, T>>],
        cancel: &CancellationToken,
    ) -> Result<Vec<JobOutcome<T>>, PoolError>
    where
        T: Send + 'static,
    {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let handle = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        let workers = self.settings.concurrency.get().min(jobs.len());
        if workers > Semaphore::MAX_PERMITS {
            return Err(PoolError::TooManyWorkers {
                requested: workers,
                max: Semaphore::MAX_PERMITS,
            });
        }

        tracing::info!(jobs = jobs.len(), workers, "starting job run");
        let worker_cancel = cancel.child_token();
        let _stop_workers = worker_cancel.clone().drop_guard();
        let executor = Arc::new(JobExecutor::new(
            Arc::clone(&self.connector),
            worker_cancel,
            self.settings.close_timeout,
        ));

        let mut running = JoinSet::new();
        let dispatched = dispatch(jobs, workers, &executor, &mut running, cancel, &handle).await?;
        let slots = self.collect(&mut running, jobs.len(), cancel).await;
        Ok(finalise(slots, dispatched))
    }

    async fn collect<T>(
        &self,
        running: &mut JoinSet<(usize, JobOutcome<T>)>,
        total: usize,
        cancel: &CancellationToken,
    ) -> Vec<Option<JobOutcome<T>>>
    where
        T: Send + 'static,
    {
        let mut slots: Vec<Option<JobOutcome<T>>> =
            std::iter::repeat_with(|| None).take(total).collect();
        let mut draining = false;
        // `None` while draining means the grace period is too long to
        // represent as an instant, so in-flight jobs are waited for.
        let mut deadline: Option<Instant> = None;
        loop {
            if !draining && cancel.is_cancelled() {
                draining = true;
                deadline = Instant::now().checked_add(self.settings.grace_period);
            }
            let joined = if draining {
                match deadline {
                    Some(limit) => {
                        let Ok(next) = timeout_at(limit, running.join_next()).await else {
                            tracing::warn!(
                                remaining = running.len(),
                                grace_ms = self.settings.grace_period.as_millis(),
                                "grace period elapsed; aborting remaining jobs"
                            );
                            running.abort_all();
                            break;
                        };
                        next
                    }
                    None => running.join_next().await,
                }
            } else {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => continue,
                    next = running.join_next() => next,
                }
            };

            match joined {
                None => break,
                Some(Ok((index, outcome))) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Some(Err(err)) => tracing::warn!(error = %err, "worker task ended abnormally"),
            }
        }
        slots
    }
}

async fn dispatch<C, T>(
    jobs: &[Arc<JobDescriptor<C::Session, T>>],
    workers: usize,
    executor: &Arc<JobExecutor<C>>,
    running: &mut JoinSet<(usize, JobOutcome<T>)>,
    cancel: &CancellationToken,
    handle: &Handle,
) -> Result<usize, PoolError>
where
    C: Connector,
    T: Send + 'static,
{
    let permits = Arc::new(Semaphore::new(workers));
    let mut dispatched = 0;
    for (index, job) in jobs.iter().enumerate() {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!(
                    dispatched,
                    pending = jobs.len() - index,
                    "run cancelled; dispatch stopped"
                );
                break;
            }
            acquired = Arc::clone(&permits).acquire_owned() => {
                acquired.map_err(|_| PoolError::Closed)?
            }
        };

        let span = tracing::info_span!("job", index, host = job.host());
        let worker = Arc::clone(executor);
        let owned = Arc::clone(job);
        running.spawn_on(
            async move {
                let _permit = permit;
                let outcome = AssertUnwindSafe(worker.execute(&owned))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        tracing::error!("job panicked");
                        JobOutcome::Absent(AbsenceReason::Panicked)
                    });
                tracing::debug!(absent = outcome.is_absent(), "job finished");
                (index, outcome)
            }
            .instrument(span),
            handle,
        );
        dispatched = index + 1;
    }
    Ok(dispatched)
}

fn finalise<T>(slots: Vec<Option<JobOutcome<T>>>, dispatched: usize) -> Vec<JobOutcome<T>> {
    let outcomes: Vec<JobOutcome<T>> = slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| {
                JobOutcome::Absent(if index < dispatched {
                    AbsenceReason::Cancelled
                } else {
                    AbsenceReason::NotStarted
                })
            })
        })
        .collect();
    let absent = outcomes.iter().filter(|outcome| outcome.is_absent()).count();
    tracing::info!(jobs = outcomes.len(), absent, "job run finished");
    outcomes
}
