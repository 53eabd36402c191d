//! Runner facade: a job registry plus a worker pool.

use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::job::{JobBuilder, JobDescriptor, JobError, JobOutcome};
use crate::pool::{PoolError, PoolSettings, WorkerPool};
use crate::session::Connector;

/// Collects jobs and runs them against their hosts in parallel.
///
/// `T` is the value produced by interaction handlers; runners that only run
/// commands keep the default `()`.
///
/// # Examples
///
/// ```
/// use std::num::NonZeroUsize;
///
/// use multissh::Runner;
/// use multissh::test_support::ScriptedConnector;
///
/// # tokio::runtime::Runtime::new().expect("runtime").block_on(async {
/// let workers = NonZeroUsize::new(2).expect("non-zero");
/// let mut runner: Runner<_> = Runner::with_concurrency(ScriptedConnector::new(), workers);
/// for host in ["a", "b", "c"] {
///     runner
///         .register(runner.job(host).command("echo hi"))
///         .expect("job should register");
/// }
///
/// let outcomes = runner.run().await.expect("run should start");
/// assert_eq!(outcomes.len(), 3);
/// assert_eq!(
///     outcomes[0].as_command().map(|r| r.stdout_lossy()),
///     Some(String::from("hi\n"))
/// );
/// # });
/// ```
#[derive(Debug)]
pub struct Runner<C: Connector, T = ()> {
    pool: WorkerPool<C>,
    jobs: Vec<Arc<JobDescriptor<C::Session, T>>>,
}

impl<C: Connector> Runner<C> {
    /// Creates a command-only runner with default pool settings.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self::with_settings(connector, PoolSettings::default())
    }
}

impl<C, T> Runner<C, T>
where
    C: Connector,
    T: Send + 'static,
{
    /// Creates a runner with explicit pool settings.
    #[must_use]
    pub fn with_settings(connector: C, settings: PoolSettings) -> Self {
        Self {
            pool: WorkerPool::new(Arc::new(connector), settings),
            jobs: Vec::new(),
        }
    }

    /// Creates a runner that contacts at most `concurrency` hosts at once,
    /// with the remaining pool settings at their defaults.
    #[must_use]
    pub fn with_concurrency(connector: C, concurrency: NonZeroUsize) -> Self {
        Self::with_settings(
            connector,
            PoolSettings {
                concurrency,
                ..PoolSettings::default()
            },
        )
    }

    /// Starts a job builder whose types match this runner.
    #[must_use]
    pub fn job(&self, host: impl Into<String>) -> JobBuilder<C::Session, T> {
        JobBuilder::new(host)
    }

    /// Validates `job` and appends it to the registry, returning its index.
    ///
    /// Registration never touches the network.
    ///
    /// # Errors
    ///
    /// Returns the [`JobError`] raised by [`JobBuilder::build`]; the runner
    /// is unchanged in that case.
    pub fn register(&mut self, job: JobBuilder<C::Session, T>) -> Result<usize, JobError> {
        let descriptor = job.build()?;
        tracing::debug!(
            index = self.jobs.len(),
            host = descriptor.host(),
            payload = descriptor.payload().kind(),
            "registered job"
        );
        self.jobs.push(Arc::new(descriptor));
        Ok(self.jobs.len() - 1)
    }

    /// Registered jobs, in registration order.
    #[must_use]
    pub fn jobs(&self) -> &[Arc<JobDescriptor<C::Session, T>>] {
        &self.jobs
    }

    /// Number of registered jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns `true` when no job has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Pool settings used by [`Runner::run`].
    #[must_use]
    pub const fn settings(&self) -> &PoolSettings {
        self.pool.settings()
    }

    /// Runs every registered job to completion.
    ///
    /// Outcome `i` always belongs to the job registered at index `i`.
    ///
    /// # Errors
    ///
    /// Returns a [`PoolError`] when the pool cannot run at all.
    pub async fn run(&self) -> Result<Vec<JobOutcome<T>>, PoolError> {
        self.run_until_cancelled(&CancellationToken::new()).await
    }

    /// Runs every registered job, stopping early once `cancel` fires.
    ///
    /// Cancelling returns within the configured grace period. Jobs that had
    /// not finished by then are reported as absent.
    ///
    /// # Errors
    ///
    /// Returns a [`PoolError`] when the pool cannot run at all.
    pub async fn run_until_cancelled(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<JobOutcome<T>>, PoolError> {
        let snapshot = self.jobs.clone();
        self.pool.run(&snapshot, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AbsenceReason;
    use crate::test_support::ScriptedConnector;
    use rstest::rstest;

    #[rstest]
    fn register_returns_sequential_indices() {
        let mut runner = Runner::new(ScriptedConnector::new());

        let first = runner.register(runner.job("a").command("true"));
        let second = runner.register(runner.job("b").commands(["true", "false"]));

        assert_eq!(first, Ok(0));
        assert_eq!(second, Ok(1));
        assert_eq!(runner.len(), 2);
    }

    #[rstest]
    fn concurrency_constructor_keeps_other_defaults() {
        let workers = NonZeroUsize::new(3).expect("non-zero");
        let runner: Runner<ScriptedConnector> =
            Runner::with_concurrency(ScriptedConnector::new(), workers);

        assert_eq!(runner.settings().concurrency, workers);
        assert_eq!(
            runner.settings().grace_period,
            PoolSettings::default().grace_period
        );
    }

    #[rstest]
    fn rejected_job_is_not_registered() {
        let mut runner = Runner::new(ScriptedConnector::new());

        let result = runner.register(runner.job("a"));

        assert_eq!(
            result,
            Err(JobError::MissingPayload {
                host: String::from("a")
            })
        );
        assert!(runner.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn run_without_jobs_returns_empty_list() {
        let connector = ScriptedConnector::new();
        let runner = Runner::new(connector.clone());

        let outcomes = runner.run().await.expect("run should succeed");

        assert!(outcomes.is_empty());
        assert!(connector.opened_hosts().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn pre_cancelled_run_starts_nothing() {
        let connector = ScriptedConnector::new();
        let mut runner = Runner::new(connector.clone());
        runner
            .register(runner.job("a").command("true"))
            .expect("job should register");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcomes = runner
            .run_until_cancelled(&cancel)
            .await
            .expect("run should succeed");

        assert_eq!(outcomes, vec![JobOutcome::Absent(AbsenceReason::NotStarted)]);
        assert!(connector.opened_hosts().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn runner_can_run_twice() {
        let connector = ScriptedConnector::new();
        let mut runner = Runner::new(connector.clone());
        runner
            .register(runner.job("a").command("echo again"))
            .expect("job should register");

        let first = runner.run().await.expect("first run");
        let second = runner.run().await.expect("second run");

        assert_eq!(first, second);
        assert_eq!(connector.opened_hosts(), vec!["a", "a"]);
    }
}
