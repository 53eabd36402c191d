//! BDD step definitions for the worker pool.

use std::time::Duration;

use multissh::test_support::ScriptedConnector;
use multissh::{JobOutcome, Runner};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::{Builder, Runtime};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::test_helpers::PoolContext;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("runtime setup failed: {0}")]
    Runtime(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a fleet of hosts \"{hosts}\"")]
fn fleet(mut pool_context: PoolContext, hosts: String) -> PoolContext {
    pool_context.hosts = hosts.split(',').map(|host| host.trim().to_owned()).collect();
    pool_context
}

#[given("every job runs \"{command}\"")]
fn every_job_runs(mut pool_context: PoolContext, command: String) -> PoolContext {
    pool_context.command = command;
    pool_context
}

#[given("host \"{host}\" takes \"{secs}\" seconds per command")]
fn slow_host(pool_context: PoolContext, host: String, secs: u64) -> PoolContext {
    pool_context
        .connector
        .delay_commands(&host, Duration::from_secs(secs));
    pool_context
}

#[given("host \"{host}\" refuses connections")]
fn refusing_host(pool_context: PoolContext, host: String) -> PoolContext {
    pool_context.connector.fail_connect(&host);
    pool_context
}

#[given("the concurrency limit is \"{limit}\"")]
fn concurrency_limit(pool_context: PoolContext, limit: usize) -> PoolContext {
    pool_context.with_concurrency(limit)
}

#[when("the jobs run")]
fn jobs_run(pool_context: PoolContext) -> Result<PoolContext, StepError> {
    execute(pool_context, None)
}

#[when("the jobs run and are interrupted after \"{secs}\" seconds")]
fn jobs_run_interrupted(pool_context: PoolContext, secs: u64) -> Result<PoolContext, StepError> {
    execute(pool_context, Some(Duration::from_secs(secs)))
}

fn paused_runtime() -> Result<Runtime, StepError> {
    Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .map_err(|err| StepError::Runtime(err.to_string()))
}

fn execute(
    mut pool_context: PoolContext,
    interrupt_after: Option<Duration>,
) -> Result<PoolContext, StepError> {
    let runtime = paused_runtime()?;
    let mut runner: Runner<ScriptedConnector> =
        Runner::with_settings(pool_context.connector.clone(), pool_context.settings);
    for host in &pool_context.hosts {
        runner
            .register(runner.job(host.as_str()).command(pool_context.command.as_str()))
            .map_err(|err| StepError::Assertion(err.to_string()))?;
    }

    let (outcomes, elapsed) = runtime.block_on(async move {
        let cancel = CancellationToken::new();
        if let Some(delay) = interrupt_after {
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                trigger.cancel();
            });
        }
        let started = Instant::now();
        let outcomes = runner.run_until_cancelled(&cancel).await;
        (outcomes, started.elapsed())
    });

    pool_context.outcomes =
        Some(outcomes.map_err(|err| StepError::Assertion(format!("run failed: {err}")))?);
    pool_context.elapsed = Some(elapsed);
    Ok(pool_context)
}

fn outcome(pool_context: &PoolContext, index: usize) -> Result<&JobOutcome<()>, StepError> {
    pool_context
        .outcomes
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("jobs have not run")))?
        .get(index)
        .ok_or_else(|| StepError::Assertion(format!("no outcome at index {index}")))
}

#[then("there are \"{count}\" outcomes")]
fn outcome_count(pool_context: &PoolContext, count: usize) -> Result<(), StepError> {
    let actual = pool_context.outcomes.as_ref().map_or(0, Vec::len);
    if actual == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} outcomes, got {actual}"
        )))
    }
}

#[then("outcome \"{index}\" printed \"{text}\"")]
fn outcome_printed(
    pool_context: &PoolContext,
    index: usize,
    text: String,
) -> Result<(), StepError> {
    match outcome(pool_context, index)? {
        JobOutcome::Command(result) if result.stdout_lossy().trim() == text => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected outcome {index} to print {text:?}, got {other:?}"
        ))),
    }
}

#[then("outcome \"{index}\" exited with status \"{status}\"")]
fn outcome_status(pool_context: &PoolContext, index: usize, status: i32) -> Result<(), StepError> {
    match outcome(pool_context, index)? {
        JobOutcome::Command(result) if result.exit_status == status => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected outcome {index} to exit with {status}, got {other:?}"
        ))),
    }
}

#[then("outcome \"{index}\" is absent because \"{reason}\"")]
fn outcome_absent(
    pool_context: &PoolContext,
    index: usize,
    reason: String,
) -> Result<(), StepError> {
    match outcome(pool_context, index)? {
        JobOutcome::Absent(actual) if actual.to_string().contains(reason.as_str()) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected outcome {index} to be absent because {reason:?}, got {other:?}"
        ))),
    }
}

#[then("no more than \"{limit}\" sessions were open at once")]
fn peak_sessions(pool_context: &PoolContext, limit: usize) -> Result<(), StepError> {
    let peak = pool_context.connector.max_concurrent_sessions();
    if peak <= limit {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "{peak} sessions were open at once, limit was {limit}"
        )))
    }
}

#[then("the run took \"{secs}\" seconds")]
fn run_took(pool_context: &PoolContext, secs: u64) -> Result<(), StepError> {
    let elapsed = pool_context
        .elapsed
        .ok_or_else(|| StepError::Assertion(String::from("jobs have not run")))?;
    if elapsed.as_secs() == secs {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected the run to take {secs}s, took {elapsed:?}"
        )))
    }
}

#[then("every opened session was closed")]
fn sessions_closed(pool_context: &PoolContext) -> Result<(), StepError> {
    let mut opened = pool_context.connector.opened_hosts();
    let mut closed = pool_context.connector.closed_hosts();
    opened.sort();
    closed.sort();
    if opened == closed {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "opened {opened:?} but closed {closed:?}"
        )))
    }
}

#[then("every opened session was released")]
fn sessions_released(pool_context: &PoolContext) -> Result<(), StepError> {
    match pool_context.connector.active_sessions() {
        0 => Ok(()),
        active => Err(StepError::Assertion(format!(
            "{active} sessions are still open"
        ))),
    }
}
