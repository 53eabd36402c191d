//! Properties of the runner facade observed through its public API.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use multissh::test_support::{ScriptedConnector, ScriptedSession};
use multissh::{
    AbsenceReason, CommandResult, Interaction, InteractionFuture, JobError, JobOutcome,
    PoolSettings, Runner, Session,
};
use rstest::{fixture, rstest};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[fixture]
fn connector() -> ScriptedConnector {
    ScriptedConnector::new()
}

fn settings(concurrency: usize) -> PoolSettings {
    PoolSettings {
        concurrency: NonZeroUsize::new(concurrency).expect("non-zero concurrency"),
        ..PoolSettings::default()
    }
}

fn command_runner(
    connector: &ScriptedConnector,
    concurrency: usize,
    hosts: &[&str],
    command: &str,
) -> Runner<ScriptedConnector> {
    let mut runner = Runner::with_settings(connector.clone(), settings(concurrency));
    for host in hosts {
        runner
            .register(runner.job(*host).command(command))
            .expect("job should register");
    }
    runner
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

#[rstest]
#[tokio::test]
async fn two_workers_echo_on_three_hosts(connector: ScriptedConnector) {
    let workers = NonZeroUsize::new(2).expect("non-zero concurrency");
    let mut runner: Runner<ScriptedConnector> =
        Runner::with_concurrency(connector.clone(), workers);
    for host in ["a", "b", "c"] {
        runner
            .register(runner.job(host).command("echo hi"))
            .expect("job should register");
    }

    let outcomes = runner.run().await.expect("run should succeed");

    assert_eq!(
        outcomes,
        vec![JobOutcome::Command(CommandResult::new(0, "hi\n", "")); 3]
    );
    assert!(connector.max_concurrent_sessions() <= 2);
    assert_eq!(connector.opened_hosts().len(), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn outcome_order_ignores_completion_order(connector: ScriptedConnector) {
    let hosts = ["h0", "h1", "h2", "h3"];
    for (host, secs) in hosts.iter().zip([4, 1, 3, 2]) {
        connector.delay_commands(host, Duration::from_secs(secs));
    }
    let mut runner: Runner<ScriptedConnector> =
        Runner::with_settings(connector.clone(), settings(4));
    for host in hosts {
        runner
            .register(runner.job(host).command(format!("echo {host}")))
            .expect("job should register");
    }

    let outcomes = runner.run().await.expect("run should succeed");

    let printed: Vec<String> = outcomes
        .iter()
        .map(|o| o.as_command().map(CommandResult::stdout_lossy).unwrap_or_default())
        .collect();
    assert_eq!(printed, vec!["h0\n", "h1\n", "h2\n", "h3\n"]);
    assert_eq!(connector.closed_hosts(), vec!["h1", "h3", "h2", "h0"]);
}

#[rstest]
#[tokio::test]
async fn job_without_payload_is_rejected_and_never_runs(connector: ScriptedConnector) {
    let mut runner = Runner::new(connector.clone());
    runner
        .register(runner.job("kept").command("true"))
        .expect("job should register");

    let rejected = runner.register(runner.job("dropped").command("   "));

    assert_eq!(
        rejected,
        Err(JobError::MissingPayload {
            host: String::from("dropped")
        })
    );
    let outcomes = runner.run().await.expect("run should succeed");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(connector.opened_hosts(), vec!["kept"]);
}

#[rstest]
#[tokio::test]
async fn failing_host_leaves_neighbours_untouched(connector: ScriptedConnector) {
    connector.fail_connect("broken");
    let runner = command_runner(&connector, 2, &["left", "broken", "right"], "echo fine");

    let outcomes = runner.run().await.expect("run should succeed");

    assert!(outcomes.first().is_some_and(|o| o.as_command().is_some()));
    assert!(matches!(
        outcomes.get(1),
        Some(JobOutcome::Absent(AbsenceReason::Connect(_)))
    ));
    assert!(outcomes.get(2).is_some_and(|o| o.as_command().is_some()));
}

#[rstest]
#[tokio::test]
async fn sequence_keeps_going_after_non_zero_exit(connector: ScriptedConnector) {
    let mut runner = Runner::new(connector.clone());
    runner
        .register(runner.job("a").commands(["echo first", "false", "echo last"]))
        .expect("job should register");

    let outcomes = runner.run().await.expect("run should succeed");

    let results = outcomes
        .first()
        .and_then(JobOutcome::as_sequence)
        .expect("sequence outcome");
    assert_eq!(
        results,
        [
            CommandResult::new(0, "first\n", ""),
            CommandResult::new(1, "", ""),
            CommandResult::new(0, "last\n", ""),
        ]
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn two_workers_finish_five_jobs_in_three_rounds(connector: ScriptedConnector) {
    let runner = command_runner(&connector, 2, &["a", "b", "c", "d", "e"], "sleep 10");

    let started = Instant::now();
    let outcomes = runner.run().await.expect("run should succeed");
    let elapsed = started.elapsed();

    assert!(outcomes.iter().all(|o| !o.is_absent()));
    assert!(elapsed >= Duration::from_secs(30), "took {elapsed:?}");
    assert!(elapsed < Duration::from_secs(40), "took {elapsed:?}");
    assert!(connector.max_concurrent_sessions() <= 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cancellation_keeps_finished_results(connector: ScriptedConnector) {
    let hosts = ["q0", "q1", "q2", "q3", "q4"];
    connector.delay_commands("q0", Duration::from_secs(1));
    connector.delay_commands("q1", Duration::from_secs(2));
    for host in hosts.iter().skip(2) {
        connector.delay_commands(host, Duration::from_secs(600));
    }
    let runner = command_runner(&connector, 2, &hosts, "echo done");
    let cancel = cancel_after(Duration::from_secs(5));

    let started = Instant::now();
    let outcomes = runner
        .run_until_cancelled(&cancel)
        .await
        .expect("run should succeed");

    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().take(2).all(|o| o.as_command().is_some()));
    assert_eq!(
        outcomes.iter().skip(2).cloned().collect::<Vec<_>>(),
        vec![
            JobOutcome::Absent(AbsenceReason::Cancelled),
            JobOutcome::Absent(AbsenceReason::Cancelled),
            JobOutcome::Absent(AbsenceReason::NotStarted),
        ]
    );
    assert!(started.elapsed() <= Duration::from_secs(5) + runner.settings().grace_period);
    assert_eq!(connector.active_sessions(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn hung_close_is_torn_down_after_grace(connector: ScriptedConnector) {
    connector.delay_close("stuck", Duration::from_secs(3600));
    let mut runner: Runner<ScriptedConnector> = Runner::with_settings(
        connector.clone(),
        PoolSettings {
            grace_period: Duration::from_secs(3),
            close_timeout: Duration::from_secs(3600),
            ..PoolSettings::default()
        },
    );
    runner
        .register(runner.job("stuck").command("sleep 60"))
        .expect("job should register");
    let cancel = cancel_after(Duration::from_secs(1));

    let started = Instant::now();
    let outcomes = runner
        .run_until_cancelled(&cancel)
        .await
        .expect("run should succeed");

    assert_eq!(outcomes, vec![JobOutcome::Absent(AbsenceReason::Cancelled)]);
    assert!(started.elapsed() <= Duration::from_secs(4));
}

struct Uptime;

impl Interaction<ScriptedSession> for Uptime {
    type Output = Vec<String>;

    fn interact<'a>(
        &'a self,
        session: &'a mut ScriptedSession,
        host: &'a str,
    ) -> InteractionFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut lines = Vec::new();
            for step in ["echo login", "echo status"] {
                let result = session.run_command(step).await?;
                lines.push(format!("{host}:{}", result.stdout_lossy().trim()));
            }
            Ok::<_, multissh::InteractionError>(lines)
        })
    }
}

#[rstest]
#[tokio::test]
async fn interactions_return_handler_values(connector: ScriptedConnector) {
    let mut runner: Runner<ScriptedConnector, Vec<String>> =
        Runner::with_settings(connector.clone(), PoolSettings::default());
    let handler = Arc::new(Uptime);
    for host in ["x", "y"] {
        runner
            .register(runner.job(host).interaction(handler.clone()))
            .expect("job should register");
    }

    let outcomes = runner.run().await.expect("run should succeed");

    assert_eq!(
        outcomes,
        vec![
            JobOutcome::Interaction(vec![String::from("x:login"), String::from("x:status")]),
            JobOutcome::Interaction(vec![String::from("y:login"), String::from("y:status")]),
        ]
    );
    assert_eq!(connector.closed_hosts().len(), 2);
}
