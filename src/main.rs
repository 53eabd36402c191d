//! Binary entry point for the multissh CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use serde::Serialize;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use multissh::{
    AbsenceReason, CommandResult, ConfigError, JobError, JobOutcome, MultiSshConfig, PoolError,
    ProcessConnector, Runner, install_shutdown_handler,
};

mod cli;


use cli::{Cli, ExecCommand};

/// Exit status when every host ran and every command succeeded.
const EXIT_OK: i32 = 0;
/// Exit status when at least one host failed or a command exited non-zero.
const EXIT_PARTIAL: i32 = 1;
/// Exit status for configuration, registration and pool errors.
const EXIT_ERROR: i32 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid job: {0}")]
    Job(#[from] JobError),
    #[error("could not run jobs: {0}")]
    Pool(#[from] PoolError),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            EXIT_ERROR
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Exec(command) => exec(command).await,
    }
}

async fn exec(args: ExecCommand) -> Result<i32, CliError> {
    validate_command_args(&args.args)?;
    let mut config = MultiSshConfig::load_without_cli_args()?;
    apply_overrides(&mut config, &args);

    let connector = ProcessConnector::new(config.connector_settings()?);
    let mut runner: Runner<ProcessConnector> =
        Runner::with_settings(connector, config.pool_settings()?);
    let payload = RemotePayload::from_args(&args);
    for host in &args.hosts {
        let builder = runner.job(host).connect_timeout(config.connect_timeout());
        let job = match &payload {
            RemotePayload::Single(command) => builder.command(command.as_str()),
            RemotePayload::Sequence(commands) => {
                builder.commands(commands.iter().map(String::as_str))
            }
        };
        runner.register(job)?;
    }

    let cancel = install_shutdown_handler();
    let outcomes = runner.run_until_cancelled(&cancel).await?;
    if cancel.is_cancelled() {
        writeln!(io::stderr(), "interrupted; showing partial results").ok();
    }

    let hosts: Vec<&str> = runner.jobs().iter().map(|job| job.host()).collect();
    let stdout = io::stdout();
    let written = if args.json {
        write_json(stdout.lock(), &hosts, &outcomes)
    } else {
        write_text(stdout.lock(), &hosts, &outcomes)
    };
    written.map_err(|err| CliError::Output(err.to_string()))?;

    Ok(exit_code(&outcomes))
}

/// Commands sent to every host.
#[derive(Debug, Eq, PartialEq)]
enum RemotePayload {
    Single(String),
    Sequence(Vec<String>),
}

impl RemotePayload {
    fn from_args(args: &ExecCommand) -> Self {
        match args.commands.as_slice() {
            [] => Self::Single(render_remote_command(&args.args)),
            [single] => Self::Single(single.clone()),
            many => Self::Sequence(many.to_vec()),
        }
    }
}

fn apply_overrides(config: &mut MultiSshConfig, args: &ExecCommand) {
    if let Some(user) = &args.user {
        config.ssh_user = Some(user.clone());
    }
    if let Some(identity_file) = &args.identity_file {
        config.ssh_identity_file = Some(identity_file.clone());
    }
    if let Some(port) = args.port {
        config.ssh_port = Some(port);
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = secs;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
}

fn render_remote_command(args: &[String]) -> String {
    let mut result = String::new();
    let mut first = true;

    for arg in args {
        if first {
            first = false;
        } else {
            result.push(' ');
        }

        let escaped = escape(arg.as_str().into());
        result.push_str(escaped.as_ref());
    }

    result
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\n' | '\r' | '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn exit_code(outcomes: &[JobOutcome<()>]) -> i32 {
    let all_succeeded = outcomes.iter().all(|outcome| match outcome {
        JobOutcome::Command(result) => result.is_success(),
        JobOutcome::Sequence(results) => results.iter().all(CommandResult::is_success),
        JobOutcome::Interaction(()) => true,
        JobOutcome::Absent(_) => false,
    });
    if all_succeeded { EXIT_OK } else { EXIT_PARTIAL }
}

fn write_text(
    mut out: impl Write,
    hosts: &[&str],
    outcomes: &[JobOutcome<()>],
) -> io::Result<()> {
    for (host, outcome) in hosts.iter().zip(outcomes) {
        match outcome {
            JobOutcome::Command(result) => write_result(&mut out, host, result)?,
            JobOutcome::Sequence(results) => {
                for result in results {
                    write_result(&mut out, host, result)?;
                }
            }
            JobOutcome::Interaction(()) => writeln!(out, "{host}: done")?,
            JobOutcome::Absent(
                reason @ (AbsenceReason::Connect(_) | AbsenceReason::ConnectTimeout(_)),
            ) => writeln!(out, "{host}: couldn't connect ({reason})")?,
            JobOutcome::Absent(reason) => writeln!(out, "{host}: no result ({reason})")?,
        }
    }
    Ok(())
}

fn write_result(out: &mut impl Write, host: &str, result: &CommandResult) -> io::Result<()> {
    if !result.is_success() {
        return writeln!(out, "{host}: command exited with status {}", result.exit_status);
    }
    for line in result.stdout_lossy().lines() {
        writeln!(out, "{host}: {line}")?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct HostReport<'a> {
    host: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    results: Vec<CommandReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommandReport {
    exit_status: i32,
    stdout: String,
    stderr: String,
}

impl From<&CommandResult> for CommandReport {
    fn from(result: &CommandResult) -> Self {
        Self {
            exit_status: result.exit_status,
            stdout: result.stdout_lossy(),
            stderr: result.stderr_lossy(),
        }
    }
}

const NO_RESULTS: &[CommandResult] = &[];

fn host_report<'a>(host: &'a str, outcome: &JobOutcome<()>) -> HostReport<'a> {
    let (results, reason): (&[CommandResult], _) = match outcome {
        JobOutcome::Command(result) => (std::slice::from_ref(result), None),
        JobOutcome::Sequence(results) => (results.as_slice(), None),
        JobOutcome::Interaction(()) => (NO_RESULTS, None),
        JobOutcome::Absent(reason) => (NO_RESULTS, Some(reason.to_string())),
    };
    let status = if reason.is_some() {
        "absent"
    } else if results.iter().all(CommandResult::is_success) {
        "ok"
    } else {
        "failed"
    };
    HostReport {
        host,
        status,
        results: results.iter().map(CommandReport::from).collect(),
        reason,
    }
}

fn write_json(mut out: impl Write, hosts: &[&str], outcomes: &[JobOutcome<()>]) -> io::Result<()> {
    let reports: Vec<HostReport<'_>> = hosts
        .iter()
        .zip(outcomes)
        .map(|(host, outcome)| host_report(host, outcome))
        .collect();
    serde_json::to_writer_pretty(&mut out, &reports)?;
    writeln!(out)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
