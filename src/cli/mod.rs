//! Command-line interface definitions for the `multissh` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{ArgGroup, Parser};

/// Top-level CLI for the `multissh` binary.
#[derive(Debug, Parser)]
#[command(
    name = "multissh",
    about = "Run commands on many hosts over SSH in parallel",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run a command or command sequence on every host.
    #[command(name = "exec", about = "Run a command or command sequence on every host")]
    Exec(ExecCommand),
}

/// Arguments for the `multissh exec` subcommand.
#[derive(Debug, Parser)]
#[command(group(
    ArgGroup::new("payload")
        .required(true)
        .args(["commands", "args"])
))]
pub(crate) struct ExecCommand {
    /// Host to run on; repeat for each host.
    #[arg(short = 'H', long = "host", value_name = "HOST", required = true)]
    pub(crate) hosts: Vec<String>,
    /// Login user, overriding `ssh_user` from configuration.
    #[arg(short, long, value_name = "USER")]
    pub(crate) user: Option<String>,
    /// Private key file, overriding `ssh_identity_file` from configuration.
    #[arg(short, long, value_name = "PATH")]
    pub(crate) identity_file: Option<String>,
    /// SSH port, overriding `ssh_port` from configuration.
    #[arg(short, long, value_name = "PORT")]
    pub(crate) port: Option<u16>,
    /// Seconds allowed for each connection.
    #[arg(long, value_name = "SECS")]
    pub(crate) connect_timeout: Option<u64>,
    /// Maximum number of hosts contacted at once.
    #[arg(short = 'j', long, value_name = "N")]
    pub(crate) concurrency: Option<usize>,
    /// Print the outcomes as a JSON array.
    #[arg(long)]
    pub(crate) json: bool,
    /// Shell command to run; repeat to run a sequence on each host.
    #[arg(short = 'c', long = "command", value_name = "CMD", conflicts_with = "args")]
    pub(crate) commands: Vec<String>,
    /// Command and arguments to run, escaped for the remote shell (use -- to
    /// separate flags).
    #[arg(trailing_var_arg = true, value_name = "ARGS")]
    pub(crate) args: Vec<String>,
}
