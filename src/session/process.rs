//! Session capability backed by the system OpenSSH client.
//!
//! Each session starts a dedicated control master (`ssh -M -N -S <socket>`)
//! and runs every command as a multiplexed client over that socket, so each
//! command gets a fresh channel on the same authenticated connection. The
//! master is killed when the session is closed or dropped. Jobs carrying a
//! password authenticate the master through an askpass helper.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use uuid::Uuid;

use super::askpass::AskPass;
use super::shell::ShellChannel;
use super::util::expand_tilde;
use super::{
    CloseFuture, CommandResult, ConnectTarget, Connector, Session, SessionError, SessionFuture,
};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit status OpenSSH uses for its own failures.
const SSH_FAILURE_STATUS: i32 = 255;

/// How unknown or changed host keys are treated.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HostKeyPolicy {
    /// Refuse hosts that are not already known.
    Strict,
    /// Trust unknown hosts on first use and remember them.
    #[default]
    AcceptNew,
    /// Skip host key verification entirely.
    Off,
}

impl HostKeyPolicy {
    /// Parses the OpenSSH `StrictHostKeyChecking` spelling.
    #[must_use]
    pub fn from_option(value: &str) -> Option<Self> {
        match value.trim() {
            "yes" => Some(Self::Strict),
            "accept-new" => Some(Self::AcceptNew),
            "no" => Some(Self::Off),
            _ => None,
        }
    }

    /// Value passed to `-o StrictHostKeyChecking=`.
    #[must_use]
    pub const fn as_option(self) -> &'static str {
        match self {
            Self::Strict => "yes",
            Self::AcceptNew => "accept-new",
            Self::Off => "no",
        }
    }
}

/// Settings shared by every session a [`ProcessConnector`] opens.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessConnectorSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// User applied when a job does not name one.
    pub default_user: Option<String>,
    /// Port override; OpenSSH defaults apply when absent.
    pub port: Option<u16>,
    /// Key file applied when a job does not name one. Supports `~/`.
    pub identity_file: Option<Utf8PathBuf>,
    /// Whether to forbid interactive prompts.
    pub batch_mode: bool,
    /// Host key verification policy.
    pub host_key_policy: HostKeyPolicy,
    /// Known hosts file override.
    pub known_hosts_file: Option<String>,
    /// Directory holding the per-session control sockets.
    pub control_dir: Utf8PathBuf,
}

impl Default for ProcessConnectorSettings {
    fn default() -> Self {
        let control_dir = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
        Self {
            ssh_bin: String::from("ssh"),
            default_user: None,
            port: None,
            identity_file: None,
            batch_mode: true,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_file: None,
            control_dir,
        }
    }
}

/// Opens sessions by launching OpenSSH control masters.
#[derive(Clone, Debug, Default)]
pub struct ProcessConnector {
    settings: Arc<ProcessConnectorSettings>,
}

impl ProcessConnector {
    /// Creates a connector using `settings` for every session.
    #[must_use]
    pub fn new(settings: ProcessConnectorSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    /// Returns the connector settings.
    #[must_use]
    pub fn settings(&self) -> &ProcessConnectorSettings {
        &self.settings
    }

    async fn open_master(&self, target: &ConnectTarget) -> Result<ProcessSession, SessionError> {
        // Only needed while the master authenticates; dropped on return.
        let askpass = target
            .password
            .as_ref()
            .map(|secret| AskPass::install(&self.settings.control_dir, &target.host, secret))
            .transpose()?;

        let destination = self.destination(target);
        let control_path = self
            .settings
            .control_dir
            .join(format!("multissh-{}.sock", Uuid::new_v4().simple()));
        let args = self.master_args(target, &control_path, &destination);

        let mut command = Command::new(&self.settings.ssh_bin);
        if let Some(helper) = &askpass {
            helper.apply(&mut command);
        }
        let mut master = command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SessionError::Spawn {
                program: self.settings.ssh_bin.clone(),
                message: err.to_string(),
            })?;

        let deadline = Instant::now().checked_add(target.connect_timeout);
        loop {
            match master.try_wait() {
                Ok(Some(status)) => {
                    let stderr = drain_stderr(&mut master).await;
                    let message = if stderr.is_empty() {
                        format!("ssh exited with {status}")
                    } else {
                        stderr
                    };
                    return Err(SessionError::Connect {
                        host: target.host.clone(),
                        message,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(SessionError::Connect {
                        host: target.host.clone(),
                        message: err.to_string(),
                    });
                }
            }

            if control_path.exists() {
                break;
            }

            if deadline.is_some_and(|limit| Instant::now() >= limit) {
                master.start_kill().ok();
                remove_socket(&control_path);
                return Err(SessionError::Timeout {
                    host: target.host.clone(),
                    timeout: target.connect_timeout,
                });
            }

            sleep(READY_POLL_INTERVAL).await;
        }

        Ok(ProcessSession {
            settings: Arc::clone(&self.settings),
            host: target.host.clone(),
            destination,
            control_path,
            master: Some(master),
        })
    }

    fn destination(&self, target: &ConnectTarget) -> String {
        match target
            .username
            .as_deref()
            .or(self.settings.default_user.as_deref())
        {
            Some(user) => format!("{user}@{}", target.host),
            None => target.host.clone(),
        }
    }

    fn master_args(
        &self,
        target: &ConnectTarget,
        control_path: &Utf8Path,
        destination: &str,
    ) -> Vec<OsString> {
        let mut args = self.common_ssh_options(target);
        args.push(OsString::from("-M"));
        args.push(OsString::from("-N"));
        args.push(OsString::from("-S"));
        args.push(OsString::from(control_path.as_str()));
        args.push(OsString::from("-o"));
        args.push(OsString::from("ControlPersist=no"));
        args.push(OsString::from(destination));
        args
    }

    fn common_ssh_options(&self, target: &ConnectTarget) -> Vec<OsString> {
        let mut args = Vec::new();

        if let Some(port) = self.settings.port {
            args.push(OsString::from("-p"));
            args.push(OsString::from(port.to_string()));
        }

        if let Some(key_file) = target
            .key_file
            .as_deref()
            .or(self.settings.identity_file.as_deref())
        {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(key_file).into_string()));
        }

        // Batch mode disables password prompts, including askpass.
        if target.password.is_some() {
            args.push(OsString::from("-o"));
            args.push(OsString::from("NumberOfPasswordPrompts=1"));
        } else if self.settings.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "StrictHostKeyChecking={}",
            self.settings.host_key_policy.as_option()
        )));

        if let Some(known_hosts) = self.settings.known_hosts_file.as_deref()
            && !known_hosts.trim().is_empty()
        {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!("UserKnownHostsFile={known_hosts}")));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            target.connect_timeout.as_secs().max(1)
        )));

        args
    }
}

impl Connector for ProcessConnector {
    type Session = ProcessSession;

    fn open<'a>(&'a self, target: &'a ConnectTarget) -> SessionFuture<'a, Self::Session> {
        Box::pin(self.open_master(target))
    }
}

/// One OpenSSH control master plus the commands multiplexed over it.
#[derive(Debug)]
pub struct ProcessSession {
    settings: Arc<ProcessConnectorSettings>,
    host: String,
    destination: String,
    control_path: Utf8PathBuf,
    master: Option<Child>,
}

impl ProcessSession {
    /// Host this session is connected to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path of the control socket backing this session.
    #[must_use]
    pub fn control_path(&self) -> &Utf8Path {
        &self.control_path
    }

    /// Starts a remote login shell without a pseudo-terminal and returns a
    /// line-oriented channel to it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] once the session has been closed and
    /// [`SessionError::Spawn`] when the client cannot be started.
    pub fn open_shell(&mut self) -> Result<ShellChannel, SessionError> {
        self.ensure_open()?;
        let child = Command::new(&self.settings.ssh_bin)
            .args(self.client_args())
            .arg("-T")
            .arg(&self.destination)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SessionError::Spawn {
                program: self.settings.ssh_bin.clone(),
                message: err.to_string(),
            })?;
        ShellChannel::new(self.host.clone(), child)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.master.is_some() {
            Ok(())
        } else {
            Err(SessionError::Closed {
                host: self.host.clone(),
            })
        }
    }

    fn client_args(&self) -> Vec<OsString> {
        vec![
            OsString::from("-S"),
            OsString::from(self.control_path.as_str()),
            OsString::from("-o"),
            OsString::from("ControlMaster=no"),
        ]
    }

    fn master_exited(&mut self) -> bool {
        self.master
            .as_mut()
            .is_none_or(|master| !matches!(master.try_wait(), Ok(None)))
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, SessionError> {
        self.ensure_open()?;
        let output = Command::new(&self.settings.ssh_bin)
            .args(self.client_args())
            .arg(&self.destination)
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| SessionError::Spawn {
                program: self.settings.ssh_bin.clone(),
                message: err.to_string(),
            })?;

        let Some(exit_status) = output.status.code() else {
            return Err(SessionError::Transport {
                host: self.host.clone(),
                message: String::from("ssh client terminated by a signal"),
            });
        };

        if exit_status == SSH_FAILURE_STATUS && self.master_exited() {
            return Err(SessionError::Transport {
                host: self.host.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(CommandResult {
            exit_status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn shutdown(&mut self) {
        let Some(mut master) = self.master.take() else {
            return;
        };

        let exit = Command::new(&self.settings.ssh_bin)
            .arg("-S")
            .arg(self.control_path.as_str())
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        if let Err(err) = exit {
            tracing::debug!(host = %self.host, error = %err, "control master exit request failed");
        }

        if let Err(err) = master.kill().await {
            tracing::debug!(host = %self.host, error = %err, "failed to stop control master");
        }
        remove_socket(&self.control_path);
    }
}

impl Session for ProcessSession {
    fn run_command<'a>(&'a mut self, command: &'a str) -> SessionFuture<'a, CommandResult> {
        Box::pin(self.execute(command))
    }

    fn close(&mut self) -> CloseFuture<'_> {
        Box::pin(self.shutdown())
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if self.master.is_some() {
            remove_socket(&self.control_path);
        }
    }
}

async fn drain_stderr(child: &mut Child) -> String {
    let mut buffer = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        stderr.read_to_string(&mut buffer).await.ok();
    }
    buffer.trim().to_owned()
}

fn remove_socket(path: &Utf8Path) {
    if let Err(err) = std::fs::remove_file(path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path, error = %err, "failed to remove control socket");
    }
}
