//! Line-oriented interactive channel for interaction handlers.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};

use super::SessionError;

/// A remote shell driven by sending lines and reading its output line by
/// line.
///
/// Output is read from the remote standard output only. Tailing a log is a
/// loop over [`ShellChannel::next_line`]; scripted exchanges combine
/// [`ShellChannel::send_line`] with [`ShellChannel::read_until`].
#[derive(Debug)]
pub struct ShellChannel {
    host: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ShellChannel {
    pub(crate) fn new(host: String, mut child: Child) -> Result<Self, SessionError> {
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SessionError::Transport {
                host,
                message: String::from("shell channel is missing its standard streams"),
            });
        };
        Ok(Self {
            host,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
        })
    }

    /// Sends `line` followed by a newline.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] when the remote side has gone away
    /// and [`SessionError::Closed`] after input has been finished.
    pub async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        let host = self.host.clone();
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SessionError::Closed { host: host.clone() })?;
        let mut payload = String::with_capacity(line.len() + 1);
        payload.push_str(line);
        payload.push('\n');
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| transport(&host, &err))?;
        stdin.flush().await.map_err(|err| transport(&host, &err))
    }

    /// Reads the next output line, or `None` once the remote side closes its
    /// output.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] when reading fails.
    pub async fn next_line(&mut self) -> Result<Option<String>, SessionError> {
        self.stdout
            .next_line()
            .await
            .map_err(|err| transport(&self.host, &err))
    }

    /// Reads lines until one contains `marker`, returning the lines read
    /// before it. The marker line itself is consumed and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] when output ends before the
    /// marker appears or reading fails.
    pub async fn read_until(&mut self, marker: &str) -> Result<Vec<String>, SessionError> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await? {
            if line.contains(marker) {
                return Ok(lines);
            }
            lines.push(line);
        }
        Err(SessionError::Transport {
            host: self.host.clone(),
            message: format!("output ended before marker {marker:?}"),
        })
    }

    /// Runs `command` in the shell and returns its output lines.
    ///
    /// The command is followed by an `echo` of a unique marker so the end of
    /// its output can be detected without a prompt.
    ///
    /// # Errors
    ///
    /// Propagates failures from [`ShellChannel::send_line`] and
    /// [`ShellChannel::read_until`].
    pub async fn exchange(&mut self, command: &str) -> Result<Vec<String>, SessionError> {
        let marker = format!("__multissh_done_{}__", uuid::Uuid::new_v4().simple());
        self.send_line(command).await?;
        self.send_line(&format!("echo {marker}")).await?;
        self.read_until(&marker).await
    }

    /// Closes the input side, signalling end of input to the remote shell.
    /// Output already produced can still be read.
    pub fn close_input(&mut self) {
        drop(self.stdin.take());
    }

    /// Closes the input side and waits for the remote shell to exit,
    /// returning its exit status when one was reported.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] when waiting fails.
    pub async fn finish(mut self) -> Result<Option<i32>, SessionError> {
        self.close_input();
        let status = self
            .child
            .wait()
            .await
            .map_err(|err| transport(&self.host, &err))?;
        Ok(status.code())
    }
}

fn transport(host: &str, err: &std::io::Error) -> SessionError {
    SessionError::Transport {
        host: host.to_owned(),
        message: err.to_string(),
    }
}
