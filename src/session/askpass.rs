//! Password authentication for the OpenSSH client via `SSH_ASKPASS`.
//!
//! OpenSSH reads passwords from a terminal unless `SSH_ASKPASS_REQUIRE=force`
//! points it at a helper program (OpenSSH 8.4 or newer). The helper written
//! here only echoes an environment variable, so the secret is handed to the
//! `ssh` process through its environment and never touches the disk.

use camino::{Utf8Path, Utf8PathBuf};
use tokio::process::Command;
use uuid::Uuid;

use super::{Password, SessionError};

const SECRET_VAR: &str = "MULTISSH_ASKPASS_SECRET";

/// Askpass helper installed for one connection attempt.
///
/// The helper script is removed when this value is dropped.
#[derive(Debug)]
pub(crate) struct AskPass {
    path: Utf8PathBuf,
    secret: Password,
}

impl AskPass {
    /// Writes a helper script into `dir` that answers prompts with `secret`.
    pub(crate) fn install(
        dir: &Utf8Path,
        host: &str,
        secret: &Password,
    ) -> Result<Self, SessionError> {
        let path = dir.join(format!("multissh-askpass-{}.sh", Uuid::new_v4().simple()));
        write_helper(&path, host)?;
        Ok(Self {
            path,
            secret: secret.clone(),
        })
    }

    /// Points `command` at the helper and passes it the secret.
    pub(crate) fn apply(&self, command: &mut Command) {
        command
            .env("SSH_ASKPASS", self.path.as_str())
            .env("SSH_ASKPASS_REQUIRE", "force")
            .env(SECRET_VAR, self.secret.expose());
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for AskPass {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(path = %self.path, error = %err, "failed to remove askpass helper");
        }
    }
}

#[cfg(unix)]
fn write_helper(path: &Utf8Path, _host: &str) -> Result<(), SessionError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let script = format!("#!/bin/sh\nprintf '%s\\n' \"${SECRET_VAR}\"\n");
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o700)
        .open(path)
        .and_then(|mut file| file.write_all(script.as_bytes()))
        .map_err(|err| SessionError::Spawn {
            program: path.to_string(),
            message: err.to_string(),
        })
}

#[cfg(not(unix))]
fn write_helper(_path: &Utf8Path, host: &str) -> Result<(), SessionError> {
    Err(SessionError::UnsupportedCredential {
        host: host.to_owned(),
        message: String::from("password logins need a Unix shell for the askpass helper"),
    })
}
