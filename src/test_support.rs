//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedConnector`] stands in for a fleet of SSH hosts. Each host can be
//! told to refuse connections, answer slowly, drop its connection part way
//! through a job, or hang while closing. Sessions interpret a handful of
//! shell built-ins so tests can assert on realistic output without a network.

use std::collections::{BTreeSet, HashMap};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::session::{
    CloseFuture, CommandResult, ConnectTarget, Connector, Session, SessionError, SessionFuture,
};

#[derive(Clone, Debug, Default)]
struct HostScript {
    refuse: bool,
    connect_delay: Option<Duration>,
    command_delay: Option<Duration>,
    close_delay: Option<Duration>,
    drop_after: Option<usize>,
}

#[derive(Debug, Default)]
struct Ledger {
    scripts: HashMap<String, HostScript>,
    opened: Vec<String>,
    closed: Vec<String>,
    commands: HashMap<String, Vec<String>>,
    targets: Vec<ConnectTarget>,
    active: usize,
    peak: usize,
}

impl Ledger {
    fn script(&self, host: &str) -> HostScript {
        self.scripts.get(host).cloned().unwrap_or_default()
    }

    fn script_mut(&mut self, host: &str) -> &mut HostScript {
        self.scripts.entry(host.to_owned()).or_default()
    }
}

type SharedLedger = Arc<Mutex<Ledger>>;

fn lock(ledger: &SharedLedger) -> std::sync::MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted connector that simulates remote hosts in memory.
///
/// Clones share their script and their recorded history, so a test keeps one
/// handle for assertions while the pool owns another.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    ledger: SharedLedger,
}

impl ScriptedConnector {
    /// Creates a connector where every host accepts connections immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes connections to `host` fail with a connect error.
    pub fn fail_connect(&self, host: &str) {
        lock(&self.ledger).script_mut(host).refuse = true;
    }

    /// Delays session establishment for `host`.
    pub fn delay_connect(&self, host: &str, delay: Duration) {
        lock(&self.ledger).script_mut(host).connect_delay = Some(delay);
    }

    /// Delays every command run against `host`.
    pub fn delay_commands(&self, host: &str, delay: Duration) {
        lock(&self.ledger).script_mut(host).command_delay = Some(delay);
    }

    /// Delays closing sessions to `host`.
    pub fn delay_close(&self, host: &str, delay: Duration) {
        lock(&self.ledger).script_mut(host).close_delay = Some(delay);
    }

    /// Breaks the connection to `host` once `completed` commands have run.
    pub fn drop_connection_after(&self, host: &str, completed: usize) {
        lock(&self.ledger).script_mut(host).drop_after = Some(completed);
    }

    /// Hosts a session was opened for, in opening order.
    #[must_use]
    pub fn opened_hosts(&self) -> Vec<String> {
        lock(&self.ledger).opened.clone()
    }

    /// Hosts whose session was closed, in closing order.
    #[must_use]
    pub fn closed_hosts(&self) -> Vec<String> {
        lock(&self.ledger).closed.clone()
    }

    /// Commands that completed against `host`, in order.
    #[must_use]
    pub fn commands_for(&self, host: &str) -> Vec<String> {
        lock(&self.ledger)
            .commands
            .get(host)
            .cloned()
            .unwrap_or_default()
    }

    /// Connection targets passed to [`Connector::open`], in call order.
    #[must_use]
    pub fn targets(&self) -> Vec<ConnectTarget> {
        lock(&self.ledger).targets.clone()
    }

    /// Sessions currently open and not yet closed or dropped.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        lock(&self.ledger).active
    }

    /// Highest number of sessions that were open at the same time.
    #[must_use]
    pub fn max_concurrent_sessions(&self) -> usize {
        lock(&self.ledger).peak
    }
}

impl Connector for ScriptedConnector {
    type Session = ScriptedSession;

    fn open<'a>(&'a self, target: &'a ConnectTarget) -> SessionFuture<'a, ScriptedSession> {
        Box::pin(async move {
            let script = {
                let mut ledger = lock(&self.ledger);
                ledger.targets.push(target.clone());
                ledger.script(&target.host)
            };
            if let Some(delay) = script.connect_delay {
                tokio::time::sleep(delay).await;
            }
            if script.refuse {
                return Err(SessionError::Connect {
                    host: target.host.clone(),
                    message: String::from("connection refused"),
                });
            }

            let mut ledger = lock(&self.ledger);
            ledger.opened.push(target.host.clone());
            ledger.active += 1;
            ledger.peak = ledger.peak.max(ledger.active);
            drop(ledger);

            Ok(ScriptedSession {
                host: target.host.clone(),
                ledger: Arc::clone(&self.ledger),
                completed: 0,
                open: true,
            })
        })
    }
}

/// Session produced by [`ScriptedConnector`].
///
/// Understands `echo`, `echo ... >&2`, `exit N`, `sleep N`, `true` and
/// `false`. Anything else exits with status 127.
#[derive(Debug)]
pub struct ScriptedSession {
    host: String,
    ledger: SharedLedger,
    completed: usize,
    open: bool,
}

impl ScriptedSession {
    /// Host this session is connected to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    fn release(&mut self, record_close: bool) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut ledger = lock(&self.ledger);
        ledger.active = ledger.active.saturating_sub(1);
        if record_close {
            ledger.closed.push(self.host.clone());
        }
    }
}

impl Session for ScriptedSession {
    fn run_command<'a>(&'a mut self, command: &'a str) -> SessionFuture<'a, CommandResult> {
        Box::pin(async move {
            if !self.open {
                return Err(SessionError::Closed {
                    host: self.host.clone(),
                });
            }
            let script = lock(&self.ledger).script(&self.host);
            if script.drop_after.is_some_and(|limit| self.completed >= limit) {
                return Err(SessionError::Transport {
                    host: self.host.clone(),
                    message: String::from("connection reset by peer"),
                });
            }
            if let Some(delay) = script.command_delay {
                tokio::time::sleep(delay).await;
            }

            let result = simulate(command).await;
            self.completed += 1;
            lock(&self.ledger)
                .commands
                .entry(self.host.clone())
                .or_default()
                .push(command.to_owned());
            Ok(result)
        })
    }

    fn close(&mut self) -> CloseFuture<'_> {
        Box::pin(async move {
            if !self.open {
                return;
            }
            let delay = lock(&self.ledger).script(&self.host).close_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.release(true);
        })
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.release(false);
    }
}

async fn simulate(command: &str) -> CommandResult {
    let trimmed = command.trim();
    let (word, rest) = trimmed
        .split_once(char::is_whitespace)
        .map_or((trimmed, ""), |(head, tail)| (head, tail.trim()));
    match word {
        "true" => CommandResult::new(0, "", ""),
        "false" => CommandResult::new(1, "", ""),
        "exit" => CommandResult::new(rest.parse().unwrap_or(2), "", ""),
        "sleep" => {
            let secs: u64 = rest.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_secs(secs)).await;
            CommandResult::new(0, "", "")
        }
        "echo" => match rest.strip_suffix(">&2") {
            Some(text) => CommandResult::new(0, "", format!("{}\n", text.trim_end())),
            None => CommandResult::new(0, format!("{rest}\n"), ""),
        },
        _ => CommandResult::new(127, "", format!("sh: {word}: not found\n")),
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        Self::apply(pairs, &[]).await
    }

    /// Sets `pairs` and removes `unset` while holding a global mutex.
    pub async fn apply(pairs: &[(&str, &str)], unset: &[&str]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs
                    .iter()
                    .map(|(key, _)| *key)
                    .chain(unset.iter().copied())
                    .all(|key| seen.insert(key))
            },
            "duplicate environment variable keys passed to EnvGuard"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len() + unset.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
        }
        for key in unset {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in self.previous.iter().rev() {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("echo hi", CommandResult::new(0, "hi\n", ""))]
    #[case("echo oops >&2", CommandResult::new(0, "", "oops\n"))]
    #[case("exit 7", CommandResult::new(7, "", ""))]
    #[case("false", CommandResult::new(1, "", ""))]
    #[case("frobnicate --now", CommandResult::new(127, "", "sh: frobnicate: not found\n"))]
    #[tokio::test]
    async fn simulated_shell_understands_builtins(
        #[case] command: &str,
        #[case] expected: CommandResult,
    ) {
        assert_eq!(simulate(command).await, expected);
    }

    #[tokio::test]
    async fn dropped_session_is_not_counted_as_closed() {
        let connector = ScriptedConnector::new();
        let session = connector
            .open(&ConnectTarget::new("a"))
            .await
            .expect("open should succeed");
        assert_eq!(connector.active_sessions(), 1);

        drop(session);

        assert_eq!(connector.active_sessions(), 0);
        assert!(connector.closed_hosts().is_empty());
    }
}
