//! Operator interrupts wired to a cancellation token.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Installs a handler that cancels the returned token on SIGINT (Ctrl+C)
/// or, on Unix, SIGTERM.
///
/// Must be called from within a Tokio runtime. When the signal handlers
/// cannot be installed the token is simply never cancelled.
#[must_use]
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    drop(cancel_when(token.clone(), wait_for_signal()));
    token
}

/// Cancels `token` once `signal` completes, unless the token is cancelled
/// first.
pub fn cancel_when<F>(token: CancellationToken, signal: F) -> JoinHandle<()>
where
    F: Future<Output = Option<&'static str>> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => {}
            received = signal => {
                if let Some(name) = received {
                    tracing::warn!(signal = name, "interrupt received; cancelling remaining jobs");
                    token.cancel();
                }
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> Option<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            return interrupt().await;
        }
    };
    tokio::select! {
        received = interrupt() => received,
        _ = terminate.recv() => Some("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Option<&'static str> {
    interrupt().await
}

async fn interrupt() -> Option<&'static str> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some("SIGINT"),
        Err(err) => {
            tracing::warn!(error = %err, "failed to install Ctrl+C handler");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn signal_cancels_token() {
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel::<()>();
        let watcher = cancel_when(token.clone(), async move { rx.await.ok().map(|()| "TEST") });

        tx.send(()).expect("receiver should be alive");
        watcher.await.expect("watcher should finish");

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn failed_signal_install_leaves_token_alone() {
        let token = CancellationToken::new();

        cancel_when(token.clone(), async { None })
            .await
            .expect("watcher should finish");

        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn watcher_exits_when_token_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let watcher = cancel_when(token.clone(), std::future::pending());

        token.cancel();

        watcher.await.expect("watcher should finish");
    }
}
