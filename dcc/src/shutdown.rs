//! Cleanup on termination signals.
//!
//! SIGTERM, SIGINT and SIGHUP remove every registered temp and state file,
//! then exit with `128 + signo`.

use dcc_common::cleanup;
use tracing::warn;

/// Spawn the signal watcher on the current runtime.
pub fn install_cleanup_handler() {
    tokio::spawn(async {
        let Some(signo) = wait_for_signal().await else {
            return;
        };
        warn!(signal = signo, "terminated by signal, cleaning up");
        cleanup::cleanup_all();
        std::process::exit(128 + signo);
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> Option<i32> {
    use tokio::signal::unix::SignalKind;

    let mut sigterm = install(SignalKind::terminate())?;
    let mut sigint = install(SignalKind::interrupt())?;
    let mut sighup = install(SignalKind::hangup())?;

    let kind = tokio::select! {
        _ = sigterm.recv() => SignalKind::terminate(),
        _ = sigint.recv() => SignalKind::interrupt(),
        _ = sighup.recv() => SignalKind::hangup(),
    };
    Some(kind.as_raw_value())
}

#[cfg(unix)]
fn install(kind: tokio::signal::unix::SignalKind) -> Option<tokio::signal::unix::Signal> {
    match tokio::signal::unix::signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("failed to install handler for signal {}: {e}", kind.as_raw_value());
            None
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Option<i32> {
    const SIGINT: i32 = 2;
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some(SIGINT),
        Err(e) => {
            warn!("failed to install Ctrl-C handler: {e}");
            None
        }
    }
}
