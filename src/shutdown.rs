use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::queue::BuildQueue;

/// Begin an orderly shutdown of the scheduler.
///
/// The fleet starts quiescing, which holds back flyweight placement and
/// surfaces a shutting-down cause on buildable items, and the queue
/// contents are persisted so queued work is rescheduled on the next start.
pub fn begin_shutdown(queue: &BuildQueue) {
    queue.fleet().set_quiescing(true);
    queue.save();
}

/// Wire SIGTERM and SIGINT to an orderly scheduler shutdown.
///
/// Both handlers are registered before this returns. On the first signal
/// the queue quiesces and saves via [`begin_shutdown`], then the returned
/// token is cancelled; executor agents watch it and drain gracefully.
pub fn install_shutdown_handler(queue: Arc<BuildQueue>) -> Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let handler_token = token.clone();
    tokio::spawn(async move {
        let caught = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = caught, "shutting the build queue down");
        begin_shutdown(&queue);
        handler_token.cancel();
    });

    Ok(token)
}
