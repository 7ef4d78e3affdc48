//! Process-wide cancellation signal.
//!
//! A `watch` channel carrying `true` once shutdown starts. Every long-running
//! loop selects on [`cancelled`] next to its own work.

use tokio::sync::watch;

/// Create a shutdown signal in the "running" state.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once shutdown is signalled or the sender is dropped.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}
