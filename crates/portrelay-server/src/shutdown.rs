//! Process-wide shutdown signalling.
//!
//! `main` owns the process-wide [`ShutdownTx`] and every listener holds a
//! [`ShutdownRx`] clone. Each listener owns a second channel of the same
//! type to cancel its sessions once the shutdown grace period runs out.

use tokio::sync::watch;

pub type ShutdownTx = watch::Sender<bool>;
pub type ShutdownRx = watch::Receiver<bool>;

/// Create a fresh, un-triggered shutdown channel.
pub fn channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Resolve once `true` has been sent.
///
/// A sender dropped without sending never resolves this.
pub async fn cancelled(rx: &mut ShutdownRx) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
