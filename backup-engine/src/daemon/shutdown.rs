//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the run token: the scanner stops producing, workers stop
//! taking new files, in-flight uploads finish and the catalog is persisted
//! before the process exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    cancel: CancellationToken,
    interrupted: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the run was stopped by a signal rather than by itself.
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Cancel the run as if a signal had arrived.
    pub fn trigger(&self, reason: &str) {
        if !self.interrupted.swap(true, Ordering::SeqCst) {
            info!("Received {}, finishing in-flight uploads and saving the catalog...", reason);
        }
        self.cancel.cancel();
    }

    /// Watch for SIGINT/SIGTERM in the background until the token is
    /// cancelled for any reason.
    pub fn listen(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                reason = wait_for_signal() => this.trigger(reason),
                _ = this.cancel.cancelled() => {}
            }
        })
    }
}

async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
