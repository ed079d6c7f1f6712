//! Shutdown coordination
//!
//! A one-way stop flag shared between OS signal handlers and the lifecycle
//! driver. Once signaled it stays signaled.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Cloneable handle to the process-wide stop flag
#[derive(Clone, Debug)]
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Set the flag. Idempotent; never blocks.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_signaled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the flag is set (immediately if it already is)
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|signaled| *signaled).await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a task that maps SIGINT and SIGTERM onto `coordinator.signal()`.
///
/// Must be called from within a tokio runtime.
pub fn listen_for_signals(coordinator: ShutdownCoordinator) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            let sigterm_future = sigterm.recv();
            #[cfg(not(unix))]
            let sigterm_future = std::future::pending::<Option<()>>();

            let name = tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                    "SIGINT"
                }
                _ = sigterm_future => "SIGTERM",
            };

            if coordinator.is_signaled() {
                warn!("Received {}, shutdown already in progress", name);
            } else {
                info!("Received {}, shutting down", name);
                coordinator.signal();
            }
        }
    }))
}
