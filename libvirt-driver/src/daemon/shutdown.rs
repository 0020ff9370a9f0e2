//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the job token; the host adapter then stops issuing
//! lifecycle calls and the session tears down its subprocess.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token observed by the running job
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT) and cancel the job
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        #[cfg(unix)]
        let terminate = async move {
            terminate.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), cancelling job...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling job...");
            }
        }

        self.token.cancel();
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
