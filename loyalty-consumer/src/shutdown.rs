//! Turns SIGINT/SIGTERM into cooperative cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::ShutdownError;

#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// The token raised when shutdown begins. Clones observe the same signal.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }


    /// Spawn a task that cancels the token on the first SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let token = self.token.clone();

        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };

            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => info!("Received SIGINT"),
                    Err(e) => error!("Failed to listen for SIGINT: {}", e),
                },
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = token.cancelled() => return,
            }

            info!("Shutting down gracefully");
            token.cancel();
        })
    }

    /// Cancel the token and wait for `work` to finish, giving up after the
    /// drain timeout.
    pub async fn drain<F, T>(&self, work: F) -> Result<T, ShutdownError>
    where
        F: Future<Output = T>,
    {
        self.token.cancel();

        tokio::time::timeout(self.drain_timeout, work)
            .await
            .map_err(|_| ShutdownError::Timeout(self.drain_timeout))
    }
}
