//! Signal handling for graceful shutdown

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, warn};

/// Handles shutdown signals (SIGTERM, SIGINT)
///
/// Handlers are registered on construction so a signal arriving before
/// `wait` is polled is not lost.
pub struct ShutdownSignal {
    sigterm: Option<Signal>,
    sigint: Option<Signal>,
}

impl ShutdownSignal {
    /// Register the signal handlers; must be called inside a runtime
    pub fn new() -> Self {
        Self {
            sigterm: register(SignalKind::terminate(), "SIGTERM"),
            sigint: register(SignalKind::interrupt(), "SIGINT"),
        }
    }

    /// Wait for a shutdown signal
    pub async fn wait(&mut self) {
        tokio::select! {
            _ = recv(&mut self.sigterm) => {
                debug!("received SIGTERM");
            }
            _ = recv(&mut self.sigint) => {
                debug!("received SIGINT");
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

fn register(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!(signal = name, error = %e, "failed to register signal handler");
            None
        }
    }
}

/// Pending forever if the handler could not be registered
async fn recv(signal: &mut Option<Signal>) {
    match signal {
        Some(signal) => {
            signal.recv().await;
        }
        None => std::future::pending().await,
    }
}
