use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Shutdown state machine
///
/// States:
/// 1. Running - normal operation
/// 2. Draining - background loops stop, firewall schedules and grace grants wind down
/// 3. Terminated - cleanup finished or timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Broadcasts the shutdown state to every background task.
pub struct ShutdownManager {
    state: watch::Sender<ShutdownState>,

    /// Upper bound on the cleanup phase
    timeout: Duration,
}

impl ShutdownManager {
    pub fn new(timeout: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ShutdownState::Running);
        Arc::new(Self { state, timeout })
    }

    /// Get current state
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Start draining (called on SIGTERM/SIGINT)
    pub fn start_drain(&self) {
        if self.state() != ShutdownState::Running {
            return;
        }

        info!(timeout_secs = self.timeout.as_secs(), "starting graceful shutdown");
        self.state.send_replace(ShutdownState::Draining);
    }

    /// Complete shutdown
    pub fn terminate(&self) {
        if self.state() == ShutdownState::Terminated {
            return;
        }

        info!("shutdown complete");
        self.state.send_replace(ShutdownState::Terminated);
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }
}

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_state_machine() {
        let manager = ShutdownManager::new(Duration::from_secs(10));

        assert_eq!(manager.state(), ShutdownState::Running);
        assert!(manager.is_running());

        manager.start_drain();
        assert_eq!(manager.state(), ShutdownState::Draining);
        assert!(!manager.is_running());

        manager.terminate();
        assert_eq!(manager.state(), ShutdownState::Terminated);

        // No way back
        manager.start_drain();
        assert_eq!(manager.state(), ShutdownState::Terminated);
    }

    #[tokio::test]
    async fn test_subscribers_see_drain() {
        let manager = ShutdownManager::new(Duration::from_secs(10));
        let mut rx = manager.subscribe();

        manager.start_drain();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ShutdownState::Draining);
    }
}
