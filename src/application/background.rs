use super::engine::LeaseEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The engine's periodic work: the idempotency sweeper and the retry poller.
/// Both loops stop when [`BackgroundTasks::shutdown`] is called.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn spawn(engine: Arc<LeaseEngine>, sweep_interval: Duration, poll_interval: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);

        let sweeper = {
            let engine = engine.clone();
            let mut rx = rx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                while !*rx.borrow() {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = engine.sweep_idempotency().await {
                                tracing::error!(error = %e, "idempotency sweep failed");
                            }
                        }
                        _ = rx.changed() => {}
                    }
                }
                tracing::debug!("idempotency sweeper stopped");
            })
        };

        let poller = {
            let mut rx = rx;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval);
                while !*rx.borrow() {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = engine.poll_retries(engine.now()).await {
                                tracing::error!(error = %e, "retry poll failed");
                            }
                            engine.redeliver_dead_letters().await;
                        }
                        _ = rx.changed() => {}
                    }
                }
                tracing::debug!("retry poller stopped");
            })
        };

        Self {
            shutdown,
            handles: vec![sweeper, poller],
        }
    }

    /// Signals both loops and waits for them to finish their current tick.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "background task panicked");
            }
        }
    }
}
