use crate::services::lifecycle::UploadLifecycleMonitor;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, interval};

/// Periodically evicts upload sessions that were never completed
pub struct SessionSweeper {
    monitor: Arc<UploadLifecycleMonitor>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl SessionSweeper {
    pub fn new(
        monitor: Arc<UploadLifecycleMonitor>,
        period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            monitor,
            period: period.max(Duration::from_millis(1)),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Session sweeper started (every {:?})", self.period);
        let mut ticker = interval(self.period);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Session sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }

    fn sweep(&self) {
        let evicted = self.monitor.sweep_expired();
        if evicted > 0 {
            tracing::info!("🧹 Swept {} stale upload sessions, {} still tracked", evicted, self.monitor.len());
        } else {
            tracing::debug!(tracked = self.monitor.len(), "Session sweep found nothing to evict");
        }
    }
}
