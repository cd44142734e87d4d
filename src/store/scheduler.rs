//! Anti-entropy Scheduler
//!
//! Drives a periodic repair round after an initial delay until stopped.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::Result;

/// Something that can run one anti-entropy round
#[async_trait]
pub trait AntiEntropy: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Run one round against a randomly chosen peer
    async fn anti_entropy_tick(&self) -> Result<()>;
}

/// Background task calling [`AntiEntropy::anti_entropy_tick`] periodically
pub struct AntiEntropyScheduler {
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AntiEntropyScheduler {
    /// Start the task
    pub fn start(target: Arc<dyn AntiEntropy>, initial_delay: Duration, period: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!("Anti-entropy for {} scheduled every {:?}", target.name(), period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // a failed round must not stop the schedule
                        if let Err(e) = target.anti_entropy_tick().await {
                            tracing::debug!("Anti-entropy round for {} failed: {}", target.name(), e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Anti-entropy for {} stopped", target.name());
        });

        Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the task and wait for an in-flight round to finish
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
