use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::services::SyncClient;

/// Background replay of the sync queue.
///
/// Runs one pass every time connectivity goes from offline to online and
/// another on every interval tick, until the returned handle is shut down.
pub struct SyncScheduler {
    client: Arc<SyncClient>,
    interval: Duration,
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the loop and waits for an in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Sync scheduler task ended abnormally: {}", e);
        }
    }
}

impl SyncScheduler {
    pub fn new(client: Arc<SyncClient>, interval: Duration) -> Self {
        Self { client, interval }
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, rx) = watch::channel(false);
        let mut online = self.client.connectivity().subscribe();
        let was_online = *online.borrow_and_update();
        let task = tokio::spawn(self.run(rx, online, was_online));
        SchedulerHandle { shutdown, task }
    }

    async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        mut online: watch::Receiver<bool>,
        mut was_online: bool,
    ) {
        info!("Starting sync scheduler (interval: {:?})", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_online = *online.borrow_and_update();
                    if now_online && !was_online {
                        info!("Connection restored, replaying sync queue");
                        self.run_replay().await;
                    }
                    was_online = now_online;
                }
                _ = ticker.tick() => self.run_replay().await,
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn run_replay(&self) {
        match self.client.replay_queue().await {
            Ok(Some(stats)) => {
                if stats.succeeded + stats.retrying + stats.dead_lettered > 0 {
                    info!(
                        "Auto-replay completed - Succeeded: {} | Retrying: {} | Dead: {} | Deferred: {}",
                        stats.succeeded, stats.retrying, stats.dead_lettered, stats.deferred
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Auto-replay failed: {}", e);
            }
        }
    }
}
