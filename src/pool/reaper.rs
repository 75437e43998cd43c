//! Background eviction of idle clients

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::ClientPool;

/// Handle to the periodic idle sweep
pub struct Reaper {
    shutdown_tx: mpsc::Sender<()>,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Reaper {
    /// Sweep `pool` every `interval`, closing clients idle for `idle_timeout`.
    /// The task exits on [`Reaper::stop`] or once the pool is dropped.
    pub(super) fn spawn(pool: Weak<ClientPool>, interval: Duration, idle_timeout: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let running = Arc::new(AtomicBool::new(true));

        info!(
            "Starting idle reaper (interval: {:?}, idle timeout: {:?})",
            interval, idle_timeout
        );

        let flag = Arc::clone(&running);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.recv() => break,
                }

                let Some(pool) = pool.upgrade() else {
                    debug!("Client pool dropped, reaper exiting");
                    break;
                };
                pool.evict_idle(idle_timeout).await;
            }

            flag.store(false, Ordering::SeqCst);
            info!("Idle reaper stopped");
        });

        Self {
            shutdown_tx,
            running,
            task,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the sweep loop and wait for it to exit
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}
