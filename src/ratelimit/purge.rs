//! Periodic background purge.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::controller::AdmissionController;

/// Shortest accepted purge interval.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running purge task.
///
/// Dropping the handle stops the task at its next wake-up; call
/// [`PurgeTask::shutdown`] to stop it and wait for it to finish.
#[derive(Debug)]
pub struct PurgeTask {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl PurgeTask {
    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.handle).await;
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl AdmissionController {
    /// Spawn a Tokio task that purges this controller every `interval`.
    ///
    /// The task holds only a weak reference and exits on its own once the
    /// controller is dropped. Must be called from within a Tokio runtime.
    pub fn spawn_purge_task(self: &Arc<Self>, interval: Duration) -> PurgeTask {
        let interval = interval.max(MIN_INTERVAL);
        let controller = Arc::downgrade(self);
        let (stop, stopped) = oneshot::channel();

        debug!(
            policy = %self.name(),
            interval_ms = interval.as_millis() as u64,
            "Starting purge task"
        );

        let handle = tokio::spawn(run_purge_loop(controller, interval, stopped));
        PurgeTask {
            stop: Some(stop),
            handle,
        }
    }
}

async fn run_purge_loop(
    controller: Weak<AdmissionController>,
    interval: Duration,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            // Fires on an explicit stop and when the handle is dropped
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.purge();
            }
        }
    }

    debug!("Purge task stopped");
}
