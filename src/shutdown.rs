//! Shutdown controller — stop taking work, detach what is running.
//!
//! Shutdown never kills containers. Transport reconnects restart this
//! process often enough that killing would interrupt productive work
//! mid-reply; the containers' own `--rm` self-exit plus the runtime's
//! first-output and idle timeouts guarantee eventual cleanup.

use tracing::info;

use crate::queue::GroupQueue;
use crate::scheduler::Scheduler;

/// Coordinates an orderly stop of the queue and the task scheduler.
pub struct ShutdownController {
    queue: GroupQueue,
    scheduler: Scheduler,
}

impl ShutdownController {
    pub fn new(queue: GroupQueue, scheduler: Scheduler) -> Self {
        Self { queue, scheduler }
    }

    /// Flip both shutting-down flags and log every in-flight container as
    /// detached. Returns how many containers were left running.
    pub fn shutdown(&self) -> usize {
        info!("Shutting down: rejecting new work");
        self.scheduler.begin_shutdown();

        let handles = self.queue.begin_shutdown();
        for handle in &handles {
            info!(
                group = %handle.group,
                lane = %handle.lane,
                container = %handle.container_name,
                pid = handle.pid,
                "Detached running container"
            );
        }
        info!(detached = handles.len(), "Shutdown complete");
        handles.len()
    }
}
