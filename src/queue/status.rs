//! Operator-facing queue snapshots.

use serde::Serialize;

/// Per-group snapshot of lane state and pending work.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub active_message: bool,
    pub idle_waiting: bool,
    pub pending_messages: bool,
    pub retry_count: u32,
    pub active_task: bool,
    pub pending_task_ids: Vec<String>,
}

impl GroupStatus {
    /// Whether this group has anything running or queued.
    pub fn has_activity(&self) -> bool {
        self.active_message
            || self.active_task
            || self.pending_messages
            || !self.pending_task_ids.is_empty()
    }
}

/// Whole-queue snapshot for `/status`-style introspection.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub active_count: usize,
    pub max_concurrent: usize,
    pub shutting_down: bool,
    /// Groups deferred because the cap was reached, in FIFO order.
    pub waiting: Vec<String>,
    /// Groups with any active or pending work.
    pub groups: Vec<GroupStatus>,
}
