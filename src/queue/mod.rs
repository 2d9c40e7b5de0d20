//! Group execution queue — per-group dual-lane scheduling under a global
//! concurrency cap.

mod group_queue;
mod status;

pub use group_queue::{GroupQueue, MessageHandler, TaskJob};
pub use status::{GroupStatus, QueueStatus};
