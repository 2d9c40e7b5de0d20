//! Scheduled-task subsystem: the durable task model and the polling engine
//! that dispatches due tasks onto group task lanes.

pub mod engine;
pub mod task;

pub use engine::Scheduler;
pub use task::{ContextMode, ScheduleKind, ScheduledTask, TaskRunRecord, TaskStatus};
