//! Container identity and the runtime wrapper interface.
//!
//! The orchestrator never spawns processes itself; it hands a
//! [`ContainerInput`] to a [`ContainerRuntime`] and consumes framed output
//! events from a channel. What the core keeps is a [`ContainerHandle`] per
//! lane — enough identity to compute the IPC drop-dir and to log a detach at
//! shutdown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ContainerError;
use crate::registry::GroupJid;

/// The two independent execution streams within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Message,
    Task,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Message => f.write_str("message"),
            Lane::Task => f.write_str("task"),
        }
    }
}

/// Registration record for a spawned container.
///
/// One handle per lane; registering a lane replaces only that lane's slot,
/// so a task container never clobbers the message container's identity.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub group: GroupJid,
    pub lane: Lane,
    /// Folder backing the group's IPC drop-dir.
    pub group_folder: String,
    /// Logical container name, as reported by the runtime at spawn.
    pub container_name: String,
    pub pid: Option<u32>,
}

/// Input record handed to the container runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(default)]
    pub is_scheduled_task: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
}

/// A framed output event from a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// The agent produced a result; `result` may be empty for pure
    /// tool-usage turns.
    Success {
        result: Option<String>,
        new_session_id: Option<String>,
    },
    Error { message: String },
}

/// Events delivered over the run channel, in arrival order.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Fires once, when the process is up.
    Spawned {
        container_name: String,
        pid: Option<u32>,
    },
    Output(OutputEvent),
}

/// Terminal status of a container run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
}

/// Final outcome of a container run, after the event stream has closed.
#[derive(Debug, Clone)]
pub struct ContainerOutcome {
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub new_session_id: Option<String>,
}

/// The container runtime wrapper, consumed by the message pipeline and the
/// task scheduler.
///
/// Implementations spawn the agent subprocess, emit [`RunEvent::Spawned`]
/// once, then one [`RunEvent::Output`] per framed output event, and resolve
/// with the final outcome after the process exits. Event handling order is
/// preserved: the consumer processes each event to completion before the
/// next is delivered.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run_agent(
        &self,
        input: ContainerInput,
        events: mpsc::Sender<RunEvent>,
    ) -> Result<ContainerOutcome, ContainerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_display() {
        assert_eq!(Lane::Message.to_string(), "message");
        assert_eq!(Lane::Task.to_string(), "task");
    }

    #[test]
    fn container_input_serialization_omits_absent_fields() {
        let input = ContainerInput {
            prompt: "hello".to_string(),
            session_id: None,
            group_folder: "family".to_string(),
            chat_jid: "xyz@g.us".to_string(),
            is_main: false,
            is_scheduled_task: false,
            assistant_name: None,
        };
        let json = serde_json::to_value(&input).unwrap();
        assert!(json.get("session_id").is_none());
        assert!(json.get("assistant_name").is_none());
        assert_eq!(json["group_folder"], "family");
    }
}
