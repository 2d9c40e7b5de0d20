//! Error types for convoy.

use std::path::PathBuf;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),
}

/// Group-queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is shutting down, rejected enqueue for group {group}")]
    ShuttingDown { group: String },

    #[error("No message handler installed")]
    NoHandler,
}

/// IPC drop-dir errors.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize IPC payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persistent-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),
}

/// Scheduled-task errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid group folder '{folder}' for task {task_id}")]
    InvalidGroupFolder { task_id: String, folder: String },

    #[error("No registered group for folder '{folder}'")]
    GroupNotRegistered { folder: String },

    #[error("Invalid schedule for task {task_id}: {reason}")]
    InvalidSchedule { task_id: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Chat-transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No transport owns jid {0}")]
    NoTransportForJid(String),

    #[error("Send failed on {transport} for {jid}: {reason}")]
    SendFailed {
        transport: String,
        jid: String,
        reason: String,
    },

    #[error("Transport {0} is not connected")]
    NotConnected(String),
}

/// Container-runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Failed to spawn container for group {group}: {reason}")]
    SpawnFailed { group: String, reason: String },

    #[error("Container for group {group} exited with error: {reason}")]
    Exited { group: String, reason: String },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
