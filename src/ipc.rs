//! IPC drop-dir — the filesystem contract with running containers.
//!
//! Each active container watches `<data_dir>/ipc/<group_folder>/input/`.
//! The core drops two kinds of artifacts there: input envelopes (follow-up
//! messages for an idle-waiting container) and the `_close` sentinel, which
//! the container treats as "drain and exit". Envelope writes are atomic
//! (write `.tmp`, then rename) so the container never reads a half-written
//! file.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::IpcError;

/// Filename of the close sentinel.
pub const CLOSE_SENTINEL: &str = "_close";

/// Filename of the reply-context file cleared before task runs.
pub const REPLY_CONTEXT_FILE: &str = "reply_context.json";

const TASKS_SNAPSHOT_FILE: &str = "tasks.json";
const QUEUE_STATUS_SNAPSHOT_FILE: &str = "queue_status.json";

/// An input line delivered to a running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl InputEnvelope {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            text: text.into(),
        }
    }
}

/// `<data_dir>/ipc/<group_folder>`
pub fn group_dir(data_dir: &Path, group_folder: &str) -> PathBuf {
    data_dir.join("ipc").join(group_folder)
}

/// `<data_dir>/ipc/<group_folder>/input`
pub fn input_dir(data_dir: &Path, group_folder: &str) -> PathBuf {
    group_dir(data_dir, group_folder).join("input")
}

/// Atomically write an input envelope into the group's drop-dir.
///
/// Returns the path of the delivered file. The directory is created on
/// demand; the filename is `<epoch_ms>-<rand4>.json`, unique enough that
/// concurrent writers never collide.
pub fn write_input_envelope(
    data_dir: &Path,
    group_folder: &str,
    text: &str,
) -> Result<PathBuf, IpcError> {
    let dir = input_dir(data_dir, group_folder);
    std::fs::create_dir_all(&dir).map_err(|source| IpcError::Write {
        path: dir.clone(),
        source,
    })?;

    let name = format!("{}-{}.json", Utc::now().timestamp_millis(), rand4());
    let final_path = dir.join(&name);
    let tmp_path = dir.join(format!("{name}.tmp"));

    let payload = serde_json::to_vec(&InputEnvelope::message(text))?;
    std::fs::write(&tmp_path, payload).map_err(|source| IpcError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, &final_path).map_err(|source| IpcError::Write {
        path: final_path.clone(),
        source,
    })?;

    debug!(path = %final_path.display(), "Input envelope delivered");
    Ok(final_path)
}

/// Drop the `_close` sentinel into the group's drop-dir.
pub fn write_close_sentinel(data_dir: &Path, group_folder: &str) -> Result<(), IpcError> {
    let dir = input_dir(data_dir, group_folder);
    std::fs::create_dir_all(&dir).map_err(|source| IpcError::Write {
        path: dir.clone(),
        source,
    })?;

    let path = dir.join(CLOSE_SENTINEL);
    std::fs::write(&path, b"").map_err(|source| IpcError::Write {
        path: path.clone(),
        source,
    })?;

    debug!(path = %path.display(), "Close sentinel written");
    Ok(())
}

/// Remove a stale `reply_context.json` so a task run does not reply-to a
/// message from an earlier interactive conversation. Missing file is fine.
pub fn clear_reply_context(data_dir: &Path, group_folder: &str) {
    let path = group_dir(data_dir, group_folder).join(REPLY_CONTEXT_FILE);
    match std::fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "Cleared stale reply context"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "Failed to clear reply context"),
    }
}

/// Write the scheduled-tasks snapshot the container may read to introspect
/// peer work.
pub fn write_tasks_snapshot<T: Serialize>(
    data_dir: &Path,
    group_folder: &str,
    is_main: bool,
    tasks: &[T],
) -> Result<(), IpcError> {
    let body = serde_json::json!({
        "updated_at": Utc::now().to_rfc3339(),
        "is_main": is_main,
        "tasks": tasks,
    });
    write_snapshot(data_dir, group_folder, TASKS_SNAPSHOT_FILE, &body)
}

/// Write the queue-status snapshot (active/pending work per group).
pub fn write_queue_status_snapshot<E: Serialize, G: Serialize>(
    data_dir: &Path,
    group_folder: &str,
    is_main: bool,
    entries: &[E],
    groups: &[G],
) -> Result<(), IpcError> {
    let body = serde_json::json!({
        "updated_at": Utc::now().to_rfc3339(),
        "is_main": is_main,
        "entries": entries,
        "groups": groups,
    });
    write_snapshot(data_dir, group_folder, QUEUE_STATUS_SNAPSHOT_FILE, &body)
}

fn write_snapshot(
    data_dir: &Path,
    group_folder: &str,
    file: &str,
    body: &serde_json::Value,
) -> Result<(), IpcError> {
    let dir = group_dir(data_dir, group_folder);
    std::fs::create_dir_all(&dir).map_err(|source| IpcError::Write {
        path: dir.clone(),
        source,
    })?;

    let final_path = dir.join(file);
    let tmp_path = dir.join(format!("{file}.tmp"));
    std::fs::write(&tmp_path, serde_json::to_vec(body)?).map_err(|source| IpcError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, &final_path).map_err(|source| IpcError::Write {
        path: final_path,
        source,
    })
}

/// Four hex chars of filename entropy.
fn rand4() -> String {
    Uuid::new_v4().simple().to_string()[..4].to_string()
}
