//! Core types for scheduled tasks.
//!
//! A scheduled task is a durable row: a prompt executed against a group on a
//! cron, interval, or one-shot schedule. The scheduler advances `next_run`
//! BEFORE each execution so a crash mid-run can never double-fire; for
//! one-shot tasks the advanced value is a far-future sentinel that startup
//! recovery recognizes as "picked up but never finished".

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// `next_run` value of a one-shot task that has been picked up but whose
/// completion was never recorded.
pub const ONCE_SENTINEL: &str = "9999-01-01T00:00:00.000Z";

/// Maximum stored length of a task-run result summary.
pub const RESULT_SUMMARY_MAX: usize = 200;

/// How a task's `schedule_value` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// `schedule_value` is a cron expression, evaluated in the configured
    /// timezone.
    Cron,
    /// `schedule_value` is an interval in milliseconds, as a decimal string.
    Interval,
    /// `schedule_value` is an ISO-8601 timestamp; the task fires once.
    Once,
}

impl ScheduleKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            ScheduleKind::Cron => "cron",
            ScheduleKind::Interval => "interval",
            ScheduleKind::Once => "once",
        }
    }
}

impl FromStr for ScheduleKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(ScheduleKind::Cron),
            "interval" => Ok(ScheduleKind::Interval),
            "once" => Ok(ScheduleKind::Once),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }
}

/// Whether a task run shares the group's conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Fresh session per run.
    Isolated,
    /// Run inside the group's current session.
    Group,
}

impl ContextMode {
    pub fn type_tag(&self) -> &'static str {
        match self {
            ContextMode::Isolated => "isolated",
            ContextMode::Group => "group",
        }
    }
}

impl FromStr for ContextMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isolated" => Ok(ContextMode::Isolated),
            "group" => Ok(ContextMode::Group),
            other => Err(format!("unknown context mode: {other}")),
        }
    }
}

/// Lifecycle state of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

impl TaskStatus {
    pub fn type_tag(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A durable scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_kind: ScheduleKind,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub status: TaskStatus,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    /// Additional group jids that receive this task's output.
    pub extra_chat_jids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Build a new active task with its initial `next_run` computed from
    /// the schedule.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        group_folder: impl Into<String>,
        chat_jid: impl Into<String>,
        prompt: impl Into<String>,
        schedule_kind: ScheduleKind,
        schedule_value: impl Into<String>,
        context_mode: ContextMode,
        tz: Tz,
    ) -> Result<Self, TaskError> {
        let id = id.into();
        let schedule_value = schedule_value.into();
        let now = Utc::now();
        let next_run = initial_next_run(&id, schedule_kind, &schedule_value, now, tz)?;
        Ok(Self {
            id,
            group_folder: group_folder.into(),
            chat_jid: chat_jid.into(),
            prompt: prompt.into(),
            schedule_kind,
            schedule_value,
            context_mode,
            status: TaskStatus::Active,
            next_run,
            last_run: None,
            last_result: None,
            extra_chat_jids: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// A once-task that was picked up (its `next_run` advanced to the
    /// sentinel) but whose completion was never recorded.
    pub fn is_stuck_once(&self) -> bool {
        self.status == TaskStatus::Active
            && self.last_run.is_none()
            && self.next_run.is_some_and(is_sentinel)
    }
}

/// An append-only record of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub task_id: String,
    pub run_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: RunOutcome,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Terminal state of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Error,
}

impl RunOutcome {
    pub fn type_tag(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Error => "error",
        }
    }
}

impl FromStr for RunOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunOutcome::Success),
            "error" => Ok(RunOutcome::Error),
            other => Err(format!("unknown run outcome: {other}")),
        }
    }
}

// ── next_run computation ────────────────────────────────────────────

/// Parse the once-sentinel as a concrete timestamp.
pub fn once_sentinel() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ONCE_SENTINEL)
        .expect("sentinel constant is valid RFC 3339")
        .with_timezone(&Utc)
}

/// Whether a `next_run` value is the once-sentinel (any year ≥ 9990 counts,
/// matching the store's string-prefix comparison).
pub fn is_sentinel(next_run: DateTime<Utc>) -> bool {
    use chrono::Datelike;
    next_run.year() >= 9990
}

/// The value `next_run` must be advanced to BEFORE the container is spawned.
pub fn next_run_before_execution(
    task: &ScheduledTask,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<DateTime<Utc>, TaskError> {
    match task.schedule_kind {
        ScheduleKind::Cron => next_cron_fire(&task.id, &task.schedule_value, now, tz),
        ScheduleKind::Interval => Ok(now + interval_duration(&task.id, &task.schedule_value)?),
        ScheduleKind::Once => Ok(once_sentinel()),
    }
}

/// The final `next_run` recorded after the run completes: `None` retires a
/// once-task, the others reschedule from completion time.
pub fn next_run_after_execution(
    task: &ScheduledTask,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<DateTime<Utc>>, TaskError> {
    match task.schedule_kind {
        ScheduleKind::Cron => next_cron_fire(&task.id, &task.schedule_value, now, tz).map(Some),
        ScheduleKind::Interval => {
            Ok(Some(now + interval_duration(&task.id, &task.schedule_value)?))
        }
        ScheduleKind::Once => Ok(None),
    }
}

/// `next_run` for a freshly created task.
pub fn initial_next_run(
    task_id: &str,
    kind: ScheduleKind,
    value: &str,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<DateTime<Utc>>, TaskError> {
    match kind {
        ScheduleKind::Cron => next_cron_fire(task_id, value, now, tz).map(Some),
        ScheduleKind::Interval => Ok(Some(now + interval_duration(task_id, value)?)),
        ScheduleKind::Once => {
            let at = DateTime::parse_from_rfc3339(value).map_err(|e| {
                TaskError::InvalidSchedule {
                    task_id: task_id.to_string(),
                    reason: format!("invalid once timestamp '{value}': {e}"),
                }
            })?;
            Ok(Some(at.with_timezone(&Utc)))
        }
    }
}

/// Next fire time of a cron expression after `now`, evaluated in `tz`.
///
/// Five-field expressions are accepted by prepending a seconds field.
fn next_cron_fire(
    task_id: &str,
    expr: &str,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<DateTime<Utc>, TaskError> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    let schedule =
        cron::Schedule::from_str(&normalized).map_err(|e| TaskError::InvalidSchedule {
            task_id: task_id.to_string(),
            reason: format!("invalid cron '{expr}': {e}"),
        })?;
    schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| TaskError::InvalidSchedule {
            task_id: task_id.to_string(),
            reason: format!("cron '{expr}' never fires again"),
        })
}

fn interval_duration(task_id: &str, value: &str) -> Result<chrono::Duration, TaskError> {
    let ms: i64 = value.parse().map_err(|_| TaskError::InvalidSchedule {
        task_id: task_id.to_string(),
        reason: format!("invalid interval milliseconds '{value}'"),
    })?;
    if ms <= 0 {
        return Err(TaskError::InvalidSchedule {
            task_id: task_id.to_string(),
            reason: format!("interval must be positive, got {ms}"),
        });
    }
    Ok(chrono::Duration::milliseconds(ms))
}

/// Compress a container result into a stored summary (≤ 200 chars, on a
/// char boundary).
pub fn summarize_result(result: &str) -> String {
    let trimmed = result.trim();
    if trimmed.chars().count() <= RESULT_SUMMARY_MAX {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(RESULT_SUMMARY_MAX - 1).collect();
    format!("{cut}…")
}

/// Serialize a timestamp the way task rows store them.
pub fn to_stored_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Folder names come from legacy rows and user input; anything that could
/// escape the IPC root pauses the task instead of churning retries.
pub fn is_valid_group_folder(folder: &str) -> bool {
    !folder.is_empty()
        && !folder.contains("..")
        && !folder.contains('/')
        && !folder.contains('\\')
        && folder != "."
}
