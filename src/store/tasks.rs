//! TaskStore — durable scheduled-task rows and the append-only run log.
//!
//! `next_run` is stored as RFC 3339 text with millisecond precision in UTC,
//! so lexicographic comparison is chronological and the once-sentinel
//! (`9999-…`) sorts after every real timestamp.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::db::Database;
use crate::error::StoreError;
use crate::scheduler::task::{
    ContextMode, RunOutcome, ScheduleKind, ScheduledTask, TaskRunRecord, TaskStatus,
    to_stored_timestamp,
};

/// Persistent scheduled-task storage backed by SQLite.
pub struct TaskStore {
    db: Arc<Database>,
}

impl TaskStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new task row.
    pub fn create_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO scheduled_tasks (id, group_folder, chat_jid, prompt,
                schedule_type, schedule_value, context_mode, status, next_run,
                last_run, last_result, extra_chat_jids, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            rusqlite::params![
                task.id,
                task.group_folder,
                task.chat_jid,
                task.prompt,
                task.schedule_kind.type_tag(),
                task.schedule_value,
                task.context_mode.type_tag(),
                task.status.type_tag(),
                task.next_run.map(to_stored_timestamp),
                task.last_run.map(to_stored_timestamp),
                task.last_result,
                serde_json::to_string(&task.extra_chat_jids).unwrap_or_else(|_| "[]".to_string()),
                to_stored_timestamp(Utc::now()),
            ],
        )?;
        debug!(task = %task.id, "Scheduled task created");
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_TASK} WHERE id = ?1"))?;
        let mut rows = stmt.query_map(rusqlite::params![id], row_to_task)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn all_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_TASK} ORDER BY created_at ASC"))?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Tasks addressed at a chat, for the IPC tasks snapshot.
    pub fn tasks_for_chat(&self, chat_jid: &str) -> Result<Vec<ScheduledTask>, StoreError> {
        let conn = self.db.conn();
        let mut stmt =
            conn.prepare(&format!("{SELECT_TASK} WHERE chat_jid = ?1 ORDER BY created_at ASC"))?;
        let rows = stmt.query_map(rusqlite::params![chat_jid], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Active tasks whose `next_run` has arrived.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_TASK}
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run ASC"
        ))?;
        let rows = stmt.query_map(rusqlite::params![to_stored_timestamp(now)], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Once-tasks that were picked up but never finished: still active, no
    /// run recorded, `next_run` advanced past the sentinel horizon.
    pub fn stuck_once_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_TASK}
             WHERE status = 'active' AND last_run IS NULL AND next_run > '9990'"
        ))?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE scheduled_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.type_tag(), to_stored_timestamp(Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Persist the advanced `next_run`. Called BEFORE the container spawns;
    /// a failure here aborts the run so the next poll retries it.
    pub fn set_next_run(
        &self,
        id: &str,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE scheduled_tasks SET next_run = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![
                next_run.map(to_stored_timestamp),
                to_stored_timestamp(Utc::now()),
                id
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record a completed run: stamps `last_run`, stores the summary, and
    /// writes the final `next_run` (None retires a once-task).
    pub fn update_after_run(
        &self,
        id: &str,
        next_run: Option<DateTime<Utc>>,
        result_summary: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.db.conn();
        let now = to_stored_timestamp(Utc::now());
        let changed = conn.execute(
            "UPDATE scheduled_tasks
             SET next_run = ?1, last_run = ?2, last_result = ?3, updated_at = ?2
             WHERE id = ?4",
            rusqlite::params![next_run.map(to_stored_timestamp), now, result_summary, id],
        )?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Append to the task-run log.
    pub fn log_run(&self, record: &TaskRunRecord) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO task_runs (task_id, run_at, duration_ms, status, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.task_id,
                to_stored_timestamp(record.run_at),
                record.duration_ms as i64,
                record.outcome.type_tag(),
                record.result,
                record.error,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs of a task, newest first.
    pub fn runs_for_task(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<TaskRunRecord>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, run_at, duration_ms, status, result, error
             FROM task_runs WHERE task_id = ?1
             ORDER BY run_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![task_id, limit as i64], row_to_run)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Remove a task row entirely. Run-log rows are kept for audit.
    pub fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.db.conn();
        let changed = conn.execute(
            "DELETE FROM scheduled_tasks WHERE id = ?1",
            rusqlite::params![id],
        )?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }
}

const SELECT_TASK: &str = "SELECT id, group_folder, chat_jid, prompt, schedule_type,
        schedule_value, context_mode, status, next_run, last_run, last_result,
        extra_chat_jids, created_at, updated_at
 FROM scheduled_tasks";

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn parse_tag<T: FromStr<Err = String>>(
    id: &str,
    raw: String,
) -> Result<T, rusqlite::Error> {
    raw.parse().map_err(|reason: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("task {id}: {reason}"),
            )),
        )
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<ScheduledTask, rusqlite::Error> {
    let id: String = row.get(0)?;
    let schedule_type: String = row.get(4)?;
    let context_mode: String = row.get(6)?;
    let status: String = row.get(7)?;
    let next_run: Option<String> = row.get(8)?;
    let last_run: Option<String> = row.get(9)?;
    let extra_raw: String = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(ScheduledTask {
        schedule_kind: parse_tag::<ScheduleKind>(&id, schedule_type)?,
        context_mode: parse_tag::<ContextMode>(&id, context_mode)?,
        status: parse_tag::<TaskStatus>(&id, status)?,
        group_folder: row.get(1)?,
        chat_jid: row.get(2)?,
        prompt: row.get(3)?,
        schedule_value: row.get(5)?,
        next_run: parse_optional_datetime(next_run),
        last_run: parse_optional_datetime(last_run),
        last_result: row.get(10)?,
        extra_chat_jids: serde_json::from_str(&extra_raw).unwrap_or_default(),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
        id,
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<TaskRunRecord, rusqlite::Error> {
    let task_id: String = row.get(0)?;
    let run_at: String = row.get(1)?;
    let duration_ms: i64 = row.get(2)?;
    let status: String = row.get(3)?;

    Ok(TaskRunRecord {
        outcome: parse_tag::<RunOutcome>(&task_id, status)?,
        run_at: parse_datetime(&run_at),
        duration_ms: duration_ms.max(0) as u64,
        result: row.get(4)?,
        error: row.get(5)?,
        task_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{ONCE_SENTINEL, once_sentinel};

    fn test_store() -> TaskStore {
        TaskStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn sample_task(id: &str, kind: ScheduleKind, value: &str) -> ScheduledTask {
        ScheduledTask::new(
            id,
            "family",
            "xyz@g.us",
            "daily summary",
            kind,
            value,
            ContextMode::Isolated,
            chrono_tz::UTC,
        )
        .unwrap()
    }

    #[test]
    fn create_and_get_roundtrip() {
        let store = test_store();
        let mut task = sample_task("T1", ScheduleKind::Interval, "60000");
        task.extra_chat_jids = vec!["tg:99".to_string()];
        store.create_task(&task).unwrap();

        let loaded = store.get_task("T1").unwrap().unwrap();
        assert_eq!(loaded.id, "T1");
        assert_eq!(loaded.schedule_kind, ScheduleKind::Interval);
        assert_eq!(loaded.schedule_value, "60000");
        assert_eq!(loaded.status, TaskStatus::Active);
        assert_eq!(loaded.extra_chat_jids, vec!["tg:99".to_string()]);
        assert!(loaded.next_run.is_some());
        assert!(loaded.last_run.is_none());

        assert!(store.get_task("nope").unwrap().is_none());
    }

    #[test]
    fn due_tasks_respects_status_and_time() {
        let store = test_store();
        let due = sample_task("due", ScheduleKind::Once, "2020-01-01T00:00:00Z");
        let future = sample_task("future", ScheduleKind::Once, "2990-01-01T00:00:00Z");
        let mut paused = sample_task("paused", ScheduleKind::Once, "2020-01-01T00:00:00Z");
        paused.status = TaskStatus::Paused;

        store.create_task(&due).unwrap();
        store.create_task(&future).unwrap();
        store.create_task(&paused).unwrap();

        let ids: Vec<String> = store
            .due_tasks(Utc::now())
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["due".to_string()]);
    }

    #[test]
    fn sentinel_next_run_is_never_due() {
        let store = test_store();
        let task = sample_task("T1", ScheduleKind::Once, "2020-01-01T00:00:00Z");
        store.create_task(&task).unwrap();
        store.set_next_run("T1", Some(once_sentinel())).unwrap();

        assert!(store.due_tasks(Utc::now()).unwrap().is_empty());

        // The stored text is the exact sentinel literal.
        let loaded = store.get_task("T1").unwrap().unwrap();
        assert_eq!(to_stored_timestamp(loaded.next_run.unwrap()), ONCE_SENTINEL);
    }

    #[test]
    fn stuck_once_detection_via_query() {
        let store = test_store();
        let task = sample_task("T1", ScheduleKind::Once, "2020-01-01T00:00:00Z");
        store.create_task(&task).unwrap();

        assert!(store.stuck_once_tasks().unwrap().is_empty());

        store.set_next_run("T1", Some(once_sentinel())).unwrap();
        let stuck = store.stuck_once_tasks().unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, "T1");

        // A recorded run clears the stuck condition.
        store.update_after_run("T1", None, Some("done")).unwrap();
        assert!(store.stuck_once_tasks().unwrap().is_empty());
    }

    #[test]
    fn update_after_run_stamps_last_run() {
        let store = test_store();
        let task = sample_task("T1", ScheduleKind::Interval, "60000");
        store.create_task(&task).unwrap();

        store
            .update_after_run("T1", Some(Utc::now()), Some("all good"))
            .unwrap();

        let loaded = store.get_task("T1").unwrap().unwrap();
        assert!(loaded.last_run.is_some());
        assert_eq!(loaded.last_result.as_deref(), Some("all good"));
        assert!(loaded.next_run.is_some());
    }

    #[test]
    fn missing_rows_are_reported() {
        let store = test_store();
        assert!(matches!(
            store.set_status("ghost", TaskStatus::Paused),
            Err(StoreError::TaskNotFound(_))
        ));
        assert!(matches!(
            store.set_next_run("ghost", None),
            Err(StoreError::TaskNotFound(_))
        ));
        assert!(matches!(
            store.delete_task("ghost"),
            Err(StoreError::TaskNotFound(_))
        ));
    }

    #[test]
    fn run_log_appends_and_orders() {
        let store = test_store();
        let task = sample_task("T1", ScheduleKind::Interval, "60000");
        store.create_task(&task).unwrap();

        let base = Utc::now();
        for (i, outcome) in [RunOutcome::Success, RunOutcome::Error].iter().enumerate() {
            store
                .log_run(&TaskRunRecord {
                    task_id: "T1".to_string(),
                    run_at: base + chrono::Duration::seconds(i as i64),
                    duration_ms: 1500,
                    outcome: *outcome,
                    result: Some(format!("run {i}")),
                    error: None,
                })
                .unwrap();
        }

        let runs = store.runs_for_task("T1", 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].outcome, RunOutcome::Error);
        assert_eq!(runs[1].outcome, RunOutcome::Success);

        let limited = store.runs_for_task("T1", 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn tasks_for_chat_filters() {
        let store = test_store();
        store
            .create_task(&sample_task("T1", ScheduleKind::Interval, "60000"))
            .unwrap();
        let mut other = sample_task("T2", ScheduleKind::Interval, "60000");
        other.chat_jid = "other@g.us".to_string();
        store.create_task(&other).unwrap();

        let tasks = store.tasks_for_chat("xyz@g.us").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "T1");
    }
}
