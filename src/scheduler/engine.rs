//! Task scheduler engine.
//!
//! A polling loop selects due task rows and hands each one to the group
//! queue's task lane as a closure. The hard contract lives in `run_task`:
//! `next_run` is advanced and persisted BEFORE the container spawns, so a
//! crash mid-run leaves a recognizable fingerprint (`last_run` null,
//! `next_run` at the once-sentinel) instead of a double execution. Startup
//! recovery resets those fingerprints to fire again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TASK_CLOSE_DELAY_MS};
use crate::container::{
    ContainerHandle, ContainerInput, ContainerRuntime, Lane, OutputEvent, RunEvent, RunStatus,
};
use crate::error::TaskError;
use crate::ipc;
use crate::queue::GroupQueue;
use crate::registry::{GroupJid, GroupRegistry};
use crate::store::TaskStore;
use crate::transport::TransportRegistry;

use super::task::{
    ContextMode, RunOutcome, ScheduledTask, TaskRunRecord, TaskStatus, is_valid_group_folder,
    next_run_after_execution, next_run_before_execution, summarize_result,
};

struct Inner {
    config: Config,
    tasks: Arc<TaskStore>,
    queue: GroupQueue,
    registry: Arc<GroupRegistry>,
    transports: Arc<TransportRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    drain_requested: Notify,
    drain_flag: AtomicBool,
    shutting_down: AtomicBool,
}

/// Cheap-to-clone handle to the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        tasks: Arc<TaskStore>,
        queue: GroupQueue,
        registry: Arc<GroupRegistry>,
        transports: Arc<TransportRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                tasks,
                queue,
                registry,
                transports,
                runtime,
                drain_requested: Notify::new(),
                drain_flag: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the polling loop as a background task.
    pub fn spawn(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Run the polling loop until shutdown.
    pub async fn run(&self) {
        self.recover_stuck_tasks();
        info!(
            interval_ms = self.inner.config.scheduler_poll_interval.as_millis() as u64,
            "Task scheduler started"
        );

        while !self.inner.shutting_down.load(Ordering::SeqCst) {
            if !self.inner.drain_flag.swap(false, Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(self.inner.config.scheduler_poll_interval) => {}
                    _ = self.inner.drain_requested.notified() => {}
                }
                // A notify-triggered wake already consumed its request.
                self.inner.drain_flag.store(false, Ordering::SeqCst);
            }

            if self.inner.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.poll_once();
        }

        info!("Task scheduler stopped");
    }

    /// Make the next loop iteration run with zero delay — used when a
    /// freshly created once-task should not wait out a full tick.
    pub fn trigger_drain(&self) {
        self.inner.drain_flag.store(true, Ordering::SeqCst);
        self.inner.drain_requested.notify_one();
    }

    /// Stop picking up new work. Closures already handed to the queue keep
    /// running.
    pub fn begin_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.drain_requested.notify_one();
    }

    /// Once-tasks whose `next_run` was advanced to the sentinel but whose
    /// run was never recorded died with a previous process. Point them back
    /// at now so the next poll re-executes them.
    pub fn recover_stuck_tasks(&self) {
        let stuck = match self.inner.tasks.stuck_once_tasks() {
            Ok(stuck) => stuck,
            Err(e) => {
                error!(error = %e, "Stuck-task scan failed");
                return;
            }
        };

        for task in stuck {
            info!(task = %task.id, "Recovering stuck once-task");
            if let Err(e) = self.inner.tasks.set_next_run(&task.id, Some(Utc::now())) {
                error!(task = %task.id, error = %e, "Failed to reset stuck task");
            }
        }
    }

    /// One poll tick: select due rows, re-check each, enqueue its run.
    pub fn poll_once(&self) {
        let now = Utc::now();
        let due = match self.inner.tasks.due_tasks(now) {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Due-task query failed");
                return;
            }
        };

        for selected in due {
            // Re-read: the row may have been paused or deleted since
            // selection.
            let fresh = match self.inner.tasks.get_task(&selected.id) {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    error!(task = %selected.id, error = %e, "Task re-read failed");
                    continue;
                }
            };
            if fresh.status != TaskStatus::Active
                || fresh.next_run.is_none_or(|next| next > now)
            {
                debug!(task = %fresh.id, "Task no longer due, skipped");
                continue;
            }

            let jid = GroupJid::new(fresh.chat_jid.clone());
            let scheduler = self.clone();
            let task_id = fresh.id.clone();
            self.inner.queue.enqueue_task(
                &jid,
                &task_id,
                Box::new(move || Box::pin(async move { scheduler.run_task(fresh).await })),
            );
        }
    }

    /// Execute one task run inside the group's task lane.
    async fn run_task(&self, task: ScheduledTask) {
        let started = Instant::now();
        let run_at = Utc::now();
        let jid = GroupJid::new(task.chat_jid.clone());

        // Malformed legacy rows would otherwise churn a retry every poll.
        if !is_valid_group_folder(&task.group_folder) {
            let err = TaskError::InvalidGroupFolder {
                task_id: task.id.clone(),
                folder: task.group_folder.clone(),
            };
            warn!(task = %task.id, error = %err, "Pausing task");
            if let Err(e) = self.inner.tasks.set_status(&task.id, TaskStatus::Paused) {
                error!(task = %task.id, error = %e, "Failed to pause task");
            }
            self.log_error_run(&task, run_at, started, &err.to_string());
            return;
        }

        let Some(group) = self.inner.registry.find_by_folder(&task.group_folder) else {
            let err = TaskError::GroupNotRegistered {
                folder: task.group_folder.clone(),
            };
            warn!(task = %task.id, error = %err, "Skipping task run");
            self.log_error_run(&task, run_at, started, &err.to_string());
            return;
        };

        let is_main = self.inner.config.is_main_folder(&task.group_folder);
        self.write_snapshots(&task, is_main);

        // The single most important ordering in this file: persist the
        // advanced next_run BEFORE the container spawns. A crash after this
        // point loses at most one run; it never double-fires.
        let advanced = match next_run_before_execution(&task, Utc::now(), self.inner.config.timezone)
        {
            Ok(advanced) => advanced,
            Err(e) => {
                warn!(task = %task.id, error = %e, "Unschedulable task, pausing");
                if let Err(e) = self.inner.tasks.set_status(&task.id, TaskStatus::Paused) {
                    error!(task = %task.id, error = %e, "Failed to pause task");
                }
                self.log_error_run(&task, run_at, started, &e.to_string());
                return;
            }
        };
        if let Err(e) = self.inner.tasks.set_next_run(&task.id, Some(advanced)) {
            error!(task = %task.id, error = %e, "Could not advance next_run, aborting run");
            return;
        }

        ipc::clear_reply_context(&self.inner.config.data_dir, &task.group_folder);

        let input = ContainerInput {
            prompt: task.prompt.clone(),
            session_id: match task.context_mode {
                ContextMode::Group => group.session_id.clone(),
                ContextMode::Isolated => None,
            },
            group_folder: task.group_folder.clone(),
            chat_jid: task.chat_jid.clone(),
            is_main,
            is_scheduled_task: true,
            assistant_name: Some(self.inner.config.assistant_name.clone()),
        };

        info!(task = %task.id, group = %jid, "Running task container");
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let runtime = self.inner.runtime.clone();
        let run = tokio::spawn(async move { runtime.run_agent(input, events_tx).await });

        let mut close_timer: Option<JoinHandle<()>> = None;
        let mut error_message: Option<String> = None;
        let mut last_result: Option<String> = None;

        while let Some(event) = events_rx.recv().await {
            match event {
                RunEvent::Spawned {
                    container_name,
                    pid,
                } => {
                    self.inner.queue.register_container(ContainerHandle {
                        group: jid.clone(),
                        lane: Lane::Task,
                        group_folder: task.group_folder.clone(),
                        container_name,
                        pid,
                    });
                }
                RunEvent::Output(OutputEvent::Success {
                    result,
                    new_session_id,
                }) => {
                    if task.context_mode == ContextMode::Group
                        && let Some(session_id) = new_session_id
                    {
                        self.inner.registry.set_session_id(&jid, Some(session_id));
                    }
                    if let Some(text) = result
                        && !text.trim().is_empty()
                    {
                        self.deliver(&jid, &task, &text).await;
                        last_result = Some(text);
                    }
                    self.inner.queue.notify_task_idle(&jid);
                    // Single-turn lane: give the container a short window
                    // for trailing output, then ask it to drain and exit.
                    if let Some(timer) = close_timer.take() {
                        timer.abort();
                    }
                    close_timer = Some(self.arm_close_timer(jid.clone()));
                }
                RunEvent::Output(OutputEvent::Error { message }) => {
                    warn!(task = %task.id, error = %message, "Task container error event");
                    error_message = Some(message);
                }
            }
        }

        let outcome = run.await;
        if let Some(timer) = close_timer.take() {
            timer.abort();
        }
        let duration_ms = started.elapsed().as_millis() as u64;

        let (run_outcome, result_text, error_text) = match outcome {
            Ok(Ok(outcome)) => {
                let result = outcome.result.or(last_result);
                if outcome.status == RunStatus::Success && error_message.is_none() {
                    (RunOutcome::Success, result, None)
                } else {
                    (RunOutcome::Error, result, error_message.or(outcome.error))
                }
            }
            Ok(Err(e)) => (RunOutcome::Error, last_result, Some(e.to_string())),
            Err(e) => (
                RunOutcome::Error,
                last_result,
                Some(format!("container run panicked: {e}")),
            ),
        };

        if let Err(e) = self.inner.tasks.log_run(&TaskRunRecord {
            task_id: task.id.clone(),
            run_at,
            duration_ms,
            outcome: run_outcome,
            result: result_text.clone(),
            error: error_text,
        }) {
            error!(task = %task.id, error = %e, "Failed to log task run");
        }

        let final_next =
            match next_run_after_execution(&task, Utc::now(), self.inner.config.timezone) {
                Ok(final_next) => final_next,
                Err(e) => {
                    error!(task = %task.id, error = %e, "Final next_run computation failed");
                    None
                }
            };
        let summary = result_text.as_deref().map(summarize_result);
        if let Err(e) = self
            .inner
            .tasks
            .update_after_run(&task.id, final_next, summary.as_deref())
        {
            // next_run may be left at the pre-run value; startup recovery
            // reconciles once-tasks and periodic tasks simply fire again.
            error!(task = %task.id, error = %e, "Failed to record task completion");
        }
        info!(
            task = %task.id,
            outcome = run_outcome.type_tag(),
            duration_ms,
            "Task run finished"
        );
    }

    async fn deliver(&self, jid: &GroupJid, task: &ScheduledTask, text: &str) {
        if let Err(e) = self.inner.transports.send_message(jid, text, None).await {
            // Accepted risk: the task keeps its schedule, this output is lost.
            error!(task = %task.id, group = %jid, error = %e, "Task output delivery failed");
        }
        for extra in &task.extra_chat_jids {
            let extra_jid = GroupJid::new(extra.clone());
            if let Err(e) = self
                .inner
                .transports
                .send_message(&extra_jid, text, None)
                .await
            {
                error!(
                    task = %task.id,
                    subscriber = %extra_jid,
                    error = %e,
                    "Task output delivery to subscriber failed"
                );
            }
        }
    }

    fn arm_close_timer(&self, group: GroupJid) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(TASK_CLOSE_DELAY_MS)).await;
            scheduler.inner.queue.close_task_stdin(&group);
        })
    }

    fn write_snapshots(&self, task: &ScheduledTask, is_main: bool) {
        let data_dir = &self.inner.config.data_dir;
        match self.inner.tasks.tasks_for_chat(&task.chat_jid) {
            Ok(peers) => {
                if let Err(e) =
                    ipc::write_tasks_snapshot(data_dir, &task.group_folder, is_main, &peers)
                {
                    debug!(task = %task.id, error = %e, "Tasks snapshot write failed");
                }
            }
            Err(e) => debug!(task = %task.id, error = %e, "Tasks snapshot query failed"),
        }

        let status = self.inner.queue.get_status();
        if let Err(e) = ipc::write_queue_status_snapshot(
            data_dir,
            &task.group_folder,
            is_main,
            &status.groups,
            &status.waiting,
        ) {
            debug!(task = %task.id, error = %e, "Queue snapshot write failed");
        }
    }

    fn log_error_run(&self, task: &ScheduledTask, run_at: chrono::DateTime<Utc>, started: Instant, reason: &str) {
        if let Err(e) = self.inner.tasks.log_run(&TaskRunRecord {
            task_id: task.id.clone(),
            run_at,
            duration_ms: started.elapsed().as_millis() as u64,
            outcome: RunOutcome::Error,
            result: None,
            error: Some(reason.to_string()),
        }) {
            error!(task = %task.id, error = %e, "Failed to log task error run");
        }
    }
}
