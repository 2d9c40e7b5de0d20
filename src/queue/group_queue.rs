//! The group queue — decides when agent containers launch.
//!
//! Each group owns two lanes: the message lane (interactive replies) and the
//! task lane (scheduled background work). Lanes of one group may run
//! concurrently, but each lane holds at most one container and the total
//! across all groups never exceeds the global cap. All state lives behind a
//! single mutex; the lock is never held across an await, and container
//! callbacks run entirely outside it. Slot accounting happens synchronously
//! with the enqueue call — two back-to-back enqueues must never both observe
//! a free slot that only one of them can have.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, error, info, trace, warn};

use crate::config::{BASE_RETRY_MS, Config, MAX_RETRIES};
use crate::container::{ContainerHandle, Lane};
use crate::error::QueueError;
use crate::ipc;
use crate::registry::GroupJid;

use super::status::{GroupStatus, QueueStatus};

/// Message-lane callback, installed once after construction.
///
/// Returns `true` on success, `false` for a transient failure that warrants
/// a retry with backoff.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process_messages(&self, group: &GroupJid) -> bool;
}

/// A deferred task-lane job.
pub type TaskJob = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct PendingTask {
    task_id: String,
    job: TaskJob,
}

#[derive(Default)]
struct GroupState {
    // Message lane.
    active_message: bool,
    idle_waiting: bool,
    pending_messages: bool,
    message_handle: Option<ContainerHandle>,
    retry_count: u32,
    // Task lane.
    active_task: bool,
    pending_tasks: VecDeque<PendingTask>,
    task_handle: Option<ContainerHandle>,
}

impl GroupState {
    fn has_pending_work(&self) -> bool {
        self.pending_messages || !self.pending_tasks.is_empty()
    }
}

#[derive(Default)]
struct QueueState {
    groups: HashMap<GroupJid, GroupState>,
    /// Running containers across all groups, both lanes.
    active_count: usize,
    /// Groups deferred at the cap; each appears at most once.
    waiting: VecDeque<GroupJid>,
    shutting_down: bool,
}

/// Work to start once the lock has been released.
enum Launch {
    Message(GroupJid),
    Task(GroupJid, String, TaskJob),
}

struct Inner {
    state: Mutex<QueueState>,
    handler: OnceLock<Arc<dyn MessageHandler>>,
    max_concurrent: usize,
    data_dir: PathBuf,
}

/// Cheap-to-clone handle to the shared queue.
#[derive(Clone)]
pub struct GroupQueue {
    inner: Arc<Inner>,
}

impl GroupQueue {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                handler: OnceLock::new(),
                max_concurrent: config.max_concurrent_containers,
                data_dir: config.data_dir.clone(),
            }),
        }
    }

    /// Install the message-lane callback. One-way: later calls are ignored,
    /// which breaks the queue ⇄ pipeline construction cycle without a
    /// reference cycle in the types.
    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        if self.inner.handler.set(handler).is_err() {
            warn!("Message handler already installed; ignoring replacement");
        }
    }

    /// Ensure the message lane for `group` will run.
    pub fn enqueue_message_check(&self, group: &GroupJid) {
        let launch = {
            let mut st = self.lock_state();
            if st.shutting_down {
                warn!(
                    "{}",
                    QueueError::ShuttingDown {
                        group: group.to_string()
                    }
                );
                return;
            }

            let at_capacity = st.active_count >= self.inner.max_concurrent;
            let g = st.groups.entry(group.clone()).or_default();

            if g.active_message {
                g.pending_messages = true;
                debug!(group = %group, "Message container active, marked pending");
                false
            } else if at_capacity {
                g.pending_messages = true;
                push_waiting(&mut st.waiting, group);
                debug!(group = %group, "At container cap, queued group");
                false
            } else {
                g.active_message = true;
                g.idle_waiting = false;
                g.pending_messages = false;
                st.active_count += 1;
                true
            }
        };

        if launch {
            self.spawn_message_run(group.clone());
        }
    }

    /// Ensure the task lane for `group` runs `job`. Re-enqueueing a task id
    /// that is already pending is a no-op.
    pub fn enqueue_task(&self, group: &GroupJid, task_id: &str, job: TaskJob) {
        let mut close_folder: Option<String> = None;
        let launch = {
            let mut st = self.lock_state();
            if st.shutting_down {
                warn!(
                    task = task_id,
                    "{}",
                    QueueError::ShuttingDown {
                        group: group.to_string()
                    }
                );
                return;
            }

            let at_capacity = st.active_count >= self.inner.max_concurrent;
            let g = st.groups.entry(group.clone()).or_default();

            if g.pending_tasks.iter().any(|t| t.task_id == task_id) {
                debug!(group = %group, task = task_id, "Task already pending, skipped");
                return;
            }

            if g.active_task {
                g.pending_tasks.push_back(PendingTask {
                    task_id: task_id.to_string(),
                    job,
                });
                debug!(group = %group, task = task_id, "Task container active, queued task");
                return;
            }

            // An idle message container is only waiting for more input; ask
            // it to drain and exit so its slot frees up for this task.
            if g.active_message
                && g.idle_waiting
                && let Some(handle) = &g.message_handle
            {
                close_folder = Some(handle.group_folder.clone());
            }

            if at_capacity {
                g.pending_tasks.push_back(PendingTask {
                    task_id: task_id.to_string(),
                    job,
                });
                push_waiting(&mut st.waiting, group);
                debug!(group = %group, task = task_id, "At container cap, queued task");
                None
            } else {
                g.active_task = true;
                st.active_count += 1;
                Some(job)
            }
        };

        if let Some(folder) = close_folder {
            info!(group = %group, "Preempting idle message container for task");
            self.write_close(&folder);
        }

        if let Some(job) = launch {
            self.spawn_task_run(group.clone(), task_id.to_string(), job);
        }
    }

    /// The message container produced its reply and is awaiting further IPC
    /// input. If tasks are already queued for this group, preempt it.
    pub fn notify_idle(&self, group: &GroupJid) {
        let close_folder = {
            let mut st = self.lock_state();
            match st.groups.get_mut(group) {
                Some(g) => {
                    g.idle_waiting = true;
                    if !g.pending_tasks.is_empty() && !g.active_task {
                        g.message_handle.as_ref().map(|h| h.group_folder.clone())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(folder) = close_folder {
            info!(group = %group, "Idle message container preempted by pending task");
            self.write_close(&folder);
        }
    }

    /// Task containers are single-turn; nothing to track. Kept so callers
    /// mirror the message-lane notification pattern.
    pub fn notify_task_idle(&self, group: &GroupJid) {
        trace!(group = %group, "Task container idle");
    }

    /// Deliver follow-up text to the group's running message container.
    /// Returns false when no message container is live (a task container
    /// alone does not accept interactive input).
    pub fn send_message(&self, group: &GroupJid, text: &str) -> bool {
        let folder = {
            let mut st = self.lock_state();
            match st.groups.get_mut(group) {
                Some(g) if g.active_message => match &g.message_handle {
                    Some(handle) => {
                        g.idle_waiting = false;
                        Some(handle.group_folder.clone())
                    }
                    None => None,
                },
                _ => None,
            }
        };

        match folder {
            Some(folder) => {
                if let Err(e) = ipc::write_input_envelope(&self.inner.data_dir, &folder, text) {
                    debug!(group = %group, error = %e, "Input envelope write failed");
                }
                true
            }
            None => false,
        }
    }

    /// Ask the message-lane container to drain and exit.
    pub fn close_stdin(&self, group: &GroupJid) {
        if let Some(folder) = self.lane_folder(group, Lane::Message) {
            self.write_close(&folder);
        } else {
            debug!(group = %group, "close_stdin: no message container registered");
        }
    }

    /// Ask the task-lane container to drain and exit.
    pub fn close_task_stdin(&self, group: &GroupJid) {
        if let Some(folder) = self.lane_folder(group, Lane::Task) {
            self.write_close(&folder);
        } else {
            debug!(group = %group, "close_task_stdin: no task container registered");
        }
    }

    /// True while a message container is actively speaking. Task-lane
    /// activity is deliberately invisible here: a user asking a new question
    /// should not be told to wait because a background task is running.
    pub fn is_busy(&self, group: &GroupJid) -> bool {
        let st = self.lock_state();
        st.groups
            .get(group)
            .is_some_and(|g| g.active_message && !g.idle_waiting)
    }

    /// Record the spawned container for its lane. Replaces only that lane's
    /// slot; the other lane's handle is untouched.
    pub fn register_container(&self, handle: ContainerHandle) {
        let mut st = self.lock_state();
        let g = st.groups.entry(handle.group.clone()).or_default();
        debug!(
            group = %handle.group,
            lane = %handle.lane,
            container = %handle.container_name,
            "Container registered"
        );
        match handle.lane {
            Lane::Message => g.message_handle = Some(handle),
            Lane::Task => g.task_handle = Some(handle),
        }
    }

    /// Snapshot of groups with any active or pending work.
    pub fn get_status(&self) -> QueueStatus {
        let st = self.lock_state();
        let mut groups: Vec<GroupStatus> = st
            .groups
            .iter()
            .map(|(jid, g)| GroupStatus {
                group: jid.to_string(),
                active_message: g.active_message,
                idle_waiting: g.idle_waiting,
                pending_messages: g.pending_messages,
                retry_count: g.retry_count,
                active_task: g.active_task,
                pending_task_ids: g.pending_tasks.iter().map(|t| t.task_id.clone()).collect(),
            })
            .filter(GroupStatus::has_activity)
            .collect();
        groups.sort_by(|a, b| a.group.cmp(&b.group));

        QueueStatus {
            active_count: st.active_count,
            max_concurrent: self.inner.max_concurrent,
            shutting_down: st.shutting_down,
            waiting: st.waiting.iter().map(|j| j.to_string()).collect(),
            groups,
        }
    }

    /// Stop accepting work and hand back the handles of everything still
    /// running, so the shutdown controller can log the detach.
    pub fn begin_shutdown(&self) -> Vec<ContainerHandle> {
        let mut st = self.lock_state();
        st.shutting_down = true;
        st.groups
            .values()
            .flat_map(|g| [g.message_handle.clone(), g.task_handle.clone()])
            .flatten()
            .collect()
    }

    // ── Completion paths ────────────────────────────────────────────────

    fn spawn_message_run(&self, group: GroupJid) {
        let queue = self.clone();
        tokio::spawn(async move {
            let Some(handler) = queue.inner.handler.get().cloned() else {
                // Nothing can process the lane; release the slot without a
                // retry loop that could never succeed.
                error!(group = %group, "{}", QueueError::NoHandler);
                queue.finish_message_run(&group, true);
                return;
            };

            let group_for_run = group.clone();
            let success = match tokio::spawn(async move {
                handler.process_messages(&group_for_run).await
            })
            .await
            {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(group = %group, error = %e, "Message handler panicked");
                    false
                }
            };

            queue.finish_message_run(&group, success);
        });
    }

    fn spawn_task_run(&self, group: GroupJid, task_id: String, job: TaskJob) {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::spawn(job()).await {
                warn!(group = %group, task = %task_id, error = %e, "Task job panicked");
            }
            queue.finish_task_run(&group);
        });
    }

    fn finish_message_run(&self, group: &GroupJid, success: bool) {
        let mut retry_after: Option<Duration> = None;
        let launches = {
            let mut st = self.lock_state();
            let g = st.groups.entry(group.clone()).or_default();
            g.message_handle = None;
            g.active_message = false;
            g.idle_waiting = false;

            if success {
                g.retry_count = 0;
            } else {
                g.retry_count += 1;
                if g.retry_count > MAX_RETRIES {
                    warn!(
                        group = %group,
                        retries = MAX_RETRIES,
                        "Message processing kept failing, dropping until next inbound message"
                    );
                    g.retry_count = 0;
                } else {
                    let delay = Duration::from_millis(BASE_RETRY_MS << (g.retry_count - 1));
                    info!(
                        group = %group,
                        attempt = g.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Message processing failed, scheduling retry"
                    );
                    retry_after = Some(delay);
                }
            }

            st.active_count = st.active_count.saturating_sub(1);
            drain_group(&mut st, group, self.inner.max_concurrent)
        };

        if let Some(delay) = retry_after {
            let queue = self.clone();
            let group = group.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.enqueue_message_check(&group);
            });
        }

        self.perform(launches);
    }

    fn finish_task_run(&self, group: &GroupJid) {
        let launches = {
            let mut st = self.lock_state();
            let g = st.groups.entry(group.clone()).or_default();
            g.task_handle = None;
            g.active_task = false;
            st.active_count = st.active_count.saturating_sub(1);
            drain_group(&mut st, group, self.inner.max_concurrent)
        };
        self.perform(launches);
    }

    fn perform(&self, launches: Vec<Launch>) {
        for launch in launches {
            match launch {
                Launch::Message(group) => self.spawn_message_run(group),
                Launch::Task(group, task_id, job) => self.spawn_task_run(group, task_id, job),
            }
        }
    }

    fn lane_folder(&self, group: &GroupJid, lane: Lane) -> Option<String> {
        let st = self.lock_state();
        let g = st.groups.get(group)?;
        let handle = match lane {
            Lane::Message => g.message_handle.as_ref(),
            Lane::Task => g.task_handle.as_ref(),
        };
        handle.map(|h| h.group_folder.clone())
    }

    fn write_close(&self, folder: &str) {
        if let Err(e) = ipc::write_close_sentinel(&self.inner.data_dir, folder) {
            debug!(folder = folder, error = %e, "Close sentinel write failed");
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.state.lock().expect("queue mutex poisoned")
    }
}

/// Promote this group's deferred lanes (messages first), then — if the group
/// is fully drained — hand remaining slots to waiting groups.
fn drain_group(st: &mut QueueState, group: &GroupJid, max: usize) -> Vec<Launch> {
    let mut launches = Vec::new();

    if let Some(g) = st.groups.get_mut(group) {
        if g.pending_messages && !g.active_message && st.active_count < max {
            g.active_message = true;
            g.idle_waiting = false;
            g.pending_messages = false;
            st.active_count += 1;
            launches.push(Launch::Message(group.clone()));
        }

        if !g.pending_tasks.is_empty() && !g.active_task && st.active_count < max {
            let pending = g.pending_tasks.pop_front().expect("checked nonempty");
            g.active_task = true;
            st.active_count += 1;
            launches.push(Launch::Task(group.clone(), pending.task_id, pending.job));
        }
    }

    let drained = st
        .groups
        .get(group)
        .is_none_or(|g| !g.has_pending_work());
    if drained {
        launches.extend(drain_waiting(st, max));
    }

    launches
}

/// Pop waiting groups FIFO while slots remain, promoting whichever of their
/// lanes have pending work and are inactive.
fn drain_waiting(st: &mut QueueState, max: usize) -> Vec<Launch> {
    let mut launches = Vec::new();

    while st.active_count < max {
        let Some(jid) = st.waiting.pop_front() else {
            break;
        };
        let Some(g) = st.groups.get_mut(&jid) else {
            continue;
        };

        if g.pending_messages && !g.active_message && st.active_count < max {
            g.active_message = true;
            g.idle_waiting = false;
            g.pending_messages = false;
            st.active_count += 1;
            launches.push(Launch::Message(jid.clone()));
        }

        if !g.pending_tasks.is_empty() && !g.active_task && st.active_count < max {
            let pending = g.pending_tasks.pop_front().expect("checked nonempty");
            g.active_task = true;
            st.active_count += 1;
            launches.push(Launch::Task(jid.clone(), pending.task_id, pending.job));
        }
    }

    launches
}

fn push_waiting(waiting: &mut VecDeque<GroupJid>, group: &GroupJid) {
    if !waiting.contains(group) {
        waiting.push_back(group.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Notify, mpsc};
    use tokio::time::timeout;

    fn test_queue(max: usize, data_dir: &std::path::Path) -> GroupQueue {
        let config = Config {
            max_concurrent_containers: max,
            data_dir: data_dir.to_path_buf(),
            ..Config::default()
        };
        GroupQueue::new(&config)
    }

    /// Handler that reports each invocation and blocks until released.
    struct GateHandler {
        started: mpsc::UnboundedSender<GroupJid>,
        release: Arc<Notify>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GateHandler {
        fn new(started: mpsc::UnboundedSender<GroupJid>) -> Self {
            Self {
                started,
                release: Arc::new(Notify::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageHandler for GateHandler {
        async fn process_messages(&self, group: &GroupJid) -> bool {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _ = self.started.send(group.clone());
            self.release.notified().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn global_cap_is_never_exceeded() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = test_queue(2, tmp.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GateHandler::new(tx));
        queue.set_message_handler(handler.clone());

        queue.enqueue_message_check(&"A".into());
        queue.enqueue_message_check(&"B".into());
        queue.enqueue_message_check(&"C".into());

        // Exactly two handlers start; C is deferred.
        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(first.is_some() && second.is_some());

        let status = queue.get_status();
        assert_eq!(status.active_count, 2);
        assert_eq!(status.waiting, vec!["C".to_string()]);

        // Releasing a slot lets C in; the cap holds throughout.
        handler.release.notify_one();
        let third = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(third.unwrap(), GroupJid::new("C"));
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);

        handler.release.notify_one();
    }

    #[tokio::test]
    async fn active_message_marks_pending_instead_of_double_running() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = test_queue(4, tmp.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GateHandler::new(tx));
        queue.set_message_handler(handler.clone());

        queue.enqueue_message_check(&"A".into());
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();

        queue.enqueue_message_check(&"A".into());
        let status = queue.get_status();
        assert_eq!(status.active_count, 1);
        assert!(status.groups[0].pending_messages);

        // Completing the first run relaunches the pending one.
        handler.release.notify_one();
        let relaunched = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(relaunched.unwrap(), GroupJid::new("A"));
        handler.release.notify_one();
    }

    #[tokio::test]
    async fn is_busy_tracks_message_lane_only() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = test_queue(2, tmp.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GateHandler::new(tx));
        queue.set_message_handler(handler.clone());

        let group = GroupJid::new("A");
        assert!(!queue.is_busy(&group));

        // A running task does not make the group busy.
        let (task_tx, mut task_rx) = mpsc::unbounded_channel::<()>();
        let gate = Arc::new(Notify::new());
        let gate_clone = gate.clone();
        queue.enqueue_task(
            &group,
            "t1",
            Box::new(move || {
                Box::pin(async move {
                    let _ = task_tx.send(());
                    gate_clone.notified().await;
                })
            }),
        );
        timeout(Duration::from_secs(1), task_rx.recv())
            .await
            .unwrap();
        assert!(!queue.is_busy(&group));

        queue.enqueue_message_check(&group);
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(queue.is_busy(&group));

        queue.notify_idle(&group);
        assert!(!queue.is_busy(&group));

        gate.notify_one();
        handler.release.notify_one();
    }

    #[tokio::test]
    async fn pending_task_ids_deduplicate() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = test_queue(1, tmp.path());
        queue.set_message_handler(Arc::new(GateHandler::new(mpsc::unbounded_channel().0)));

        let group = GroupJid::new("A");
        let gate = Arc::new(Notify::new());
        let ran = Arc::new(AtomicUsize::new(0));

        // First task occupies the lane.
        let gate1 = gate.clone();
        queue.enqueue_task(
            &group,
            "blocker",
            Box::new(move || Box::pin(async move { gate1.notified().await })),
        );

        // Same id queued twice: only one copy runs.
        for _ in 0..2 {
            let ran = ran.clone();
            queue.enqueue_task(
                &group,
                "t1",
                Box::new(move || {
                    Box::pin(async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            );
        }

        let status = queue.get_status();
        assert_eq!(status.groups[0].pending_task_ids, vec!["t1".to_string()]);

        gate.notify_one();
        for _ in 0..100 {
            if ran.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_message_requires_live_message_container() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = test_queue(2, tmp.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GateHandler::new(tx));
        queue.set_message_handler(handler.clone());

        let group = GroupJid::new("A");
        assert!(!queue.send_message(&group, "hello"));

        queue.enqueue_message_check(&group);
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        queue.register_container(ContainerHandle {
            group: group.clone(),
            lane: Lane::Message,
            group_folder: "a".to_string(),
            container_name: "agent-a".to_string(),
            pid: None,
        });

        queue.notify_idle(&group);
        assert!(queue.send_message(&group, "follow-up"));
        // Delivery cleared the idle flag.
        assert!(queue.is_busy(&group));

        let input = crate::ipc::input_dir(tmp.path(), "a");
        let envelopes = std::fs::read_dir(input)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .count();
        assert_eq!(envelopes, 1);

        handler.release.notify_one();
    }

    #[tokio::test]
    async fn idle_preemption_writes_close_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = test_queue(2, tmp.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GateHandler::new(tx));
        queue.set_message_handler(handler.clone());

        let group = GroupJid::new("A");
        queue.enqueue_message_check(&group);
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        queue.register_container(ContainerHandle {
            group: group.clone(),
            lane: Lane::Message,
            group_folder: "a".to_string(),
            container_name: "agent-a".to_string(),
            pid: None,
        });

        let sentinel = crate::ipc::input_dir(tmp.path(), "a").join(crate::ipc::CLOSE_SENTINEL);

        // Reply not yet produced: no preemption to observe.
        assert!(!sentinel.exists());

        // Once the reply is out, the next task enqueue closes the idle
        // message container to free its slot.
        queue.notify_idle(&group);
        queue.enqueue_task(&group, "t1", Box::new(|| Box::pin(async {})));
        assert!(sentinel.exists());

        handler.release.notify_one();
    }

    #[tokio::test]
    async fn notify_idle_preempts_when_tasks_are_queued() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = test_queue(1, tmp.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GateHandler::new(tx));
        queue.set_message_handler(handler.clone());

        let group = GroupJid::new("A");
        queue.enqueue_message_check(&group);
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        queue.register_container(ContainerHandle {
            group: group.clone(),
            lane: Lane::Message,
            group_folder: "a".to_string(),
            container_name: "agent-a".to_string(),
            pid: None,
        });

        // Cap of one: the task has to queue behind the message container.
        queue.enqueue_task(&group, "t1", Box::new(|| Box::pin(async {})));
        let sentinel = crate::ipc::input_dir(tmp.path(), "a").join(crate::ipc::CLOSE_SENTINEL);
        assert!(!sentinel.exists());

        // The moment the reply lands, the queued task preempts the idle
        // message container.
        queue.notify_idle(&group);
        assert!(sentinel.exists());

        handler.release.notify_one();
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work_and_reports_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = test_queue(2, tmp.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GateHandler::new(tx));
        queue.set_message_handler(handler.clone());

        let group = GroupJid::new("A");
        queue.enqueue_message_check(&group);
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        queue.register_container(ContainerHandle {
            group: group.clone(),
            lane: Lane::Message,
            group_folder: "a".to_string(),
            container_name: "agent-a".to_string(),
            pid: Some(42),
        });

        let handles = queue.begin_shutdown();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].container_name, "agent-a");

        queue.enqueue_message_check(&"B".into());
        queue.enqueue_task(&"B".into(), "t1", Box::new(|| Box::pin(async {})));
        let status = queue.get_status();
        assert!(status.shutting_down);
        assert_eq!(status.active_count, 1);
        assert!(status.groups.iter().all(|g| g.group == "A"));

        handler.release.notify_one();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backoff_doubles_and_gives_up() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = test_queue(2, tmp.path());

        struct FailingHandler {
            attempts: mpsc::UnboundedSender<tokio::time::Instant>,
        }

        #[async_trait]
        impl MessageHandler for FailingHandler {
            async fn process_messages(&self, _group: &GroupJid) -> bool {
                let _ = self.attempts.send(tokio::time::Instant::now());
                false
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.set_message_handler(Arc::new(FailingHandler { attempts: tx }));

        let start = tokio::time::Instant::now();
        queue.enqueue_message_check(&"A".into());

        // First attempt plus five retries at 5, 15, 35, 75, 155 seconds.
        let mut offsets = Vec::new();
        for _ in 0..6 {
            let at = timeout(Duration::from_secs(300), rx.recv())
                .await
                .expect("attempt within budget")
                .expect("channel open");
            offsets.push(at.duration_since(start).as_secs());
        }
        assert_eq!(offsets, vec![0, 5, 15, 35, 75, 155]);

        // Afterwards the group goes quiet until a new inbound message.
        assert!(timeout(Duration::from_secs(600), rx.recv()).await.is_err());
        let status = queue.get_status();
        assert_eq!(status.active_count, 0);
        assert!(status.groups.is_empty());
    }

    #[tokio::test]
    async fn waiting_groups_drain_fifo() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = test_queue(1, tmp.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GateHandler::new(tx));
        queue.set_message_handler(handler.clone());

        queue.enqueue_message_check(&"A".into());
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        queue.enqueue_message_check(&"B".into());
        queue.enqueue_message_check(&"C".into());

        assert_eq!(
            queue.get_status().waiting,
            vec!["B".to_string(), "C".to_string()]
        );

        handler.release.notify_one();
        let next = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, GroupJid::new("B"));

        handler.release.notify_one();
        let last = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last, GroupJid::new("C"));
        handler.release.notify_one();
    }
}
