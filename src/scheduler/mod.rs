//! Single-leader distributed task scheduler.
//!
//! Tasks sit in a min-heap ordered by their next fire instant; one outer
//! timer sleeps until the heap head instead of keeping a timer per task.
//! Leadership is a [`DistributedLock`](crate::lock::DistributedLock) over a
//! well-known key: clustered tasks run only on the leader, local tasks run
//! on every node. A semaphore bounds concurrent task executions per node.

pub mod task;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::Result;
use crate::lock::{DistributedLock, LockManager, LockOptions};

pub use task::{CronSchedule, ExecutionMode, Task, TaskFn, TaskFuture, TaskKind, TaskStatus};

/// Delay before a task blocked by a busy worker pool or its own running
/// instance is retried
const DISPATCH_RETRY: Duration = Duration::from_secs(1);

/// Backoff between failed leadership acquisition attempts
const LEADERSHIP_RETRY: Duration = Duration::from_secs(5);

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Worker pool size per node
    pub max_workers: usize,
    /// Name of the leadership lock
    pub leader_key: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_workers: 8,
            leader_key: "scheduler_leader".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapItem {
    at: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

struct TaskEntry {
    task: Arc<Task>,
    status: TaskStatus,
}

/// Per-process scheduler; clones share state
#[derive(Clone)]
pub struct Scheduler {
    node: String,
    lock: Arc<DistributedLock>,
    tasks: Arc<Mutex<HashMap<Uuid, TaskEntry>>>,
    heap: Arc<Mutex<BinaryHeap<Reverse<HeapItem>>>>,
    running: Arc<Mutex<HashSet<Uuid>>>,
    leader: Arc<AtomicBool>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    kick: Arc<Notify>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    seq: Arc<AtomicU64>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

enum RunOutcome {
    Completed(Result<()>),
    TimedOut,
    Shutdown,
}

impl Scheduler {
    /// Build a scheduler over the manager's leadership lock
    pub fn new(lock_manager: &LockManager, opts: SchedulerOptions) -> Self {
        let lock = lock_manager.new_lock(&opts.leader_key, LockOptions::default());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            node: lock_manager.owner().to_string(),
            lock,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            heap: Arc::new(Mutex::new(BinaryHeap::new())),
            running: Arc::new(Mutex::new(HashSet::new())),
            leader: Arc::new(AtomicBool::new(false)),
            workers: Arc::new(Semaphore::new(opts.max_workers)),
            max_workers: opts.max_workers,
            kick: Arc::new(Notify::new()),
            shutdown_tx: Arc::new(shutdown_tx),
            seq: Arc::new(AtomicU64::new(0)),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the leadership loop and the heap timer
    pub fn start(&self) {
        let leadership = tokio::spawn(self.clone().leadership_loop());
        let timer = tokio::spawn(self.clone().timer_loop());
        let mut handles = self.handles.lock().expect("scheduler handles");
        handles.push(leadership);
        handles.push(timer);
    }

    /// Whether this node currently holds scheduler leadership
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Register a task; it enters the heap at its first nominal fire
    pub fn register(&self, task: Task) -> Result<Uuid> {
        let id = task.id;
        let first = task.first_fire(Utc::now())?;
        {
            let mut tasks = self.tasks.lock().expect("scheduler tasks");
            tasks.insert(
                id,
                TaskEntry {
                    task: Arc::new(task),
                    status: TaskStatus::Pending,
                },
            );
        }
        self.push_heap(id, first);
        tracing::debug!(task = %id, fire_at = %first, "task registered");
        Ok(id)
    }

    /// Status of a registered task, if still known
    pub fn task_status(&self, id: Uuid) -> Option<TaskStatus> {
        self.tasks
            .lock()
            .expect("scheduler tasks")
            .get(&id)
            .map(|e| e.status)
    }

    /// Signal shutdown, wait for the loops to exit and the worker pool to
    /// drain. In-flight tasks observe cancellation through the shutdown
    /// signal; runaway bodies are bounded by their own timeout.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.kick.notify_one();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("scheduler handles");
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        // Acquiring every permit waits out the in-flight workers.
        if let Ok(permits) = self
            .workers
            .clone()
            .acquire_many_owned(self.max_workers as u32)
            .await
        {
            drop(permits);
        }
        tracing::info!(node = %self.node, "scheduler stopped");
    }

    fn push_heap(&self, id: Uuid, at: DateTime<Utc>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap
            .lock()
            .expect("scheduler heap")
            .push(Reverse(HeapItem { at, seq, id }));
        self.kick.notify_one();
    }

    fn requeue(&self, id: Uuid, at: DateTime<Utc>) {
        {
            let mut tasks = self.tasks.lock().expect("scheduler tasks");
            if let Some(entry) = tasks.get_mut(&id) {
                entry.status = TaskStatus::Pending;
            } else {
                return;
            }
        }
        self.push_heap(id, at);
    }

    fn finish(&self, id: Uuid, status: TaskStatus) {
        let mut tasks = self.tasks.lock().expect("scheduler tasks");
        if let Some(entry) = tasks.get_mut(&id) {
            entry.status = status;
        }
    }

    fn has_pending_local(&self) -> bool {
        let tasks = self.tasks.lock().expect("scheduler tasks");
        tasks.values().any(|e| {
            e.task.mode == ExecutionMode::Local
                && matches!(e.status, TaskStatus::Pending | TaskStatus::Running)
        })
    }

    /// Next heap deadline, or `None` when the timer should park: empty
    /// heap, or non-leader with no local tasks pending.
    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let heap = self.heap.lock().expect("scheduler heap");
        let head = heap.peek()?.0.at;
        if !self.is_leader() && !self.has_pending_local() {
            return None;
        }
        Some(head)
    }

    fn pop_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due = Vec::new();
        let mut heap = self.heap.lock().expect("scheduler heap");
        let tasks = self.tasks.lock().expect("scheduler tasks");
        while let Some(Reverse(head)) = heap.peek() {
            if head.at > now {
                break;
            }
            let item = heap.pop().expect("peeked head").0;
            // Stale entries for completed or cancelled tasks are dropped.
            if tasks.get(&item.id).is_some_and(|e| {
                matches!(e.status, TaskStatus::Pending | TaskStatus::Running)
            }) {
                due.push(item.id);
            }
        }
        due
    }

    async fn timer_loop(self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Utc::now();
            for id in self.pop_due(now) {
                self.dispatch(id, now);
            }
            match self.next_deadline() {
                Some(at) => {
                    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.kick.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.kick.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    fn dispatch(&self, id: Uuid, now: DateTime<Utc>) {
        let task = {
            let tasks = self.tasks.lock().expect("scheduler tasks");
            match tasks.get(&id) {
                Some(entry) => Arc::clone(&entry.task),
                None => return,
            }
        };

        // At most one concurrent execution per task per node.
        if self.running.lock().expect("running set").contains(&id) {
            self.requeue(id, now + retry_delay());
            return;
        }

        if task.mode == ExecutionMode::Clustered && !self.is_leader() {
            match task.next_nominal(now) {
                Ok(Some(at)) => self.requeue(id, at),
                Ok(None) => {
                    tracing::debug!(task = %task.name, "clustered one-shot skipped on follower");
                    self.finish(id, TaskStatus::Cancelled);
                }
                Err(e) => {
                    tracing::error!(task = %task.name, error = %e, "cannot compute next fire; terminating task");
                    self.finish(id, TaskStatus::Cancelled);
                }
            }
            return;
        }

        match self.workers.clone().try_acquire_owned() {
            Ok(permit) => {
                self.running.lock().expect("running set").insert(id);
                self.finish(id, TaskStatus::Running);
                self.spawn_worker(task, permit);
            }
            Err(_) => {
                tracing::debug!(task = %task.name, "worker pool exhausted; retrying shortly");
                self.requeue(id, now + retry_delay());
            }
        }
    }

    fn spawn_worker(&self, task: Arc<Task>, permit: tokio::sync::OwnedSemaphorePermit) {
        let scheduler = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _permit = permit;
            let id = task.id;
            let name = task.name.clone();
            let timeout = task.timeout;
            let body = task.invoke();

            // The body runs on its own task so a panic is contained and
            // surfaces as a join error.
            let runner: JoinHandle<RunOutcome> = tokio::spawn(async move {
                tokio::select! {
                    r = tokio::time::timeout(timeout, body) => match r {
                        Ok(res) => RunOutcome::Completed(res),
                        Err(_) => RunOutcome::TimedOut,
                    },
                    _ = shutdown.wait_for(|s| *s) => RunOutcome::Shutdown,
                }
            });

            let outcome = match runner.await {
                Ok(outcome) => outcome,
                Err(join_err) if join_err.is_panic() => {
                    tracing::error!(task = %name, "task panicked; cancelled and not re-queued");
                    scheduler.running.lock().expect("running set").remove(&id);
                    scheduler.finish(id, TaskStatus::Cancelled);
                    return;
                }
                Err(_) => RunOutcome::Shutdown,
            };

            scheduler.running.lock().expect("running set").remove(&id);
            match outcome {
                RunOutcome::Completed(Ok(())) => {
                    tracing::debug!(task = %name, "task completed");
                }
                RunOutcome::Completed(Err(e)) => {
                    tracing::error!(task = %name, error = %e, "task failed");
                }
                RunOutcome::TimedOut => {
                    tracing::warn!(task = %name, ?timeout, "task hit its timeout");
                }
                RunOutcome::Shutdown => {
                    // Re-queueing during shutdown would race the drain.
                    return;
                }
            }

            match task.next_after_completion(Utc::now()) {
                Ok(Some(at)) => scheduler.requeue(id, at),
                Ok(None) => scheduler.finish(id, TaskStatus::Completed),
                Err(e) => {
                    tracing::error!(task = %name, error = %e, "cannot compute next fire; terminating task");
                    scheduler.finish(id, TaskStatus::Cancelled);
                }
            }
        });
    }

    async fn leadership_loop(self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let acquired = tokio::select! {
                res = self.lock.lock() => res,
                _ = shutdown.wait_for(|s| *s) => break,
            };
            match acquired {
                Ok(()) => {
                    self.leader.store(true, Ordering::SeqCst);
                    tracing::info!(node = %self.node, "acquired scheduler leadership");
                    self.kick.notify_one();

                    let mut done = self.lock.done();
                    let shutdown_requested;
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    shutdown_requested = true;
                                    break;
                                }
                            }
                            _ = done.changed() => {
                                if *done.borrow() {
                                    shutdown_requested = false;
                                    break;
                                }
                            }
                        }
                    }
                    if shutdown_requested {
                        self.leader.store(false, Ordering::SeqCst);
                        if let Err(e) = self.lock.unlock().await {
                            tracing::debug!(error = %e, "leadership release at shutdown");
                        }
                        break;
                    } else {
                        self.leader.store(false, Ordering::SeqCst);
                        tracing::warn!(node = %self.node, "scheduler leadership lost; back to follower");
                        self.kick.notify_one();
                    }
                }
                Err(e) => {
                    tracing::warn!(node = %self.node, error = %e, "leadership acquisition failed");
                    tokio::select! {
                        _ = tokio::time::sleep(LEADERSHIP_RETRY) => {}
                        _ = shutdown.wait_for(|s| *s) => break,
                    }
                }
            }
        }
    }
}

fn retry_delay() -> chrono::Duration {
    chrono::Duration::from_std(DISPATCH_RETRY).expect("static duration")
}
