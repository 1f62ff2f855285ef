//! The task queue.
//!
//! A single in-process queue holds all deferred I/O work, organized into
//! named FIFOs (one per storage node or group). Dispatch is round-robin
//! across FIFOs so a busy node cannot starve the others, and FIFO within
//! a key.
//!
//! Tasks on the same key are serialized unless spawned as `parallel`
//! (a transfer pull may overlap verification on the same node), and an
//! `exclusive` task (tidy-up) runs only when its key is otherwise idle,
//! holding off everything else on the key until it finishes.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a task body wants done with the task afterwards.
pub enum Outcome {
    /// The task is finished (successfully or not).
    Done,

    /// Run the task again after a delay.
    ///
    /// The task leaves the in-progress set and waits in a time-ordered
    /// structure; its `attempt` counter increments on requeue.
    Requeue(Duration),
}

/// Context handed to a task body on each run.
#[derive(Clone)]
pub struct TaskCtx {
    /// Which run this is, starting from 0.
    pub attempt: u32,

    /// Cooperative shutdown flag, polled at suspension points.
    pub shutdown: CancellationToken,
}

pub(crate) type TaskBody = Arc<dyn Fn(TaskCtx) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// A deferrable unit of work.
pub struct Task {
    name: String,
    key: String,
    parallel: bool,
    exclusive: bool,
    attempt: u32,
    body: TaskBody,
    on_finish: Option<Box<dyn FnOnce() + Send>>,
}

impl Task {
    /// Creates a task.
    ///
    /// The body is re-invokable: it runs once per attempt, and a body
    /// returning [`Outcome::Requeue`] will be invoked again later.
    pub fn new<F, Fut>(name: impl Into<String>, key: impl Into<String>, body: F) -> Self
    where
        F: Fn(TaskCtx) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Outcome> + Send + 'static,
    {
        Self {
            name: name.into(),
            key: key.into(),
            parallel: false,
            exclusive: false,
            attempt: 0,
            body: Arc::new(move |ctx| Box::pin(body(ctx))),
            on_finish: None,
        }
    }

    /// Allows this task to overlap other tasks on the same key.
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Requires the key to be idle, and keeps it so while running.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Registers a hook to run when the task finally finishes.
    ///
    /// The hook does not run on requeue, only when the task completes or
    /// is abandoned.
    pub fn on_finish(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn body(&self) -> TaskBody {
        self.body.clone()
    }

    /// Runs the finish hook, if one was registered.
    pub(crate) fn finish(&mut self) {
        if let Some(hook) = self.on_finish.take() {
            hook();
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempt > 0 {
            write!(f, "{} (attempt {})", self.name, self.attempt + 1)
        } else {
            f.write_str(&self.name)
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.finish();
    }
}

struct Deferred {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    // Reversed so the BinaryHeap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

#[derive(Default)]
struct FifoState {
    queue: VecDeque<Task>,
    serial_running: bool,
    parallel_running: usize,
    exclusive_running: bool,
    deferred: usize,
}

impl FifoState {
    fn running(&self) -> usize {
        self.parallel_running
            + usize::from(self.serial_running)
            + usize::from(self.exclusive_running)
    }

    fn size(&self) -> usize {
        self.queue.len() + self.running() + self.deferred
    }
}

#[derive(Default)]
struct Inner {
    fifos: HashMap<String, FifoState>,
    /// Round-robin dispatch order. Each key appears at most once.
    order: VecDeque<String>,
    deferred: BinaryHeap<Deferred>,
    seq: u64,
    in_progress: usize,
}

impl Inner {
    fn ensure_ordered(&mut self, key: &str) {
        if !self.order.iter().any(|k| k == key) {
            self.order.push_back(key.to_owned());
        }
    }

    /// Moves any due deferred tasks back onto their FIFOs.
    ///
    /// Returns the deadline of the next still-pending deferred task.
    fn promote_due(&mut self, now: Instant) -> Option<Instant> {
        while let Some(head) = self.deferred.peek() {
            if head.due > now {
                return Some(head.due);
            }

            let deferred = self.deferred.pop().unwrap();
            let key = deferred.task.key.clone();
            let fifo = self.fifos.entry(key.clone()).or_default();
            fifo.deferred -= 1;
            fifo.queue.push_back(deferred.task);
            self.ensure_ordered(&key);
        }

        None
    }

    fn try_dispatch(&mut self) -> Option<Task> {
        for i in 0..self.order.len() {
            let key = &self.order[i];
            let fifo = match self.fifos.get_mut(key) {
                Some(fifo) => fifo,
                None => continue,
            };

            if fifo.exclusive_running {
                continue;
            }

            let eligible = match fifo.queue.front() {
                None => continue,
                Some(head) if head.exclusive => {
                    !fifo.serial_running && fifo.parallel_running == 0
                }
                Some(head) if head.parallel => true,
                Some(_) => !fifo.serial_running,
            };

            if !eligible {
                continue;
            }

            let task = fifo.queue.pop_front().unwrap();
            if task.exclusive {
                fifo.exclusive_running = true;
            } else if task.parallel {
                fifo.parallel_running += 1;
            } else {
                fifo.serial_running = true;
            }
            self.in_progress += 1;

            // Rotate the key to the back for fairness
            let key = self.order.remove(i).unwrap();
            self.order.push_back(key);

            return Some(task);
        }

        None
    }
}

/// Queue statistics, for the main loop's status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub deferred: usize,
    pub in_progress: usize,
}

/// The fair multi-FIFO task queue.
pub struct FairQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl FairQueue {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            shutdown,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Submits a task.
    ///
    /// After shutdown has begun the task is discarded: the Index will
    /// re-surface the work on the next daemon start.
    pub fn put(&self, task: Task) {
        if self.shutdown.is_cancelled() {
            tracing::debug!("Discarding task after shutdown: {}", task);
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        let key = task.key.clone();
        inner.fifos.entry(key.clone()).or_default().queue.push_back(task);
        inner.ensure_ordered(&key);
        drop(inner);

        self.notify.notify_one();
    }

    /// Re-submits a task to run after `delay`.
    pub fn defer(&self, mut task: Task, delay: Duration) {
        if self.shutdown.is_cancelled() {
            tracing::debug!("Discarding deferred task after shutdown: {}", task);
            return;
        }

        task.attempt += 1;

        let mut inner = self.inner.lock().unwrap();
        let seq = inner.seq;
        inner.seq += 1;
        inner
            .fifos
            .entry(task.key.clone())
            .or_default()
            .deferred += 1;
        inner.deferred.push(Deferred {
            due: Instant::now() + delay,
            seq,
            task,
        });
        drop(inner);

        self.notify.notify_one();
    }

    /// Takes the next runnable task, waiting if none is ready.
    ///
    /// Returns `None` once shutdown has begun: in-progress tasks drain,
    /// queued ones are abandoned.
    pub async fn get(&self) -> Option<Task> {
        loop {
            let next_due = {
                let mut inner = self.inner.lock().unwrap();
                let next_due = inner.promote_due(Instant::now());

                if let Some(task) = inner.try_dispatch() {
                    drop(inner);
                    // There may be more runnable work for another worker
                    self.notify.notify_one();
                    return Some(task);
                }

                if self.shutdown.is_cancelled() {
                    return None;
                }

                next_due
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(due) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                }
            }
        }
    }

    /// Reports that a dispatched task's current run has ended.
    ///
    /// Must be called exactly once per successful [`FairQueue::get`],
    /// before any `defer` of the same task.
    pub fn task_done(&self, task: &Task) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fifo) = inner.fifos.get_mut(&task.key) {
            if task.exclusive {
                fifo.exclusive_running = false;
            } else if task.parallel {
                fifo.parallel_running = fifo.parallel_running.saturating_sub(1);
            } else {
                fifo.serial_running = false;
            }
        }
        inner.in_progress = inner.in_progress.saturating_sub(1);
        drop(inner);

        self.notify.notify_one();
    }

    /// Is nothing queued, deferred, or running for this key?
    pub fn fifo_idle(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.fifos.get(key).map(|f| f.size()).unwrap_or(0) == 0
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        QueueStats {
            queued: inner.fifos.values().map(|f| f.queue.len()).sum(),
            deferred: inner.deferred.len(),
            in_progress: inner.in_progress,
        }
    }

    /// Is the whole queue drained?
    pub fn is_empty(&self) -> bool {
        let stats = self.stats();
        stats.queued == 0 && stats.deferred == 0 && stats.in_progress == 0
    }
}
