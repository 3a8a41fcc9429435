// Single-worker task queue with debounced writes and per-handle drain

use eyre::Result;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::handle::StoreHandle;

/// Default idle time after which the worker thread exits
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

const DEFAULT_THREAD_NAME: &str = "objectstore-sync";

static SHARED_QUEUE: OnceLock<TaskQueue> = OnceLock::new();

/// What a task does to its handle's files.
///
/// The kind drives debouncing and cancellation; the body does the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Write,
    Read,
    Delete,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Write => write!(f, "write"),
            TaskKind::Read => write!(f, "read"),
            TaskKind::Delete => write!(f, "delete"),
        }
    }
}

type TaskBody = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A unit of work for the worker thread
pub struct Task {
    kind: TaskKind,
    body: TaskBody,
}

impl Task {
    pub fn new<F>(kind: TaskKind, body: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            kind,
            body: Box::new(body),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("kind", &self.kind).finish_non_exhaustive()
    }
}

/// Worker lifecycle settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Idle time after the last task before the worker exits
    pub keep_alive: Duration,
    /// Name given to the worker thread
    pub thread_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

struct Entry {
    handle: StoreHandle,
    task: Task,
    eligible_at: Instant,
    submitted_at: Instant,
}

#[derive(Default)]
struct QueueState {
    /// Not-yet-started tasks in submission order
    pending: Vec<Entry>,
    /// Handle of the task the worker is executing
    running: Option<StoreHandle>,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
    stopping: bool,
}

impl QueueState {
    fn has_work_for(&self, handle: &StoreHandle) -> bool {
        self.running.as_ref() == Some(handle) || self.pending.iter().any(|e| &e.handle == handle)
    }

    /// Index of the first task allowed to start now.
    ///
    /// A task may start only when it is eligible and no earlier task of the
    /// same handle is still pending, which keeps per-handle FIFO order while
    /// letting other handles overtake a delayed write.
    fn next_runnable(&self, now: Instant) -> Option<usize> {
        let mut seen: HashSet<&StoreHandle> = HashSet::new();
        for (idx, entry) in self.pending.iter().enumerate() {
            if !seen.insert(&entry.handle) {
                continue;
            }
            if self.stopping || entry.eligible_at <= now {
                return Some(idx);
            }
        }
        None
    }

    /// Earliest instant at which some handle's head task becomes eligible
    fn next_wake(&self) -> Option<Instant> {
        let mut seen: HashSet<&StoreHandle> = HashSet::new();
        self.pending
            .iter()
            .filter(|e| seen.insert(&e.handle))
            .map(|e| e.eligible_at)
            .min()
    }
}

struct Shared {
    config: QueueConfig,
    state: Mutex<QueueState>,
    /// Signals the worker: new task, cancellation, expedite, stop
    work: Condvar,
    /// Signals drainers: a task finished or was removed
    idle: Condvar,
}

impl Shared {
    // Queue state is never left half-updated across a panic, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ordered, single-threaded executor shared by every store that uses it.
///
/// Exactly one task runs at a time. Tasks of one handle run in submission
/// order; a newly submitted `Write` replaces any not-yet-started `Write` of the
/// same handle and restarts the delay. The worker thread starts on first
/// submit, exits after `keep_alive` of inactivity, and restarts transparently.
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<Shared>,
}

impl TaskQueue {
    /// Create an isolated queue. The worker is not started until needed.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(QueueState::default()),
                work: Condvar::new(),
                idle: Condvar::new(),
            }),
        }
    }

    /// Process-wide queue, created with default settings on first use
    pub fn shared() -> TaskQueue {
        Self::shared_with(QueueConfig::default())
    }

    /// Process-wide queue. `config` only applies if this call creates it.
    pub fn shared_with(config: QueueConfig) -> TaskQueue {
        SHARED_QUEUE.get_or_init(|| TaskQueue::new(config)).clone()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Queue `task` for `handle`, eligible to run once `delay` has elapsed
    pub fn submit(&self, handle: &StoreHandle, task: Task, delay: Duration) {
        let kind = task.kind;
        let now = Instant::now();
        let mut state = self.shared.lock();

        if kind == TaskKind::Write {
            let before = state.pending.len();
            state
                .pending
                .retain(|e| !(e.handle == *handle && e.task.kind == TaskKind::Write));
            let replaced = before - state.pending.len();
            if replaced > 0 {
                debug!(store = %handle, replaced, "submit: replaced pending write");
            }
        }

        state.pending.push(Entry {
            handle: handle.clone(),
            task,
            eligible_at: now + delay,
            submitted_at: now,
        });
        debug!(store = %handle, %kind, delay_ms = delay.as_millis() as u64, "submit: queued task");

        if let Err(e) = self.ensure_worker(&mut state) {
            error!(error = ?e, "Failed to start worker thread, task stays queued");
        }
        self.shared.work.notify_all();
    }

    /// Remove not-yet-started tasks of `kind` for `handle`. Running tasks are not interrupted.
    pub fn cancel_pending(&self, handle: &StoreHandle, kind: TaskKind) -> usize {
        let mut state = self.shared.lock();
        let before = state.pending.len();
        state.pending.retain(|e| !(e.handle == *handle && e.task.kind == kind));
        let removed = before - state.pending.len();
        drop(state);

        if removed > 0 {
            debug!(store = %handle, %kind, removed, "cancel_pending: removed tasks");
            self.shared.work.notify_all();
            self.shared.idle.notify_all();
        }
        removed
    }

    /// Make every pending task of `handle` eligible immediately
    pub fn expedite(&self, handle: &StoreHandle) {
        let now = Instant::now();
        let mut state = self.shared.lock();
        let mut count = 0;
        for entry in state.pending.iter_mut().filter(|e| e.handle == *handle) {
            if entry.eligible_at > now {
                entry.eligible_at = now;
                count += 1;
            }
        }
        drop(state);

        if count > 0 {
            debug!(store = %handle, count, "expedite: tasks made eligible");
            self.shared.work.notify_all();
        }
    }

    /// Block until no task for `handle` is pending or executing.
    ///
    /// # Panics
    ///
    /// Panics when called from the worker thread (for instance from inside a
    /// read callback); waiting there could never finish.
    pub fn drain(&self, handle: &StoreHandle) {
        let mut state = self.shared.lock();
        self.assert_not_worker(&state, "drain");

        let mut waited = false;
        while state.has_work_for(handle) {
            if state.worker_id.is_none() && !state.stopping {
                if let Err(e) = self.ensure_worker(&mut state) {
                    error!(store = %handle, error = ?e, "drain: no worker to run pending tasks");
                    return;
                }
                self.shared.work.notify_all();
            }
            if !waited {
                let current = thread::current();
                debug!(store = %handle, thread = ?current.name(), "drain: waiting for pending tasks");
                waited = true;
            }
            state = self.shared.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
        }

        if waited {
            debug!(store = %handle, "drain: queue empty, continuing");
        }
    }

    /// Number of pending or executing tasks for `handle`
    pub fn pending_count(&self, handle: &StoreHandle) -> usize {
        let state = self.shared.lock();
        let running = usize::from(state.running.as_ref() == Some(handle));
        running + state.pending.iter().filter(|e| e.handle == *handle).count()
    }

    /// Start the worker thread if it is not running
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.lock();
        self.ensure_worker(&mut state)
    }

    /// Run every pending task (delays are ignored), then stop the worker.
    ///
    /// A later submit starts a fresh worker.
    ///
    /// # Panics
    ///
    /// Panics when called from the worker thread.
    pub fn stop(&self) {
        let join = {
            let mut state = self.shared.lock();
            self.assert_not_worker(&state, "stop");
            if state.worker_id.is_none() {
                return;
            }
            state.stopping = true;
            self.shared.work.notify_all();
            state.worker.take()
        };

        let Some(join) = join else {
            // Another caller is already stopping the worker
            let mut state = self.shared.lock();
            while state.stopping {
                state = self.shared.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            return;
        };

        if join.join().is_err() {
            error!("Worker thread panicked during shutdown");
        }

        let mut state = self.shared.lock();
        state.worker_id = None;
        state.running = None;
        state.stopping = false;
        if !state.pending.is_empty() {
            if let Err(e) = self.ensure_worker(&mut state) {
                error!(error = ?e, "Failed to restart worker for tasks queued during stop");
            }
        }
        drop(state);

        self.shared.idle.notify_all();
        info!("Task queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().worker_id.is_some()
    }

    /// Panic if the current thread is this queue's worker
    pub(crate) fn ensure_not_worker(&self, op: &str) {
        let state = self.shared.lock();
        self.assert_not_worker(&state, op);
    }

    fn assert_not_worker(&self, state: &QueueState, op: &str) {
        if state.worker_id == Some(thread::current().id()) {
            panic!("{op} called from the objectstore worker thread; it would wait on itself forever");
        }
    }

    fn ensure_worker(&self, state: &mut QueueState) -> Result<()> {
        if state.worker_id.is_some() || state.stopping {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let join = thread::Builder::new()
            .name(self.shared.config.thread_name.clone())
            .spawn(move || worker_loop(shared))?;

        state.worker_id = Some(join.thread().id());
        state.worker = Some(join);
        info!(
            thread = %self.shared.config.thread_name,
            keep_alive_ms = self.shared.config.keep_alive.as_millis() as u64,
            "Worker thread started"
        );
        Ok(())
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("TaskQueue")
            .field("config", &self.shared.config)
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .field("worker_running", &state.worker_id.is_some())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let me = thread::current().id();
    let keep_alive = shared.config.keep_alive;
    let mut idle_since = Instant::now();
    let mut state = shared.lock();

    loop {
        let now = Instant::now();

        if let Some(idx) = state.next_runnable(now) {
            let entry = state.pending.remove(idx);
            state.running = Some(entry.handle.clone());
            drop(state);

            run_entry(entry);

            state = shared.lock();
            state.running = None;
            shared.idle.notify_all();
            idle_since = Instant::now();
            continue;
        }

        let wait = match state.next_wake() {
            Some(at) => at.saturating_duration_since(now),
            None if state.stopping => break,
            None => {
                let deadline = idle_since + keep_alive;
                if now >= deadline {
                    debug!(idle_ms = now.duration_since(idle_since).as_millis() as u64, "Worker idle, exiting");
                    break;
                }
                deadline - now
            }
        };

        state = shared
            .work
            .wait_timeout(state, wait)
            .map(|(guard, _)| guard)
            .unwrap_or_else(|e| e.into_inner().0);
    }

    if state.worker_id == Some(me) {
        state.worker_id = None;
        if !state.stopping {
            // Detach: nobody will join an idle-exited worker
            state.worker.take();
        }
    }
    drop(state);
    shared.idle.notify_all();
    info!("Worker thread exited");
}

fn run_entry(entry: Entry) {
    let Entry {
        handle,
        task,
        submitted_at,
        ..
    } = entry;
    let kind = task.kind;
    let start = Instant::now();
    debug!(
        store = %handle,
        %kind,
        queued_ms = start.duration_since(submitted_at).as_millis() as u64,
        "run: start"
    );

    match panic::catch_unwind(AssertUnwindSafe(task.body)) {
        Ok(Ok(())) => {
            debug!(store = %handle, %kind, elapsed_ms = start.elapsed().as_millis() as u64, "run: finish");
        }
        Ok(Err(e)) => {
            warn!(store = %handle, %kind, error = ?e, "Task failed");
        }
        Err(payload) => {
            error!(store = %handle, %kind, panic = %panic_message(&*payload), "Task panicked");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn test_queue() -> TaskQueue {
        TaskQueue::new(QueueConfig {
            keep_alive: Duration::from_secs(5),
            thread_name: "objectstore-test".to_string(),
        })
    }

    fn handle(name: &str) -> StoreHandle {
        StoreHandle::new(name, "/tmp/objectstore-queue-tests").unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let make = move |label: &str| {
            let log = Arc::clone(&log2);
            let label = label.to_string();
            let kind = if label.starts_with('w') { TaskKind::Write } else { TaskKind::Read };
            Task::new(kind, move || {
                log.lock().unwrap().push(label);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_tasks_run_in_submission_order() {
        let queue = test_queue();
        let h = handle("order");
        let (log, task) = recorder();

        queue.submit(&h, task("r1"), Duration::ZERO);
        queue.submit(&h, task("r2"), Duration::ZERO);
        queue.submit(&h, task("w3"), Duration::ZERO);
        queue.submit(&h, task("r4"), Duration::ZERO);
        queue.drain(&h);

        assert_eq!(*log.lock().unwrap(), vec!["r1", "r2", "w3", "r4"]);
        assert_eq!(queue.pending_count(&h), 0);
    }

    #[test]
    fn test_debounced_writes_collapse_to_latest() {
        let queue = test_queue();
        let h = handle("debounce");
        let (log, task) = recorder();
        let delay = Duration::from_millis(100);

        queue.submit(&h, task("w1"), delay);
        queue.submit(&h, task("w2"), delay);
        queue.submit(&h, task("w3"), delay);
        assert_eq!(queue.pending_count(&h), 1);

        queue.drain(&h);
        assert_eq!(*log.lock().unwrap(), vec!["w3"]);
    }

    #[test]
    fn test_delay_restarts_on_replacement() {
        let queue = test_queue();
        let h = handle("restart");
        let (_log, task) = recorder();
        let delay = Duration::from_millis(150);

        let start = Instant::now();
        queue.submit(&h, task("w1"), delay);
        thread::sleep(Duration::from_millis(100));
        queue.submit(&h, task("w2"), delay);
        queue.drain(&h);

        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_read_behind_delayed_write_sees_it() {
        let queue = test_queue();
        let h = handle("rw");
        let (log, task) = recorder();

        queue.submit(&h, task("w1"), Duration::from_millis(80));
        queue.submit(&h, task("r1"), Duration::ZERO);
        queue.drain(&h);

        assert_eq!(*log.lock().unwrap(), vec!["w1", "r1"]);
    }

    #[test]
    fn test_cancel_pending_removes_only_that_kind() {
        let queue = test_queue();
        let h = handle("cancel");
        let (log, task) = recorder();

        queue.submit(&h, task("w1"), Duration::from_secs(30));
        queue.submit(&h, task("r1"), Duration::ZERO);
        assert_eq!(queue.cancel_pending(&h, TaskKind::Write), 1);
        assert_eq!(queue.cancel_pending(&h, TaskKind::Delete), 0);
        queue.drain(&h);

        assert_eq!(*log.lock().unwrap(), vec!["r1"]);
    }

    #[test]
    fn test_failing_task_does_not_stop_worker() {
        let queue = test_queue();
        let h = handle("failing");
        let (log, task) = recorder();

        queue.submit(&h, Task::new(TaskKind::Read, || Err(eyre::eyre!("disk on fire"))), Duration::ZERO);
        queue.submit(&h, Task::new(TaskKind::Read, || panic!("codec exploded")), Duration::ZERO);
        queue.submit(&h, task("r3"), Duration::ZERO);
        queue.drain(&h);

        assert_eq!(*log.lock().unwrap(), vec!["r3"]);
        assert!(queue.is_running());
    }

    #[test]
    fn test_delayed_handle_does_not_block_other_handle() {
        let queue = test_queue();
        let a = handle("slow");
        let b = handle("fast");
        let (log, task) = recorder();

        queue.submit(&a, task("w-a"), Duration::from_secs(30));
        queue.submit(&b, task("r-b"), Duration::ZERO);

        let start = Instant::now();
        queue.drain(&b);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(*log.lock().unwrap(), vec!["r-b"]);
        assert_eq!(queue.pending_count(&a), 1);

        queue.cancel_pending(&a, TaskKind::Write);
        queue.drain(&a);
    }

    #[test]
    fn test_expedite_skips_remaining_delay() {
        let queue = test_queue();
        let h = handle("expedite");
        let (log, task) = recorder();

        queue.submit(&h, task("w1"), Duration::from_secs(30));
        let start = Instant::now();
        queue.expedite(&h);
        queue.drain(&h);

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(*log.lock().unwrap(), vec!["w1"]);
    }

    #[test]
    fn test_drain_from_worker_is_detected() {
        let queue = test_queue();
        let h = handle("reentrant");
        let (tx, rx) = mpsc::channel();

        let inner_queue = queue.clone();
        let inner_handle = h.clone();
        queue.submit(
            &h,
            Task::new(TaskKind::Read, move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| inner_queue.drain(&inner_handle)));
                tx.send(result.is_err()).unwrap();
                Ok(())
            }),
            Duration::ZERO,
        );

        let panicked = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(panicked);
        queue.drain(&h);
    }

    #[test]
    fn test_worker_exits_when_idle_and_restarts() {
        let queue = TaskQueue::new(QueueConfig {
            keep_alive: Duration::from_millis(50),
            thread_name: "objectstore-idle".to_string(),
        });
        let h = handle("idle");
        let (log, task) = recorder();

        assert!(!queue.is_running());
        queue.submit(&h, task("r1"), Duration::ZERO);
        queue.drain(&h);

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!queue.is_running());

        queue.submit(&h, task("r2"), Duration::ZERO);
        queue.drain(&h);
        assert_eq!(*log.lock().unwrap(), vec!["r1", "r2"]);
    }

    #[test]
    fn test_stop_runs_delayed_tasks_first() {
        let queue = test_queue();
        let h = handle("stop");
        let (log, task) = recorder();

        queue.start().unwrap();
        assert!(queue.is_running());

        queue.submit(&h, task("w1"), Duration::from_secs(30));
        let start = Instant::now();
        queue.stop();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!queue.is_running());
        assert_eq!(*log.lock().unwrap(), vec!["w1"]);

        // Submitting again restarts the worker
        queue.submit(&h, task("r2"), Duration::ZERO);
        queue.drain(&h);
        assert_eq!(*log.lock().unwrap(), vec!["w1", "r2"]);
    }

    #[test]
    fn test_stop_without_worker_is_noop() {
        let queue = test_queue();
        queue.stop();
        assert!(!queue.is_running());
    }

    #[test]
    fn test_single_task_runs_at_a_time() {
        let queue = test_queue();
        let active = Arc::new(Mutex::new((0usize, 0usize)));
        let handles: Vec<_> = (0..4).map(|i| handle(&format!("h{}", i))).collect();

        for h in &handles {
            for _ in 0..5 {
                let active = Arc::clone(&active);
                queue.submit(
                    h,
                    Task::new(TaskKind::Read, move || {
                        {
                            let mut a = active.lock().unwrap();
                            a.0 += 1;
                            a.1 = a.1.max(a.0);
                        }
                        thread::sleep(Duration::from_millis(2));
                        active.lock().unwrap().0 -= 1;
                        Ok(())
                    }),
                    Duration::ZERO,
                );
            }
        }
        for h in &handles {
            queue.drain(h);
        }

        assert_eq!(active.lock().unwrap().1, 1);
    }
}
