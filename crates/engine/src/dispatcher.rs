//! Participant RPC dispatcher
//!
//! A pool of worker threads delivering participant requests, so that fan-out
//! to many tablets runs in parallel. Tasks run in submission order. When
//! every worker is busy (typically waiting on slow participants) and tasks
//! are queued, extra workers are started up to a limit; they exit after
//! sitting idle for [`OVERFLOW_KEEP_ALIVE`].

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tabletsnap_core::{Result, SnapshotError};
use tracing::{debug, error};

/// Idle time after which a worker above the core count exits
pub const OVERFLOW_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Dispatcher metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Tasks waiting in the queue
    pub queue_depth: usize,
    /// Tasks currently executing
    pub active_tasks: usize,
    /// Tasks finished since creation
    pub tasks_completed: u64,
    /// Live worker threads
    pub worker_count: usize,
}

type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    /// Workers waiting for a task
    idle: usize,
    /// Live workers
    workers: usize,
}

struct DispatcherInner {
    queue: Mutex<Queue>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    active_tasks: AtomicUsize,
    tasks_completed: AtomicU64,
    spawned: AtomicUsize,
}

/// Worker pool delivering participant RPCs
pub struct RpcDispatcher {
    inner: Arc<DispatcherInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    max_threads: usize,
}

impl RpcDispatcher {
    /// Fixed pool of `num_threads` workers
    pub fn new(num_threads: usize) -> Result<Self> {
        Self::with_overflow(num_threads, num_threads)
    }

    /// `core_threads` permanent workers named `tabletsnap-rpc-0`, ..., and
    /// up to `max_threads` in total while tasks wait for a free worker
    pub fn with_overflow(core_threads: usize, max_threads: usize) -> Result<Self> {
        let dispatcher = Self {
            inner: Arc::new(DispatcherInner {
                queue: Mutex::new(Queue::default()),
                work_ready: Condvar::new(),
                drain_cond: Condvar::new(),
                shutdown: AtomicBool::new(false),
                active_tasks: AtomicUsize::new(0),
                tasks_completed: AtomicU64::new(0),
                spawned: AtomicUsize::new(0),
            }),
            handles: Mutex::new(Vec::with_capacity(core_threads)),
            max_threads: max_threads.max(core_threads),
        };
        let mut queue = dispatcher.inner.queue.lock();
        for _ in 0..core_threads {
            dispatcher.spawn_worker(&mut queue, false)?;
        }
        drop(queue);
        Ok(dispatcher)
    }

    /// Start a worker; the caller holds the queue lock
    fn spawn_worker(&self, queue: &mut Queue, overflow: bool) -> Result<()> {
        let n = self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name(format!("tabletsnap-rpc-{}", n))
            .spawn(move || worker_loop(&inner, overflow))?;
        queue.workers += 1;
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Queue a task; fails with `Unavailable` once the dispatcher is shut down
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut queue = self.inner.queue.lock();
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SnapshotError::unavailable("RPC dispatcher is shut down"));
        }
        queue.tasks.push_back(Box::new(work));
        if queue.tasks.len() > queue.idle && queue.workers < self.max_threads {
            match self.spawn_worker(&mut queue, true) {
                Ok(()) => debug!(
                    target: "tabletsnap::coordinator",
                    workers = queue.workers,
                    "Every RPC worker is busy, started another"
                ),
                Err(e) => error!(
                    target: "tabletsnap::coordinator",
                    error = %e,
                    "Failed to start an extra RPC worker"
                ),
            }
        }
        drop(queue);
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Block until every queued and running task has finished
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while !queue.tasks.is_empty() || self.inner.active_tasks.load(Ordering::Acquire) > 0 {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Stop accepting tasks, finish the queued ones and join the workers
    pub fn shutdown(&self) {
        {
            let _queue = self.inner.queue.lock();
            self.inner.shutdown.store(true, Ordering::Release);
            self.inner.work_ready.notify_all();
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Current metrics
    pub fn stats(&self) -> DispatcherStats {
        let queue = self.inner.queue.lock();
        DispatcherStats {
            queue_depth: queue.tasks.len(),
            active_tasks: self.inner.active_tasks.load(Ordering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(Ordering::Relaxed),
            worker_count: queue.workers,
        }
    }
}

impl Drop for RpcDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active_tasks` and wakes drain waiters, even if the task panicked
struct ActiveTaskGuard<'a> {
    inner: &'a DispatcherInner,
}

impl Drop for ActiveTaskGuard<'_> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_tasks.fetch_sub(1, Ordering::Release);
        self.inner.tasks_completed.fetch_add(1, Ordering::Relaxed);
        if prev_active == 1 {
            let queue = self.inner.queue.lock();
            if queue.tasks.is_empty() {
                self.inner.drain_cond.notify_all();
            }
        }
    }
}

fn worker_loop(inner: &DispatcherInner, overflow: bool) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    inner.active_tasks.fetch_add(1, Ordering::Release);
                    break task;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    queue.workers -= 1;
                    return;
                }
                queue.idle += 1;
                let timed_out = if overflow {
                    inner
                        .work_ready
                        .wait_for(&mut queue, OVERFLOW_KEEP_ALIVE)
                        .timed_out()
                } else {
                    inner.work_ready.wait(&mut queue);
                    false
                };
                queue.idle -= 1;
                if timed_out && queue.tasks.is_empty() {
                    queue.workers -= 1;
                    return;
                }
            }
        };

        let _guard = ActiveTaskGuard { inner };
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
            error!(
                target: "tabletsnap::coordinator",
                "RPC task panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_submit_and_drain() {
        let dispatcher = RpcDispatcher::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            dispatcher
                .submit(move || {
                    c.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }
        dispatcher.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        assert_eq!(dispatcher.stats().tasks_completed, 10);
    }

    #[test]
    fn test_tasks_run_in_parallel() {
        let dispatcher = RpcDispatcher::new(3).unwrap();
        let barrier = Arc::new(Barrier::new(3));
        for _ in 0..3 {
            let b = Arc::clone(&barrier);
            dispatcher
                .submit(move || {
                    b.wait();
                })
                .unwrap();
        }
        // Deadlocks unless all three tasks are running at once
        dispatcher.drain();
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let dispatcher = RpcDispatcher::new(1).unwrap();
        dispatcher.shutdown();
        let err = dispatcher.submit(|| {}).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_shutdown_finishes_queued_tasks() {
        let dispatcher = RpcDispatcher::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            dispatcher
                .submit(move || {
                    std::thread::sleep(Duration::from_millis(5));
                    c.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }
        dispatcher.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let dispatcher = RpcDispatcher::new(1).unwrap();
        dispatcher.submit(|| panic!("boom")).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        dispatcher
            .submit(move || {
                c.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        dispatcher.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_blocked_workers_do_not_hold_up_queued_tasks() {
        let dispatcher = RpcDispatcher::with_overflow(1, 4).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let blocked = Arc::clone(&release_rx);
        dispatcher
            .submit(move || {
                let _ = blocked.lock().recv();
            })
            .unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        dispatcher
            .submit(move || {
                done_tx.send(()).unwrap();
            })
            .unwrap();
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("queued task waited for the blocked worker");
        assert!(dispatcher.stats().worker_count >= 2);

        release_tx.send(()).unwrap();
        dispatcher.drain();
    }

    #[test]
    fn test_fixed_pool_never_grows() {
        let dispatcher = RpcDispatcher::new(2).unwrap();
        let barrier = Arc::new(Barrier::new(3));
        for _ in 0..2 {
            let b = Arc::clone(&barrier);
            dispatcher
                .submit(move || {
                    b.wait();
                })
                .unwrap();
        }
        dispatcher.submit(|| {}).unwrap();
        assert_eq!(dispatcher.stats().worker_count, 2);
        barrier.wait();
        dispatcher.drain();
        assert_eq!(dispatcher.stats().tasks_completed, 3);
    }
}
