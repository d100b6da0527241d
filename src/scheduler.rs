//! Where deferred work runs.
//!
//! There are two levels of deferral. [`TaskQueue`] is the store's batching context: while a
//! [`Store::join`](crate::Store::join) is active, notification flushes are queued and run once the outermost join
//! exits. [`FlushScheduler`] is consulted outside of a batch when the store is configured for asynchronous flushes.

use std::cell::Cell;
use std::cell::RefCell;

use tracing::trace;

pub type Task = Box<dyn FnOnce()>;

/// Decides when a requested notification flush is executed.
pub trait FlushScheduler {
    fn schedule_flush(&self, flush: Task);
}

/// Runs the flush right away.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncScheduler;

impl FlushScheduler for SyncScheduler {
    fn schedule_flush(&self, flush: Task) {
        flush()
    }
}

/// Defers the flush to a local tokio task so that everything notified until the current task yields is delivered
/// in one pass.
///
/// Must be used from within a [`tokio::task::LocalSet`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl FlushScheduler for TokioScheduler {
    fn schedule_flush(&self, flush: Task) {
        tokio::task::spawn_local(async move { flush() });
    }
}

/// Collects work requested while a batch is open.
#[derive(Default)]
pub struct TaskQueue {
    depth: Cell<usize>,
    tasks: RefCell<Vec<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_batching(&self) -> bool {
        self.depth.get() > 0
    }

    /// Runs `f` inside a batch. Nested calls join the outer batch.
    pub fn join<R>(&self, f: impl FnOnce() -> R) -> R {
        self.depth.set(self.depth.get() + 1);
        let guard = DepthGuard(self);
        let result = f();
        drop(guard);
        if !self.is_batching() {
            self.run();
        }
        result
    }

    /// Queues `task` if a batch is open. Otherwise the task is handed back.
    pub fn schedule(&self, task: Task) -> Result<(), Task> {
        if !self.is_batching() {
            return Err(task);
        }
        self.tasks.borrow_mut().push(task);
        Ok(())
    }

    // Tasks may queue more tasks; they run in this same drain.
    fn run(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.borrow_mut());
            if tasks.is_empty() {
                break;
            }
            trace!("running {} batched task(s)", tasks.len());
            for task in tasks {
                task();
            }
        }
    }
}

struct DepthGuard<'a>(&'a TaskQueue);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.depth.set(self.0.depth.get() - 1);
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::*;

    #[test]
    fn join_defers_until_outermost() {
        let queue = Rc::new(TaskQueue::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        queue.join(|| {
            let l = log.clone();
            assert!(queue.schedule(Box::new(move || l.borrow_mut().push("outer"))).is_ok());
            queue.join(|| {
                let l = log.clone();
                assert!(queue.schedule(Box::new(move || l.borrow_mut().push("inner"))).is_ok());
            });
            assert!(log.borrow().is_empty());
        });

        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
        assert!(!queue.is_batching());
        assert!(queue.schedule(Box::new(|| ())).is_err());
    }

    #[test]
    fn sync_scheduler_runs_now() {
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        SyncScheduler.schedule_flush(Box::new(move || r.set(true)));
        assert!(ran.get());
    }
}
