//! Task sequencer / strand: a single accept-loop that runs enqueued
//! tasks one at a time, in schedule order, regardless of when each task's
//! own awaited events actually resolve.
//!
//! Grounded on `original_source/include/srsgnb/support/async/async_task_loop.h`'s
//! `async_task_sequencer`: `schedule` pushes onto a bounded `async_queue`;
//! the loop task (spawned eagerly at construction, like the original's
//! `run()` called from the constructor) pops one task and awaits it to
//! completion before popping the next. `request_stop` flips a flag and
//! pushes a no-op so a loop blocked on an empty queue wakes up and exits.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::QueueFull;
use crate::executor::Executor;
use crate::sync::AsyncQueue;
use crate::task::{JoinHandle, Task};

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Serialises arbitrary futures through a bounded queue, running at most one
/// at a time. Scheduled tasks' own outputs are discarded -- the original's
/// `schedule` only ever reports whether the push itself succeeded.
pub struct Sequencer {
    queue: Arc<AsyncQueue<BoxedTask>>,
    running: Arc<AtomicBool>,
    loop_handle: JoinHandle<()>,
}

impl Sequencer {
    /// Create a sequencer with room for `capacity` pending tasks, spawning
    /// its accept-loop onto `exec` immediately.
    pub fn new<E>(exec: E, capacity: usize) -> Self
    where
        E: Executor + Clone + Send + Sync + 'static,
    {
        let queue = Arc::new(AsyncQueue::new(capacity));
        let running = Arc::new(AtomicBool::new(true));
        let loop_queue = queue.clone();
        let loop_running = running.clone();
        let loop_handle = Task::spawn(exec, async move {
            while loop_running.load(Ordering::Acquire) {
                let next = loop_queue.pop().await;
                next.await;
            }
        });
        Self { queue, running, loop_handle }
    }

    /// Enqueue `task`. Fails with [`QueueFull`] if the queue is at capacity
    /// -- the caller, not this sequencer, decides how to react (retry,
    /// drop, back-pressure upstream).
    pub fn schedule<F>(&self, task: F) -> Result<(), QueueFull>
    where
        F: Future + Send + 'static,
    {
        let boxed: BoxedTask = Box::pin(async move {
            task.await;
        });
        if self.queue.try_push(boxed) {
            Ok(())
        } else {
            Err(QueueFull)
        }
    }

    pub fn nof_pending_tasks(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Stop accepting new iterations of the loop and return a handle that
    /// resolves once the loop actually exits. Consumes `self`: unlike the
    /// original (which leaves the sequencer object alive but unusable),
    /// Rust ownership makes "no further scheduling after stop" a type-level
    /// guarantee instead of a documented caller obligation.
    pub fn request_stop(self) -> JoinHandle<()> {
        self.running.store(false, Ordering::Release);
        // Wake the loop if it's parked on an empty queue.
        let _ = self.queue.try_push(Box::pin(async {}));
        self.loop_handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::local::LocalExecutor;
    use crate::sync::ManualEvent;
    use std::sync::Mutex;

    #[test]
    fn tasks_complete_in_schedule_order_not_set_order() {
        let exec = Arc::new(LocalExecutor::new());
        let sequencer = Sequencer::new(exec.clone(), 4);
        let events: Vec<_> = (0..4).map(|_| Arc::new(ManualEvent::<i32>::new())).collect();
        let order = Arc::new(Mutex::new(Vec::new()));

        for event in &events {
            let event = event.clone();
            let order = order.clone();
            sequencer
                .schedule(async move {
                    let value = event.wait().await;
                    order.lock().unwrap().push(value);
                })
                .unwrap();
        }

        for (value, event) in [40, 30, 20, 10].into_iter().zip(events.iter().rev()) {
            event.set(value);
        }

        let handle = sequencer.request_stop();
        exec.block_on(handle).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn schedule_fails_once_queue_is_full() {
        // The loop task isn't driven by any `block_on` in this test, so the
        // one slot this sequencer's queue has room for stays occupied.
        let exec = Arc::new(LocalExecutor::new());
        let sequencer = Sequencer::new(exec, 1);
        sequencer.schedule(async {}).unwrap();
        assert!(matches!(sequencer.schedule(async {}), Err(QueueFull)));
    }
}
