//! Minimal single-threaded reference [`Executor`] used by this crate's own
//! tests. Not a scheduler: it owns exactly one OS thread (whichever
//! calls [`LocalExecutor::block_on`]) and a FIFO of deferred closures.

use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread, ThreadId};

use mpsc_queue::MpscQueue;

use crate::closure::{ClosureEntry, UniqueTask};
use crate::executor::Executor;

/// A FIFO, single-threaded [`Executor`] that runs deferred work inline the
/// next time [`block_on`](Self::block_on) polls, and eagerly if `execute` is
/// called while already running on the block_on thread.
pub struct LocalExecutor {
    queue: MpscQueue<ClosureEntry>,
    /// Thread currently inside `block_on`, if any. `execute` runs inline only
    /// when called from this thread; otherwise it falls back to `defer`.
    runner: Mutex<Option<ThreadId>>,
    /// Parked whenever `block_on`'s thread has no work and is waiting for a
    /// wake-up, set by both task wakers and `defer`/`execute`.
    parked: Mutex<Option<Thread>>,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            queue: MpscQueue::new_with_stub(ClosureEntry::stub()),
            runner: Mutex::new(None),
            parked: Mutex::new(None),
        }
    }

    fn unpark_runner(&self) {
        if let Some(thread) = self.parked.lock().unwrap().take() {
            thread.unpark();
        }
    }

    /// Drain every closure currently queued, running each to completion.
    /// Returns whether anything ran.
    fn drain(&self) -> bool {
        let mut ran = false;
        while let Some(entry) = self.queue.dequeue() {
            entry.into_task().call();
            ran = true;
        }
        ran
    }

    /// Drive `future` to completion on the calling thread, servicing any
    /// work `execute`/`defer` hands back to this executor in the meantime.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        let prev = self.runner.lock().unwrap().replace(thread::current().id());
        let waker = Waker::from(Arc::new(ThreadWake(thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut future = std::pin::pin!(future);

        let out = loop {
            self.drain();
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(out) => break out,
                Poll::Pending => {
                    // Register as parked before the final drain so a
                    // `defer`/waker fired in between still unparks us;
                    // anything that ran means we must re-poll, not sleep.
                    *self.parked.lock().unwrap() = Some(thread::current());
                    if !self.drain() {
                        thread::park();
                    }
                    self.parked.lock().unwrap().take();
                }
            }
        };

        *self.runner.lock().unwrap() = prev;
        out
    }
}

impl Executor for LocalExecutor {
    fn execute(&self, task: UniqueTask) -> bool {
        if *self.runner.lock().unwrap() == Some(thread::current().id()) {
            task.call();
            true
        } else {
            self.defer(task)
        }
    }

    fn defer(&self, task: UniqueTask) -> bool {
        self.queue.enqueue(ClosureEntry::new(task));
        self.unpark_runner();
        true
    }
}

struct ThreadWake(Thread);

impl Wake for ThreadWake {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn block_on_resolves_ready_future() {
        let exec = LocalExecutor::new();
        let value = exec.block_on(async { 1 + 1 });
        assert_eq!(value, 2);
    }

    #[test]
    fn defer_runs_before_next_poll_completes() {
        let exec = Arc::new(LocalExecutor::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let exec2 = exec.clone();
        let ran2 = ran.clone();
        exec.block_on(async move {
            crate::executor::defer_to(&*exec2).await;
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
