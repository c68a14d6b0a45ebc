//! Resumable task frame and coroutine handle.
//!
//! The original is a hand-rolled frame: a state index, an in-frame awaiter
//! buffer, a promise slot, and three virtuals (`resume`/`destroy`/
//! `on_return`). Native `async`/`.await` already compiles to exactly that
//! state machine, so this module wraps an arbitrary [`Future`] in a heap
//! cell and type-erases it behind [`JoinInner`] instead of hand-writing the
//! switch-on-label dispatch.

mod id;

pub use id::Id;

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::task::{Context, Poll, Wake, Waker};

use crate::executor::Executor;

/// Why a [`JoinHandle`] failed to produce the task's output.
#[derive(Debug)]
pub enum JoinError {
    /// The task was [`cancel`](JoinHandle::cancel)led before it completed.
    Cancelled,
    /// The task's body panicked while being polled.
    Panicked,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => f.write_str("task was cancelled"),
            JoinError::Panicked => f.write_str("task panicked"),
        }
    }
}

impl std::error::Error for JoinError {}

/// The body's current lifecycle stage, mirroring the original frame's
/// `state_index` + promise slot.
enum Stage<F: Future> {
    /// Not yet started (lazy tasks only begin here).
    NotStarted(Pin<Box<F>>),
    /// Currently suspended mid-body.
    Pending(Pin<Box<F>>),
    /// Completed; output not yet taken by a `JoinHandle`.
    Ready(F::Output),
    /// `destroy()`'d while suspended: the body (and every local/awaiter it
    /// held) has already been dropped, giving cancellation-safety for free.
    Cancelled,
    /// The body panicked while being polled.
    Panicked,
    /// Output already taken, or the cancelled/panicked state already
    /// observed once.
    Consumed,
}

/// Type-erased join side of a spawned task, analogous to a `Header`/`VTable`
/// split but realised as a safe trait object.
trait JoinInner<T>: Send + Sync {
    fn poll_join(&self, cx: &mut Context<'_>) -> Poll<Result<T, JoinError>>;
    fn cancel(&self);
    fn is_finished(&self) -> bool;
}

struct TaskCell<F, E>
where
    F: Future,
{
    id: Id,
    exec: E,
    stage: Mutex<Stage<F>>,
    join_waker: Mutex<Option<Waker>>,
    complete: AtomicBool,
    /// Set once, immediately after construction, so `&self` methods can
    /// obtain an owning `Arc` (needed to build a `Waker`) without the public
    /// API having to thread `Arc<Self>` receivers through a dyn trait.
    self_ref: OnceLock<Weak<TaskCell<F, E>>>,
}

impl<F, E> TaskCell<F, E>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    E: Executor + Clone + Send + Sync + 'static,
{
    fn arc(&self) -> Arc<Self> {
        self.self_ref
            .get()
            .expect("self_ref set right after construction")
            .upgrade()
            .expect("task cell dropped while still running")
    }

    /// Poll the body once, advancing `stage` and waking the join side if it
    /// just completed. This is `resume()` in spec terms.
    fn run_step(&self) {
        let waker = Waker::from(self.arc());
        let mut cx = Context::from_waker(&waker);

        let mut guard = self.stage.lock().unwrap();
        let mut future = match std::mem::replace(&mut *guard, Stage::Consumed) {
            Stage::NotStarted(f) | Stage::Pending(f) => f,
            other @ (Stage::Ready(_) | Stage::Cancelled | Stage::Panicked | Stage::Consumed) => {
                *guard = other;
                return;
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        match result {
            Ok(Poll::Pending) => *guard = Stage::Pending(future),
            Ok(Poll::Ready(output)) => {
                *guard = Stage::Ready(output);
                drop(guard);
                self.complete.store(true, Ordering::Release);
                self.wake_join();
            }
            Err(_) => {
                *guard = Stage::Panicked;
                drop(guard);
                self.complete.store(true, Ordering::Release);
                self.wake_join();
            }
        }
    }

    fn wake_join(&self) {
        if let Some(waker) = self.join_waker.lock().unwrap().take() {
            waker.wake();
        }
    }

    fn schedule(&self) {
        let this = self.arc();
        crate::executor::execute_with_retry(&self.exec, move || {
            let this = this.clone();
            crate::closure::UniqueFn::new(move || this.run_step())
        });
    }
}

impl<F, E> Wake for TaskCell<F, E>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    E: Executor + Clone + Send + Sync + 'static,
{
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

impl<F, E> JoinInner<F::Output> for TaskCell<F, E>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    E: Executor + Clone + Send + Sync + 'static,
{
    fn poll_join(&self, cx: &mut Context<'_>) -> Poll<Result<F::Output, JoinError>> {
        if matches!(*self.stage.lock().unwrap(), Stage::NotStarted(_)) {
            // Lazy task: the first join/poll is what starts it.
            self.run_step();
        }

        let mut guard = self.stage.lock().unwrap();
        match std::mem::replace(&mut *guard, Stage::Consumed) {
            Stage::Ready(output) => Poll::Ready(Ok(output)),
            Stage::Cancelled => Poll::Ready(Err(JoinError::Cancelled)),
            Stage::Panicked => Poll::Ready(Err(JoinError::Panicked)),
            Stage::Consumed => panic!("JoinHandle polled after completion"),
            pending @ (Stage::NotStarted(_) | Stage::Pending(_)) => {
                *guard = pending;
                drop(guard);
                *self.join_waker.lock().unwrap() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn cancel(&self) {
        let mut guard = self.stage.lock().unwrap();
        if matches!(*guard, Stage::NotStarted(_) | Stage::Pending(_)) {
            // Dropping the boxed future here walks every in-scope local's
            // `Drop` and every registered awaiter's `PinnedDrop`, unlinking
            // it from whatever waiter list it sat on.
            *guard = Stage::Cancelled;
            drop(guard);
            self.complete.store(true, Ordering::Release);
            self.wake_join();
        }
    }

    fn is_finished(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

fn new_cell<F, E>(exec: E, future: F) -> Arc<TaskCell<F, E>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    E: Executor + Clone + Send + Sync + 'static,
{
    let cell = Arc::new(TaskCell {
        id: Id::next(),
        exec,
        stage: Mutex::new(Stage::NotStarted(Box::pin(future))),
        join_waker: Mutex::new(None),
        complete: AtomicBool::new(false),
        self_ref: OnceLock::new(),
    });
    cell.self_ref
        .set(Arc::downgrade(&cell))
        .unwrap_or_else(|_| unreachable!("self_ref set exactly once"));
    cell
}

/// Namespace for spawning [`Future`]s onto an [`Executor`], eagerly or
/// lazily.
pub struct Task;

impl Task {
    /// Spawn `future` eagerly: it is polled once immediately (on the
    /// calling thread), matching `async_task<R>`'s `suspend_never` initial
    /// suspend.
    #[track_caller]
    pub fn spawn<E, F>(exec: E, future: F) -> JoinHandle<F::Output>
    where
        E: Executor + Clone + Send + Sync + 'static,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let cell = new_cell(exec, future);
        cell.run_step();
        JoinHandle {
            id: cell.id,
            inner: cell,
        }
    }

    /// Spawn `future` lazily: nothing runs until the first `.await`/poll of
    /// the returned [`JoinHandle`], matching `lazy_task<R>`'s
    /// `suspend_always` initial suspend.
    pub fn spawn_lazy<E, F>(exec: E, future: F) -> JoinHandle<F::Output>
    where
        E: Executor + Clone + Send + Sync + 'static,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let cell = new_cell(exec, future);
        JoinHandle {
            id: cell.id,
            inner: cell,
        }
    }
}

/// A handle to a spawned task's eventual output.
///
/// Polling (or `.await`ing) a `JoinHandle` for a task spawned with
/// [`Task::spawn_lazy`] triggers that task's first `resume()` if it hasn't
/// started yet.
pub struct JoinHandle<T> {
    id: Id,
    inner: Arc<dyn JoinInner<T>>,
}

impl<T> JoinHandle<T> {
    /// The spawned task's id.
    pub fn id(&self) -> Id {
        self.id
    }

    /// `true` once the task has completed, been cancelled, or panicked.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Cancel the task if it hasn't completed yet. Cancelling an
    /// already-completed task is a no-op.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl<T: Send + 'static> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_join(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::local::LocalExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn eager_task_runs_before_join() {
        let exec = Arc::new(LocalExecutor::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let handle = Task::spawn(exec.clone(), async move {
            ran2.fetch_add(1, Ordering::SeqCst);
            7
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let out = exec.block_on(handle);
        assert_eq!(out.unwrap(), 7);
    }

    #[test]
    fn lazy_task_defers_until_joined() {
        let exec = Arc::new(LocalExecutor::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let handle = Task::spawn_lazy(exec.clone(), async move {
            ran2.fetch_add(1, Ordering::SeqCst);
            3
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let out = exec.block_on(handle);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(out.unwrap(), 3);
    }

    #[test]
    fn cancel_before_completion_reports_cancelled() {
        let exec = Arc::new(LocalExecutor::new());
        let handle = Task::spawn_lazy(exec.clone(), async move {
            std::future::pending::<()>().await;
        });
        handle.cancel();
        assert!(handle.is_finished());
        let out = exec.block_on(handle);
        assert!(matches!(out, Err(JoinError::Cancelled)));
    }
}
