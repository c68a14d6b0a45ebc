//! Task executor interface and executor-switch awaitables.
//!
//! The contract is deliberately minimal: `execute` may run a closure inline
//! when doing so is safe, `defer` must not. Both return `false` on
//! back-pressure; [`ExecuteOn`]/[`DeferTo`] retry with a bounded attempt
//! count rather than stalling forever. This crate does not supply a
//! multi-threaded, work-stealing executor -- only the trait and a
//! single-threaded reference implementation used by its own tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::closure::UniqueFn;

pub mod local;

/// Dispatches unit-of-work closures onto a thread.
///
/// Grounded on a `try_spawn`/dispatch executor contract, trimmed to the two
/// methods this crate actually needs.
pub trait Executor: Send + Sync {
    /// Attempt to run `task`, possibly inline on the calling thread if that
    /// is safe for this executor. Returns `false` if the executor's queue
    /// is full and the closure was not accepted.
    fn execute(&self, task: UniqueFn) -> bool;

    /// Enqueue `task` for later execution. Must never run inline. Returns
    /// `false` if the executor's queue is full.
    fn defer(&self, task: UniqueFn) -> bool;
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, task: UniqueFn) -> bool {
        (**self).execute(task)
    }
    fn defer(&self, task: UniqueFn) -> bool {
        (**self).defer(task)
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: UniqueFn) -> bool {
        (**self).execute(task)
    }
    fn defer(&self, task: UniqueFn) -> bool {
        (**self).defer(task)
    }
}

/// Awaitable that hops onto `exec`, running inline if possible.
///
/// `execute_on(exec).await` suspends the calling task, asks `exec` to
/// resume it (inline if `exec.execute` allows), and resumes with no value.
pub fn execute_on<E: Executor>(exec: E) -> ExecuteOn<E> {
    ExecuteOn { exec, dispatched: false, attempts: 0 }
}

/// Awaitable that hops onto `exec` via `defer`, guaranteeing the
/// continuation never runs inline on the calling stack.
pub fn defer_to<E: Executor>(exec: E) -> DeferTo<E> {
    DeferTo { exec, dispatched: false, attempts: 0 }
}

/// Bound on back-pressure retries inside [`ExecuteOn`]/[`DeferTo`] and
/// [`execute_with_retry`] -- `await_resume` is void here, so there is no
/// result channel to fail upward through; a dispatcher that still can't make
/// room after this many attempts indicates a stuck executor, which is a
/// programming error, not a recoverable condition.
pub(crate) const MAX_DISPATCH_ATTEMPTS: u32 = 1024;

/// Call `exec.execute(build())` until it succeeds or back-pressure persists
/// for [`MAX_DISPATCH_ATTEMPTS`] attempts in a row. `build` is invoked once
/// per attempt since a rejected [`UniqueFn`] is consumed, not handed back.
///
/// For callers that aren't themselves a polled [`Future`] (and so can't
/// spread retries across polls the way [`ExecuteOn`]/[`DeferTo`] do), this is
/// the synchronous equivalent of their back-pressure handling.
pub(crate) fn execute_with_retry<E: Executor + ?Sized>(exec: &E, mut build: impl FnMut() -> UniqueFn) {
    for _ in 0..MAX_DISPATCH_ATTEMPTS {
        if exec.execute(build()) {
            return;
        }
    }
    panic!("execute_with_retry: executor refused dispatch {MAX_DISPATCH_ATTEMPTS} times in a row");
}

pub struct ExecuteOn<E> {
    exec: E,
    dispatched: bool,
    attempts: u32,
}

impl<E: Executor> Future for ExecuteOn<E> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.dispatched {
            return Poll::Ready(());
        }
        let waker = cx.waker().clone();
        if this.exec.execute(UniqueFn::new(move || waker.wake())) {
            this.dispatched = true;
            Poll::Pending
        } else {
            this.attempts += 1;
            assert!(
                this.attempts <= MAX_DISPATCH_ATTEMPTS,
                "execute_on: executor refused dispatch {MAX_DISPATCH_ATTEMPTS} times in a row"
            );
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

pub struct DeferTo<E> {
    exec: E,
    dispatched: bool,
    attempts: u32,
}

impl<E: Executor> Future for DeferTo<E> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.dispatched {
            return Poll::Ready(());
        }
        let waker = cx.waker().clone();
        if this.exec.defer(UniqueFn::new(move || waker.wake())) {
            this.dispatched = true;
            Poll::Pending
        } else {
            this.attempts += 1;
            assert!(
                this.attempts <= MAX_DISPATCH_ATTEMPTS,
                "defer_to: executor refused dispatch {MAX_DISPATCH_ATTEMPTS} times in a row"
            );
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Runs `callable` on `offload`, then hops back onto `back` with the result.
///
/// Grounded on `offload_to_executor(off, back, callable)` in the original.
pub async fn offload_to_executor<Off, Back, F, T>(offload: Off, back: Back, callable: F) -> T
where
    Off: Executor,
    Back: Executor,
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    execute_on(offload).await;
    let result = callable();
    execute_on(back).await;
    result
}

/// `await execute_on(off); run body; await execute_on(back);` as a single
/// convenience task.
pub async fn dispatch_and_resume_on<Off, Back, F, Fut, T>(offload: Off, back: Back, body: F) -> T
where
    Off: Executor,
    Back: Executor,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    execute_on(offload).await;
    let result = body().await;
    execute_on(back).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::local::LocalExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn execute_on_hops_and_resumes() {
        let exec = Arc::new(LocalExecutor::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let exec2 = exec.clone();
        exec.block_on(async move {
            execute_on(&*exec2).await;
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
