//! `manual_event_flag`/`manual_event<T>`: a sticky, broadcast
//! notification. Once `set()`, `is_set()` stays true -- and every `wait()`
//! completes immediately -- until the next `reset()`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use spin::Mutex;

use super::waiter_list::{Token, WaiterList};

/// A sticky, dataless broadcast flag.
pub struct ManualEventFlag {
    set: AtomicBool,
    waiters: WaiterList,
}

impl Default for ManualEventFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualEventFlag {
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            waiters: WaiterList::new(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Set the event, flushing (waking) every currently registered waiter.
    /// Idempotent: setting an already-set event does nothing.
    pub fn set(&self) {
        if !self.set.swap(true, Ordering::AcqRel) {
            self.waiters.wake_all_lifo();
        }
    }

    /// Clear the event. A `wait()` that starts after this point suspends
    /// until the next `set()`.
    pub fn reset(&self) {
        self.set.store(false, Ordering::Release);
    }

    pub fn wait(&self) -> Wait<'_> {
        Wait {
            event: self,
            token: None,
        }
    }
}

/// Awaiter returned by [`ManualEventFlag::wait`].
pub struct Wait<'a> {
    event: &'a ManualEventFlag,
    token: Option<Token>,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.event.is_set() {
            return Poll::Ready(());
        }
        match self.token {
            Some(ref token) => {
                self.event.waiters.reregister(token, cx.waker());
                Poll::Pending
            }
            None => {
                let token = self.event.waiters.register(cx.waker());
                // The event may have been set between the check above and
                // registering; re-check so we never wait on an already-set
                // event (I2: is_set()==true implies an empty waiter list).
                if self.event.is_set() {
                    self.event.waiters.cancel(token);
                    return Poll::Ready(());
                }
                self.token = Some(token);
                Poll::Pending
            }
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.event.waiters.cancel(token);
        }
    }
}

/// A sticky broadcast flag carrying a value, set alongside the flag itself.
///
/// `T: Clone` because every waiter observes the same `set()`'s value.
pub struct ManualEvent<T> {
    flag: ManualEventFlag,
    data: Mutex<Option<T>>,
}

impl<T> Default for ManualEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ManualEvent<T> {
    pub const fn new() -> Self {
        Self {
            flag: ManualEventFlag::new(),
            data: Mutex::new(None),
        }
    }

    pub fn is_set(&self) -> bool {
        self.flag.is_set()
    }

    /// Store `value` and flush every current waiter with it.
    pub fn set(&self, value: T)
    where
        T: Clone,
    {
        *self.data.lock() = Some(value);
        self.flag.set();
    }

    pub fn reset(&self) {
        *self.data.lock() = None;
        self.flag.reset();
    }

    pub fn wait(&self) -> WaitValue<'_, T>
    where
        T: Clone,
    {
        WaitValue {
            inner: self.flag.wait(),
            data: &self.data,
        }
    }
}

/// Awaiter returned by [`ManualEvent::wait`].
pub struct WaitValue<'a, T> {
    inner: Wait<'a>,
    data: &'a Mutex<Option<T>>,
}

impl<T: Clone> Future for WaitValue<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Ready(()) => Poll::Ready(
                this.data
                    .lock()
                    .clone()
                    .expect("data set before flush (set() writes data before flagging)"),
            ),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::local::LocalExecutor;
    use std::sync::Arc;

    #[test]
    fn wait_returns_immediately_once_set() {
        let exec = LocalExecutor::new();
        let event = ManualEventFlag::new();
        event.set();
        exec.block_on(event.wait());
    }

    #[test]
    fn reset_clears_set_state() {
        let event = ManualEventFlag::new();
        event.set();
        assert!(event.is_set());
        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn ping_pong_resumes_on_setters_stack() {
        // A awaits `e`, B sets `e`; A's continuation runs as part of the
        // executor driving both tasks to completion with no extra polling
        // needed after `set`.
        let exec = Arc::new(LocalExecutor::new());
        let event = Arc::new(ManualEventFlag::new());
        let event2 = event.clone();
        let exec2 = exec.clone();

        let a = crate::Task::spawn_lazy(exec.clone(), {
            let event = event.clone();
            async move {
                event.wait().await;
                "a done"
            }
        });
        let b = crate::Task::spawn(exec2, async move {
            event2.set();
            "b done"
        });

        let (out_a, out_b) = exec.block_on(async { (a.await, b.await) });
        assert_eq!(out_a.unwrap(), "a done");
        assert_eq!(out_b.unwrap(), "b done");
    }

    #[test]
    fn cancel_mid_await_removes_from_waiter_list() {
        // Cancel a task suspended in `wait()`; setting the event
        // afterwards must not observe a stale waiter.
        let exec = Arc::new(LocalExecutor::new());
        let event = Arc::new(ManualEventFlag::new());
        let event2 = event.clone();
        let handle = crate::Task::spawn_lazy(exec.clone(), async move {
            event2.wait().await;
        });
        handle.cancel();
        event.set(); // must not panic / must not wake anything stale
    }

    #[test]
    fn value_event_delivers_clone_to_each_waiter() {
        let exec = Arc::new(LocalExecutor::new());
        let event = Arc::new(ManualEvent::<u32>::new());
        event.set(42);
        let (a, b) = exec.block_on(async { (event.wait().await, event.wait().await) });
        assert_eq!(a, 42);
        assert_eq!(b, 42);
    }
}
