//! `signal_event_flag`/`signal_event<T>`: a non-sticky broadcast.
//! Unlike [`manual_event`](super::manual_event), `set()` does not leave any
//! observable trace -- a `wait()` that registers after a `set()` has already
//! flushed the waiter list simply waits for the *next* `set()`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use spin::Mutex;

use super::waiter_list::{Token, WaiterList};

/// A non-sticky, dataless broadcast signal.
#[derive(Default)]
pub struct SignalEventFlag {
    waiters: WaiterList,
}

impl SignalEventFlag {
    pub const fn new() -> Self {
        Self {
            waiters: WaiterList::new(),
        }
    }

    /// Wake every waiter currently registered. Has no effect on waiters that
    /// register after this call returns.
    pub fn set(&self) {
        self.waiters.wake_all_lifo();
    }

    pub fn wait(&self) -> Wait<'_> {
        Wait {
            event: self,
            token: None,
        }
    }
}

/// Awaiter returned by [`SignalEventFlag::wait`]. Always suspends on first
/// poll (`await_ready` is always false): there is no persistent "set"
/// state to short-circuit against.
pub struct Wait<'a> {
    event: &'a SignalEventFlag,
    token: Option<Token>,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.token {
            Some(ref token) => {
                self.event.waiters.reregister(token, cx.waker());
            }
            None => {
                self.token = Some(self.event.waiters.register(cx.waker()));
            }
        }
        Poll::Pending
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.event.waiters.cancel(token);
        }
    }
}

pub struct SignalEvent<T> {
    flag: SignalEventFlag,
    data: Mutex<Option<T>>,
}

impl<T> Default for SignalEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SignalEvent<T> {
    pub const fn new() -> Self {
        Self {
            flag: SignalEventFlag::new(),
            data: Mutex::new(None),
        }
    }

    /// Store `value` and wake every waiter currently registered.
    pub fn set(&self, value: T)
    where
        T: Clone,
    {
        *self.data.lock() = Some(value);
        self.flag.set();
    }

    pub fn wait(&self) -> WaitValue<'_, T>
    where
        T: Clone,
    {
        WaitValue {
            event: self,
            token: None,
        }
    }
}

/// Awaiter returned by [`SignalEvent::wait`]. Resolves the first time it is
/// polled *after* having registered a waker, yielding the value written by
/// whichever `set()` woke it.
///
/// This relies on the same single-threaded-per-executor, no-spurious-wake
/// assumption as the rest of this crate's cooperative model: nothing
/// but an explicit `set()` ever wakes a task suspended in `wait()`, so a
/// second poll is proof a `set()` happened, with the waiter-list mutex
/// providing the happens-before edge between the write to `data` and this
/// read.
pub struct WaitValue<'a, T> {
    event: &'a SignalEvent<T>,
    token: Option<Token>,
}

impl<T: Clone> Future for WaitValue<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match self.token.take() {
            None => {
                self.token = Some(self.event.flag.waiters.register(cx.waker()));
                Poll::Pending
            }
            Some(_) => Poll::Ready(
                self.event
                    .data
                    .lock()
                    .clone()
                    .expect("data set before the waker that resumed this poll fired"),
            ),
        }
    }
}

impl<T> Drop for WaitValue<'_, T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.event.flag.waiters.cancel(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::local::LocalExecutor;
    use std::sync::Arc;

    #[test]
    fn wait_before_set_resumes_on_set() {
        // Both sides spawn eagerly (`Task::spawn` polls once immediately),
        // so the waiter must be spawned -- and so register its waker --
        // before the setter, or its `set()` would flush an empty waiter
        // list and the wait would hang waiting for a `set()` that never
        // comes again.
        let exec = Arc::new(LocalExecutor::new());
        let event = Arc::new(SignalEventFlag::new());
        let event2 = event.clone();
        let waiter = crate::Task::spawn(exec.clone(), async move {
            event2.wait().await;
            "woken"
        });
        let setter = crate::Task::spawn(exec.clone(), {
            let event = event.clone();
            async move {
                event.set();
            }
        });
        let (out, _) = exec.block_on(async { (waiter.await, setter.await) });
        assert_eq!(out.unwrap(), "woken");
    }

    #[test]
    fn set_before_wait_is_not_sticky() {
        // A wait() that registers after set() has already flushed the
        // (empty) waiter list must wait for the *next* set(), not resolve
        // immediately -- the defining difference from `manual_event`.
        let exec = Arc::new(LocalExecutor::new());
        let event = Arc::new(SignalEventFlag::new());
        event.set();
        let handle = crate::Task::spawn(exec, {
            let event = event.clone();
            async move {
                event.wait().await;
            }
        });
        // Eager: ran once synchronously above, suspended on the fresh
        // (post-flush) waiter list rather than resolving immediately.
        assert!(!handle.is_finished());
    }

    #[test]
    fn value_signal_delivers_the_set_value() {
        // Spawn the waiter eagerly, before the setter, for the same reason
        // as `wait_before_set_resumes_on_set` above: `set()` only wakes
        // waiters already registered.
        let exec = Arc::new(LocalExecutor::new());
        let signal = Arc::new(SignalEvent::<u32>::new());
        let signal2 = signal.clone();
        let waiter = crate::Task::spawn(exec.clone(), async move { signal2.wait().await });
        let setter = crate::Task::spawn(exec.clone(), {
            let signal = signal.clone();
            async move {
                signal.set(7);
            }
        });
        let (out, _) = exec.block_on(async { (waiter.await, setter.await) });
        assert_eq!(out.unwrap(), 7);
    }
}
