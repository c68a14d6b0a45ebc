//! Shared waiter registry backing `manual_event`/`signal_event`/`async_queue`.
//! The original uses an intrusive pointer list so a suspended frame costs no
//! allocation; here the list is a plain `Mutex`-guarded slot vector instead;
//! every bit of cancellation-safety still holds (an entry is always either a
//! live waker or `None`) but it comes from ordinary `Drop`, not from a
//! hand-rolled unlink routine.

use std::task::Waker;

use spin::Mutex;

/// A registered-but-not-yet-woken waiter's slot, handed back by
/// [`WaiterList::register`] so the caller can later [`cancel`](WaiterList::cancel)
/// it on drop.
pub(crate) struct Token(usize);

#[derive(Default)]
pub(crate) struct WaiterList {
    waiters: Mutex<Vec<Option<Waker>>>,
}

impl WaiterList {
    pub(crate) const fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Register `waker`, reusing the first free slot if one exists.
    pub(crate) fn register(&self, waker: &Waker) -> Token {
        let mut waiters = self.waiters.lock();
        if let Some(idx) = waiters.iter().position(Option::is_none) {
            waiters[idx] = Some(waker.clone());
            Token(idx)
        } else {
            waiters.push(Some(waker.clone()));
            Token(waiters.len() - 1)
        }
    }

    /// Replace the waker for an already-registered slot if it would wake a
    /// different task (repeated polls of a still-`Pending` awaiter).
    pub(crate) fn reregister(&self, token: &Token, waker: &Waker) {
        let mut waiters = self.waiters.lock();
        if let Some(slot) = waiters.get_mut(token.0) {
            match slot {
                Some(existing) if existing.will_wake(waker) => {}
                _ => *slot = Some(waker.clone()),
            }
        }
    }

    /// Drop the registration for `token`. Safe to call even if it was
    /// already consumed by a flush (the slot is simply `None` already).
    pub(crate) fn cancel(&self, token: Token) {
        let mut waiters = self.waiters.lock();
        if let Some(slot) = waiters.get_mut(token.0) {
            *slot = None;
        }
    }

    /// Wake and clear every registered waiter, most-recently-registered
    /// first -- the source's "head-insert, head-walk" LIFO discipline.
    pub(crate) fn wake_all_lifo(&self) {
        let woken: Vec<Waker> = {
            let mut waiters = self.waiters.lock();
            waiters.drain(..).flatten().collect()
        };
        for waker in woken.into_iter().rev() {
            waker.wake();
        }
    }

    /// Wake and remove exactly the earliest-registered waiter, if any.
    /// `async_queue`'s FIFO awaiter discipline.
    pub(crate) fn wake_one_fifo(&self) -> bool {
        let woken = {
            let mut waiters = self.waiters.lock();
            let idx = waiters.iter().position(Option::is_some);
            idx.and_then(|idx| waiters[idx].take())
        };
        match woken {
            Some(waker) => {
                waker.wake();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountWake(AtomicUsize);
    impl Wake for CountWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn wake_all_lifo_wakes_every_registrant() {
        let list = WaiterList::new();
        let counters: Vec<_> = (0..5).map(|_| Arc::new(CountWake(AtomicUsize::new(0)))).collect();
        for c in &counters {
            let waker = Waker::from(c.clone());
            list.register(&waker);
        }
        list.wake_all_lifo();
        for c in &counters {
            assert_eq!(c.0.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn cancel_prevents_wake() {
        let list = WaiterList::new();
        let counter = Arc::new(CountWake(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let token = list.register(&waker);
        list.cancel(token);
        list.wake_all_lifo();
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wake_one_fifo_serves_earliest_registrant_first() {
        let list = WaiterList::new();
        let first = Arc::new(CountWake(AtomicUsize::new(0)));
        let second = Arc::new(CountWake(AtomicUsize::new(0)));
        list.register(&Waker::from(first.clone()));
        list.register(&Waker::from(second.clone()));
        assert!(list.wake_one_fifo());
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);
        assert!(list.wake_one_fifo());
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
        assert!(!list.wake_one_fifo());
    }
}
