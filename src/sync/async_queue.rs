//! `async_queue<T>`: a fixed-capacity FIFO channel. `try_push` never
//! blocks; `pop()` is the awaitable consumer side. A single concurrent
//! consumer is assumed -- multiple simultaneously pending `pop()`
//! calls are served FIFO but are not an expected usage pattern.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use spin::Mutex;

use super::waiter_list::{Token, WaiterList};

/// A bounded FIFO queue with an awaitable pop side.
pub struct AsyncQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    waiters: WaiterList,
}

impl<T> AsyncQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            waiters: WaiterList::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Push `value` if there is room. On success, wakes the earliest
    /// registered `pop()` awaiter, if any. Never blocks.
    pub fn try_push(&self, value: T) -> bool {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return false;
            }
            items.push_back(value);
        }
        self.waiters.wake_one_fifo();
        true
    }

    pub fn pop(&self) -> Pop<'_, T> {
        Pop {
            queue: self,
            token: None,
        }
    }
}

/// Awaiter returned by [`AsyncQueue::pop`].
pub struct Pop<'a, T> {
    queue: &'a AsyncQueue<T>,
    token: Option<Token>,
}

impl<T> Future for Pop<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let popped = self.queue.items.lock().pop_front();
        if let Some(value) = popped {
            if let Some(token) = self.token.take() {
                self.queue.waiters.cancel(token);
            }
            return Poll::Ready(value);
        }
        match self.token {
            Some(ref token) => self.queue.waiters.reregister(token, cx.waker()),
            None => self.token = Some(self.queue.waiters.register(cx.waker())),
        }
        Poll::Pending
    }
}

impl<T> Drop for Pop<'_, T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.queue.waiters.cancel(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::local::LocalExecutor;

    #[test]
    fn back_pressure_at_capacity() {
        let queue = AsyncQueue::new(2);
        assert!(queue.try_push('a'));
        assert!(queue.try_push('b'));
        assert!(!queue.try_push('c'));

        let exec = LocalExecutor::new();
        let first = exec.block_on(queue.pop());
        assert_eq!(first, 'a');
        let second = exec.block_on(queue.pop());
        assert_eq!(second, 'b');
        assert!(queue.try_push('c'));
    }

    #[test]
    fn pop_suspends_until_pushed() {
        let exec = std::sync::Arc::new(LocalExecutor::new());
        let queue = std::sync::Arc::new(AsyncQueue::<u32>::new(4));
        let queue2 = queue.clone();
        let consumer = crate::Task::spawn(exec.clone(), async move { queue2.pop().await });
        assert!(!consumer.is_finished());
        assert!(queue.try_push(99));
        let out = exec.block_on(consumer);
        assert_eq!(out.unwrap(), 99);
    }
}
