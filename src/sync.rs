//! Awaitable event primitives: sticky broadcast flags, non-sticky
//! broadcast signals, and a bounded FIFO queue, all built on the same
//! [`waiter_list`] registry.

mod async_queue;
mod manual_event;
mod signal_event;
mod waiter_list;

pub use async_queue::{AsyncQueue, Pop};
pub use manual_event::{ManualEvent, ManualEventFlag, Wait as ManualWait, WaitValue as ManualWaitValue};
pub use signal_event::{SignalEvent, SignalEventFlag, Wait as SignalWait, WaitValue as SignalWaitValue};
