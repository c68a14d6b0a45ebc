//! Small-buffer-optimised move-only closure.
//!
//! Grounded on `unique_function<R(Args...), Capacity, ForbidAlloc>` from the
//! original source: a functor that fits in `CAP` bytes is stored inline with
//! no heap traffic; a larger one spills to the heap. Dispatch goes through a
//! per-functor-type operation table with three entries (`call`, `move`,
//! `drop`), exactly like the original's `oper_table_t`.

use std::mem::{self, MaybeUninit};
use std::ptr;

/// Default inline capacity, matching `default_unique_task_buffer_size` in
/// the original (a generic moveable task of `void()` signature).
pub const DEFAULT_CAPACITY: usize = 64;

/// Operation table for the functor currently stored in a [`UniqueFn`].
///
/// One static instance exists per concrete functor type `F`, exactly as the
/// original's `smallbuffer_table_t<FunT,...>`/`heap_table_t<FunT,...>` are
/// one-per-`FunT` static singletons.
struct VTable<const CAP: usize> {
    /// Invoke the stored functor. `src` points at the `CAP`-byte inline
    /// buffer (small-buffer case) or at the inline buffer holding a `*mut
    /// F` (heap case).
    call: unsafe fn(src: *mut MaybeUninit<u8>),
    /// Move the functor out of `src` into `dest`, leaving `src` logically
    /// empty (the destination buffer takes over moving/dropping duty).
    mov: unsafe fn(src: *mut MaybeUninit<u8>, dest: *mut MaybeUninit<u8>),
    /// Drop the functor stored at `src` without invoking it.
    drop: unsafe fn(src: *mut MaybeUninit<u8>),
    in_small_buffer: bool,
}

unsafe fn empty_call<const CAP: usize>(_src: *mut MaybeUninit<u8>) {
    panic!("bad closure call: UniqueFn is empty");
}
unsafe fn empty_move<const CAP: usize>(_src: *mut MaybeUninit<u8>, _dest: *mut MaybeUninit<u8>) {}
unsafe fn empty_drop<const CAP: usize>(_src: *mut MaybeUninit<u8>) {}

fn empty_vtable<const CAP: usize>() -> &'static VTable<CAP> {
    // One instance per `CAP`, via a generic static promoted to `'static`.
    &VTable {
        call: empty_call::<CAP>,
        mov: empty_move::<CAP>,
        drop: empty_drop::<CAP>,
        in_small_buffer: true,
    }
}

unsafe fn small_call<F: FnOnce(), const CAP: usize>(src: *mut MaybeUninit<u8>) {
    // Safety: `src` holds a valid, live `F` for exactly this call; we take
    // it by value and leave the slot logically dead afterwards (the caller
    // resets the vtable to empty right after calling).
    unsafe {
        let f = ptr::read(src.cast::<F>());
        f();
    }
}

unsafe fn small_move<F, const CAP: usize>(src: *mut MaybeUninit<u8>, dest: *mut MaybeUninit<u8>) {
    unsafe {
        let f = ptr::read(src.cast::<F>());
        ptr::write(dest.cast::<F>(), f);
    }
}

unsafe fn small_drop<F, const CAP: usize>(src: *mut MaybeUninit<u8>) {
    unsafe {
        ptr::drop_in_place(src.cast::<F>());
    }
}

unsafe fn heap_call<F: FnOnce(), const CAP: usize>(src: *mut MaybeUninit<u8>) {
    unsafe {
        let raw = *src.cast::<*mut F>();
        let f = Box::from_raw(raw);
        f();
    }
}

unsafe fn heap_move<const CAP: usize>(src: *mut MaybeUninit<u8>, dest: *mut MaybeUninit<u8>) {
    unsafe {
        let raw = *src.cast::<*mut ()>();
        ptr::write(dest.cast::<*mut ()>(), raw);
    }
}

unsafe fn heap_drop<F, const CAP: usize>(src: *mut MaybeUninit<u8>) {
    unsafe {
        let raw = *src.cast::<*mut F>();
        drop(Box::from_raw(raw));
    }
}

/// Small-buffer-optimised, move-only, `FnOnce()` closure with `CAP` bytes of
/// inline storage.
///
/// Default-constructed (`UniqueFn::empty()`) instances call through an empty
/// vtable whose `call` panics, matching the original's "bad function call"
/// terminate-on-invoke-empty behaviour. After `let moved = std::mem::take(&mut
/// f)` (or any move), the source becomes empty.
pub struct UniqueFn<const CAP: usize = DEFAULT_CAPACITY> {
    vtable: &'static VTable<CAP>,
    buf: MaybeUninit<[u8; CAP]>,
}

// Safety: the vtable's `call`/`move`/`drop` only ever touch bytes owned by
// this `UniqueFn`; sending it across threads is sound as long as the
// wrapped functor itself is `Send`, which `UniqueFn::new` requires.
unsafe impl<const CAP: usize> Send for UniqueFn<CAP> {}

impl<const CAP: usize> UniqueFn<CAP> {
    /// An empty closure. Calling it is a fatal programming error.
    pub fn empty() -> Self {
        Self {
            vtable: empty_vtable::<CAP>(),
            buf: MaybeUninit::uninit(),
        }
    }

    /// Wrap `f`, storing it inline if it fits in `CAP` bytes, else spilling
    /// to the heap.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        if mem::size_of::<F>() <= CAP && mem::align_of::<F>() <= mem::align_of::<usize>() {
            let mut buf = MaybeUninit::<[u8; CAP]>::uninit();
            // Safety: size/align checked above.
            unsafe {
                ptr::write(buf.as_mut_ptr().cast::<F>(), f);
            }
            Self {
                vtable: small_vtable::<F, CAP>(),
                buf,
            }
        } else {
            let raw = Box::into_raw(Box::new(f));
            let mut buf = MaybeUninit::<[u8; CAP]>::uninit();
            // Safety: CAP >= size_of::<usize>() is asserted by `heap_vtable`.
            unsafe {
                ptr::write(buf.as_mut_ptr().cast::<*mut F>(), raw);
            }
            Self {
                vtable: heap_vtable::<F, CAP>(),
                buf,
            }
        }
    }

    /// True if no functor is stored.
    pub fn is_empty(&self) -> bool {
        ptr::eq(self.vtable, empty_vtable::<CAP>())
    }

    /// True if the stored functor lives in the inline buffer (always true
    /// for an empty closure, matching the original's `is_in_small_buffer`).
    pub fn is_in_small_buffer(&self) -> bool {
        self.vtable.in_small_buffer
    }

    /// Invoke the stored functor, consuming it. Panics if empty.
    pub fn call(mut self) {
        let vtable = self.vtable;
        self.vtable = empty_vtable::<CAP>();
        // Safety: `buf` holds a live functor matching `vtable` until this
        // call, and we immediately mark `self` empty so `Drop` is a no-op.
        unsafe { (vtable.call)(self.buf.as_mut_ptr().cast()) }
    }
}

impl<const CAP: usize> Default for UniqueFn<CAP> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const CAP: usize> Drop for UniqueFn<CAP> {
    fn drop(&mut self) {
        // Safety: `buf` holds whatever `vtable` describes (possibly nothing,
        // for the empty vtable whose `drop` is a no-op).
        unsafe { (self.vtable.drop)(self.buf.as_mut_ptr().cast()) }
    }
}

fn small_vtable<F: FnOnce() + Send + 'static, const CAP: usize>() -> &'static VTable<CAP> {
    &VTable {
        call: small_call::<F, CAP>,
        mov: small_move::<F, CAP>,
        drop: small_drop::<F, CAP>,
        in_small_buffer: true,
    }
}

fn heap_vtable<F: FnOnce() + Send + 'static, const CAP: usize>() -> &'static VTable<CAP> {
    // The heap path writes one `*mut F` (a `usize`-sized pointer) into `buf`
    // regardless of `F`'s own size; `CAP` must have room for it.
    static_assertions::const_assert!(CAP >= mem::size_of::<usize>());
    &VTable {
        call: heap_call::<F, CAP>,
        mov: heap_move::<CAP>,
        drop: heap_drop::<F, CAP>,
        in_small_buffer: false,
    }
}

// Move semantics: `UniqueFn` does not implement `Clone`; moving out of a
// `UniqueFn` (e.g. via `std::mem::take` or ordinary ownership transfer) is
// the idiomatic-Rust equivalent of the original's move constructor, and
// always leaves the source's storage moved-from/dropped as Rust's own move
// semantics guarantee -- there is no separate "other.is_empty() == true"
// step to implement by hand the way the C++ original needs one.

/// [`UniqueFn`] variant that rejects oversized functors at compile time
/// instead of spilling them to the heap (the original's `ForbidAlloc`
/// template parameter, realised here as a distinct type rather than a `bool`
/// generic argument).
///
/// `F::new` is only ever monomorphized for a concrete `F`, so the
/// `const_assert!` below runs once per call-site `F` and rejects the build
/// if that `F` would not have fit in the small buffer.
pub struct UniqueFnNoAlloc<const CAP: usize = DEFAULT_CAPACITY> {
    inner: UniqueFn<CAP>,
}

impl<const CAP: usize> UniqueFnNoAlloc<CAP> {
    /// An empty closure. Calling it is a fatal programming error.
    pub fn empty() -> Self {
        Self {
            inner: UniqueFn::empty(),
        }
    }

    /// Wrap `f`. Fails to compile if `f` would not fit inline -- there is no
    /// heap fallback to spill to.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        static_assertions::const_assert!(mem::size_of::<F>() <= CAP);
        Self {
            inner: UniqueFn::new(f),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Invoke the stored functor, consuming it. Panics if empty.
    pub fn call(self) {
        self.inner.call()
    }
}

impl<const CAP: usize> Default for UniqueFnNoAlloc<CAP> {
    fn default() -> Self {
        Self::empty()
    }
}

/// A unique, move-only, zero-argument task closure with the original's
/// default 64-byte inline capacity (`unique_task` in the original).
pub type UniqueTask = UniqueFn<DEFAULT_CAPACITY>;

/// Intrusive [`mpsc_queue::Linked`] node wrapping a single [`UniqueTask`].
///
/// Shared by [`crate::executor::local::LocalExecutor`] and [`crate::cell`]'s
/// per-cell command queue, both of which are plain FIFOs of deferred work.
pub(crate) struct ClosureEntry {
    links: mpsc_queue::Links<ClosureEntry>,
    task: UniqueTask,
}

impl ClosureEntry {
    pub(crate) fn new(task: UniqueTask) -> std::pin::Pin<Box<Self>> {
        Box::pin(Self {
            links: mpsc_queue::Links::new(),
            task,
        })
    }

    pub(crate) fn stub() -> std::pin::Pin<Box<Self>> {
        Box::pin(Self {
            links: mpsc_queue::Links::new_stub(),
            task: UniqueTask::empty(),
        })
    }

    /// Consume a dequeued handle and recover its closure.
    ///
    /// Takes `Pin<Box<Self>>` directly (an allowed receiver type) rather
    /// than plain `self`: once dequeued the node is no longer part of the
    /// intrusive list and solely owned through this handle, so unpinning it
    /// here is sound -- the same reasoning `into_ptr` already relies on.
    pub(crate) fn into_task(self: std::pin::Pin<Box<Self>>) -> UniqueTask {
        unsafe { std::pin::Pin::into_inner_unchecked(self) }.task
    }
}

// Safety: `links` is the queue's intrusive field; `into_ptr`/`from_ptr`
// round-trip through `Pin<Box<_>>`, exactly like the original's `Entry`.
unsafe impl mpsc_queue::Linked for ClosureEntry {
    type Handle = std::pin::Pin<Box<ClosureEntry>>;

    fn into_ptr(handle: Self::Handle) -> ptr::NonNull<Self> {
        unsafe { ptr::NonNull::from(Box::leak(std::pin::Pin::into_inner_unchecked(handle))) }
    }

    unsafe fn from_ptr(ptr: ptr::NonNull<Self>) -> Self::Handle {
        unsafe { std::pin::Pin::new_unchecked(Box::from_raw(ptr.as_ptr())) }
    }

    unsafe fn links(target: ptr::NonNull<Self>) -> ptr::NonNull<mpsc_queue::Links<Self>> {
        let links = ptr::addr_of_mut!((*target.as_ptr()).links);
        unsafe { ptr::NonNull::new_unchecked(links) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn empty_is_empty() {
        let f = UniqueFn::<32>::empty();
        assert!(f.is_empty());
        assert!(f.is_in_small_buffer());
    }

    #[test]
    #[should_panic(expected = "bad closure call")]
    fn calling_empty_is_fatal() {
        UniqueFn::<32>::empty().call();
    }

    #[test]
    fn small_closure_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let f = UniqueFn::<32>::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(f.is_in_small_buffer());
        f.call();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn oversized_closure_spills_to_heap() {
        let payload = [0u8; 128];
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let f = UniqueFn::<16>::new(move || {
            let _ = payload.len();
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!f.is_in_small_buffer());
        f.call();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_alloc_small_closure_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let f = UniqueFnNoAlloc::<32>::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!f.is_empty());
        f.call();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn move_empties_source() {
        let f = UniqueFn::<32>::new(|| {});
        let moved = f;
        assert!(!moved.is_empty());
    }
}
