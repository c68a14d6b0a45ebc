//! Per-cell command queue and test-mode UE book-keeping.
//!
//! [`CellCommandQueue`] is the mechanism by which configuration updates
//! (add/remove test UE, toggle flags) cross from whichever thread produced
//! them (O&M, RRC) onto the cell's own executor without locking -- the
//! cell's slot handler drains it once per slot. Built on the `mpsc-queue`
//! crate, the same intrusive Vyukov-style MPSC queue already used by
//! [`crate::executor::local::LocalExecutor`]'s own deferred-work queue
//! (`crate::closure::ClosureEntry`).
//!
//! [`TestUeRepository`] is grounded on
//! `original_source/lib/du/du_high/test_mode/mac_test_mode_ue_repository.h`:
//! a flat RNTI range (`[rnti_start, rnti_start + nof_ues * nof_cells)`)
//! split evenly across `nof_cells` cells, each holding a lookup from RNTI to
//! that UE's bookkeeping. The scheduler configuration payload a test UE
//! carries (`sched_ue_config_request` in the original) is out of scope,
//! so it is carried here as an opaque generic `C` rather than reconstructed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use mpsc_queue::MpscQueue;

use crate::closure::{ClosureEntry, UniqueTask};

/// A radio network temporary identifier, scoped to the lifetime of a UE's
/// RRC connection (`rnti_t` in the original).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rnti(pub u16);

impl Rnti {
    pub fn value(self) -> u16 {
        self.0
    }
}

/// A fixed-capacity, non-blocking, multi-producer single-consumer queue of
/// closures, consumed by exactly one cell's executor (see DESIGN.md for why
/// an MPSC queue with one fixed consumer satisfies the same guarantees a
/// multi-consumer queue would here). `try_push` never blocks; at capacity it
/// fails and the producer must retry (optionally after yielding).
pub struct CellCommandQueue {
    queue: MpscQueue<ClosureEntry>,
    capacity: usize,
    len: AtomicUsize,
}

impl CellCommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: MpscQueue::new_with_stub(ClosureEntry::stub()),
            capacity,
            len: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue `f` if there is room. Never blocks; returns `false` at
    /// capacity without running `f`.
    pub fn try_push<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let reserved = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            });
        if reserved.is_err() {
            return false;
        }
        self.queue.enqueue(ClosureEntry::new(UniqueTask::new(f)));
        true
    }

    /// Run every closure currently queued, in FIFO order. Called once per
    /// slot by the cell's executor.
    pub fn drain(&self) {
        while let Some(entry) = self.queue.dequeue() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            entry.into_task().call();
        }
    }
}

struct TestUeInfo<C> {
    ue_idx: u32,
    sched_ue_cfg_req: C,
    msg4_rx_flag: bool,
}

#[derive(Default)]
struct CellInfo<C> {
    ue_info: HashMap<Rnti, TestUeInfo<C>>,
}

/// Book-keeping for test-mode UEs spread evenly across `nof_cells` cells,
/// indexed by RNTI.
pub struct TestUeRepository<C> {
    rnti_start: u16,
    rnti_end: u16,
    nof_ues: u16,
    cells: Vec<CellInfo<C>>,
}

impl<C> TestUeRepository<C> {
    pub fn new(rnti_start: Rnti, nof_ues: u16, nof_cells: u16) -> Self {
        Self {
            rnti_start: rnti_start.0,
            rnti_end: rnti_start.0 + nof_ues * nof_cells,
            nof_ues,
            cells: (0..nof_cells).map(|_| CellInfo::default()).collect(),
        }
    }

    pub fn is_test_ue_index(&self, ue_idx: u32) -> bool {
        (ue_idx as usize) < self.nof_ues as usize * self.cells.len()
    }

    pub fn is_test_ue(&self, rnti: Rnti) -> bool {
        rnti.0 >= self.rnti_start && rnti.0 < self.rnti_end
    }

    pub fn is_cell_test_ue(&self, cell_idx: usize, rnti: Rnti) -> bool {
        self.is_test_ue(rnti) && self.cell_index_of(rnti) == cell_idx
    }

    fn cell_index_of(&self, rnti: Rnti) -> usize {
        ((rnti.0 - self.rnti_start) / self.nof_ues) as usize
    }

    pub fn add_ue(&mut self, rnti: Rnti, ue_idx: u32, sched_ue_cfg_req: C) {
        let cell_idx = self.cell_index_of(rnti);
        self.cells[cell_idx].ue_info.insert(
            rnti,
            TestUeInfo { ue_idx, sched_ue_cfg_req, msg4_rx_flag: false },
        );
    }

    pub fn remove_ue(&mut self, rnti: Rnti) {
        let cell_idx = self.cell_index_of(rnti);
        self.cells[cell_idx].ue_info.remove(&rnti);
    }

    pub fn rnti_to_du_ue_index(&self, rnti: Rnti) -> Option<u32> {
        self.cells
            .get(self.cell_index_of(rnti))
            .and_then(|cell| cell.ue_info.get(&rnti))
            .map(|info| info.ue_idx)
    }

    pub fn sched_ue_cfg_request(&self, rnti: Rnti) -> Option<&C> {
        self.cells
            .get(self.cell_index_of(rnti))
            .and_then(|cell| cell.ue_info.get(&rnti))
            .map(|info| &info.sched_ue_cfg_req)
    }

    pub fn is_msg4_rxed(&self, rnti: Rnti) -> bool {
        self.cells
            .get(self.cell_index_of(rnti))
            .and_then(|cell| cell.ue_info.get(&rnti))
            .is_some_and(|info| info.msg4_rx_flag)
    }

    pub fn set_msg4_rxed(&mut self, rnti: Rnti, msg4_rx_flag: bool) {
        let cell_idx = self.cell_index_of(rnti);
        if let Some(info) = self.cells[cell_idx].ue_info.get_mut(&rnti) {
            info.msg4_rx_flag = msg4_rx_flag;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn command_queue_runs_pushed_closures_fifo() {
        let queue = CellCommandQueue::new(4);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            assert!(queue.try_push(move || order.lock().unwrap().push(i)));
        }
        assert_eq!(queue.len(), 3);
        queue.drain();
        assert_eq!(queue.len(), 0);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn command_queue_rejects_push_past_capacity() {
        let queue = CellCommandQueue::new(1);
        assert!(queue.try_push(|| {}));
        assert!(!queue.try_push(|| {}));
        queue.drain();
        assert!(queue.try_push(|| {}));
    }

    #[test]
    fn repository_routes_rnti_to_its_cell() {
        let mut repo = TestUeRepository::<u32>::new(Rnti(100), 4, 2);
        // Cell 0: RNTIs 100..104, cell 1: 104..108.
        assert!(repo.is_test_ue(Rnti(100)));
        assert!(repo.is_test_ue(Rnti(107)));
        assert!(!repo.is_test_ue(Rnti(108)));
        assert!(repo.is_cell_test_ue(0, Rnti(101)));
        assert!(repo.is_cell_test_ue(1, Rnti(105)));
        assert!(!repo.is_cell_test_ue(0, Rnti(105)));
    }

    #[test]
    fn add_remove_and_query_ue() {
        let mut repo = TestUeRepository::<u32>::new(Rnti(100), 4, 1);
        repo.add_ue(Rnti(101), 7, 42);
        assert_eq!(repo.rnti_to_du_ue_index(Rnti(101)), Some(7));
        assert_eq!(repo.sched_ue_cfg_request(Rnti(101)), Some(&42));
        assert!(!repo.is_msg4_rxed(Rnti(101)));
        repo.set_msg4_rxed(Rnti(101), true);
        assert!(repo.is_msg4_rxed(Rnti(101)));
        repo.remove_ue(Rnti(101));
        assert_eq!(repo.rnti_to_du_ue_index(Rnti(101)), None);
    }

    #[test]
    fn concurrent_producers_push_into_one_cell_queue() {
        use std::thread;
        let queue = Arc::new(CellCommandQueue::new(64));
        let ran = Arc::new(AtomicU32::new(0));
        thread::scope(|scope| {
            for _ in 0..8 {
                let queue = queue.clone();
                let ran = ran.clone();
                scope.spawn(move || {
                    for _ in 0..8 {
                        let ran = ran.clone();
                        while !queue.try_push(move || {
                            ran.fetch_add(1, Ordering::SeqCst);
                        }) {
                            thread::yield_now();
                        }
                    }
                });
            }
        });
        queue.drain();
        assert_eq!(ran.load(Ordering::SeqCst), 64);
    }
}
