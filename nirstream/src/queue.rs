//! `LatestQueue<T>`: a bounded, lock-free, single-producer/single-consumer
//! "latest wins" cell (spec §4.1, C1).
//!
//! Unlike a conventional SPSC ring buffer (compare `glommio`'s
//! `channels::spsc_queue`, which this module borrows its cache-line-padded,
//! atomic-slot idiom from), a full `LatestQueue` does not block or reject the
//! producer: `push` always succeeds by overwriting the oldest slot. The
//! "queue" is really a small ring of timestamped cells, walked by a
//! persistent read cursor, so a slow consumer still observes monotonically
//! fresher data without the producer ever stalling on it.
//!
//! Staleness is a second, orthogonal rule, matching `TQueue<T>::pop` in
//! `examples/original_source/NIRCamera/TQueue.cpp`: `pop` reads the cell at
//! the read cursor via atomic exchange-with-empty; if present but its
//! timestamp falls outside `global_timestamp - tolerance`, the cell is
//! destroyed and the cursor advances to the next cell, repeating until an
//! acceptable cell is found or the ring runs dry. `tolerance` defaults to
//! `0`: only the single newest cell ever pushed is acceptable.

use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Avoids false sharing between the producer-owned head and the
/// consumer-owned tail, the same rationale `glommio::channels::spsc_queue`
/// gives for its `ProducerCacheline`/`ConsumerCacheline` split.
#[repr(align(64))]
struct CachePadded<T>(T);

struct Cell<T> {
    value: T,
    timestamp: i64,
}

/// `LatestQueue<T>` is SPSC by contract (one producer thread calls `push`,
/// one consumer thread calls `pop`) but is `Sync` so it can be shared via
/// `Arc` the way the source shares one `TQueue` per worker.
pub struct LatestQueue<T> {
    cells: Box<[AtomicPtr<Cell<T>>]>,
    capacity: usize,
    write_head: CachePadded<AtomicUsize>,
    read_head: CachePadded<AtomicUsize>,
    /// Monotonic counter owned by the queue itself, incremented once per
    /// `push` (`TQueue::push`'s `global_timeStamp++`). Callers never supply
    /// a timestamp; the queue is the sole source of "now".
    global_timestamp: AtomicI64,
    tolerance: AtomicI64,
    /// Guards the destructor callback: `delete_fun` in the source is a bare
    /// function pointer invoked outside any lock, which is sound there only
    /// because the caller guarantees SPSC discipline. We additionally route
    /// swapped-out cells through this to keep `Drop` straightforward.
    destructor: Mutex<Box<dyn FnMut(T) + Send>>,
}

// SAFETY: cells are only ever accessed through atomic swap/load, and the
// destructor is behind a `Mutex`. `T: Send` is required because a value may
// cross from the producer thread to the consumer thread (or to the `Drop`
// thread) through the atomic pointer.
unsafe impl<T: Send> Send for LatestQueue<T> {}
unsafe impl<T: Send> Sync for LatestQueue<T> {}

impl<T> LatestQueue<T> {
    /// `capacity` mirrors `TQueue`'s ring size (spec default: 1). `destructor`
    /// is run on any value that is overwritten by `push`, skipped over as
    /// stale by `pop`, or dropped with the queue, taking the place of the
    /// source's `delete_fun` pointer.
    pub fn new(capacity: usize, destructor: impl FnMut(T) + Send + 'static) -> Self {
        let capacity = capacity.max(1);
        let cells = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        LatestQueue {
            cells,
            capacity,
            write_head: CachePadded(AtomicUsize::new(0)),
            read_head: CachePadded(AtomicUsize::new(0)),
            global_timestamp: AtomicI64::new(0),
            tolerance: AtomicI64::new(0),
            destructor: Mutex::new(Box::new(destructor)),
        }
    }

    /// Publishes `value`, stamping it with the queue's own incremented
    /// timestamp counter (`TQueue::push`'s `global_timeStamp++`). Always
    /// succeeds, overwriting the oldest ring slot when the ring is full.
    pub fn push(&self, value: T) {
        let timestamp = self.global_timestamp.fetch_add(1, Ordering::AcqRel) + 1;

        let slot = self.write_head.0.fetch_add(1, Ordering::AcqRel) % self.capacity;
        let new_cell = Box::into_raw(Box::new(Cell { value, timestamp }));
        let old = self.cells[slot].swap(new_cell, Ordering::AcqRel);
        self.drop_cell(old);
    }

    /// Walks the read cursor forward from where the last `pop` left off,
    /// destroying and skipping every stale cell it passes, until it finds an
    /// acceptable cell or the ring runs dry (`sentinel()`), matching
    /// `TQueue::pop`'s `while(true)` loop.
    pub fn pop(&self, sentinel: impl FnOnce() -> T) -> T {
        loop {
            let idx = self.read_head.0.load(Ordering::Relaxed) % self.capacity;
            let taken = self.cells[idx].swap(ptr::null_mut(), Ordering::AcqRel);
            if taken.is_null() {
                log::trace!("latest_queue pop: slot {idx} empty");
                return sentinel();
            }
            // SAFETY: `taken` was installed by `push` via `Box::into_raw` and
            // has just been uniquely removed from `cells`.
            let cell = unsafe { Box::from_raw(taken) };

            let now = self.global_timestamp.load(Ordering::Acquire);
            let tolerance = self.tolerance.load(Ordering::Acquire);
            // Mirrors `TQueue::pop`: while the global counter itself hasn't
            // yet reached `tolerance`, every cell ever pushed is acceptable.
            if now < tolerance || cell.timestamp >= now.saturating_sub(tolerance) {
                self.read_head.0.fetch_add(1, Ordering::Relaxed);
                return cell.value;
            }

            log::trace!(
                "latest_queue pop: cell at slot {idx} stale (ts={}, now={now}, tolerance={tolerance})",
                cell.timestamp
            );
            if let Ok(mut destructor) = self.destructor.lock() {
                destructor(cell.value);
            }
            self.read_head.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Maximum age, in the queue's own timestamp units, before a cell is
    /// treated as stale. Defaults to `0`: only the single newest cell pushed
    /// is ever acceptable.
    pub fn set_tolerance(&self, tolerance: i64) {
        self.tolerance.store(tolerance, Ordering::Release);
    }

    pub fn get_tolerance(&self) -> i64 {
        self.tolerance.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn drop_cell(&self, ptr: *mut Cell<T>) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: `ptr` was swapped out of `cells` and is therefore no
        // longer reachable from any other `push`/`pop`.
        let cell = unsafe { Box::from_raw(ptr) };
        if let Ok(mut destructor) = self.destructor.lock() {
            destructor(cell.value);
        }
    }
}

impl<T> Drop for LatestQueue<T> {
    fn drop(&mut self) {
        for cell in self.cells.iter() {
            let ptr = cell.swap(ptr::null_mut(), Ordering::AcqRel);
            self.drop_cell(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn pop_on_empty_queue_returns_sentinel() {
        let q: LatestQueue<u32> = LatestQueue::new(1, |_| {});
        assert_eq!(q.pop(|| 0xDEAD), 0xDEAD);
    }

    #[test]
    fn pop_returns_pushes_in_order_within_tolerance() {
        let q: LatestQueue<u32> = LatestQueue::new(4, |_| {});
        q.set_tolerance(i64::MAX);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(|| 0), 1);
        assert_eq!(q.pop(|| 0), 2);
        assert_eq!(q.pop(|| 0), 3);
    }

    #[test]
    fn default_tolerance_accepts_only_the_newest_cell() {
        let q: LatestQueue<u32> = LatestQueue::new(2, |_| {});
        q.push(1);
        q.push(2);
        // Default tolerance is 0: the first (now-stale) cell is destroyed
        // and skipped, and only the newest survives.
        assert_eq!(q.pop(|| 0), 2);
    }

    #[test]
    fn stale_cells_are_destroyed_and_skipped() {
        let dropped = Arc::new(StdAtomicUsize::new(0));
        let dropped_clone = dropped.clone();
        let q: LatestQueue<u32> = LatestQueue::new(3, move |_| {
            dropped_clone.fetch_add(1, Ordering::SeqCst);
        });
        q.push(1);
        q.push(2);
        q.push(3);
        // Default tolerance 0: pop must destroy cells 1 and 2 on its way to
        // the newest, not leave them sitting in the ring.
        assert_eq!(q.pop(|| 0), 3);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn overwritten_values_are_destructed() {
        let dropped = Arc::new(StdAtomicUsize::new(0));
        let dropped_clone = dropped.clone();
        let q: LatestQueue<u32> = LatestQueue::new(1, move |_| {
            dropped_clone.fetch_add(1, Ordering::SeqCst);
        });
        q.push(1);
        q.push(2);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        drop(q);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tolerance_round_trips() {
        let q: LatestQueue<u32> = LatestQueue::new(1, |_| {});
        q.set_tolerance(7);
        assert_eq!(q.get_tolerance(), 7);
    }

    /// Property 1 (spec §8): for all interleavings of one producer and one
    /// consumer racing against each other, every pushed payload is either
    /// destroyed by the destructor or returned by `pop`, exactly once —
    /// never both, never neither. Grounded on `glommio`'s own
    /// `channels::spsc_queue::test_threaded`.
    #[test]
    fn concurrent_producer_and_consumer_account_for_every_value() {
        const N: u32 = 5_000;
        const EMPTY: u32 = u32::MAX;

        let destroyed = Arc::new(StdAtomicUsize::new(0));
        let destroyed_clone = destroyed.clone();
        let q = Arc::new(LatestQueue::<u32>::new(8, move |_| {
            destroyed_clone.fetch_add(1, Ordering::SeqCst);
        }));
        q.set_tolerance(i64::MAX);

        let barrier = Arc::new(Barrier::new(2));
        let returned = Arc::new(StdAtomicUsize::new(0));

        let producer = {
            let q = Arc::clone(&q);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for value in 0..N {
                    q.push(value);
                }
            })
        };

        let consumer = {
            let q = Arc::clone(&q);
            let barrier = Arc::clone(&barrier);
            let returned = Arc::clone(&returned);
            thread::spawn(move || {
                barrier.wait();
                let mut last_seen: Option<u32> = None;
                loop {
                    let got = q.pop(|| EMPTY);
                    if got == EMPTY {
                        continue;
                    }
                    if let Some(last) = last_seen {
                        assert!(got > last, "pop must observe pushes in order");
                    }
                    last_seen = Some(got);
                    returned.fetch_add(1, Ordering::SeqCst);
                    if got == N - 1 {
                        break;
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();

        let accounted = destroyed.load(Ordering::SeqCst) + returned.load(Ordering::SeqCst);
        assert_eq!(accounted, N as usize, "every pushed value must be destroyed xor returned exactly once");
    }

    /// Exercises wraparound of both the write and read cursors past the
    /// ring's capacity, matching `spsc_queue::test_wrap`'s intent.
    #[test]
    fn read_cursor_wraps_past_capacity() {
        let q: LatestQueue<u32> = LatestQueue::new(2, |_| {});
        q.set_tolerance(i64::MAX);
        for round in 0..5u32 {
            q.push(round * 2);
            q.push(round * 2 + 1);
            assert_eq!(q.pop(|| u32::MAX), round * 2);
            assert_eq!(q.pop(|| u32::MAX), round * 2 + 1);
        }
    }
}
