// SPDX-License-Identifier: Apache-2.0

//! Lock-free MPMC ring queue of message-buffer-cell indices, ported from
//! `original_source/include/sel4/rpc_queue.h`.
//!
//! Producers and consumers each track a `(pos, count)` pair. `pos` is the
//! slot a thread has *claimed*; `count` only advances to match `pos` once
//! the claiming thread's write (or read) has actually completed, which is
//! what makes the queue safe under multiple producers/consumers racing to
//! claim slots out of program order ("late-bind" commit). The older
//! single `head`/`tail` index design in
//! `original_source/include/sel4/sel4_vmm_rpc.h` does not have this
//! property and is deliberately not reimplemented here.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ProxyError, Result};

/// Queue capacity. Matches `RPCMSG_BUFFER_SIZE` in the original headers;
/// must stay a power of two for the modulo-by-mask indexing below.
pub const CAPACITY: usize = 32;

/// Throttling threshold: a producer about to overrun this many
/// outstanding (claimed-but-not-yet-consumed) entries backs off instead
/// of spinning freely, giving consumers a chance to drain.
const HEAD_TAIL_MAX: u32 = (CAPACITY / 4) as u32;

/// A `(pos, count)` pair packed into one `u64` so it can be updated with
/// a single compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Marker {
    pos: u32,
    count: u32,
}

impl Marker {
    fn from_raw(raw: u64) -> Self {
        Marker {
            pos: (raw & 0xffff_ffff) as u32,
            count: (raw >> 32) as u32,
        }
    }

    fn to_raw(self) -> u64 {
        (self.pos as u64) | ((self.count as u64) << 32)
    }
}

#[derive(Debug, Default)]
struct Bound {
    /// Slot a thread has reserved but may not have published yet.
    tail: AtomicU64,
    /// Slot up to which entries are known to be published.
    head: AtomicU64,
}

impl Bound {
    fn head(&self) -> Marker {
        Marker::from_raw(self.head.load(Ordering::Acquire))
    }

    fn tail(&self) -> Marker {
        Marker::from_raw(self.tail.load(Ordering::Acquire))
    }
}

/// A lock-free, fixed-capacity, multi-producer multi-consumer ring of
/// cell indices. `T` is the small payload stored per ring slot (a message
/// buffer cell index in production use, but kept generic so the queue's
/// algorithm can be unit-tested independent of the RPC message layout).
pub struct RpcQueue<T> {
    prod: Bound,
    cons: Bound,
    ring: Box<[AtomicSlot<T>]>,
}

/// One ring cell: `None` is represented as `T::default()` guarded by the
/// producer/consumer protocol, since entries are only ever read after
/// they are known-published.
struct AtomicSlot<T>(std::sync::Mutex<Option<T>>);

impl<T> Default for AtomicSlot<T> {
    fn default() -> Self {
        AtomicSlot(std::sync::Mutex::new(None))
    }
}

impl<T> RpcQueue<T> {
    pub fn new() -> Self {
        let mut ring = Vec::with_capacity(CAPACITY);
        ring.resize_with(CAPACITY, AtomicSlot::default);
        RpcQueue {
            prod: Bound::default(),
            cons: Bound::default(),
            ring: ring.into_boxed_slice(),
        }
    }

    fn index(pos: u32) -> usize {
        pos as usize & (CAPACITY - 1)
    }

    /// Claim a producer slot. Returns the ring index to write into; the
    /// caller must call [`RpcQueue::commit_produced`] with the same
    /// marker once the payload is written.
    fn acquire_prod_entry(&self) -> Result<(usize, Marker)> {
        loop {
            let tail = self.prod.tail();
            let cons_head = self.cons.head();
            let entries = CAPACITY as u32 + cons_head.pos.wrapping_sub(tail.pos);
            if entries == 0 {
                return Err(ProxyError::QueueFull);
            }

            // Throttle: avoid racing too far ahead of the consumer so a
            // burst of producers doesn't starve a slow consumer.
            if tail.pos.wrapping_sub(self.prod.head().pos) > HEAD_TAIL_MAX {
                std::thread::yield_now();
                continue;
            }

            let new = Marker {
                pos: tail.pos.wrapping_add(1),
                count: tail.count.wrapping_add(1),
            };
            if self
                .prod
                .tail
                .compare_exchange_weak(
                    tail.to_raw(),
                    new.to_raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok((Self::index(tail.pos), tail));
            }
        }
    }

    /// Publish a claimed producer slot, advancing `prod.head` only once
    /// every in-flight producer at or before this marker has committed
    /// (the late-bind rule from `rpcmsg_commit_update`).
    fn commit_produced(&self, claimed: Marker) {
        loop {
            let head = self.prod.head();
            let new_count = head.count.wrapping_add(1);
            let new = if new_count == claimed.count.wrapping_add(1) && head.pos == claimed.pos {
                Marker {
                    pos: claimed.pos.wrapping_add(1),
                    count: new_count,
                }
            } else {
                Marker {
                    pos: head.pos,
                    count: new_count,
                }
            };
            if self
                .prod
                .head
                .compare_exchange_weak(
                    head.to_raw(),
                    new.to_raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Claim a consumer slot. Returns the ring index to read from; the
    /// caller must call [`RpcQueue::commit_consumed`] with the same
    /// marker once the payload has been read out, mirroring
    /// [`RpcQueue::acquire_prod_entry`]'s claim-on-tail scheme.
    fn acquire_cons_entry(&self) -> Option<(usize, Marker)> {
        loop {
            let tail = self.cons.tail();
            let prod_head = self.prod.head();
            if tail.pos == prod_head.pos {
                return None;
            }
            let new = Marker {
                pos: tail.pos.wrapping_add(1),
                count: tail.count.wrapping_add(1),
            };
            if self
                .cons
                .tail
                .compare_exchange_weak(
                    tail.to_raw(),
                    new.to_raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some((Self::index(tail.pos), tail));
            }
        }
    }

    /// Publish a claimed consumer slot, advancing `cons.head` only once
    /// every in-flight reader at or before this marker has finished
    /// reading (the late-bind rule from `rpcmsg_commit_update`, mirroring
    /// [`RpcQueue::commit_produced`]). A producer's fullness check reads
    /// `cons.head`, so a cell is only treated as free again once its read
    /// has actually completed, not merely been claimed.
    fn commit_consumed(&self, claimed: Marker) {
        loop {
            let head = self.cons.head();
            let new_count = head.count.wrapping_add(1);
            let new = if new_count == claimed.count.wrapping_add(1) && head.pos == claimed.pos {
                Marker {
                    pos: claimed.pos.wrapping_add(1),
                    count: new_count,
                }
            } else {
                Marker {
                    pos: head.pos,
                    count: new_count,
                }
            };
            if self
                .cons
                .head
                .compare_exchange_weak(
                    head.to_raw(),
                    new.to_raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Enqueue one entry, returning `Err(ProxyError::QueueFull)` if the
    /// ring has no free slots.
    pub fn enqueue(&self, value: T) -> Result<()> {
        let (idx, marker) = self.acquire_prod_entry()?;
        *self.ring[idx].0.lock().unwrap() = Some(value);
        self.commit_produced(marker);
        Ok(())
    }

    /// Dequeue one entry, or `None` if the ring is empty.
    pub fn dequeue(&self) -> Option<T> {
        let (idx, marker) = self.acquire_cons_entry()?;
        let value = self.ring[idx].0.lock().unwrap().take();
        self.commit_consumed(marker);
        value
    }
}

impl<T> Default for RpcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn single_thread_fifo() {
        let q: RpcQueue<u32> = RpcQueue::new();
        for i in 0..CAPACITY as u32 {
            q.enqueue(i).unwrap();
        }
        assert!(matches!(q.enqueue(999), Err(ProxyError::QueueFull)));
        for i in 0..CAPACITY as u32 {
            assert_eq!(q.dequeue(), Some(i));
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn concurrent_producers_preserve_all_entries() {
        let q = Arc::new(RpcQueue::<u32>::new());
        let producers = 4;
        let per_producer = 64u32;

        std::thread::scope(|scope| {
            for p in 0..producers {
                let q = Arc::clone(&q);
                scope.spawn(move || {
                    for i in 0..per_producer {
                        loop {
                            if q.enqueue(p * per_producer + i).is_ok() {
                                break;
                            }
                            std::thread::yield_now();
                        }
                    }
                });
            }

            let mut seen = Vec::new();
            while (seen.len() as u32) < producers * per_producer {
                if let Some(v) = q.dequeue() {
                    seen.push(v);
                } else {
                    std::thread::yield_now();
                }
            }
            seen.sort_unstable();
            let expected: Vec<u32> = (0..producers * per_producer).collect();
            assert_eq!(seen, expected);
        });
    }

    #[test]
    fn concurrent_consumers_on_a_full_queue_lose_nothing() {
        // Fill the ring to capacity, then drain it with several
        // consumers racing a producer trying to refill it. This is the
        // scenario where a consumer that commits on the wrong cursor
        // (claims and frees the cell before the read actually happens)
        // would let the producer overwrite a cell mid-read: a value
        // would be silently dropped or duplicated instead of every
        // enqueued value being observed exactly once.
        let q = Arc::new(RpcQueue::<u32>::new());
        for i in 0..CAPACITY as u32 {
            q.enqueue(i).unwrap();
        }

        let total = CAPACITY as u32 * 8;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        std::thread::scope(|scope| {
            let producer_q = Arc::clone(&q);
            scope.spawn(move || {
                for i in CAPACITY as u32..total {
                    loop {
                        if producer_q.enqueue(i).is_ok() {
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
            });

            for _ in 0..4 {
                let q = Arc::clone(&q);
                let seen = Arc::clone(&seen);
                scope.spawn(move || loop {
                    match q.dequeue() {
                        Some(v) => seen.lock().unwrap().push(v),
                        None => {
                            if seen.lock().unwrap().len() as u32 >= total {
                                return;
                            }
                            std::thread::yield_now();
                        }
                    }
                });
            }
        });

        let mut seen = Arc::try_unwrap(seen).unwrap().into_inner().unwrap();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..total).collect();
        assert_eq!(seen, expected);
    }
}
