//! Bounded lock-free MPSC queue: the conductor's command inbox.
//!
//! Per-slot sequence numbers (Vyukov's bounded queue, single-consumer form):
//!
//! - a slot at position `pos` is free for writing when `seq == pos`
//! - a producer reserves `pos` with a CAS on `head`, writes, then sets `seq = pos + 1`
//! - the consumer reads when `seq == tail + 1`, then releases with `seq = tail + N`
//!
//! Producers never wait on each other beyond a failed CAS retry.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::CapacityCheck;

#[repr(align(64))]
struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

#[repr(align(64))]
struct Head(AtomicUsize);

#[repr(align(64))]
struct Tail(AtomicUsize);

struct Ring<T, const N: usize> {
    head: Head,
    tail: Tail,
    slots: Box<[Slot<T>]>,
}

// SAFETY: a slot's value is written only by the producer that won the CAS for
// its position and read only by the single consumer after observing the
// matching sequence number with Acquire ordering.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    fn new() -> Self {
        Self {
            head: Head(AtomicUsize::new(0)),
            tail: Tail(AtomicUsize::new(0)),
            slots: (0..N)
                .map(|i| Slot {
                    seq: AtomicUsize::new(i),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
                .collect(),
        }
    }

    fn push(&self, item: T) -> Result<(), T> {
        loop {
            let pos = self.head.0.load(Ordering::Relaxed);
            let slot = &self.slots[pos % N];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                if self
                    .head
                    .0
                    .compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: the CAS made this producer the only writer of `pos`,
                    // and `seq == pos` means the consumer released the slot.
                    unsafe { (*slot.value.get()).write(item) };
                    slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
            } else if diff < 0 {
                return Err(item);
            }
        }
    }

    /// # Safety
    ///
    /// Only the single consumer may call this.
    unsafe fn pop(&self) -> Option<T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.slots[tail % N];
        if slot.seq.load(Ordering::Acquire) != tail.wrapping_add(1) {
            return None;
        }

        // SAFETY: the producer published this slot (seq == tail + 1).
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.seq.store(tail.wrapping_add(N), Ordering::Release);
        self.tail.0.store(tail.wrapping_add(1), Ordering::Relaxed);
        Some(item)
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no producer or consumer is left.
        while unsafe { self.pop() }.is_some() {}
    }
}

/// Write end; clone it once per client thread.
pub struct Producer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
}

impl<T: Send, const N: usize> Clone for Producer<T, N> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Read end, owned by the conductor.
pub struct Consumer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: std::marker::PhantomData<std::cell::Cell<()>>,
}

/// Creates an inbox holding at most `N` commands.
#[must_use]
pub fn channel<T: Send, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let () = CapacityCheck::<N>::OK;
    let ring = Arc::new(Ring::new());
    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer {
            ring,
            _unsync: std::marker::PhantomData,
        },
    )
}

impl<T: Send, const N: usize> Producer<T, N> {
    /// Pushes without waiting; safe from any number of threads.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the inbox is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        self.ring.push(item)
    }
}

impl<T: Send, const N: usize> Consumer<T, N> {
    /// Pops without waiting.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: `Consumer` is neither `Clone` nor `Sync`.
        unsafe { self.ring.pop() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_producer_fifo() {
        let (tx, rx) = channel::<u32, 4>();
        for i in 0..4 {
            tx.push(i).unwrap();
        }
        assert_eq!(tx.push(4), Err(4));
        for i in 0..4 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn slots_are_reused_after_pop() {
        let (tx, rx) = channel::<u32, 2>();
        for round in 0..8 {
            tx.push(round).unwrap();
            tx.push(round + 100).unwrap();
            assert_eq!(rx.pop(), Some(round));
            assert_eq!(rx.pop(), Some(round + 100));
        }
    }

    #[test]
    fn many_producers_deliver_everything() {
        let (tx, rx) = channel::<(usize, usize), 64>();
        let producers = 4;
        let per_producer = 2_000;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..per_producer {
                        while tx.push((p, i)).is_err() {
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        let mut next = vec![0usize; producers];
        let mut received = 0;
        while received < producers * per_producer {
            if let Some((p, i)) = rx.pop() {
                assert_eq!(next[p], i, "per-producer order must hold");
                next[p] += 1;
                received += 1;
            }
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
