//! Wait-free bounded SPSC queue over a heap ring.
//!
//! The conductor pushes [`DriverMessage`](crate::driver::commands::DriverMessage)s
//! into one of these per client; the client pops them from its `poll()`.
//! Each side keeps a cached copy of the other side's index so the common case
//! touches only its own cache line.
//!
//! ```
//! use ferry::queue::spsc;
//!
//! let (tx, rx) = spsc::channel::<u64, 8>();
//! tx.push(42).unwrap();
//! assert_eq!(rx.pop(), Some(42));
//! ```

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{CapacityCheck, Timeout};

/// Producer-owned half of the ring state.
#[repr(align(64))]
struct ProducerState {
    /// Next position to write. Written by the producer, read by the consumer.
    head: AtomicUsize,
    /// Producer's last observed `tail`.
    cached_tail: UnsafeCell<usize>,
}

/// Consumer-owned half of the ring state.
#[repr(align(64))]
struct ConsumerState {
    /// Next position to read. Written by the consumer, read by the producer.
    tail: AtomicUsize,
    /// Consumer's last observed `head`.
    cached_head: UnsafeCell<usize>,
}

struct Ring<T, const N: usize> {
    producer: ProducerState,
    consumer: ConsumerState,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: slots are handed between exactly one producer and one consumer; the
// Release store of `head`/`tail` orders the slot write before the other side's
// Acquire load. The cached indices are only touched by their owning side.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    fn new() -> Self {
        Self {
            producer: ProducerState {
                head: AtomicUsize::new(0),
                cached_tail: UnsafeCell::new(0),
            },
            consumer: ConsumerState {
                tail: AtomicUsize::new(0),
                cached_head: UnsafeCell::new(0),
            },
            slots: (0..N)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
        }
    }

    /// # Safety
    ///
    /// Only the single producer may call this.
    unsafe fn push(&self, item: T) -> Result<(), T> {
        let head = self.producer.head.load(Ordering::Relaxed);
        // SAFETY: producer-exclusive field.
        let cached_tail = unsafe { &mut *self.producer.cached_tail.get() };

        if head.wrapping_sub(*cached_tail) >= N {
            *cached_tail = self.consumer.tail.load(Ordering::Acquire);
            if head.wrapping_sub(*cached_tail) >= N {
                return Err(item);
            }
        }

        // SAFETY: head - tail < N, so the consumer is not reading this slot and
        // will not until `head` is published below.
        unsafe { (*self.slots[head % N].get()).write(item) };
        self.producer
            .head
            .store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// # Safety
    ///
    /// Only the single consumer may call this.
    unsafe fn pop(&self) -> Option<T> {
        let tail = self.consumer.tail.load(Ordering::Relaxed);
        // SAFETY: consumer-exclusive field.
        let cached_head = unsafe { &mut *self.consumer.cached_head.get() };

        if *cached_head == tail {
            *cached_head = self.producer.head.load(Ordering::Acquire);
            if *cached_head == tail {
                return None;
            }
        }

        // SAFETY: tail != head, so the producer initialised this slot and will
        // not overwrite it until `tail` is published below.
        let item = unsafe { (*self.slots[tail % N].get()).assume_init_read() };
        self.consumer
            .tail
            .store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        let head = *self.producer.head.get_mut();
        let mut tail = *self.consumer.tail.get_mut();
        while tail != head {
            // SAFETY: every slot in [tail, head) holds an initialised item and
            // both halves are gone, so nobody else can observe it.
            unsafe { self.slots[tail % N].get_mut().assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end. `Send` but not `Sync`: exactly one thread pushes.
pub struct Producer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

/// Read end. `Send` but not `Sync`: exactly one thread pops.
pub struct Consumer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

/// Creates a queue holding at most `N` items.
///
/// Fails to compile if `N == 0`.
#[must_use]
pub fn channel<T: Send, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let () = CapacityCheck::<N>::OK;
    let ring = Arc::new(Ring::new());
    (
        Producer {
            ring: Arc::clone(&ring),
            _unsync: PhantomData,
        },
        Consumer {
            ring,
            _unsync: PhantomData,
        },
    )
}

impl<T: Send, const N: usize> Producer<T, N> {
    /// Pushes without waiting.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: `Producer` is not `Sync` or `Clone`, so this is the only pusher.
        unsafe { self.ring.push(item) }
    }

    /// Returns `true` once the consumer half has been dropped.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.ring) == 1
    }
}

impl<T: Send, const N: usize> Consumer<T, N> {
    /// Pops without waiting.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: `Consumer` is not `Sync` or `Clone`, so this is the only popper.
        unsafe { self.ring.pop() }
    }

    /// Spins until an item arrives or `timeout` elapses.
    #[must_use]
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = timeout.deadline();
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if let Some(dl) = deadline
                && minstant::Instant::now() > dl
            {
                return None;
            }
            std::hint::spin_loop();
        }
    }
}
