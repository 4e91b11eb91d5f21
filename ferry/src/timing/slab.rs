//! Generational slab allocator for intrusive timer nodes.

use core::marker::PhantomData;
use core::num::NonZeroUsize;

/// Newtype for slab indices to prevent cross-slab misuse.
// Manual Copy/Clone: derive would require T: Copy, but PhantomData is just a marker.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SlabIndex<T>(u32, PhantomData<fn() -> T>);

impl<T> Copy for SlabIndex<T> {}

impl<T> Clone for SlabIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> SlabIndex<T> {
    #[inline]
    const fn new(idx: u32) -> Self {
        Self(idx, PhantomData)
    }

    #[inline]
    const fn get(self) -> usize {
        self.0 as usize
    }
}

/// Timer node stored in the slab.
pub struct Node<T> {
    /// Timer payload; `Some` while scheduled, taken when fired.
    pub payload: Option<T>,
    /// Generation counter for ABA protection.
    pub generation: u32,
    /// Next node in the per-slot list.
    pub next: Option<SlabIndex<T>>,
    /// Previous node in the per-slot list (`None` for the head).
    pub prev: Option<SlabIndex<T>>,
    /// Absolute deadline in wheel ticks.
    pub deadline: u64,
}

enum Entry<T> {
    Occupied(Node<T>),
    Free {
        next: Option<SlabIndex<T>>,
        generation: u32,
    },
}

/// Fixed-capacity slab with an intrusive free list.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<SlabIndex<T>>,
    len: usize,
}

impl<T> Slab<T> {
    /// Creates a slab with `cap` free slots.
    ///
    /// # Panics
    ///
    /// Panics if `cap` exceeds `u32::MAX`.
    #[must_use]
    pub fn with_capacity(cap: NonZeroUsize) -> Self {
        let capacity = cap.get();
        assert!(
            u32::try_from(capacity).is_ok(),
            "slab capacity must fit in u32"
        );
        let entries = (0..capacity)
            .map(|i| Entry::Free {
                #[allow(clippy::cast_possible_truncation)]
                next: (i + 1 < capacity).then(|| SlabIndex::new((i + 1) as u32)),
                generation: 0,
            })
            .collect();
        Self {
            entries,
            free_head: Some(SlabIndex::new(0)),
            len: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Allocates a node; `None` when the slab is full.
    pub fn alloc(&mut self, payload: T, deadline: u64) -> Option<(SlabIndex<T>, &mut Node<T>)> {
        let head = self.free_head?;
        let (next_free, generation) = match &self.entries[head.get()] {
            Entry::Free { next, generation } => (*next, *generation),
            Entry::Occupied(_) => unreachable!("free_head must point to a free slot"),
        };
        self.free_head = next_free;
        self.len += 1;

        self.entries[head.get()] = Entry::Occupied(Node {
            payload: Some(payload),
            generation,
            next: None,
            prev: None,
            deadline,
        });

        match &mut self.entries[head.get()] {
            Entry::Occupied(node) => Some((head, node)),
            Entry::Free { .. } => None,
        }
    }

    /// Frees a node, bumping its generation so stale handles stop matching.
    pub fn free(&mut self, idx: SlabIndex<T>) -> Option<Node<T>> {
        let generation = match &self.entries[idx.get()] {
            Entry::Occupied(n) => n.generation,
            Entry::Free { .. } => return None,
        };
        let old = core::mem::replace(
            &mut self.entries[idx.get()],
            Entry::Free {
                next: self.free_head,
                generation: generation.wrapping_add(1),
            },
        );
        self.free_head = Some(idx);
        self.len -= 1;
        match old {
            Entry::Occupied(node) => Some(node),
            Entry::Free { .. } => None,
        }
    }

    #[must_use]
    pub fn get(&self, idx: SlabIndex<T>) -> Option<&Node<T>> {
        match &self.entries[idx.get()] {
            Entry::Occupied(n) => Some(n),
            Entry::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, idx: SlabIndex<T>) -> Option<&mut Node<T>> {
        match &mut self.entries[idx.get()] {
            Entry::Occupied(n) => Some(n),
            Entry::Free { .. } => None,
        }
    }
}
