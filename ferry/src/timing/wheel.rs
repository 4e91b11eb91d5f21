//! Hashed timing wheel with O(1) schedule/cancel and bounded per-tick work.
//!
//! Single-level, power-of-two slots. Deadlines further out than one rotation
//! stay in their slot and are skipped until their tick comes round. Fired
//! timers are streamed through a callback so ticking never allocates.

use core::marker::PhantomData;
use core::num::{NonZeroU64, NonZeroUsize};

use super::slab::{Slab, SlabIndex};
use super::time::{MonoInstant, TimeUnit};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WheelError {
    #[error("timer capacity exhausted ({0} timers scheduled)")]
    Capacity(usize),
}

/// Handle returned to callers; carries the generation to detect stale use.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle<T> {
    idx: SlabIndex<T>,
    generation: u32,
}

impl<T> Copy for TimerHandle<T> {}

impl<T> Clone for TimerHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

/// Witness type for power-of-two values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowerOfTwo(usize);

impl PowerOfTwo {
    #[must_use]
    pub const fn new(val: usize) -> Option<Self> {
        if val.is_power_of_two() {
            Some(Self(val))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Wheel configuration (immutable after creation).
#[derive(Clone, Copy, Debug)]
pub struct WheelConfig {
    pub slots: PowerOfTwo,
    /// Tick granularity, in the wheel's time unit.
    pub tick: NonZeroU64,
    pub capacity: NonZeroUsize,
}

/// Hashed timing wheel.
pub struct Wheel<T, U: TimeUnit> {
    slots: Vec<Option<SlabIndex<T>>>,
    slab: Slab<T>,
    mask: u64,
    tick: u64,
    cursor: u64,
    _unit: PhantomData<U>,
}

impl<T, U: TimeUnit> Wheel<T, U> {
    /// Creates a wheel whose cursor starts at `start`.
    #[must_use]
    pub fn new(cfg: WheelConfig, start: MonoInstant<U>) -> Self {
        let slots = cfg.slots.get();
        let tick = cfg.tick.get();
        Self {
            slots: vec![None; slots],
            slab: Slab::with_capacity(cfg.capacity),
            mask: slots as u64 - 1,
            tick,
            cursor: start.as_u64() / tick,
            _unit: PhantomData,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slab.len() == 0
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    const fn slot_of(&self, tick: u64) -> usize {
        (tick & self.mask) as usize
    }

    /// Schedules `payload` to fire on the first tick at or after `deadline`.
    ///
    /// Deadlines already in the past fire on the next tick.
    pub fn schedule_at(
        &mut self,
        deadline: MonoInstant<U>,
        payload: T,
    ) -> Result<TimerHandle<T>, WheelError> {
        let deadline_tick = deadline.as_u64().div_ceil(self.tick).max(self.cursor + 1);
        let slot = self.slot_of(deadline_tick);
        let head = self.slots[slot];
        let capacity = self.slab.capacity();

        let (idx, generation) = {
            let (idx, node) = self
                .slab
                .alloc(payload, deadline_tick)
                .ok_or(WheelError::Capacity(capacity))?;
            node.next = head;
            node.prev = None;
            (idx, node.generation)
        };
        if let Some(head_idx) = head
            && let Some(head) = self.slab.get_mut(head_idx)
        {
            head.prev = Some(idx);
        }
        self.slots[slot] = Some(idx);
        Ok(TimerHandle { idx, generation })
    }

    /// Cancels a pending timer. Returns `false` for fired or stale handles.
    pub fn cancel(&mut self, handle: &TimerHandle<T>) -> bool {
        match self.slab.get(handle.idx) {
            Some(node) if node.generation == handle.generation => {}
            _ => return false,
        }
        self.unlink(handle.idx);
        self.slab.free(handle.idx).is_some()
    }

    fn unlink(&mut self, idx: SlabIndex<T>) {
        let Some(node) = self.slab.get(idx) else {
            return;
        };
        let (prev, next, deadline) = (node.prev, node.next, node.deadline);
        match prev {
            Some(p) => {
                if let Some(pnode) = self.slab.get_mut(p) {
                    pnode.next = next;
                }
            }
            None => {
                let slot = self.slot_of(deadline);
                self.slots[slot] = next;
            }
        }
        if let Some(n) = next
            && let Some(nnode) = self.slab.get_mut(n)
        {
            nnode.prev = prev;
        }
    }

    /// Advances the wheel to `now` and invokes `on_fire` for each due timer.
    ///
    /// A jump of more than one rotation visits every slot once.
    pub fn tick_at(&mut self, now: MonoInstant<U>, mut on_fire: impl FnMut(TimerHandle<T>, T)) {
        let now_tick = now.as_u64() / self.tick;
        if now_tick <= self.cursor {
            return;
        }
        let span = (now_tick - self.cursor).min(self.mask + 1);
        for step in 1..=span {
            let slot = self.slot_of(self.cursor + step);
            let mut cur = self.slots[slot];
            while let Some(idx) = cur {
                let Some(node) = self.slab.get(idx) else {
                    break;
                };
                cur = node.next;
                if node.deadline > now_tick {
                    continue;
                }
                let generation = node.generation;
                self.unlink(idx);
                if let Some(payload) = self.slab.free(idx).and_then(|n| n.payload) {
                    on_fire(TimerHandle { idx, generation }, payload);
                }
            }
        }
        self.cursor = now_tick;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::Millis;

    fn wheel(capacity: usize) -> Wheel<u32, Millis> {
        Wheel::new(
            WheelConfig {
                slots: PowerOfTwo::new(8).unwrap(),
                tick: NonZeroU64::new(1).unwrap(),
                capacity: NonZeroUsize::new(capacity).unwrap(),
            },
            MonoInstant::new(0),
        )
    }

    fn at(ms: u64) -> MonoInstant<Millis> {
        MonoInstant::new(ms)
    }

    #[test]
    fn fires_due_timers() {
        let mut w = wheel(4);
        let h1 = w.schedule_at(at(1), 10).unwrap();
        let h2 = w.schedule_at(at(2), 20).unwrap();
        let mut fired = Vec::new();
        w.tick_at(at(1), |h, v| fired.push((h, v)));
        assert_eq!(fired, vec![(h1, 10)]);

        fired.clear();
        w.tick_at(at(3), |h, v| fired.push((h, v)));
        assert_eq!(fired, vec![(h2, 20)]);
        assert!(w.is_empty());
    }

    #[test]
    fn past_deadline_fires_next_tick() {
        let mut w = wheel(2);
        w.tick_at(at(5), |_, _| {});
        w.schedule_at(at(1), 7).unwrap();
        let mut fired = Vec::new();
        w.tick_at(at(6), |_, v| fired.push(v));
        assert_eq!(fired, vec![7]);
    }

    #[test]
    fn cancel_prevents_fire() {
        let mut w = wheel(2);
        let h = w.schedule_at(at(1), 42).unwrap();
        assert!(w.cancel(&h));
        assert!(!w.cancel(&h));
        let mut fired = Vec::new();
        w.tick_at(at(1), |_, v| fired.push(v));
        assert!(fired.is_empty());
    }

    #[test]
    fn cancel_middle_of_slot_list() {
        let mut w = wheel(3);
        w.schedule_at(at(2), 1).unwrap();
        let mid = w.schedule_at(at(2), 2).unwrap();
        w.schedule_at(at(2), 3).unwrap();
        assert!(w.cancel(&mid));
        let mut fired = Vec::new();
        w.tick_at(at(2), |_, v| fired.push(v));
        fired.sort_unstable();
        assert_eq!(fired, vec![1, 3]);
    }

    #[test]
    fn stale_handle_rejected() {
        let mut w = wheel(1);
        let h1 = w.schedule_at(at(1), 1).unwrap();
        w.tick_at(at(1), |_, _| {});
        let h2 = w.schedule_at(at(2), 2).unwrap();
        assert_ne!(h1, h2);
        assert!(!w.cancel(&h1));
        assert!(w.cancel(&h2));
    }

    #[test]
    fn capacity_exhaustion() {
        let mut w = wheel(1);
        w.schedule_at(at(1), 1).unwrap();
        assert_eq!(w.schedule_at(at(1), 2), Err(WheelError::Capacity(1)));
    }

    #[test]
    fn deadline_beyond_one_rotation() {
        let mut w = wheel(2);
        // Slot 3 is visited at tick 3 and tick 11; only the second is due.
        w.schedule_at(at(11), 5).unwrap();
        let mut fired = Vec::new();
        w.tick_at(at(3), |_, v| fired.push(v));
        assert!(fired.is_empty());
        w.tick_at(at(10), |_, v| fired.push(v));
        assert!(fired.is_empty());
        w.tick_at(at(11), |_, v| fired.push(v));
        assert_eq!(fired, vec![5]);
    }

    #[test]
    fn large_jump_fires_everything_due() {
        let mut w = wheel(3);
        w.schedule_at(at(1), 1).unwrap();
        w.schedule_at(at(6), 2).unwrap();
        w.schedule_at(at(40), 3).unwrap();
        let mut fired = Vec::new();
        w.tick_at(at(100), |_, v| fired.push(v));
        fired.sort_unstable();
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn coarse_tick_rounds_deadline_up() {
        let mut w: Wheel<u32, Millis> = Wheel::new(
            WheelConfig {
                slots: PowerOfTwo::new(4).unwrap(),
                tick: NonZeroU64::new(10).unwrap(),
                capacity: NonZeroUsize::new(1).unwrap(),
            },
            MonoInstant::new(0),
        );
        w.schedule_at(at(15), 1).unwrap();
        let mut fired = Vec::new();
        w.tick_at(at(19), |_, v| fired.push(v));
        assert!(fired.is_empty());
        w.tick_at(at(20), |_, v| fired.push(v));
        assert_eq!(fired, vec![1]);
    }
}
