//! Per-image liveness deadlines on top of the timing wheel.
//!
//! Each armed correlation id owns at most one wheel entry. Pushing a deadline
//! later only updates the bookkeeping; the stale wheel entry is rescheduled
//! when it fires. Pulling a deadline earlier reschedules immediately.

use std::collections::HashMap;

use crate::timing::{Micros, MonoInstant, TimerHandle, Wheel, WheelConfig, WheelError};
use crate::trace::warn;

struct Armed {
    deadline: MonoInstant<Micros>,
    scheduled_for: MonoInstant<Micros>,
    handle: TimerHandle<i64>,
}

pub struct LivenessTimer {
    wheel: Wheel<i64, Micros>,
    armed: HashMap<i64, Armed>,
    fired: Vec<(TimerHandle<i64>, i64)>,
    expired: Vec<i64>,
}

impl LivenessTimer {
    #[must_use]
    pub fn new(config: WheelConfig, start: MonoInstant<Micros>) -> Self {
        Self {
            wheel: Wheel::new(config, start),
            armed: HashMap::new(),
            fired: Vec::new(),
            expired: Vec::new(),
        }
    }

    /// Arms `correlation_id` to expire at `deadline`, replacing any earlier
    /// deadline.
    ///
    /// # Errors
    ///
    /// [`WheelError::Capacity`] when no timer slot is free; the previous
    /// deadline, if any, stays armed.
    pub fn arm(&mut self, correlation_id: i64, deadline: MonoInstant<Micros>) -> Result<(), WheelError> {
        if let Some(armed) = self.armed.get_mut(&correlation_id) {
            if deadline >= armed.scheduled_for {
                armed.deadline = deadline;
                return Ok(());
            }
            let handle = self.wheel.schedule_at(deadline, correlation_id)?;
            self.wheel.cancel(&armed.handle);
            *armed = Armed {
                deadline,
                scheduled_for: deadline,
                handle,
            };
            return Ok(());
        }
        let handle = self.wheel.schedule_at(deadline, correlation_id)?;
        self.armed.insert(
            correlation_id,
            Armed {
                deadline,
                scheduled_for: deadline,
                handle,
            },
        );
        Ok(())
    }

    /// Disarms `correlation_id`. Idempotent; returns `false` if it was not armed.
    pub fn cancel(&mut self, correlation_id: i64) -> bool {
        match self.armed.remove(&correlation_id) {
            Some(armed) => {
                self.wheel.cancel(&armed.handle);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_armed(&self, correlation_id: i64) -> bool {
        self.armed.contains_key(&correlation_id)
    }

    #[must_use]
    pub fn deadline(&self, correlation_id: i64) -> Option<MonoInstant<Micros>> {
        self.armed.get(&correlation_id).map(|a| a.deadline)
    }

    /// Advances to `now` and drains the ids whose deadline has passed.
    ///
    /// Only entries still armed at this point are reported, each once.
    pub fn poll(&mut self, now: MonoInstant<Micros>) -> impl Iterator<Item = i64> + '_ {
        let fired = &mut self.fired;
        self.wheel.tick_at(now, |handle, id| fired.push((handle, id)));

        for (handle, id) in self.fired.drain(..) {
            let Some(armed) = self.armed.get_mut(&id) else {
                continue;
            };
            if armed.handle != handle {
                continue;
            }
            if armed.deadline <= now {
                self.armed.remove(&id);
                self.expired.push(id);
                continue;
            }
            match self.wheel.schedule_at(armed.deadline, id) {
                Ok(handle) => {
                    armed.handle = handle;
                    armed.scheduled_for = armed.deadline;
                }
                Err(e) => {
                    warn!(image = id, error = %e, "liveness reschedule failed, expiring early");
                    self.armed.remove(&id);
                    self.expired.push(id);
                }
            }
        }
        self.expired.drain(..)
    }
}
