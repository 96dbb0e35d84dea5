//! Timers ordered by deadline.
//!
//! A binary min-heap keyed by `(deadline, insertion sequence)`: equal
//! deadlines fire in start order. Deadlines compare against the clock
//! cached at the top of the iteration, so a timer started inside a
//! callback with timeout 0 fires no earlier than the next iteration and
//! cannot starve I/O.
//!
//! Stopping a timer does not search the heap; it bumps the timer's
//! generation and the stale entry is discarded when it surfaces.

use crate::error::{Error, Result};
use crate::reactor::core::EventLoop;
use crate::reactor::handle::{Handle, HandleData, HandleFlags};

use std::cmp::Reverse;
use std::collections::BinaryHeap;

pub(crate) type TimerCb = Box<dyn FnMut(&mut EventLoop, Handle)>;

pub(crate) struct TimerState {
    pub(crate) cb: Option<TimerCb>,
    pub(crate) timeout: u64,
    pub(crate) repeat: u64,
    pub(crate) generation: u64,
}

/// Heap key. Field order carries the comparison: deadline first, then the
/// insertion sequence for ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerEntry {
    deadline: u64,
    seq: u64,
    handle: Handle,
    generation: u64,
}

pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        TimerHeap {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn push(&mut self, handle: Handle, deadline: u64, generation: u64) {
        self.next_seq += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline,
            seq: self.next_seq,
            handle,
            generation,
        }));
    }

    /// Earliest queued deadline. May belong to a stopped timer, in which
    /// case the loop wakes early once and discards the stale entry.
    pub(crate) fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }
}

/// Fires every timer whose deadline is at or before the cached clock.
///
/// The due set is collected up front, so a timer re-armed from inside its
/// own callback fires at most once per iteration. Repeating timers re-arm
/// after the callback returns, to `max(now, previous deadline + period)`:
/// a delayed loop catches up with a single immediate fire instead of a
/// burst, and an on-time loop never drifts.
pub(crate) fn run_due_timers(lp: &mut EventLoop) {
    let now = lp.now();

    let mut due = Vec::new();
    while let Some(&Reverse(entry)) = lp.timers.heap.peek() {
        if entry.deadline > now {
            break;
        }
        due.push(entry);
        lp.timers.heap.pop();
    }

    for entry in due {
        let h = entry.handle;

        let (cb_opt, repeat) = match lp.handles.get_mut(h.0) {
            Some(slot) if slot.flags.contains(HandleFlags::ACTIVE) && !slot.is_closing() => {
                match slot.timer_mut() {
                    Some(state) if state.generation == entry.generation => {
                        (state.cb.take(), state.repeat)
                    }
                    _ => (None, 0),
                }
            }
            _ => (None, 0),
        };

        let Some(mut cb) = cb_opt else { continue };

        // One-shot timers are already stopped when their callback runs, so
        // the callback may restart or close the handle freely.
        if repeat == 0 {
            lp.stop_handle(h);
        }

        cb(lp, h);

        if let Some(slot) = lp.handles.get_mut(h.0) {
            if !slot.is_closing() {
                let mut rearm = None;
                if let Some(state) = slot.timer_mut() {
                    if state.cb.is_none() {
                        state.cb = Some(cb);
                    }
                    // The callback may have stopped or restarted the timer;
                    // both bump the generation and suppress the re-arm.
                    if repeat > 0 && state.generation == entry.generation {
                        rearm = Some((now.max(entry.deadline + repeat), state.generation));
                    }
                }
                if let Some((deadline, generation)) = rearm {
                    if slot.flags.contains(HandleFlags::ACTIVE) {
                        lp.timers.push(h, deadline, generation);
                    }
                }
            }
        }
    }
}

impl EventLoop {
    pub fn timer_init(&mut self) -> Result<Handle> {
        Ok(self.new_handle(HandleData::Timer(TimerState {
            cb: None,
            timeout: 0,
            repeat: 0,
            generation: 0,
        })))
    }

    /// Arms a timer to fire once after `timeout` ms, then every `repeat` ms
    /// if `repeat` is non-zero. Restarting an armed timer replaces its
    /// schedule and callback.
    pub fn timer_start(
        &mut self,
        h: Handle,
        timeout: u64,
        repeat: u64,
        cb: impl FnMut(&mut EventLoop, Handle) + 'static,
    ) -> Result<()> {
        let now = self.now();
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Err(Error::Inval);
        }
        let state = slot.timer_mut().ok_or(Error::Inval)?;
        state.generation += 1;
        state.timeout = timeout;
        state.repeat = repeat;
        state.cb = Some(Box::new(cb));
        let generation = state.generation;

        self.timers.push(h, now + timeout, generation);
        self.start_handle(h);
        Ok(())
    }

    /// Disarms the timer. The queued heap entry is invalidated, not removed.
    pub fn timer_stop(&mut self, h: Handle) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        let state = slot.timer_mut().ok_or(Error::Inval)?;
        state.generation += 1;
        self.stop_handle(h);
        Ok(())
    }

    /// Re-arms a repeating timer using its repeat interval as the timeout.
    /// Fails with [`Error::Inval`] if the timer was never started or has no
    /// repeat interval.
    pub fn timer_again(&mut self, h: Handle) -> Result<()> {
        let now = self.now();
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        if slot.is_closing() {
            return Err(Error::Inval);
        }
        let state = slot.timer_mut().ok_or(Error::Inval)?;
        if state.cb.is_none() || state.repeat == 0 {
            return Err(Error::Inval);
        }
        state.generation += 1;
        let (generation, repeat) = (state.generation, state.repeat);

        self.timers.push(h, now + repeat, generation);
        self.start_handle(h);
        Ok(())
    }

    pub fn timer_set_repeat(&mut self, h: Handle, repeat: u64) -> Result<()> {
        let slot = self.handles.get_mut(h.0).ok_or(Error::BadF)?;
        let state = slot.timer_mut().ok_or(Error::Inval)?;
        state.repeat = repeat;
        Ok(())
    }

    pub fn timer_get_repeat(&self, h: Handle) -> Result<u64> {
        let slot = self.handles.get(h.0).ok_or(Error::BadF)?;
        match &slot.data {
            HandleData::Timer(state) => Ok(state.repeat),
            _ => Err(Error::Inval),
        }
    }
}
