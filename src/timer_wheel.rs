//! Cycle-granularity timer wheel used to wake shaped entities.
//!
//! Time is measured in scheduler cycles and grouped into ticks of
//! `2^tick_shift` cycles. Pending timers sit in a hierarchy of eight wheels of
//! 256 slots each; a timer is filed at the level of the highest byte in which
//! its tick differs from the current tick, so the wheels together cover the
//! whole `u64` tick space and the horizon is limited only by configuration.
//!
//! Advancing time jumps straight to the start of the next occupied slot
//! (found through per-level occupancy bitmaps) and cascades that slot one
//! level down; idle stretches cost nothing. Timers whose tick has been
//! reached move to a small heap ordered by exact wake time, so expirations
//! are exact to the cycle even though filing is per tick: an entry never
//! fires before its wake time and entries expire in non-decreasing wake
//! order.
//!
//! The wheel performs no locking. All mutation goes through `&mut self`.

use crate::config::WheelConfig;
use crate::error::{ObjectKind, TmError, TmResult};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

const LEVELS: usize = 8;
const SLOT_BITS: u32 = 8;
const SLOTS: usize = 1 << SLOT_BITS;
const BITMAP_WORDS: usize = SLOTS / 64;
const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct SlotList {
    head: u32,
    tail: u32,
}

impl SlotList {
    const EMPTY: SlotList = SlotList {
        head: NIL,
        tail: NIL,
    };
}

#[derive(Debug)]
struct Timer<T> {
    next: u32,
    wake: u64,
    value: Option<T>,
}

/// Counters describing wheel activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimerWheelStats {
    pub max_timers: u32,
    pub pending: u32,
    pub peak_pending: u32,
    pub total_inserts: u64,
    pub total_expired: u64,
    pub cascades: u64,
}

#[derive(Debug)]
pub struct TimerWheel<T> {
    config: WheelConfig,
    current_time: u64,
    current_tick: u64,
    slots: Vec<SlotList>,
    occupied: [[u64; BITMAP_WORDS]; LEVELS],
    level_counts: [u32; LEVELS],
    /// Timers whose tick has been reached, ordered by (wake, insertion).
    near: BinaryHeap<Reverse<(u64, u64, u32)>>,
    expired: VecDeque<u32>,
    timers: Vec<Timer<T>>,
    free_head: u32,
    live: u32,
    max_timers: u32,
    seq: u64,
    stats: TimerWheelStats,
}

fn block_base(tick: u64, level: usize) -> u64 {
    let shift = SLOT_BITS * (level as u32 + 1);
    if shift >= u64::BITS {
        0
    } else {
        (tick >> shift) << shift
    }
}

fn slot_of(tick: u64, level: usize) -> usize {
    ((tick >> (SLOT_BITS * level as u32)) as usize) & (SLOTS - 1)
}

impl<T> TimerWheel<T> {
    /// Create a wheel with the default geometry.
    pub fn new(max_concurrent_timers: u32, current_time: u64) -> Self {
        Self::with_config(max_concurrent_timers, current_time, WheelConfig::default())
    }

    pub fn with_config(max_concurrent_timers: u32, current_time: u64, config: WheelConfig) -> Self {
        Self {
            config,
            current_time,
            current_tick: current_time >> config.tick_shift,
            slots: vec![SlotList::EMPTY; LEVELS * SLOTS],
            occupied: [[0; BITMAP_WORDS]; LEVELS],
            level_counts: [0; LEVELS],
            near: BinaryHeap::new(),
            expired: VecDeque::new(),
            timers: Vec::new(),
            free_head: NIL,
            live: 0,
            max_timers: max_concurrent_timers,
            seq: 0,
            stats: TimerWheelStats {
                max_timers: max_concurrent_timers,
                ..TimerWheelStats::default()
            },
        }
    }

    pub fn current_time(&self) -> u64 {
        self.current_time
    }

    /// Timers inserted and not yet returned by [`TimerWheel::next_expired`].
    pub fn len(&self) -> u32 {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn stats(&self) -> TimerWheelStats {
        TimerWheelStats {
            pending: self.live,
            ..self.stats
        }
    }

    /// Schedule `value` to expire at `wakeup_time`.
    ///
    /// The wakeup must lie strictly after the current time and within the
    /// configured horizon.
    pub fn insert(&mut self, wakeup_time: u64, value: T) -> TmResult<()> {
        if wakeup_time <= self.current_time {
            return Err(TmError::invalid_param(
                "wakeup_time",
                format!("{wakeup_time} is not after the current time {}", self.current_time),
            ));
        }
        if wakeup_time - self.current_time > self.config.horizon_cycles {
            return Err(TmError::invalid_param(
                "wakeup_time",
                format!(
                    "{wakeup_time} is more than {} cycles past {}",
                    self.config.horizon_cycles, self.current_time
                ),
            ));
        }
        if self.live >= self.max_timers {
            return Err(TmError::CapacityExceeded {
                kind: ObjectKind::Timer,
                max: self.max_timers as u64,
            });
        }

        let index = self.alloc(wakeup_time, value);
        self.live += 1;
        self.stats.total_inserts += 1;
        self.stats.peak_pending = self.stats.peak_pending.max(self.live);
        self.file(index);
        Ok(())
    }

    /// Advance the clock to `now` and return how many timers newly expired.
    ///
    /// Calls with a time at or before the current time change nothing.
    pub fn curr_time_update(&mut self, now: u64) -> u32 {
        if now <= self.current_time {
            return 0;
        }

        let target_tick = now >> self.config.tick_shift;
        while self.current_tick < target_tick {
            match self.next_stop() {
                Some(stop) if stop <= target_tick => {
                    self.current_tick = stop;
                    self.cascade();
                }
                _ => self.current_tick = target_tick,
            }
        }
        self.current_time = now;

        let mut newly_expired = 0;
        while let Some(Reverse((wake, _, index))) = self.near.peek().copied() {
            if wake > now {
                break;
            }
            self.near.pop();
            self.expired.push_back(index);
            newly_expired += 1;
        }
        newly_expired
    }

    /// Pop one expired timer, earliest wake time first.
    pub fn next_expired(&mut self) -> Option<T> {
        let index = self.expired.pop_front()?;
        self.stats.total_expired += 1;
        Some(self.release(index))
    }

    fn alloc(&mut self, wake: u64, value: T) -> u32 {
        if self.free_head != NIL {
            let index = self.free_head;
            let timer = &mut self.timers[index as usize];
            self.free_head = timer.next;
            timer.next = NIL;
            timer.wake = wake;
            timer.value = Some(value);
            index
        } else {
            self.timers.push(Timer {
                next: NIL,
                wake,
                value: Some(value),
            });
            (self.timers.len() - 1) as u32
        }
    }

    fn release(&mut self, index: u32) -> T {
        let timer = &mut self.timers[index as usize];
        let value = timer.value.take().expect("expired timer must hold a value");
        timer.next = self.free_head;
        self.free_head = index;
        self.live -= 1;
        value
    }

    /// Place a timer relative to the current tick.
    fn file(&mut self, index: u32) {
        let wake = self.timers[index as usize].wake;
        let tick = wake >> self.config.tick_shift;
        if tick <= self.current_tick {
            self.near.push(Reverse((wake, self.seq, index)));
            self.seq += 1;
            return;
        }

        let level = ((u64::BITS - 1 - (tick ^ self.current_tick).leading_zeros()) / SLOT_BITS) as usize;
        let slot = slot_of(tick, level);
        let list = &mut self.slots[level * SLOTS + slot];
        self.timers[index as usize].next = NIL;
        if list.tail == NIL {
            list.head = index;
        } else {
            self.timers[list.tail as usize].next = index;
        }
        list.tail = index;
        self.occupied[level][slot / 64] |= 1 << (slot % 64);
        self.level_counts[level] += 1;
    }

    fn next_occupied(&self, level: usize, from: usize) -> Option<usize> {
        let mut word = from / 64;
        if word >= BITMAP_WORDS {
            return None;
        }
        let mut bits = self.occupied[level][word] & (!0u64 << (from % 64));
        loop {
            if bits != 0 {
                return Some(word * 64 + bits.trailing_zeros() as usize);
            }
            word += 1;
            if word == BITMAP_WORDS {
                return None;
            }
            bits = self.occupied[level][word];
        }
    }

    /// Earliest tick at which an occupied slot begins.
    ///
    /// Every timer filed at `level` shares the current tick's bytes above
    /// `level` and has a strictly larger byte at `level`, so the first
    /// occupied slot after the current position is where it must be visited.
    fn next_stop(&self) -> Option<u64> {
        let mut best: Option<u64> = None;
        for level in 0..LEVELS {
            if self.level_counts[level] == 0 {
                continue;
            }
            let slot = self
                .next_occupied(level, slot_of(self.current_tick, level) + 1)
                .expect("timer wheel level count disagrees with its occupancy bitmap");
            let start = block_base(self.current_tick, level) | ((slot as u64) << (SLOT_BITS * level as u32));
            best = Some(best.map_or(start, |b| b.min(start)));
        }
        best
    }

    /// Re-file every slot that begins exactly at the current tick.
    fn cascade(&mut self) {
        for level in (0..LEVELS).rev() {
            let low_mask = (1u64 << (SLOT_BITS * level as u32)) - 1;
            if self.current_tick & low_mask != 0 {
                continue;
            }
            let slot = slot_of(self.current_tick, level);
            let bit = 1u64 << (slot % 64);
            if self.occupied[level][slot / 64] & bit == 0 {
                continue;
            }

            let list = std::mem::replace(&mut self.slots[level * SLOTS + slot], SlotList::EMPTY);
            self.occupied[level][slot / 64] &= !bit;
            self.stats.cascades += 1;

            let mut cur = list.head;
            while cur != NIL {
                let next = self.timers[cur as usize].next;
                self.level_counts[level] -= 1;
                self.file(cur);
                cur = next;
            }
        }
    }
}
