//! # TDMA scheduler
//!
//! Fixed schedule of timeslots, each hosting up to
//! [`MAX_CONN_PER_TIMESLOT`] main connections and as many auto-reply
//! connections with per-slot priorities. The scheduler tracks the current
//! slot, the sleep level of the current and next slots, and accumulates
//! the sleep time spanned by slot increments (skipped slots included) for
//! the sync module.

use heapless::Vec;

use crate::ConnectionId;
use crate::config::{MAX_CONN_PER_TIMESLOT, MAX_TIMESLOT_COUNT};
use crate::error::WpsError;

/// Radio sleep depth between timeslots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SleepLvl {
    /// Chip clock keeps running, wake is immediate.
    #[default]
    Idle = 0,
    /// Idle without the wake-once latch; used for non-stop RX.
    IdleNoWakeonce = 1,
    /// Partial power down.
    Shallow = 2,
    /// Full power down, only the sleep timer survives.
    Deep = 3,
}

/// One schedule entry.
#[derive(Debug, Default, Clone)]
pub struct Timeslot {
    /// Slot duration, in PLL cycles.
    pub duration_pll_cycles: u32,
    /// Main-direction connections hosted by the slot.
    pub main_connections: Vec<ConnectionId, MAX_CONN_PER_TIMESLOT>,
    /// Priority of each main connection, lower is more urgent.
    pub main_priorities: Vec<u8, MAX_CONN_PER_TIMESLOT>,
    /// Auto-reply connections hosted by the slot.
    pub auto_connections: Vec<ConnectionId, MAX_CONN_PER_TIMESLOT>,
    /// Priority of each auto-reply connection.
    pub auto_priorities: Vec<u8, MAX_CONN_PER_TIMESLOT>,
    /// Sleep depth entered after the slot.
    pub sleep_lvl: SleepLvl,
    /// Main connection index the last received frame resolved to; an
    /// auto-reply without a dedicated connection replies on its behalf.
    pub last_used_main_connection: u8,
}

/// Schedule walker.
#[derive(Debug, Default)]
pub struct Scheduler {
    timeslots: Vec<Timeslot, MAX_TIMESLOT_COUNT>,
    current: u8,
    sleep_time: u32,
    lightest_sleep_lvl: SleepLvl,
}

impl Scheduler {
    /// Install the schedule from per-slot durations.
    pub fn init(&mut self, durations_pll_cycles: &[u32]) -> Result<(), WpsError> {
        self.timeslots.clear();
        for &duration in durations_pll_cycles {
            let slot = Timeslot { duration_pll_cycles: duration, ..Timeslot::default() };
            self.timeslots.push(slot).map_err(|_| WpsError::NotEnoughMemory)?;
        }
        self.current = 0;
        self.sleep_time = 0;
        self.lightest_sleep_lvl = SleepLvl::Idle;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        !self.timeslots.is_empty()
    }

    pub fn size(&self) -> usize {
        self.timeslots.len()
    }

    /// Restart the walk at slot zero.
    pub fn set_first_time_slot(&mut self) {
        self.current = 0;
        self.sleep_time = 0;
    }

    /// Advance by one slot, accumulating the duration of the slot being
    /// left into the pending sleep time. Returns the number of slots
    /// advanced (always one; throttling loops call it repeatedly).
    pub fn increment_time_slot(&mut self) -> u8 {
        let size = self.timeslots.len() as u8;
        if size == 0 {
            return 0;
        }
        self.sleep_time += self.timeslots[usize::from(self.current)].duration_pll_cycles;
        self.current = (self.current + 1) % size;
        1
    }

    /// Sleep time accumulated since the last reset, in PLL cycles.
    pub fn sleep_time(&self) -> u32 {
        self.sleep_time
    }

    pub fn reset_sleep_time(&mut self) {
        self.sleep_time = 0;
    }

    pub fn current_time_slot_num(&self) -> u8 {
        self.current
    }

    pub fn current_timeslot(&self) -> &Timeslot {
        &self.timeslots[usize::from(self.current)]
    }

    pub fn current_timeslot_mut(&mut self) -> &mut Timeslot {
        &mut self.timeslots[usize::from(self.current)]
    }

    pub fn timeslot(&self, idx: usize) -> Option<&Timeslot> {
        self.timeslots.get(idx)
    }

    pub fn timeslot_mut(&mut self, idx: usize) -> Option<&mut Timeslot> {
        self.timeslots.get_mut(idx)
    }

    /// Sleep level entered after the current slot.
    pub fn current_sleep_lvl(&self) -> SleepLvl {
        self.current_timeslot().sleep_lvl
    }

    /// Sleep level of the slot after the current one.
    pub fn next_sleep_lvl(&self) -> SleepLvl {
        let size = self.timeslots.len();
        if size == 0 {
            return SleepLvl::Idle;
        }
        self.timeslots[(usize::from(self.current) + 1) % size].sleep_lvl
    }

    /// Lightest sleep depth anywhere in the schedule.
    pub fn lightest_sleep_lvl(&self) -> SleepLvl {
        self.lightest_sleep_lvl
    }

    /// Recompute the lightest sleep level; call after editing slots.
    pub fn refresh_lightest_sleep_lvl(&mut self) {
        self.lightest_sleep_lvl =
            self.timeslots.iter().map(|ts| ts.sleep_lvl).min().unwrap_or(SleepLvl::Idle);
    }

    /// Main connection of the current slot at `connection_idx`.
    pub fn current_main_connection(&self, connection_idx: u8) -> Option<ConnectionId> {
        self.current_timeslot().main_connections.get(usize::from(connection_idx)).copied()
    }

    /// Auto-reply connection of the current slot at `connection_idx`.
    pub fn current_auto_connection(&self, connection_idx: u8) -> Option<ConnectionId> {
        self.current_timeslot().auto_connections.get(usize::from(connection_idx)).copied()
    }
}

/// Index of the highest-priority connection with pending traffic.
///
/// `non_empty` reports whether the connection at an index has something to
/// send; among those, the lowest priority value wins, first match breaking
/// ties. Falls back to index zero when every queue is empty.
pub fn highest_priority_conn_index(
    priorities: &[u8],
    count: usize,
    mut non_empty: impl FnMut(usize) -> bool,
) -> u8 {
    let mut best: Option<(u8, u8)> = None;
    for i in 0..count {
        if !non_empty(i) {
            continue;
        }
        let prio = priorities.get(i).copied().unwrap_or(u8::MAX);
        if best.map_or(true, |(_, p)| prio < p) {
            best = Some((i as u8, prio));
        }
    }
    best.map_or(0, |(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(durations: &[u32]) -> Scheduler {
        let mut s = Scheduler::default();
        s.init(durations).unwrap();
        s
    }

    #[test]
    fn increment_accumulates_sleep_time_and_wraps() {
        let mut s = scheduler(&[100, 200, 300]);
        assert_eq!(s.increment_time_slot(), 1);
        assert_eq!(s.sleep_time(), 100);
        assert_eq!(s.current_time_slot_num(), 1);
        s.increment_time_slot();
        s.increment_time_slot();
        assert_eq!(s.sleep_time(), 600);
        assert_eq!(s.current_time_slot_num(), 0);
        s.reset_sleep_time();
        assert_eq!(s.sleep_time(), 0);
    }

    #[test]
    fn lightest_sleep_level_is_minimum_over_schedule() {
        let mut s = scheduler(&[100, 100]);
        s.timeslot_mut(0).unwrap().sleep_lvl = SleepLvl::Deep;
        s.timeslot_mut(1).unwrap().sleep_lvl = SleepLvl::Shallow;
        s.refresh_lightest_sleep_lvl();
        assert_eq!(s.lightest_sleep_lvl(), SleepLvl::Shallow);
    }

    #[test]
    fn priority_selection_prefers_lowest_value_with_traffic() {
        let priorities = [2, 0, 1];
        // Highest priority queue is empty, the next one wins.
        let idx = highest_priority_conn_index(&priorities, 3, |i| i != 1);
        assert_eq!(idx, 2);
        // All empty falls back to index zero.
        let idx = highest_priority_conn_index(&priorities, 3, |_| false);
        assert_eq!(idx, 0);
    }
}
