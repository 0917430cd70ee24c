use core::cell::Cell;
use core::ops::{Add, Sub};
use critical_section::Mutex;
use serde::{Deserialize, Serialize};

/// Largest forward distance for which the signed due test stays exact.
pub const MAX_TICK_DISTANCE: u16 = i16::MAX as u16;

/// Scheduler time unit. Wraps silently; compare with [`Tick::is_due`], never with `<`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Tick(pub u16);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    /// True once `now` has reached or passed `self`, using signed-difference arithmetic.
    #[inline]
    pub fn is_due(self, now: Tick) -> bool {
        (now.0.wrapping_sub(self.0) as i16) >= 0
    }

    /// Ticks elapsed from `earlier` to `self`, modulo the counter range.
    #[inline]
    pub fn since(self, earlier: Tick) -> u16 {
        self.0.wrapping_sub(earlier.0)
    }
}

impl Add<u16> for Tick {
    type Output = Tick;

    fn add(self, rhs: u16) -> Tick {
        Tick(self.0.wrapping_add(rhs))
    }
}

impl Sub<u16> for Tick {
    type Output = Tick;

    fn sub(self, rhs: u16) -> Tick {
        Tick(self.0.wrapping_sub(rhs))
    }
}

impl core::fmt::Display for Tick {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ClockState {
    ticks: u16,
    overflows: u16,
}

/// Free-running tick counter advanced from the timer overflow interrupt.
///
/// The counter state is wider than a register on the small targets, so every
/// access from task code goes through a critical section.
#[derive(Debug)]
pub struct Clock {
    state: Mutex<Cell<ClockState>>,
    overflows_per_tick: u16,
}

impl Clock {
    /// Clock where every hardware overflow is one tick.
    pub const fn new() -> Self {
        Self::with_calibration(1)
    }

    /// Clock that advances one tick every `overflows_per_tick` timer overflows.
    pub const fn with_calibration(overflows_per_tick: u16) -> Self {
        Self {
            state: Mutex::new(Cell::new(ClockState { ticks: 0, overflows: 0 })),
            overflows_per_tick: if overflows_per_tick == 0 { 1 } else { overflows_per_tick },
        }
    }

    /// Timer overflow interrupt entry.
    pub fn on_overflow(&self) {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            state.overflows += 1;
            if state.overflows >= self.overflows_per_tick {
                state.overflows = 0;
                state.ticks = state.ticks.wrapping_add(1);
            }
            cell.set(state);
        });
    }

    /// Current tick, read atomically with respect to [`Clock::on_overflow`].
    pub fn read_timer(&self) -> Tick {
        critical_section::with(|cs| Tick(self.state.borrow(cs).get().ticks))
    }

    /// Advance by whole ticks, as if `ticks * overflows_per_tick` overflows fired.
    pub fn advance(&self, ticks: u16) {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            state.ticks = state.ticks.wrapping_add(ticks);
            cell.set(state);
        });
    }

    /// Force the counter to `tick`, discarding any partial overflow count.
    pub fn set(&self, tick: Tick) {
        critical_section::with(|cs| {
            self.state.borrow(cs).set(ClockState { ticks: tick.0, overflows: 0 });
        });
    }

    pub fn overflows_per_tick(&self) -> u16 {
        self.overflows_per_tick
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded wait measured on a [`Clock`], with a hard cap on the number of
/// polls so that it ends even when the clock cannot advance (interrupts masked).
#[derive(Debug)]
pub struct Timeout<'c> {
    clock: &'c Clock,
    started: Tick,
    ticks: u16,
    polls_left: u32,
}

impl<'c> Timeout<'c> {
    pub fn new(clock: &'c Clock, ticks: u16, max_polls: u32) -> Self {
        Self { clock, started: clock.read_timer(), ticks, polls_left: max_polls }
    }

    /// Consume one poll. True once either budget is used up.
    pub fn expired(&mut self) -> bool {
        if self.polls_left == 0 {
            return true;
        }
        self.polls_left -= 1;
        self.clock.read_timer().since(self.started) >= self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_matches_unbounded_comparison() {
        // Sample starting points across the whole range, including the wrap.
        for now in (0u32..=u16::MAX as u32).step_by(257) {
            for distance in [0u32, 1, 2, 100, 1000, 32766, 32767] {
                let deadline = Tick((now + distance) as u16);
                let now_tick = Tick(now as u16);
                assert_eq!(deadline.is_due(now_tick), distance == 0);
                // One step past the deadline is always due.
                let later = Tick((now + distance + 1) as u16);
                assert!(deadline.is_due(later));
            }
        }
    }

    #[test]
    fn test_due_across_wrap() {
        let deadline = Tick(65530) + 10;
        assert_eq!(deadline, Tick(4));
        assert!(!deadline.is_due(Tick(65535)));
        assert!(!deadline.is_due(Tick(3)));
        assert!(deadline.is_due(Tick(4)));
        assert!(deadline.is_due(Tick(200)));
    }

    #[test]
    fn test_overflow_calibration() {
        let clock = Clock::with_calibration(4);
        for _ in 0..3 {
            clock.on_overflow();
        }
        assert_eq!(clock.read_timer(), Tick(0));
        clock.on_overflow();
        assert_eq!(clock.read_timer(), Tick(1));
        for _ in 0..8 {
            clock.on_overflow();
        }
        assert_eq!(clock.read_timer(), Tick(3));
    }

    #[test]
    fn test_timeout_poll_budget_without_clock() {
        let clock = Clock::new();
        let mut timeout = Timeout::new(&clock, 10, 3);
        assert!(!timeout.expired());
        assert!(!timeout.expired());
        assert!(!timeout.expired());
        assert!(timeout.expired());
    }

    #[test]
    fn test_timeout_tick_budget() {
        let clock = Clock::new();
        let mut timeout = Timeout::new(&clock, 10, u32::MAX);
        clock.advance(9);
        assert!(!timeout.expired());
        clock.advance(1);
        assert!(timeout.expired());
    }

    #[test]
    fn test_counter_wraps_silently() {
        let clock = Clock::new();
        clock.set(Tick(u16::MAX));
        clock.on_overflow();
        assert_eq!(clock.read_timer(), Tick(0));
        assert_eq!(clock.read_timer().since(Tick(u16::MAX)), 1);
    }
}
