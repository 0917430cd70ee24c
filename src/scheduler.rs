use crate::clock::{Clock, Tick, MAX_TICK_DISTANCE};
use crate::fault::{Fault, FaultHandler};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TASK_SLOTS: usize = 16;
pub const DEFAULT_MAX_TASK_TICKS: u16 = 100;

/// Deferred call. Receives the scheduler (to re-arm itself), the node context
/// and the argument it was armed with.
pub type Callback<'c, C, A, const N: usize> =
    fn(&mut Scheduler<'c, C, A, N>, &mut C, A) -> Result<(), Fault>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Longest delay `after` accepts. Anything above half the tick range
    /// would look already due to the signed comparison.
    pub max_delay: u16,
    /// Longest a single callback may run before the node faults. `None` disables the check.
    pub max_task_ticks: Option<u16>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_delay: MAX_TICK_DISTANCE,
            max_task_ticks: Some(DEFAULT_MAX_TASK_TICKS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_scheduled: u32,
    pub total_executed: u32,
    pub currently_scheduled: u8,
    pub longest_task_ticks: u16,
}

pub struct TaskRecord<'c, C, A, const N: usize> {
    pub deadline: Tick,
    pub callback: Callback<'c, C, A, N>,
    pub arg: A,
}

/// Fixed table of deferred calls, run from the main loop by [`Scheduler::schedule`].
///
/// An empty slot is an inactive record. Slots are scanned in index order, so
/// two records due at the same tick fire in slot order.
pub struct Scheduler<'c, C, A, const N: usize = DEFAULT_TASK_SLOTS> {
    clock: &'c Clock,
    slots: [Option<TaskRecord<'c, C, A, N>>; N],
    config: SchedulerConfig,
    stats: SchedulerStats,
}

impl<'c, C, A, const N: usize> Scheduler<'c, C, A, N> {
    pub fn new(clock: &'c Clock) -> Self {
        Self::with_config(clock, SchedulerConfig::default())
    }

    pub fn with_config(clock: &'c Clock, config: SchedulerConfig) -> Self {
        Self {
            clock,
            slots: core::array::from_fn(|_| None),
            config,
            stats: SchedulerStats::default(),
        }
    }

    pub fn now(&self) -> Tick {
        self.clock.read_timer()
    }

    pub fn clock(&self) -> &'c Clock {
        self.clock
    }

    /// Arm `callback` to run once `deadline` is reached.
    pub fn at(&mut self, deadline: Tick, callback: Callback<'c, C, A, N>, arg: A) -> Result<(), Fault> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(Fault::OutOfTasks { capacity: N })?;

        *slot = Some(TaskRecord { deadline, callback, arg });

        self.stats.total_scheduled = self.stats.total_scheduled.wrapping_add(1);
        self.stats.currently_scheduled = self.pending() as u8;
        Ok(())
    }

    /// Arm `callback` to run `delay` ticks from now.
    pub fn after(&mut self, delay: u16, callback: Callback<'c, C, A, N>, arg: A) -> Result<(), Fault> {
        let limit = self.config.max_delay.min(MAX_TICK_DISTANCE);
        if delay > limit {
            return Err(Fault::DelayTooLong { delay, limit });
        }
        let deadline = self.now() + delay;
        self.at(deadline, callback, arg)
    }

    /// One pass over the table. Every record that is due at the start of its
    /// turn is deactivated and then invoked; records armed during this pass
    /// wait for the next one. Returns how many callbacks ran.
    pub fn schedule(&mut self, ctx: &mut C) -> Result<usize, Fault> {
        let mut now = self.now();
        let mut ran = 0;

        let armed: Vec<usize, N> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|_| index))
            .collect();

        for index in armed {
            let due = matches!(&self.slots[index], Some(record) if record.deadline.is_due(now));
            if !due {
                continue;
            }
            let Some(record) = self.slots[index].take() else {
                continue;
            };
            self.stats.currently_scheduled = self.pending() as u8;

            (record.callback)(self, ctx, record.arg)?;

            let finished = self.now();
            let took = finished.since(now);
            self.stats.total_executed = self.stats.total_executed.wrapping_add(1);
            self.stats.longest_task_ticks = self.stats.longest_task_ticks.max(took);

            if let Some(limit) = self.config.max_task_ticks {
                if took > limit {
                    return Err(Fault::TaskOverrun { started: now, finished });
                }
            }
            now = finished;
            ran += 1;
        }

        Ok(ran)
    }

    /// Main loop. Only returns by way of the fault handler, which never returns.
    pub fn run_forever<P: OutputPin, D: DelayNs>(&mut self, ctx: &mut C, handler: FaultHandler<P, D>) -> ! {
        loop {
            if let Err(fault) = self.schedule(ctx) {
                handler.fatal(fault);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Earliest pending deadline relative to now, if any.
    pub fn next_deadline(&self) -> Option<Tick> {
        let now = self.now();
        self.slots
            .iter()
            .flatten()
            .map(|record| record.deadline)
            .min_by_key(|deadline| deadline.since(now) as i16)
    }

    pub fn get_stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

impl<'c, C, A, const N: usize> core::fmt::Debug for Scheduler<'c, C, A, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .field("capacity", &N)
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}
