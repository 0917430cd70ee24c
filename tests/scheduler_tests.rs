use std::cell::RefCell;
use std::rc::Rc;
use twinode::fault::{BlinkPattern, BlinkStep, FATAL_OUT_OF_TASKS, FATAL_TASK_OVERRUN, FATAL_TOO_LONG_DELAY};
use twinode::*;

type Log = Vec<(u8, Tick)>;
type Sched<'c, const N: usize> = Scheduler<'c, Log, u8, N>;

fn record<const N: usize>(sched: &mut Sched<'_, N>, log: &mut Log, id: u8) -> Result<(), Fault> {
    log.push((id, sched.now()));
    Ok(())
}

fn every_ten<const N: usize>(sched: &mut Sched<'_, N>, log: &mut Log, id: u8) -> Result<(), Fault> {
    log.push((id, sched.now()));
    sched.after(10, every_ten::<N>, id)
}

fn slow<const N: usize>(sched: &mut Sched<'_, N>, log: &mut Log, id: u8) -> Result<(), Fault> {
    sched.clock().advance(150);
    log.push((id, sched.now()));
    Ok(())
}

#[test]
fn test_four_slot_scenario_fires_in_slot_order() {
    let clock = Clock::new();
    let mut sched: Sched<'_, 4> = Scheduler::new(&clock);
    let mut log = Log::new();

    for (id, deadline) in [(1, 10), (2, 10), (3, 20), (4, 5)] {
        sched.at(Tick(deadline), record::<4>, id).unwrap();
    }
    assert_eq!(sched.at(Tick(1), record::<4>, 5), Err(Fault::OutOfTasks { capacity: 4 }));

    clock.set(Tick(25));
    assert_eq!(sched.schedule(&mut log).unwrap(), 4);
    let order: Vec<u8> = log.iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec![1, 2, 3, 4]);
    assert_eq!(sched.pending(), 0);
    assert_eq!(sched.schedule(&mut log).unwrap(), 0);
}

#[test]
fn test_periodic_task_across_counter_wrap() {
    let clock = Clock::new();
    clock.set(Tick(u16::MAX - 25));
    let mut sched: Sched<'_, 2> = Scheduler::new(&clock);
    let mut log = Log::new();
    sched.after(0, every_ten::<2>, 7).unwrap();

    for _ in 0..60 {
        sched.schedule(&mut log).unwrap();
        clock.on_overflow();
    }

    let ticks: Vec<u16> = log.iter().map(|(_, tick)| tick.0).collect();
    assert_eq!(ticks, vec![65510, 65520, 65530, 4, 14, 24]);
    assert_eq!(sched.get_stats().total_executed, 6);
}

#[test]
fn test_fatal_conditions_carry_codes() {
    let clock = Clock::new();
    let mut sched: Sched<'_, 1> = Scheduler::new(&clock);
    let mut log = Log::new();

    let too_long = sched.after(40_000, record::<1>, 0).unwrap_err();
    assert_eq!(too_long.code(), FATAL_TOO_LONG_DELAY);

    sched.after(0, slow::<1>, 1).unwrap();
    let full = sched.after(0, record::<1>, 2).unwrap_err();
    assert_eq!(full.code(), FATAL_OUT_OF_TASKS);

    let overrun = sched.schedule(&mut log).unwrap_err();
    assert_eq!(overrun.code(), FATAL_TASK_OVERRUN);
    assert_eq!(overrun.report().aux, [0, 150]);
    assert_eq!(overrun.report().serial_frame(), [0xED, 0x02, b'F', 0x47]);
}

#[test]
fn test_overrun_check_can_be_disabled() {
    let clock = Clock::new();
    let config = SchedulerConfig { max_task_ticks: None, ..SchedulerConfig::default() };
    let mut sched: Sched<'_, 2> = Scheduler::with_config(&clock, config);
    let mut log = Log::new();

    sched.after(0, slow::<2>, 1).unwrap();
    assert_eq!(sched.schedule(&mut log).unwrap(), 1);
    assert_eq!(sched.get_stats().longest_task_ticks, 150);
}

#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Vec<&'static str>>>);

struct Pin(Recorder);

impl embedded_hal::digital::ErrorType for Pin {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::OutputPin for Pin {
    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0 .0.borrow_mut().push("on");
        Ok(())
    }
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0 .0.borrow_mut().push("off");
        Ok(())
    }
}

struct Delay(Recorder);

impl embedded_hal::delay::DelayNs for Delay {
    fn delay_ns(&mut self, _ns: u32) {
        self.0 .0.borrow_mut().push("wait");
    }
}

#[test]
fn test_blink_pattern_for_delay_fault() {
    let report = Fault::DelayTooLong { delay: 40_000, limit: 32_767 }.report();
    let steps: Vec<BlinkStep> = BlinkPattern::new(&report).take(5).collect();
    assert_eq!(
        steps,
        vec![
            BlinkStep { on: true, units: 1 },
            BlinkStep { on: false, units: 2 },
            BlinkStep { on: true, units: 1 },
            BlinkStep { on: false, units: 2 },
            BlinkStep { on: false, units: 8 },
        ]
    );
}

#[test]
fn test_watchdog_mode_signals_without_blinking() {
    let recorder = Recorder::default();
    let mut handler = FaultHandler::new(FaultMode::WatchdogReset, Pin(recorder.clone()), Delay(recorder.clone()));
    let report = handler.signal_once(&Fault::OutOfTasks { capacity: 16 });
    assert_eq!(report.code, 0x41);
    assert_eq!(report.aux, [16, 0]);
    assert_eq!(handler.last_report(), Some(report));
    assert!(recorder.0.borrow().is_empty());
}

#[test]
fn test_blink_mode_drives_one_cycle() {
    let recorder = Recorder::default();
    let mut handler =
        FaultHandler::new(FaultMode::Blink { unit_ms: 1 }, Pin(recorder.clone()), Delay(recorder.clone()));
    handler.signal_once(&Fault::DelayTooLong { delay: 1, limit: 0 });
    assert_eq!(
        *recorder.0.borrow(),
        vec!["on", "wait", "off", "wait", "on", "wait", "off", "wait", "off", "wait"]
    );
}
