use crate::clock::Tick;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fault code category, stored in the high nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FaultCategory {
    Misc = 0x00,
    Serial = 0x10,
    Twi = 0x20,
    Hardware = 0x30,
    Timer = 0x40,
    Adc = 0x50,
    Ui = 0x60,
}

/// Fault code kind, stored in the low nibble. It is also the blink count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FaultKind {
    TooBig = 0x1,
    BadParam = 0x2,
    BadCall = 0x3,
    Busy = 0x4,
    Unexpected = 0x5,
    Reuse = 0x6,
    Timeout = 0x7,
}

pub const fn fault_code(category: FaultCategory, kind: FaultKind) -> u8 {
    category as u8 | kind as u8
}

pub const FATAL_OUT_OF_TASKS: u8 = fault_code(FaultCategory::Timer, FaultKind::TooBig);
pub const FATAL_TOO_LONG_DELAY: u8 = fault_code(FaultCategory::Timer, FaultKind::BadParam);
pub const FATAL_TASK_OVERRUN: u8 = fault_code(FaultCategory::Timer, FaultKind::Timeout);
pub const FATAL_TWI_UNEXPECTED: u8 = fault_code(FaultCategory::Twi, FaultKind::Unexpected);
pub const FATAL_BAD_ARGS: u8 = fault_code(FaultCategory::Misc, FaultKind::BadParam);

/// Conditions that end task execution on a node. None of them are recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Fault {
    #[error("task table exhausted ({capacity} slots)")]
    OutOfTasks { capacity: usize },
    #[error("delay of {delay} ticks exceeds limit {limit}")]
    DelayTooLong { delay: u16, limit: u16 },
    #[error("task overran its budget (started {started}, finished {finished})")]
    TaskOverrun { started: Tick, finished: Tick },
    #[error("unrecoverable bus protocol error")]
    BusProtocol,
    #[error("bad arguments")]
    BadArgs,
}

impl Fault {
    pub fn code(&self) -> u8 {
        match self {
            Fault::OutOfTasks { .. } => FATAL_OUT_OF_TASKS,
            Fault::DelayTooLong { .. } => FATAL_TOO_LONG_DELAY,
            Fault::TaskOverrun { .. } => FATAL_TASK_OVERRUN,
            Fault::BusProtocol => FATAL_TWI_UNEXPECTED,
            Fault::BadArgs => FATAL_BAD_ARGS,
        }
    }

    pub fn report(&self) -> FaultReport {
        let aux = match *self {
            Fault::OutOfTasks { capacity } => [capacity as u16, 0],
            Fault::DelayTooLong { delay, limit } => [delay, limit],
            Fault::TaskOverrun { started, finished } => [started.0, finished.0],
            Fault::BusProtocol | Fault::BadArgs => [0, 0],
        };
        FaultReport { code: self.code(), aux }
    }
}

/// Sync byte and frame length preceding the fault code on the diagnostic serial line.
pub const FAULT_FRAME_SYNC: u8 = 0xED;
pub const FAULT_FRAME_LEN: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultReport {
    pub code: u8,
    pub aux: [u16; 2],
}

impl FaultReport {
    pub fn serial_frame(&self) -> [u8; 4] {
        [FAULT_FRAME_SYNC, FAULT_FRAME_LEN, b'F', self.code]
    }

    /// Number of pulses per blink cycle.
    pub fn pulses(&self) -> u8 {
        self.code & 0x0F
    }
}

/// One step of the diagnostic blink loop, measured in blink units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkStep {
    pub on: bool,
    pub units: u8,
}

const PULSE_ON_UNITS: u8 = 1;
const PULSE_OFF_UNITS: u8 = 2;
const CYCLE_GAP_UNITS: u8 = 8;

/// Endless blink sequence: `code & 0xF` pulses, then a long gap.
#[derive(Debug, Clone)]
pub struct BlinkPattern {
    pulses: u8,
    index: u8,
}

impl BlinkPattern {
    pub fn new(report: &FaultReport) -> Self {
        Self { pulses: report.pulses(), index: 0 }
    }
}

impl Iterator for BlinkPattern {
    type Item = BlinkStep;

    fn next(&mut self) -> Option<BlinkStep> {
        let steps_per_cycle = self.pulses * 2 + 1;
        let position = self.index % steps_per_cycle;
        self.index = (position + 1) % steps_per_cycle;

        let step = if position == self.pulses * 2 {
            BlinkStep { on: false, units: CYCLE_GAP_UNITS }
        } else if position % 2 == 0 {
            BlinkStep { on: true, units: PULSE_ON_UNITS }
        } else {
            BlinkStep { on: false, units: PULSE_OFF_UNITS }
        };
        Some(step)
    }
}

/// What a node does once it has faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultMode {
    /// Spin silently until the hardware watchdog resets the chip.
    WatchdogReset,
    /// Blink the diagnostic output forever, one unit lasting `unit_ms`.
    Blink { unit_ms: u32 },
}

impl Default for FaultMode {
    fn default() -> Self {
        FaultMode::Blink { unit_ms: 120 }
    }
}

/// Terminal state for a node. Owns the diagnostic pin and the busy-wait delay
/// because nothing else may run once it is entered.
pub struct FaultHandler<P: OutputPin, D: DelayNs> {
    mode: FaultMode,
    indicator: P,
    delay: D,
    last_report: Option<FaultReport>,
}

impl<P: OutputPin, D: DelayNs> FaultHandler<P, D> {
    pub fn new(mode: FaultMode, indicator: P, delay: D) -> Self {
        Self { mode, indicator, delay, last_report: None }
    }

    pub fn mode(&self) -> FaultMode {
        self.mode
    }

    pub fn last_report(&self) -> Option<FaultReport> {
        self.last_report
    }

    /// Record the fault and drive one full blink cycle. Returns the report.
    ///
    /// `fatal` repeats this forever; it is split out so a single cycle can be observed.
    pub fn signal_once(&mut self, fault: &Fault) -> FaultReport {
        let report = fault.report();
        self.last_report = Some(report);

        if let FaultMode::Blink { unit_ms } = self.mode {
            let steps = usize::from(report.pulses()) * 2 + 1;
            for step in BlinkPattern::new(&report).take(steps) {
                self.drive(step, unit_ms);
            }
        }
        report
    }

    /// Stop task execution for good. Interrupts are masked first so no
    /// handler touches bus or clock state after the halt.
    pub fn fatal(mut self, fault: Fault) -> ! {
        mask_interrupts();
        let report = fault.report();
        tracing::error!(
            code = report.code,
            aux0 = report.aux[0],
            aux1 = report.aux[1],
            frame = ?report.serial_frame(),
            "fatal: {}",
            fault
        );
        self.last_report = Some(report);

        match self.mode {
            FaultMode::WatchdogReset => loop {
                core::hint::spin_loop();
            },
            FaultMode::Blink { unit_ms } => {
                for step in BlinkPattern::new(&report) {
                    self.drive(step, unit_ms);
                }
                // BlinkPattern never ends.
                loop {
                    core::hint::spin_loop();
                }
            }
        }
    }

    fn drive(&mut self, step: BlinkStep, unit_ms: u32) {
        // A pin error cannot be reported from here; keep blinking regardless.
        let _ = if step.on { self.indicator.set_high() } else { self.indicator.set_low() };
        self.delay.delay_ms(unit_ms * u32::from(step.units));
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
fn mask_interrupts() {
    cortex_m::interrupt::disable();
}

/// Hosted builds have no interrupt handlers to mask.
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn mask_interrupts() {}
