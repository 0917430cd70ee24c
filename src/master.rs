//! Round-robin bus master. One [`Poller::service`] call performs one bus step
//! (a start, one byte, or a stop), so a transfer spans many scheduler passes
//! and never blocks the node.

use crate::clock::{Tick, MAX_TICK_DISTANCE};
use crate::error::ConfigError;
use heapless::{String, Vec};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_DEVICES: usize = 4;
pub const MAX_PAYLOAD: usize = 16;

pub const TWI_ID_MOTOR: u8 = 0x01;
pub const TWI_ID_COUNTERS: u8 = 0x02;
pub const TWI_ID_SERVOS: u8 = 0x03;
pub const TWI_BIT_WRITE: u8 = 0x00;
pub const TWI_BIT_READ: u8 = 0x01;

pub type Payload = Vec<u8, MAX_PAYLOAD>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TwiError {
    #[error("bus fault during start condition")]
    BusFault,
    #[error("timed out capturing the bus")]
    BusCaptureTimeout,
    #[error("slave did not respond in time")]
    SlaveResponseTimeout,
    #[error("slave not ready")]
    SlaveNotReady,
    #[error("slave did not acknowledge")]
    SlaveNak,
    #[error("device phase exceeded its tick budget")]
    PhaseTimeout,
}

/// Byte-level master peripheral.
pub trait TwiMaster {
    /// (Re)initialise the peripheral, releasing a wedged bus.
    fn init(&mut self);
    /// Issue a start condition and the address byte. Gives up after `timeout_ms`.
    fn start_transmission(&mut self, address_rw: u8, timeout_ms: u8) -> Result<(), TwiError>;
    fn send_byte(&mut self, byte: u8) -> Result<(), TwiError>;
    /// Read one byte, answering NACK instead of ACK when `last` is set.
    fn receive_byte(&mut self, last: bool) -> Result<u8, TwiError>;
    fn stop_transmission(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Write,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String<16>,
    pub address: u8,
    pub direction: Direction,
    pub len: u8,
    pub start_timeout_ms: u8,
}

impl DeviceConfig {
    pub fn new(name: &str, address: u8, direction: Direction, len: u8, start_timeout_ms: u8) -> Self {
        let mut label = String::new();
        for c in name.chars() {
            if label.push(c).is_err() {
                break;
            }
        }
        Self { name: label, address, direction, len, start_timeout_ms }
    }

    pub fn address_byte(&self) -> u8 {
        let rw = match self.direction {
            Direction::Write => TWI_BIT_WRITE,
            Direction::Read => TWI_BIT_READ,
        };
        (self.address << 1) | rw
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address > 0x7F {
            return Err(ConfigError::BadAddress(self.address));
        }
        if usize::from(self.len) > MAX_PAYLOAD {
            return Err(ConfigError::PayloadTooLarge {
                address: self.address,
                len: usize::from(self.len),
                max: MAX_PAYLOAD,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub devices: Vec<DeviceConfig, MAX_DEVICES>,
    /// Ticks the bus error indicator stays raised before the peripheral is reinitialised.
    pub hold_off_ticks: u16,
    /// Ticks one device phase may take from start to stop.
    pub phase_budget_ticks: u16,
}

impl PollerConfig {
    /// Motor board (write speeds), counter board (read encoder counts), servo board (write pulse times).
    pub fn mp2() -> Self {
        let mut devices = Vec::new();
        let _ = devices.push(DeviceConfig::new("motor", TWI_ID_MOTOR, Direction::Write, 2, 2));
        let _ = devices.push(DeviceConfig::new("counters", TWI_ID_COUNTERS, Direction::Read, 8, 2));
        let _ = devices.push(DeviceConfig::new("servos", TWI_ID_SERVOS, Direction::Write, 8, 5));
        Self { devices, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, device) in self.devices.iter().enumerate() {
            device.validate()?;
            if self.devices[..index].iter().any(|earlier| earlier.address == device.address) {
                return Err(ConfigError::DuplicateAddress(device.address));
            }
        }
        check_tick_distance("poller.hold_off_ticks", self.hold_off_ticks)?;
        check_tick_distance("poller.phase_budget_ticks", self.phase_budget_ticks)
    }
}

/// Tick spans compared with [`Tick::is_due`] or [`Tick::since`] only hold up to
/// half the counter range.
pub(crate) fn check_tick_distance(field: &'static str, value: u16) -> Result<(), ConfigError> {
    if value > MAX_TICK_DISTANCE {
        return Err(ConfigError::TickDistance { field, value, max: MAX_TICK_DISTANCE });
    }
    Ok(())
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            hold_off_ticks: 1000,
            phase_budget_ticks: 50,
        }
    }
}

/// Where the poller is in its cycle. Device indices follow `PollerConfig::devices`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollState {
    Idle,
    Started(usize),
    Ended(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerStats {
    pub cycles: u32,
    pub completed_phases: u32,
    pub aborted_phases: u32,
    pub reinits: u32,
}

#[derive(Debug, Clone)]
struct DeviceSlot {
    config: DeviceConfig,
    outgoing: Payload,
    latest: Option<Payload>,
    stale_since: Option<Tick>,
    last_success: Option<Tick>,
}

#[derive(Debug)]
pub struct Poller<M: TwiMaster> {
    master: M,
    devices: Vec<DeviceSlot, MAX_DEVICES>,
    state: PollState,
    buf: Payload,
    count: u8,
    phase_started: Tick,
    error_until: Option<Tick>,
    reinit_pending: bool,
    hold_off_ticks: u16,
    phase_budget_ticks: u16,
    stats: PollerStats,
}

impl<M: TwiMaster> Poller<M> {
    pub fn new(master: M, config: PollerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let devices = config
            .devices
            .into_iter()
            .map(|device| {
                let mut outgoing = Payload::new();
                let _ = outgoing.resize(usize::from(device.len), 0);
                DeviceSlot { config: device, outgoing, latest: None, stale_since: None, last_success: None }
            })
            .collect();

        Ok(Self {
            master,
            devices,
            state: PollState::Idle,
            buf: Payload::new(),
            count: 0,
            phase_started: Tick::ZERO,
            error_until: None,
            reinit_pending: false,
            hold_off_ticks: config.hold_off_ticks,
            phase_budget_ticks: config.phase_budget_ticks,
            stats: PollerStats::default(),
        })
    }

    /// Advance the polling state machine by one bus operation.
    pub fn service(&mut self, now: Tick) {
        match self.state {
            PollState::Idle => {
                if !self.devices.is_empty() {
                    self.begin(0, now);
                }
            }
            PollState::Ended(index) if index + 1 < self.devices.len() => self.begin(index + 1, now),
            PollState::Ended(_) => {
                self.stats.cycles = self.stats.cycles.wrapping_add(1);
                self.state = PollState::Idle;
            }
            PollState::Started(index) => self.transfer(index, now),
        }
    }

    fn begin(&mut self, index: usize, now: Tick) {
        let device = &self.devices[index];
        let address_byte = device.config.address_byte();

        if let Err(error) = self.master.start_transmission(address_byte, device.config.start_timeout_ms) {
            self.abort(index, now, error, false);
            return;
        }

        self.buf.clear();
        if device.config.direction == Direction::Write {
            self.buf.clone_from(&device.outgoing);
        }
        self.count = 0;
        self.phase_started = now;
        self.state = PollState::Started(index);
    }

    fn transfer(&mut self, index: usize, now: Tick) {
        if now.since(self.phase_started) > self.phase_budget_ticks {
            self.abort(index, now, TwiError::PhaseTimeout, true);
            return;
        }

        let len = self.devices[index].config.len;
        if self.count == len {
            self.master.stop_transmission();
            self.finish(index, now);
            return;
        }

        let result = match self.devices[index].config.direction {
            Direction::Write => {
                let byte = self.buf.get(usize::from(self.count)).copied().unwrap_or(0);
                self.master.send_byte(byte)
            }
            Direction::Read => {
                let last = self.count + 1 == len;
                self.master
                    .receive_byte(last)
                    .map(|byte| {
                        let _ = self.buf.push(byte);
                    })
            }
        };

        match result {
            Ok(()) => self.count += 1,
            Err(error) => self.abort(index, now, error, true),
        }
    }

    fn finish(&mut self, index: usize, now: Tick) {
        let device = &mut self.devices[index];
        device.latest = Some(self.buf.clone());
        device.stale_since = None;
        device.last_success = Some(now);
        self.stats.completed_phases = self.stats.completed_phases.wrapping_add(1);
        debug!(device = %device.config.name, bytes = self.buf.len(), "bus phase complete");
        self.state = PollState::Ended(index);
    }

    fn abort(&mut self, index: usize, now: Tick, error: TwiError, mid_transfer: bool) {
        if mid_transfer {
            self.master.stop_transmission();
        }
        let device = &mut self.devices[index];
        device.stale_since.get_or_insert(now);
        self.stats.aborted_phases = self.stats.aborted_phases.wrapping_add(1);
        warn!(device = %device.config.name, address = device.config.address, %error, "bus phase aborted");

        // The hold-off runs from the first error, so a bus that keeps failing still gets reinitialised.
        if self.error_until.is_none() {
            self.error_until = Some(now + self.hold_off_ticks);
        }
        self.reinit_pending = true;
        self.state = PollState::Ended(index);
    }

    /// Drop the bus error indicator once its hold-off has passed and
    /// reinitialise the peripheral. Waits for the current phase to end.
    pub fn check_recovery(&mut self, now: Tick) {
        let Some(until) = self.error_until else {
            return;
        };
        if !until.is_due(now) || matches!(self.state, PollState::Started(_)) {
            return;
        }
        self.error_until = None;
        if self.reinit_pending {
            self.reinit_pending = false;
            self.master.init();
            self.stats.reinits = self.stats.reinits.wrapping_add(1);
            warn!("bus peripheral reinitialised");
        }
    }

    pub fn bus_error_active(&self) -> bool {
        self.error_until.is_some()
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn find_device(&self, address: u8) -> Option<usize> {
        self.devices.iter().position(|device| device.config.address == address)
    }

    pub fn device_config(&self, index: usize) -> Option<&DeviceConfig> {
        self.devices.get(index).map(|device| &device.config)
    }

    /// Payload of the last phase that completed for this device.
    pub fn latest(&self, index: usize) -> Option<&[u8]> {
        self.devices.get(index)?.latest.as_deref()
    }

    /// Tick of the first abort since the device last completed a phase.
    pub fn stale_since(&self, index: usize) -> Option<Tick> {
        self.devices.get(index)?.stale_since
    }

    pub fn last_success(&self, index: usize) -> Option<Tick> {
        self.devices.get(index)?.last_success
    }

    /// Set the bytes written to a write device on its next phase. Extra bytes
    /// are ignored, missing ones are zero.
    pub fn set_outgoing(&mut self, index: usize, bytes: &[u8]) {
        if let Some(device) = self.devices.get_mut(index) {
            let len = usize::from(device.config.len);
            device.outgoing.clear();
            let _ = device.outgoing.extend_from_slice(&bytes[..bytes.len().min(len)]);
            let _ = device.outgoing.resize(len, 0);
        }
    }

    pub fn get_stats(&self) -> &PollerStats {
        &self.stats
    }

    pub fn master(&self) -> &M {
        &self.master
    }

    pub fn master_mut(&mut self) -> &mut M {
        &mut self.master
    }
}
