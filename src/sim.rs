//! Host-side stand-ins for the bus hardware.
//!
//! [`SimBus`] implements [`TwiMaster`] by replaying every bus event into the
//! interrupt entry points of the attached [`BusSlave`]s, bit phase by bit
//! phase, the way the USI counter would raise them.

use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::error::SimError;
use crate::fault::Fault;
use crate::master::{Poller, TwiError, TwiMaster};
use crate::node::{Brain, Satellite, SatelliteRole};
use crate::scheduler::Scheduler;
use crate::slave::{BusSlave, UsiAction, UsiPort, READ_BIT};
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

/// Shift-register and line state of one simulated USI peripheral.
#[derive(Debug, Clone, Default)]
pub struct SimUsi {
    pub data: u8,
    pub start_in_progress: bool,
    pub sda_high: bool,
    pub last_action: Option<UsiAction>,
}

impl SimUsi {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UsiPort for SimUsi {
    fn data(&self) -> u8 {
        self.data
    }

    fn start_in_progress(&self) -> bool {
        self.start_in_progress
    }

    fn sda_high(&self) -> bool {
        self.sda_high
    }

    fn apply(&mut self, action: UsiAction) {
        self.last_action = Some(action);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimBusStats {
    pub starts: u32,
    pub address_naks: u32,
    pub bytes_written: u32,
    pub bytes_read: u32,
    pub inits: u32,
}

struct Attached<'a> {
    slave: &'a BusSlave,
    port: SimUsi,
    responsive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Write(usize),
    /// The byte the slave has placed on the bus, if any.
    Read(usize, Option<u8>),
}

/// Simulated master peripheral and bus wiring.
pub struct SimBus<'a> {
    devices: Vec<Attached<'a>>,
    transfer: Option<Transfer>,
    wedged: bool,
    stats: SimBusStats,
}

impl<'a> SimBus<'a> {
    pub fn new() -> Self {
        Self { devices: Vec::new(), transfer: None, wedged: false, stats: SimBusStats::default() }
    }

    pub fn attach(&mut self, slave: &'a BusSlave) {
        self.devices.push(Attached { slave, port: SimUsi::new(), responsive: true });
    }

    /// Disconnect (or reconnect) every slave answering to `address`. A
    /// disconnected slave sees no bus events.
    pub fn set_responsive(&mut self, address: u8, responsive: bool) {
        for device in self.devices.iter_mut().filter(|device| device.slave.address() == address) {
            device.responsive = responsive;
        }
    }

    /// Hold the bus so that no start condition can be captured until the
    /// peripheral is reinitialised.
    pub fn wedge(&mut self) {
        self.wedged = true;
    }

    pub fn is_wedged(&self) -> bool {
        self.wedged
    }

    pub fn get_stats(&self) -> &SimBusStats {
        &self.stats
    }

    fn overflow(&mut self, index: usize, data: u8) -> Option<UsiAction> {
        let device = &mut self.devices[index];
        device.port.data = data;
        device.port.last_action = None;
        device.slave.on_overflow(&mut device.port);
        device.port.last_action
    }
}

impl Default for SimBus<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for SimBus<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimBus")
            .field("devices", &self.devices.len())
            .field("transfer", &self.transfer)
            .field("wedged", &self.wedged)
            .field("stats", &self.stats)
            .finish()
    }
}

impl TwiMaster for SimBus<'_> {
    fn init(&mut self) {
        self.wedged = false;
        self.transfer = None;
        self.stats.inits = self.stats.inits.wrapping_add(1);
    }

    fn start_transmission(&mut self, address_rw: u8, _timeout_ms: u8) -> Result<(), TwiError> {
        self.transfer = None;
        if self.wedged {
            return Err(TwiError::BusCaptureTimeout);
        }
        self.stats.starts = self.stats.starts.wrapping_add(1);

        let mut acked = None;
        for index in 0..self.devices.len() {
            let device = &mut self.devices[index];
            if !device.responsive {
                continue;
            }
            device.port.start_in_progress = false;
            device.port.sda_high = false;
            device.slave.on_start(&mut device.port);
            if device.port.last_action != Some(UsiAction::ReceiveAddress) {
                continue;
            }
            if self.overflow(index, address_rw) == Some(UsiAction::SendAck) && acked.is_none() {
                acked = Some(index);
            }
        }

        let Some(index) = acked else {
            self.stats.address_naks = self.stats.address_naks.wrapping_add(1);
            trace!(address_rw, "address not acknowledged");
            return Err(TwiError::SlaveNak);
        };

        // The acknowledge bit itself ends with one more counter overflow.
        let next = self.overflow(index, 0);
        self.transfer = Some(if address_rw & READ_BIT != 0 {
            match next {
                Some(UsiAction::SendData(byte)) => Transfer::Read(index, Some(byte)),
                _ => Transfer::Read(index, None),
            }
        } else {
            Transfer::Write(index)
        });
        Ok(())
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), TwiError> {
        let Some(Transfer::Write(index)) = self.transfer else {
            return Err(TwiError::SlaveNotReady);
        };
        if self.overflow(index, byte) != Some(UsiAction::SendAck) {
            self.transfer = None;
            return Err(TwiError::SlaveNak);
        }
        self.stats.bytes_written = self.stats.bytes_written.wrapping_add(1);
        self.overflow(index, 0);
        Ok(())
    }

    fn receive_byte(&mut self, last: bool) -> Result<u8, TwiError> {
        let Some(Transfer::Read(index, on_bus)) = self.transfer else {
            return Err(TwiError::SlaveNotReady);
        };
        // A slave that has stopped driving SDA reads as all ones.
        let byte = on_bus.unwrap_or(0xFF);
        self.stats.bytes_read = self.stats.bytes_read.wrapping_add(1);

        let mut next = None;
        if on_bus.is_some() && self.overflow(index, byte) == Some(UsiAction::ReadAck) {
            let reply = if last { 0x01 } else { 0x00 };
            if let Some(UsiAction::SendData(following)) = self.overflow(index, reply) {
                next = Some(following);
            }
        }
        self.transfer = Some(Transfer::Read(index, next));
        Ok(byte)
    }

    fn stop_transmission(&mut self) {
        self.transfer = None;
        if self.wedged {
            return;
        }
        for device in self.devices.iter_mut().filter(|device| device.responsive) {
            device.slave.on_stop(&mut device.port);
        }
    }
}

/// The three MP2 satellite slaves. Kept apart from [`Mp2Rig`] so that they
/// outlive the bus that borrows them.
#[derive(Debug)]
pub struct Mp2Slaves {
    pub motor: BusSlave,
    pub counters: BusSlave,
    pub servos: BusSlave,
}

impl Mp2Slaves {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            motor: BusSlave::new(config.slave_for(SatelliteRole::Motor.mp2_address())),
            counters: BusSlave::new(config.slave_for(SatelliteRole::Counters.mp2_address())),
            servos: BusSlave::new(config.slave_for(SatelliteRole::Servos.mp2_address())),
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&BusSlave, SatelliteRole)> {
        [
            (&self.motor, SatelliteRole::Motor),
            (&self.counters, SatelliteRole::Counters),
            (&self.servos, SatelliteRole::Servos),
        ]
        .into_iter()
    }
}

pub type SimBrain<'a> = Brain<SimBus<'a>>;
pub type SimSatellite<'a> = Satellite<'a, SimUsi>;

/// A brain and its satellites on one simulated bus, each with its own scheduler.
pub struct Mp2Rig<'a> {
    clock: &'a Clock,
    brain: SimBrain<'a>,
    brain_tasks: Scheduler<'a, SimBrain<'a>, ()>,
    satellites: Vec<(SimSatellite<'a>, Scheduler<'a, SimSatellite<'a>, ()>)>,
}

impl<'a> Mp2Rig<'a> {
    pub fn new(clock: &'a Clock, slaves: &'a Mp2Slaves, config: &NodeConfig) -> Result<Self, SimError> {
        config.validate()?;
        let now = clock.read_timer();

        let mut bus = SimBus::new();
        let mut satellites = Vec::new();
        for (slave, role) in slaves.iter() {
            bus.attach(slave);
            let mut tasks: Scheduler<'a, SimSatellite<'a>, ()> = Scheduler::with_config(clock, config.scheduler);
            SimSatellite::arm(&mut tasks)?;
            satellites.push((Satellite::new(slave, SimUsi::new(), role, now), tasks));
        }

        let poller = Poller::new(bus, config.poller.clone())?;
        let brain = Brain::new(poller, config.report_interval);
        let mut brain_tasks: Scheduler<'a, SimBrain<'a>, ()> = Scheduler::with_config(clock, config.scheduler);
        SimBrain::arm(&mut brain_tasks)?;

        info!(satellites = satellites.len(), "rig ready");
        Ok(Self { clock, brain, brain_tasks, satellites })
    }

    /// One scheduler pass on every node, satellites first.
    pub fn run_pass(&mut self) -> Result<usize, Fault> {
        let mut ran = 0;
        for (satellite, tasks) in &mut self.satellites {
            ran += tasks.schedule(satellite)?;
        }
        ran += self.brain_tasks.schedule(&mut self.brain)?;
        Ok(ran)
    }

    /// Advance the clock one tick and run a pass.
    pub fn tick(&mut self) -> Result<usize, Fault> {
        self.clock.advance(1);
        self.run_pass()
    }

    pub fn run_ticks(&mut self, ticks: u32) -> Result<(), Fault> {
        for _ in 0..ticks {
            self.tick()?;
        }
        Ok(())
    }

    pub fn clock(&self) -> &'a Clock {
        self.clock
    }

    pub fn brain(&self) -> &SimBrain<'a> {
        &self.brain
    }

    pub fn brain_mut(&mut self) -> &mut SimBrain<'a> {
        &mut self.brain
    }

    pub fn bus_mut(&mut self) -> &mut SimBus<'a> {
        self.brain.poller_mut().master_mut()
    }

    pub fn satellite(&self, role: SatelliteRole) -> Option<&SimSatellite<'a>> {
        self.satellites.iter().map(|(satellite, _)| satellite).find(|satellite| satellite.role() == role)
    }

    pub fn satellite_mut(&mut self, role: SatelliteRole) -> Option<&mut SimSatellite<'a>> {
        self.satellites
            .iter_mut()
            .map(|(satellite, _)| satellite)
            .find(|satellite| satellite.role() == role)
    }
}

impl core::fmt::Debug for Mp2Rig<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mp2Rig")
            .field("now", &self.clock.read_timer())
            .field("brain", &self.brain)
            .field("satellites", &self.satellites.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::{SlaveConfig, SlaveState};

    #[test]
    fn test_write_reaches_addressed_slave_only() {
        let a = BusSlave::new(SlaveConfig::new(0x01));
        let b = BusSlave::new(SlaveConfig::new(0x02));
        let mut bus = SimBus::new();
        bus.attach(&a);
        bus.attach(&b);

        bus.start_transmission(0x01 << 1, 2).unwrap();
        bus.send_byte(0x11).unwrap();
        bus.send_byte(0x22).unwrap();
        bus.stop_transmission();

        assert_eq!(a.rx_len(), 2);
        assert_eq!(a.try_receive_byte().ok(), Some(0x11));
        assert_eq!(a.try_receive_byte().ok(), Some(0x22));
        assert!(!b.bytes_pending());
        assert_eq!(a.state(), SlaveState::GetDataAndSendAck);
        assert_eq!(a.stats().completed_writes, 1);
        assert_eq!(b.stats().completed_writes, 0);
    }

    #[test]
    fn test_mp2_slaves_debug_lists_each_board() {
        let slaves = Mp2Slaves::new(&NodeConfig::default());
        let text = format!("{slaves:?}");
        assert!(text.contains("motor: BusSlave { address: 1"));
        assert!(text.contains("servos: BusSlave { address: 3"));
    }

    #[test]
    fn test_stop_closes_each_write_separately() {
        let slave = BusSlave::new(SlaveConfig::new(0x01));
        let mut bus = SimBus::new();
        bus.attach(&slave);

        for frame in [&[0xA0][..], &[0xA0, 0x60]] {
            bus.start_transmission(0x01 << 1, 2).unwrap();
            for &byte in frame {
                bus.send_byte(byte).unwrap();
            }
            bus.stop_transmission();
        }

        let mut buf = [0u8; 4];
        assert_eq!(slave.take_write(&mut buf), Some(1));
        assert_eq!(slave.take_write(&mut buf), Some(2));
        assert_eq!(&buf[..2], &[0xA0, 0x60]);
        assert_eq!(slave.take_write(&mut buf), None);
    }

    #[test]
    fn test_read_streams_tx_buffer() {
        let slave = BusSlave::new(SlaveConfig::new(0x02));
        slave.load_reply(&[1, 2, 3]);
        let mut bus = SimBus::new();
        bus.attach(&slave);

        bus.start_transmission((0x02 << 1) | READ_BIT, 2).unwrap();
        assert_eq!(bus.receive_byte(false), Ok(1));
        assert_eq!(bus.receive_byte(false), Ok(2));
        assert_eq!(bus.receive_byte(true), Ok(3));
        bus.stop_transmission();

        assert!(slave.tx_empty());
        assert_eq!(slave.stats().bytes_sent, 3);
    }

    #[test]
    fn test_read_past_buffer_returns_released_line() {
        let slave = BusSlave::new(SlaveConfig::new(0x02));
        slave.load_reply(&[7]);
        let mut bus = SimBus::new();
        bus.attach(&slave);

        bus.start_transmission((0x02 << 1) | READ_BIT, 2).unwrap();
        assert_eq!(bus.receive_byte(false), Ok(7));
        assert_eq!(bus.receive_byte(true), Ok(0xFF));
    }

    #[test]
    fn test_empty_reply_declines_read() {
        let slave = BusSlave::new(SlaveConfig::new(0x02));
        let mut bus = SimBus::new();
        bus.attach(&slave);

        assert_eq!(bus.start_transmission((0x02 << 1) | READ_BIT, 2), Err(TwiError::SlaveNak));
        assert_eq!(slave.stats().declined_reads, 1);
        assert_eq!(bus.get_stats().address_naks, 1);
    }

    #[test]
    fn test_unresponsive_device_naks() {
        let slave = BusSlave::new(SlaveConfig::new(0x03));
        let mut bus = SimBus::new();
        bus.attach(&slave);
        bus.set_responsive(0x03, false);

        assert_eq!(bus.start_transmission(0x03 << 1, 5), Err(TwiError::SlaveNak));
        assert_eq!(bus.send_byte(0), Err(TwiError::SlaveNotReady));

        bus.set_responsive(0x03, true);
        assert_eq!(bus.start_transmission(0x03 << 1, 5), Ok(()));
    }

    #[test]
    fn test_wedged_bus_needs_init() {
        let slave = BusSlave::new(SlaveConfig::new(0x01));
        let mut bus = SimBus::new();
        bus.attach(&slave);
        bus.wedge();

        assert_eq!(bus.start_transmission(0x02, 2), Err(TwiError::BusCaptureTimeout));
        bus.init();
        assert!(!bus.is_wedged());
        assert_eq!(bus.start_transmission(0x02, 2), Ok(()));
        assert_eq!(bus.get_stats().inits, 1);
    }
}
