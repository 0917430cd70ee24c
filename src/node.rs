//! Scheduled tasks that make up the two kinds of node.
//!
//! The brain owns the bus master: it decodes host frames into the shared
//! registers, polls the satellites and reports counter values back. A
//! satellite owns a bus slave and plays one role on the bus.

use crate::clock::Tick;
use crate::error::HostLinkError;
use crate::fault::Fault;
use crate::hostlink::{decode_frame, encode_counter_report, Frame, Report};
use crate::master::{Poller, TwiMaster, TWI_ID_COUNTERS, TWI_ID_MOTOR, TWI_ID_SERVOS};
use crate::registers::SharedRegisters;
use crate::scheduler::Scheduler;
use crate::slave::{BusSlave, SlaveWatchdog, UsiPort, DEFAULT_RX_BUFFER_SIZE};
use heapless::Deque;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const HOST_QUEUE_DEPTH: usize = 4;
pub const DEFAULT_REPORT_INTERVAL: u16 = 20;
pub const CHECK_BUS_INTERVAL: u16 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrainStats {
    pub frames_received: u32,
    pub commands_applied: u32,
    pub frame_errors: u32,
    pub reports_queued: u32,
    pub reports_dropped: u32,
}

pub struct Brain<M: TwiMaster> {
    registers: SharedRegisters,
    poller: Poller<M>,
    inbox: Deque<Frame, HOST_QUEUE_DEPTH>,
    outbox: Deque<Report, HOST_QUEUE_DEPTH>,
    last_seq: u8,
    beep_until: Option<Tick>,
    report_interval: u16,
    last_report: Tick,
    motor: Option<usize>,
    counters: Option<usize>,
    servos: Option<usize>,
    stats: BrainStats,
}

impl<M: TwiMaster> Brain<M> {
    pub fn new(poller: Poller<M>, report_interval: u16) -> Self {
        let motor = poller.find_device(TWI_ID_MOTOR);
        let counters = poller.find_device(TWI_ID_COUNTERS);
        let servos = poller.find_device(TWI_ID_SERVOS);
        Self {
            registers: SharedRegisters::new(),
            poller,
            inbox: Deque::new(),
            outbox: Deque::new(),
            last_seq: 0,
            beep_until: None,
            report_interval,
            last_report: Tick::ZERO,
            motor,
            counters,
            servos,
            stats: BrainStats::default(),
        }
    }

    /// Arm the bus and host tasks.
    pub fn arm<const N: usize>(sched: &mut Scheduler<'_, Self, (), N>) -> Result<(), Fault> {
        sched.after(0, poll_bus::<M, N>, ())?;
        sched.after(0, service_host::<M, N>, ())
    }

    /// Queue an inbound host frame for the next host service pass.
    pub fn push_host_frame(&mut self, bytes: &[u8]) -> Result<(), HostLinkError> {
        if bytes.is_empty() {
            return Err(HostLinkError::EmptyFrame);
        }
        let mut frame = Frame::new();
        frame
            .try_extend_from_slice(bytes)
            .map_err(|_| HostLinkError::FrameTooLarge(bytes.len()))?;
        self.inbox.push_back(frame).map_err(|_| HostLinkError::InboxFull)
    }

    /// Oldest counter report not yet collected by the host.
    pub fn take_report(&mut self) -> Option<Report> {
        self.outbox.pop_front()
    }

    /// Move register values into the poller, take one bus step, and copy back
    /// whatever the counter board returned.
    pub fn step_bus(&mut self, now: Tick) {
        if let Some(index) = self.motor {
            self.poller.set_outgoing(index, &self.registers.motor_bytes());
        }
        if let Some(index) = self.servos {
            self.poller.set_outgoing(index, &self.registers.servo_bytes());
        }

        self.poller.service(now);
        self.poller.check_recovery(now);

        if let Some(latest) = self.counters.and_then(|index| self.poller.latest(index)) {
            self.registers.set_counter_bytes(latest);
        }
    }

    pub fn service_host(&mut self, now: Tick) {
        while let Some(frame) = self.inbox.pop_front() {
            self.dispatch(&frame, now);
        }

        if self.beep_until.is_some_and(|until| until.is_due(now)) {
            self.beep_until = None;
            debug!(%now, "beep off");
        }

        if now.since(self.last_report) > self.report_interval {
            self.last_report = now;
            let report = encode_counter_report(self.last_seq, &self.registers);
            if let Err(report) = self.outbox.push_back(report) {
                self.outbox.pop_front();
                self.stats.reports_dropped = self.stats.reports_dropped.wrapping_add(1);
                let _ = self.outbox.push_back(report);
            }
            self.stats.reports_queued = self.stats.reports_queued.wrapping_add(1);
        }
    }

    fn dispatch(&mut self, frame: &[u8], now: Tick) {
        self.stats.frames_received = self.stats.frames_received.wrapping_add(1);
        let decoded = match decode_frame(frame) {
            Ok(decoded) => decoded,
            Err(error) => {
                self.stats.frame_errors = self.stats.frame_errors.wrapping_add(1);
                warn!(%error, "host frame rejected");
                return;
            }
        };

        self.last_seq = decoded.seq;
        for command in &decoded.commands {
            if let Some(ms) = command.apply(&mut self.registers) {
                self.beep_until = (ms != 0).then(|| now + u16::from(ms));
            }
            self.stats.commands_applied = self.stats.commands_applied.wrapping_add(1);
        }
        if let Some(error) = decoded.error {
            self.stats.frame_errors = self.stats.frame_errors.wrapping_add(1);
            warn!(seq = decoded.seq, %error, "host frame truncated");
        }
    }

    pub fn registers(&self) -> &SharedRegisters {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut SharedRegisters {
        &mut self.registers
    }

    pub fn poller(&self) -> &Poller<M> {
        &self.poller
    }

    pub fn poller_mut(&mut self) -> &mut Poller<M> {
        &mut self.poller
    }

    pub fn is_beeping(&self) -> bool {
        self.beep_until.is_some()
    }

    pub fn last_seq(&self) -> u8 {
        self.last_seq
    }

    pub fn get_stats(&self) -> &BrainStats {
        &self.stats
    }
}

impl<M: TwiMaster> core::fmt::Debug for Brain<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Brain")
            .field("registers", &self.registers)
            .field("poll_state", &self.poller.state())
            .field("inbox", &self.inbox.len())
            .field("outbox", &self.outbox.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// One poller step per scheduler pass.
pub fn poll_bus<M: TwiMaster, const N: usize>(
    sched: &mut Scheduler<'_, Brain<M>, (), N>,
    brain: &mut Brain<M>,
    _: (),
) -> Result<(), Fault> {
    brain.step_bus(sched.now());
    sched.after(0, poll_bus::<M, N>, ())
}

pub fn service_host<M: TwiMaster, const N: usize>(
    sched: &mut Scheduler<'_, Brain<M>, (), N>,
    brain: &mut Brain<M>,
    _: (),
) -> Result<(), Fault> {
    brain.service_host(sched.now());
    sched.after(1, service_host::<M, N>, ())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SatelliteRole {
    /// Receives two motor power bytes.
    Motor,
    /// Answers reads with four little-endian counter words.
    Counters,
    /// Receives four little-endian servo pulse times.
    Servos,
}

impl SatelliteRole {
    pub fn frame_len(self) -> usize {
        match self {
            SatelliteRole::Motor => 2,
            SatelliteRole::Counters | SatelliteRole::Servos => 8,
        }
    }

    pub fn mp2_address(self) -> u8 {
        match self {
            SatelliteRole::Motor => TWI_ID_MOTOR,
            SatelliteRole::Counters => TWI_ID_COUNTERS,
            SatelliteRole::Servos => TWI_ID_SERVOS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteStats {
    pub frames_applied: u32,
    /// Writes too short for the role's frame, e.g. cut off by the master.
    pub short_frames: u32,
    pub replies_loaded: u32,
    pub reinits: u32,
}

pub struct Satellite<'a, P: UsiPort> {
    slave: &'a BusSlave,
    port: P,
    role: SatelliteRole,
    watchdog: SlaveWatchdog,
    /// Counter values currently standing as the read reply.
    served: Option<[u16; 4]>,
    registers: SharedRegisters,
    stats: SatelliteStats,
}

impl<'a, P: UsiPort> Satellite<'a, P> {
    pub fn new(slave: &'a BusSlave, mut port: P, role: SatelliteRole, now: Tick) -> Self {
        let config = *slave.config();
        slave.slave_init(config.address, &mut port);
        Self {
            slave,
            port,
            role,
            watchdog: SlaveWatchdog::new(config.idle_timeout, now),
            served: None,
            registers: SharedRegisters::new(),
            stats: SatelliteStats::default(),
        }
    }

    pub fn arm<const N: usize>(sched: &mut Scheduler<'_, Self, (), N>) -> Result<(), Fault> {
        sched.after(0, service_slave::<P, N>, ())?;
        sched.after(CHECK_BUS_INTERVAL, check_bus::<P, N>, ())
    }

    /// Apply completed writes or update the standing reply, depending on the role.
    pub fn service(&mut self) {
        match self.role {
            SatelliteRole::Counters => {
                let counters = self.registers.counter_values;
                if self.served != Some(counters) {
                    self.slave.set_reply(&self.registers.counter_bytes());
                    self.served = Some(counters);
                    self.stats.replies_loaded = self.stats.replies_loaded.wrapping_add(1);
                }
            }
            SatelliteRole::Motor | SatelliteRole::Servos => {
                let mut buf = [0u8; DEFAULT_RX_BUFFER_SIZE];
                while let Some(len) = self.slave.take_write(&mut buf) {
                    let need = self.role.frame_len();
                    if len < need {
                        debug!(address = self.slave.address(), len, need, "short write ignored");
                        self.stats.short_frames = self.stats.short_frames.wrapping_add(1);
                        continue;
                    }
                    self.apply_frame(&buf[..need]);
                }
            }
        }
    }

    fn apply_frame(&mut self, frame: &[u8]) {
        match self.role {
            SatelliteRole::Motor => self.registers.set_motor_bytes(frame),
            SatelliteRole::Servos => self.registers.set_servo_bytes(frame),
            SatelliteRole::Counters => {}
        }
        self.stats.frames_applied = self.stats.frames_applied.wrapping_add(1);
    }

    /// Re-initialise the slave when the master has gone quiet for too long.
    /// Returns whether it did.
    pub fn check_bus(&mut self, now: Tick) -> bool {
        if !self.watchdog.check(now, self.slave.stats().transactions) {
            return false;
        }
        warn!(address = self.slave.address(), %now, "bus idle, re-initialising slave");
        self.slave.slave_init(self.slave.config().address, &mut self.port);
        self.served = None;
        self.stats.reinits = self.stats.reinits.wrapping_add(1);
        true
    }

    /// Counter values served to the master. Only meaningful for the counters role.
    pub fn set_counters(&mut self, values: [u16; 4]) {
        self.registers.counter_values = values;
    }

    pub fn role(&self) -> SatelliteRole {
        self.role
    }

    pub fn motor_power(&self) -> [u8; 2] {
        self.registers.motor_power
    }

    pub fn servo_times(&self) -> [u16; 4] {
        self.registers.servo_times
    }

    pub fn counters(&self) -> [u16; 4] {
        self.registers.counter_values
    }

    pub fn slave(&self) -> &'a BusSlave {
        self.slave
    }

    pub fn get_stats(&self) -> &SatelliteStats {
        &self.stats
    }
}

impl<P: UsiPort> core::fmt::Debug for Satellite<'_, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Satellite")
            .field("role", &self.role)
            .field("address", &self.slave.address())
            .field("registers", &self.registers)
            .field("stats", &self.stats)
            .finish()
    }
}

pub fn service_slave<P: UsiPort, const N: usize>(
    sched: &mut Scheduler<'_, Satellite<'_, P>, (), N>,
    satellite: &mut Satellite<'_, P>,
    _: (),
) -> Result<(), Fault> {
    satellite.service();
    sched.after(1, service_slave::<P, N>, ())
}

pub fn check_bus<P: UsiPort, const N: usize>(
    sched: &mut Scheduler<'_, Satellite<'_, P>, (), N>,
    satellite: &mut Satellite<'_, P>,
    _: (),
) -> Result<(), Fault> {
    satellite.check_bus(sched.now());
    sched.after(CHECK_BUS_INTERVAL, check_bus::<P, N>, ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::hostlink::{CMD_BEEP, CMD_MOTOR_SPEEDS, CMD_SERVO_TIMES, MAX_FRAME_SIZE, RET_COUNTER_VALUES};
    use crate::master::{PollerConfig, TwiError};
    use crate::sim::{SimBus, SimUsi};
    use crate::slave::SlaveConfig;

    /// Master that accepts everything and reads zeros.
    #[derive(Default)]
    struct NullMaster;

    impl TwiMaster for NullMaster {
        fn init(&mut self) {}
        fn start_transmission(&mut self, _: u8, _: u8) -> Result<(), TwiError> {
            Ok(())
        }
        fn send_byte(&mut self, _: u8) -> Result<(), TwiError> {
            Ok(())
        }
        fn receive_byte(&mut self, _: bool) -> Result<u8, TwiError> {
            Ok(0)
        }
        fn stop_transmission(&mut self) {}
    }

    fn brain() -> Brain<NullMaster> {
        Brain::new(Poller::new(NullMaster, PollerConfig::mp2()).unwrap(), DEFAULT_REPORT_INTERVAL)
    }

    #[test]
    fn test_host_frame_updates_registers() {
        let mut brain = brain();
        brain
            .push_host_frame(&[3, CMD_MOTOR_SPEEDS, 0xA0, 0x60, CMD_SERVO_TIMES, 0xDC, 0x05, 0, 0, 0, 0, 0, 0])
            .unwrap();
        brain.service_host(Tick(1));
        assert_eq!(brain.registers().motor_power, [0xA0, 0x60]);
        assert_eq!(brain.registers().servo_times, [1500, 0, 0, 0]);
        assert_eq!(brain.last_seq(), 3);
        assert_eq!(brain.get_stats().commands_applied, 2);
    }

    #[test]
    fn test_beep_expires() {
        let mut brain = brain();
        brain.push_host_frame(&[1, CMD_BEEP, 5]).unwrap();
        brain.service_host(Tick(10));
        assert!(brain.is_beeping());
        brain.service_host(Tick(14));
        assert!(brain.is_beeping());
        brain.service_host(Tick(15));
        assert!(!brain.is_beeping());
    }

    #[test]
    fn test_report_interval_and_overflow() {
        let mut brain = brain();
        brain.registers_mut().counter_values = [1, 2, 3, 4];
        brain.service_host(Tick(20));
        assert!(brain.take_report().is_none());
        brain.service_host(Tick(21));
        let report = brain.take_report().unwrap();
        assert_eq!(&report[..2], &[0, RET_COUNTER_VALUES]);
        assert_eq!(&report[2..4], &[1, 0]);

        // Nobody collects: the oldest report is dropped.
        for step in 1..=(HOST_QUEUE_DEPTH as u16 + 1) {
            brain.service_host(Tick(21 + step * 21));
        }
        assert_eq!(brain.get_stats().reports_dropped, 1);
    }

    #[test]
    fn test_inbox_limits() {
        let mut brain = brain();
        assert_eq!(brain.push_host_frame(&[]), Err(HostLinkError::EmptyFrame));
        assert_eq!(
            brain.push_host_frame(&[0; MAX_FRAME_SIZE + 1]),
            Err(HostLinkError::FrameTooLarge(MAX_FRAME_SIZE + 1))
        );
        for _ in 0..HOST_QUEUE_DEPTH {
            brain.push_host_frame(&[0]).unwrap();
        }
        assert_eq!(brain.push_host_frame(&[0]), Err(HostLinkError::InboxFull));
    }

    #[test]
    fn test_bad_frame_is_counted() {
        let mut brain = brain();
        brain.push_host_frame(&[1, 0x21, 0]).unwrap();
        brain.service_host(Tick(1));
        assert_eq!(brain.get_stats().frame_errors, 1);
        assert_eq!(brain.registers().motor_power, [0x80, 0x80]);
    }

    #[test]
    fn test_brain_tasks_rearm() {
        let clock = Clock::new();
        let mut sched: Scheduler<'_, Brain<NullMaster>, (), 4> = Scheduler::new(&clock);
        let mut brain = brain();
        Brain::arm(&mut sched).unwrap();

        assert_eq!(sched.schedule(&mut brain).unwrap(), 2);
        assert_eq!(sched.pending(), 2);
        // Host task waits a tick, bus task runs every pass.
        assert_eq!(sched.schedule(&mut brain).unwrap(), 1);
        clock.advance(1);
        assert_eq!(sched.schedule(&mut brain).unwrap(), 2);
    }

    #[test]
    fn test_satellite_watchdog_reinit() {
        let clock = Clock::new();
        let slave = BusSlave::new(SlaveConfig { idle_timeout: 150, ..SlaveConfig::new(0x01) });
        let mut satellite = Satellite::new(&slave, SimUsi::new(), SatelliteRole::Motor, clock.read_timer());
        let mut sched: Scheduler<'_, Satellite<'_, SimUsi>, (), 4> = Scheduler::new(&clock);
        Satellite::arm(&mut sched).unwrap();

        // Checks run at ticks 100, 200 and 300; only the one at 200 sees a long enough silence.
        for _ in 0..350 {
            clock.advance(1);
            sched.schedule(&mut satellite).unwrap();
        }
        assert_eq!(satellite.get_stats().reinits, 1);
        assert_eq!(satellite.port.last_action, Some(crate::slave::UsiAction::AwaitStart));
    }

    #[test]
    fn test_counters_role_keeps_reply_loaded() {
        let slave = BusSlave::new(SlaveConfig::new(0x02));
        let mut satellite = Satellite::new(&slave, SimUsi::new(), SatelliteRole::Counters, Tick::ZERO);
        satellite.set_counters([0x0201, 0, 0, 0]);
        satellite.service();
        assert!(!slave.tx_empty());
        satellite.service();
        assert_eq!(satellite.get_stats().replies_loaded, 1);
    }

    fn write_motor(bus: &mut SimBus<'_>, bytes: &[u8]) {
        bus.start_transmission(TWI_ID_MOTOR << 1, 2).unwrap();
        for &byte in bytes {
            bus.send_byte(byte).unwrap();
        }
        bus.stop_transmission();
    }

    #[test]
    fn test_cut_off_write_does_not_shift_motor_frames() {
        let slave = BusSlave::new(SlaveConfig::new(TWI_ID_MOTOR));
        let mut satellite = Satellite::new(&slave, SimUsi::new(), SatelliteRole::Motor, Tick::ZERO);
        let mut bus = SimBus::new();
        bus.attach(&slave);

        write_motor(&mut bus, &[0xA0]);
        satellite.service();
        for _ in 0..10 {
            write_motor(&mut bus, &[0xA0, 0x60]);
            satellite.service();
        }

        assert_eq!(satellite.motor_power(), [0xA0, 0x60]);
        assert_eq!(satellite.get_stats().short_frames, 1);
        assert_eq!(satellite.get_stats().frames_applied, 10);
    }

    #[test]
    fn test_write_without_stop_is_closed_by_next_start() {
        let slave = BusSlave::new(SlaveConfig::new(TWI_ID_MOTOR));
        let mut satellite = Satellite::new(&slave, SimUsi::new(), SatelliteRole::Motor, Tick::ZERO);
        let mut bus = SimBus::new();
        bus.attach(&slave);

        // Master gives up after one byte and never sends a stop.
        bus.start_transmission(TWI_ID_MOTOR << 1, 2).unwrap();
        bus.send_byte(0x11).unwrap();
        write_motor(&mut bus, &[0x90, 0x70]);
        satellite.service();

        assert_eq!(satellite.motor_power(), [0x90, 0x70]);
        assert_eq!(satellite.get_stats().short_frames, 1);
    }

    #[test]
    fn test_counters_reply_restarts_after_short_read() {
        let slave = BusSlave::new(SlaveConfig::new(TWI_ID_COUNTERS));
        let mut satellite = Satellite::new(&slave, SimUsi::new(), SatelliteRole::Counters, Tick::ZERO);
        let mut bus = SimBus::new();
        bus.attach(&slave);
        satellite.set_counters([0x0201, 0x0403, 0x0605, 0x0807]);
        satellite.service();

        bus.start_transmission((TWI_ID_COUNTERS << 1) | 1, 2).unwrap();
        assert_eq!(bus.receive_byte(true), Ok(0x01));
        bus.stop_transmission();
        satellite.service();

        bus.start_transmission((TWI_ID_COUNTERS << 1) | 1, 2).unwrap();
        let reply: std::vec::Vec<u8> = (0..8).map(|i| bus.receive_byte(i == 7).unwrap()).collect();
        bus.stop_transmission();
        assert_eq!(reply, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
