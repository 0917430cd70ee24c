//! Two-wire slave driven from the USI start-condition and counter-overflow
//! interrupts.
//!
//! [`SlaveEngine`] is the protocol state machine with one entry point per
//! interrupt; each returns the [`UsiAction`] the shift hardware has to perform
//! next. [`BusSlave`] wraps an engine in an interrupt-safe cell and adds the
//! task-side byte API.

use crate::clock::{Clock, Tick, Timeout};
use crate::error::BusError;
use crate::ring::RingBuffer;
use core::cell::RefCell;
use critical_section::Mutex;
use heapless::{Deque, Vec};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

pub const DEFAULT_TX_BUFFER_SIZE: usize = 16;
pub const DEFAULT_RX_BUFFER_SIZE: usize = 16;

const_assert!(DEFAULT_TX_BUFFER_SIZE.is_power_of_two());
const_assert!(DEFAULT_RX_BUFFER_SIZE.is_power_of_two());

/// Address byte value that every slave answers to.
pub const GENERAL_CALL: u8 = 0x00;
pub const READ_BIT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlaveState {
    CheckAddress,
    SendData,
    RequestReplyFromSendData,
    CheckReplyFromSendData,
    RequestData,
    GetDataAndSendAck,
}

/// Next configuration of the shift register and data line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsiAction {
    /// Release SDA, disable the overflow interrupt, wait for the next start condition.
    AwaitStart,
    /// Start condition complete: sample the 8 address bits, hold SCL on overflow.
    ReceiveAddress,
    /// Pull SDA low for one bit.
    SendAck,
    /// Release SDA and sample the master's one-bit reply.
    ReadAck,
    /// Shift this byte out on SDA.
    SendData(u8),
    /// Release SDA and sample 8 data bits.
    ReadData,
}

/// The USI peripheral as seen from the two interrupt handlers.
pub trait UsiPort {
    /// Shift register contents after the counter overflowed.
    fn data(&self) -> u8;
    /// SCL high and SDA low: the master has not finished the start condition.
    fn start_in_progress(&self) -> bool;
    fn sda_high(&self) -> bool;
    /// Reprogram the shift hardware and release SCL.
    fn apply(&mut self, action: UsiAction);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveStats {
    /// Addressed transfers this slave acknowledged.
    pub transactions: u32,
    pub bytes_sent: u32,
    pub bytes_received: u32,
    /// Reads addressed to us while the transmit buffer was empty.
    pub declined_reads: u32,
    /// Received bytes lost to a full receive buffer.
    pub dropped_bytes: u32,
    /// Start conditions that turned out to be stops or timed out settling.
    pub aborted_starts: u32,
    /// Write transfers closed by a stop or a repeated start.
    pub completed_writes: u32,
}

#[derive(Debug, Clone)]
pub struct SlaveEngine<const TX: usize = DEFAULT_TX_BUFFER_SIZE, const RX: usize = DEFAULT_RX_BUFFER_SIZE> {
    address: u8,
    state: SlaveState,
    listening: bool,
    tx: RingBuffer<TX>,
    rx: RingBuffer<RX>,
    /// Bytes stored so far by the write transfer in progress, if any.
    open_write: Option<u8>,
    /// Lengths of closed write transfers whose bytes are still in `rx`.
    writes: Deque<u8, RX>,
    /// Served in full at every read address match when non-empty.
    reply: Vec<u8, TX>,
    stats: SlaveStats,
}

impl<const TX: usize, const RX: usize> SlaveEngine<TX, RX> {
    pub const fn new(address: u8) -> Self {
        Self {
            address,
            state: SlaveState::CheckAddress,
            listening: false,
            tx: RingBuffer::new(),
            rx: RingBuffer::new(),
            open_write: None,
            writes: Deque::new(),
            reply: Vec::new(),
            stats: SlaveStats {
                transactions: 0,
                bytes_sent: 0,
                bytes_received: 0,
                declined_reads: 0,
                dropped_bytes: 0,
                aborted_starts: 0,
                completed_writes: 0,
            },
        }
    }

    /// Take a new address and flush both buffers.
    pub fn reset(&mut self, address: u8) {
        self.address = address;
        self.state = SlaveState::CheckAddress;
        self.listening = false;
        self.tx.clear();
        self.rx.clear();
        self.open_write = None;
        self.writes.clear();
        self.reply.clear();
    }

    /// Start-condition interrupt. `settled` is false when the wait for SCL to
    /// drop timed out or the condition turned out to be a stop.
    pub fn start_condition(&mut self, settled: bool) -> UsiAction {
        self.close_write();
        self.state = SlaveState::CheckAddress;
        if settled {
            self.listening = true;
            UsiAction::ReceiveAddress
        } else {
            self.stats.aborted_starts = self.stats.aborted_starts.wrapping_add(1);
            self.end_transfer()
        }
    }

    /// Stop condition seen on the bus.
    pub fn stop_condition(&mut self) -> UsiAction {
        self.close_write();
        self.end_transfer()
    }

    /// Counter-overflow interrupt with the shift register contents.
    pub fn shift_complete(&mut self, data: u8) -> UsiAction {
        if !self.listening {
            return UsiAction::AwaitStart;
        }

        match self.state {
            SlaveState::CheckAddress => {
                if data != GENERAL_CALL && data >> 1 != self.address {
                    return self.end_transfer();
                }
                if data & READ_BIT != 0 {
                    self.refill_reply();
                    if self.tx.is_empty() {
                        // Nothing to send: leave the address unacknowledged.
                        self.stats.declined_reads = self.stats.declined_reads.wrapping_add(1);
                        return self.end_transfer();
                    }
                    self.state = SlaveState::SendData;
                } else {
                    self.open_write = Some(0);
                    self.state = SlaveState::RequestData;
                }
                self.stats.transactions = self.stats.transactions.wrapping_add(1);
                UsiAction::SendAck
            }
            SlaveState::CheckReplyFromSendData => {
                if data != 0 {
                    // NACK: the master wants no more.
                    return self.end_transfer();
                }
                self.send_next()
            }
            SlaveState::SendData => self.send_next(),
            SlaveState::RequestReplyFromSendData => {
                self.state = SlaveState::CheckReplyFromSendData;
                UsiAction::ReadAck
            }
            SlaveState::RequestData => {
                self.state = SlaveState::GetDataAndSendAck;
                UsiAction::ReadData
            }
            SlaveState::GetDataAndSendAck => {
                if self.rx.push(data).is_ok() {
                    self.stats.bytes_received = self.stats.bytes_received.wrapping_add(1);
                    if let Some(len) = self.open_write.as_mut() {
                        *len = len.wrapping_add(1);
                    }
                } else {
                    self.stats.dropped_bytes = self.stats.dropped_bytes.wrapping_add(1);
                }
                self.state = SlaveState::RequestData;
                UsiAction::SendAck
            }
        }
    }

    fn send_next(&mut self) -> UsiAction {
        match self.tx.pop() {
            Some(byte) => {
                self.stats.bytes_sent = self.stats.bytes_sent.wrapping_add(1);
                self.state = SlaveState::RequestReplyFromSendData;
                UsiAction::SendData(byte)
            }
            None => self.end_transfer(),
        }
    }

    fn refill_reply(&mut self) {
        if self.reply.is_empty() {
            return;
        }
        self.tx.clear();
        for &byte in &self.reply {
            if self.tx.push(byte).is_err() {
                break;
            }
        }
    }

    /// Record the length of the write transfer in progress. Empty writes
    /// leave no record.
    fn close_write(&mut self) {
        let Some(len) = self.open_write.take() else {
            return;
        };
        if len == 0 {
            return;
        }
        if self.writes.is_full() {
            self.writes.pop_front();
        }
        let _ = self.writes.push_back(len);
        self.stats.completed_writes = self.stats.completed_writes.wrapping_add(1);
    }

    /// Pop the oldest closed write transfer into `buf`. Returns the transfer
    /// length; bytes beyond `buf.len()` are discarded.
    pub fn take_write(&mut self, buf: &mut [u8]) -> Option<usize> {
        let len = usize::from(self.writes.pop_front()?);
        let mut taken = 0;
        while taken < len {
            let Some(byte) = self.rx.pop() else {
                break;
            };
            if let Some(slot) = buf.get_mut(taken) {
                *slot = byte;
            }
            taken += 1;
        }
        Some(taken)
    }

    /// Keep `bytes` as the reply for every following read. An empty slice
    /// goes back to one-shot replies.
    pub fn set_reply(&mut self, bytes: &[u8]) {
        self.reply.clear();
        let _ = self.reply.extend_from_slice(&bytes[..bytes.len().min(TX)]);
        self.refill_reply();
    }

    fn end_transfer(&mut self) -> UsiAction {
        self.listening = false;
        UsiAction::AwaitStart
    }

    pub fn state(&self) -> SlaveState {
        self.state
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// True between an accepted start condition and the end of the transfer.
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn tx(&mut self) -> &mut RingBuffer<TX> {
        &mut self.tx
    }

    pub fn rx(&mut self) -> &mut RingBuffer<RX> {
        &mut self.rx
    }

    pub fn stats(&self) -> &SlaveStats {
        &self.stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    pub address: u8,
    /// Polls of the bus lines allowed while a start condition settles.
    pub start_settle_polls: u16,
    /// Ticks `transmit_byte`/`receive_byte` wait for space or data.
    pub wait_ticks: u16,
    /// Hard cap on buffer polls, independent of the clock.
    pub wait_polls: u32,
    /// Ticks without an acknowledged transfer before the slave is re-initialised.
    pub idle_timeout: u16,
}

impl SlaveConfig {
    pub const fn new(address: u8) -> Self {
        Self {
            address,
            start_settle_polls: 10_000,
            wait_ticks: 10,
            wait_polls: 10_000,
            idle_timeout: 1000,
        }
    }
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self::new(0x7F)
    }
}

/// Slave engine shared between the two USI interrupts and task code.
pub struct BusSlave<const TX: usize = DEFAULT_TX_BUFFER_SIZE, const RX: usize = DEFAULT_RX_BUFFER_SIZE> {
    engine: Mutex<RefCell<SlaveEngine<TX, RX>>>,
    config: SlaveConfig,
}

impl<const TX: usize, const RX: usize> BusSlave<TX, RX> {
    pub const fn new(config: SlaveConfig) -> Self {
        Self {
            engine: Mutex::new(RefCell::new(SlaveEngine::new(config.address))),
            config,
        }
    }

    pub fn config(&self) -> &SlaveConfig {
        &self.config
    }

    fn with_engine<R>(&self, f: impl FnOnce(&mut SlaveEngine<TX, RX>) -> R) -> R {
        critical_section::with(|cs| f(&mut *self.engine.borrow_ref_mut(cs)))
    }

    /// Flush buffers, take `address` and put the port into await-start mode.
    pub fn slave_init<P: UsiPort>(&self, address: u8, port: &mut P) {
        self.with_engine(|engine| engine.reset(address));
        port.apply(UsiAction::AwaitStart);
    }

    /// Start-condition interrupt entry.
    pub fn on_start<P: UsiPort>(&self, port: &mut P) {
        let mut polls = self.config.start_settle_polls;
        let mut settled = true;
        while port.start_in_progress() {
            if polls == 0 {
                settled = false;
                break;
            }
            polls -= 1;
        }
        if port.sda_high() {
            settled = false;
        }
        let action = self.with_engine(|engine| engine.start_condition(settled));
        port.apply(action);
    }

    /// Stop-condition entry, raised from the stop flag.
    pub fn on_stop<P: UsiPort>(&self, port: &mut P) {
        let action = self.with_engine(|engine| engine.stop_condition());
        port.apply(action);
    }

    /// Counter-overflow interrupt entry.
    pub fn on_overflow<P: UsiPort>(&self, port: &mut P) {
        let data = port.data();
        let action = self.with_engine(|engine| engine.shift_complete(data));
        port.apply(action);
    }

    pub fn try_transmit_byte(&self, byte: u8) -> nb::Result<(), BusError> {
        self.with_engine(|engine| engine.tx().push(byte)).map_err(|_| nb::Error::WouldBlock)
    }

    pub fn try_receive_byte(&self) -> nb::Result<u8, BusError> {
        self.with_engine(|engine| engine.rx().pop()).ok_or(nb::Error::WouldBlock)
    }

    /// Queue a byte for the next master read, waiting a bounded time for space.
    pub fn transmit_byte(&self, byte: u8, clock: &Clock) -> Result<(), BusError> {
        let mut timeout = Timeout::new(clock, self.config.wait_ticks, self.config.wait_polls);
        loop {
            match self.try_transmit_byte(byte) {
                Ok(()) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e),
                Err(nb::Error::WouldBlock) if timeout.expired() => return Err(BusError::Timeout),
                Err(nb::Error::WouldBlock) => core::hint::spin_loop(),
            }
        }
    }

    /// Take the oldest byte written by the master, waiting a bounded time for one.
    pub fn receive_byte(&self, clock: &Clock) -> Result<u8, BusError> {
        let mut timeout = Timeout::new(clock, self.config.wait_ticks, self.config.wait_polls);
        loop {
            match self.try_receive_byte() {
                Ok(byte) => return Ok(byte),
                Err(nb::Error::Other(e)) => return Err(e),
                Err(nb::Error::WouldBlock) if timeout.expired() => return Err(BusError::Timeout),
                Err(nb::Error::WouldBlock) => core::hint::spin_loop(),
            }
        }
    }

    /// Replace whatever is waiting to be read with `bytes`, for the next read
    /// only. Returns how many fit.
    pub fn load_reply(&self, bytes: &[u8]) -> usize {
        self.with_engine(|engine| {
            engine.reply.clear();
            let tx = engine.tx();
            tx.clear();
            bytes.iter().take_while(|&&byte| tx.push(byte).is_ok()).count()
        })
    }

    /// Serve `bytes` from the start at every read until replaced.
    pub fn set_reply(&self, bytes: &[u8]) {
        self.with_engine(|engine| engine.set_reply(bytes));
    }

    /// Oldest complete write transfer, see [`SlaveEngine::take_write`]. Do not
    /// mix with [`BusSlave::receive_byte`] on the same slave.
    pub fn take_write(&self, buf: &mut [u8]) -> Option<usize> {
        self.with_engine(|engine| engine.take_write(buf))
    }

    /// Data from the master is waiting in the receive buffer.
    pub fn bytes_pending(&self) -> bool {
        self.with_engine(|engine| !engine.rx().is_empty())
    }

    pub fn rx_len(&self) -> usize {
        self.with_engine(|engine| engine.rx().len())
    }

    pub fn tx_empty(&self) -> bool {
        self.with_engine(|engine| engine.tx().is_empty())
    }

    pub fn state(&self) -> SlaveState {
        self.with_engine(|engine| engine.state())
    }

    pub fn address(&self) -> u8 {
        self.with_engine(|engine| engine.address())
    }

    pub fn stats(&self) -> SlaveStats {
        self.with_engine(|engine| engine.stats().clone())
    }
}

impl<const TX: usize, const RX: usize> core::fmt::Debug for BusSlave<TX, RX> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BusSlave")
            .field("address", &self.address())
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Re-initialises a slave that has gone quiet, on the assumption that its
/// USI got wedged mid-transfer.
#[derive(Debug, Clone)]
pub struct SlaveWatchdog {
    idle_timeout: u16,
    last_transactions: u32,
    last_activity: Tick,
}

impl SlaveWatchdog {
    pub fn new(idle_timeout: u16, now: Tick) -> Self {
        Self { idle_timeout, last_transactions: 0, last_activity: now }
    }

    /// True when no transfer has been acknowledged for `idle_timeout` ticks.
    /// The idle period restarts either way.
    pub fn check(&mut self, now: Tick, transactions: u32) -> bool {
        if transactions != self.last_transactions {
            self.last_transactions = transactions;
            self.last_activity = now;
            return false;
        }
        if now.since(self.last_activity) > self.idle_timeout {
            self.last_activity = now;
            return true;
        }
        false
    }
}
