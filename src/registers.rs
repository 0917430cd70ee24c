use serde::{Deserialize, Serialize};

/// Motor power byte that means "stopped".
pub const MOTOR_STOP: u8 = 0x80;

/// Values exchanged between the host link and the bus poller. Both sides run
/// as cooperative tasks, so neither observes a half-written update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedRegisters {
    pub motor_power: [u8; 2],
    pub counter_values: [u16; 4],
    pub servo_times: [u16; 4],
}

impl SharedRegisters {
    pub const fn new() -> Self {
        Self {
            motor_power: [MOTOR_STOP; 2],
            counter_values: [0; 4],
            servo_times: [0; 4],
        }
    }

    pub fn motor_bytes(&self) -> [u8; 2] {
        self.motor_power
    }

    pub fn servo_bytes(&self) -> [u8; 8] {
        words_to_le(&self.servo_times)
    }

    pub fn counter_bytes(&self) -> [u8; 8] {
        words_to_le(&self.counter_values)
    }

    /// Missing trailing bytes leave the corresponding registers untouched.
    pub fn set_motor_bytes(&mut self, bytes: &[u8]) {
        for (slot, byte) in self.motor_power.iter_mut().zip(bytes) {
            *slot = *byte;
        }
    }

    pub fn set_servo_bytes(&mut self, bytes: &[u8]) {
        le_to_words(bytes, &mut self.servo_times);
    }

    pub fn set_counter_bytes(&mut self, bytes: &[u8]) {
        le_to_words(bytes, &mut self.counter_values);
    }

    pub fn stop_motors(&mut self) {
        self.motor_power = [MOTOR_STOP; 2];
    }
}

impl Default for SharedRegisters {
    fn default() -> Self {
        Self::new()
    }
}

fn words_to_le(words: &[u16; 4]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (chunk, word) in out.chunks_exact_mut(2).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

fn le_to_words(bytes: &[u8], words: &mut [u16; 4]) {
    for (word, pair) in words.iter_mut().zip(bytes.chunks_exact(2)) {
        *word = u16::from_le_bytes([pair[0], pair[1]]);
    }
}
