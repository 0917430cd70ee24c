//! Host command frames.
//!
//! An inbound frame is a sequence byte followed by commands. The low three
//! bits of each command byte select its payload length from
//! [`PAYLOAD_SIZES`]; the last entry means the length travels in the next
//! byte. The outbound report echoes the last sequence byte and carries the
//! counter values.

use crate::error::HostLinkError;
use crate::registers::SharedRegisters;
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

/// Inbound command bytes after the sequence byte.
pub const MAX_IN_SIZE: usize = 32;
pub const MAX_FRAME_SIZE: usize = MAX_IN_SIZE + 1;
pub const REPORT_SIZE: usize = 10;

pub const VAR_SIZE: u8 = 0xFF;
pub const PAYLOAD_SIZES: [u8; 8] = [0, 1, 2, 4, 6, 8, 12, VAR_SIZE];

pub const CMD_BEEP: u8 = 0x10 | 0x01;
pub const CMD_MOTOR_SPEEDS: u8 = 0x10 | 0x02;
pub const CMD_SERVO_TIMES: u8 = 0x10 | 0x05;
pub const RET_COUNTER_VALUES: u8 = 0x10 | 0x08 | 0x05;

pub type Frame = ArrayVec<u8, MAX_FRAME_SIZE>;
pub type Report = ArrayVec<u8, REPORT_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostCommand {
    /// Sound the buzzer for `ms` milliseconds; zero silences it.
    Beep { ms: u8 },
    MotorSpeeds([u8; 2]),
    ServoTimes([u16; 4]),
}

impl HostCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            HostCommand::Beep { .. } => CMD_BEEP,
            HostCommand::MotorSpeeds(_) => CMD_MOTOR_SPEEDS,
            HostCommand::ServoTimes(_) => CMD_SERVO_TIMES,
        }
    }

    /// Copy register payloads into `regs`. Returns the beep duration, if any.
    pub fn apply(&self, regs: &mut SharedRegisters) -> Option<u8> {
        match *self {
            HostCommand::Beep { ms } => return Some(ms),
            HostCommand::MotorSpeeds(power) => regs.motor_power = power,
            HostCommand::ServoTimes(times) => regs.servo_times = times,
        }
        None
    }

    fn write_payload(&self, out: &mut Frame) -> Result<(), HostLinkError> {
        let servo_bytes;
        let payload: &[u8] = match self {
            HostCommand::Beep { ms } => core::slice::from_ref(ms),
            HostCommand::MotorSpeeds(power) => power,
            HostCommand::ServoTimes(times) => {
                servo_bytes = SharedRegisters { servo_times: *times, ..SharedRegisters::new() }.servo_bytes();
                &servo_bytes
            }
        };
        out.try_extend_from_slice(payload)
            .map_err(|_| HostLinkError::FrameTooLarge(MAX_FRAME_SIZE + 1))
    }
}

/// Result of decoding one inbound frame. Commands before a bad one are kept,
/// decoding stops at the first error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub seq: u8,
    pub commands: ArrayVec<HostCommand, MAX_IN_SIZE>,
    pub error: Option<HostLinkError>,
}

pub fn payload_size(command: u8) -> u8 {
    PAYLOAD_SIZES[usize::from(command & 0x07)]
}

pub fn decode_frame(frame: &[u8]) -> Result<DecodedFrame, HostLinkError> {
    let (&seq, body) = frame.split_first().ok_or(HostLinkError::EmptyFrame)?;
    if body.len() > MAX_IN_SIZE {
        return Err(HostLinkError::FrameTooLarge(frame.len()));
    }

    let mut decoded = DecodedFrame { seq, commands: ArrayVec::new(), error: None };
    let mut offset = 0;
    while offset < body.len() {
        match decode_command(body, &mut offset) {
            Ok(command) => {
                // Each command occupies at least one byte, so this cannot overflow.
                let _ = decoded.commands.try_push(command);
            }
            Err(error) => {
                decoded.error = Some(error);
                break;
            }
        }
    }
    Ok(decoded)
}

fn decode_command(body: &[u8], offset: &mut usize) -> Result<HostCommand, HostLinkError> {
    let command = body[*offset];
    *offset += 1;

    let mut size = payload_size(command);
    if size == VAR_SIZE {
        size = *body.get(*offset).ok_or(HostLinkError::MissingData { command, needed: 1, available: 0 })?;
        *offset += 1;
    }

    let available = body.len() - *offset;
    if available < usize::from(size) {
        return Err(HostLinkError::MissingData { command, needed: size, available: available as u8 });
    }
    let payload = &body[*offset..*offset + usize::from(size)];
    *offset += usize::from(size);

    match command {
        CMD_BEEP => Ok(HostCommand::Beep { ms: payload[0] }),
        CMD_MOTOR_SPEEDS => Ok(HostCommand::MotorSpeeds([payload[0], payload[1]])),
        CMD_SERVO_TIMES => {
            let mut regs = SharedRegisters::new();
            regs.set_servo_bytes(payload);
            Ok(HostCommand::ServoTimes(regs.servo_times))
        }
        other => Err(HostLinkError::UnknownCommand(other)),
    }
}

pub fn encode_frame(seq: u8, commands: &[HostCommand]) -> Result<Frame, HostLinkError> {
    let mut out = Frame::new();
    out.push(seq);
    for command in commands {
        out.try_push(command.opcode())
            .map_err(|_| HostLinkError::FrameTooLarge(MAX_FRAME_SIZE + 1))?;
        command.write_payload(&mut out)?;
    }
    Ok(out)
}

/// `[seq, RET_COUNTER_VALUES, counters as little-endian words]`.
pub fn encode_counter_report(seq: u8, regs: &SharedRegisters) -> Report {
    let mut out = Report::new();
    out.push(seq);
    out.push(RET_COUNTER_VALUES);
    for byte in regs.counter_bytes() {
        out.push(byte);
    }
    out
}

pub fn decode_counter_report(report: &[u8]) -> Result<(u8, [u16; 4]), HostLinkError> {
    let (&seq, body) = report.split_first().ok_or(HostLinkError::EmptyFrame)?;
    let (&command, payload) = body
        .split_first()
        .ok_or(HostLinkError::MissingData { command: 0, needed: 1, available: 0 })?;
    if command != RET_COUNTER_VALUES {
        return Err(HostLinkError::UnknownCommand(command));
    }
    let needed = payload_size(command);
    if payload.len() < usize::from(needed) {
        return Err(HostLinkError::MissingData { command, needed, available: payload.len() as u8 });
    }
    let mut regs = SharedRegisters::new();
    regs.set_counter_bytes(payload);
    Ok((seq, regs.counter_values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_table_from_opcode() {
        assert_eq!(payload_size(CMD_BEEP), 1);
        assert_eq!(payload_size(CMD_MOTOR_SPEEDS), 2);
        assert_eq!(payload_size(CMD_SERVO_TIMES), 8);
        assert_eq!(payload_size(RET_COUNTER_VALUES), 8);
        assert_eq!(payload_size(0x27), VAR_SIZE);
    }

    #[test]
    fn test_decode_motor_and_servo_frame() {
        let frame = [7, CMD_MOTOR_SPEEDS, 0x90, 0x70, CMD_SERVO_TIMES, 0xDC, 0x05, 0, 0, 0, 0, 0xE8, 0x03];
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.error, None);
        assert_eq!(
            decoded.commands.as_slice(),
            &[HostCommand::MotorSpeeds([0x90, 0x70]), HostCommand::ServoTimes([1500, 0, 0, 1000])]
        );
    }

    #[test]
    fn test_missing_data_keeps_earlier_commands() {
        let frame = [1, CMD_BEEP, 50, CMD_SERVO_TIMES, 1, 2, 3];
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.commands.as_slice(), &[HostCommand::Beep { ms: 50 }]);
        assert_eq!(
            decoded.error,
            Some(HostLinkError::MissingData { command: CMD_SERVO_TIMES, needed: 8, available: 3 })
        );
    }

    #[test]
    fn test_unknown_command_stops_decoding() {
        // 0x21 has a one-byte payload per the size table but no handler.
        let frame = [2, 0x21, 0xAA, CMD_BEEP, 10];
        let decoded = decode_frame(&frame).unwrap();
        assert!(decoded.commands.is_empty());
        assert_eq!(decoded.error, Some(HostLinkError::UnknownCommand(0x21)));
    }

    #[test]
    fn test_variable_size_payload_is_skipped_by_length() {
        let frame = [3, 0x17, 2, 0xAA, 0xBB];
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.error, Some(HostLinkError::UnknownCommand(0x17)));

        let truncated = [3, 0x17];
        assert_eq!(
            decode_frame(&truncated).unwrap().error,
            Some(HostLinkError::MissingData { command: 0x17, needed: 1, available: 0 })
        );
    }

    #[test]
    fn test_frame_limits() {
        assert_eq!(decode_frame(&[]), Err(HostLinkError::EmptyFrame));
        let only_seq = decode_frame(&[9]).unwrap();
        assert_eq!(only_seq.seq, 9);
        assert!(only_seq.commands.is_empty());

        let oversized = [0u8; MAX_FRAME_SIZE + 1];
        assert_eq!(decode_frame(&oversized), Err(HostLinkError::FrameTooLarge(MAX_FRAME_SIZE + 1)));
    }

    #[test]
    fn test_encode_frame_decodes_back() {
        let commands = [HostCommand::Beep { ms: 0 }, HostCommand::ServoTimes([1, 2, 3, 4])];
        let frame = encode_frame(5, &commands).unwrap();
        assert_eq!(frame.len(), 1 + 2 + 9);
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.commands.as_slice(), &commands);
    }

    #[test]
    fn test_encode_rejects_frame_past_limit() {
        let commands = [HostCommand::ServoTimes([1500; 4]); 4];
        assert_eq!(encode_frame(1, &commands), Err(HostLinkError::FrameTooLarge(MAX_FRAME_SIZE + 1)));
        let frame = encode_frame(1, &commands[..3]).unwrap();
        assert_eq!(frame.len(), 1 + 3 * 9);
    }

    #[test]
    fn test_counter_report_layout() {
        let mut regs = SharedRegisters::new();
        regs.counter_values = [0x0102, 3, 0, 0xFFFF];
        let report = encode_counter_report(0x42, &regs);
        assert_eq!(report.as_slice(), &[0x42, 0x1D, 0x02, 0x01, 3, 0, 0, 0, 0xFF, 0xFF]);
        assert_eq!(decode_counter_report(&report), Ok((0x42, [0x0102, 3, 0, 0xFFFF])));
        assert_eq!(decode_counter_report(&report[..5]).unwrap_err(), HostLinkError::MissingData {
            command: RET_COUNTER_VALUES,
            needed: 8,
            available: 3
        });
    }

    #[test]
    fn test_apply_updates_registers() {
        let mut regs = SharedRegisters::new();
        assert_eq!(HostCommand::MotorSpeeds([1, 2]).apply(&mut regs), None);
        assert_eq!(regs.motor_power, [1, 2]);
        assert_eq!(HostCommand::Beep { ms: 30 }.apply(&mut regs), Some(30));
    }
}
