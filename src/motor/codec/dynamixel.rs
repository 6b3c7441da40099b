// Dynamixel Protocol 2.0
//
// Instruction: `[FF FF FD 00, ID, LEN_L, LEN_H, INST, PARAMS..., CRC_L, CRC_H]`
// Status:      `[FF FF FD 00, ID, LEN_L, LEN_H, 0x55, ERR, PARAMS..., CRC_L, CRC_H]`
//
// `LEN` counts everything after itself (instruction, params, CRC). Any
// `FF FF FD` run inside the payload is stuffed to `FF FF FD FD` before the
// CRC is computed.

use super::{InstructionPacket, PacketCodec, StatusPacket, out_of_range};
use crate::motor::codec::Instruction;
use crate::motor::control_table::{ProtocolFamily, RegisterSpec};
use crate::motor::error::{MotorBusError, Result};

const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];

/// Header, id and two length bytes
const HEADER_LEN: usize = 7;

/// Instruction code of every status packet
const STATUS: u8 = 0x55;

/// Bit 7 of the error byte only flags a pending hardware alert
const ALERT_BIT: u8 = 0x80;

/// CRC-16 polynomial (x^16 + x^15 + x^2 + 1), initial value 0
const CRC16_POLY: u16 = 0x8005;

const CRC16_TABLE: [u16; 256] = generate_crc16_table();

const fn generate_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut j = 0;

        while j < 8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// CRC-16 over the whole frame up to (not including) the CRC itself
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let idx = ((crc >> 8) ^ byte as u16) & 0xFF;
        (crc << 8) ^ CRC16_TABLE[idx as usize]
    })
}

fn instruction_code(instruction: Instruction) -> u8 {
    match instruction {
        Instruction::Ping => 0x01,
        Instruction::Read => 0x02,
        Instruction::Write => 0x03,
        Instruction::RegWrite => 0x04,
        Instruction::Action => 0x05,
        Instruction::FactoryReset => 0x06,
        Instruction::Reboot => 0x08,
        Instruction::SyncRead => 0x82,
        Instruction::SyncWrite => 0x83,
    }
}

fn instruction_from_code(code: u8) -> Option<Instruction> {
    Some(match code {
        0x01 => Instruction::Ping,
        0x02 => Instruction::Read,
        0x03 => Instruction::Write,
        0x04 => Instruction::RegWrite,
        0x05 => Instruction::Action,
        0x06 => Instruction::FactoryReset,
        0x08 => Instruction::Reboot,
        0x82 => Instruction::SyncRead,
        0x83 => Instruction::SyncWrite,
        _ => return None,
    })
}

/// Insert 0xFD after every `FF FF FD` run
fn stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 3);
    for &byte in payload {
        out.push(byte);
        if out.ends_with(&[0xFF, 0xFF, 0xFD]) {
            out.push(0xFD);
        }
    }
    out
}

/// Drop the 0xFD that follows every `FF FF FD` run
fn unstuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut i = 0;
    while i < payload.len() {
        out.push(payload[i]);
        if out.ends_with(&[0xFF, 0xFF, 0xFD]) && payload.get(i + 1) == Some(&0xFD) {
            i += 1;
        }
        i += 1;
    }
    out
}

/// Codec for Dynamixel Protocol 2.0 servos
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamixelCodec;

impl DynamixelCodec {
    pub fn new() -> Self {
        Self
    }

    fn build_frame(id: u8, payload: &[u8]) -> Vec<u8> {
        let stuffed = stuff(payload);
        let length = (stuffed.len() + 2) as u16; // payload + crc
        let mut frame = Vec::with_capacity(HEADER_LEN + stuffed.len() + 2);

        frame.extend_from_slice(&HEADER);
        frame.push(id);
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&stuffed);

        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Validate header, length and CRC; returns (id, unstuffed payload)
    fn split_frame(&self, frame: &[u8]) -> Result<(u8, Vec<u8>)> {
        let id = frame.get(4).copied().unwrap_or(0);
        let corrupt = |reason: String| MotorBusError::CorruptFrame { id, reason };

        if frame.len() < HEADER_LEN + 3 {
            return Err(corrupt(format!("frame too short: {} bytes", frame.len())));
        }
        let expected_len = self.frame_len(&frame[..HEADER_LEN])?;
        if frame.len() != expected_len {
            return Err(corrupt(format!(
                "length field says {} bytes, frame has {}",
                expected_len,
                frame.len()
            )));
        }

        let (body, crc_bytes) = frame.split_at(frame.len() - 2);
        let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let expected = crc16(body);
        if received != expected {
            return Err(corrupt(format!(
                "CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
                expected, received
            )));
        }

        Ok((id, unstuff(&body[HEADER_LEN..])))
    }
}

impl PacketCodec for DynamixelCodec {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Dynamixel
    }

    fn supported_baudrates(&self) -> Vec<u32> {
        vec![
            57_600, 1_000_000, 115_200, 2_000_000, 3_000_000, 4_000_000, 9_600,
        ]
    }

    fn sync_read_supported(&self) -> bool {
        true
    }

    fn sync_write_supported(&self) -> bool {
        true
    }

    fn address_width(&self) -> usize {
        2
    }

    // Length field counts instruction, params and CRC after stuffing, which
    // adds at most one byte per three
    fn max_params_len(&self) -> usize {
        (u16::MAX as usize - 3) * 3 / 4
    }

    fn checksum(&self, body: &[u8]) -> Vec<u8> {
        crc16(body).to_le_bytes().to_vec()
    }

    fn encode(&self, packet: &InstructionPacket) -> Vec<u8> {
        let mut payload = Vec::with_capacity(packet.params.len() + 1);
        payload.push(instruction_code(packet.instruction));
        payload.extend_from_slice(&packet.params);
        Self::build_frame(packet.id, &payload)
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn frame_len(&self, header: &[u8]) -> Result<usize> {
        let id = header.get(4).copied().unwrap_or(0);
        if header.len() < HEADER_LEN || header[..4] != HEADER {
            return Err(MotorBusError::CorruptFrame {
                id,
                reason: format!("invalid header: {:02X?}", header),
            });
        }
        let length = u16::from_le_bytes([header[5], header[6]]) as usize;
        if length < 3 {
            return Err(MotorBusError::CorruptFrame {
                id,
                reason: format!("length field too small: {}", length),
            });
        }
        Ok(HEADER_LEN + length)
    }

    fn decode_status(&self, frame: &[u8]) -> Result<StatusPacket> {
        let (id, payload) = self.split_frame(frame)?;
        if payload.len() < 2 || payload[0] != STATUS {
            return Err(MotorBusError::CorruptFrame {
                id,
                reason: format!("not a status packet: {:02X?}", payload.first()),
            });
        }
        Ok(StatusPacket {
            id,
            error: payload[1],
            params: payload[2..].to_vec(),
        })
    }

    fn decode_instruction(&self, frame: &[u8]) -> Result<InstructionPacket> {
        let (id, payload) = self.split_frame(frame)?;
        let instruction = instruction_from_code(payload[0]).ok_or_else(|| {
            MotorBusError::CorruptFrame {
                id,
                reason: format!("unknown instruction 0x{:02X}", payload[0]),
            }
        })?;
        Ok(InstructionPacket::new(id, instruction, payload[1..].to_vec()))
    }

    fn encode_status(&self, status: &StatusPacket) -> Vec<u8> {
        let mut payload = Vec::with_capacity(status.params.len() + 2);
        payload.push(STATUS);
        payload.push(status.error);
        payload.extend_from_slice(&status.params);
        Self::build_frame(status.id, &payload)
    }

    fn status_is_error(&self, error: u8) -> bool {
        error & !ALERT_BIT != 0
    }

    fn ping_model_number(&self, status: &StatusPacket) -> Option<u16> {
        match status.params.as_slice() {
            [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }

    fn encode_signed(&self, value: i64, spec: &RegisterSpec) -> Result<u64> {
        let bits = spec.width as u32 * 8;
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if value < min || value > max {
            return Err(out_of_range(spec, value));
        }
        let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        Ok(value as u64 & mask)
    }

    fn decode_signed(&self, raw: u64, spec: &RegisterSpec) -> i64 {
        let shift = 64 - spec.width as u32 * 8;
        ((raw << shift) as i64) >> shift
    }
}
