// Feetech STS/SCS serial protocol
//
// Similar to Dynamixel Protocol 1.0:
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// Status format: [0xFF, 0xFF, ID, Length, Error, Params..., Checksum]

use super::{InstructionPacket, PacketCodec, StatusPacket, out_of_range};
use crate::motor::codec::Instruction;
use crate::motor::control_table::{ProtocolFamily, RegisterSpec};
use crate::motor::error::{MotorBusError, Result};

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Header, id and length
const HEADER_LEN: usize = 4;

/// Smallest valid frame: header, id, length, instruction/error, checksum
const MIN_FRAME_LEN: usize = 6;

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

/// Codec for Feetech servos
#[derive(Debug, Clone, Copy)]
pub struct FeetechCodec {
    family: ProtocolFamily,
}

impl FeetechCodec {
    /// STS/SMS series: little-endian, supports sync read
    pub fn sts() -> Self {
        Self {
            family: ProtocolFamily::Feetech,
        }
    }

    /// SCS series: big-endian, no sync read
    pub fn scs() -> Self {
        Self {
            family: ProtocolFamily::FeetechScs,
        }
    }

    /// Checksum over id, length, instruction and params
    fn sum(data: &[u8]) -> u8 {
        let sum: u32 = data.iter().map(|&b| b as u32).sum();
        (!sum & 0xFF) as u8
    }

    /// Build a packet with header and checksum
    fn build_packet(id: u8, code: u8, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8; // params + instruction + checksum
        let mut packet = Vec::with_capacity(MIN_FRAME_LEN + params.len());

        packet.extend_from_slice(&HEADER);
        packet.push(id);
        packet.push(length);
        packet.push(code);
        packet.extend_from_slice(params);

        let checksum = Self::sum(&packet[2..]); // skip header
        packet.push(checksum);

        packet
    }

    /// Validate header, length and checksum; returns (id, code, params)
    fn split_frame<'a>(&self, frame: &'a [u8]) -> Result<(u8, u8, &'a [u8])> {
        let id = frame.get(2).copied().unwrap_or(0);
        let corrupt = |reason: String| MotorBusError::CorruptFrame { id, reason };

        if frame.len() < MIN_FRAME_LEN {
            return Err(corrupt(format!("frame too short: {} bytes", frame.len())));
        }
        if frame[..2] != HEADER {
            return Err(corrupt(format!("invalid header: {:02X?}", &frame[..2])));
        }
        let expected_len = self.frame_len(&frame[..HEADER_LEN])?;
        if frame.len() != expected_len {
            return Err(corrupt(format!(
                "length field says {} bytes, frame has {}",
                expected_len,
                frame.len()
            )));
        }

        let (body, checksum) = frame[2..].split_at(frame.len() - 3);
        let expected = Self::sum(body);
        if checksum[0] != expected {
            return Err(corrupt(format!(
                "checksum mismatch: expected 0x{:02X}, got 0x{:02X}",
                expected, checksum[0]
            )));
        }

        Ok((id, frame[4], &frame[5..frame.len() - 1]))
    }
}

impl PacketCodec for FeetechCodec {
    fn family(&self) -> ProtocolFamily {
        self.family
    }

    fn supported_baudrates(&self) -> Vec<u32> {
        vec![
            1_000_000, 500_000, 250_000, 128_000, 115_200, 57_600, 38_400, 19_200,
        ]
    }

    fn sync_read_supported(&self) -> bool {
        self.family == ProtocolFamily::Feetech
    }

    fn sync_write_supported(&self) -> bool {
        true
    }

    fn address_width(&self) -> usize {
        1
    }

    // Length byte counts params, instruction and checksum
    fn max_params_len(&self) -> usize {
        u8::MAX as usize - 2
    }

    fn checksum(&self, body: &[u8]) -> Vec<u8> {
        vec![Self::sum(body)]
    }

    fn encode(&self, packet: &InstructionPacket) -> Vec<u8> {
        Self::build_packet(
            packet.id,
            instruction_code(packet.instruction),
            &packet.params,
        )
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn frame_len(&self, header: &[u8]) -> Result<usize> {
        let id = header.get(2).copied().unwrap_or(0);
        if header.len() < HEADER_LEN || header[..2] != HEADER {
            return Err(MotorBusError::CorruptFrame {
                id,
                reason: format!("invalid header: {:02X?}", header),
            });
        }
        let length = header[3] as usize;
        if length < 2 {
            return Err(MotorBusError::CorruptFrame {
                id,
                reason: format!("length field too small: {}", length),
            });
        }
        Ok(HEADER_LEN + length)
    }

    fn decode_status(&self, frame: &[u8]) -> Result<StatusPacket> {
        let (id, error, params) = self.split_frame(frame)?;
        Ok(StatusPacket {
            id,
            error,
            params: params.to_vec(),
        })
    }

    fn decode_instruction(&self, frame: &[u8]) -> Result<InstructionPacket> {
        let (id, code, params) = self.split_frame(frame)?;
        let instruction = instruction_from_code(code).ok_or_else(|| MotorBusError::CorruptFrame {
            id,
            reason: format!("unknown instruction 0x{:02X}", code),
        })?;
        Ok(InstructionPacket::new(id, instruction, params.to_vec()))
    }

    fn encode_status(&self, status: &StatusPacket) -> Vec<u8> {
        Self::build_packet(status.id, status.error, &status.params)
    }

    fn ping_model_number(&self, _status: &StatusPacket) -> Option<u16> {
        None
    }

    fn little_endian(&self) -> bool {
        self.family == ProtocolFamily::Feetech
    }

    fn encode_signed(&self, value: i64, spec: &RegisterSpec) -> Result<u64> {
        encode_sign_magnitude(value, spec.sign_bit()).ok_or_else(|| out_of_range(spec, value))
    }

    fn decode_signed(&self, raw: u64, spec: &RegisterSpec) -> i64 {
        decode_sign_magnitude(raw, spec.sign_bit())
    }
}

/// Encode a signed value to sign-magnitude format
/// Bit `sign_bit` = sign (1 = negative), lower bits = magnitude
fn encode_sign_magnitude(value: i64, sign_bit: u8) -> Option<u64> {
    let max_magnitude = (1u64 << sign_bit) - 1;
    let magnitude = value.unsigned_abs();
    if magnitude > max_magnitude {
        return None;
    }
    Some(if value < 0 {
        (1u64 << sign_bit) | magnitude
    } else {
        magnitude
    })
}

/// Decode sign-magnitude format to signed value
fn decode_sign_magnitude(raw: u64, sign_bit: u8) -> i64 {
    let magnitude = (raw & ((1u64 << sign_bit) - 1)) as i64;
    if raw & (1u64 << sign_bit) != 0 {
        -magnitude
    } else {
        magnitude
    }
}
