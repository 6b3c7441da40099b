// Packet codecs for the supported wire protocols
//
// The bus talks to a `dyn PacketCodec` only. Each family decides frame
// layout, checksum, byte order and how signed registers are encoded.

pub mod dynamixel;
pub mod feetech;

pub use dynamixel::DynamixelCodec;
pub use feetech::FeetechCodec;

use super::control_table::{ProtocolFamily, RegisterSpec};
use super::error::{MotorBusError, Result};

/// Broadcast id shared by both protocol families
pub const BROADCAST_ID: u8 = 0xFE;

/// Instructions common to both families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping,
    Read,
    Write,
    RegWrite,
    Action,
    FactoryReset,
    Reboot,
    SyncRead,
    SyncWrite,
}

impl Instruction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Read => "read",
            Self::Write => "write",
            Self::RegWrite => "reg_write",
            Self::Action => "action",
            Self::FactoryReset => "factory_reset",
            Self::Reboot => "reboot",
            Self::SyncRead => "sync_read",
            Self::SyncWrite => "sync_write",
        }
    }

    /// Whether the instruction may be sent to the broadcast id
    pub fn allows_broadcast(self) -> bool {
        matches!(
            self,
            Self::Ping | Self::SyncRead | Self::SyncWrite | Self::Action
        )
    }
}

/// Outgoing request frame contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionPacket {
    pub id: u8,
    pub instruction: Instruction,
    pub params: Vec<u8>,
}

impl InstructionPacket {
    pub fn new(id: u8, instruction: Instruction, params: Vec<u8>) -> Self {
        Self {
            id,
            instruction,
            params,
        }
    }
}

/// Reply frame contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    pub id: u8,
    pub error: u8,
    pub params: Vec<u8>,
}

/// Capability interface implemented once per protocol family
pub trait PacketCodec: Send + Sync {
    fn family(&self) -> ProtocolFamily;

    fn broadcast_id(&self) -> u8 {
        BROADCAST_ID
    }

    /// Baudrates probed by a port scan, most common first
    fn supported_baudrates(&self) -> Vec<u32>;

    fn sync_read_supported(&self) -> bool;

    fn sync_write_supported(&self) -> bool;

    /// Width of the address field inside read/write params
    fn address_width(&self) -> usize;

    /// Largest params block the length field of one frame can describe
    fn max_params_len(&self) -> usize;

    /// Checksum bytes for a frame body, in wire order
    fn checksum(&self, body: &[u8]) -> Vec<u8>;

    /// Build a full instruction frame
    fn encode(&self, packet: &InstructionPacket) -> Vec<u8>;

    /// Number of bytes to read before the total frame length is known
    fn header_len(&self) -> usize;

    /// Total frame length given the header, or an error if the header is bad
    fn frame_len(&self, header: &[u8]) -> Result<usize>;

    /// Parse and verify a complete status frame
    fn decode_status(&self, frame: &[u8]) -> Result<StatusPacket>;

    /// Parse and verify a complete instruction frame
    fn decode_instruction(&self, frame: &[u8]) -> Result<InstructionPacket>;

    /// Build a full status frame
    fn encode_status(&self, status: &StatusPacket) -> Vec<u8>;

    /// Whether the error byte of a status packet reports a failure
    fn status_is_error(&self, error: u8) -> bool {
        error != 0
    }

    /// Model number carried in a ping reply, if the family includes one
    fn ping_model_number(&self, status: &StatusPacket) -> Option<u16>;

    fn little_endian(&self) -> bool {
        true
    }

    /// Convert a signed value to the register's unsigned wire representation
    fn encode_signed(&self, value: i64, spec: &RegisterSpec) -> Result<u64>;

    /// Convert a register's unsigned wire representation to a signed value
    fn decode_signed(&self, raw: u64, spec: &RegisterSpec) -> i64;

    /// Encode a register value into `spec.width` bytes
    fn encode_value(&self, value: i64, spec: &RegisterSpec) -> Result<Vec<u8>> {
        let raw = if spec.signed {
            self.encode_signed(value, spec)?
        } else {
            let max = unsigned_max(spec.width);
            if value < 0 || value as u64 > max {
                return Err(out_of_range(spec, value));
            }
            value as u64
        };
        Ok(int_to_bytes(raw, spec.width, self.little_endian()))
    }

    /// Decode `spec.width` bytes into a register value
    fn decode_value(&self, bytes: &[u8], spec: &RegisterSpec) -> Result<i64> {
        let width = spec.width as usize;
        if bytes.len() < width {
            return Err(MotorBusError::CorruptFrame {
                id: 0,
                reason: format!(
                    "{} needs {} bytes, got {}",
                    spec.name,
                    width,
                    bytes.len()
                ),
            });
        }
        let raw = bytes_to_int(&bytes[..width], self.little_endian());
        Ok(if spec.signed {
            self.decode_signed(raw, spec)
        } else {
            raw as i64
        })
    }

    /// Params of a read request: address followed by length
    fn read_params(&self, address: u16, len: u16) -> Vec<u8> {
        let mut params = self.int_field(address);
        params.extend(self.int_field(len));
        params
    }

    /// Address or length field in the family's width and byte order
    fn int_field(&self, value: u16) -> Vec<u8> {
        int_to_bytes(value as u64, self.address_width() as u8, self.little_endian())
    }

    /// Parse an address or length field written by `int_field`
    fn parse_int_field(&self, bytes: &[u8]) -> u16 {
        bytes_to_int(&bytes[..self.address_width()], self.little_endian()) as u16
    }
}

pub(crate) fn unsigned_max(width: u8) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width as u32 * 8)) - 1
    }
}

pub(crate) fn out_of_range(spec: &RegisterSpec, value: i64) -> MotorBusError {
    MotorBusError::ValueOutOfRange {
        register: spec.name.to_string(),
        value: value as f64,
        width: spec.width,
    }
}

pub(crate) fn int_to_bytes(value: u64, width: u8, little_endian: bool) -> Vec<u8> {
    let mut bytes: Vec<u8> = (0..width).map(|i| (value >> (8 * i as u32)) as u8).collect();
    if !little_endian {
        bytes.reverse();
    }
    bytes
}

pub(crate) fn bytes_to_int(bytes: &[u8], little_endian: bool) -> u64 {
    let fold = |acc: u64, b: &u8| (acc << 8) | *b as u64;
    if little_endian {
        bytes.iter().rev().fold(0, fold)
    } else {
        bytes.iter().fold(0, fold)
    }
}

/// Codec for a protocol family
pub fn codec_for(family: ProtocolFamily) -> Box<dyn PacketCodec> {
    match family {
        ProtocolFamily::Feetech => Box::new(FeetechCodec::sts()),
        ProtocolFamily::FeetechScs => Box::new(FeetechCodec::scs()),
        ProtocolFamily::Dynamixel => Box::new(DynamixelCodec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_bytes_byte_order() {
        assert_eq!(int_to_bytes(0x1234, 2, true), vec![0x34, 0x12]);
        assert_eq!(int_to_bytes(0x1234, 2, false), vec![0x12, 0x34]);
        assert_eq!(bytes_to_int(&[0x34, 0x12], true), 0x1234);
        assert_eq!(bytes_to_int(&[0x12, 0x34], false), 0x1234);
        assert_eq!(bytes_to_int(&[0x78, 0x56, 0x34, 0x12], true), 0x1234_5678);
    }

    #[test]
    fn test_broadcast_allowed_only_for_multicast_instructions() {
        assert!(Instruction::Ping.allows_broadcast());
        assert!(Instruction::SyncWrite.allows_broadcast());
        assert!(!Instruction::Read.allows_broadcast());
        assert!(!Instruction::Write.allows_broadcast());
    }

    #[test]
    fn test_codec_for_family() {
        assert_eq!(
            codec_for(ProtocolFamily::Dynamixel).family(),
            ProtocolFamily::Dynamixel
        );
        let scs = codec_for(ProtocolFamily::FeetechScs);
        assert!(!scs.sync_read_supported());
        assert!(!scs.little_endian());
    }
}
