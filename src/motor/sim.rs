// Simulated servo line
//
// `SimulatedLine` holds a set of virtual devices with real register memory
// and answers instruction frames the way hardware would, using the same codec
// as the bus. `SimTransport` plugs it into a bus. The line handle is
// cloneable so tests can inspect traffic and inject faults while the bus owns
// the transport.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;

use super::codec::{InstructionPacket, Instruction, PacketCodec, StatusPacket, codec_for};
use super::control_table::{ModelSpec, ProtocolFamily, baudrate_table};
use super::error::{MotorBusError, Result};
use super::transport::{DEFAULT_BAUDRATE, Transport, TransportError};

/// Bytes of register memory per device
const MEMORY_SIZE: usize = 256;

/// Error byte reported for out-of-range accesses
const ERR_ACCESS: u8 = 0x07;

/// Firmware version reported in Dynamixel ping replies
const FIRMWARE_VERSION: u8 = 0x2A;

struct SimDevice {
    model: ModelSpec,
    memory: Vec<u8>,
    responsive: bool,
    baudrate: u32,
    scripted_positions: VecDeque<i64>,
}

struct LineState {
    codec: Box<dyn PacketCodec>,
    devices: BTreeMap<u8, SimDevice>,
    baudrate: u32,
    open: bool,
    rx: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
    corrupt_replies: usize,
}

/// Shared handle to a simulated line
#[derive(Clone)]
pub struct SimulatedLine {
    state: Arc<Mutex<LineState>>,
}

impl std::fmt::Debug for SimulatedLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SimulatedLine")
            .field("family", &state.codec.family())
            .field("devices", &state.devices.keys().collect::<Vec<_>>())
            .field("baudrate", &state.baudrate)
            .finish()
    }
}

impl SimulatedLine {
    pub fn new(family: ProtocolFamily) -> Self {
        Self::with_codec(codec_for(family))
    }

    pub fn with_codec(codec: Box<dyn PacketCodec>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LineState {
                codec,
                devices: BTreeMap::new(),
                baudrate: DEFAULT_BAUDRATE,
                open: false,
                rx: VecDeque::new(),
                sent: Vec::new(),
                corrupt_replies: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a device listening at the default baudrate
    pub fn add_device(&self, id: u8, model: &ModelSpec) {
        self.add_device_at(id, model, DEFAULT_BAUDRATE);
    }

    /// Attach a device listening at `baudrate`
    pub fn add_device_at(&self, id: u8, model: &ModelSpec, baudrate: u32) {
        let mut state = self.state();
        let mut device = SimDevice {
            model: model.clone(),
            memory: vec![0; MEMORY_SIZE],
            responsive: true,
            baudrate,
            scripted_positions: VecDeque::new(),
        };
        let codec = state.codec.as_ref();
        // Best effort: custom test models may not define these registers
        let _ = device.store(codec, "Model_Number", model.model_number as i64);
        let _ = device.store(codec, "ID", id as i64);
        if let Some((code, _)) = baudrate_table(codec.family())
            .iter()
            .find(|(_, b)| *b == baudrate)
        {
            let _ = device.store(codec, "Baud_Rate", *code as i64);
        }
        state.devices.insert(id, device);
    }

    /// Mark a device as silent; it stays attached but never replies
    pub fn set_responsive(&self, id: u8, responsive: bool) {
        if let Some(device) = self.state().devices.get_mut(&id) {
            device.responsive = responsive;
        }
    }

    /// Write a register directly, bypassing access rules
    pub fn set_register(&self, id: u8, register: &str, value: i64) -> Result<()> {
        let mut state = self.state();
        let LineState { codec, devices, .. } = &mut *state;
        let device = devices
            .get_mut(&id)
            .ok_or(MotorBusError::UnknownDevice { id })?;
        device.store(codec.as_ref(), register, value)
    }

    /// Read a register directly
    pub fn register(&self, id: u8, register: &str) -> Result<i64> {
        let state = self.state();
        let device = state
            .devices
            .get(&id)
            .ok_or(MotorBusError::UnknownDevice { id })?;
        device.load(state.codec.as_ref(), register)
    }

    /// Queue positions reported by successive reads of `Present_Position`.
    /// The last one sticks once the queue drains.
    pub fn script_positions(&self, id: u8, positions: impl IntoIterator<Item = i64>) {
        if let Some(device) = self.state().devices.get_mut(&id) {
            device.scripted_positions.extend(positions);
        }
    }

    /// Flip a checksum bit in the next `count` replies
    pub fn corrupt_next_replies(&self, count: usize) {
        self.state().corrupt_replies = count;
    }

    /// Number of frames written to the line
    pub fn frames_sent(&self) -> usize {
        self.state().sent.len()
    }

    /// Decoded copy of every frame written to the line
    pub fn sent_instructions(&self) -> Vec<InstructionPacket> {
        let state = self.state();
        state
            .sent
            .iter()
            .filter_map(|frame| state.codec.decode_instruction(frame).ok())
            .collect()
    }

    pub fn clear_history(&self) {
        self.state().sent.clear();
    }

    pub fn device_ids(&self) -> Vec<u8> {
        self.state().devices.keys().copied().collect()
    }

    /// Transport view of this line for a bus to own
    pub fn transport(&self, port_name: impl Into<String>) -> SimTransport {
        SimTransport {
            port_name: port_name.into(),
            line: self.clone(),
        }
    }
}

impl SimDevice {
    fn store(&mut self, codec: &dyn PacketCodec, register: &str, value: i64) -> Result<()> {
        let spec = self.model.register(register)?.clone();
        let bytes = codec.encode_value(value, &spec)?;
        let start = spec.address as usize;
        self.memory[start..start + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    fn load(&self, codec: &dyn PacketCodec, register: &str) -> Result<i64> {
        let spec = self.model.register(register)?;
        let start = spec.address as usize;
        codec.decode_value(&self.memory[start..start + spec.width as usize], spec)
    }

    fn read_memory(&mut self, codec: &dyn PacketCodec, address: usize, len: usize) -> Option<Vec<u8>> {
        if address + len > MEMORY_SIZE {
            return None;
        }
        if let Ok(spec) = self.model.register("Present_Position") {
            let position = spec.address as usize;
            let covered = address <= position && position < address + len;
            if covered && let Some(next) = self.next_position() {
                let _ = self.store(codec, "Present_Position", next);
            }
        }
        Some(self.memory[address..address + len].to_vec())
    }

    fn next_position(&mut self) -> Option<i64> {
        if self.scripted_positions.len() > 1 {
            self.scripted_positions.pop_front()
        } else {
            self.scripted_positions.front().copied()
        }
    }

    fn write_memory(&mut self, address: usize, data: &[u8]) -> bool {
        if address + data.len() > MEMORY_SIZE {
            return false;
        }
        self.memory[address..address + data.len()].copy_from_slice(data);
        true
    }
}

impl LineState {
    fn reply(&mut self, id: u8, error: u8, params: Vec<u8>) {
        let mut frame = self.codec.encode_status(&StatusPacket { id, error, params });
        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            if let Some(last) = frame.last_mut() {
                *last ^= 0x01;
            }
        }
        self.rx.extend(frame);
    }

    fn listening(&self, id: u8) -> bool {
        self.devices
            .get(&id)
            .is_some_and(|d| d.responsive && d.baudrate == self.baudrate)
    }

    fn handle(&mut self, packet: InstructionPacket) {
        let broadcast = packet.id == self.codec.broadcast_id();
        let width = self.codec.address_width();

        match packet.instruction {
            Instruction::Ping => {
                let ids: Vec<u8> = if broadcast {
                    self.devices.keys().copied().collect()
                } else {
                    vec![packet.id]
                };
                let responders: Vec<u8> = ids.into_iter().filter(|id| self.listening(*id)).collect();
                for id in responders {
                    let params = match self.codec.family() {
                        ProtocolFamily::Dynamixel => {
                            let number = self.devices[&id].model.model_number;
                            let mut params = number.to_le_bytes().to_vec();
                            params.push(FIRMWARE_VERSION);
                            params
                        }
                        _ => Vec::new(),
                    };
                    self.reply(id, 0, params);
                }
            }
            Instruction::Read => {
                if broadcast || !self.listening(packet.id) || packet.params.len() < 2 * width {
                    return;
                }
                let address = self.codec.parse_int_field(&packet.params) as usize;
                let len = self.codec.parse_int_field(&packet.params[width..]) as usize;
                let codec = self.codec.as_ref();
                let data = self
                    .devices
                    .get_mut(&packet.id)
                    .and_then(|d| d.read_memory(codec, address, len));
                match data {
                    Some(data) => self.reply(packet.id, 0, data),
                    None => self.reply(packet.id, ERR_ACCESS, Vec::new()),
                }
            }
            Instruction::Write | Instruction::RegWrite => {
                if !self.listening(packet.id) || packet.params.len() < width {
                    return;
                }
                let address = self.codec.parse_int_field(&packet.params) as usize;
                let data = packet.params[width..].to_vec();
                let ok = self
                    .devices
                    .get_mut(&packet.id)
                    .is_some_and(|d| d.write_memory(address, &data));
                if !broadcast {
                    self.reply(packet.id, if ok { 0 } else { ERR_ACCESS }, Vec::new());
                }
                if ok {
                    self.apply_identity_changes(packet.id);
                }
            }
            Instruction::SyncWrite => {
                if packet.params.len() < 2 * width {
                    return;
                }
                let address = self.codec.parse_int_field(&packet.params) as usize;
                let len = self.codec.parse_int_field(&packet.params[width..]) as usize;
                for chunk in packet.params[2 * width..].chunks(len + 1) {
                    let (id, data) = (chunk[0], &chunk[1..]);
                    if data.len() == len
                        && self.listening(id)
                        && let Some(device) = self.devices.get_mut(&id)
                    {
                        device.write_memory(address, data);
                    }
                }
            }
            Instruction::SyncRead => {
                if packet.params.len() < 2 * width {
                    return;
                }
                let address = self.codec.parse_int_field(&packet.params) as usize;
                let len = self.codec.parse_int_field(&packet.params[width..]) as usize;
                for &id in &packet.params[2 * width..] {
                    if !self.listening(id) {
                        continue;
                    }
                    let codec = self.codec.as_ref();
                    let data = self
                        .devices
                        .get_mut(&id)
                        .and_then(|d| d.read_memory(codec, address, len));
                    if let Some(data) = data {
                        self.reply(id, 0, data);
                    }
                }
            }
            Instruction::Action | Instruction::FactoryReset | Instruction::Reboot => {
                if !broadcast && self.listening(packet.id) {
                    self.reply(packet.id, 0, Vec::new());
                }
            }
        }
    }

    /// Re-key a device whose ID or Baud_Rate register was just written
    fn apply_identity_changes(&mut self, id: u8) {
        let codec = self.codec.as_ref();
        let Some(device) = self.devices.get(&id) else {
            return;
        };
        let new_id = device.load(codec, "ID").ok().map(|v| v as u8);
        let new_baud = device
            .load(codec, "Baud_Rate")
            .ok()
            .and_then(|code| {
                baudrate_table(codec.family())
                    .iter()
                    .find(|(c, _)| *c as i64 == code)
                    .map(|(_, b)| *b)
            });

        if let Some(device) = self.devices.get_mut(&id)
            && let Some(baud) = new_baud
        {
            device.baudrate = baud;
        }
        if let Some(new_id) = new_id.filter(|new_id| *new_id != id)
            && let Some(device) = self.devices.remove(&id)
        {
            self.devices.insert(new_id, device);
        }
    }
}

/// Transport backed by a [`SimulatedLine`]
#[derive(Debug)]
pub struct SimTransport {
    port_name: String,
    line: SimulatedLine,
}

impl Transport for SimTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn open(&mut self) -> std::result::Result<(), TransportError> {
        self.line.state().open = true;
        Ok(())
    }

    fn close(&mut self) -> std::result::Result<(), TransportError> {
        let mut state = self.line.state();
        state.open = false;
        state.rx.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.line.state().open
    }

    fn baudrate(&self) -> u32 {
        self.line.state().baudrate
    }

    fn set_baudrate(&mut self, baudrate: u32) -> std::result::Result<(), TransportError> {
        self.line.state().baudrate = baudrate;
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> std::result::Result<(), TransportError> {
        let mut state = self.line.state();
        if !state.open {
            return Err(TransportError::NotOpen {
                port: self.port_name.clone(),
            });
        }
        state.sent.push(frame.to_vec());
        let decoded = state.codec.decode_instruction(frame);
        match decoded {
            Ok(packet) => {
                trace!("sim <- {:?}", packet);
                state.handle(packet);
            }
            Err(e) => trace!("sim ignored malformed frame: {}", e),
        }
        Ok(())
    }

    fn receive(
        &mut self,
        len: usize,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        let mut state = self.line.state();
        if !state.open {
            return Err(TransportError::NotOpen {
                port: self.port_name.clone(),
            });
        }
        if state.rx.len() < len {
            state.rx.clear();
            return Err(TransportError::Timeout {
                expected: len,
                waited: timeout,
            });
        }
        Ok(state.rx.drain(..len).collect())
    }

    fn clear_input(&mut self) -> std::result::Result<(), TransportError> {
        self.line.state().rx.clear();
        Ok(())
    }
}
