// Motor bus orchestration
//
// MotorsBus owns one transport and one codec and is the only way callers
// reach the devices on a line. Every operation resolves the device and the
// register first, so configuration mistakes fail before anything is sent.
// Wire exchanges run through a bounded retry loop that only retries
// transient errors (timeouts and corrupted frames).
//
// Position-like registers are converted through the installed calibration
// records. Homing is applied in software: devices are kept with a zero
// hardware homing offset and full position limits, and the bus maps raw
// ticks into the homed frame itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::calibration::{
    self, CalibrationFile, MotorCalibration, NormMode, RangePolicy,
};
use super::codec::{Instruction, InstructionPacket, PacketCodec, StatusPacket};
use super::control_table::{ControlTable, ModelSpec, ProtocolFamily, RegisterSpec, baudrate_code};
use super::error::{MotorBusError, Result};
use super::torque::TorqueGuard;
use super::transport::{DEFAULT_TIMEOUT_MS, Transport, TransportError};

/// A motor attached to the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: u8,
    pub model: String,
    #[serde(default)]
    pub norm_mode: NormMode,
}

impl Device {
    pub fn new(id: u8, model: impl Into<String>, norm_mode: NormMode) -> Self {
        Self {
            id,
            model: model.into(),
            norm_mode,
        }
    }
}

/// How many times a wire exchange is attempted in total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const ONCE: Self = Self { max_attempts: 1 };

    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ONCE
    }
}

/// What a failed connect-time handshake does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeMode {
    /// Fail the connect and close the port
    #[default]
    Strict,
    /// Log a warning and stay connected
    BestEffort,
}

/// What disconnecting an already disconnected bus does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    #[default]
    Error,
    Ignore,
}

/// Servo control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Position,
    Velocity,
    Pwm,
    Step,
    Current,
    ExtendedPosition,
    CurrentBasedPosition,
}

impl OperatingMode {
    /// Value of the `Operating_Mode` register, if the family has this mode
    pub fn code(self, family: ProtocolFamily) -> Option<u8> {
        match family {
            ProtocolFamily::Feetech | ProtocolFamily::FeetechScs => match self {
                Self::Position => Some(0),
                Self::Velocity => Some(1),
                Self::Pwm => Some(2),
                Self::Step => Some(3),
                _ => None,
            },
            ProtocolFamily::Dynamixel => match self {
                Self::Current => Some(0),
                Self::Velocity => Some(1),
                Self::Position => Some(3),
                Self::ExtendedPosition => Some(4),
                Self::CurrentBasedPosition => Some(5),
                Self::Pwm => Some(16),
                Self::Step => None,
            },
        }
    }
}

/// Runtime behaviour of a bus
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Time allowed for one status frame to arrive
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub handshake: HandshakeMode,
    pub disconnect_policy: DisconnectPolicy,
    pub disable_torque_on_disconnect: bool,
    pub range_policy: RangePolicy,
    /// Failures tolerated by a sync operation before it fails as a whole.
    /// `None` always returns the partial report.
    pub sync_failure_threshold: Option<usize>,
    /// Calibration file loaded on connect when it exists
    pub calibration_path: Option<PathBuf>,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            handshake: HandshakeMode::default(),
            disconnect_policy: DisconnectPolicy::default(),
            disable_torque_on_disconnect: true,
            range_policy: RangePolicy::default(),
            sync_failure_threshold: None,
            calibration_path: None,
        }
    }
}

/// Per-device outcome of a sync operation
#[derive(Debug)]
pub struct SyncReport<T> {
    pub values: BTreeMap<u8, T>,
    pub failures: BTreeMap<u8, MotorBusError>,
}

impl<T> Default for SyncReport<T> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }
}

impl<T> SyncReport<T> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn get(&self, id: u8) -> Option<&T> {
        self.values.get(&id)
    }

    pub fn failed_ids(&self) -> Vec<u8> {
        self.failures.keys().copied().collect()
    }

    /// Values if every device succeeded, otherwise the first failure
    pub fn into_result(self) -> Result<BTreeMap<u8, T>> {
        match self.failures.into_values().next() {
            Some(e) => Err(e),
            None => Ok(self.values),
        }
    }
}

/// Bus over a single half-duplex line
pub struct MotorsBus {
    transport: Box<dyn Transport>,
    codec: Box<dyn PacketCodec>,
    table: ControlTable,
    devices: BTreeMap<u8, Device>,
    calibration: CalibrationFile,
    options: BusOptions,
    connected: bool,
}

impl std::fmt::Debug for MotorsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotorsBus")
            .field("port", &self.transport.port_name())
            .field("family", &self.codec.family())
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("connected", &self.connected)
            .finish()
    }
}

impl MotorsBus {
    /// Create a bus using the built-in control tables
    pub fn new(
        transport: Box<dyn Transport>,
        codec: Box<dyn PacketCodec>,
        devices: Vec<Device>,
    ) -> Result<Self> {
        Self::with_table(transport, codec, ControlTable::builtin().clone(), devices)
    }

    /// Create a bus with a caller-provided control table
    pub fn with_table(
        transport: Box<dyn Transport>,
        codec: Box<dyn PacketCodec>,
        table: ControlTable,
        devices: Vec<Device>,
    ) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for device in devices {
            let model = table.model(&device.model)?;
            if model.family != codec.family() {
                return Err(MotorBusError::Config(format!(
                    "motor {} is a {:?} model ({}) on a {:?} bus",
                    device.id,
                    model.family,
                    model.name,
                    codec.family()
                )));
            }
            if device.id == codec.broadcast_id() {
                return Err(MotorBusError::Config(format!(
                    "motor id {} is reserved for broadcast",
                    device.id
                )));
            }
            let id = device.id;
            if by_id.insert(id, device).is_some() {
                return Err(MotorBusError::Config(format!("duplicate motor id {}", id)));
            }
        }

        Ok(Self {
            transport,
            codec,
            table,
            devices: by_id,
            calibration: CalibrationFile::new(),
            options: BusOptions::default(),
            connected: false,
        })
    }

    pub fn with_options(mut self, options: BusOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    pub fn port_name(&self) -> &str {
        self.transport.port_name()
    }

    pub fn baudrate(&self) -> u32 {
        self.transport.baudrate()
    }

    pub fn family(&self) -> ProtocolFamily {
        self.codec.family()
    }

    pub fn control_table(&self) -> &ControlTable {
        &self.table
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device_ids(&self) -> Vec<u8> {
        self.devices.keys().copied().collect()
    }

    pub fn device(&self, id: u8) -> Result<&Device> {
        self.devices
            .get(&id)
            .ok_or(MotorBusError::UnknownDevice { id })
    }

    pub fn model_of(&self, id: u8) -> Result<&ModelSpec> {
        let device = self.device(id)?;
        self.table.model(&device.model)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Every configured motor has a calibration record
    pub fn is_calibrated(&self) -> bool {
        !self.devices.is_empty() && self.devices.keys().all(|id| self.calibration.contains(*id))
    }

    // ---- lifecycle ----

    /// Open the port. With `handshake`, ping every configured motor and check
    /// its model number.
    pub fn connect(&mut self, handshake: bool) -> Result<()> {
        if self.connected {
            return Err(MotorBusError::AlreadyConnected {
                port: self.port_name().to_string(),
            });
        }

        if let Some(path) = self.options.calibration_path.clone()
            && path.exists()
        {
            self.load_calibration(&path)?;
        }

        self.transport
            .open()
            .map_err(|e| MotorBusError::Connection {
                port: self.transport.port_name().to_string(),
                reason: e.to_string(),
            })?;
        self.connected = true;
        info!(
            "Connected to {} at {} baud ({:?})",
            self.port_name(),
            self.baudrate(),
            self.codec.family()
        );

        if handshake && let Err(e) = self.handshake() {
            match self.options.handshake {
                HandshakeMode::Strict => {
                    let _ = self.transport.close();
                    self.connected = false;
                    return Err(e);
                }
                HandshakeMode::BestEffort => warn!("Handshake incomplete: {}", e),
            }
        }
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        let mut problems = Vec::new();
        for id in self.device_ids() {
            let expected = self.model_of(id)?;
            let (name, number) = (expected.name, expected.model_number);
            match self.ping(id) {
                Ok(None) => problems.push(format!("motor {} did not respond", id)),
                Ok(Some(found)) if found != number => problems.push(format!(
                    "motor {} reports model number {}, expected {} ({})",
                    id, found, name, number
                )),
                Ok(Some(_)) => debug!("Motor {} responding", id),
                Err(e) => problems.push(format!("motor {}: {}", id, e)),
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(MotorBusError::Connection {
                port: self.port_name().to_string(),
                reason: problems.join("; "),
            })
        }
    }

    /// Close the port, disabling torque first when the options say so
    pub fn disconnect(&mut self) -> Result<()> {
        self.disconnect_with(self.options.disable_torque_on_disconnect)
    }

    pub fn disconnect_with(&mut self, disable_torque: bool) -> Result<()> {
        if !self.connected {
            return match self.options.disconnect_policy {
                DisconnectPolicy::Error => Err(MotorBusError::NotConnected {
                    port: self.port_name().to_string(),
                }),
                DisconnectPolicy::Ignore => Ok(()),
            };
        }

        let torque = if disable_torque {
            let ids = self.device_ids();
            self.disable_torque(&ids)
        } else {
            Ok(())
        };
        if let Err(e) = &torque {
            warn!("Failed to disable torque before disconnecting: {}", e);
        }

        self.connected = false;
        self.transport.close().map_err(|e| MotorBusError::Connection {
            port: self.transport.port_name().to_string(),
            reason: e.to_string(),
        })?;
        info!("Disconnected from {}", self.port_name());
        torque
    }

    /// Change the host side baudrate
    pub fn set_baudrate(&mut self, baudrate: u32) -> Result<()> {
        self.transport
            .set_baudrate(baudrate)
            .map_err(|e| wire_error(self.transport.port_name(), 0, e))
    }

    // ---- wire primitives ----

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(MotorBusError::NotConnected {
                port: self.port_name().to_string(),
            })
        }
    }

    fn check_target(&self, id: u8, instruction: Instruction) -> Result<()> {
        if id == self.codec.broadcast_id() && !instruction.allows_broadcast() {
            return Err(MotorBusError::BroadcastNotAllowed {
                instruction: instruction.name(),
            });
        }
        Ok(())
    }

    fn register_of(&self, id: u8, register: &str) -> Result<RegisterSpec> {
        Ok(self.model_of(id)?.register(register)?.clone())
    }

    fn writable_register_of(&self, id: u8, register: &str) -> Result<RegisterSpec> {
        let device = self.device(id)?;
        Ok(self.table.lookup_writable(&device.model, register)?.clone())
    }

    fn send_packet(&mut self, packet: &InstructionPacket) -> Result<()> {
        if packet.params.len() > self.codec.max_params_len() {
            return Err(MotorBusError::Config(format!(
                "{} bytes of {} parameters do not fit one frame (max {})",
                packet.params.len(),
                packet.instruction.name(),
                self.codec.max_params_len()
            )));
        }
        let frame = self.codec.encode(packet);
        debug!(
            "-> id {} {} {:02X?}",
            packet.id,
            packet.instruction.name(),
            frame
        );
        self.transport
            .clear_input()
            .map_err(|e| wire_error(self.transport.port_name(), packet.id, e))?;
        self.transport
            .send(&frame)
            .map_err(|e| wire_error(self.transport.port_name(), packet.id, e))
    }

    /// Read one status frame. `id` is only used to label errors.
    fn receive_status(&mut self, id: u8) -> Result<StatusPacket> {
        let timeout = self.options.timeout;
        let header_len = self.codec.header_len();

        let mut frame = self
            .transport
            .receive(header_len, timeout)
            .map_err(|e| wire_error(self.transport.port_name(), id, e))?;
        let total = self.codec.frame_len(&frame).map_err(|e| with_id(e, id))?;
        if total > frame.len() {
            let rest = self
                .transport
                .receive(total - frame.len(), timeout)
                .map_err(|e| wire_error(self.transport.port_name(), id, e))?;
            frame.extend(rest);
        }

        let status = self.codec.decode_status(&frame).map_err(|e| with_id(e, id))?;
        debug!(
            "<- id {} error 0x{:02X} {:02X?}",
            status.id, status.error, status.params
        );
        Ok(status)
    }

    fn check_status(&self, accept: &[u8], status: &StatusPacket) -> Result<()> {
        if !accept.contains(&status.id) {
            return Err(MotorBusError::CorruptFrame {
                id: accept.first().copied().unwrap_or(status.id),
                reason: format!("reply came from id {}", status.id),
            });
        }
        if self.codec.status_is_error(status.error) {
            return Err(MotorBusError::DeviceStatus {
                id: status.id,
                status: status.error,
            });
        }
        Ok(())
    }

    /// One request, one reply from any of `accept`
    fn exchange(&mut self, packet: &InstructionPacket, accept: &[u8]) -> Result<StatusPacket> {
        self.send_packet(packet)?;
        let status = self.receive_status(packet.id)?;
        self.check_status(accept, &status)?;
        Ok(status)
    }

    fn retrying<T>(
        &mut self,
        policy: RetryPolicy,
        mut op: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(self) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!("Attempt {}/{} failed: {}", attempt, attempts, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read_spec(&mut self, id: u8, spec: &RegisterSpec, policy: RetryPolicy) -> Result<i64> {
        let packet = InstructionPacket::new(
            id,
            Instruction::Read,
            self.codec.read_params(spec.address, spec.width as u16),
        );
        self.retrying(policy, |bus| {
            let status = bus.exchange(&packet, &[id])?;
            bus.codec
                .decode_value(&status.params, spec)
                .map_err(|e| with_id(e, id))
        })
    }

    fn write_spec(
        &mut self,
        id: u8,
        spec: &RegisterSpec,
        value: i64,
        policy: RetryPolicy,
        accept: &[u8],
    ) -> Result<()> {
        let mut params = self.codec.int_field(spec.address);
        params.extend(self.codec.encode_value(value, spec)?);
        let packet = InstructionPacket::new(id, Instruction::Write, params);
        self.retrying(policy, |bus| bus.exchange(&packet, accept))?;
        debug!("Motor {}: {} <- {}", id, spec.name, value);
        Ok(())
    }

    // ---- unit conversion ----

    fn to_user(&self, id: u8, spec: &RegisterSpec, raw: i64) -> Result<f64> {
        let device = self.device(id)?;
        if !spec.normalized || device.norm_mode == NormMode::Raw {
            return Ok(raw as f64);
        }
        let calibration = self
            .calibration
            .get(id)
            .ok_or(MotorBusError::NotCalibrated { id })?;
        let resolution = self.model_of(id)?.resolution;
        calibration::normalize(
            raw,
            calibration,
            device.norm_mode,
            resolution,
            self.options.range_policy,
        )
    }

    fn to_raw(&self, id: u8, spec: &RegisterSpec, value: f64) -> Result<i64> {
        let device = self.device(id)?;
        if !spec.normalized || device.norm_mode == NormMode::Raw {
            return raw_tick(spec, value);
        }
        let calibration = self
            .calibration
            .get(id)
            .ok_or(MotorBusError::NotCalibrated { id })?;
        let resolution = self.model_of(id)?.resolution;
        calibration::denormalize(
            value,
            calibration,
            device.norm_mode,
            resolution,
            self.options.range_policy,
        )
    }

    /// Raw tick mapped into the homed frame of a motor
    fn homed(&self, id: u8, raw: i64) -> Result<i32> {
        let resolution = self.model_of(id)?.resolution as i64;
        let homing = self
            .calibration
            .get(id)
            .map_or(0, |c| c.homing_offset as i64);
        Ok((raw - homing).rem_euclid(resolution) as i32)
    }

    // ---- single register access ----

    /// Read a register in the motor's unit
    pub fn read(&mut self, register: &str, id: u8) -> Result<f64> {
        self.read_with(register, id, self.options.retry)
    }

    pub fn read_with(&mut self, register: &str, id: u8, policy: RetryPolicy) -> Result<f64> {
        let raw = self.read_raw_with(register, id, policy)?;
        let spec = self.register_of(id, register)?;
        self.to_user(id, &spec, raw)
    }

    /// Read a register as the integer stored on the device
    pub fn read_raw(&mut self, register: &str, id: u8) -> Result<i64> {
        self.read_raw_with(register, id, self.options.retry)
    }

    pub fn read_raw_with(&mut self, register: &str, id: u8, policy: RetryPolicy) -> Result<i64> {
        self.check_target(id, Instruction::Read)?;
        let spec = self.register_of(id, register)?;
        self.ensure_connected()?;
        self.read_spec(id, &spec, policy)
    }

    /// Write a register from the motor's unit
    pub fn write(&mut self, register: &str, id: u8, value: f64) -> Result<()> {
        self.write_with(register, id, value, self.options.retry)
    }

    pub fn write_with(
        &mut self,
        register: &str,
        id: u8,
        value: f64,
        policy: RetryPolicy,
    ) -> Result<()> {
        self.check_target(id, Instruction::Write)?;
        let spec = self.writable_register_of(id, register)?;
        let raw = self.to_raw(id, &spec, value)?;
        self.write_raw_with(register, id, raw, policy)
    }

    /// Write the integer stored on the device
    pub fn write_raw(&mut self, register: &str, id: u8, value: i64) -> Result<()> {
        self.write_raw_with(register, id, value, self.options.retry)
    }

    pub fn write_raw_with(
        &mut self,
        register: &str,
        id: u8,
        value: i64,
        policy: RetryPolicy,
    ) -> Result<()> {
        self.check_target(id, Instruction::Write)?;
        let spec = self.writable_register_of(id, register)?;
        self.codec.encode_value(value, &spec)?;
        self.ensure_connected()?;
        self.write_spec(id, &spec, value, policy, &[id])
    }

    // ---- sync access ----

    fn sync_specs(&self, register: &str, ids: &[u8], writable: bool) -> Result<BTreeMap<u8, RegisterSpec>> {
        ids.iter()
            .map(|&id| -> Result<(u8, RegisterSpec)> {
                let spec = if writable {
                    self.writable_register_of(id, register)?
                } else {
                    self.register_of(id, register)?
                };
                Ok((id, spec))
            })
            .collect()
    }

    fn same_layout(specs: &BTreeMap<u8, RegisterSpec>) -> bool {
        let mut specs = specs.values();
        match specs.next() {
            Some(first) => specs.all(|s| s.address == first.address && s.width == first.width),
            None => false,
        }
    }

    fn check_sync_failures<T>(&self, operation: &'static str, report: &SyncReport<T>) -> Result<()> {
        if report.failures.is_empty() {
            return Ok(());
        }
        let total = report.values.len() + report.failures.len();
        if let Some(threshold) = self.options.sync_failure_threshold
            && report.failures.len() > threshold
        {
            return Err(MotorBusError::SyncFailed {
                operation,
                failed: report.failed_ids(),
                total,
            });
        }
        warn!(
            "Sync {} failed for {} of {} motors: {:?}",
            operation,
            report.failures.len(),
            total,
            report.failed_ids()
        );
        Ok(())
    }

    fn sync_read_collect(
        &mut self,
        register: &str,
        ids: &[u8],
        policy: RetryPolicy,
    ) -> Result<SyncReport<i64>> {
        let specs = self.sync_specs(register, ids, false)?;
        self.ensure_connected()?;

        let mut report = SyncReport::default();
        if specs.is_empty() {
            return Ok(report);
        }

        if !(self.codec.sync_read_supported() && Self::same_layout(&specs)) {
            for (&id, spec) in &specs {
                match self.read_spec(id, spec, policy) {
                    Ok(value) => {
                        report.values.insert(id, value);
                    }
                    Err(e) if e.device_id().is_some() => {
                        report.failures.insert(id, e);
                    }
                    Err(e) => return Err(e),
                }
            }
            return Ok(report);
        }

        // Retry only the motors that missed the previous round
        let mut pending: Vec<u8> = specs.keys().copied().collect();
        let attempts = policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            let failures = self.sync_read_round(&specs, &pending, &mut report.values)?;
            report.failures.retain(|id, _| !report.values.contains_key(id));
            pending = failures
                .iter()
                .filter(|(_, e)| e.is_retryable())
                .map(|(id, _)| *id)
                .collect();
            report.failures.extend(failures);
            if pending.is_empty() {
                break;
            }
            if attempt < attempts {
                debug!("Sync read attempt {}/{} missed {:?}", attempt, attempts, pending);
            }
        }
        Ok(report)
    }

    fn sync_read_round(
        &mut self,
        specs: &BTreeMap<u8, RegisterSpec>,
        ids: &[u8],
        values: &mut BTreeMap<u8, i64>,
    ) -> Result<BTreeMap<u8, MotorBusError>> {
        let mut failures = BTreeMap::new();
        let Some(first) = specs.values().next() else {
            return Ok(failures);
        };

        let mut params = self.codec.read_params(first.address, first.width as u16);
        params.extend_from_slice(ids);
        let broadcast = self.codec.broadcast_id();
        self.send_packet(&InstructionPacket::new(broadcast, Instruction::SyncRead, params))?;

        let mut waiting: Vec<u8> = ids.to_vec();
        while let Some(&next) = waiting.first() {
            match self.receive_status(next) {
                Ok(status) => {
                    let Some(pos) = waiting.iter().position(|&id| id == status.id) else {
                        warn!("Ignoring sync read reply from unexpected id {}", status.id);
                        continue;
                    };
                    let id = waiting.remove(pos);
                    if self.codec.status_is_error(status.error) {
                        failures.insert(id, MotorBusError::DeviceStatus { id, status: status.error });
                        continue;
                    }
                    let decoded = match specs.get(&id) {
                        Some(spec) => self.codec.decode_value(&status.params, spec),
                        None => Err(MotorBusError::UnknownDevice { id }),
                    };
                    match decoded {
                        Ok(value) => {
                            values.insert(id, value);
                        }
                        Err(e) => {
                            failures.insert(id, with_id(e, id));
                        }
                    }
                }
                // The stream position is lost; everything still outstanding missed
                Err(MotorBusError::CommunicationTimeout { .. }) => {
                    for id in waiting.drain(..) {
                        failures.insert(id, MotorBusError::CommunicationTimeout { id });
                    }
                }
                Err(MotorBusError::CorruptFrame { reason, .. }) => {
                    for id in waiting.drain(..) {
                        failures.insert(
                            id,
                            MotorBusError::CorruptFrame {
                                id,
                                reason: reason.clone(),
                            },
                        );
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(failures)
    }

    /// Read one register from several motors, in their units
    pub fn sync_read(&mut self, register: &str, ids: &[u8]) -> Result<SyncReport<f64>> {
        self.sync_read_with(register, ids, self.options.retry)
    }

    pub fn sync_read_with(
        &mut self,
        register: &str,
        ids: &[u8],
        policy: RetryPolicy,
    ) -> Result<SyncReport<f64>> {
        let raw = self.sync_read_collect(register, ids, policy)?;
        let mut report = SyncReport {
            values: BTreeMap::new(),
            failures: raw.failures,
        };
        for (id, value) in raw.values {
            let converted = self
                .register_of(id, register)
                .and_then(|spec| self.to_user(id, &spec, value));
            match converted {
                Ok(value) => {
                    report.values.insert(id, value);
                }
                Err(e) => {
                    report.failures.insert(id, e);
                }
            }
        }
        self.check_sync_failures("read", &report)?;
        Ok(report)
    }

    pub fn sync_read_raw(&mut self, register: &str, ids: &[u8]) -> Result<SyncReport<i64>> {
        self.sync_read_raw_with(register, ids, self.options.retry)
    }

    pub fn sync_read_raw_with(
        &mut self,
        register: &str,
        ids: &[u8],
        policy: RetryPolicy,
    ) -> Result<SyncReport<i64>> {
        let report = self.sync_read_collect(register, ids, policy)?;
        self.check_sync_failures("read", &report)?;
        Ok(report)
    }

    /// Write one register on several motors, from their units
    pub fn sync_write(&mut self, register: &str, values: &[(u8, f64)]) -> Result<SyncReport<()>> {
        self.sync_write_with(register, values, self.options.retry)
    }

    pub fn sync_write_with(
        &mut self,
        register: &str,
        values: &[(u8, f64)],
        policy: RetryPolicy,
    ) -> Result<SyncReport<()>> {
        let raw = values
            .iter()
            .map(|&(id, value)| -> Result<(u8, i64)> {
                let spec = self.writable_register_of(id, register)?;
                Ok((id, self.to_raw(id, &spec, value)?))
            })
            .collect::<Result<Vec<_>>>()?;
        self.sync_write_raw_with(register, &raw, policy)
    }

    pub fn sync_write_raw(&mut self, register: &str, values: &[(u8, i64)]) -> Result<SyncReport<()>> {
        self.sync_write_raw_with(register, values, self.options.retry)
    }

    /// One frame when the codec supports it (more if the batch outgrows the
    /// length field), otherwise one write per motor. A sync write gets no
    /// replies, so its report only lists the motors addressed.
    pub fn sync_write_raw_with(
        &mut self,
        register: &str,
        values: &[(u8, i64)],
        policy: RetryPolicy,
    ) -> Result<SyncReport<()>> {
        let ids: Vec<u8> = values.iter().map(|(id, _)| *id).collect();
        let specs = self.sync_specs(register, &ids, true)?;
        let mut encoded = Vec::with_capacity(values.len());
        for &(id, value) in values {
            if let Some(spec) = specs.get(&id) {
                encoded.push((id, value, self.codec.encode_value(value, spec)?));
            }
        }
        self.ensure_connected()?;

        let mut report = SyncReport::default();
        let batched = self.codec.sync_write_supported() && Self::same_layout(&specs);

        if batched && let Some(first) = specs.values().next() {
            let header = self.codec.read_params(first.address, first.width as u16);
            // Split batches the length field cannot describe
            let per_motor = 1 + first.width as usize;
            let batch = ((self.codec.max_params_len() - header.len()) / per_motor).max(1);
            let broadcast = self.codec.broadcast_id();
            for chunk in encoded.chunks(batch) {
                let mut params = header.clone();
                for (id, _, data) in chunk {
                    params.push(*id);
                    params.extend_from_slice(data);
                }
                self.send_packet(&InstructionPacket::new(broadcast, Instruction::SyncWrite, params))?;
            }
            report.values = ids.iter().map(|id| (*id, ())).collect();
            debug!("Sync wrote {} on {:?}", register, ids);
        } else {
            for (id, value, _) in encoded {
                let Some(spec) = specs.get(&id) else { continue };
                match self.write_spec(id, spec, value, policy, &[id]) {
                    Ok(()) => {
                        report.values.insert(id, ());
                    }
                    Err(e) if e.device_id().is_some() => {
                        report.failures.insert(id, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.check_sync_failures("write", &report)?;
        Ok(report)
    }

    // ---- discovery ----

    fn model_number_register(&self, id: u8) -> Result<RegisterSpec> {
        if let Ok(spec) = self.register_of(id, "Model_Number") {
            return Ok(spec);
        }
        let family = self.codec.family();
        self.table
            .models()
            .filter(|m| m.family == family)
            .find_map(|m| m.register("Model_Number").ok())
            .cloned()
            .ok_or_else(|| MotorBusError::UnknownRegister {
                model: format!("{:?}", family),
                register: "Model_Number".to_string(),
            })
    }

    fn model_number(&mut self, status: &StatusPacket, policy: RetryPolicy) -> Result<u16> {
        if let Some(number) = self.codec.ping_model_number(status) {
            return Ok(number);
        }
        let spec = self.model_number_register(status.id)?;
        Ok(self.read_spec(status.id, &spec, policy)? as u16)
    }

    /// Model number of the motor answering at `id`, or `None` when nothing answers
    pub fn ping(&mut self, id: u8) -> Result<Option<u16>> {
        self.ping_with(id, self.options.retry)
    }

    pub fn ping_with(&mut self, id: u8, policy: RetryPolicy) -> Result<Option<u16>> {
        if id == self.codec.broadcast_id() {
            return Err(MotorBusError::BroadcastNotAllowed {
                instruction: Instruction::Ping.name(),
            });
        }
        self.ensure_connected()?;

        let packet = InstructionPacket::new(id, Instruction::Ping, Vec::new());
        let status = match self.retrying(policy, |bus| bus.exchange(&packet, &[id])) {
            Ok(status) => status,
            Err(MotorBusError::CommunicationTimeout { .. }) => {
                debug!("No reply to ping from motor {}", id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Ok(Some(self.model_number(&status, policy)?))
    }

    /// Every motor answering a broadcast ping, with its model number
    pub fn broadcast_ping(&mut self) -> Result<BTreeMap<u8, u16>> {
        self.broadcast_ping_with(self.options.retry)
    }

    pub fn broadcast_ping_with(&mut self, policy: RetryPolicy) -> Result<BTreeMap<u8, u16>> {
        self.ensure_connected()?;
        let replies = self.retrying(policy, |bus| bus.collect_ping_replies())?;

        let mut found = BTreeMap::new();
        for status in replies {
            if self.codec.status_is_error(status.error) {
                warn!("Motor {} answered ping with status 0x{:02X}", status.id, status.error);
            }
            match self.model_number(&status, policy) {
                Ok(number) => {
                    found.insert(status.id, number);
                }
                Err(e) => warn!("Could not read model number of motor {}: {}", status.id, e),
            }
        }
        debug!("Broadcast ping found {:?}", found);
        Ok(found)
    }

    fn collect_ping_replies(&mut self) -> Result<Vec<StatusPacket>> {
        let broadcast = self.codec.broadcast_id();
        self.send_packet(&InstructionPacket::new(broadcast, Instruction::Ping, Vec::new()))?;

        let mut replies = Vec::new();
        loop {
            match self.receive_status(broadcast) {
                Ok(status) => replies.push(status),
                Err(MotorBusError::CommunicationTimeout { .. }) => return Ok(replies),
                Err(e) => return Err(e),
            }
        }
    }

    /// Broadcast-ping at every baudrate of the family. The host baudrate is
    /// restored afterwards.
    pub fn scan_port(&mut self) -> Result<BTreeMap<u32, Vec<u8>>> {
        self.ensure_connected()?;
        let original = self.baudrate();

        let result = self.scan_baudrates();
        let restored = self.set_baudrate(original);
        let found = result?;
        restored?;
        Ok(found)
    }

    fn scan_baudrates(&mut self) -> Result<BTreeMap<u32, Vec<u8>>> {
        let mut found = BTreeMap::new();
        for baudrate in self.codec.supported_baudrates() {
            self.set_baudrate(baudrate)?;
            let ids: Vec<u8> = self.broadcast_ping()?.into_keys().collect();
            if !ids.is_empty() {
                info!("Found motors {:?} at {} baud", ids, baudrate);
                found.insert(baudrate, ids);
            }
        }
        Ok(found)
    }

    // ---- torque ----

    pub fn enable_torque(&mut self, ids: &[u8]) -> Result<()> {
        self.set_torque(ids, true, self.options.retry)
    }

    pub fn enable_torque_with(&mut self, ids: &[u8], policy: RetryPolicy) -> Result<()> {
        self.set_torque(ids, true, policy)
    }

    pub fn disable_torque(&mut self, ids: &[u8]) -> Result<()> {
        self.set_torque(ids, false, self.options.retry)
    }

    pub fn disable_torque_with(&mut self, ids: &[u8], policy: RetryPolicy) -> Result<()> {
        self.set_torque(ids, false, policy)
    }

    /// Toggle torque, plus the EEPROM lock on models that have one. Every
    /// motor is attempted; the first error is returned.
    fn set_torque(&mut self, ids: &[u8], enable: bool, policy: RetryPolicy) -> Result<()> {
        let mut plan = Vec::with_capacity(ids.len());
        for &id in ids {
            let model = self.model_of(id)?;
            let torque = model.register("Torque_Enable")?.clone();
            let lock = match model.lock_register {
                Some(name) => Some(model.register(name)?.clone()),
                None => None,
            };
            plan.push((id, torque, lock));
        }
        self.ensure_connected()?;

        let value = enable as i64;
        let mut first_error = None;
        for (id, torque, lock) in plan {
            let mut result = self.write_spec(id, &torque, value, policy, &[id]);
            if result.is_ok()
                && let Some(lock) = &lock
            {
                result = self.write_spec(id, lock, value, policy, &[id]);
            }
            if let Err(e) = result {
                warn!("Failed to set torque {} on motor {}: {}", enable, id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Torque {} on {:?}", if enable { "enabled" } else { "disabled" }, ids);
                Ok(())
            }
        }
    }

    pub fn torque_enabled(&mut self, id: u8) -> Result<bool> {
        Ok(self.read_raw("Torque_Enable", id)? != 0)
    }

    /// Disable torque until the returned guard is dropped, then restore it on
    /// the motors that had it
    pub fn torque_disabled(&mut self, ids: &[u8]) -> Result<TorqueGuard<'_>> {
        let mut restore = Vec::new();
        for &id in ids {
            if self.torque_enabled(id)? {
                restore.push(id);
            }
        }
        if let Err(e) = self.disable_torque(ids) {
            if !restore.is_empty()
                && let Err(restore_err) = self.enable_torque(&restore)
            {
                warn!("Failed to restore torque on {:?}: {}", restore, restore_err);
            }
            return Err(e);
        }
        Ok(TorqueGuard::new(self, restore))
    }

    /// Run `f` with torque disabled on `ids`
    pub fn with_torque_disabled<R>(
        &mut self,
        ids: &[u8],
        f: impl FnOnce(&mut MotorsBus) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.torque_disabled(ids)?;
        let result = f(&mut *guard);
        let restored = guard.restore();
        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), restored) => {
                if let Err(restore_err) = restored {
                    warn!("Failed to restore torque: {}", restore_err);
                }
                Err(e)
            }
        }
    }

    pub fn set_operating_mode(&mut self, ids: &[u8], mode: OperatingMode) -> Result<()> {
        let mut codes = Vec::with_capacity(ids.len());
        for &id in ids {
            let model = self.model_of(id)?;
            let code = mode.code(model.family).ok_or_else(|| {
                MotorBusError::Config(format!("{} has no {:?} mode", model.name, mode))
            })?;
            self.writable_register_of(id, "Operating_Mode")?;
            codes.push((id, code));
        }

        self.with_torque_disabled(ids, |bus| {
            for &(id, code) in &codes {
                bus.write_raw("Operating_Mode", id, code as i64)?;
            }
            Ok(())
        })?;
        info!("Motors {:?} set to {:?} mode", ids, mode);
        Ok(())
    }

    // ---- calibration ----

    /// Records currently used for unit conversion
    pub fn read_calibration(&self) -> &CalibrationFile {
        &self.calibration
    }

    /// Install records. The motors are first put in the raw frame the
    /// records are expressed in (zero hardware homing, full limits).
    pub fn write_calibration(&mut self, calibration: CalibrationFile) -> Result<()> {
        for record in calibration.iter() {
            self.device(record.id)?;
            record.validate()?;
        }
        let ids: Vec<u8> = calibration.iter().map(|r| r.id).collect();

        self.with_torque_disabled(&ids, |bus| {
            for &id in &ids {
                bus.write_hardware_defaults(id)?;
                bus.hold_position(id)?;
            }
            for record in calibration.iter() {
                bus.calibration.insert(*record);
            }
            Ok(())
        })?;
        info!("Calibration written for motors {:?}", ids);
        Ok(())
    }

    /// Restore factory homing and limits and drop the records of `ids`
    pub fn reset_calibration(&mut self, ids: &[u8]) -> Result<()> {
        for &id in ids {
            self.device(id)?;
        }
        self.with_torque_disabled(ids, |bus| {
            for &id in ids {
                bus.write_hardware_defaults(id)?;
                bus.hold_position(id)?;
                bus.calibration.remove(id);
            }
            Ok(())
        })?;
        info!("Calibration reset for motors {:?}", ids);
        Ok(())
    }

    fn write_hardware_defaults(&mut self, id: u8) -> Result<()> {
        let max = self.model_of(id)?.max_position() as i64;
        for (register, value) in [
            ("Homing_Offset", 0),
            ("Min_Position_Limit", 0),
            ("Max_Position_Limit", max),
        ] {
            if self.writable_register_of(id, register).is_ok() {
                self.write_raw(register, id, value)?;
            }
        }
        Ok(())
    }

    /// Point the goal at the current pose so torque comes back without a jump
    fn hold_position(&mut self, id: u8) -> Result<()> {
        if self.writable_register_of(id, "Goal_Position").is_err() {
            return Ok(());
        }
        let present = self.read_raw("Present_Position", id)?;
        self.write_raw("Goal_Position", id, present)
    }

    /// Replace the records with the contents of a calibration file
    pub fn load_calibration(&mut self, path: &Path) -> Result<()> {
        let file = CalibrationFile::load(path)?;
        for record in file.iter() {
            self.device(record.id)?;
        }
        info!("Loaded calibration for {} motors from {}", file.len(), path.display());
        self.calibration = file;
        Ok(())
    }

    pub fn save_calibration(&self, path: &Path) -> Result<()> {
        self.calibration.save(path)?;
        info!("Saved calibration to {}", path.display());
        Ok(())
    }

    /// Homing offsets that put the current pose of each motor in the middle
    /// of its revolution. Any recorded range is reset to the full turn.
    pub fn set_half_turn_homings(&mut self, ids: &[u8]) -> Result<BTreeMap<u8, i32>> {
        for &id in ids {
            self.register_of(id, "Present_Position")?;
        }

        let offsets = self.with_torque_disabled(ids, |bus| {
            let mut offsets = BTreeMap::new();
            for &id in ids {
                let raw = bus.read_raw("Present_Position", id)?;
                let half_turn = bus.model_of(id)?.half_turn();
                offsets.insert(id, raw as i32 - half_turn);
            }
            Ok(offsets)
        })?;

        for (&id, &offset) in &offsets {
            let resolution = self.model_of(id)?.resolution;
            let mut record = MotorCalibration::with_homing(id, offset, resolution);
            if let Some(existing) = self.calibration.get(id) {
                record.drive_mode = existing.drive_mode;
            }
            self.calibration.insert(record);
        }
        info!("Half-turn homings set: {:?}", offsets);
        Ok(offsets)
    }

    /// Sample positions until `stop` returns true and report the extremes of
    /// each motor in the homed frame
    pub fn record_ranges_of_motion(
        &mut self,
        ids: &[u8],
        mut stop: impl FnMut(&BTreeMap<u8, (i32, i32)>) -> bool,
    ) -> Result<BTreeMap<u8, (i32, i32)>> {
        for &id in ids {
            self.register_of(id, "Present_Position")?;
        }
        self.ensure_connected()?;

        let mut ranges: BTreeMap<u8, (i32, i32)> = BTreeMap::new();
        loop {
            let sample = self.sync_read_collect("Present_Position", ids, self.options.retry)?;
            for (id, e) in &sample.failures {
                debug!("Skipping sample of motor {}: {}", id, e);
            }
            for (id, raw) in sample.values {
                let homed = self.homed(id, raw)?;
                let range = ranges.entry(id).or_insert((homed, homed));
                range.0 = range.0.min(homed);
                range.1 = range.1.max(homed);
            }
            if stop(&ranges) {
                break;
            }
        }

        for &id in ids {
            match ranges.get(&id) {
                Some(&(min, max)) if min < max => {}
                Some(&(min, max)) => {
                    return Err(MotorBusError::CalibrationRange {
                        id,
                        value: min as f64,
                        min,
                        max,
                    });
                }
                None => return Err(MotorBusError::CommunicationTimeout { id }),
            }
        }
        Ok(ranges)
    }

    // ---- first-time setup ----

    /// Find the single motor answering at `current_id` on any baudrate and
    /// give it `new_id` and `baudrate`. `new_id` must be configured on this
    /// bus; its model is checked against the ping reply.
    pub fn setup_device(&mut self, current_id: u8, new_id: u8, baudrate: u32) -> Result<()> {
        self.check_target(current_id, Instruction::Write)?;
        let model = self.model_of(new_id)?.clone();
        let code = baudrate_code(model.family, baudrate).ok_or_else(|| {
            MotorBusError::Config(format!("{} does not support {} baud", model.name, baudrate))
        })?;
        self.ensure_connected()?;

        let original = self.baudrate();
        let result = self.configure_single_device(&model, current_id, new_id, code, baudrate);
        let restored = self.set_baudrate(original);
        result?;
        restored?;
        if baudrate != original {
            warn!(
                "Motor {} now listens at {} baud, the bus runs at {}",
                new_id, baudrate, original
            );
        }
        info!("Motor {} configured as id {} at {} baud", current_id, new_id, baudrate);
        Ok(())
    }

    fn configure_single_device(
        &mut self,
        model: &ModelSpec,
        current_id: u8,
        new_id: u8,
        code: u8,
        baudrate: u32,
    ) -> Result<()> {
        let policy = self.options.retry;

        let mut found = None;
        for candidate in self.codec.supported_baudrates() {
            self.set_baudrate(candidate)?;
            if let Some(number) = self.ping_with(current_id, policy)? {
                found = Some((candidate, number));
                break;
            }
        }
        let Some((found_baudrate, number)) = found else {
            return Err(MotorBusError::Connection {
                port: self.port_name().to_string(),
                reason: format!("motor {} not found at any baudrate", current_id),
            });
        };
        if number != model.model_number {
            return Err(MotorBusError::Config(format!(
                "motor {} reports model number {}, expected {} ({})",
                current_id, number, model.name, model.model_number
            )));
        }
        info!("Found motor {} at {} baud", current_id, found_baudrate);

        self.write_spec(current_id, model.register("Torque_Enable")?, 0, policy, &[current_id])?;
        if let Some(lock) = model.lock_register {
            self.write_spec(current_id, model.register(lock)?, 0, policy, &[current_id])?;
        }
        if current_id != new_id {
            let spec = model.register("ID")?;
            self.write_spec(current_id, spec, new_id as i64, policy, &[current_id, new_id])?;
        }
        if found_baudrate != baudrate {
            let spec = model.register("Baud_Rate")?;
            self.write_spec(new_id, spec, code as i64, policy, &[new_id])?;
        }
        Ok(())
    }
}

impl Drop for MotorsBus {
    fn drop(&mut self) {
        if !self.connected {
            return;
        }
        if let Err(e) = self.disconnect_with(self.options.disable_torque_on_disconnect) {
            warn!("Failed to disconnect cleanly on drop: {}", e);
        }
    }
}

fn wire_error(port: &str, id: u8, err: TransportError) -> MotorBusError {
    match err {
        TransportError::Timeout { .. } => MotorBusError::CommunicationTimeout { id },
        TransportError::NotOpen { port } => MotorBusError::NotConnected { port },
        TransportError::Serial(e) => MotorBusError::Connection {
            port: port.to_string(),
            reason: e.to_string(),
        },
        TransportError::Io(e) => MotorBusError::Io(e),
    }
}

/// Nearest integer to `value`; NaN and infinities are never sent
fn raw_tick(spec: &RegisterSpec, value: f64) -> Result<i64> {
    if !value.is_finite() {
        return Err(MotorBusError::ValueOutOfRange {
            register: spec.name.to_string(),
            value,
            width: spec.width,
        });
    }
    Ok(value.round() as i64)
}

fn with_id(err: MotorBusError, id: u8) -> MotorBusError {
    match err {
        MotorBusError::CorruptFrame { reason, .. } => MotorBusError::CorruptFrame { id, reason },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::calibration::DriveMode;
    use crate::motor::codec::{FeetechCodec, codec_for};
    use crate::motor::control_table::Access;
    use crate::motor::sim::SimulatedLine;

    fn bus_on(line: &SimulatedLine, family: ProtocolFamily, devices: Vec<Device>) -> MotorsBus {
        let mut bus = MotorsBus::new(Box::new(line.transport("sim")), codec_for(family), devices)
            .unwrap()
            .with_options(BusOptions {
                disable_torque_on_disconnect: false,
                ..BusOptions::default()
            });
        bus.connect(false).unwrap();
        line.clear_history();
        bus
    }

    fn sts_bus(ids: &[u8]) -> (MotorsBus, SimulatedLine) {
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        let model = ControlTable::builtin().model("sts3215").unwrap();
        for &id in ids {
            line.add_device(id, model);
        }
        let devices = ids
            .iter()
            .map(|&id| Device::new(id, "sts3215", NormMode::Raw))
            .collect();
        let bus = bus_on(&line, ProtocolFamily::Feetech, devices);
        (bus, line)
    }

    /// STS codec that claims no sync support
    struct NoSyncCodec(FeetechCodec);

    impl PacketCodec for NoSyncCodec {
        fn family(&self) -> ProtocolFamily {
            self.0.family()
        }
        fn supported_baudrates(&self) -> Vec<u32> {
            self.0.supported_baudrates()
        }
        fn sync_read_supported(&self) -> bool {
            false
        }
        fn sync_write_supported(&self) -> bool {
            false
        }
        fn address_width(&self) -> usize {
            self.0.address_width()
        }
        fn max_params_len(&self) -> usize {
            self.0.max_params_len()
        }
        fn checksum(&self, body: &[u8]) -> Vec<u8> {
            self.0.checksum(body)
        }
        fn encode(&self, packet: &InstructionPacket) -> Vec<u8> {
            self.0.encode(packet)
        }
        fn header_len(&self) -> usize {
            self.0.header_len()
        }
        fn frame_len(&self, header: &[u8]) -> Result<usize> {
            self.0.frame_len(header)
        }
        fn decode_status(&self, frame: &[u8]) -> Result<StatusPacket> {
            self.0.decode_status(frame)
        }
        fn decode_instruction(&self, frame: &[u8]) -> Result<InstructionPacket> {
            self.0.decode_instruction(frame)
        }
        fn encode_status(&self, status: &StatusPacket) -> Vec<u8> {
            self.0.encode_status(status)
        }
        fn ping_model_number(&self, status: &StatusPacket) -> Option<u16> {
            self.0.ping_model_number(status)
        }
        fn little_endian(&self) -> bool {
            self.0.little_endian()
        }
        fn encode_signed(&self, value: i64, spec: &RegisterSpec) -> Result<u64> {
            self.0.encode_signed(value, spec)
        }
        fn decode_signed(&self, raw: u64, spec: &RegisterSpec) -> i64 {
            self.0.decode_signed(raw, spec)
        }
    }

    #[test]
    fn test_custom_model_signed_read_and_read_only_write() {
        let mut table = ControlTable::new();
        table.insert(ModelSpec::new(
            "m1",
            42,
            ProtocolFamily::Dynamixel,
            4096,
            &[RegisterSpec {
                name: "Present_Position",
                address: 132,
                width: 4,
                signed: true,
                sign_bit: None,
                access: Access::ReadOnly,
                normalized: true,
            }],
        ));
        let line = SimulatedLine::new(ProtocolFamily::Dynamixel);
        line.add_device(1, table.model("m1").unwrap());
        line.set_register(1, "Present_Position", -1234).unwrap();

        let mut bus = MotorsBus::with_table(
            Box::new(line.transport("sim")),
            codec_for(ProtocolFamily::Dynamixel),
            table,
            vec![Device::new(1, "m1", NormMode::Raw)],
        )
        .unwrap();
        bus.connect(false).unwrap();
        line.clear_history();

        assert_eq!(bus.read("Present_Position", 1).unwrap(), -1234.0);
        assert_eq!(line.frames_sent(), 1);

        line.clear_history();
        let err = bus.write("Present_Position", 1, 10.0).unwrap_err();
        assert!(matches!(
            err,
            MotorBusError::InvalidAccess {
                access: Access::ReadOnly,
                ..
            }
        ));
        assert_eq!(line.frames_sent(), 0);
        assert_eq!(bus.ping(1).unwrap(), Some(42));
    }

    #[test]
    fn test_configuration_errors_send_nothing() {
        let (mut bus, line) = sts_bus(&[1]);
        assert!(matches!(
            bus.read("Present_Position", 9),
            Err(MotorBusError::UnknownDevice { id: 9 })
        ));
        assert!(matches!(
            bus.read("No_Such_Register", 1),
            Err(MotorBusError::UnknownRegister { .. })
        ));
        assert!(matches!(
            bus.read_raw("Present_Position", 0xFE),
            Err(MotorBusError::BroadcastNotAllowed { instruction: "read" })
        ));
        assert!(matches!(
            bus.write_raw("Goal_Position", 0xFE, 10),
            Err(MotorBusError::BroadcastNotAllowed { instruction: "write" })
        ));
        assert!(matches!(
            bus.write_raw("Torque_Enable", 1, 300),
            Err(MotorBusError::ValueOutOfRange { .. })
        ));
        assert_eq!(line.frames_sent(), 0);
    }

    #[test]
    fn test_unknown_model_rejected_at_construction() {
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        let result = MotorsBus::new(
            Box::new(line.transport("sim")),
            codec_for(ProtocolFamily::Feetech),
            vec![Device::new(1, "sts9999", NormMode::Raw)],
        );
        assert!(matches!(result, Err(MotorBusError::UnknownModel { .. })));

        let mixed = MotorsBus::new(
            Box::new(line.transport("sim")),
            codec_for(ProtocolFamily::Feetech),
            vec![Device::new(1, "xl330-m288", NormMode::Raw)],
        );
        assert!(matches!(mixed, Err(MotorBusError::Config(_))));

        let duplicate = MotorsBus::new(
            Box::new(line.transport("sim")),
            codec_for(ProtocolFamily::Feetech),
            vec![
                Device::new(1, "sts3215", NormMode::Raw),
                Device::new(1, "sts3250", NormMode::Raw),
            ],
        );
        assert!(matches!(duplicate, Err(MotorBusError::Config(_))));
    }

    #[test]
    fn test_requires_connection() {
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        line.add_device(1, ControlTable::builtin().model("sts3215").unwrap());
        let mut bus = MotorsBus::new(
            Box::new(line.transport("sim")),
            codec_for(ProtocolFamily::Feetech),
            vec![Device::new(1, "sts3215", NormMode::Raw)],
        )
        .unwrap();
        assert!(matches!(
            bus.read_raw("Present_Position", 1),
            Err(MotorBusError::NotConnected { .. })
        ));
        assert!(matches!(bus.disconnect(), Err(MotorBusError::NotConnected { .. })));

        bus.connect(false).unwrap();
        assert!(bus.is_connected());
        assert!(matches!(
            bus.connect(false),
            Err(MotorBusError::AlreadyConnected { .. })
        ));
    }

    #[test]
    fn test_disconnect_policy_ignore() {
        let (mut bus, _line) = sts_bus(&[1]);
        bus.disconnect().unwrap();
        assert!(!bus.is_connected());
        assert!(bus.disconnect().is_err());

        bus = bus.with_options(BusOptions {
            disconnect_policy: DisconnectPolicy::Ignore,
            ..BusOptions::default()
        });
        assert!(bus.disconnect().is_ok());
    }

    #[test]
    fn test_disconnect_disables_torque() {
        let (mut bus, line) = sts_bus(&[1, 2]);
        bus.enable_torque(&[1, 2]).unwrap();
        assert_eq!(line.register(2, "Torque_Enable").unwrap(), 1);

        bus.disconnect_with(true).unwrap();
        assert_eq!(line.register(1, "Torque_Enable").unwrap(), 0);
        assert_eq!(line.register(2, "Torque_Enable").unwrap(), 0);
        assert_eq!(line.register(2, "Lock").unwrap(), 0);
    }

    #[test]
    fn test_handshake_modes() {
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        line.add_device(1, ControlTable::builtin().model("sts3215").unwrap());
        let devices = vec![
            Device::new(1, "sts3215", NormMode::Raw),
            Device::new(2, "sts3215", NormMode::Raw),
        ];

        let mut strict = MotorsBus::new(
            Box::new(line.transport("sim")),
            codec_for(ProtocolFamily::Feetech),
            devices.clone(),
        )
        .unwrap();
        let err = strict.connect(true).unwrap_err();
        assert!(matches!(err, MotorBusError::Connection { .. }));
        assert!(err.to_string().contains("motor 2 did not respond"));
        assert!(!strict.is_connected());

        let mut lenient = MotorsBus::new(
            Box::new(line.transport("sim")),
            codec_for(ProtocolFamily::Feetech),
            devices,
        )
        .unwrap()
        .with_options(BusOptions {
            handshake: HandshakeMode::BestEffort,
            ..BusOptions::default()
        });
        lenient.connect(true).unwrap();
        assert!(lenient.is_connected());
    }

    #[test]
    fn test_handshake_detects_wrong_model() {
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        line.add_device(1, ControlTable::builtin().model("sts3250").unwrap());
        let mut bus = MotorsBus::new(
            Box::new(line.transport("sim")),
            codec_for(ProtocolFamily::Feetech),
            vec![Device::new(1, "sts3215", NormMode::Raw)],
        )
        .unwrap();
        let err = bus.connect(true).unwrap_err();
        assert!(err.to_string().contains("reports model number 2825"));
    }

    #[test]
    fn test_retry_bound_sends_exactly_max_attempts() {
        let (mut bus, line) = sts_bus(&[1]);
        line.set_responsive(1, false);

        let err = bus
            .read_raw_with("Present_Position", 1, RetryPolicy::new(3))
            .unwrap_err();
        assert!(matches!(err, MotorBusError::CommunicationTimeout { id: 1 }));
        assert_eq!(line.frames_sent(), 3);
    }

    #[test]
    fn test_corrupt_reply() {
        let (mut bus, line) = sts_bus(&[1]);
        line.set_register(1, "Present_Position", 1000).unwrap();

        line.corrupt_next_replies(1);
        assert!(matches!(
            bus.read_raw_with("Present_Position", 1, RetryPolicy::ONCE),
            Err(MotorBusError::CorruptFrame { id: 1, .. })
        ));

        line.corrupt_next_replies(1);
        line.clear_history();
        let value = bus
            .read_raw_with("Present_Position", 1, RetryPolicy::new(2))
            .unwrap();
        assert_eq!(value, 1000);
        assert_eq!(line.frames_sent(), 2);
    }

    #[test]
    fn test_device_status_is_not_retried() {
        // Register past the end of device memory makes the device answer with an error
        let mut table = ControlTable::new();
        table.insert(ModelSpec::new(
            "sts-far",
            777,
            ProtocolFamily::Feetech,
            4096,
            &[RegisterSpec {
                name: "Far",
                address: 255,
                width: 2,
                signed: false,
                sign_bit: None,
                access: Access::ReadWrite,
                normalized: false,
            }],
        ));
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        line.add_device(1, table.model("sts-far").unwrap());
        let mut bus = MotorsBus::with_table(
            Box::new(line.transport("sim")),
            codec_for(ProtocolFamily::Feetech),
            table,
            vec![Device::new(1, "sts-far", NormMode::Raw)],
        )
        .unwrap();
        bus.connect(false).unwrap();
        line.clear_history();

        let err = bus.read_raw_with("Far", 1, RetryPolicy::new(3)).unwrap_err();
        assert!(matches!(err, MotorBusError::DeviceStatus { id: 1, .. }));
        assert_eq!(line.frames_sent(), 1);
    }

    #[test]
    fn test_sync_write_single_frame() {
        let (mut bus, line) = sts_bus(&[1, 2, 3]);
        let report = bus
            .sync_write_raw("Goal_Position", &[(1, 100), (2, 200), (3, 300)])
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(line.frames_sent(), 1);
        assert_eq!(line.sent_instructions()[0].instruction, Instruction::SyncWrite);
        assert_eq!(line.register(1, "Goal_Position").unwrap(), 100);
        assert_eq!(line.register(3, "Goal_Position").unwrap(), 300);
    }

    #[test]
    fn test_sync_write_falls_back_to_sequential() {
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        let model = ControlTable::builtin().model("sts3215").unwrap();
        for id in 1..=3 {
            line.add_device(id, model);
        }
        let mut bus = MotorsBus::new(
            Box::new(line.transport("sim")),
            Box::new(NoSyncCodec(FeetechCodec::sts())),
            (1..=3).map(|id| Device::new(id, "sts3215", NormMode::Raw)).collect(),
        )
        .unwrap();
        bus.connect(false).unwrap();
        line.clear_history();

        bus.sync_write_raw("Goal_Velocity", &[(1, -50), (2, 0), (3, 50)])
            .unwrap();
        assert_eq!(line.frames_sent(), 3);
        assert_eq!(line.register(1, "Goal_Velocity").unwrap(), -50);

        line.clear_history();
        let report = bus.sync_read_raw("Goal_Velocity", &[1, 2, 3]).unwrap();
        assert_eq!(line.frames_sent(), 3);
        assert_eq!(report.get(3), Some(&50));
    }

    #[test]
    fn test_sync_read_single_frame_and_partial_report() {
        let (mut bus, line) = sts_bus(&[1, 2, 3]);
        for id in 1..=3u8 {
            line.set_register(id, "Present_Position", 1000 + id as i64).unwrap();
        }

        let report = bus.sync_read_raw("Present_Position", &[1, 2, 3]).unwrap();
        assert_eq!(line.frames_sent(), 1);
        assert_eq!(report.values.len(), 3);
        assert_eq!(report.get(2), Some(&1002));

        line.set_responsive(2, false);
        line.clear_history();
        let report = bus
            .sync_read_raw_with("Present_Position", &[1, 2, 3], RetryPolicy::new(2))
            .unwrap();
        // One retry round for the missing motor only
        assert_eq!(line.frames_sent(), 2);
        assert_eq!(line.sent_instructions()[1].params[2..], [2]);
        assert_eq!(report.failed_ids(), vec![2]);
        assert!(matches!(
            report.failures[&2],
            MotorBusError::CommunicationTimeout { id: 2 }
        ));
        assert_eq!(report.get(3), Some(&1003));
    }

    #[test]
    fn test_sync_failure_threshold() {
        let (bus, line) = sts_bus(&[1, 2, 3]);
        let mut bus = bus.with_options(BusOptions {
            sync_failure_threshold: Some(0),
            disable_torque_on_disconnect: false,
            ..BusOptions::default()
        });
        line.set_responsive(3, false);

        let err = bus.sync_read_raw("Present_Position", &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            MotorBusError::SyncFailed {
                operation: "read",
                ref failed,
                total: 3,
            } if failed == &vec![3]
        ));
    }

    #[test]
    fn test_scs_sync_read_is_sequential() {
        let line = SimulatedLine::new(ProtocolFamily::FeetechScs);
        let model = ControlTable::builtin().model("scs0009").unwrap();
        line.add_device(1, model);
        line.add_device(2, model);
        line.set_register(2, "Present_Position", 700).unwrap();
        let mut bus = bus_on(
            &line,
            ProtocolFamily::FeetechScs,
            vec![
                Device::new(1, "scs0009", NormMode::Raw),
                Device::new(2, "scs0009", NormMode::Raw),
            ],
        );

        let report = bus.sync_read_raw("Present_Position", &[1, 2]).unwrap();
        assert_eq!(line.frames_sent(), 2);
        assert_eq!(report.get(2), Some(&700));
    }

    #[test]
    fn test_broadcast_ping_returns_responsive_ids() {
        let (mut bus, line) = sts_bus(&[1, 2, 3]);
        line.set_responsive(2, false);

        let found = bus.broadcast_ping().unwrap();
        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(found[&1], 777);
    }

    #[test]
    fn test_dynamixel_ping_carries_model_number() {
        let line = SimulatedLine::new(ProtocolFamily::Dynamixel);
        let table = ControlTable::builtin();
        line.add_device(1, table.model("xl330-m288").unwrap());
        line.add_device(5, table.model("xl430-w250").unwrap());
        let mut bus = bus_on(
            &line,
            ProtocolFamily::Dynamixel,
            vec![Device::new(1, "xl330-m288", NormMode::Raw)],
        );

        assert_eq!(bus.ping(1).unwrap(), Some(1200));
        assert_eq!(line.frames_sent(), 1);
        assert_eq!(bus.ping(7).unwrap(), None);

        let found = bus.broadcast_ping().unwrap();
        assert_eq!(found, BTreeMap::from([(1, 1200), (5, 1060)]));
    }

    #[test]
    fn test_scan_port_finds_devices_per_baudrate() {
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        let model = ControlTable::builtin().model("sts3215").unwrap();
        line.add_device_at(1, model, 1_000_000);
        line.add_device_at(2, model, 57_600);
        line.add_device_at(3, model, 57_600);
        let mut bus = bus_on(&line, ProtocolFamily::Feetech, Vec::new());

        let found = bus.scan_port().unwrap();
        assert_eq!(
            found,
            BTreeMap::from([(1_000_000, vec![1]), (57_600, vec![2, 3])])
        );
        assert_eq!(bus.baudrate(), 1_000_000);
    }

    #[test]
    fn test_torque_guard_restores_previous_state() {
        let (mut bus, line) = sts_bus(&[1, 2, 3]);
        bus.enable_torque(&[1, 2]).unwrap();
        assert_eq!(line.register(1, "Lock").unwrap(), 1);

        {
            let mut guard = bus.torque_disabled(&[1, 2, 3]).unwrap();
            assert_eq!(guard.restores(), &[1, 2]);
            assert_eq!(line.register(1, "Torque_Enable").unwrap(), 0);
            assert_eq!(line.register(1, "Lock").unwrap(), 0);
            guard.write_raw("Max_Position_Limit", 1, 3000).unwrap();
        }

        assert_eq!(line.register(1, "Torque_Enable").unwrap(), 1);
        assert_eq!(line.register(2, "Torque_Enable").unwrap(), 1);
        assert_eq!(line.register(3, "Torque_Enable").unwrap(), 0);
        assert_eq!(line.register(1, "Max_Position_Limit").unwrap(), 3000);
    }

    #[test]
    fn test_with_torque_disabled_restores_on_error() {
        let (mut bus, line) = sts_bus(&[1]);
        bus.enable_torque(&[1]).unwrap();

        let result: Result<()> = bus.with_torque_disabled(&[1], |bus| {
            assert_eq!(bus.read_raw("Torque_Enable", 1)?, 0);
            Err(MotorBusError::Config("abort".into()))
        });
        assert!(matches!(result, Err(MotorBusError::Config(_))));
        assert_eq!(line.register(1, "Torque_Enable").unwrap(), 1);
    }

    #[test]
    fn test_half_turn_homings() {
        let (mut bus, line) = sts_bus(&[1, 2]);
        line.set_register(1, "Present_Position", 2048).unwrap();
        line.set_register(2, "Present_Position", 3072).unwrap();

        let offsets = bus.set_half_turn_homings(&[1, 2]).unwrap();
        assert_eq!(offsets, BTreeMap::from([(1, 0), (2, 1024)]));

        let record = bus.read_calibration().get(2).unwrap();
        assert_eq!(record.homing_offset, 1024);
        assert_eq!((record.range_min, record.range_max), (0, 4095));
        assert!(bus.is_calibrated());
    }

    #[test]
    fn test_normalized_read_and_write() {
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        line.add_device(1, ControlTable::builtin().model("sts3215").unwrap());
        let mut bus = bus_on(
            &line,
            ProtocolFamily::Feetech,
            vec![Device::new(1, "sts3215", NormMode::RangeM100To100)],
        );
        line.set_register(1, "Present_Position", 2000).unwrap();
        assert!(matches!(
            bus.read("Present_Position", 1),
            Err(MotorBusError::NotCalibrated { id: 1 })
        ));

        line.set_register(1, "Homing_Offset", 100).unwrap();
        line.set_register(1, "Max_Position_Limit", 2000).unwrap();
        let file: CalibrationFile = [MotorCalibration::new(1, DriveMode::Normal, 0, 1000, 3000).unwrap()]
            .into_iter()
            .collect();
        bus.write_calibration(file).unwrap();

        assert_eq!(line.register(1, "Homing_Offset").unwrap(), 0);
        assert_eq!(line.register(1, "Min_Position_Limit").unwrap(), 0);
        assert_eq!(line.register(1, "Max_Position_Limit").unwrap(), 4095);
        assert!(bus.is_calibrated());

        assert_eq!(bus.read("Present_Position", 1).unwrap(), 0.0);
        bus.write("Goal_Position", 1, 100.0).unwrap();
        assert_eq!(line.register(1, "Goal_Position").unwrap(), 3000);
        // Torque_Enable is not position-like and stays raw
        assert_eq!(bus.read("Torque_Enable", 1).unwrap(), 0.0);

        bus.reset_calibration(&[1]).unwrap();
        assert!(!bus.is_calibrated());
    }

    #[test]
    fn test_calibration_file_round_trip_through_bus() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");

        let (mut bus, line) = sts_bus(&[1, 2]);
        line.set_register(1, "Present_Position", 1000).unwrap();
        line.set_register(2, "Present_Position", 3000).unwrap();
        bus.set_half_turn_homings(&[1, 2]).unwrap();
        bus.save_calibration(&path).unwrap();

        let (mut other, _other_line) = sts_bus(&[1, 2]);
        other.load_calibration(&path).unwrap();
        assert_eq!(other.read_calibration(), bus.read_calibration());

        let (mut small, _small_line) = sts_bus(&[1]);
        assert!(matches!(
            small.load_calibration(&path),
            Err(MotorBusError::UnknownDevice { id: 2 })
        ));
    }

    #[test]
    fn test_calibration_loaded_on_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        let file: CalibrationFile = [MotorCalibration::with_homing(1, 10, 4096)].into_iter().collect();
        file.save(&path).unwrap();

        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        line.add_device(1, ControlTable::builtin().model("sts3215").unwrap());
        let mut bus = MotorsBus::new(
            Box::new(line.transport("sim")),
            codec_for(ProtocolFamily::Feetech),
            vec![Device::new(1, "sts3215", NormMode::Degrees)],
        )
        .unwrap()
        .with_options(BusOptions {
            calibration_path: Some(path),
            ..BusOptions::default()
        });
        assert!(!bus.is_calibrated());
        bus.connect(false).unwrap();
        assert!(bus.is_calibrated());
    }

    #[test]
    fn test_record_ranges_of_motion() {
        let (mut bus, line) = sts_bus(&[1, 2]);
        line.script_positions(1, [2048, 1500, 2600, 2048]);
        line.script_positions(2, [1000]);

        let mut samples = 0;
        let err = bus
            .record_ranges_of_motion(&[1, 2], |_| {
                samples += 1;
                samples >= 4
            })
            .unwrap_err();
        assert!(matches!(err, MotorBusError::CalibrationRange { id: 2, .. }));

        line.script_positions(1, [2048, 1500, 2600, 2048]);
        let mut samples = 0;
        let ranges = bus
            .record_ranges_of_motion(&[1], |_| {
                samples += 1;
                samples >= 4
            })
            .unwrap();
        assert_eq!(ranges[&1], (1500, 2600));
    }

    #[test]
    fn test_set_operating_mode() {
        let (mut bus, line) = sts_bus(&[1, 2]);
        bus.set_operating_mode(&[1, 2], OperatingMode::Velocity).unwrap();
        assert_eq!(line.register(2, "Operating_Mode").unwrap(), 1);
        assert!(matches!(
            bus.set_operating_mode(&[1], OperatingMode::ExtendedPosition),
            Err(MotorBusError::Config(_))
        ));
    }

    #[test]
    fn test_setup_device_changes_id_and_baudrate() {
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        line.add_device_at(1, ControlTable::builtin().model("sts3215").unwrap(), 57_600);
        let mut bus = bus_on(
            &line,
            ProtocolFamily::Feetech,
            vec![Device::new(3, "sts3215", NormMode::Raw)],
        );

        bus.setup_device(1, 3, 1_000_000).unwrap();
        assert_eq!(line.device_ids(), vec![3]);
        assert_eq!(bus.baudrate(), 1_000_000);
        assert_eq!(bus.ping(3).unwrap(), Some(777));

        assert!(matches!(
            bus.setup_device(9, 3, 1_000_000),
            Err(MotorBusError::Connection { .. })
        ));
    }

    #[test]
    fn test_non_finite_writes_send_nothing() {
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        let model = ControlTable::builtin().model("sts3215").unwrap();
        line.add_device(1, model);
        line.add_device(2, model);
        let mut bus = bus_on(
            &line,
            ProtocolFamily::Feetech,
            vec![
                Device::new(1, "sts3215", NormMode::Raw),
                Device::new(2, "sts3215", NormMode::RangeM100To100),
            ],
        );
        let file: CalibrationFile = [MotorCalibration::new(2, DriveMode::Normal, 1024, 1000, 3000).unwrap()]
            .into_iter()
            .collect();
        bus.write_calibration(file).unwrap();
        line.clear_history();

        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                bus.write("Goal_Position", 1, value),
                Err(MotorBusError::ValueOutOfRange { .. })
            ));
            assert!(matches!(
                bus.write("Goal_Position", 2, value),
                Err(MotorBusError::CalibrationRange { id: 2, .. })
            ));
            assert!(bus.sync_write("Goal_Position", &[(1, 0.0), (2, value)]).is_err());
            assert!(bus.sync_write("Goal_Position", &[(1, value)]).is_err());
        }
        assert_eq!(line.frames_sent(), 0);
    }

    #[test]
    fn test_handshake_wire_errors_fail_as_connection() {
        let line = SimulatedLine::new(ProtocolFamily::Feetech);
        line.add_device(1, ControlTable::builtin().model("sts3215").unwrap());
        let mut bus = MotorsBus::new(
            Box::new(line.transport("sim")),
            codec_for(ProtocolFamily::Feetech),
            vec![
                Device::new(1, "sts3215", NormMode::Raw),
                Device::new(2, "sts3215", NormMode::Raw),
            ],
        )
        .unwrap();

        line.corrupt_next_replies(1);
        let err = bus.connect(true).unwrap_err();
        assert!(matches!(err, MotorBusError::Connection { .. }));
        // Every motor is still checked after the first failure
        let message = err.to_string();
        assert!(message.contains("motor 1: Corrupt frame"));
        assert!(message.contains("motor 2 did not respond"));
        assert!(!bus.is_connected());
    }

    #[test]
    fn test_dynamixel_sync_round_trip() {
        let line = SimulatedLine::new(ProtocolFamily::Dynamixel);
        let model = ControlTable::builtin().model("xl430-w250").unwrap();
        line.add_device(1, model);
        line.add_device(2, model);
        let mut bus = bus_on(
            &line,
            ProtocolFamily::Dynamixel,
            vec![
                Device::new(1, "xl430-w250", NormMode::Raw),
                Device::new(2, "xl430-w250", NormMode::Raw),
            ],
        );

        // Little-endian bytes FF FF FD 00 must be stuffed inside the frame
        let stuffed = 0x00FD_FFFF;
        let report = bus
            .sync_write_raw("Goal_Position", &[(1, stuffed), (2, -1000)])
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(line.frames_sent(), 1);
        assert_eq!(line.sent_instructions()[0].instruction, Instruction::SyncWrite);
        assert_eq!(line.register(1, "Goal_Position").unwrap(), stuffed);
        assert_eq!(line.register(2, "Goal_Position").unwrap(), -1000);

        line.set_register(1, "Present_Position", stuffed).unwrap();
        line.set_register(2, "Present_Position", -42).unwrap();
        line.clear_history();
        let report = bus.sync_read_raw("Present_Position", &[1, 2]).unwrap();
        assert_eq!(line.frames_sent(), 1);
        assert_eq!(line.sent_instructions()[0].instruction, Instruction::SyncRead);
        assert_eq!(report.values, BTreeMap::from([(1, stuffed), (2, -42)]));
        assert!(report.is_complete());
    }

    #[test]
    fn test_large_sync_write_splits_frames() {
        let ids: Vec<u8> = (1..=100).collect();
        let (mut bus, line) = sts_bus(&ids);
        let values: Vec<(u8, i64)> = ids.iter().map(|&id| (id, id as i64 * 10)).collect();

        let report = bus.sync_write_raw("Goal_Position", &values).unwrap();
        assert!(report.is_complete());
        // 83 three-byte entries fill one frame
        assert_eq!(line.frames_sent(), 2);
        for packet in line.sent_instructions() {
            assert_eq!(packet.instruction, Instruction::SyncWrite);
            assert!(packet.params.len() <= 253);
        }
        assert_eq!(line.register(1, "Goal_Position").unwrap(), 10);
        assert_eq!(line.register(83, "Goal_Position").unwrap(), 830);
        assert_eq!(line.register(100, "Goal_Position").unwrap(), 1000);
    }

    #[test]
    fn test_write_calibration_holds_current_pose() {
        let (mut bus, line) = sts_bus(&[1]);
        line.set_register(1, "Homing_Offset", 300).unwrap();
        line.set_register(1, "Goal_Position", 500).unwrap();
        line.set_register(1, "Present_Position", 1800).unwrap();
        bus.enable_torque(&[1]).unwrap();
        line.clear_history();

        let file: CalibrationFile = [MotorCalibration::new(1, DriveMode::Normal, 0, 1000, 3000).unwrap()]
            .into_iter()
            .collect();
        bus.write_calibration(file).unwrap();

        assert_eq!(line.register(1, "Homing_Offset").unwrap(), 0);
        assert_eq!(line.register(1, "Goal_Position").unwrap(), 1800);
        assert_eq!(line.register(1, "Torque_Enable").unwrap(), 1);
        assert!(bus.is_calibrated());

        // The goal is in place before torque comes back on
        let model = ControlTable::builtin().model("sts3215").unwrap();
        let goal = model.register("Goal_Position").unwrap().address;
        let torque = model.register("Torque_Enable").unwrap().address;
        let writes: Vec<u16> = line
            .sent_instructions()
            .iter()
            .filter(|p| p.instruction == Instruction::Write)
            .map(|p| p.params[0] as u16)
            .collect();
        let goal_at = writes.iter().position(|&a| a == goal).unwrap();
        let torque_on_at = writes.iter().rposition(|&a| a == torque).unwrap();
        assert!(goal_at < torque_on_at);
    }
}
