// Bus configuration: compile-time defaults and the TOML file the CLI reads
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::motor::control_table::baudrate_table;
use crate::motor::error::{MotorBusError, Result};
use crate::motor::transport::{DEFAULT_BAUDRATE, DEFAULT_TIMEOUT_MS, SerialTransport, Transport};
use crate::motor::{
    BROADCAST_ID, BusOptions, ControlTable, Device, DisconnectPolicy, HandshakeMode, MotorsBus,
    ProtocolFamily, RangePolicy, RetryPolicy, SimulatedLine, codec_for,
};

// Serial port used when the config file names none
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

// Attempts per wire exchange, first try included
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// Sampling period while recording ranges of motion
pub const RANGE_SAMPLE_PERIOD: Duration = Duration::from_millis(20);

/// One bus and the motors on it
#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    pub protocol: ProtocolFamily,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub handshake: HandshakeMode,

    #[serde(default)]
    pub disconnect_policy: DisconnectPolicy,

    #[serde(default = "default_disable_torque_on_disconnect")]
    pub disable_torque_on_disconnect: bool,

    #[serde(default)]
    pub calibration_path: Option<PathBuf>,

    #[serde(default)]
    pub range_policy: RangePolicy,

    #[serde(default)]
    pub sync_failure_threshold: Option<usize>,

    #[serde(default)]
    pub devices: Vec<Device>,
}

// Default value functions
fn default_port() -> String { DEFAULT_PORT.to_string() }
fn default_baudrate() -> u32 { DEFAULT_BAUDRATE }
fn default_timeout_ms() -> u64 { DEFAULT_TIMEOUT_MS }
fn default_max_attempts() -> u32 { DEFAULT_MAX_ATTEMPTS }
fn default_disable_torque_on_disconnect() -> bool { true }

impl BusConfig {
    /// Load and validate a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: BusConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(MotorBusError::Config("port must not be empty".into()));
        }
        if !baudrate_table(self.protocol)
            .iter()
            .any(|(_, b)| *b == self.baudrate)
        {
            return Err(MotorBusError::Config(format!(
                "baudrate {} is not supported by {:?}",
                self.baudrate, self.protocol
            )));
        }
        if self.timeout_ms == 0 {
            return Err(MotorBusError::Config("timeout_ms must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(MotorBusError::Config("max_attempts must be at least 1".into()));
        }

        let table = ControlTable::builtin();
        let mut seen = BTreeSet::new();
        for device in &self.devices {
            if device.id == BROADCAST_ID {
                return Err(MotorBusError::Config(format!(
                    "motor id {} is reserved for broadcast",
                    device.id
                )));
            }
            if !seen.insert(device.id) {
                return Err(MotorBusError::Config(format!("duplicate motor id {}", device.id)));
            }
            let model = table.model(&device.model)?;
            if model.family != self.protocol {
                return Err(MotorBusError::Config(format!(
                    "motor {} ({}) does not speak {:?}",
                    device.id, device.model, self.protocol
                )));
            }
        }
        Ok(())
    }

    pub fn options(&self) -> BusOptions {
        BusOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            retry: RetryPolicy::new(self.max_attempts),
            handshake: self.handshake,
            disconnect_policy: self.disconnect_policy,
            disable_torque_on_disconnect: self.disable_torque_on_disconnect,
            range_policy: self.range_policy,
            sync_failure_threshold: self.sync_failure_threshold,
            calibration_path: self.calibration_path.clone(),
        }
    }

    /// Bus on the configured serial port, not yet connected
    pub fn serial_bus(&self) -> Result<MotorsBus> {
        let transport = SerialTransport::new(&self.port, self.baudrate);
        Ok(MotorsBus::new(Box::new(transport), codec_for(self.protocol), self.devices.clone())?
            .with_options(self.options()))
    }

    /// Bus on a simulated line holding every configured motor, each resting
    /// at mid-turn. The line handle is returned for inspection.
    pub fn simulated_bus(&self) -> Result<(MotorsBus, SimulatedLine)> {
        let line = SimulatedLine::new(self.protocol);
        let table = ControlTable::builtin();
        for device in &self.devices {
            let model = table.model(&device.model)?;
            line.add_device_at(device.id, model, self.baudrate);
            line.set_register(device.id, "Present_Position", model.half_turn() as i64)?;
        }

        let mut transport = line.transport(format!("sim:{}", self.port));
        transport
            .set_baudrate(self.baudrate)
            .map_err(|e| MotorBusError::Config(e.to_string()))?;
        let bus = MotorsBus::new(Box::new(transport), codec_for(self.protocol), self.devices.clone())?
            .with_options(self.options());
        Ok((bus, line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::NormMode;

    const SAMPLE: &str = r#"
        port = "/dev/ttyACM0"
        protocol = "feetech"
        max_attempts = 2
        handshake = "best_effort"
        sync_failure_threshold = 1

        [[devices]]
        id = 1
        model = "sts3215"
        norm_mode = "degrees"

        [[devices]]
        id = 2
        model = "sts3215"
    "#;

    #[test]
    fn test_parse_with_defaults() {
        let config = BusConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.port, "/dev/ttyACM0");
        assert_eq!(config.baudrate, DEFAULT_BAUDRATE);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.handshake, HandshakeMode::BestEffort);
        assert!(config.disable_torque_on_disconnect);
        assert_eq!(config.devices[0].norm_mode, NormMode::Degrees);
        assert_eq!(config.devices[1].norm_mode, NormMode::Raw);

        let options = config.options();
        assert_eq!(options.retry.max_attempts, 2);
        assert_eq!(options.sync_failure_threshold, Some(1));
        assert_eq!(options.range_policy, RangePolicy::Clamp);
    }

    #[test]
    fn test_validation_errors() {
        let bad_model = r#"
            protocol = "feetech"
            [[devices]]
            id = 1
            model = "sts9999"
        "#;
        assert!(matches!(
            BusConfig::from_toml(bad_model),
            Err(MotorBusError::UnknownModel { .. })
        ));

        let wrong_family = r#"
            protocol = "dynamixel"
            [[devices]]
            id = 1
            model = "sts3215"
        "#;
        assert!(matches!(
            BusConfig::from_toml(wrong_family),
            Err(MotorBusError::Config(_))
        ));

        let duplicate = r#"
            protocol = "feetech"
            [[devices]]
            id = 1
            model = "sts3215"
            [[devices]]
            id = 1
            model = "sts3250"
        "#;
        assert!(BusConfig::from_toml(duplicate).is_err());

        let bad_baud = r#"
            protocol = "dynamixel"
            baudrate = 500000
        "#;
        assert!(BusConfig::from_toml(bad_baud).is_err());

        assert!(matches!(
            BusConfig::from_toml("protocol = 3"),
            Err(MotorBusError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = BusConfig::from_toml(include_str!("../config/bus.toml")).unwrap();
        assert_eq!(config.protocol, ProtocolFamily::Feetech);
        assert_eq!(config.devices.len(), 6);
        assert_eq!(config.devices[5].norm_mode, NormMode::Range0To100);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.toml");
        fs::write(&path, SAMPLE).unwrap();

        let config = BusConfig::load(&path).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert!(BusConfig::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_simulated_bus_answers_for_configured_motors() {
        let config = BusConfig::from_toml(SAMPLE).unwrap();
        let (mut bus, line) = config.simulated_bus().unwrap();
        bus.connect(true).unwrap();

        assert_eq!(line.device_ids(), vec![1, 2]);
        assert_eq!(bus.read_raw("Present_Position", 2).unwrap(), 2048);
        assert_eq!(bus.broadcast_ping().unwrap().len(), 2);
    }
}
