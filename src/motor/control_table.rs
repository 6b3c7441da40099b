// Static control tables for the supported servo models
//
// Each model maps register names to (address, width, signedness, access).
// Tables are plain data: adding a model never touches the bus or the codecs.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::error::{MotorBusError, Result};

/// Protocol family a model speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    /// Feetech STS/SMS series (little-endian, sign-magnitude)
    Feetech,
    /// Feetech SCS series (big-endian, sign-magnitude, no sync read)
    FeetechScs,
    /// Dynamixel Protocol 2.0 (little-endian, two's complement)
    Dynamixel,
}

/// Whether a register may be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Location and encoding of one register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSpec {
    pub name: &'static str,
    pub address: u16,
    pub width: u8,
    pub signed: bool,
    /// Bit carrying the sign for sign-magnitude registers. Defaults to the
    /// top bit of the register when unset.
    pub sign_bit: Option<u8>,
    pub access: Access,
    /// Position-like registers go through calibration on read/write
    pub normalized: bool,
}

impl RegisterSpec {
    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }

    /// Sign bit used for sign-magnitude encoding
    pub fn sign_bit(&self) -> u8 {
        self.sign_bit.unwrap_or(self.width * 8 - 1)
    }
}

/// Everything the bus needs to know about one servo model
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub name: &'static str,
    pub model_number: u16,
    pub family: ProtocolFamily,
    /// Encoder ticks per full revolution
    pub resolution: u32,
    /// Register that must be cleared before EEPROM writes (Feetech only)
    pub lock_register: Option<&'static str>,
    registers: BTreeMap<&'static str, RegisterSpec>,
}

impl ModelSpec {
    pub fn new(
        name: &'static str,
        model_number: u16,
        family: ProtocolFamily,
        resolution: u32,
        registers: &[RegisterSpec],
    ) -> Self {
        Self {
            name,
            model_number,
            family,
            resolution,
            lock_register: None,
            registers: registers.iter().map(|r| (r.name, r.clone())).collect(),
        }
    }

    pub fn with_lock_register(mut self, register: &'static str) -> Self {
        self.lock_register = Some(register);
        self
    }

    pub fn register(&self, name: &str) -> Result<&RegisterSpec> {
        self.registers
            .get(name)
            .ok_or_else(|| MotorBusError::UnknownRegister {
                model: self.name.to_string(),
                register: name.to_string(),
            })
    }

    pub fn registers(&self) -> impl Iterator<Item = &RegisterSpec> {
        self.registers.values()
    }

    /// Midpoint of a full revolution, in ticks
    pub fn half_turn(&self) -> i32 {
        (self.resolution / 2) as i32
    }

    /// Largest raw position the encoder reports
    pub fn max_position(&self) -> i32 {
        self.resolution as i32 - 1
    }
}

/// Lookup table of models keyed by model string
#[derive(Debug, Clone, Default)]
pub struct ControlTable {
    models: BTreeMap<String, ModelSpec>,
}

impl ControlTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every model this crate ships
    pub fn builtin() -> &'static ControlTable {
        static TABLE: OnceLock<ControlTable> = OnceLock::new();
        TABLE.get_or_init(|| {
            let mut table = ControlTable::new();
            for model in feetech_models().into_iter().chain(dynamixel_models()) {
                table.insert(model);
            }
            table
        })
    }

    pub fn insert(&mut self, model: ModelSpec) {
        self.models.insert(model.name.to_string(), model);
    }

    pub fn model(&self, model: &str) -> Result<&ModelSpec> {
        self.models
            .get(model)
            .ok_or_else(|| MotorBusError::UnknownModel {
                model: model.to_string(),
            })
    }

    /// Resolve a register on a model
    pub fn lookup(&self, model: &str, register: &str) -> Result<&RegisterSpec> {
        self.model(model)?.register(register)
    }

    /// Resolve a register and make sure it may be written
    pub fn lookup_writable(&self, model: &str, register: &str) -> Result<&RegisterSpec> {
        let spec = self.lookup(model, register)?;
        if !spec.is_writable() {
            return Err(MotorBusError::InvalidAccess {
                model: model.to_string(),
                register: register.to_string(),
                access: spec.access,
            });
        }
        Ok(spec)
    }

    /// Map a model number reported by a ping back to a model name
    pub fn model_for_number(&self, family: ProtocolFamily, number: u16) -> Option<&ModelSpec> {
        self.models
            .values()
            .find(|m| m.family == family && m.model_number == number)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }
}

/// Value to write into `Baud_Rate` for a given baudrate
pub fn baudrate_code(family: ProtocolFamily, baudrate: u32) -> Option<u8> {
    baudrate_table(family)
        .iter()
        .find(|(_, b)| *b == baudrate)
        .map(|(code, _)| *code)
}

/// (register code, baudrate) pairs understood by a family
pub fn baudrate_table(family: ProtocolFamily) -> &'static [(u8, u32)] {
    match family {
        ProtocolFamily::Feetech | ProtocolFamily::FeetechScs => &[
            (0, 1_000_000),
            (1, 500_000),
            (2, 250_000),
            (3, 128_000),
            (4, 115_200),
            (5, 57_600),
            (6, 38_400),
            (7, 19_200),
        ],
        ProtocolFamily::Dynamixel => &[
            (0, 9_600),
            (1, 57_600),
            (2, 115_200),
            (3, 1_000_000),
            (4, 2_000_000),
            (5, 3_000_000),
            (6, 4_000_000),
        ],
    }
}

const fn reg(name: &'static str, address: u16, width: u8) -> RegisterSpec {
    RegisterSpec {
        name,
        address,
        width,
        signed: false,
        sign_bit: None,
        access: Access::ReadWrite,
        normalized: false,
    }
}

const fn ro(name: &'static str, address: u16, width: u8) -> RegisterSpec {
    RegisterSpec {
        access: Access::ReadOnly,
        ..reg(name, address, width)
    }
}

const fn signed(spec: RegisterSpec) -> RegisterSpec {
    RegisterSpec {
        signed: true,
        ..spec
    }
}

const fn sign_bit(spec: RegisterSpec, bit: u8) -> RegisterSpec {
    RegisterSpec {
        signed: true,
        sign_bit: Some(bit),
        ..spec
    }
}

const fn position(spec: RegisterSpec) -> RegisterSpec {
    RegisterSpec {
        normalized: true,
        ..spec
    }
}

// Feetech STS/SMS series. EEPROM area ends at 39, RAM starts at Torque_Enable.
const STS_REGISTERS: &[RegisterSpec] = &[
    ro("Firmware_Major_Version", 0, 1),
    ro("Firmware_Minor_Version", 1, 1),
    ro("Model_Number", 3, 2),
    reg("ID", 5, 1),
    reg("Baud_Rate", 6, 1),
    reg("Return_Delay_Time", 7, 1),
    reg("Response_Status_Level", 8, 1),
    reg("Min_Position_Limit", 9, 2),
    reg("Max_Position_Limit", 11, 2),
    reg("Max_Temperature_Limit", 13, 1),
    reg("Max_Voltage_Limit", 14, 1),
    reg("Min_Voltage_Limit", 15, 1),
    reg("Max_Torque_Limit", 16, 2),
    reg("Phase", 18, 1),
    reg("Unloading_Condition", 19, 1),
    reg("LED_Alarm_Condition", 20, 1),
    reg("P_Coefficient", 21, 1),
    reg("D_Coefficient", 22, 1),
    reg("I_Coefficient", 23, 1),
    reg("Minimum_Startup_Force", 24, 2),
    reg("CW_Dead_Zone", 26, 1),
    reg("CCW_Dead_Zone", 27, 1),
    reg("Protection_Current", 28, 2),
    reg("Angular_Resolution", 30, 1),
    sign_bit(reg("Homing_Offset", 31, 2), 11),
    reg("Operating_Mode", 33, 1),
    reg("Protective_Torque", 34, 1),
    reg("Protection_Time", 35, 1),
    reg("Overload_Torque", 36, 1),
    reg("Over_Current_Protection_Time", 38, 1),
    reg("Torque_Enable", 40, 1),
    reg("Acceleration", 41, 1),
    position(reg("Goal_Position", 42, 2)),
    reg("Goal_Time", 44, 2),
    sign_bit(reg("Goal_Velocity", 46, 2), 15),
    reg("Torque_Limit", 48, 2),
    reg("Lock", 55, 1),
    position(ro("Present_Position", 56, 2)),
    sign_bit(ro("Present_Velocity", 58, 2), 15),
    sign_bit(ro("Present_Load", 60, 2), 10),
    ro("Present_Voltage", 62, 1),
    ro("Present_Temperature", 63, 1),
    ro("Status", 65, 1),
    ro("Moving", 66, 1),
    ro("Present_Current", 69, 2),
    reg("Maximum_Acceleration", 85, 2),
];

// Feetech SCS series: same layout for the subset it implements, 10-bit encoder
const SCS_REGISTERS: &[RegisterSpec] = &[
    ro("Firmware_Major_Version", 0, 1),
    ro("Firmware_Minor_Version", 1, 1),
    ro("Model_Number", 3, 2),
    reg("ID", 5, 1),
    reg("Baud_Rate", 6, 1),
    reg("Return_Delay_Time", 7, 1),
    reg("Response_Status_Level", 8, 1),
    reg("Min_Position_Limit", 9, 2),
    reg("Max_Position_Limit", 11, 2),
    reg("Max_Temperature_Limit", 13, 1),
    reg("Max_Voltage_Limit", 14, 1),
    reg("Min_Voltage_Limit", 15, 1),
    reg("Max_Torque_Limit", 16, 2),
    reg("Torque_Enable", 40, 1),
    reg("Acceleration", 41, 1),
    position(reg("Goal_Position", 42, 2)),
    reg("Goal_Time", 44, 2),
    sign_bit(reg("Goal_Velocity", 46, 2), 15),
    reg("Lock", 48, 1),
    position(ro("Present_Position", 56, 2)),
    sign_bit(ro("Present_Velocity", 58, 2), 15),
    sign_bit(ro("Present_Load", 60, 2), 10),
    ro("Present_Voltage", 62, 1),
    ro("Present_Temperature", 63, 1),
    ro("Moving", 66, 1),
];

// Dynamixel X series (Protocol 2.0)
const X_SERIES_REGISTERS: &[RegisterSpec] = &[
    ro("Model_Number", 0, 2),
    ro("Model_Information", 2, 4),
    ro("Firmware_Version", 6, 1),
    reg("ID", 7, 1),
    reg("Baud_Rate", 8, 1),
    reg("Return_Delay_Time", 9, 1),
    reg("Drive_Mode", 10, 1),
    reg("Operating_Mode", 11, 1),
    reg("Secondary_ID", 12, 1),
    reg("Protocol_Type", 13, 1),
    signed(reg("Homing_Offset", 20, 4)),
    reg("Moving_Threshold", 24, 4),
    reg("Temperature_Limit", 31, 1),
    reg("Max_Voltage_Limit", 32, 2),
    reg("Min_Voltage_Limit", 34, 2),
    reg("PWM_Limit", 36, 2),
    reg("Current_Limit", 38, 2),
    reg("Acceleration_Limit", 40, 4),
    reg("Velocity_Limit", 44, 4),
    reg("Max_Position_Limit", 48, 4),
    reg("Min_Position_Limit", 52, 4),
    reg("Shutdown", 63, 1),
    reg("Torque_Enable", 64, 1),
    reg("LED", 65, 1),
    reg("Status_Return_Level", 68, 1),
    ro("Registered_Instruction", 69, 1),
    ro("Hardware_Error_Status", 70, 1),
    reg("Velocity_I_Gain", 76, 2),
    reg("Velocity_P_Gain", 78, 2),
    reg("Position_D_Gain", 80, 2),
    reg("Position_I_Gain", 82, 2),
    reg("Position_P_Gain", 84, 2),
    reg("Feedforward_2nd_Gain", 88, 2),
    reg("Feedforward_1st_Gain", 90, 2),
    reg("Bus_Watchdog", 98, 1),
    signed(reg("Goal_PWM", 100, 2)),
    signed(reg("Goal_Current", 102, 2)),
    signed(reg("Goal_Velocity", 104, 4)),
    reg("Profile_Acceleration", 108, 4),
    reg("Profile_Velocity", 112, 4),
    position(signed(reg("Goal_Position", 116, 4))),
    ro("Realtime_Tick", 120, 2),
    ro("Moving", 122, 1),
    ro("Moving_Status", 123, 1),
    signed(ro("Present_PWM", 124, 2)),
    signed(ro("Present_Current", 126, 2)),
    signed(ro("Present_Velocity", 128, 4)),
    position(signed(ro("Present_Position", 132, 4))),
    ro("Velocity_Trajectory", 136, 4),
    ro("Position_Trajectory", 140, 4),
    ro("Present_Input_Voltage", 144, 2),
    ro("Present_Temperature", 146, 1),
];

fn feetech_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("sts3215", 777, ProtocolFamily::Feetech, 4096, STS_REGISTERS)
            .with_lock_register("Lock"),
        ModelSpec::new("sts3250", 2825, ProtocolFamily::Feetech, 4096, STS_REGISTERS)
            .with_lock_register("Lock"),
        ModelSpec::new("scs0009", 1284, ProtocolFamily::FeetechScs, 1024, SCS_REGISTERS)
            .with_lock_register("Lock"),
    ]
}

fn dynamixel_models() -> Vec<ModelSpec> {
    [
        ("xl330-m077", 1190),
        ("xl330-m288", 1200),
        ("xl430-w250", 1060),
        ("xm430-w350", 1020),
        ("xm540-w270", 1120),
    ]
    .into_iter()
    .map(|(name, number)| {
        ModelSpec::new(name, number, ProtocolFamily::Dynamixel, 4096, X_SERIES_REGISTERS)
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_present_position() {
        let table = ControlTable::builtin();

        let sts = table.lookup("sts3215", "Present_Position").unwrap();
        assert_eq!(sts.address, 56);
        assert_eq!(sts.width, 2);
        assert_eq!(sts.access, Access::ReadOnly);
        assert!(sts.normalized);

        let xl = table.lookup("xl330-m288", "Present_Position").unwrap();
        assert_eq!(xl.address, 132);
        assert_eq!(xl.width, 4);
        assert!(xl.signed);
    }

    #[test]
    fn test_unknown_register_and_model() {
        let table = ControlTable::builtin();
        assert!(matches!(
            table.lookup("sts3215", "Warp_Drive"),
            Err(MotorBusError::UnknownRegister { .. })
        ));
        assert!(matches!(
            table.lookup("m999", "Present_Position"),
            Err(MotorBusError::UnknownModel { .. })
        ));
    }

    #[test]
    fn test_read_only_register_rejects_write_lookup() {
        let table = ControlTable::builtin();
        let err = table
            .lookup_writable("xl430-w250", "Present_Position")
            .unwrap_err();
        assert!(matches!(
            err,
            MotorBusError::InvalidAccess {
                access: Access::ReadOnly,
                ..
            }
        ));
        assert!(table.lookup_writable("xl430-w250", "Goal_Position").is_ok());
    }

    #[test]
    fn test_sign_bit_defaults_to_top_bit() {
        let table = ControlTable::builtin();
        assert_eq!(table.lookup("sts3215", "Homing_Offset").unwrap().sign_bit(), 11);
        assert_eq!(table.lookup("sts3215", "Goal_Velocity").unwrap().sign_bit(), 15);
        assert_eq!(table.lookup("xm430-w350", "Goal_Velocity").unwrap().sign_bit(), 31);
    }

    #[test]
    fn test_model_for_number_respects_family() {
        let table = ControlTable::builtin();
        let model = table.model_for_number(ProtocolFamily::Feetech, 777).unwrap();
        assert_eq!(model.name, "sts3215");
        assert!(table.model_for_number(ProtocolFamily::Dynamixel, 777).is_none());
        assert_eq!(
            table.model_for_number(ProtocolFamily::Dynamixel, 1060).unwrap().name,
            "xl430-w250"
        );
    }

    #[test]
    fn test_baudrate_codes() {
        assert_eq!(baudrate_code(ProtocolFamily::Feetech, 1_000_000), Some(0));
        assert_eq!(baudrate_code(ProtocolFamily::Dynamixel, 1_000_000), Some(3));
        assert_eq!(baudrate_code(ProtocolFamily::Dynamixel, 12345), None);
    }

    #[test]
    fn test_custom_model_can_be_inserted() {
        let mut table = ControlTable::new();
        table.insert(ModelSpec::new(
            "m1",
            42,
            ProtocolFamily::Dynamixel,
            4096,
            &[position(signed(ro("Present_Position", 132, 4)))],
        ));
        let spec = table.lookup("m1", "Present_Position").unwrap();
        assert_eq!((spec.address, spec.width, spec.signed), (132, 4, true));
    }
}
