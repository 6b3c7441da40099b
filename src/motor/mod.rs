// Servo motor bus
//
// Provides:
// - Control tables for Feetech (STS/SCS) and Dynamixel (Protocol 2.0) models
// - Packet codecs for both wire protocols
// - Serial and simulated transports
// - Calibration records and unit conversion
// - MotorsBus: retries, sync operations, torque scoping and calibration routines

pub mod bus;
pub mod calibration;
pub mod codec;
pub mod control_table;
pub mod error;
pub mod sim;
pub mod torque;
pub mod transport;

pub use bus::{
    BusOptions, Device, DisconnectPolicy, HandshakeMode, MotorsBus, OperatingMode, RetryPolicy,
    SyncReport,
};
pub use calibration::{CalibrationFile, DriveMode, MotorCalibration, NormMode, RangePolicy};
pub use codec::{BROADCAST_ID, PacketCodec, codec_for};
pub use control_table::{ControlTable, ModelSpec, ProtocolFamily, RegisterSpec};
pub use error::{ErrorClass, MotorBusError, Result};
pub use sim::SimulatedLine;
pub use torque::TorqueGuard;
pub use transport::{SerialTransport, Transport, TransportError};
