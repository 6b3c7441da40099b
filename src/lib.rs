// servo-bus: register access, sync transactions and calibration for
// Feetech and Dynamixel servo chains on one serial line

pub mod config;
pub mod motor;
