// Scoped torque-off window
//
// Configuration writes (EEPROM registers, calibration) need torque off. The
// guard remembers which motors had torque on and turns it back on when the
// scope ends, including on early return.

use std::ops::{Deref, DerefMut};

use tracing::warn;

use super::bus::MotorsBus;
use super::error::Result;

/// Bus access with torque disabled on a set of motors
pub struct TorqueGuard<'a> {
    bus: &'a mut MotorsBus,
    restore: Vec<u8>,
}

impl<'a> TorqueGuard<'a> {
    pub(crate) fn new(bus: &'a mut MotorsBus, restore: Vec<u8>) -> Self {
        Self { bus, restore }
    }

    /// Motors whose torque will be re-enabled when the guard ends
    pub fn restores(&self) -> &[u8] {
        &self.restore
    }

    /// End the scope now and report whether torque came back on
    pub fn restore(mut self) -> Result<()> {
        let ids = std::mem::take(&mut self.restore);
        if ids.is_empty() {
            return Ok(());
        }
        self.bus.enable_torque(&ids)
    }
}

impl Deref for TorqueGuard<'_> {
    type Target = MotorsBus;

    fn deref(&self) -> &MotorsBus {
        self.bus
    }
}

impl DerefMut for TorqueGuard<'_> {
    fn deref_mut(&mut self) -> &mut MotorsBus {
        self.bus
    }
}

impl Drop for TorqueGuard<'_> {
    fn drop(&mut self) {
        if self.restore.is_empty() {
            return;
        }
        if let Err(e) = self.bus.enable_torque(&self.restore) {
            warn!("Failed to restore torque on motors {:?}: {}", self.restore, e);
        }
    }
}
