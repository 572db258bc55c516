//! `Sensor` – a non-actuator input polled once per control cycle
//! (IMU, distance sensor, battery monitor, …).
//!
//! Sensor failures are never safety events; the control loop logs and
//! carries on.

use strider_types::SafetyError;

pub trait Sensor: Send {
    /// Stable identifier, e.g. `"imu"`.
    fn id(&self) -> &str;

    /// Take one reading.
    ///
    /// # Errors
    ///
    /// [`SafetyError::Hardware`] when the device does not answer.
    fn poll(&mut self) -> Result<(), SafetyError>;
}
