//! `ServoDriver` – the two actuator operations the safety core depends on.
//!
//! A driver is shared between the robot (per-channel commands) and the
//! emergency stop (bulk disable), so every method takes `&self`.  Mutual
//! exclusion on the underlying transport is the driver's responsibility;
//! see [`BusHandle`][crate::bus::BusHandle].

use std::sync::Arc;

use strider_types::SafetyError;

/// Channel count of the reference PWM board.
pub const DEFAULT_NUM_CHANNELS: u8 = 16;

/// Lowest commandable servo angle in degrees.
pub const MIN_ANGLE_DEG: f64 = 0.0;

/// Highest commandable servo angle in degrees.
pub const MAX_ANGLE_DEG: f64 = 180.0;

/// A multi-channel hobby-servo driver.
pub trait ServoDriver: Send + Sync {
    /// Number of addressable channels; valid indices are `0..num_channels()`.
    fn num_channels(&self) -> u8 {
        DEFAULT_NUM_CHANNELS
    }

    /// Cut the drive signal on every channel.
    ///
    /// This is the emergency-stop critical path: implementations must not
    /// block on anything except the transport itself.
    ///
    /// # Errors
    ///
    /// [`SafetyError::Hardware`] when the transport rejects the write.
    fn disable_all(&self) -> Result<(), SafetyError>;

    /// Command `channel` to `angle_deg` (degrees, `[0, 180]`).
    ///
    /// # Errors
    ///
    /// [`SafetyError::Hardware`] when the channel is out of range or the
    /// transport write fails.
    fn set_channel_angle(&self, channel: u8, angle_deg: f64) -> Result<(), SafetyError>;

    /// Last known position of `channel` in degrees, if the hardware reports
    /// one.
    fn channel_position(&self, channel: u8) -> Option<f64>;
}

/// Shared handle to a driver.
pub type SharedServoDriver = Arc<dyn ServoDriver>;

/// Return `true` when `angle_deg` is a commandable servo angle.
pub fn angle_in_range(angle_deg: f64) -> bool {
    angle_deg.is_finite() && (MIN_ANGLE_DEG..=MAX_ANGLE_DEG).contains(&angle_deg)
}
