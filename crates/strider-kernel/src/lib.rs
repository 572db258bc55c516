//! `strider-kernel` – servo safety core
//!
//! Everything between "the control loop wants to move a leg" and "current
//! flows into a servo" passes through this crate.  It does not plan motion;
//! it decides whether motion is allowed and stops the robot when it is not.
//!
//! # Modules
//!
//! - [`emergency_stop`] – [`EmergencyStop`][emergency_stop::EmergencyStop]:
//!   the latching stop.  Disables every actuator first, then latches
//!   `EStop → ResetRequired`; armed to the physical button when one exists.
//! - [`watchdog`] – [`ServoWatchdog`][watchdog::ServoWatchdog]:
//!   background dead-man timer that triggers the stop when the control loop
//!   stops feeding it.
//! - [`current_limiter`] – [`CurrentLimiter`][current_limiter::CurrentLimiter]:
//!   sensorless current estimate, stall hysteresis and thermal duty budget
//!   per channel.
//! - [`coordinator`] – [`SafetyCoordinator`][coordinator::SafetyCoordinator]:
//!   owns the three above and runs the per-cycle safety gate.
//! - [`config`] – [`SafetyConfig`][config::SafetyConfig] and its sections.

pub mod config;
pub mod coordinator;
pub mod current_limiter;
pub mod emergency_stop;
pub mod watchdog;

pub use config::{CurrentLimiterConfig, EmergencyStopConfig, SafetyConfig, WatchdogConfig};
pub use coordinator::{SafetyCoordinator, SafetyDiagnostics};
pub use current_limiter::{
    ChannelDiagnostics, ChannelState, CurrentLimiter, LimiterDiagnostics, MovementDenied,
};
pub use emergency_stop::{EmergencyStop, EmergencyStopStats, StateCallback};
pub use watchdog::{ServoWatchdog, WatchdogStats};
