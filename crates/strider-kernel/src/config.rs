//! Tunables of the safety core.
//!
//! Every section deserialises with defaults for missing fields, so a config
//! file only needs to mention what it changes.  [`SafetyConfig::validate`]
//! runs at construction time; nothing is re-validated at runtime.

use serde::{Deserialize, Serialize};
use strider_hal::DEFAULT_NUM_CHANNELS;
use strider_types::{SafetyError, ServoCurrentProfile};

/// Emergency-stop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyStopConfig {
    /// Debounce window requested from the button input driver.
    pub button_debounce_ms: u64,
    /// When `true`, `reset()` lands in `Running`; otherwise in `Init` and a
    /// fresh `start()` is required.
    pub auto_reset: bool,
    /// Number of stop events kept; the oldest is dropped first.
    pub history_capacity: usize,
}

impl Default for EmergencyStopConfig {
    fn default() -> Self {
        Self {
            button_debounce_ms: 50,
            auto_reset: false,
            history_capacity: 100,
        }
    }
}

/// Watchdog settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Maximum gap between feeds before the stop is triggered.
    pub timeout_ms: u64,
    /// How often the monitor thread checks the last feed.
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for the monitor thread in `stop()`.
    pub join_timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            poll_interval_ms: 100,
            join_timeout_ms: 1000,
        }
    }
}

/// Current model, stall detection and thermal gating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentLimiterConfig {
    /// Electrical model shared by every channel unless overridden.
    pub profile: ServoCurrentProfile,
    /// Time a position must stay frozen before a stall is confirmed.
    /// Half of it marks the stall as suspected.
    pub stall_timeout_ms: u64,
    /// Positions closer than this (degrees) count as "unchanged" / "arrived".
    pub position_tolerance_deg: f64,
    /// Ceiling of the allowed duty cycle.
    pub max_duty_cycle: f64,
    /// Below this duty cycle new movement is refused.
    pub min_duty_cycle: f64,
    /// A channel whose duty cycle is under `max_duty_cycle * thermal_limit_ratio`
    /// is reported as thermally limited.
    pub thermal_limit_ratio: f64,
    /// Fraction of the all-channels-stalled current admitted as the system
    /// budget.  Deployment specific: size it against the battery.
    pub soft_limit_factor: f64,
}

impl Default for CurrentLimiterConfig {
    fn default() -> Self {
        Self {
            profile: ServoCurrentProfile::default(),
            stall_timeout_ms: 300,
            position_tolerance_deg: 2.0,
            max_duty_cycle: 1.0,
            min_duty_cycle: 0.10,
            thermal_limit_ratio: 0.5,
            soft_limit_factor: 0.8,
        }
    }
}

impl CurrentLimiterConfig {
    /// # Errors
    ///
    /// [`SafetyError::Configuration`] for any out-of-range value.
    pub fn validate(&self) -> Result<(), SafetyError> {
        self.profile.validate()?;
        if self.stall_timeout_ms == 0 {
            return Err(config_error("limiter.stall_timeout_ms must be > 0"));
        }
        if !(self.position_tolerance_deg > 0.0) {
            return Err(config_error("limiter.position_tolerance_deg must be > 0"));
        }
        if !(self.max_duty_cycle > 0.0 && self.max_duty_cycle <= 1.0) {
            return Err(config_error("limiter.max_duty_cycle must be in (0, 1]"));
        }
        if !(self.min_duty_cycle >= 0.0 && self.min_duty_cycle < self.max_duty_cycle) {
            return Err(config_error(
                "limiter.min_duty_cycle must be in [0, max_duty_cycle)",
            ));
        }
        if !(self.thermal_limit_ratio > 0.0 && self.thermal_limit_ratio <= 1.0) {
            return Err(config_error("limiter.thermal_limit_ratio must be in (0, 1]"));
        }
        if !(self.soft_limit_factor > 0.0 && self.soft_limit_factor <= 1.0) {
            return Err(config_error("limiter.soft_limit_factor must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Complete safety-core configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Number of servo channels under supervision (`0..num_channels`).
    pub num_channels: u8,
    pub estop: EmergencyStopConfig,
    pub watchdog: WatchdogConfig,
    pub limiter: CurrentLimiterConfig,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            num_channels: DEFAULT_NUM_CHANNELS,
            estop: EmergencyStopConfig::default(),
            watchdog: WatchdogConfig::default(),
            limiter: CurrentLimiterConfig::default(),
        }
    }
}

impl SafetyConfig {
    /// Check every section.
    ///
    /// # Errors
    ///
    /// [`SafetyError::Configuration`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), SafetyError> {
        if self.num_channels == 0 {
            return Err(config_error("num_channels must be at least 1"));
        }
        if self.estop.history_capacity == 0 {
            return Err(config_error("estop.history_capacity must be at least 1"));
        }
        if self.watchdog.timeout_ms == 0 || self.watchdog.poll_interval_ms == 0 {
            return Err(config_error(
                "watchdog.timeout_ms and watchdog.poll_interval_ms must be > 0",
            ));
        }
        if self.watchdog.poll_interval_ms > self.watchdog.timeout_ms {
            return Err(config_error(
                "watchdog.poll_interval_ms must not exceed watchdog.timeout_ms",
            ));
        }
        self.limiter.validate()
    }
}

fn config_error(msg: &str) -> SafetyError {
    SafetyError::Configuration(msg.to_string())
}
