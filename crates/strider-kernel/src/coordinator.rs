//! [`SafetyCoordinator`] – single gate between the control loop and the
//! actuators.
//!
//! The coordinator owns the [`EmergencyStop`], the [`ServoWatchdog`] and the
//! [`CurrentLimiter`] and wires them together.  Every control cycle calls
//! [`SafetyCoordinator::feed_watchdog`], which runs these checks in order
//! and stops at the first failure:
//!
//! 1. the emergency stop is `Running`;
//! 2. no channel has a confirmed stall;
//! 3. no thermally limited channel has fallen below the minimum duty cycle.
//!
//! A failed check triggers the emergency stop itself and the watchdog is not
//! fed.  Only a full pass feeds it.  A panic anywhere inside the checks is
//! caught and treated as a failure.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use strider_hal::{MonotonicClock, SimServoDriver};
//! use strider_kernel::{SafetyConfig, SafetyCoordinator};
//!
//! let driver = Arc::new(SimServoDriver::new(16));
//! let coordinator =
//!     SafetyCoordinator::new(driver, SafetyConfig::default(), MonotonicClock::shared(), None)
//!         .unwrap();
//! coordinator.start().unwrap();
//! assert!(coordinator.feed_watchdog());
//! assert!(coordinator.get_status().is_safe);
//! coordinator.stop();
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use strider_hal::{DigitalInput, SharedClock, SharedServoDriver};
use strider_types::{
    EmergencyStopEvent, SafetyError, SafetyState, SafetyStatus, ServoCurrentProfile,
    StallCondition,
};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::SafetyConfig;
use crate::current_limiter::{CurrentLimiter, LimiterDiagnostics};
use crate::emergency_stop::{EmergencyStop, EmergencyStopStats};
use crate::watchdog::{ServoWatchdog, WatchdogStats};

/// Source recorded when `stop()` latches the emergency stop.
pub const SHUTDOWN_SOURCE: &str = "coordinator_stop";

/// Full diagnostics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyDiagnostics {
    pub status: SafetyStatus,
    pub estop: EmergencyStopStats,
    pub watchdog: WatchdogStats,
    pub limiter: LimiterDiagnostics,
}

/// Reason a cycle failed the gate.  The `source` doubles as the emergency
/// stop source string.
#[derive(Error, Debug, Clone, PartialEq)]
enum GateFailure {
    #[error("emergency stop is {0}, not running")]
    NotRunning(SafetyState),

    #[error("stall confirmed on channels {0:?}")]
    Stall(Vec<u8>),

    #[error("duty cycle exhausted on channels {0:?}")]
    Thermal(Vec<u8>),

    #[error("watchdog rejected the feed")]
    WatchdogRejected,

    #[error("safety check panicked")]
    Panicked,
}

impl GateFailure {
    fn source(&self) -> &'static str {
        match self {
            GateFailure::NotRunning(_) => "estop_not_running",
            GateFailure::Stall(_) => "stall_detected",
            GateFailure::Thermal(_) => "thermal_limit",
            GateFailure::WatchdogRejected => "watchdog_rejected_feed",
            GateFailure::Panicked => "safety_check_panic",
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyCoordinator
// ────────────────────────────────────────────────────────────────────────────

pub struct SafetyCoordinator {
    config: SafetyConfig,
    estop: EmergencyStop,
    watchdog: ServoWatchdog,
    limiter: Mutex<CurrentLimiter>,
}

impl SafetyCoordinator {
    /// Wire up the safety core around `driver`.
    ///
    /// # Errors
    ///
    /// [`SafetyError::Configuration`] for an invalid `config` or a driver
    /// with fewer channels than `config.num_channels`.
    pub fn new(
        driver: SharedServoDriver,
        config: SafetyConfig,
        clock: SharedClock,
        button: Option<Arc<dyn DigitalInput>>,
    ) -> Result<Self, SafetyError> {
        config.validate()?;
        if driver.num_channels() < config.num_channels {
            return Err(SafetyError::Configuration(format!(
                "driver exposes {} channels, {} requested",
                driver.num_channels(),
                config.num_channels
            )));
        }
        let limiter = CurrentLimiter::new(config.num_channels, config.limiter.clone(), clock)?;
        let estop = EmergencyStop::new(driver, config.estop.clone(), button);
        let watchdog = ServoWatchdog::new(config.watchdog.clone(), estop.clone());
        Ok(Self {
            config,
            estop,
            watchdog,
            limiter: Mutex::new(limiter),
        })
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Shared handle to the emergency stop.
    pub fn estop(&self) -> &EmergencyStop {
        &self.estop
    }

    pub fn watchdog(&self) -> &ServoWatchdog {
        &self.watchdog
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Start the emergency stop, then the watchdog, then clear the limiter.
    ///
    /// # Errors
    ///
    /// [`SafetyError::StateTransition`] when the emergency stop is latched
    /// (reset it first), or [`SafetyError::ThreadSpawn`] when the watchdog
    /// could not start; the emergency stop is triggered in that case.
    pub fn start(&self) -> Result<(), SafetyError> {
        self.estop.start()?;
        let state = self.estop.state();
        if state != SafetyState::Running {
            return Err(SafetyError::StateTransition(format!(
                "emergency stop is {state} after start"
            )));
        }
        if let Err(e) = self.watchdog.start() {
            self.estop.trigger("watchdog_start_failure");
            return Err(e);
        }
        self.watchdog.feed();
        self.limiter.lock().reset_all_channels();
        info!(channels = self.config.num_channels, "safety coordinator started");
        Ok(())
    }

    /// Shut down in the fixed order: watchdog, emergency stop, button GPIO.
    /// Idempotent.
    pub fn stop(&self) {
        self.watchdog.stop();
        self.estop.trigger(SHUTDOWN_SOURCE);
        self.estop.release_button();
        info!("safety coordinator stopped");
    }

    // ── Per-cycle gate ──────────────────────────────────────────────────────

    /// Run the safety checks and feed the watchdog only if they all pass.
    ///
    /// Never fails to the caller: a failed or panicking check triggers the
    /// emergency stop and returns `false`.
    pub fn feed_watchdog(&self) -> bool {
        let verdict = panic::catch_unwind(AssertUnwindSafe(|| self.check_gate()))
            .unwrap_or(Err(GateFailure::Panicked));
        match verdict {
            Ok(()) => true,
            Err(failure) => {
                warn!(reason = %failure, "safety gate failed, stopping");
                self.estop.trigger(failure.source());
                false
            }
        }
    }

    fn check_gate(&self) -> Result<(), GateFailure> {
        let state = self.estop.state();
        if state != SafetyState::Running {
            return Err(GateFailure::NotRunning(state));
        }
        {
            let limiter = self.limiter.lock();
            let stalled = limiter.get_stalled_channels();
            if !stalled.is_empty() {
                return Err(GateFailure::Stall(stalled));
            }
            let min_duty = limiter.config().min_duty_cycle;
            let exhausted: Vec<u8> = limiter
                .get_thermal_limited_channels()
                .into_iter()
                .filter(|&ch| limiter.get_duty_cycle(ch) < min_duty)
                .collect();
            if !exhausted.is_empty() {
                return Err(GateFailure::Thermal(exhausted));
            }
        }
        if !self.watchdog.feed() {
            return Err(GateFailure::WatchdogRejected);
        }
        Ok(())
    }

    // ── Emergency stop proxy ────────────────────────────────────────────────

    /// Trigger the emergency stop; returns the latency in ms (`0.0` when
    /// already stopped).
    pub fn trigger_estop(&self, source: &str) -> f64 {
        self.estop.trigger(source).latency_ms
    }

    /// Leave the emergency stop and re-arm the watchdog.
    ///
    /// Refused (returns `false`) unless the emergency stop is
    /// `ResetRequired`, and while any channel has a confirmed stall; the
    /// operator has to clear the jammed channel first.  A refused reset
    /// leaves the limiter's thermal and stall model untouched.
    pub fn reset_estop(&self) -> bool {
        let state = self.estop.state();
        if state != SafetyState::ResetRequired {
            warn!(state = %state, "emergency stop reset refused, nothing latched");
            return false;
        }
        let stalled = self.limiter.lock().get_stalled_channels();
        if !stalled.is_empty() {
            warn!(?stalled, "emergency stop reset refused, channels still stalled");
            return false;
        }

        // The previous session's monitor must be gone before the latch opens.
        self.watchdog.stop();

        match self.estop.reset() {
            Ok(SafetyState::Init) => {
                if let Err(e) = self.estop.start() {
                    warn!(error = %e, "emergency stop did not restart after reset");
                    return false;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "emergency stop reset refused");
                return false;
            }
        }

        self.limiter.lock().reset_all_channels();
        if let Err(e) = self.watchdog.start() {
            error!(error = %e, "watchdog failed to restart after reset");
            self.estop.trigger("watchdog_start_failure");
            return false;
        }
        self.watchdog.feed();
        info!("emergency stop reset, watchdog re-armed");
        true
    }

    pub fn is_safe(&self) -> bool {
        self.estop.is_safe()
    }

    pub fn estop_state(&self) -> SafetyState {
        self.estop.state()
    }

    pub fn estop_history(&self) -> Vec<EmergencyStopEvent> {
        self.estop.history()
    }

    /// Forward to [`EmergencyStop::on_state_change`].
    pub fn on_estop_state_change<F>(&self, callback: F)
    where
        F: Fn(SafetyState, SafetyState) + Send + Sync + 'static,
    {
        self.estop.on_state_change(callback);
    }

    // ── Limiter proxy ───────────────────────────────────────────────────────

    /// Decide whether a new movement on `channel` may start.
    ///
    /// # Errors
    ///
    /// [`SafetyError::SafetyViolation`] when the emergency stop is latched
    /// or the limiter refuses.
    pub fn authorize_movement(&self, channel: u8) -> Result<(), SafetyError> {
        if !self.estop.is_safe() {
            return Err(SafetyError::SafetyViolation(format!(
                "emergency stop is {}",
                self.estop.state()
            )));
        }
        self.limiter.lock().is_movement_allowed(channel)?;
        Ok(())
    }

    pub fn begin_movement(&self, channel: u8, target_angle: f64) {
        self.limiter.lock().register_movement_start(channel, target_angle);
    }

    pub fn end_movement(&self, channel: u8) {
        self.limiter.lock().register_movement_complete(channel);
    }

    /// Feed one reported position into stall detection.
    pub fn observe_position(&self, channel: u8, target_angle: f64, position: f64) -> StallCondition {
        self.limiter.lock().check_stall(channel, target_angle, position)
    }

    /// Override the current profile of one channel.
    ///
    /// # Errors
    ///
    /// See [`CurrentLimiter::set_channel_profile`].
    pub fn set_channel_profile(
        &self,
        channel: u8,
        profile: ServoCurrentProfile,
    ) -> Result<(), SafetyError> {
        self.limiter.lock().set_channel_profile(channel, profile)
    }

    pub fn total_current(&self) -> f64 {
        self.limiter.lock().get_total_current()
    }

    // ── Snapshots ───────────────────────────────────────────────────────────

    pub fn get_status(&self) -> SafetyStatus {
        let (stalled_channels, thermal_limited_channels) = {
            let limiter = self.limiter.lock();
            (
                limiter.get_stalled_channels(),
                limiter.get_thermal_limited_channels(),
            )
        };
        let estop_state = self.estop.state();
        let watchdog_expired = self.watchdog.is_expired();
        SafetyStatus {
            is_safe: estop_state == SafetyState::Running
                && !watchdog_expired
                && stalled_channels.is_empty(),
            estop_state,
            watchdog_running: self.watchdog.is_running(),
            watchdog_expired,
            stalled_channels,
            thermal_limited_channels,
            last_estop_source: self.estop.last_source(),
            timestamp: Utc::now(),
        }
    }

    pub fn get_diagnostics(&self) -> SafetyDiagnostics {
        SafetyDiagnostics {
            status: self.get_status(),
            estop: self.estop.stats(),
            watchdog: self.watchdog.stats(),
            limiter: self.limiter.lock().get_diagnostics(),
        }
    }
}

impl Drop for SafetyCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
