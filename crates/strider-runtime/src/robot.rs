//! [`Robot`] – top-level lifecycle and control loop.
//!
//! ```text
//! Init ──start──▶ Ready ◀──reset── EStopped
//!   │               │                 ▲
//!   │               └─ gate failure ──┤
//!   └──────── fault during startup ───┘
//! ```
//!
//! Every actuator command and every control cycle goes through the
//! [`SafetyCoordinator`].  Each [`Robot::step`]:
//!
//! 1. **Observe** – positions of tracked moves are fed into stall detection;
//!    arrived moves are completed.
//! 2. **Gate** – [`SafetyCoordinator::feed_watchdog`].  A failure moves the
//!    robot to `EStopped` and tells the caller to stop looping.
//! 3. **Sense** – the optional [`Sensor`] is polled.  Sensor dropout is not
//!    a safety event; errors are logged and counted.
//! 4. **Pace** – sleep for the rest of the period, warning on overrun.
//!
//! A failed actuator write always ends the operating session: the robot
//! triggers `emergency_stop("hardware_failure")` before returning the error.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use strider_hal::{DigitalInput, Sensor, SharedClock, SharedServoDriver, angle_in_range};
use strider_kernel::{EmergencyStop, SafetyCoordinator, SafetyDiagnostics};
use strider_types::{RobotState, SafetyError, StallCondition};
use tracing::{debug, error, info, warn};

use crate::config::{RobotConfig, StriderConfig};

/// Source recorded when an actuator write fails.
pub const HARDWARE_FAILURE_SOURCE: &str = "hardware_failure";

/// A move whose completion is observed by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackedMove {
    pub channel: u8,
    pub target_angle: f64,
}

/// Snapshot returned by [`Robot::get_diagnostics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotDiagnostics {
    pub name: String,
    pub state: RobotState,
    pub control_rate_hz: f64,
    pub cycle_count: u64,
    pub overrun_count: u64,
    pub last_cycle_ms: Option<f64>,
    pub tracked_moves: Vec<TrackedMove>,
    pub sensor_error_count: u64,
    pub last_sensor_error: Option<String>,
    pub safety: SafetyDiagnostics,
}

// ────────────────────────────────────────────────────────────────────────────
// Robot
// ────────────────────────────────────────────────────────────────────────────

pub struct Robot {
    config: RobotConfig,
    driver: SharedServoDriver,
    coordinator: SafetyCoordinator,
    sensor: Option<Box<dyn Sensor>>,
    state: RobotState,
    /// channel → target angle
    tracked_moves: BTreeMap<u8, f64>,
    cycle_count: u64,
    overrun_count: u64,
    last_cycle: Option<Duration>,
    sensor_error_count: u64,
    last_sensor_error: Option<String>,
}

impl Robot {
    /// Build the robot and its safety core.
    ///
    /// # Errors
    ///
    /// [`SafetyError::Configuration`] for an invalid configuration or a
    /// driver with too few channels.
    pub fn new(
        driver: SharedServoDriver,
        config: StriderConfig,
        clock: SharedClock,
        button: Option<Arc<dyn DigitalInput>>,
    ) -> Result<Self, SafetyError> {
        config.validate()?;
        let coordinator =
            SafetyCoordinator::new(Arc::clone(&driver), config.safety, clock, button)?;
        Ok(Self {
            config: config.robot,
            driver,
            coordinator,
            sensor: None,
            state: RobotState::Init,
            tracked_moves: BTreeMap::new(),
            cycle_count: 0,
            overrun_count: 0,
            last_cycle: None,
            sensor_error_count: 0,
            last_sensor_error: None,
        })
    }

    /// Attach a non-actuator sensor polled once per cycle.
    pub fn with_sensor(mut self, sensor: Box<dyn Sensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn state(&self) -> RobotState {
        self.state
    }

    pub fn coordinator(&self) -> &SafetyCoordinator {
        &self.coordinator
    }

    /// Handle for stopping the robot from another thread (operator console,
    /// signal handler).  The control loop notices on its next cycle.
    pub fn estop_handle(&self) -> EmergencyStop {
        self.coordinator.estop().clone()
    }

    pub fn control_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.control_rate_hz)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Bring the safety core up and enter `Ready`.
    ///
    /// # Errors
    ///
    /// [`SafetyError::StateTransition`] unless in `Init`; any coordinator
    /// start failure, in which case the robot stays in `Init`.
    pub fn start(&mut self) -> Result<(), SafetyError> {
        if self.state != RobotState::Init {
            return Err(SafetyError::StateTransition(format!(
                "start requires Init, robot is {}",
                self.state
            )));
        }
        if let Err(e) = self.coordinator.start() {
            error!(robot = %self.config.name, error = %e, "safety core failed to start");
            return Err(e);
        }
        self.transition(RobotState::Ready)?;
        info!(
            robot = %self.config.name,
            control_rate_hz = self.config.control_rate_hz,
            "robot ready"
        );
        Ok(())
    }

    /// One control-loop iteration.
    ///
    /// Returns `Ok(true)` to keep looping and `Ok(false)` once the safety
    /// gate failed and the robot is `EStopped`.
    ///
    /// # Errors
    ///
    /// [`SafetyError::StateTransition`] unless `Ready`.
    pub fn step(&mut self) -> Result<bool, SafetyError> {
        self.require_ready("step")?;
        let started = Instant::now();
        self.cycle_count += 1;

        self.observe_tracked_moves();

        if !self.coordinator.feed_watchdog() {
            warn!(robot = %self.config.name, cycle = self.cycle_count, "safety gate failed, halting control loop");
            self.enter_estopped();
            return Ok(false);
        }

        self.poll_sensor();
        self.pace(started);
        Ok(true)
    }

    /// Drive [`step`](Self::step) until the gate fails or `shutdown` is set.
    /// Returns the number of completed cycles.
    ///
    /// # Errors
    ///
    /// As [`step`](Self::step).
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<u64, SafetyError> {
        let mut cycles = 0;
        while !shutdown.load(Ordering::SeqCst) {
            if !self.step()? {
                info!(cycles, "control loop stopped by the safety gate");
                return Ok(cycles);
            }
            cycles += 1;
        }
        info!(cycles, "control loop shutdown requested");
        Ok(cycles)
    }

    /// Trigger the emergency stop and enter `EStopped`.  Returns the stop
    /// latency in ms, `0.0` when already stopped.
    pub fn emergency_stop(&mut self, source: &str) -> f64 {
        let latency_ms = self.coordinator.trigger_estop(source);
        self.enter_estopped();
        latency_ms
    }

    /// Leave `EStopped` for `Ready`.
    ///
    /// # Errors
    ///
    /// [`SafetyError::StateTransition`] unless `EStopped`;
    /// [`SafetyError::SafetyViolation`] when the safety core refuses,
    /// typically because a channel is still stalled.
    pub fn reset(&mut self) -> Result<(), SafetyError> {
        if self.state != RobotState::EStopped {
            return Err(SafetyError::StateTransition(format!(
                "reset requires EStopped, robot is {}",
                self.state
            )));
        }
        if !self.coordinator.reset_estop() {
            return Err(SafetyError::SafetyViolation(
                "emergency stop reset refused; clear stalled channels first".to_string(),
            ));
        }
        self.tracked_moves.clear();
        self.transition(RobotState::Ready)?;
        info!(robot = %self.config.name, "robot reset");
        Ok(())
    }

    /// Shut down: watchdog, emergency stop, GPIO.  Idempotent.
    pub fn stop(&mut self) {
        self.coordinator.stop();
        self.tracked_moves.clear();
        self.enter_estopped();
    }

    // ── Actuation ───────────────────────────────────────────────────────────

    /// Command `channel` to `angle_deg` as a one-shot move.
    ///
    /// # Errors
    ///
    /// - [`SafetyError::StateTransition`] unless `Ready`.
    /// - [`SafetyError::SafetyViolation`] for an out-of-range angle or a
    ///   limiter refusal; the hardware is not touched.
    /// - [`SafetyError::Hardware`] when the driver fails; the emergency stop
    ///   has already been triggered.
    pub fn set_servo_angle(&mut self, channel: u8, angle_deg: f64) -> Result<(), SafetyError> {
        self.command(channel, angle_deg, false)
    }

    /// Command `channel` to `angle_deg` and keep the move open until the
    /// control loop sees the servo arrive.  A jammed servo is caught by stall
    /// detection inside [`step`](Self::step).
    ///
    /// # Errors
    ///
    /// As [`set_servo_angle`](Self::set_servo_angle).
    pub fn move_servo(&mut self, channel: u8, angle_deg: f64) -> Result<(), SafetyError> {
        self.command(channel, angle_deg, true)
    }

    /// Operator acknowledgment of a jammed channel: abandon its move and
    /// clear its stall so that [`reset`](Self::reset) can succeed.
    pub fn clear_stall(&mut self, channel: u8) {
        self.tracked_moves.remove(&channel);
        self.coordinator.end_movement(channel);
        info!(channel, "stall acknowledged by operator");
    }

    pub fn tracked_moves(&self) -> Vec<TrackedMove> {
        self.tracked_moves
            .iter()
            .map(|(&channel, &target_angle)| TrackedMove {
                channel,
                target_angle,
            })
            .collect()
    }

    pub fn get_diagnostics(&self) -> RobotDiagnostics {
        RobotDiagnostics {
            name: self.config.name.clone(),
            state: self.state,
            control_rate_hz: self.config.control_rate_hz,
            cycle_count: self.cycle_count,
            overrun_count: self.overrun_count,
            last_cycle_ms: self.last_cycle.map(|d| d.as_secs_f64() * 1000.0),
            tracked_moves: self.tracked_moves(),
            sensor_error_count: self.sensor_error_count,
            last_sensor_error: self.last_sensor_error.clone(),
            safety: self.coordinator.get_diagnostics(),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn command(&mut self, channel: u8, angle_deg: f64, track: bool) -> Result<(), SafetyError> {
        self.require_ready("servo command")?;
        if !angle_in_range(angle_deg) {
            return Err(SafetyError::SafetyViolation(format!(
                "angle {angle_deg} outside the servo range"
            )));
        }
        if let Err(e) = self.coordinator.authorize_movement(channel) {
            warn!(channel, angle_deg, reason = %e, "movement refused");
            return Err(e);
        }

        // A new command supersedes any open move on the channel.
        self.tracked_moves.remove(&channel);
        self.coordinator.begin_movement(channel, angle_deg);
        let driver = Arc::clone(&self.driver);
        let written = panic::catch_unwind(AssertUnwindSafe(|| {
            driver.set_channel_angle(channel, angle_deg)
        }))
        .unwrap_or_else(|_| Err(SafetyError::hardware("servo_driver", "driver panicked")));

        match written {
            Ok(()) if track => {
                self.tracked_moves.insert(channel, angle_deg);
                debug!(channel, angle_deg, "tracked move issued");
                Ok(())
            }
            Ok(()) => {
                self.coordinator.end_movement(channel);
                debug!(channel, angle_deg, "servo commanded");
                Ok(())
            }
            Err(e) => {
                self.coordinator.end_movement(channel);
                error!(channel, angle_deg, error = %e, "servo command failed");
                self.emergency_stop(HARDWARE_FAILURE_SOURCE);
                Err(match e {
                    SafetyError::Hardware { .. } => e,
                    other => SafetyError::hardware("servo_driver", other.to_string()),
                })
            }
        }
    }

    fn observe_tracked_moves(&mut self) {
        let tolerance = self.coordinator.config().limiter.position_tolerance_deg;
        let mut arrived = Vec::new();
        for (&channel, &target) in &self.tracked_moves {
            let Some(position) = self.driver.channel_position(channel) else {
                continue;
            };
            let condition = self.coordinator.observe_position(channel, target, position);
            if condition == StallCondition::Normal && (position - target).abs() < tolerance {
                arrived.push(channel);
            }
        }
        for channel in arrived {
            self.tracked_moves.remove(&channel);
            self.coordinator.end_movement(channel);
            debug!(channel, "tracked move arrived");
        }
    }

    fn poll_sensor(&mut self) {
        let Some(sensor) = self.sensor.as_mut() else {
            return;
        };
        if let Err(e) = sensor.poll() {
            warn!(sensor = sensor.id(), error = %e, "sensor poll failed, continuing");
            self.sensor_error_count += 1;
            self.last_sensor_error = Some(e.to_string());
        }
    }

    fn pace(&mut self, started: Instant) {
        let period = self.control_period();
        let elapsed = started.elapsed();
        self.last_cycle = Some(elapsed);
        if elapsed < period {
            thread::sleep(period - elapsed);
        } else {
            self.overrun_count += 1;
            warn!(
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                period_ms = period.as_secs_f64() * 1000.0,
                "control cycle overrun"
            );
        }
    }

    fn require_ready(&self, operation: &str) -> Result<(), SafetyError> {
        if self.state == RobotState::Ready {
            Ok(())
        } else {
            Err(SafetyError::StateTransition(format!(
                "{operation} requires Ready, robot is {}",
                self.state
            )))
        }
    }

    fn enter_estopped(&mut self) {
        if self.state != RobotState::EStopped {
            // Init and Ready both lead to EStopped.
            let _ = self.transition(RobotState::EStopped);
        }
    }

    fn transition(&mut self, to: RobotState) -> Result<(), SafetyError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(SafetyError::StateTransition(format!(
                "robot cannot go from {from} to {to}"
            )));
        }
        self.state = to;
        info!(robot = %self.config.name, from = %from, to = %to, "robot state change");
        Ok(())
    }
}
