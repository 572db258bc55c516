//! `strider-types` – shared vocabulary of the Strider safety core.
//!
//! State machines, event records, status snapshots and the [`SafetyError`]
//! taxonomy used by `strider-hal`, `strider-kernel` and `strider-runtime`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Emergency-stop state machine
// ────────────────────────────────────────────────────────────────────────────

/// State of the emergency-stop state machine.
///
/// ```text
/// Init ──start──► Running ──trigger──► EStop ──► ResetRequired
///  │                 ▲                  ▲              │
///  └────trigger──────┼──────────────────┘              │
///                    └──────────reset (auto)───────────┤
///  Init ◄────────────────────reset (manual)────────────┘
/// ```
///
/// Only [`SafetyState::Running`] permits actuator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SafetyState {
    Init,
    Running,
    EStop,
    ResetRequired,
}

impl SafetyState {
    /// Every state, in declaration order.
    pub const ALL: [SafetyState; 4] = [
        SafetyState::Init,
        SafetyState::Running,
        SafetyState::EStop,
        SafetyState::ResetRequired,
    ];

    /// States reachable from `self` in a single transition.
    pub fn allowed_transitions(self) -> &'static [SafetyState] {
        match self {
            SafetyState::Init => &[SafetyState::Running, SafetyState::EStop],
            SafetyState::Running => &[SafetyState::EStop],
            SafetyState::EStop => &[SafetyState::ResetRequired],
            SafetyState::ResetRequired => &[SafetyState::Running, SafetyState::Init],
        }
    }

    /// Return `true` when `self → to` is in the transition table.
    pub fn can_transition_to(self, to: SafetyState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// `true` for the latched states that need an explicit reset.
    pub fn is_stopped(self) -> bool {
        matches!(self, SafetyState::EStop | SafetyState::ResetRequired)
    }

    /// Only `Running` permits actuator commands.
    pub fn permits_actuation(self) -> bool {
        self == SafetyState::Running
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SafetyState::Init => "Init",
            SafetyState::Running => "Running",
            SafetyState::EStop => "EStop",
            SafetyState::ResetRequired => "ResetRequired",
        };
        f.write_str(name)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Robot lifecycle state machine
// ────────────────────────────────────────────────────────────────────────────

/// Top-level robot lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RobotState {
    Init,
    Ready,
    EStopped,
}

impl RobotState {
    pub const ALL: [RobotState; 3] = [RobotState::Init, RobotState::Ready, RobotState::EStopped];

    /// States reachable from `self` in a single transition.
    ///
    /// `Init → EStopped` is legal so a fault during startup is representable;
    /// nothing ever returns to `Init`.
    pub fn allowed_transitions(self) -> &'static [RobotState] {
        match self {
            RobotState::Init => &[RobotState::Ready, RobotState::EStopped],
            RobotState::Ready => &[RobotState::EStopped],
            RobotState::EStopped => &[RobotState::Ready],
        }
    }

    pub fn can_transition_to(self, to: RobotState) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl fmt::Display for RobotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RobotState::Init => "Init",
            RobotState::Ready => "Ready",
            RobotState::EStopped => "EStopped",
        };
        f.write_str(name)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stall model
// ────────────────────────────────────────────────────────────────────────────

/// Per-channel stall hysteresis state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StallCondition {
    #[default]
    Normal,
    Suspected,
    Confirmed,
}

impl StallCondition {
    /// Fraction of the idle→stall current span a moving servo draws in this
    /// condition.  Shared by current estimation and thermal accounting.
    pub fn load_factor(self) -> f64 {
        match self {
            StallCondition::Normal => 0.25,
            StallCondition::Suspected => 0.60,
            StallCondition::Confirmed => 1.0,
        }
    }
}

/// Static electrical model of one servo type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoCurrentProfile {
    /// Holding current with no commanded movement (mA).
    pub idle_ma: f64,
    /// Current while moving without load (mA).
    pub no_load_ma: f64,
    /// Current with the output shaft blocked (mA).
    pub stall_ma: f64,
    /// Time constant of the duty-cycle decay, i.e. how fast the motor sheds heat (s).
    pub thermal_time_constant_s: f64,
}

impl Default for ServoCurrentProfile {
    /// Micro-servo class figures (SG90/MG90 family at 5 V).
    fn default() -> Self {
        Self {
            idle_ma: 10.0,
            no_load_ma: 150.0,
            stall_ma: 650.0,
            thermal_time_constant_s: 5.0,
        }
    }
}

impl ServoCurrentProfile {
    /// Check the profile invariants.
    ///
    /// # Errors
    ///
    /// [`SafetyError::Configuration`] when a value is negative or not finite,
    /// `idle_ma >= stall_ma`, or the time constant is not positive.
    pub fn validate(&self) -> Result<(), SafetyError> {
        let values = [
            ("idle_ma", self.idle_ma),
            ("no_load_ma", self.no_load_ma),
            ("stall_ma", self.stall_ma),
            ("thermal_time_constant_s", self.thermal_time_constant_s),
        ];
        for (name, value) in values {
            if !value.is_finite() || value < 0.0 {
                return Err(SafetyError::Configuration(format!(
                    "current profile {name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.idle_ma >= self.stall_ma {
            return Err(SafetyError::Configuration(format!(
                "current profile idle_ma ({}) must be below stall_ma ({})",
                self.idle_ma, self.stall_ma
            )));
        }
        if self.thermal_time_constant_s <= 0.0 {
            return Err(SafetyError::Configuration(
                "current profile thermal_time_constant_s must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Events and snapshots
// ────────────────────────────────────────────────────────────────────────────

/// Result of one emergency-stop trigger.
///
/// `disable_succeeded == false` means the stop was attempted and the state
/// machine latched, but the actuators may still be powered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerOutcome {
    /// Time spent disabling actuators and latching the state (ms).
    /// Exactly `0.0` when the system was already stopped.
    pub latency_ms: f64,
    pub disable_succeeded: bool,
    /// `true` when the call was a no-op because a stop was already latched.
    pub already_stopped: bool,
}

impl TriggerOutcome {
    /// Outcome of a redundant trigger while already stopped.
    pub fn already_stopped() -> Self {
        Self {
            latency_ms: 0.0,
            disable_succeeded: true,
            already_stopped: true,
        }
    }
}

/// Immutable record of one emergency stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStopEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// What requested the stop, e.g. `"physical_button"` or `"watchdog timeout"`.
    pub source: String,
    pub latency_ms: f64,
    pub previous_state: SafetyState,
    pub disable_succeeded: bool,
}

impl EmergencyStopEvent {
    pub fn new(
        source: impl Into<String>,
        latency_ms: f64,
        previous_state: SafetyState,
        disable_succeeded: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            latency_ms,
            previous_state,
            disable_succeeded,
        }
    }
}

/// Point-in-time safety snapshot produced by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub is_safe: bool,
    pub estop_state: SafetyState,
    pub watchdog_running: bool,
    pub watchdog_expired: bool,
    pub stalled_channels: Vec<u8>,
    pub thermal_limited_channels: Vec<u8>,
    pub last_estop_source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error taxonomy of the safety core.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyError {
    /// An illegal transition or an operation attempted in the wrong state.
    /// Recoverable by re-querying the state.
    #[error("State transition error: {0}")]
    StateTransition(String),

    /// Movement refused by the limiter or the stop latch.  Do not retry the
    /// identical command.
    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    /// Actuator or transport failure.  Always escalates to an emergency stop.
    #[error("Hardware fault on {component}: {details}")]
    Hardware { component: String, details: String },

    /// Invalid construction parameters, reported at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A background monitor thread could not be created.
    #[error("Failed to spawn {0} thread")]
    ThreadSpawn(String),
}

impl SafetyError {
    pub fn hardware(component: impl Into<String>, details: impl Into<String>) -> Self {
        SafetyError::Hardware {
            component: component.into(),
            details: details.into(),
        }
    }
}
