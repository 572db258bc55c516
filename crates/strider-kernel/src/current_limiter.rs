//! [`CurrentLimiter`] – sensorless current, stall and thermal model.
//!
//! There is no current sensor on the servo rail.  Instead every channel
//! carries a small state machine fed with commanded targets and reported
//! positions, from which the limiter estimates the current draw, detects
//! stalls and tracks a thermal duty budget.
//!
//! # Stall hysteresis
//!
//! A moving channel whose position stops changing is first `Suspected`
//! (half the stall timeout), then `Confirmed` (the full timeout).  Any
//! observed position change drops it straight back to `Normal`.  Brief load
//! spikes therefore never confirm, while a real stall confirms within one
//! timeout window.
//!
//! # Duty cycle
//!
//! Each channel integrates its load factor with exponential decay (time
//! constant from the channel's [`ServoCurrentProfile`]).  The allowed duty
//! cycle is the unused part of that budget, halved while a stall is
//! confirmed and cut by a quarter while one is suspected.
//!
//! The limiter performs no I/O and no locking; the owner serialises access.

use std::time::{Duration, Instant};

use serde::Serialize;
use strider_hal::SharedClock;
use strider_types::{SafetyError, ServoCurrentProfile, StallCondition};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CurrentLimiterConfig;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Mutable model state of one servo channel.
#[derive(Debug, Clone)]
pub struct ChannelState {
    pub is_moving: bool,
    pub target_angle: Option<f64>,
    pub last_position: Option<f64>,
    /// When `last_position` was first observed.
    pub last_position_time: Option<Instant>,
    /// Start of the current "position frozen" window.
    pub stall_suspected_time: Option<Instant>,
    pub stall_condition: StallCondition,
    /// Decaying load integral in `[0, 1]`.
    pub cumulative_duty: f64,
    pub last_duty_update: Instant,
}

impl ChannelState {
    fn new(now: Instant) -> Self {
        Self {
            is_moving: false,
            target_angle: None,
            last_position: None,
            last_position_time: None,
            stall_suspected_time: None,
            stall_condition: StallCondition::Normal,
            cumulative_duty: 0.0,
            last_duty_update: now,
        }
    }
}

/// Why [`CurrentLimiter::is_movement_allowed`] refused a movement.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MovementDenied {
    #[error("channel {0} is not supervised")]
    UnknownChannel(u8),

    #[error("channel {channel} has a confirmed stall")]
    StallConfirmed { channel: u8 },

    #[error("channel {channel} duty cycle {duty:.3} is below the minimum {min:.3}")]
    DutyCycleExhausted { channel: u8, duty: f64, min: f64 },

    #[error(
        "moving channel {channel} would raise the total current to {projected_ma:.0} mA, above the {budget_ma:.0} mA budget"
    )]
    CurrentBudgetExceeded {
        channel: u8,
        projected_ma: f64,
        budget_ma: f64,
    },
}

impl From<MovementDenied> for SafetyError {
    fn from(denied: MovementDenied) -> Self {
        SafetyError::SafetyViolation(denied.to_string())
    }
}

/// Per-channel line of [`LimiterDiagnostics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelDiagnostics {
    pub channel: u8,
    pub is_moving: bool,
    pub target_angle: Option<f64>,
    pub last_position: Option<f64>,
    pub stall_condition: StallCondition,
    pub estimated_current_ma: f64,
    pub duty_cycle: f64,
}

/// Snapshot of the whole limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterDiagnostics {
    pub total_current_ma: f64,
    pub current_budget_ma: f64,
    pub stalled_channels: Vec<u8>,
    pub thermal_limited_channels: Vec<u8>,
    pub channels: Vec<ChannelDiagnostics>,
}

// ────────────────────────────────────────────────────────────────────────────
// CurrentLimiter
// ────────────────────────────────────────────────────────────────────────────

/// Model-based per-channel current limiter.
///
/// # Example
///
/// ```
/// use strider_hal::MonotonicClock;
/// use strider_kernel::config::CurrentLimiterConfig;
/// use strider_kernel::current_limiter::CurrentLimiter;
///
/// let mut limiter =
///     CurrentLimiter::new(4, CurrentLimiterConfig::default(), MonotonicClock::shared()).unwrap();
/// assert!(limiter.is_movement_allowed(0).is_ok());
///
/// limiter.register_movement_start(0, 90.0);
/// assert!(limiter.estimate_current(0) > limiter.estimate_current(1));
/// limiter.register_movement_complete(0);
/// ```
pub struct CurrentLimiter {
    config: CurrentLimiterConfig,
    clock: SharedClock,
    profiles: Vec<ServoCurrentProfile>,
    channels: Vec<ChannelState>,
}

impl CurrentLimiter {
    /// Create a limiter supervising channels `0..num_channels`.
    ///
    /// # Errors
    ///
    /// [`SafetyError::Configuration`] when `config` is invalid or
    /// `num_channels` is zero.
    pub fn new(
        num_channels: u8,
        config: CurrentLimiterConfig,
        clock: SharedClock,
    ) -> Result<Self, SafetyError> {
        if num_channels == 0 {
            return Err(SafetyError::Configuration(
                "current limiter needs at least one channel".to_string(),
            ));
        }
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            profiles: vec![config.profile; usize::from(num_channels)],
            channels: (0..num_channels).map(|_| ChannelState::new(now)).collect(),
            config,
            clock,
        })
    }

    pub fn num_channels(&self) -> u8 {
        self.channels.len() as u8
    }

    pub fn config(&self) -> &CurrentLimiterConfig {
        &self.config
    }

    /// Read-only view of one channel's model state.
    pub fn channel(&self, channel: u8) -> Option<&ChannelState> {
        self.channels.get(usize::from(channel))
    }

    pub fn profile(&self, channel: u8) -> Option<&ServoCurrentProfile> {
        self.profiles.get(usize::from(channel))
    }

    /// Override the electrical model of one channel (e.g. a bigger hip servo).
    ///
    /// # Errors
    ///
    /// [`SafetyError::Configuration`] for an invalid profile or unknown channel.
    pub fn set_channel_profile(
        &mut self,
        channel: u8,
        profile: ServoCurrentProfile,
    ) -> Result<(), SafetyError> {
        profile.validate()?;
        let slot = self.profiles.get_mut(usize::from(channel)).ok_or_else(|| {
            SafetyError::Configuration(format!("channel {channel} is not supervised"))
        })?;
        *slot = profile;
        Ok(())
    }

    // ── Movement bracketing ─────────────────────────────────────────────────

    /// Mark `channel` as moving towards `target_angle`.
    ///
    /// From idle this opens a fresh observation window.  On a channel that is
    /// already moving the window is kept: re-commanding a jammed servo every
    /// cycle must not restart its stall timer.  A new target only refreshes
    /// the position timestamp when no frozen window is open yet.  No-op for
    /// unknown channels.
    pub fn register_movement_start(&mut self, channel: u8, target_angle: f64) {
        let now = self.clock.now();
        let idx = usize::from(channel);
        let Some(tau) = self.time_constant(idx) else {
            debug!(channel, "movement start on unsupervised channel ignored");
            return;
        };
        let tolerance = self.config.position_tolerance_deg;
        let state = &mut self.channels[idx];
        settle_duty(state, tau, now);
        if state.is_moving {
            let retargeted = state
                .target_angle
                .is_none_or(|old| (old - target_angle).abs() >= tolerance);
            if retargeted && state.stall_suspected_time.is_none() && state.last_position.is_some() {
                state.last_position_time = Some(now);
            }
            state.target_angle = Some(target_angle);
            debug!(channel, target_angle, retargeted, "movement re-commanded");
            return;
        }
        state.is_moving = true;
        state.target_angle = Some(target_angle);
        state.last_position = None;
        state.last_position_time = None;
        state.stall_suspected_time = None;
        state.stall_condition = StallCondition::Normal;
        debug!(channel, target_angle, "movement started");
    }

    /// Mark the movement on `channel` as finished, successfully or not.
    ///
    /// Clears `is_moving` and returns the stall state to `Normal` so an
    /// aborted move is not mistaken for a stall later.
    pub fn register_movement_complete(&mut self, channel: u8) {
        let now = self.clock.now();
        let idx = usize::from(channel);
        let Some(tau) = self.time_constant(idx) else {
            return;
        };
        let state = &mut self.channels[idx];
        settle_duty(state, tau, now);
        state.is_moving = false;
        state.stall_suspected_time = None;
        if state.stall_condition != StallCondition::Normal {
            info!(channel, previous = ?state.stall_condition, "stall cleared by movement completion");
        }
        state.stall_condition = StallCondition::Normal;
    }

    // ── Stall detection ─────────────────────────────────────────────────────

    /// Feed one position observation and return the channel's stall state.
    pub fn check_stall(
        &mut self,
        channel: u8,
        target_angle: f64,
        current_position: f64,
    ) -> StallCondition {
        let now = self.clock.now();
        let idx = usize::from(channel);
        let Some(tau) = self.time_constant(idx) else {
            return StallCondition::Normal;
        };
        let tolerance = self.config.position_tolerance_deg;
        let timeout = Duration::from_millis(self.config.stall_timeout_ms);
        let state = &mut self.channels[idx];

        let next = if !state.is_moving || (current_position - target_angle).abs() < tolerance {
            state.stall_suspected_time = None;
            StallCondition::Normal
        } else {
            match state.last_position {
                Some(last) if (current_position - last).abs() < tolerance => {
                    let since = *state
                        .stall_suspected_time
                        .get_or_insert(state.last_position_time.unwrap_or(now));
                    let frozen_for = now.saturating_duration_since(since);
                    if frozen_for >= timeout {
                        StallCondition::Confirmed
                    } else if frozen_for >= timeout / 2 {
                        StallCondition::Suspected
                    } else {
                        StallCondition::Normal
                    }
                }
                _ => {
                    state.stall_suspected_time = None;
                    StallCondition::Normal
                }
            }
        };

        let position_changed = state
            .last_position
            .is_none_or(|last| (current_position - last).abs() >= tolerance);
        if position_changed {
            state.last_position = Some(current_position);
            state.last_position_time = Some(now);
        }

        if next != state.stall_condition {
            settle_duty(state, tau, now);
            match next {
                StallCondition::Confirmed => {
                    warn!(channel, position = current_position, target = target_angle, "stall confirmed")
                }
                StallCondition::Suspected => {
                    debug!(channel, position = current_position, target = target_angle, "stall suspected")
                }
                StallCondition::Normal => debug!(channel, "stall condition back to normal"),
            }
            state.stall_condition = next;
        }
        next
    }

    /// Current stall state of `channel` (`Normal` for unknown channels).
    pub fn stall_condition(&self, channel: u8) -> StallCondition {
        self.channel(channel)
            .map(|s| s.stall_condition)
            .unwrap_or_default()
    }

    // ── Current estimation ──────────────────────────────────────────────────

    /// Estimated draw of `channel` in mA; `0.0` for unknown channels.
    pub fn estimate_current(&self, channel: u8) -> f64 {
        let idx = usize::from(channel);
        match (self.channels.get(idx), self.profiles.get(idx)) {
            (Some(state), Some(profile)) if state.is_moving => {
                moving_current(profile, state.stall_condition)
            }
            (Some(_), Some(profile)) => profile.idle_ma,
            _ => 0.0,
        }
    }

    /// Sum of all channel estimates in mA.
    pub fn get_total_current(&self) -> f64 {
        (0..self.num_channels()).map(|ch| self.estimate_current(ch)).sum()
    }

    /// System-wide soft budget in mA.
    pub fn current_budget(&self) -> f64 {
        let all_stalled: f64 = self.profiles.iter().map(|p| p.stall_ma).sum();
        all_stalled * self.config.soft_limit_factor
    }

    // ── Thermal duty cycle ──────────────────────────────────────────────────

    /// Allowed duty cycle of `channel` in `[0, max_duty_cycle]`; `0.0` for
    /// unknown channels.
    pub fn get_duty_cycle(&self, channel: u8) -> f64 {
        let idx = usize::from(channel);
        let (Some(state), Some(tau)) = (self.channels.get(idx), self.time_constant(idx)) else {
            return 0.0;
        };
        let used = decayed_duty(state, tau, self.clock.now());
        let penalty = match state.stall_condition {
            StallCondition::Normal => 1.0,
            StallCondition::Suspected => 0.75,
            StallCondition::Confirmed => 0.5,
        };
        let max = self.config.max_duty_cycle;
        (max * (1.0 - used) * penalty).clamp(0.0, max)
    }

    // ── Authorisation ───────────────────────────────────────────────────────

    /// Decide whether a new movement on `channel` may start.
    ///
    /// # Errors
    ///
    /// The first [`MovementDenied`] reason, checked in order: unknown
    /// channel, confirmed stall, exhausted duty cycle, current budget.
    pub fn is_movement_allowed(&self, channel: u8) -> Result<(), MovementDenied> {
        let idx = usize::from(channel);
        let (Some(state), Some(profile)) = (self.channels.get(idx), self.profiles.get(idx)) else {
            return Err(MovementDenied::UnknownChannel(channel));
        };
        if state.stall_condition == StallCondition::Confirmed {
            return Err(MovementDenied::StallConfirmed { channel });
        }
        let duty = self.get_duty_cycle(channel);
        if duty < self.config.min_duty_cycle {
            return Err(MovementDenied::DutyCycleExhausted {
                channel,
                duty,
                min: self.config.min_duty_cycle,
            });
        }
        let projected_ma = self.get_total_current() - self.estimate_current(channel)
            + moving_current(profile, StallCondition::Normal);
        let budget_ma = self.current_budget();
        if projected_ma > budget_ma {
            return Err(MovementDenied::CurrentBudgetExceeded {
                channel,
                projected_ma,
                budget_ma,
            });
        }
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Channels with a confirmed stall.
    pub fn get_stalled_channels(&self) -> Vec<u8> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, s)| s.stall_condition == StallCondition::Confirmed)
            .map(|(ch, _)| ch as u8)
            .collect()
    }

    /// Channels whose duty cycle fell under the thermal-limit threshold.
    pub fn get_thermal_limited_channels(&self) -> Vec<u8> {
        let threshold = self.config.max_duty_cycle * self.config.thermal_limit_ratio;
        (0..self.num_channels())
            .filter(|&ch| self.get_duty_cycle(ch) < threshold)
            .collect()
    }

    pub fn get_diagnostics(&self) -> LimiterDiagnostics {
        let channels = self
            .channels
            .iter()
            .enumerate()
            .map(|(idx, state)| {
                let ch = idx as u8;
                ChannelDiagnostics {
                    channel: ch,
                    is_moving: state.is_moving,
                    target_angle: state.target_angle,
                    last_position: state.last_position,
                    stall_condition: state.stall_condition,
                    estimated_current_ma: self.estimate_current(ch),
                    duty_cycle: self.get_duty_cycle(ch),
                }
            })
            .collect();
        LimiterDiagnostics {
            total_current_ma: self.get_total_current(),
            current_budget_ma: self.current_budget(),
            stalled_channels: self.get_stalled_channels(),
            thermal_limited_channels: self.get_thermal_limited_channels(),
            channels,
        }
    }

    // ── Reset ───────────────────────────────────────────────────────────────

    /// Return `channel` to a fresh, idle, cool state.
    pub fn reset_channel(&mut self, channel: u8) {
        let now = self.clock.now();
        if let Some(state) = self.channels.get_mut(usize::from(channel)) {
            *state = ChannelState::new(now);
        }
    }

    pub fn reset_all_channels(&mut self) {
        let now = self.clock.now();
        for state in &mut self.channels {
            *state = ChannelState::new(now);
        }
        debug!(channels = self.channels.len(), "limiter state reset");
    }

    fn time_constant(&self, idx: usize) -> Option<f64> {
        self.profiles.get(idx).map(|p| p.thermal_time_constant_s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Model helpers
// ────────────────────────────────────────────────────────────────────────────

fn moving_current(profile: &ServoCurrentProfile, condition: StallCondition) -> f64 {
    profile.idle_ma + (profile.stall_ma - profile.idle_ma) * condition.load_factor()
}

/// Duty integral at `now` without mutating the channel.
fn decayed_duty(state: &ChannelState, tau_s: f64, now: Instant) -> f64 {
    let dt = now
        .saturating_duration_since(state.last_duty_update)
        .as_secs_f64();
    let decay = (-dt / tau_s).exp();
    let load = if state.is_moving {
        state.stall_condition.load_factor()
    } else {
        0.0
    };
    (state.cumulative_duty * decay + load * (1.0 - decay)).clamp(0.0, 1.0)
}

/// Fold the elapsed interval into `cumulative_duty`.  Must run before any
/// change to `is_moving` or `stall_condition`.
fn settle_duty(state: &mut ChannelState, tau_s: f64, now: Instant) {
    state.cumulative_duty = decayed_duty(state, tau_s, now);
    state.last_duty_update = now;
}
