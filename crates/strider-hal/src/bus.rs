//! Explicitly passed bus handles and a PWM servo driver built on one.
//!
//! There is no process-wide bus singleton: whoever opens the transport wraps
//! it in a [`BusHandle`] and hands clones to the drivers that share it.  The
//! handle's mutex serialises every transaction on the wire.

use std::sync::Arc;

use parking_lot::Mutex;
use strider_types::SafetyError;
use tracing::debug;

use crate::actuator::{DEFAULT_NUM_CHANNELS, ServoDriver, angle_in_range};

// ────────────────────────────────────────────────────────────────────────────
// BusHandle
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable, mutex-guarded owner of a bus transport.
pub struct BusHandle<B> {
    inner: Arc<Mutex<B>>,
}

impl<B> Clone for BusHandle<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B> BusHandle<B> {
    pub fn new(bus: B) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }

    /// Run one exclusive transaction against the bus.
    pub fn transact<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        let mut bus = self.inner.lock();
        f(&mut bus)
    }

    /// Number of live handles sharing this bus.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PWM transport
// ────────────────────────────────────────────────────────────────────────────

/// Minimal PWM controller interface (PCA9685-class boards).
pub trait PwmBus: Send {
    /// Emit a pulse of `pulse_us` microseconds on `channel` every frame.
    fn set_pulse_us(&mut self, channel: u8, pulse_us: u16) -> Result<(), SafetyError>;

    /// Switch every output fully off.
    fn all_off(&mut self) -> Result<(), SafetyError>;
}

// ────────────────────────────────────────────────────────────────────────────
// PwmServoDriver
// ────────────────────────────────────────────────────────────────────────────

/// Open-loop hobby-servo driver on a [`PwmBus`].
///
/// Hobby servos have no feedback line, so [`ServoDriver::channel_position`]
/// reports the last commanded angle, and `None` after a disable.
pub struct PwmServoDriver<B> {
    bus: BusHandle<B>,
    num_channels: u8,
    min_pulse_us: u16,
    max_pulse_us: u16,
    positions: Mutex<Vec<Option<f64>>>,
}

impl<B: PwmBus> PwmServoDriver<B> {
    /// Driver with the common 500–2500 µs pulse range on 16 channels.
    pub fn new(bus: BusHandle<B>) -> Self {
        Self::with_pulse_range(bus, DEFAULT_NUM_CHANNELS, 500, 2500)
    }

    pub fn with_pulse_range(
        bus: BusHandle<B>,
        num_channels: u8,
        min_pulse_us: u16,
        max_pulse_us: u16,
    ) -> Self {
        Self {
            bus,
            num_channels,
            min_pulse_us,
            max_pulse_us,
            positions: Mutex::new(vec![None; usize::from(num_channels)]),
        }
    }

    /// Map an angle in `[0, 180]` linearly onto the pulse range.
    pub fn angle_to_pulse_us(&self, angle_deg: f64) -> u16 {
        let span = f64::from(self.max_pulse_us - self.min_pulse_us);
        let pulse = f64::from(self.min_pulse_us) + span * (angle_deg / 180.0);
        pulse.round() as u16
    }
}

impl<B: PwmBus> ServoDriver for PwmServoDriver<B> {
    fn num_channels(&self) -> u8 {
        self.num_channels
    }

    fn disable_all(&self) -> Result<(), SafetyError> {
        self.bus.transact(|bus| bus.all_off())?;
        self.positions.lock().iter_mut().for_each(|p| *p = None);
        Ok(())
    }

    fn set_channel_angle(&self, channel: u8, angle_deg: f64) -> Result<(), SafetyError> {
        if channel >= self.num_channels {
            return Err(SafetyError::hardware(
                "pwm_servo",
                format!("channel {channel} out of range 0..{}", self.num_channels),
            ));
        }
        if !angle_in_range(angle_deg) {
            return Err(SafetyError::hardware(
                "pwm_servo",
                format!("angle {angle_deg} outside [0, 180]"),
            ));
        }
        let pulse = self.angle_to_pulse_us(angle_deg);
        debug!(channel, angle_deg, pulse_us = pulse, "servo pulse");
        self.bus.transact(|bus| bus.set_pulse_us(channel, pulse))?;
        self.positions.lock()[usize::from(channel)] = Some(angle_deg);
        Ok(())
    }

    fn channel_position(&self, channel: u8) -> Option<f64> {
        self.positions.lock().get(usize::from(channel)).copied().flatten()
    }
}
