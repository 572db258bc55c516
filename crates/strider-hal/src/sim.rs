//! In-process simulated hardware for tests and headless runs.
//!
//! [`SimServoDriver`] records every command and can be told to fail, panic,
//! or hold a channel jammed.  [`SimButton`] drives the edge callback from the
//! calling thread (or a spawned one) and lets tests inject noise edges.
//! [`SimSensor`] counts polls and fails on demand.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use strider_types::SafetyError;

use crate::actuator::{DEFAULT_NUM_CHANNELS, ServoDriver, angle_in_range};
use crate::input::{DigitalInput, EdgeCallback};
use crate::sensor::Sensor;

// ────────────────────────────────────────────────────────────────────────────
// Simulated servo driver
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SimServoState {
    positions: Vec<Option<f64>>,
    commands: Vec<(u8, f64)>,
    jammed: HashSet<u8>,
}

/// A simulated multi-channel servo board.
///
/// Unjammed channels reach their commanded angle instantly.  A jammed
/// channel keeps reporting its last position whatever it is commanded to.
pub struct SimServoDriver {
    num_channels: u8,
    state: Mutex<SimServoState>,
    disable_calls: AtomicUsize,
    fail_disable: AtomicBool,
    panic_on_disable: AtomicBool,
    fail_writes: AtomicBool,
}

impl SimServoDriver {
    pub fn new(num_channels: u8) -> Self {
        Self {
            num_channels,
            state: Mutex::new(SimServoState {
                positions: vec![None; usize::from(num_channels)],
                ..SimServoState::default()
            }),
            disable_calls: AtomicUsize::new(0),
            fail_disable: AtomicBool::new(false),
            panic_on_disable: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent `disable_all` calls return an error.
    pub fn set_fail_disable(&self, fail: bool) {
        self.fail_disable.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `disable_all` calls panic.
    pub fn set_panic_on_disable(&self, panic: bool) {
        self.panic_on_disable.store(panic, Ordering::SeqCst);
    }

    /// Make subsequent `set_channel_angle` calls return an error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Freeze `channel` at its current position.
    pub fn jam(&self, channel: u8) {
        self.state.lock().jammed.insert(channel);
    }

    pub fn unjam(&self, channel: u8) {
        self.state.lock().jammed.remove(&channel);
    }

    /// Force the reported position of `channel`.
    pub fn set_position(&self, channel: u8, position: Option<f64>) {
        if let Some(slot) = self.state.lock().positions.get_mut(usize::from(channel)) {
            *slot = position;
        }
    }

    /// Number of `disable_all` calls received, successful or not.
    pub fn disable_count(&self) -> usize {
        self.disable_calls.load(Ordering::SeqCst)
    }

    /// Every accepted `(channel, angle)` command, oldest first.
    pub fn commands(&self) -> Vec<(u8, f64)> {
        self.state.lock().commands.clone()
    }

    pub fn last_command(&self) -> Option<(u8, f64)> {
        self.state.lock().commands.last().copied()
    }
}

impl Default for SimServoDriver {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_CHANNELS)
    }
}

impl ServoDriver for SimServoDriver {
    fn num_channels(&self) -> u8 {
        self.num_channels
    }

    fn disable_all(&self) -> Result<(), SafetyError> {
        self.disable_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_disable.load(Ordering::SeqCst) {
            panic!("simulated disable_all panic");
        }
        if self.fail_disable.load(Ordering::SeqCst) {
            return Err(SafetyError::hardware("sim_servo", "simulated disable failure"));
        }
        Ok(())
    }

    fn set_channel_angle(&self, channel: u8, angle_deg: f64) -> Result<(), SafetyError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SafetyError::hardware("sim_servo", "simulated write failure"));
        }
        if channel >= self.num_channels || !angle_in_range(angle_deg) {
            return Err(SafetyError::hardware(
                "sim_servo",
                format!("invalid command channel={channel} angle={angle_deg}"),
            ));
        }
        let mut state = self.state.lock();
        state.commands.push((channel, angle_deg));
        if !state.jammed.contains(&channel) {
            state.positions[usize::from(channel)] = Some(angle_deg);
        }
        Ok(())
    }

    fn channel_position(&self, channel: u8) -> Option<f64> {
        self.state.lock().positions.get(usize::from(channel)).copied().flatten()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated button
// ────────────────────────────────────────────────────────────────────────────

/// A simulated active-low push button.
pub struct SimButton {
    id: String,
    level_high: AtomicBool,
    callback: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    debounce: Mutex<Option<Duration>>,
    fail_arm: AtomicBool,
    fail_read: AtomicBool,
}

impl SimButton {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            level_high: AtomicBool::new(true),
            callback: Mutex::new(None),
            debounce: Mutex::new(None),
            fail_arm: AtomicBool::new(false),
            fail_read: AtomicBool::new(false),
        }
    }

    /// Make `on_falling_edge` fail, as if the GPIO line were unavailable.
    pub fn set_fail_arm(&self, fail: bool) {
        self.fail_arm.store(fail, Ordering::SeqCst);
    }

    /// Make `read_level` fail.
    pub fn set_fail_read(&self, fail: bool) {
        self.fail_read.store(fail, Ordering::SeqCst);
    }

    /// `true` while a callback is registered.
    pub fn is_armed(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Debounce window requested by the last registration.
    pub fn debounce(&self) -> Option<Duration> {
        *self.debounce.lock()
    }

    /// Hold the button down and deliver the falling edge on this thread.
    pub fn press(&self) {
        self.level_high.store(false, Ordering::SeqCst);
        self.fire();
    }

    /// Hold the button down and deliver the edge from a separate thread, the
    /// way an interrupt handler would.  Returns once the callback finished.
    pub fn press_from_interrupt(self: &Arc<Self>) {
        self.level_high.store(false, Ordering::SeqCst);
        let button = Arc::clone(self);
        let _ = std::thread::spawn(move || button.fire()).join();
    }

    /// Let go of the button.
    pub fn release_button(&self) {
        self.level_high.store(true, Ordering::SeqCst);
    }

    /// Deliver an edge while the line stays high (electrical noise).
    pub fn glitch(&self) {
        self.fire();
    }

    fn fire(&self) {
        let callback = self.callback.lock().clone();
        if let Some(cb) = callback {
            cb();
        }
    }
}

impl DigitalInput for SimButton {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_falling_edge(
        &self,
        debounce: Duration,
        callback: EdgeCallback,
    ) -> Result<(), SafetyError> {
        if self.fail_arm.load(Ordering::SeqCst) {
            return Err(SafetyError::hardware(
                self.id.clone(),
                "simulated edge registration failure",
            ));
        }
        *self.debounce.lock() = Some(debounce);
        *self.callback.lock() = Some(Arc::from(callback));
        Ok(())
    }

    fn read_level(&self) -> Result<bool, SafetyError> {
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(SafetyError::hardware(self.id.clone(), "simulated read failure"));
        }
        Ok(self.level_high.load(Ordering::SeqCst))
    }

    fn release(&self) {
        *self.callback.lock() = None;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated sensor
// ────────────────────────────────────────────────────────────────────────────

/// A simulated sensor whose failure mode is switched through a shared flag.
pub struct SimSensor {
    id: String,
    failing: Arc<AtomicBool>,
    polls: Arc<AtomicUsize>,
}

impl SimSensor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            failing: Arc::new(AtomicBool::new(false)),
            polls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Flag that, when set, makes every poll fail.
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.failing)
    }

    /// Counter of poll attempts.
    pub fn poll_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.polls)
    }
}

impl Sensor for SimSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn poll(&mut self) -> Result<(), SafetyError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SafetyError::hardware(self.id.clone(), "simulated sensor dropout"));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
