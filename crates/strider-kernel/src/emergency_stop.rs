//! [`EmergencyStop`] – latching stop state machine.
//!
//! ```text
//! Init ──start──▶ Running ──trigger──▶ EStop ──▶ ResetRequired
//!   ▲                ▲                                │
//!   └──── reset ─────┴──── reset (auto_reset) ────────┘
//! ```
//!
//! `trigger` is the one path that must always work.  It disables every
//! actuator first, then latches `EStop → ResetRequired` in the same critical
//! section, records an [`EmergencyStopEvent`] and notifies the registered
//! state callbacks.  Driver errors and driver panics are recorded in the
//! returned [`TriggerOutcome`] and never reach the caller.
//!
//! The internal lock is a [`ReentrantMutex`], so a state callback (or a
//! button edge delivered on the same thread) may call back into the stop.
//! Callbacks run on the triggering thread while the lock is held and must
//! not block.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;
use serde::Serialize;
use strider_hal::{DigitalInput, EdgeCallback, SharedServoDriver};
use strider_types::{EmergencyStopEvent, SafetyError, SafetyState, TriggerOutcome};
use tracing::{debug, error, info, warn};

use crate::config::EmergencyStopConfig;

/// Source string recorded for presses of the physical button.
pub const BUTTON_SOURCE: &str = "physical_button";

/// Closure notified with `(from, to)` on every state change.
pub type StateCallback = Arc<dyn Fn(SafetyState, SafetyState) + Send + Sync>;

/// Counters exposed through diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyStopStats {
    pub state: SafetyState,
    /// Triggers that actually latched (redundant calls excluded).
    pub trigger_count: u64,
    pub last_latency_ms: Option<f64>,
    pub mean_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub last_source: Option<String>,
    pub last_disable_succeeded: Option<bool>,
    pub button_armed: bool,
    pub history_len: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

struct EstopCore {
    state: SafetyState,
    history: VecDeque<EmergencyStopEvent>,
    callbacks: Vec<StateCallback>,
    trigger_count: u64,
    total_latency_ms: f64,
    max_latency_ms: f64,
    last_outcome: Option<TriggerOutcome>,
    last_source: Option<String>,
    button_armed: bool,
}

impl EstopCore {
    fn transition(&mut self, to: SafetyState) -> Result<SafetyState, SafetyError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(SafetyError::StateTransition(format!(
                "emergency stop cannot go from {from} to {to}"
            )));
        }
        self.state = to;
        Ok(from)
    }
}

struct EstopShared {
    driver: SharedServoDriver,
    config: EmergencyStopConfig,
    button: Option<Arc<dyn DigitalInput>>,
    core: ReentrantMutex<RefCell<EstopCore>>,
}

// ────────────────────────────────────────────────────────────────────────────
// EmergencyStop
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable handle to one emergency-stop latch.
///
/// Clones share the same state; hand them to the watchdog, the coordinator
/// and anything else that must be able to stop the robot.
#[derive(Clone)]
pub struct EmergencyStop {
    shared: Arc<EstopShared>,
}

impl EmergencyStop {
    /// Create a stop in [`SafetyState::Init`].  The button, if any, is armed
    /// by [`start`](Self::start).
    pub fn new(
        driver: SharedServoDriver,
        config: EmergencyStopConfig,
        button: Option<Arc<dyn DigitalInput>>,
    ) -> Self {
        let capacity = config.history_capacity.max(1);
        Self {
            shared: Arc::new(EstopShared {
                driver,
                config,
                button,
                core: ReentrantMutex::new(RefCell::new(EstopCore {
                    state: SafetyState::Init,
                    history: VecDeque::with_capacity(capacity),
                    callbacks: Vec::new(),
                    trigger_count: 0,
                    total_latency_ms: 0.0,
                    max_latency_ms: 0.0,
                    last_outcome: None,
                    last_source: None,
                    button_armed: false,
                })),
            }),
        }
    }

    pub fn state(&self) -> SafetyState {
        self.shared.core.lock().borrow().state
    }

    /// `true` only while `Running`.
    pub fn is_safe(&self) -> bool {
        self.state().permits_actuation()
    }

    /// Enter `Running` from `Init` and arm the stop button.
    ///
    /// Already `Running` is a no-op.  A button that cannot be armed is
    /// logged; software triggers keep working.
    ///
    /// # Errors
    ///
    /// [`SafetyError::StateTransition`] from a latched state; use
    /// [`reset`](Self::reset) first.
    pub fn start(&self) -> Result<(), SafetyError> {
        {
            let guard = self.shared.core.lock();
            let from = guard.borrow().state;
            match from {
                SafetyState::Running => return Ok(()),
                SafetyState::Init => {}
                other => {
                    return Err(SafetyError::StateTransition(format!(
                        "cannot start emergency stop from {other}; reset it first"
                    )));
                }
            }
            guard.borrow_mut().transition(SafetyState::Running)?;
            info!("emergency stop running");
            self.notify(&[(from, SafetyState::Running)]);
        }
        self.arm_button();
        Ok(())
    }

    /// Stop everything now.
    ///
    /// Redundant calls while `EStop`/`ResetRequired` return
    /// [`TriggerOutcome::already_stopped`] without touching the driver.
    pub fn trigger(&self, source: &str) -> TriggerOutcome {
        let guard = self.shared.core.lock();
        let previous = guard.borrow().state;
        if previous.is_stopped() {
            debug!(source, "emergency stop already latched");
            return TriggerOutcome::already_stopped();
        }

        let started = Instant::now();
        let disable_succeeded =
            match panic::catch_unwind(AssertUnwindSafe(|| self.shared.driver.disable_all())) {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    error!(source, error = %e, "actuator disable failed during emergency stop");
                    false
                }
                Err(_) => {
                    error!(source, "actuator driver panicked during emergency stop");
                    false
                }
            };

        let mut changes = Vec::with_capacity(2);
        let latency_ms = {
            let mut core = guard.borrow_mut();
            for to in [SafetyState::EStop, SafetyState::ResetRequired] {
                let from = core.state;
                if let Err(e) = core.transition(to) {
                    error!(error = %e, "forcing emergency stop latch");
                    core.state = to;
                }
                changes.push((from, to));
            }
            // 0.0 is reserved for redundant triggers.
            let latency_ms = (started.elapsed().as_secs_f64() * 1000.0).max(f64::MIN_POSITIVE);

            if core.history.len() >= self.shared.config.history_capacity.max(1) {
                core.history.pop_front();
            }
            core.history.push_back(EmergencyStopEvent::new(
                source,
                latency_ms,
                previous,
                disable_succeeded,
            ));
            core.trigger_count += 1;
            core.total_latency_ms += latency_ms;
            core.max_latency_ms = core.max_latency_ms.max(latency_ms);
            core.last_source = Some(source.to_string());
            core.last_outcome = Some(TriggerOutcome {
                latency_ms,
                disable_succeeded,
                already_stopped: false,
            });
            latency_ms
        };

        warn!(
            source,
            latency_ms,
            disable_succeeded,
            previous = %previous,
            "EMERGENCY STOP"
        );
        self.notify(&changes);

        TriggerOutcome {
            latency_ms,
            disable_succeeded,
            already_stopped: false,
        }
    }

    /// Leave the latch.  Lands in `Running` with `auto_reset`, else `Init`.
    ///
    /// # Errors
    ///
    /// [`SafetyError::StateTransition`] unless the state is `ResetRequired`.
    pub fn reset(&self) -> Result<SafetyState, SafetyError> {
        let to = {
            let guard = self.shared.core.lock();
            let from = guard.borrow().state;
            if from != SafetyState::ResetRequired {
                return Err(SafetyError::StateTransition(format!(
                    "emergency stop reset requires ResetRequired, state is {from}"
                )));
            }
            let to = if self.shared.config.auto_reset {
                SafetyState::Running
            } else {
                SafetyState::Init
            };
            guard.borrow_mut().transition(to)?;
            info!(to = %to, "emergency stop reset");
            self.notify(&[(from, to)]);
            to
        };
        if to == SafetyState::Running {
            self.arm_button();
        }
        Ok(to)
    }

    /// Detach from the button GPIO.  A later `start` re-arms it.
    pub fn release_button(&self) {
        let Some(button) = self.shared.button.as_ref() else {
            return;
        };
        let guard = self.shared.core.lock();
        if guard.borrow().button_armed {
            button.release();
            guard.borrow_mut().button_armed = false;
            debug!(button = button.id(), "stop button released");
        }
    }

    /// Register `callback` for every subsequent state change.
    ///
    /// The callback runs on the thread that changed the state, with the stop
    /// lock held.  It may query or trigger the stop but must not block;
    /// a panic inside it is caught and logged.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(SafetyState, SafetyState) + Send + Sync + 'static,
    {
        self.shared
            .core
            .lock()
            .borrow_mut()
            .callbacks
            .push(Arc::new(callback));
    }

    /// Recorded stop events, oldest first.
    pub fn history(&self) -> Vec<EmergencyStopEvent> {
        self.shared.core.lock().borrow().history.iter().cloned().collect()
    }

    pub fn last_source(&self) -> Option<String> {
        self.shared.core.lock().borrow().last_source.clone()
    }

    pub fn stats(&self) -> EmergencyStopStats {
        let guard = self.shared.core.lock();
        let core = guard.borrow();
        let mean = (core.trigger_count > 0).then(|| core.total_latency_ms / core.trigger_count as f64);
        EmergencyStopStats {
            state: core.state,
            trigger_count: core.trigger_count,
            last_latency_ms: core.last_outcome.map(|o| o.latency_ms),
            mean_latency_ms: mean,
            max_latency_ms: (core.trigger_count > 0).then_some(core.max_latency_ms),
            last_source: core.last_source.clone(),
            last_disable_succeeded: core.last_outcome.map(|o| o.disable_succeeded),
            button_armed: core.button_armed,
            history_len: core.history.len(),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Run the callbacks for each `(from, to)` pair.  Caller holds the lock
    /// but no `RefCell` borrow.
    fn notify(&self, changes: &[(SafetyState, SafetyState)]) {
        let guard = self.shared.core.lock();
        let callbacks = guard.borrow().callbacks.clone();
        for &(from, to) in changes {
            for callback in &callbacks {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(from, to))).is_err() {
                    warn!(from = %from, to = %to, "emergency stop state callback panicked");
                }
            }
        }
    }

    fn arm_button(&self) {
        let Some(button) = self.shared.button.as_ref() else {
            return;
        };
        if self.shared.core.lock().borrow().button_armed {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let callback: EdgeCallback = Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                EmergencyStop { shared }.handle_button_edge();
            }
        });
        let debounce = Duration::from_millis(self.shared.config.button_debounce_ms);
        match button.on_falling_edge(debounce, callback) {
            Ok(()) => {
                self.shared.core.lock().borrow_mut().button_armed = true;
                info!(button = button.id(), "stop button armed");
            }
            Err(e) => {
                warn!(button = button.id(), error = %e, "stop button unavailable, software triggers only");
            }
        }
    }

    /// Falling edge from the button driver.  The level is re-read so that a
    /// noise edge on a line that is still high is discarded.
    fn handle_button_edge(&self) {
        let Some(button) = self.shared.button.as_ref() else {
            return;
        };
        match button.read_level() {
            Ok(false) => {
                self.trigger(BUTTON_SOURCE);
            }
            Ok(true) => {
                debug!(button = button.id(), "edge without sustained low level discarded");
            }
            Err(e) => {
                warn!(button = button.id(), error = %e, "button level unreadable, treating edge as a press");
                self.trigger(BUTTON_SOURCE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use strider_hal::{ServoDriver, SimButton, SimServoDriver};

    fn estop_with(config: EmergencyStopConfig) -> (EmergencyStop, Arc<SimServoDriver>) {
        let driver = Arc::new(SimServoDriver::new(4));
        let estop = EmergencyStop::new(driver.clone(), config, None);
        (estop, driver)
    }

    fn estop() -> (EmergencyStop, Arc<SimServoDriver>) {
        estop_with(EmergencyStopConfig::default())
    }

    fn estop_with_button() -> (EmergencyStop, Arc<SimServoDriver>, Arc<SimButton>) {
        let driver = Arc::new(SimServoDriver::new(4));
        let button = Arc::new(SimButton::new("gpio17"));
        let estop = EmergencyStop::new(
            driver.clone(),
            EmergencyStopConfig::default(),
            Some(button.clone()),
        );
        (estop, driver, button)
    }

    // ------------------------------------------------------------------ lifecycle

    #[test]
    fn starts_in_init_and_runs_after_start() {
        let (e, _) = estop();
        assert_eq!(e.state(), SafetyState::Init);
        assert!(!e.is_safe());
        e.start().unwrap();
        assert_eq!(e.state(), SafetyState::Running);
        assert!(e.is_safe());
        // Second start is a no-op.
        e.start().unwrap();
    }

    #[test]
    fn start_refused_while_latched() {
        let (e, _) = estop();
        e.start().unwrap();
        e.trigger("test");
        assert!(matches!(e.start(), Err(SafetyError::StateTransition(_))));
        assert_eq!(e.state(), SafetyState::ResetRequired);
        assert_eq!(e.history().len(), 1);
    }

    #[test]
    fn trigger_disables_and_latches() {
        let (e, driver) = estop();
        e.start().unwrap();
        let outcome = e.trigger("test");
        assert!(!outcome.already_stopped);
        assert!(outcome.disable_succeeded);
        assert!(outcome.latency_ms > 0.0);
        assert_eq!(e.state(), SafetyState::ResetRequired);
        assert_eq!(driver.disable_count(), 1);
    }

    #[test]
    fn repeated_trigger_is_a_silent_noop() {
        let (e, driver) = estop();
        e.start().unwrap();
        assert!(e.trigger("first").latency_ms > 0.0);
        let second = e.trigger("second");
        assert_eq!(second.latency_ms, 0.0);
        assert!(second.already_stopped);
        assert_eq!(driver.disable_count(), 1);
        assert_eq!(e.history().len(), 1);
        assert_eq!(e.last_source().as_deref(), Some("first"));
    }

    #[test]
    fn trigger_from_init_latches() {
        let (e, driver) = estop();
        let outcome = e.trigger("boot_fault");
        assert!(!outcome.already_stopped);
        assert_eq!(e.state(), SafetyState::ResetRequired);
        assert_eq!(driver.disable_count(), 1);
        assert_eq!(e.history()[0].previous_state, SafetyState::Init);
    }

    #[test]
    fn disable_failure_still_latches() {
        let (e, driver) = estop();
        e.start().unwrap();
        driver.set_fail_disable(true);
        let outcome = e.trigger("test");
        assert!(!outcome.disable_succeeded);
        assert_eq!(e.state(), SafetyState::ResetRequired);
        assert_eq!(e.stats().last_disable_succeeded, Some(false));
    }

    #[test]
    fn disable_panic_still_latches() {
        let (e, driver) = estop();
        e.start().unwrap();
        driver.set_panic_on_disable(true);
        let outcome = e.trigger("test");
        assert!(!outcome.disable_succeeded);
        assert_eq!(e.state(), SafetyState::ResetRequired);
        assert!(!e.history()[0].disable_succeeded);
    }

    #[test]
    fn reset_only_from_reset_required() {
        let (e, _) = estop();
        assert!(e.reset().is_err());
        assert_eq!(e.state(), SafetyState::Init);
        e.start().unwrap();
        assert!(e.reset().is_err());
        assert_eq!(e.state(), SafetyState::Running);
        assert!(e.is_safe());
        e.trigger("test");
        assert_eq!(e.reset().unwrap(), SafetyState::Init);
        assert_eq!(e.state(), SafetyState::Init);
    }

    #[test]
    fn auto_reset_lands_in_running() {
        let (e, _) = estop_with(EmergencyStopConfig {
            auto_reset: true,
            ..EmergencyStopConfig::default()
        });
        e.start().unwrap();
        e.trigger("test");
        assert_eq!(e.reset().unwrap(), SafetyState::Running);
        assert!(e.is_safe());
    }

    #[test]
    fn history_is_bounded() {
        let (e, _) = estop_with(EmergencyStopConfig {
            history_capacity: 3,
            ..EmergencyStopConfig::default()
        });
        for i in 0..5 {
            e.trigger(&format!("cycle-{i}"));
            e.reset().unwrap();
        }
        let sources: Vec<_> = e.history().into_iter().map(|ev| ev.source).collect();
        assert_eq!(sources, vec!["cycle-2", "cycle-3", "cycle-4"]);
        assert_eq!(e.stats().trigger_count, 5);
    }

    #[test]
    fn stats_track_latency() {
        let (e, _) = estop();
        assert_eq!(e.stats().mean_latency_ms, None);
        e.trigger("a");
        let stats = e.stats();
        assert_eq!(stats.trigger_count, 1);
        assert_eq!(stats.state, SafetyState::ResetRequired);
        assert!(stats.max_latency_ms.unwrap() >= stats.mean_latency_ms.unwrap());
        assert_eq!(stats.last_source.as_deref(), Some("a"));
    }

    // ------------------------------------------------------------------ callbacks

    #[test]
    fn callbacks_see_every_transition() {
        let (e, _) = estop();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        e.on_state_change(move |from, to| sink.lock().unwrap().push((from, to)));

        e.start().unwrap();
        e.trigger("test");
        e.reset().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (SafetyState::Init, SafetyState::Running),
                (SafetyState::Running, SafetyState::EStop),
                (SafetyState::EStop, SafetyState::ResetRequired),
                (SafetyState::ResetRequired, SafetyState::Init),
            ]
        );
    }

    #[test]
    fn callback_may_reenter_the_stop() {
        let (e, driver) = estop();
        let inner = e.clone();
        let nested = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&nested);
        e.on_state_change(move |_, to| {
            if to == SafetyState::EStop {
                // Same thread, lock already held.
                let outcome = inner.trigger("nested");
                sink.lock().unwrap().push((inner.state(), outcome.already_stopped));
            }
        });
        e.start().unwrap();
        e.trigger("outer");
        assert_eq!(driver.disable_count(), 1);
        assert_eq!(
            *nested.lock().unwrap(),
            vec![(SafetyState::ResetRequired, true)]
        );
    }

    #[test]
    fn panicking_callback_is_contained() {
        let (e, _) = estop();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        e.on_state_change(|_, _| panic!("bad observer"));
        e.on_state_change(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        e.start().unwrap();
        let outcome = e.trigger("test");
        assert!(!outcome.already_stopped);
        assert_eq!(e.state(), SafetyState::ResetRequired);
        // start + EStop + ResetRequired reached the second observer.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    // ------------------------------------------------------------------ button

    #[test]
    fn start_arms_button_with_debounce() {
        let (e, _, button) = estop_with_button();
        assert!(!button.is_armed());
        e.start().unwrap();
        assert!(button.is_armed());
        assert_eq!(button.debounce(), Some(Duration::from_millis(50)));
        assert!(e.stats().button_armed);
    }

    #[test]
    fn button_press_triggers_stop() {
        let (e, driver, button) = estop_with_button();
        e.start().unwrap();
        button.press();
        assert_eq!(e.state(), SafetyState::ResetRequired);
        assert_eq!(driver.disable_count(), 1);
        assert_eq!(e.last_source().as_deref(), Some(BUTTON_SOURCE));
    }

    #[test]
    fn button_press_from_interrupt_thread() {
        let (e, _, button) = estop_with_button();
        e.start().unwrap();
        button.press_from_interrupt();
        assert_eq!(e.state(), SafetyState::ResetRequired);
    }

    #[test]
    fn noise_edge_is_discarded() {
        let (e, driver, button) = estop_with_button();
        e.start().unwrap();
        button.glitch();
        assert_eq!(e.state(), SafetyState::Running);
        assert_eq!(driver.disable_count(), 0);
    }

    #[test]
    fn unreadable_level_counts_as_press() {
        let (e, _, button) = estop_with_button();
        e.start().unwrap();
        button.set_fail_read(true);
        button.glitch();
        assert_eq!(e.state(), SafetyState::ResetRequired);
    }

    #[test]
    fn arm_failure_keeps_software_trigger() {
        let (e, _, button) = estop_with_button();
        button.set_fail_arm(true);
        e.start().unwrap();
        assert_eq!(e.state(), SafetyState::Running);
        assert!(!e.stats().button_armed);
        assert!(!e.trigger("software").already_stopped);
    }

    #[test]
    fn released_button_is_rearmed_by_start() {
        let (e, _, button) = estop_with_button();
        e.start().unwrap();
        e.release_button();
        assert!(!button.is_armed());
        button.press();
        assert_eq!(e.state(), SafetyState::Running);

        e.trigger("test");
        e.reset().unwrap();
        button.release_button();
        e.start().unwrap();
        assert!(button.is_armed());
    }

    // ------------------------------------------------------------------ timing and threads

    #[test]
    fn median_trigger_latency_under_five_ms() {
        let (e, _) = estop();
        let mut latencies: Vec<f64> = (0..50)
            .map(|_| {
                e.start().unwrap();
                let outcome = e.trigger("latency_check");
                e.reset().unwrap();
                outcome.latency_ms
            })
            .collect();
        latencies.sort_by(f64::total_cmp);
        let median = latencies[latencies.len() / 2];
        assert!(median < 5.0, "median latency {median} ms");
    }

    #[test]
    fn concurrent_triggers_disable_once() {
        let (e, driver) = estop();
        e.start().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let e = e.clone();
                thread::spawn(move || e.trigger(&format!("thread-{i}")))
            })
            .collect();
        let latched = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| !o.already_stopped)
            .count();
        assert_eq!(latched, 1);
        assert_eq!(driver.disable_count(), 1);
        assert_eq!(e.stats().trigger_count, 1);
    }

    #[test]
    fn driver_shared_between_handles() {
        let driver = Arc::new(SimServoDriver::new(2));
        let shared: SharedServoDriver = driver.clone();
        let e = EmergencyStop::new(shared, EmergencyStopConfig::default(), None);
        driver.set_channel_angle(0, 10.0).unwrap();
        e.trigger("test");
        assert_eq!(driver.disable_count(), 1);
    }
}
