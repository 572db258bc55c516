//! [`ServoWatchdog`] – dead-man timer for the control loop.
//!
//! The control loop proves it is alive by calling [`ServoWatchdog::feed`]
//! every cycle.  A background thread wakes every `poll_interval_ms`; once
//! more than `timeout_ms` has passed since the last feed it marks the
//! watchdog expired, stops itself and triggers the emergency stop with the
//! source `"watchdog timeout"`.
//!
//! The expiry check and the trigger happen under the watchdog lock, so a
//! feed racing with expiry is either seen before the check or rejected
//! after it.  As a consequence, emergency-stop state callbacks must not call
//! back into the watchdog.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use strider_types::SafetyError;
use tracing::{debug, error, info, warn};

use crate::config::WatchdogConfig;
use crate::emergency_stop::EmergencyStop;

/// Trigger source recorded when the watchdog expires.
pub const WATCHDOG_SOURCE: &str = "watchdog timeout";

const THREAD_NAME: &str = "servo-watchdog";

/// Snapshot of the watchdog counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogStats {
    pub running: bool,
    pub expired: bool,
    pub timeout_ms: u64,
    pub feed_count: u64,
    pub expiry_count: u64,
    pub time_since_feed_ms: Option<f64>,
}

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

struct WatchdogCore {
    running: bool,
    expired: bool,
    last_fed: Option<Instant>,
    feed_count: u64,
    expiry_count: u64,
    /// Bumped by every `start`; a monitor thread from an older start exits.
    generation: u64,
}

struct WatchdogShared {
    core: Mutex<WatchdogCore>,
    wake: Condvar,
}

// ────────────────────────────────────────────────────────────────────────────
// ServoWatchdog
// ────────────────────────────────────────────────────────────────────────────

/// Background timer that stops the robot when the control loop goes quiet.
pub struct ServoWatchdog {
    config: WatchdogConfig,
    estop: EmergencyStop,
    shared: Arc<WatchdogShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServoWatchdog {
    pub fn new(config: WatchdogConfig, estop: EmergencyStop) -> Self {
        Self {
            config,
            estop,
            shared: Arc::new(WatchdogShared {
                core: Mutex::new(WatchdogCore {
                    running: false,
                    expired: false,
                    last_fed: None,
                    feed_count: 0,
                    expiry_count: 0,
                    generation: 0,
                }),
                wake: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Arm the timer and spawn the monitor thread.  The first feed is
    /// implicit.  Starting a running watchdog is a no-op.
    ///
    /// # Errors
    ///
    /// [`SafetyError::ThreadSpawn`] when the OS refuses the thread.
    pub fn start(&self) -> Result<(), SafetyError> {
        let mut handle = self.handle.lock();
        let generation = {
            let mut core = self.shared.core.lock();
            if core.running {
                return Ok(());
            }
            core.running = true;
            core.expired = false;
            core.last_fed = Some(Instant::now());
            core.generation += 1;
            core.generation
        };

        // A monitor left over from an expiry has already exited its loop.
        if let Some(previous) = handle.take() {
            join_bounded(previous, Duration::from_millis(self.config.join_timeout_ms));
        }

        let shared = Arc::clone(&self.shared);
        let estop = self.estop.clone();
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let spawned = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || monitor(&shared, &estop, generation, timeout, poll));

        match spawned {
            Ok(h) => {
                *handle = Some(h);
                info!(
                    timeout_ms = self.config.timeout_ms,
                    poll_interval_ms = self.config.poll_interval_ms,
                    "servo watchdog started"
                );
                Ok(())
            }
            Err(e) => {
                self.shared.core.lock().running = false;
                error!(error = %e, "could not spawn servo watchdog thread");
                Err(SafetyError::ThreadSpawn(THREAD_NAME.to_string()))
            }
        }
    }

    /// Record a sign of life.  Ignored unless running; returns whether the
    /// feed was accepted.
    pub fn feed(&self) -> bool {
        let mut core = self.shared.core.lock();
        if !core.running {
            return false;
        }
        core.last_fed = Some(Instant::now());
        core.feed_count += 1;
        true
    }

    /// Disarm the timer and join the monitor thread, waiting at most
    /// `join_timeout_ms`.  Idempotent.
    pub fn stop(&self) {
        let mut handle = self.handle.lock();
        {
            let mut core = self.shared.core.lock();
            if core.running {
                core.running = false;
                info!("servo watchdog stopped");
            }
        }
        self.shared.wake.notify_all();
        if let Some(h) = handle.take() {
            join_bounded(h, Duration::from_millis(self.config.join_timeout_ms));
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.core.lock().running
    }

    /// `true` once the timer fired; cleared by the next `start`.
    pub fn is_expired(&self) -> bool {
        self.shared.core.lock().expired
    }

    /// Time since the last accepted feed, `None` before the first start.
    pub fn time_since_feed(&self) -> Option<Duration> {
        self.shared.core.lock().last_fed.map(|t| t.elapsed())
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn stats(&self) -> WatchdogStats {
        let core = self.shared.core.lock();
        WatchdogStats {
            running: core.running,
            expired: core.expired,
            timeout_ms: self.config.timeout_ms,
            feed_count: core.feed_count,
            expiry_count: core.expiry_count,
            time_since_feed_ms: core.last_fed.map(|t| t.elapsed().as_secs_f64() * 1000.0),
        }
    }
}

impl Drop for ServoWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Monitor thread
// ────────────────────────────────────────────────────────────────────────────

fn monitor(
    shared: &WatchdogShared,
    estop: &EmergencyStop,
    generation: u64,
    timeout: Duration,
    poll: Duration,
) {
    let mut core = shared.core.lock();
    loop {
        if !core.running || core.generation != generation {
            break;
        }
        // Latched by someone else: nothing left to guard, and the expiry
        // counters stay reserved for stops this timer caused.
        if estop.state().is_stopped() {
            core.running = false;
            info!(generation, "emergency stop already latched, servo watchdog disarmed");
            break;
        }
        let silent_for = core.last_fed.map_or(Duration::ZERO, |t| t.elapsed());
        if silent_for > timeout {
            core.expired = true;
            core.running = false;
            core.expiry_count += 1;
            error!(
                silent_ms = silent_for.as_millis() as u64,
                timeout_ms = timeout.as_millis() as u64,
                "servo watchdog expired"
            );
            estop.trigger(WATCHDOG_SOURCE);
            break;
        }
        shared.wake.wait_for(&mut core, poll);
    }
    debug!(generation, "servo watchdog monitor exiting");
}

fn join_bounded(handle: JoinHandle<()>, limit: Duration) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    let deadline = Instant::now() + limit;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(limit_ms = limit.as_millis() as u64, "servo watchdog thread did not exit, detaching");
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    if handle.join().is_err() {
        error!("servo watchdog thread panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmergencyStopConfig;
    use strider_hal::SimServoDriver;
    use strider_types::SafetyState;

    fn fast_config() -> WatchdogConfig {
        WatchdogConfig {
            timeout_ms: 50,
            poll_interval_ms: 10,
            join_timeout_ms: 500,
        }
    }

    fn running_estop() -> EmergencyStop {
        let estop = EmergencyStop::new(
            Arc::new(SimServoDriver::new(2)),
            EmergencyStopConfig::default(),
            None,
        );
        estop.start().unwrap();
        estop
    }

    #[test]
    fn fresh_watchdog_is_idle() {
        let wd = ServoWatchdog::new(fast_config(), running_estop());
        assert!(!wd.is_running());
        assert!(!wd.is_expired());
        assert_eq!(wd.time_since_feed(), None);
        assert!(!wd.feed());
    }

    #[test]
    fn start_primes_the_feed() {
        let wd = ServoWatchdog::new(fast_config(), running_estop());
        wd.start().unwrap();
        assert!(wd.is_running());
        assert!(wd.time_since_feed().unwrap() < Duration::from_millis(50));
        wd.stop();
    }

    #[test]
    fn regular_feeding_keeps_robot_running() {
        let estop = running_estop();
        let wd = ServoWatchdog::new(fast_config(), estop.clone());
        wd.start().unwrap();
        for _ in 0..10 {
            thread::sleep(Duration::from_millis(15));
            assert!(wd.feed());
        }
        assert!(!wd.is_expired());
        assert_eq!(estop.state(), SafetyState::Running);
        assert_eq!(wd.stats().feed_count, 10);
        wd.stop();
    }

    #[test]
    fn silence_triggers_emergency_stop() {
        let estop = running_estop();
        let wd = ServoWatchdog::new(fast_config(), estop.clone());
        wd.start().unwrap();
        thread::sleep(Duration::from_millis(200));

        assert!(wd.is_expired());
        assert!(!wd.is_running());
        assert_eq!(estop.state(), SafetyState::ResetRequired);
        assert_eq!(estop.last_source().as_deref(), Some(WATCHDOG_SOURCE));
        assert_eq!(wd.stats().expiry_count, 1);
        // A late feed is rejected.
        assert!(!wd.feed());
    }

    #[test]
    fn stopped_watchdog_never_fires() {
        let estop = running_estop();
        let wd = ServoWatchdog::new(fast_config(), estop.clone());
        wd.start().unwrap();
        wd.stop();
        wd.stop();
        thread::sleep(Duration::from_millis(120));
        assert!(!wd.is_expired());
        assert_eq!(estop.state(), SafetyState::Running);
    }

    #[test]
    fn restart_after_expiry() {
        let estop = running_estop();
        let wd = ServoWatchdog::new(fast_config(), estop.clone());
        wd.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(wd.is_expired());

        estop.reset().unwrap();
        estop.start().unwrap();
        wd.start().unwrap();
        assert!(wd.is_running());
        assert!(!wd.is_expired());
        assert!(wd.feed());
        wd.stop();
        assert_eq!(estop.state(), SafetyState::Running);
        assert_eq!(wd.stats().expiry_count, 1);
    }

    #[test]
    fn second_start_is_noop() {
        let wd = ServoWatchdog::new(fast_config(), running_estop());
        wd.start().unwrap();
        wd.start().unwrap();
        assert!(wd.is_running());
        wd.stop();
        assert!(!wd.is_running());
    }

    #[test]
    fn external_latch_disarms_without_expiry() {
        let estop = running_estop();
        let wd = ServoWatchdog::new(fast_config(), estop.clone());
        wd.start().unwrap();
        estop.trigger("operator");

        thread::sleep(Duration::from_millis(150));
        assert!(!wd.is_running());
        assert!(!wd.is_expired());
        assert_eq!(wd.stats().expiry_count, 0);
        assert_eq!(estop.last_source().as_deref(), Some("operator"));
        assert_eq!(estop.history().len(), 1);
    }

    #[test]
    fn drop_stops_the_monitor() {
        let estop = running_estop();
        {
            let wd = ServoWatchdog::new(fast_config(), estop.clone());
            wd.start().unwrap();
        }
        thread::sleep(Duration::from_millis(120));
        assert_eq!(estop.state(), SafetyState::Running);
    }

    #[test]
    fn stats_serialise() {
        let wd = ServoWatchdog::new(fast_config(), running_estop());
        wd.start().unwrap();
        wd.feed();
        let json = serde_json::to_value(wd.stats()).unwrap();
        assert_eq!(json["running"], true);
        assert_eq!(json["timeout_ms"], 50);
        assert_eq!(json["feed_count"], 1);
        wd.stop();
    }
}
