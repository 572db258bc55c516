//! `DigitalInput` – edge-triggered GPIO used for the physical stop button.
//!
//! The button is wired active-low with a pull-up: a press pulls the line to
//! ground.  Drivers deliver debounced falling edges to a registered closure
//! from their own interrupt/poll thread; consumers re-check the level with
//! [`DigitalInput::read_level`] to reject noise.

use std::time::Duration;

use strider_types::SafetyError;

/// Closure invoked from the input driver's thread on every falling edge.
pub type EdgeCallback = Box<dyn Fn() + Send + Sync>;

/// A single digital input line.
pub trait DigitalInput: Send + Sync {
    /// Stable identifier, e.g. `"gpio17"`.
    fn id(&self) -> &str;

    /// Register `callback` for falling edges, suppressing repeats within
    /// `debounce`.  Replaces any previously registered callback.
    ///
    /// # Errors
    ///
    /// [`SafetyError::Hardware`] when the line cannot be configured.
    fn on_falling_edge(&self, debounce: Duration, callback: EdgeCallback)
    -> Result<(), SafetyError>;

    /// Synchronously sample the line; `true` is electrically high.
    ///
    /// # Errors
    ///
    /// [`SafetyError::Hardware`] when the line cannot be read.
    fn read_level(&self) -> Result<bool, SafetyError>;

    /// Drop the registered callback and release the line.
    fn release(&self);
}
