//! `strider-hal` – hardware seams of the safety core.
//!
//! The safety core never talks to registers directly.  It consumes the
//! traits defined here, and drivers are injected at construction time.
//!
//! # Modules
//!
//! - [`actuator`] – [`ServoDriver`]: bulk disable, per-channel angle
//!   command, position query.
//! - [`input`] – [`DigitalInput`]: edge-triggered GPIO with a synchronous
//!   level read, used for the physical stop button.
//! - [`sensor`] – [`Sensor`]: non-actuator inputs polled by the control loop.
//! - [`clock`] – [`Clock`]: monotonic time, plus [`ManualClock`] for tests.
//! - [`bus`] – [`BusHandle`]: explicitly shared transport, and the
//!   [`PwmServoDriver`] built on it.
//! - [`sim`] – simulated driver, button and sensor for headless testing.

pub mod actuator;
pub mod bus;
pub mod clock;
pub mod input;
pub mod sensor;
pub mod sim;

pub use actuator::{
    DEFAULT_NUM_CHANNELS, MAX_ANGLE_DEG, MIN_ANGLE_DEG, ServoDriver, SharedServoDriver,
    angle_in_range,
};
pub use bus::{BusHandle, PwmBus, PwmServoDriver};
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use input::{DigitalInput, EdgeCallback};
pub use sensor::Sensor;
pub use sim::{SimButton, SimSensor, SimServoDriver};
