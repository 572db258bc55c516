//! `strider-runtime` – robot lifecycle and control loop
//!
//! # Modules
//!
//! - [`robot`] – [`Robot`][robot::Robot]: the `Init → Ready ⇄ EStopped`
//!   lifecycle, the paced control loop and every actuator command, all gated
//!   through the safety core in `strider-kernel`.
//! - [`config`] – [`StriderConfig`][config::StriderConfig]: TOML file at
//!   `~/.strider/config.toml` with `STRIDER_*` environment overrides.
//! - [`telemetry`] – `tracing` subscriber set-up.

pub mod config;
pub mod robot;
pub mod telemetry;

pub use config::{RobotConfig, StriderConfig};
pub use robot::{Robot, RobotDiagnostics, TrackedMove};
