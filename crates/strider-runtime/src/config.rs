//! Configuration vault – reads/writes `~/.strider/config.toml`.
//!
//! Every field has a default, so a missing file, a missing section or a
//! missing key all fall back to the built-in values.  After loading,
//! `STRIDER_*` environment variables override individual fields and the
//! result is validated once.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strider_kernel::SafetyConfig;
use strider_types::SafetyError;
use tracing::debug;

/// Control-loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Name used in logs.
    pub name: String,
    /// Target cadence of [`Robot::step`](crate::robot::Robot::step).
    pub control_rate_hz: f64,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            name: "strider".to_string(),
            control_rate_hz: 50.0,
        }
    }
}

/// Persisted configuration stored in `~/.strider/config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StriderConfig {
    pub robot: RobotConfig,
    pub safety: SafetyConfig,
}

impl StriderConfig {
    /// # Errors
    ///
    /// [`SafetyError::Configuration`] for an invalid rate, a control period
    /// that does not fit inside the watchdog timeout, or any invalid safety
    /// section.
    pub fn validate(&self) -> Result<(), SafetyError> {
        let rate = self.robot.control_rate_hz;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(SafetyError::Configuration(format!(
                "robot.control_rate_hz must be a positive number, got {rate}"
            )));
        }
        let period_ms = 1000.0 / rate;
        if period_ms >= self.safety.watchdog.timeout_ms as f64 {
            return Err(SafetyError::Configuration(format!(
                "control period {period_ms:.1} ms does not fit in the {} ms watchdog timeout",
                self.safety.watchdog.timeout_ms
            )));
        }
        self.safety.validate()
    }
}

/// Return the path to `~/.strider/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".strider").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
///
/// # Errors
///
/// [`SafetyError::Configuration`] when the file cannot be read or parsed,
/// or when the result is invalid.
pub fn load() -> Result<Option<StriderConfig>, SafetyError> {
    load_from(&config_path())
}

/// Load from `~/.strider/config.toml`, or start from the defaults when the
/// file is missing.  Environment overrides apply either way.
///
/// # Errors
///
/// As [`load`].
pub fn load_or_default() -> Result<StriderConfig, SafetyError> {
    match load()? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = StriderConfig::default();
            apply_env_overrides(&mut cfg);
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

/// Load the config from a specific path.
///
/// # Errors
///
/// As [`load`].
pub fn load_from(path: &Path) -> Result<Option<StriderConfig>, SafetyError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        SafetyError::Configuration(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg: StriderConfig = toml::from_str(&raw)
        .map_err(|e| SafetyError::Configuration(format!("failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(Some(cfg))
}

/// Apply `STRIDER_*` environment variable overrides to `cfg`.
///
/// Unparseable values are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `STRIDER_CONTROL_RATE_HZ` | `robot.control_rate_hz` |
/// | `STRIDER_NUM_CHANNELS` | `safety.num_channels` |
/// | `STRIDER_WATCHDOG_TIMEOUT_MS` | `safety.watchdog.timeout_ms` |
/// | `STRIDER_STALL_TIMEOUT_MS` | `safety.limiter.stall_timeout_ms` |
/// | `STRIDER_SOFT_LIMIT_FACTOR` | `safety.limiter.soft_limit_factor` |
/// | `STRIDER_AUTO_RESET` | `safety.estop.auto_reset` |
pub fn apply_env_overrides(cfg: &mut StriderConfig) {
    if let Some(v) = env_parse("STRIDER_CONTROL_RATE_HZ") {
        cfg.robot.control_rate_hz = v;
    }
    if let Some(v) = env_parse("STRIDER_NUM_CHANNELS") {
        cfg.safety.num_channels = v;
    }
    if let Some(v) = env_parse("STRIDER_WATCHDOG_TIMEOUT_MS") {
        cfg.safety.watchdog.timeout_ms = v;
    }
    if let Some(v) = env_parse("STRIDER_STALL_TIMEOUT_MS") {
        cfg.safety.limiter.stall_timeout_ms = v;
    }
    if let Some(v) = env_parse("STRIDER_SOFT_LIMIT_FACTOR") {
        cfg.safety.limiter.soft_limit_factor = v;
    }
    if let Some(v) = env_parse("STRIDER_AUTO_RESET") {
        cfg.safety.estop.auto_reset = v;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Save the config to disk, creating `~/.strider/` if necessary.
///
/// # Errors
///
/// [`SafetyError::Configuration`] on any I/O or serialisation failure.
pub fn save(cfg: &StriderConfig) -> Result<(), SafetyError> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
///
/// # Errors
///
/// As [`save`].
pub fn save_to(cfg: &StriderConfig, path: &Path) -> Result<(), SafetyError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            SafetyError::Configuration(format!("failed to create config directory: {e}"))
        })?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| SafetyError::Configuration(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| {
        SafetyError::Configuration(format!("failed to write config at {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::{Mutex, MutexGuard};

    /// `load_from` reads the `STRIDER_*` variables, so every test that sets
    /// them or loads a file holds this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock()
    }

    #[test]
    fn default_config_is_valid() {
        assert!(StriderConfig::default().validate().is_ok());
    }

    #[test]
    fn config_path_points_to_strider_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".strider"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn roundtrip_default_config() {
        let _env = env_lock();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = StriderConfig::default();
        cfg.robot.name = "hexapod".to_string();
        cfg.safety.limiter.position_tolerance_deg = 1.5;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.robot.name, "hexapod");
        assert_eq!(loaded.safety.limiter.position_tolerance_deg, 1.5);
        assert_eq!(loaded.safety.limiter.profile.stall_ma, 650.0);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let _env = env_lock();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let _env = env_lock();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[robot]\nname = \"quad\"\n\n[safety.limiter.profile]\nthermal_time_constant_s = 8.0\n",
        )
        .expect("write");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.robot.name, "quad");
        assert_eq!(loaded.safety.limiter.profile.thermal_time_constant_s, 8.0);
        assert_eq!(loaded.safety.limiter.profile.idle_ma, 10.0);
        assert_eq!(loaded.safety.estop.history_capacity, 100);
    }

    #[test]
    fn malformed_file_is_a_configuration_error() {
        let _env = env_lock();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[robot\nname = ").expect("write");
        assert!(matches!(load_from(&path), Err(SafetyError::Configuration(_))));
    }

    #[test]
    fn invalid_values_are_rejected_on_load() {
        let _env = env_lock();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[safety.limiter]\nposition_tolerance_deg = -1.0\n").expect("write");
        assert!(matches!(load_from(&path), Err(SafetyError::Configuration(_))));
    }

    #[test]
    fn control_period_must_fit_watchdog() {
        let mut cfg = StriderConfig::default();
        cfg.robot.control_rate_hz = 1.0;
        assert!(cfg.validate().is_err());
        cfg.robot.control_rate_hz = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn apply_env_overrides_changes_watchdog_timeout() {
        let _env = env_lock();
        // SAFETY: every test touching the process environment holds ENV_LOCK.
        unsafe { std::env::set_var("STRIDER_WATCHDOG_TIMEOUT_MS", "750") };
        let mut cfg = StriderConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.safety.watchdog.timeout_ms, 750);
        unsafe { std::env::remove_var("STRIDER_WATCHDOG_TIMEOUT_MS") };
    }

    #[test]
    fn apply_env_overrides_changes_auto_reset() {
        let _env = env_lock();
        // SAFETY: every test touching the process environment holds ENV_LOCK.
        unsafe { std::env::set_var("STRIDER_AUTO_RESET", "true") };
        let mut cfg = StriderConfig::default();
        apply_env_overrides(&mut cfg);
        assert!(cfg.safety.estop.auto_reset);
        unsafe { std::env::remove_var("STRIDER_AUTO_RESET") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_number() {
        let _env = env_lock();
        // SAFETY: every test touching the process environment holds ENV_LOCK.
        unsafe { std::env::set_var("STRIDER_NUM_CHANNELS", "lots") };
        let mut cfg = StriderConfig::default();
        let original = cfg.safety.num_channels;
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.safety.num_channels, original);
        unsafe { std::env::remove_var("STRIDER_NUM_CHANNELS") };
    }
}
