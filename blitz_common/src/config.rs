//! TOML machine configuration with load-time validation.
//!
//! One immutable [`MachineConfig`] is loaded at startup and shared by
//! reference for the life of the process. Validation enforces the
//! geometric invariants the mode bands depend on; a config that loads
//! is a config the sequencers can trust without re-checking.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

// ─── Machine Config ─────────────────────────────────────────────────

/// Static machine geometry, drive limits and control-loop tuning.
///
/// All distances in millimetres, measured along the mobile-head axis
/// from machine zero.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    /// Homing reference position of the mobile head.
    pub zero_homing_mm: f64,
    /// Blade-to-reference offset (battuta) of the mobile head.
    pub offset_battuta_mm: f64,
    /// Maximum mobile-head travel.
    pub max_travel_mm: f64,
    /// Raw stock bar length fed to the machine.
    pub stock_length_mm: f64,
    /// Encoder scale.
    pub pulses_per_mm: f64,

    /// PID proportional gain.
    pub pid_kp: f64,
    /// PID integral gain.
    pub pid_ki: f64,
    /// PID derivative gain.
    pub pid_kd: f64,
    /// Speed command saturation, percent of full drive.
    pub max_speed_percent: f64,
    /// Control loop rate.
    pub control_loop_hz: f64,

    /// Ultra-short heading safety margin above `zero_homing_mm`.
    #[serde(default = "default_safety_margin_mm")]
    pub safety_margin_mm: f64,
    /// Extra-long heading position (head parked clear of the bar).
    #[serde(default = "default_safe_head_mm")]
    pub safe_head_mm: f64,
    /// Minimum extra-long retract offset.
    #[serde(default = "default_min_retract_offset_mm")]
    pub min_retract_offset_mm: f64,

    /// Drive ramp time from zero to full speed.
    #[serde(default = "default_ramp_time_s")]
    pub ramp_time_s: f64,
    /// Consecutive in-tolerance ticks required to declare a move done.
    #[serde(default = "default_settle_ticks")]
    pub settle_ticks: u32,
    /// Per-move convergence timeout.
    #[serde(default = "default_move_timeout_s")]
    pub move_timeout_s: f64,
    /// Homing cycle timeout.
    #[serde(default = "default_homing_timeout_s")]
    pub homing_timeout_s: f64,
    /// Reverse travel after the homing sensor trips.
    #[serde(default = "default_homing_backoff_mm")]
    pub homing_backoff_mm: f64,
    /// Expected sensor trip distance ahead of the reference point.
    #[serde(default = "default_sensor_lead_mm")]
    pub sensor_lead_mm: f64,
}

fn default_safety_margin_mm() -> f64 {
    50.0
}
fn default_safe_head_mm() -> f64 {
    2000.0
}
fn default_min_retract_offset_mm() -> f64 {
    500.0
}
fn default_ramp_time_s() -> f64 {
    1.5
}
fn default_settle_ticks() -> u32 {
    5
}
fn default_move_timeout_s() -> f64 {
    30.0
}
fn default_homing_timeout_s() -> f64 {
    60.0
}
fn default_homing_backoff_mm() -> f64 {
    10.0
}
fn default_sensor_lead_mm() -> f64 {
    5.0
}

impl MachineConfig {
    /// Lengths strictly below this value cannot be cut against the
    /// fixed reference and fall into the special short-piece modes.
    #[inline]
    pub fn ultra_short_threshold(&self) -> f64 {
        self.zero_homing_mm - self.offset_battuta_mm
    }

    /// Control-loop tick period in seconds.
    #[inline]
    pub fn tick_period_s(&self) -> f64 {
        1.0 / self.control_loop_hz
    }

    /// Validate parameter bounds and geometric invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("zero_homing_mm", self.zero_homing_mm),
            ("offset_battuta_mm", self.offset_battuta_mm),
            ("max_travel_mm", self.max_travel_mm),
            ("stock_length_mm", self.stock_length_mm),
            ("pulses_per_mm", self.pulses_per_mm),
            ("pid_kp", self.pid_kp),
            ("max_speed_percent", self.max_speed_percent),
            ("control_loop_hz", self.control_loop_hz),
            ("safety_margin_mm", self.safety_margin_mm),
            ("safe_head_mm", self.safe_head_mm),
            ("min_retract_offset_mm", self.min_retract_offset_mm),
            ("ramp_time_s", self.ramp_time_s),
            ("move_timeout_s", self.move_timeout_s),
            ("homing_timeout_s", self.homing_timeout_s),
            ("homing_backoff_mm", self.homing_backoff_mm),
            ("sensor_lead_mm", self.sensor_lead_mm),
        ];
        for (name, value) in positive {
            if value <= 0.0 || !value.is_finite() {
                return Err(ConfigError::Validation(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        for (name, value) in [("pid_ki", self.pid_ki), ("pid_kd", self.pid_kd)] {
            if value < 0.0 || !value.is_finite() {
                return Err(ConfigError::Validation(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        if self.settle_ticks == 0 {
            return Err(ConfigError::Validation(
                "settle_ticks must be at least 1".to_string(),
            ));
        }

        if self.offset_battuta_mm >= self.zero_homing_mm {
            return Err(ConfigError::Validation(format!(
                "offset_battuta_mm ({}) must be less than zero_homing_mm ({})",
                self.offset_battuta_mm, self.zero_homing_mm
            )));
        }
        if self.zero_homing_mm >= self.max_travel_mm {
            return Err(ConfigError::Validation(format!(
                "zero_homing_mm ({}) must be less than max_travel_mm ({})",
                self.zero_homing_mm, self.max_travel_mm
            )));
        }
        if self.max_speed_percent > 100.0 {
            return Err(ConfigError::Validation(format!(
                "max_speed_percent ({}) must not exceed 100",
                self.max_speed_percent
            )));
        }
        if self.safe_head_mm > self.max_travel_mm {
            return Err(ConfigError::Validation(format!(
                "safe_head_mm ({}) must not exceed max_travel_mm ({})",
                self.safe_head_mm, self.max_travel_mm
            )));
        }

        if self.stock_length_mm <= self.max_travel_mm {
            // Legal but leaves the over-travel band empty; flag it so an
            // unexpected config swap is visible in the startup log.
            warn!(
                stock_length_mm = self.stock_length_mm,
                max_travel_mm = self.max_travel_mm,
                "stock length within travel: extra-long band is empty"
            );
        }

        Ok(())
    }
}

// ─── Loading Functions ──────────────────────────────────────────────

/// Load and validate the machine configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<MachineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("failed to read {}: {e}", path.display())))?;
    from_toml_str(&raw)
}

/// Load config from a TOML string (for testing).
pub fn from_toml_str(raw: &str) -> Result<MachineConfig, ConfigError> {
    let config: MachineConfig =
        toml::from_str(raw).map_err(|e| ConfigError::Parse(format!("machine config: {e}")))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn reference_toml() -> &'static str {
        r#"
zero_homing_mm = 250.0
offset_battuta_mm = 120.0
max_travel_mm = 4000.0
stock_length_mm = 6500.0
pulses_per_mm = 84.88
pid_kp = 2.0
pid_ki = 0.1
pid_kd = 0.05
max_speed_percent = 80.0
control_loop_hz = 50.0
"#
    }

    #[test]
    fn load_valid_config() {
        let config = from_toml_str(reference_toml()).unwrap();
        assert_eq!(config.zero_homing_mm, 250.0);
        assert_eq!(config.ultra_short_threshold(), 130.0);
        assert_eq!(config.tick_period_s(), 0.02);
        // defaulted supplements
        assert_eq!(config.safety_margin_mm, 50.0);
        assert_eq!(config.safe_head_mm, 2000.0);
        assert_eq!(config.min_retract_offset_mm, 500.0);
        assert_eq!(config.homing_backoff_mm, 10.0);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(reference_toml().as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.max_travel_mm, 4000.0);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/machine.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn reject_malformed_toml() {
        let err = from_toml_str("this is not valid toml @@@@").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn reject_missing_required_field() {
        let toml = reference_toml().replace("pulses_per_mm = 84.88\n", "");
        let err = from_toml_str(&toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("pulses_per_mm"), "got: {msg}");
    }

    #[test]
    fn reject_negative_parameter() {
        let toml = reference_toml().replace("pid_kp = 2.0", "pid_kp = -2.0");
        let err = from_toml_str(&toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("pid_kp"), "got: {msg}");
    }

    #[test]
    fn reject_offset_at_or_above_zero_homing() {
        let toml = reference_toml().replace("offset_battuta_mm = 120.0", "offset_battuta_mm = 250.0");
        let err = from_toml_str(&toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("offset_battuta_mm"), "got: {msg}");
    }

    #[test]
    fn reject_zero_homing_beyond_travel() {
        let toml = reference_toml().replace("zero_homing_mm = 250.0", "zero_homing_mm = 5000.0");
        let err = from_toml_str(&toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("zero_homing_mm"), "got: {msg}");
    }

    #[test]
    fn reject_speed_over_100_percent() {
        let toml = reference_toml().replace("max_speed_percent = 80.0", "max_speed_percent = 120.0");
        let err = from_toml_str(&toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("max_speed_percent"), "got: {msg}");
    }

    #[test]
    fn reject_safe_head_beyond_travel() {
        let toml = format!("{}safe_head_mm = 4500.0\n", reference_toml());
        let err = from_toml_str(&toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("safe_head_mm"), "got: {msg}");
    }

    #[test]
    fn reject_zero_settle_ticks() {
        let toml = format!("{}settle_ticks = 0\n", reference_toml());
        let err = from_toml_str(&toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("settle_ticks"), "got: {msg}");
    }

    #[test]
    fn empty_extra_long_band_is_accepted() {
        // stock shorter than travel loads fine; only a warning is logged.
        let toml = reference_toml().replace("stock_length_mm = 6500.0", "stock_length_mm = 3000.0");
        let config = from_toml_str(&toml).unwrap();
        assert_eq!(config.stock_length_mm, 3000.0);
    }

    #[test]
    fn zero_pid_ki_kd_allowed() {
        let toml = reference_toml()
            .replace("pid_ki = 0.1", "pid_ki = 0.0")
            .replace("pid_kd = 0.05", "pid_kd = 0.0");
        assert!(from_toml_str(&toml).is_ok());
    }
}
