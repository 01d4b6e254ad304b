//! Ramped DC drive command for the carriage motor.
//!
//! The [`ActuatorDriver`] turns a signed speed request (percent of full
//! drive, sign = direction) into duty/direction/enable commands on a
//! pluggable [`DriveOutputs`] backend. Speed changes ramp linearly at
//! `max_speed_percent / ramp_time_s` per second unless the caller asks
//! for an immediate jump. The ramp is advanced by [`ActuatorDriver::tick`]
//! from the control loop, which is the sole writer of drive outputs.
//!
//! [`ActuatorDriver::emergency_stop`] bypasses the ramp, drops the
//! enable (engaging the brake) and latches: every speed request is
//! ignored until [`ActuatorDriver::reset`].

use blitz_common::config::MachineConfig;
use tracing::warn;

/// One drive output frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveCommand {
    /// PWM duty, percent of full drive, always non-negative.
    pub duty_percent: f64,
    /// Travel direction; true = toward increasing position.
    pub forward: bool,
    /// Power stage enable. Low engages the motor brake.
    pub enable: bool,
}

impl DriveCommand {
    pub const IDLE: DriveCommand = DriveCommand {
        duty_percent: 0.0,
        forward: true,
        enable: false,
    };
}

/// Drive output backend: PWM bridge in production, [`crate::sim::SimDrive`]
/// on the bench. `dt_s` is the elapsed control period, zero for
/// out-of-loop safety writes.
pub trait DriveOutputs: Send {
    fn apply(&mut self, command: DriveCommand, dt_s: f64);
}

/// Ramped speed command state over a [`DriveOutputs`] backend.
#[derive(Debug)]
pub struct ActuatorDriver<D: DriveOutputs> {
    backend: D,
    max_speed_percent: f64,
    /// Ramp slope, percent per second.
    ramp_per_s: f64,
    target_percent: f64,
    current_percent: f64,
    enabled: bool,
    estop_latched: bool,
}

impl<D: DriveOutputs> ActuatorDriver<D> {
    pub fn new(backend: D, config: &MachineConfig) -> Self {
        Self {
            backend,
            max_speed_percent: config.max_speed_percent,
            ramp_per_s: config.max_speed_percent / config.ramp_time_s,
            target_percent: 0.0,
            current_percent: 0.0,
            enabled: false,
            estop_latched: false,
        }
    }

    /// Request a signed speed. Clamped to the configured maximum.
    /// With `ramp` the output slews toward the target on subsequent
    /// ticks; without it the output jumps on the next tick.
    ///
    /// Ignored while the emergency latch is set.
    pub fn set_speed(&mut self, percent: f64, ramp: bool) {
        if self.estop_latched {
            return;
        }
        let clamped = percent.clamp(-self.max_speed_percent, self.max_speed_percent);
        self.target_percent = clamped;
        self.enabled = true;
        if !ramp {
            self.current_percent = clamped;
        }
    }

    /// Advance the ramp and push the resulting command to the backend.
    /// Called exactly once per control tick.
    pub fn tick(&mut self, dt_s: f64) {
        if !self.estop_latched && self.current_percent != self.target_percent {
            let step = self.ramp_per_s * dt_s;
            let delta = self.target_percent - self.current_percent;
            if delta.abs() <= step {
                self.current_percent = self.target_percent;
            } else {
                self.current_percent += step * delta.signum();
            }
        }
        self.push(dt_s);
    }

    /// Zero the output and drop the enable, engaging the brake.
    pub fn disable(&mut self) {
        self.target_percent = 0.0;
        self.current_percent = 0.0;
        self.enabled = false;
        self.push(0.0);
    }

    /// Immediate stop: zero output, enable low, latch against further
    /// speed requests. Idempotent.
    pub fn emergency_stop(&mut self) {
        if self.estop_latched {
            return;
        }
        warn!("actuator emergency stop");
        self.estop_latched = true;
        self.target_percent = 0.0;
        self.current_percent = 0.0;
        self.enabled = false;
        self.push(0.0);
    }

    /// Clear the emergency latch. The caller decides when that is safe.
    pub fn reset(&mut self) {
        self.estop_latched = false;
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn emergency_latched(&self) -> bool {
        self.estop_latched
    }

    /// Signed speed currently on the output.
    #[inline]
    pub fn current_speed(&self) -> f64 {
        self.current_percent
    }

    #[inline]
    pub fn target_speed(&self) -> f64 {
        self.target_percent
    }

    fn push(&mut self, dt_s: f64) {
        self.backend.apply(
            DriveCommand {
                duty_percent: self.current_percent.abs(),
                forward: self.current_percent >= 0.0,
                enable: self.enabled && !self.estop_latched,
            },
            dt_s,
        );
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
