//! Position-loop PID with clamped-integral anti-windup.
//!
//! Output and integral accumulator are both saturated at the configured
//! speed limit, so a long approach cannot wind the integrator past what
//! the drive can deliver. Zero Ki disables integral; zero Kd disables
//! derivative.

/// Internal state of the PID controller.
///
/// Must be reset on every new move and on controller reset; a stale
/// integral from the previous target otherwise kicks the axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct PidState {
    /// Integral term accumulator (already scaled by Ki).
    integral: f64,
    /// Previous position error, for the derivative.
    prev_error: f64,
    /// First sample after reset has no derivative history.
    primed: bool,
}

impl PidState {
    /// Reset all internal state to zero.
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// PID gains plus output saturation.
#[derive(Debug, Clone, Copy)]
pub struct PidGains {
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain (0 = disabled).
    pub ki: f64,
    /// Derivative gain (0 = disabled).
    pub kd: f64,
    /// Output saturation limit, percent of full drive.
    pub out_max: f64,
}

/// Compute one PID cycle.
///
/// `error` is target − actual in mm, `dt` the cycle period in seconds.
/// Returns the saturated speed command in signed percent.
#[inline]
pub fn pid_compute(state: &mut PidState, gains: &PidGains, error: f64, dt: f64) -> f64 {
    if dt <= 0.0 {
        return 0.0;
    }

    let p_term = gains.kp * error;

    if gains.ki != 0.0 {
        state.integral += gains.ki * error * dt;
        state.integral = state.integral.clamp(-gains.out_max, gains.out_max);
    } else {
        state.integral = 0.0;
    }

    let d_term = if gains.kd != 0.0 && state.primed {
        gains.kd * (error - state.prev_error) / dt
    } else {
        0.0
    };

    state.prev_error = error;
    state.primed = true;

    (p_term + state.integral + d_term).clamp(-gains.out_max, gains.out_max)
}

// ─── Tests ──────────────────────────────────────────────────────────
