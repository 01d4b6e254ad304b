//! Workspace error taxonomy.
//!
//! One enum per concern: configuration (fatal at load), bus
//! communication (bounded retries inside the bridge, surfaced unmodified
//! once exhausted), motion (latched until explicit reset), sequence
//! (step preconditions and unconfirmed interlocks).
//!
//! No error here is ever downgraded into an automatic retry of a
//! cut-affecting action; continuation after a fault requires an explicit
//! reset from the operator layer.

use thiserror::Error;

use crate::io::{LineId, SensorStatus, Side};

/// Configuration loading/validation error. Fatal at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("config I/O error: {0}")]
    Io(String),
    /// TOML parse error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Parameter validation error.
    #[error("config validation: {0}")]
    Validation(String),
}

/// Serial bus communication fault.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    /// No (or incomplete) response within the per-call timeout.
    #[error("bus timeout on node {node}")]
    Timeout { node: u8 },
    /// Response CRC did not match.
    #[error("CRC mismatch on node {node}: expected {expected:#06x}, got {got:#06x}")]
    Crc { node: u8, expected: u16, got: u16 },
    /// Malformed or unexpected response frame.
    #[error("bus frame error on node {node}: {reason}")]
    Frame { node: u8, reason: &'static str },
    /// Retry budget exhausted; the last underlying fault is preserved.
    #[error("bus retries exhausted on node {node} after {attempts} attempts")]
    RetryExhausted { node: u8, attempts: u8 },
}

impl BusError {
    /// Bus node the fault occurred on.
    pub fn node(&self) -> u8 {
        match self {
            Self::Timeout { node }
            | Self::Crc { node, .. }
            | Self::Frame { node, .. }
            | Self::RetryExhausted { node, .. } => *node,
        }
    }
}

/// Axis motion fault. Latches the controller in `Fault` (or
/// `EmergencyStopped`) until an explicit `reset()`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MotionError {
    /// Requested target outside the allowed travel band.
    #[error("target {target_mm:.2}mm outside soft limits [{min_mm:.1}, {max_mm:.1}]")]
    SoftLimit {
        target_mm: f64,
        min_mm: f64,
        max_mm: f64,
    },
    /// Move did not converge within the configured timeout.
    #[error("move to {target_mm:.2}mm timed out after {elapsed_s:.1}s")]
    MoveTimeout { target_mm: f64, elapsed_s: f64 },
    /// Homing did not complete within the configured timeout.
    #[error("homing timed out")]
    HomingTimeout,
    /// Speed commanded but no encoder pulse progress.
    #[error("encoder stall at {position_mm:.2}mm")]
    EncoderStall { position_mm: f64 },
    /// Actuator dropped its enable while a move was in flight.
    #[error("actuator unexpectedly disabled during motion")]
    ActuatorDisabled,
    /// Command rejected: axis has no position reference yet.
    #[error("axis not homed")]
    NotHomed,
    /// Command rejected or move aborted by the emergency signal.
    #[error("emergency stop active")]
    EmergencyActive,
    /// Move cancelled by an explicit stop command.
    #[error("move interrupted by stop")]
    Interrupted,
    /// Command rejected: controller is latched in a fault state.
    #[error("controller faulted: {0}")]
    FaultLatched(String),
    /// Command rejected: another motion command is in flight.
    #[error("controller busy")]
    Busy,
    /// Control loop is not running (shut down or never started).
    #[error("control loop unavailable")]
    LoopUnavailable,
}

/// Cutting-sequence fault: step preconditions, interlock confirmation,
/// or wrapped bus/motion faults.
#[derive(Debug, Error)]
pub enum SequenceError {
    /// Requested length does not belong to a runnable mode band.
    #[error("invalid length {length_mm:.2}mm: {reason}")]
    InvalidLength { length_mm: f64, reason: String },
    /// Emergency signal sampled active at a step boundary.
    #[error("emergency stop active")]
    EmergencyActive,
    /// A cut is already in progress on the console side.
    #[error("cut in progress")]
    CutInProgress,
    /// Step N requested but step N-1 has not confirmed complete.
    #[error("step {step} requested before prior step completed")]
    PriorStepIncomplete { step: usize },
    /// Step index outside the computed sequence.
    #[error("unknown step {step}")]
    UnknownStep { step: usize },
    /// No sequence has been started (or it was aborted).
    #[error("no active sequence")]
    NoActiveSequence,
    /// An interlock write could not be confirmed against hardware.
    /// The step is aborted; no motion was issued.
    #[error("unconfirmed interlock {line:?}")]
    UnconfirmedInterlock {
        line: LineId,
        #[source]
        source: BusError,
    },
    /// Read-back disagreed with the commanded line state.
    #[error("interlock {line:?} read-back disagrees with commanded state")]
    InterlockMismatch { line: LineId },
    /// The cutting head's tilt sensor could not be read before its
    /// blade release. The step is aborted with the blade inhibited.
    #[error("head {} tilt sensor unreadable", side.label())]
    AngleUnconfirmed {
        side: Side,
        #[source]
        source: BusError,
    },
    /// The tilt sensor answered but reported a fault status.
    #[error("head {} tilt sensor fault: {status:?}", side.label())]
    AngleSensorFault { side: Side, status: SensorStatus },
    /// Head tilt read-back disagrees with the planned cut angle.
    #[error("head {} tilted {actual_deg}\u{b0} but the cut plans {expected_deg}\u{b0}", side.label())]
    AngleMismatch {
        side: Side,
        expected_deg: u8,
        actual_deg: u8,
    },
    /// Underlying bus fault outside an interlock write.
    #[error(transparent)]
    Bus(#[from] BusError),
    /// Underlying motion fault during a step move.
    #[error(transparent)]
    Motion(#[from] MotionError),
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{LineId, Side};

    #[test]
    fn bus_error_node_accessor() {
        assert_eq!(BusError::Timeout { node: 2 }.node(), 2);
        assert_eq!(
            BusError::RetryExhausted { node: 1, attempts: 3 }.node(),
            1
        );
    }

    #[test]
    fn display_messages() {
        let e = MotionError::SoftLimit {
            target_mm: 4500.0,
            min_mm: 250.0,
            max_mm: 4000.0,
        };
        assert!(e.to_string().contains("4500.00"));

        let e = SequenceError::UnconfirmedInterlock {
            line: LineId::ClampLock(Side::Left),
            source: BusError::RetryExhausted { node: 1, attempts: 3 },
        };
        assert!(e.to_string().contains("ClampLock"));

        let e = SequenceError::AngleMismatch {
            side: Side::Right,
            expected_deg: 45,
            actual_deg: 30,
        };
        assert!(e.to_string().contains("DX"));
        assert!(e.to_string().contains("45"));
    }

    #[test]
    fn sequence_error_wraps_bus_error() {
        let e: SequenceError = BusError::Timeout { node: 1 }.into();
        assert!(matches!(e, SequenceError::Bus(_)));
    }
}
