//! The saw control unit facade.
//!
//! One object per machine: owns the cut sequencer, shares the motion
//! handle and interlock bridge, and exposes the operations a console or
//! line supervisor drives: home, cut request, step execution, abort,
//! reset, status.
//!
//! A cut request is classified by length band first. Normal-band
//! lengths position the carriage directly; the special bands arm a
//! multi-step sequence and return its step table for the operator to
//! confirm step by step.

use std::sync::{Arc, Mutex};

use blitz_common::config::MachineConfig;
use blitz_common::error::{MotionError, SequenceError};
use blitz_common::safety::SafetySource;
use tracing::info;

use crate::bus::{InterlockBridge, SerialTransport};
use crate::modes::detector::{CuttingMode, detect};
use crate::modes::sequence::SequenceStep;
use crate::modes::sequencer::CutSequencer;
use crate::motion::{ControllerState, MotionHandle};

/// How a cut request will be executed.
#[derive(Debug)]
pub enum CutDisposition {
    /// Normal band: the carriage was positioned, both heads may cut.
    Direct { target_mm: f64 },
    /// Special band: a sequence was armed; execute its steps in order.
    Sequenced {
        mode: CuttingMode,
        steps: Vec<SequenceStep>,
    },
}

/// Aggregate status for the console.
#[derive(Debug, Clone)]
pub struct UnitStatus {
    pub state: ControllerState,
    pub position_mm: f64,
    pub homed: bool,
    pub mode: Option<CuttingMode>,
    /// Next pending step (1-based) of the armed sequence, `None` when
    /// no sequence is active or every step has confirmed complete.
    pub current_step: Option<usize>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub fault: Option<String>,
}

pub struct SawControlUnit<T: SerialTransport> {
    config: Arc<MachineConfig>,
    motion: MotionHandle,
    bridge: Arc<InterlockBridge<T>>,
    safety: Arc<dyn SafetySource>,
    sequencer: Mutex<CutSequencer<T>>,
}

impl<T: SerialTransport> SawControlUnit<T> {
    pub fn new(
        config: Arc<MachineConfig>,
        motion: MotionHandle,
        bridge: Arc<InterlockBridge<T>>,
        safety: Arc<dyn SafetySource>,
    ) -> Self {
        let sequencer = Mutex::new(CutSequencer::new(
            Arc::clone(&bridge),
            motion.clone(),
            Arc::clone(&safety),
            Arc::clone(&config),
        ));
        Self {
            config,
            motion,
            bridge,
            safety,
            sequencer,
        }
    }

    /// Home the carriage. Blocks until the cycle completes.
    pub fn home(&self) -> Result<(), MotionError> {
        self.motion.home()
    }

    /// Request a cut of `length_mm`. `mode_hint`, when given, must
    /// agree with the detected band; a console whose operator selected
    /// a mode the geometry contradicts gets a rejection, not a cut.
    pub fn request_cut(
        &self,
        length_mm: f64,
        angle_left_deg: u8,
        angle_right_deg: u8,
        mode_hint: Option<CuttingMode>,
    ) -> Result<CutDisposition, SequenceError> {
        let ctx = self.safety.sample();
        if ctx.emergency_active {
            return Err(SequenceError::EmergencyActive);
        }
        if ctx.cut_in_progress {
            return Err(SequenceError::CutInProgress);
        }

        let mode = detect(length_mm, &self.config)?;
        if let Some(hint) = mode_hint
            && hint != mode
        {
            return Err(SequenceError::InvalidLength {
                length_mm,
                reason: format!("requested {hint} mode but the length is in the {mode} band"),
            });
        }

        match mode {
            CuttingMode::Normal => {
                info!(length_mm, "normal cut, positioning directly");
                self.motion.move_to(length_mm)?;
                Ok(CutDisposition::Direct { target_mm: length_mm })
            }
            _ => {
                let mut seq = self.lock_sequencer();
                let plan = seq.start(length_mm, angle_left_deg, angle_right_deg)?;
                Ok(CutDisposition::Sequenced {
                    mode: plan.mode,
                    steps: plan.steps.clone(),
                })
            }
        }
    }

    /// Execute step `step` of the armed sequence (1-based).
    pub fn execute_step(&self, step: usize) -> Result<(), SequenceError> {
        self.lock_sequencer().execute_step(step)
    }

    /// Abort the armed sequence and restore the restrictive interlocks.
    pub fn abort(&self) -> Result<(), SequenceError> {
        self.lock_sequencer().abort()
    }

    /// Clear a latched motion fault once the emergency chain is reset.
    pub fn reset(&self) -> Result<(), MotionError> {
        self.motion.reset()
    }

    /// Shared interlock bridge, for console input polling and the
    /// angle transducers.
    pub fn bridge(&self) -> &InterlockBridge<T> {
        &self.bridge
    }

    pub fn status(&self) -> UnitStatus {
        let motion = self.motion.status();
        let seq = self.lock_sequencer();
        let (mode, completed, total) = match seq.plan() {
            Some(plan) => (Some(plan.mode), seq.completed_steps(), plan.steps.len()),
            None => (None, 0, 0),
        };
        UnitStatus {
            state: motion.state,
            position_mm: motion.position_mm,
            homed: motion.homed,
            mode,
            current_step: seq.current_step(),
            completed_steps: completed,
            total_steps: total,
            fault: motion.fault.map(|f| f.to_string()),
        }
    }

    fn lock_sequencer(&self) -> std::sync::MutexGuard<'_, CutSequencer<T>> {
        self.sequencer.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use blitz_common::config::from_toml_str;
    use blitz_common::io::{RegisterMap, Side};
    use blitz_common::safety::AtomicSafetySource;

    use crate::encoder::QuadratureEncoder;
    use crate::motion::ControlLoop;
    use crate::sim::{SimAxis, SimBus, SimDrive, SimHomeSensor};

    fn unit() -> (SawControlUnit<SimBus>, Arc<AtomicSafetySource>, MotionHandle) {
        let config: Arc<MachineConfig> = Arc::new(
            from_toml_str(
                r#"
zero_homing_mm = 250.0
offset_battuta_mm = 120.0
max_travel_mm = 4000.0
stock_length_mm = 6500.0
pulses_per_mm = 40.0
pid_kp = 8.0
pid_ki = 0.0
pid_kd = 0.0
max_speed_percent = 80.0
control_loop_hz = 500.0
ramp_time_s = 0.1
settle_ticks = 3
move_timeout_s = 10.0
homing_timeout_s = 10.0
"#,
            )
            .unwrap(),
        );
        let axis = Arc::new(SimAxis::new(400.0, 245.0, 258.0, 400.0));
        let encoder = Arc::new(QuadratureEncoder::new(config.pulses_per_mm));
        let drive = SimDrive::new(Arc::clone(&axis), Arc::clone(&encoder), config.pulses_per_mm);
        let sensor = SimHomeSensor::new(Arc::clone(&axis));
        let safety = Arc::new(AtomicSafetySource::new());
        let emergency: Arc<AtomicBool> = safety.emergency_flag();
        let (control, handle) = ControlLoop::new(&config, encoder, drive, sensor, emergency);
        control.spawn().unwrap();

        let bank = SimBus::new();
        // Both tilt sensors at the 45 degrees the tests cut with.
        let map = RegisterMap::default();
        for side in [Side::Left, Side::Right] {
            bank.set_holding(map.angle_node(side), map.angle_base + 1, 45);
        }
        let bridge = Arc::new(InterlockBridge::new(bank, map));
        let unit = SawControlUnit::new(
            config,
            handle.clone(),
            bridge,
            Arc::clone(&safety) as Arc<dyn SafetySource>,
        );
        (unit, safety, handle)
    }

    #[test]
    fn normal_cut_positions_directly() {
        let (unit, _safety, handle) = unit();
        unit.home().unwrap();
        let disposition = unit.request_cut(1000.0, 45, 45, None).unwrap();
        assert!(matches!(
            disposition,
            CutDisposition::Direct { target_mm } if target_mm == 1000.0
        ));
        assert!((handle.status().position_mm - 1000.0).abs() < 1.0);
        let status = unit.status();
        assert_eq!(status.mode, None);
        assert!(status.homed);
        handle.shutdown();
    }

    #[test]
    fn special_cut_arms_a_sequence() {
        let (unit, _safety, handle) = unit();
        unit.home().unwrap();
        let disposition = unit.request_cut(180.0, 45, 45, None).unwrap();
        let CutDisposition::Sequenced { mode, steps } = disposition else {
            panic!("expected a sequenced cut");
        };
        assert_eq!(mode, CuttingMode::OutOfQuota);
        assert_eq!(steps.len(), 2);
        assert_eq!(unit.status().current_step, Some(1));

        unit.execute_step(1).unwrap();
        assert_eq!(unit.status().current_step, Some(2));
        unit.execute_step(2).unwrap();
        let status = unit.status();
        assert_eq!(status.mode, Some(CuttingMode::OutOfQuota));
        assert_eq!(status.current_step, None);
        assert_eq!(status.completed_steps, 2);
        assert_eq!(status.total_steps, 2);
        handle.shutdown();
    }

    #[test]
    fn mode_hint_must_match_the_band() {
        let (unit, _safety, handle) = unit();
        unit.home().unwrap();
        let err = unit.request_cut(180.0, 45, 45, Some(CuttingMode::UltraShort));
        assert!(matches!(err, Err(SequenceError::InvalidLength { .. })));
        handle.shutdown();
    }

    #[test]
    fn emergency_rejects_cut_requests() {
        let (unit, safety, handle) = unit();
        unit.home().unwrap();
        safety.set_emergency(true);
        assert!(matches!(
            unit.request_cut(1000.0, 45, 45, None),
            Err(SequenceError::EmergencyActive)
        ));
        handle.shutdown();
    }

    #[test]
    fn cut_in_progress_rejects_cut_requests() {
        let (unit, safety, handle) = unit();
        unit.home().unwrap();
        safety.set_cut_in_progress(true);
        assert!(matches!(
            unit.request_cut(1000.0, 45, 45, None),
            Err(SequenceError::CutInProgress)
        ));
        handle.shutdown();
    }
}
