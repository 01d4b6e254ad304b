//! Step executor for the special cutting modes.
//!
//! One sequencer executes every mode; the differences live entirely in
//! the step tables from [`crate::modes::sequence`]. Steps are strictly
//! serial and synchronous: `execute_step(n)` returns only when step `n`
//! is physically confirmed, and step `n+1` is refused until then. An
//! already-completed step is acknowledged without re-actuating anything.
//!
//! Every interlock write is confirmed by a hardware read-back before
//! the carriage moves; an unconfirmable line aborts the step with the
//! communication fault and no motion is issued. A cut step releases
//! its blade only after the cutting head's tilt read-back matches the
//! planned angle; a mis-tilted head or a faulted sensor leaves both
//! blades inhibited. The sequence stays resumable from the last
//! confirmed step after any fault.

use std::sync::Arc;

use blitz_common::config::MachineConfig;
use blitz_common::error::SequenceError;
use blitz_common::io::{LineId, LineState, Side};
use blitz_common::safety::SafetySource;
use tracing::{debug, info, warn};

use crate::bus::{InterlockBridge, SerialTransport};
use crate::modes::sequence::{CutPlan, build_plan};
use crate::motion::MotionHandle;

/// Allowed deviation between the sensor's rounded degrees and the
/// planned cut angle.
const TILT_TOLERANCE_DEG: u8 = 1;

struct ActiveCut {
    plan: CutPlan,
    /// Steps confirmed complete, counted from the front of the table.
    completed: usize,
}

/// Safety-interlocked executor of special-mode cutting sequences.
pub struct CutSequencer<T: SerialTransport> {
    bridge: Arc<InterlockBridge<T>>,
    motion: MotionHandle,
    safety: Arc<dyn SafetySource>,
    config: Arc<MachineConfig>,
    active: Option<ActiveCut>,
}

impl<T: SerialTransport> CutSequencer<T> {
    pub fn new(
        bridge: Arc<InterlockBridge<T>>,
        motion: MotionHandle,
        safety: Arc<dyn SafetySource>,
        config: Arc<MachineConfig>,
    ) -> Self {
        Self {
            bridge,
            motion,
            safety,
            config,
            active: None,
        }
    }

    /// Build and arm the sequence for a special-mode cut. Nothing is
    /// actuated until the first `execute_step`.
    pub fn start(
        &mut self,
        length_mm: f64,
        angle_left_deg: u8,
        angle_right_deg: u8,
    ) -> Result<&CutPlan, SequenceError> {
        let ctx = self.safety.sample();
        if ctx.emergency_active {
            return Err(SequenceError::EmergencyActive);
        }
        if ctx.cut_in_progress {
            return Err(SequenceError::CutInProgress);
        }
        if let Some(active) = &self.active
            && active.completed < active.plan.steps.len()
        {
            // An unfinished sequence must be aborted explicitly first.
            return Err(SequenceError::CutInProgress);
        }

        let plan = build_plan(length_mm, angle_left_deg, angle_right_deg, &self.config)?;
        info!(
            mode = %plan.mode,
            length_mm,
            steps = plan.steps.len(),
            "cutting sequence armed"
        );
        let active = self.active.insert(ActiveCut { plan, completed: 0 });
        Ok(&active.plan)
    }

    /// Execute step `step` (1-based). Idempotent for completed steps.
    pub fn execute_step(&mut self, step: usize) -> Result<(), SequenceError> {
        let (current_step, total) = match &self.active {
            Some(active) => (active.completed, active.plan.steps.len()),
            None => return Err(SequenceError::NoActiveSequence),
        };
        if step == 0 || step > total {
            return Err(SequenceError::UnknownStep { step });
        }
        if step <= current_step {
            debug!(step, "step already complete");
            return Ok(());
        }
        if step != current_step + 1 {
            return Err(SequenceError::PriorStepIncomplete { step });
        }
        if self.safety.sample().emergency_active {
            return Err(SequenceError::EmergencyActive);
        }

        let (plan_step, cutting) = match &self.active {
            Some(active) => {
                let plan_step = active.plan.steps[step - 1].clone();
                let cutting = plan_step
                    .cutting_blade
                    .map(|side| (side, active.plan.angle_for(side)));
                (plan_step, cutting)
            }
            None => return Err(SequenceError::NoActiveSequence),
        };
        info!(step, label = plan_step.label, target_mm = plan_step.target_mm, "executing step");

        // Interlocks first, all confirmed against hardware. Blades stay
        // inhibited and the cut lamp dark for the whole positioning.
        self.write_confirmed(LineId::CutEnable, LineState::DeEnergized)?;
        self.write_confirmed(LineId::BladeInhibit(Side::Left), LineState::Energized)?;
        self.write_confirmed(LineId::BladeInhibit(Side::Right), LineState::Energized)?;
        self.write_confirmed(LineId::ClampLock(Side::Left), plan_step.clamps.left)?;
        self.write_confirmed(LineId::ClampLock(Side::Right), plan_step.clamps.right)?;
        self.write_confirmed(LineId::BrakeLock, LineState::Energized)?;
        self.write_confirmed(LineId::ClutchEngage, LineState::Energized)?;

        // Position the carriage; blocks until converged or faulted.
        self.motion
            .move_to_extended(plan_step.target_mm)
            .map_err(SequenceError::Motion)?;

        // In position: engage the brake, confirm the cutting head's
        // tilt, then release exactly the blade this step cuts with.
        self.write_confirmed(LineId::BrakeLock, LineState::DeEnergized)?;
        if let Some((side, angle_deg)) = cutting {
            self.verify_tilt(side, angle_deg)?;
            self.write_confirmed(LineId::BladeInhibit(side), LineState::DeEnergized)?;
            self.write_confirmed(LineId::CutEnable, LineState::Energized)?;
        }

        if let Some(active) = self.active.as_mut() {
            active.completed = step;
        }
        info!(step, "step confirmed complete");
        Ok(())
    }

    /// Abort the sequence: stop motion and drive both blade inhibits to
    /// the restrictive state. Always clears the active sequence, even
    /// when a line cannot be confirmed; the first confirmation failure
    /// is reported after all lines were attempted.
    pub fn abort(&mut self) -> Result<(), SequenceError> {
        warn!("cutting sequence aborted");
        let _ = self.motion.stop();

        let mut first_error = None;
        for (line, state) in [
            (LineId::CutEnable, LineState::DeEnergized),
            (LineId::BladeInhibit(Side::Left), LineState::Energized),
            (LineId::BladeInhibit(Side::Right), LineState::Energized),
        ] {
            if let Err(e) = self.write_confirmed(line, state)
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        self.active = None;
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Next pending step (1-based), if a sequence is active and
    /// incomplete.
    pub fn current_step(&self) -> Option<usize> {
        self.active.as_ref().and_then(|a| {
            if a.completed < a.plan.steps.len() {
                Some(a.completed + 1)
            } else {
                None
            }
        })
    }

    /// Steps confirmed complete in the active sequence.
    pub fn completed_steps(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.completed)
    }

    pub fn is_complete(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.completed == a.plan.steps.len())
    }

    pub fn plan(&self) -> Option<&CutPlan> {
        self.active.as_ref().map(|a| &a.plan)
    }

    /// Read one head's tilt sensor and compare it against the planned
    /// cut angle. An unreadable or faulted sensor blocks the blade
    /// release exactly like an unconfirmed interlock line.
    fn verify_tilt(&self, side: Side, expected_deg: u8) -> Result<(), SequenceError> {
        let reading = self
            .bridge
            .read_angle(side)
            .map_err(|source| SequenceError::AngleUnconfirmed { side, source })?;
        if !reading.is_healthy() {
            return Err(SequenceError::AngleSensorFault { side, status: reading.status });
        }
        if reading.degrees.abs_diff(expected_deg) > TILT_TOLERANCE_DEG {
            return Err(SequenceError::AngleMismatch {
                side,
                expected_deg,
                actual_deg: reading.degrees,
            });
        }
        debug!(head = side.label(), degrees = reading.degrees, "tilt confirmed");
        Ok(())
    }

    /// Write one line and confirm it by hardware read-back.
    fn write_confirmed(&self, line: LineId, state: LineState) -> Result<(), SequenceError> {
        self.bridge
            .set_line(line, state)
            .map_err(|source| SequenceError::UnconfirmedInterlock { line, source })?;
        let observed = self
            .bridge
            .get_line(line)
            .map_err(|source| SequenceError::UnconfirmedInterlock { line, source })?;
        if observed != state {
            return Err(SequenceError::InterlockMismatch { line });
        }
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use blitz_common::config::from_toml_str;
    use blitz_common::io::RegisterMap;
    use blitz_common::safety::AtomicSafetySource;

    use crate::encoder::QuadratureEncoder;
    use crate::motion::ControlLoop;
    use crate::sim::{SimAxis, SimBus, SimDrive, SimHomeSensor};

    struct Rig {
        sequencer: CutSequencer<SimBus>,
        bank: SimBus,
        axis: Arc<SimAxis>,
        safety: Arc<AtomicSafetySource>,
        handle: crate::motion::MotionHandle,
    }

    fn config() -> MachineConfig {
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
        .unwrap()
    }

    fn rig() -> Rig {
        let config = Arc::new(config());
        let axis = Arc::new(SimAxis::new(400.0, 245.0, 258.0, 400.0));
        let encoder = Arc::new(QuadratureEncoder::new(config.pulses_per_mm));
        let drive = SimDrive::new(Arc::clone(&axis), Arc::clone(&encoder), config.pulses_per_mm);
        let sensor = SimHomeSensor::new(Arc::clone(&axis));
        let safety = Arc::new(AtomicSafetySource::new());
        let emergency: Arc<AtomicBool> = safety.emergency_flag();
        let (control, handle) = ControlLoop::new(&config, encoder, drive, sensor, emergency);
        control.spawn().unwrap();

        let bank = SimBus::new();
        // Both heads start at the 45 degrees the test plans cut with.
        set_tilt(&bank, Side::Left, 45);
        set_tilt(&bank, Side::Right, 45);
        let bridge = Arc::new(InterlockBridge::new(bank.clone(), RegisterMap::default()));
        let sequencer = CutSequencer::new(
            bridge,
            handle.clone(),
            Arc::clone(&safety) as Arc<dyn SafetySource>,
            config,
        );
        Rig { sequencer, bank, axis, safety, handle }
    }

    /// Point one head's tilt sensor at a healthy whole-degree reading.
    fn set_tilt(bank: &SimBus, side: Side, degrees: u16) {
        let map = RegisterMap::default();
        let node = map.angle_node(side);
        bank.set_holding(node, map.angle_base, degrees * 91);
        bank.set_holding(node, map.angle_base + 1, degrees);
    }

    // ── step ordering ──

    #[test]
    fn step_order_is_enforced() {
        let mut r = rig();
        assert!(matches!(
            r.sequencer.execute_step(1),
            Err(SequenceError::NoActiveSequence)
        ));

        let plan = r.sequencer.start(180.0, 45, 45).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(r.sequencer.current_step(), Some(1));

        assert!(matches!(
            r.sequencer.execute_step(0),
            Err(SequenceError::UnknownStep { step: 0 })
        ));
        assert!(matches!(
            r.sequencer.execute_step(3),
            Err(SequenceError::UnknownStep { step: 3 })
        ));
        assert!(matches!(
            r.sequencer.execute_step(2),
            Err(SequenceError::PriorStepIncomplete { step: 2 })
        ));
        r.handle.shutdown();
    }

    #[test]
    fn restart_refused_while_incomplete() {
        let mut r = rig();
        r.sequencer.start(180.0, 45, 45).unwrap();
        assert!(matches!(
            r.sequencer.start(100.0, 45, 45),
            Err(SequenceError::CutInProgress)
        ));
        r.sequencer.abort().unwrap();
        r.sequencer.start(100.0, 45, 45).unwrap();
        r.handle.shutdown();
    }

    // ── full execution over the simulated plant ──

    #[test]
    fn out_of_quota_sequence_runs_to_completion() {
        let mut r = rig();
        r.handle.home().unwrap();
        r.sequencer.start(180.0, 45, 45).unwrap();

        r.sequencer.execute_step(1).unwrap();
        assert!((r.handle.status().position_mm - 250.0).abs() < 1.0);
        // Heading: both clamps locked, brake re-engaged, clutch in,
        // right blade released with the cut lamp on, left still held.
        assert!(r.bank.coil(1, 2) && r.bank.coil(1, 3));
        assert!(!r.bank.coil(1, 0));
        assert!(r.bank.coil(1, 1));
        assert!(r.bank.coil(1, 4));
        assert!(r.bank.coil(2, 0));
        assert!(!r.bank.coil(2, 1));

        r.sequencer.execute_step(2).unwrap();
        assert!((r.handle.status().position_mm - 300.0).abs() < 1.0);
        // Final: mobile clamp alone holds, fixed blade cuts.
        assert!(!r.bank.coil(1, 2) && r.bank.coil(1, 3));
        assert!(!r.bank.coil(2, 0) && r.bank.coil(2, 1));
        assert!(r.sequencer.is_complete());
        assert_eq!(r.sequencer.current_step(), None);

        // Re-acknowledging a done step moves nothing.
        r.sequencer.execute_step(1).unwrap();
        assert!((r.handle.status().position_mm - 300.0).abs() < 1.0);
        r.handle.shutdown();
    }

    #[test]
    fn emergency_blocks_the_next_step() {
        let mut r = rig();
        r.handle.home().unwrap();
        r.sequencer.start(180.0, 45, 45).unwrap();
        r.safety.set_emergency(true);
        assert!(matches!(
            r.sequencer.execute_step(1),
            Err(SequenceError::EmergencyActive)
        ));
        assert_eq!(r.sequencer.completed_steps(), 0);
        r.handle.shutdown();
    }

    #[test]
    fn unconfirmed_interlock_leaves_step_pending() {
        let mut r = rig();
        r.handle.home().unwrap();
        let start_mm = r.axis.position_mm();
        r.sequencer.start(180.0, 45, 45).unwrap();

        // Enough scripted timeouts to exhaust the retry budget on the
        // first interlock write. No motion may follow.
        r.bank.script_timeouts(3);
        let err = r.sequencer.execute_step(1);
        assert!(matches!(
            err,
            Err(SequenceError::UnconfirmedInterlock { .. })
        ));
        assert_eq!(r.sequencer.completed_steps(), 0);
        assert!((r.axis.position_mm() - start_mm).abs() < 1.0);

        // Bus back: the same step runs clean.
        r.sequencer.execute_step(1).unwrap();
        assert_eq!(r.sequencer.completed_steps(), 1);
        r.handle.shutdown();
    }

    // ── tilt verification ──

    #[test]
    fn mis_tilted_head_blocks_the_blade_release() {
        let mut r = rig();
        r.handle.home().unwrap();
        r.sequencer.start(180.0, 45, 45).unwrap();

        // Mobile head still at 30 degrees: the step positions but the
        // blade is never released and the cut lamp stays dark.
        set_tilt(&r.bank, Side::Right, 30);
        let err = r.sequencer.execute_step(1);
        assert!(matches!(
            err,
            Err(SequenceError::AngleMismatch {
                side: Side::Right,
                expected_deg: 45,
                actual_deg: 30,
            })
        ));
        assert!(r.bank.coil(2, 0) && r.bank.coil(2, 1));
        assert!(!r.bank.coil(1, 4));
        assert_eq!(r.sequencer.completed_steps(), 0);

        // Head brought to the planned tilt: the same step completes.
        set_tilt(&r.bank, Side::Right, 45);
        r.sequencer.execute_step(1).unwrap();
        assert_eq!(r.sequencer.completed_steps(), 1);
        assert!(!r.bank.coil(2, 1));
        r.handle.shutdown();
    }

    #[test]
    fn faulted_tilt_sensor_blocks_the_cut() {
        let mut r = rig();
        r.handle.home().unwrap();
        r.sequencer.start(180.0, 45, 45).unwrap();

        // Degrees agree but the status byte carries the fault bit.
        let map = RegisterMap::default();
        r.bank.set_holding(map.angle_node(Side::Right), map.angle_base + 1, 0x012D);
        let err = r.sequencer.execute_step(1);
        assert!(matches!(
            err,
            Err(SequenceError::AngleSensorFault { side: Side::Right, .. })
        ));
        assert!(r.bank.coil(2, 1), "blade stays inhibited");
        assert_eq!(r.sequencer.completed_steps(), 0);
        r.handle.shutdown();
    }

    #[test]
    fn abort_restores_the_restrictive_lines() {
        let mut r = rig();
        r.handle.home().unwrap();
        r.sequencer.start(180.0, 45, 45).unwrap();
        r.sequencer.execute_step(1).unwrap();
        assert!(!r.bank.coil(2, 1));

        r.sequencer.abort().unwrap();
        assert!(!r.bank.coil(1, 4));
        assert!(r.bank.coil(2, 0) && r.bank.coil(2, 1));
        assert!(matches!(
            r.sequencer.execute_step(2),
            Err(SequenceError::NoActiveSequence)
        ));
        r.handle.shutdown();
    }
}
