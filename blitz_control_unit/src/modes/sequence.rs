//! Step tables for the special cutting modes.
//!
//! A [`CutPlan`] is a pure description: target positions, which blade
//! may descend at each step, and how the clamps hold the piece. The
//! clamp masks follow one scheme across all modes: both heads hold for
//! the heading cut, the left (fixed) clamp alone holds while the
//! carriage repositions, the right (mobile) clamp alone holds for the
//! final cut so the finished piece stays with the mobile head.
//!
//! Builders validate the geometry up front; a plan that builds is a
//! plan whose every target lies inside `[0, max_travel]`.

use blitz_common::config::MachineConfig;
use blitz_common::error::SequenceError;
use blitz_common::io::{LineState, Side};

use crate::modes::detector::{CuttingMode, detect};

/// Role of one step in a cutting sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Trim the bar head to establish a clean reference edge.
    Heading,
    /// Positioning-only move; both blades stay inhibited.
    Retract,
    /// The cut that produces the finished piece.
    Final,
}

/// Clamp hold plan for one step. Energized = locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClampPlan {
    pub left: LineState,
    pub right: LineState,
}

impl ClampPlan {
    pub const fn both_locked() -> Self {
        Self { left: LineState::Energized, right: LineState::Energized }
    }

    /// Fixed head holds the bar while the carriage repositions.
    pub const fn left_holding() -> Self {
        Self { left: LineState::Energized, right: LineState::DeEnergized }
    }

    /// Mobile head holds the finished piece for the final cut.
    pub const fn right_holding() -> Self {
        Self { left: LineState::DeEnergized, right: LineState::Energized }
    }
}

/// One step of a cutting sequence.
#[derive(Debug, Clone)]
pub struct SequenceStep {
    pub kind: StepKind,
    pub label: &'static str,
    /// Carriage target position.
    pub target_mm: f64,
    /// Head allowed to cut once in position; `None` keeps both blades
    /// inhibited (positioning step).
    pub cutting_blade: Option<Side>,
    pub clamps: ClampPlan,
}

/// Complete sequence for one special-mode cut.
#[derive(Debug, Clone)]
pub struct CutPlan {
    pub mode: CuttingMode,
    pub length_mm: f64,
    pub angle_left_deg: u8,
    pub angle_right_deg: u8,
    pub steps: Vec<SequenceStep>,
}

impl CutPlan {
    /// Planned tilt of one head, whole degrees.
    pub fn angle_for(&self, side: Side) -> u8 {
        match side {
            Side::Left => self.angle_left_deg,
            Side::Right => self.angle_right_deg,
        }
    }
}

/// Build the step table for a special-mode cut.
///
/// `Normal` lengths have no sequence; they are a single direct move.
pub fn build_plan(
    length_mm: f64,
    angle_left_deg: u8,
    angle_right_deg: u8,
    config: &MachineConfig,
) -> Result<CutPlan, SequenceError> {
    let mode = detect(length_mm, config)?;
    let steps = match mode {
        CuttingMode::Normal => {
            return Err(SequenceError::InvalidLength {
                length_mm,
                reason: "normal-band length needs no sequence".to_string(),
            });
        }
        CuttingMode::OutOfQuota => out_of_quota_steps(length_mm, config),
        CuttingMode::UltraShort => ultra_short_steps(length_mm, config)?,
        CuttingMode::ExtraLong => extra_long_steps(length_mm, config)?,
    };
    Ok(CutPlan {
        mode,
        length_mm,
        angle_left_deg,
        angle_right_deg,
        steps,
    })
}

/// Out-of-quota: heading at the homing reference with the mobile head,
/// then the final cut with the fixed head, offset by the battuta.
fn out_of_quota_steps(length_mm: f64, config: &MachineConfig) -> Vec<SequenceStep> {
    vec![
        SequenceStep {
            kind: StepKind::Heading,
            label: "heading at reference",
            target_mm: config.zero_homing_mm,
            cutting_blade: Some(Side::Right),
            clamps: ClampPlan::both_locked(),
        },
        SequenceStep {
            kind: StepKind::Final,
            label: "final cut at battuta offset",
            target_mm: length_mm + config.offset_battuta_mm,
            cutting_blade: Some(Side::Left),
            clamps: ClampPlan::right_holding(),
        },
    ]
}

/// Ultra-short: heading with the fixed head above the reference, pull
/// the piece back by `length + battuta`, final cut with the mobile head
/// below the reference.
fn ultra_short_steps(
    length_mm: f64,
    config: &MachineConfig,
) -> Result<Vec<SequenceStep>, SequenceError> {
    let heading_mm = config.zero_homing_mm + config.safety_margin_mm;
    let retract_mm = length_mm + config.offset_battuta_mm;
    let final_mm = heading_mm - retract_mm;
    if final_mm < 0.0 {
        return Err(SequenceError::InvalidLength {
            length_mm,
            reason: format!("final position {final_mm:.1}mm is below carriage zero"),
        });
    }
    Ok(vec![
        SequenceStep {
            kind: StepKind::Heading,
            label: "heading above reference",
            target_mm: heading_mm,
            cutting_blade: Some(Side::Left),
            clamps: ClampPlan::both_locked(),
        },
        SequenceStep {
            kind: StepKind::Retract,
            label: "retract piece",
            target_mm: final_mm,
            cutting_blade: None,
            clamps: ClampPlan::left_holding(),
        },
        SequenceStep {
            kind: StepKind::Final,
            label: "final cut below reference",
            target_mm: final_mm,
            cutting_blade: Some(Side::Right),
            clamps: ClampPlan::right_holding(),
        },
    ])
}

/// Extra-long: heading at the safe head position with the mobile head,
/// retract the bar by the over-travel excess, final cut with the fixed
/// head at full travel.
fn extra_long_steps(
    length_mm: f64,
    config: &MachineConfig,
) -> Result<Vec<SequenceStep>, SequenceError> {
    let offset_mm = length_mm - config.max_travel_mm;
    if offset_mm < config.min_retract_offset_mm {
        return Err(SequenceError::InvalidLength {
            length_mm,
            reason: format!(
                "retract offset {offset_mm:.1}mm is below the minimum {}mm",
                config.min_retract_offset_mm
            ),
        });
    }
    let post_retract_mm = config.safe_head_mm - offset_mm;
    if post_retract_mm < config.zero_homing_mm {
        return Err(SequenceError::InvalidLength {
            length_mm,
            reason: format!(
                "post-retract position {post_retract_mm:.1}mm is below the homing reference"
            ),
        });
    }
    Ok(vec![
        SequenceStep {
            kind: StepKind::Heading,
            label: "heading at safe head",
            target_mm: config.safe_head_mm,
            cutting_blade: Some(Side::Right),
            clamps: ClampPlan::both_locked(),
        },
        SequenceStep {
            kind: StepKind::Retract,
            label: "retract bar",
            target_mm: post_retract_mm,
            cutting_blade: None,
            clamps: ClampPlan::left_holding(),
        },
        SequenceStep {
            kind: StepKind::Final,
            label: "final cut at full travel",
            target_mm: config.max_travel_mm,
            cutting_blade: Some(Side::Left),
            clamps: ClampPlan::right_holding(),
        },
    ])
}

// ─── Tests ──────────────────────────────────────────────────────────
