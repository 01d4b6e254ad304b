//! Cutting-mode detection and the step sequencer for the special
//! (out-of-quota, ultra-short, extra-long) cuts.

pub mod detector;
pub mod sequence;
pub mod sequencer;

pub use detector::{CuttingMode, advisory, detect};
pub use sequence::{ClampPlan, CutPlan, SequenceStep, StepKind, build_plan};
pub use sequencer::CutSequencer;
