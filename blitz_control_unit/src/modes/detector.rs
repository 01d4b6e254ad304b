//! Length-band classification of cut requests.
//!
//! The bands derive from the machine geometry alone:
//!
//! - `(0, threshold]` — ultra-short; the piece is shorter than the
//!   blade-to-reference offset allows, threshold =
//!   `zero_homing − offset_battuta`.
//! - `(threshold, zero_homing)` — out of quota; below the carriage
//!   homing reference but reachable with the battuta offset.
//! - `[zero_homing, max_travel]` — normal single-positioning cut.
//! - `(max_travel, stock_length]` — extra-long; needs a bar retract.
//!
//! Non-positive lengths and lengths beyond the stock bar are rejected
//! outright. Classification is pure; it never touches hardware.

use blitz_common::config::MachineConfig;
use blitz_common::error::SequenceError;

/// Cut execution mode by length band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuttingMode {
    Normal,
    OutOfQuota,
    UltraShort,
    ExtraLong,
}

impl std::fmt::Display for CuttingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CuttingMode::Normal => "normal",
            CuttingMode::OutOfQuota => "out-of-quota",
            CuttingMode::UltraShort => "ultra-short",
            CuttingMode::ExtraLong => "extra-long",
        };
        f.write_str(name)
    }
}

/// Classify a requested piece length.
pub fn detect(length_mm: f64, config: &MachineConfig) -> Result<CuttingMode, SequenceError> {
    if !length_mm.is_finite() || length_mm <= 0.0 {
        return Err(SequenceError::InvalidLength {
            length_mm,
            reason: "length must be positive".to_string(),
        });
    }
    if length_mm > config.stock_length_mm {
        return Err(SequenceError::InvalidLength {
            length_mm,
            reason: format!("exceeds stock length {}mm", config.stock_length_mm),
        });
    }

    let threshold = config.ultra_short_threshold();
    let mode = if length_mm <= threshold {
        CuttingMode::UltraShort
    } else if length_mm < config.zero_homing_mm {
        CuttingMode::OutOfQuota
    } else if length_mm <= config.max_travel_mm {
        CuttingMode::Normal
    } else {
        CuttingMode::ExtraLong
    };
    Ok(mode)
}

/// Operator guidance shown when a special mode is selected.
pub fn advisory(mode: CuttingMode) -> &'static str {
    match mode {
        CuttingMode::Normal => "standard cut: single positioning, both heads cut",
        CuttingMode::OutOfQuota => {
            "out-of-quota cut: heading cut at the homing reference, then \
             reposition by the battuta offset for the final cut"
        }
        CuttingMode::UltraShort => {
            "ultra-short cut: heading with the fixed head above the \
             reference, retract the piece, final cut with the mobile head"
        }
        CuttingMode::ExtraLong => {
            "extra-long cut: heading at the safe head position, retract \
             the bar through the clamps, final cut at full travel"
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
