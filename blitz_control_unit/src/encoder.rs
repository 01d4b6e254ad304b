//! ×4 quadrature decoder for the carriage position encoder.
//!
//! Edges arrive from the sampling context through [`QuadratureEncoder::on_edge`];
//! the pulse counter is an `AtomicI64` so the control loop reads position
//! without taking a lock. Invalid transitions (both channels flipping in
//! one sample) are discarded as electrical noise and tallied in a
//! diagnostic counter, never raised as a fault.
//!
//! The index (Z) pulse is latched on demand for homing:
//! [`QuadratureEncoder::reset_at_index`] arms the capture, the next
//! [`QuadratureEncoder::on_index`] zeroes the pulse counter and wakes any
//! [`QuadratureEncoder::wait_for_index`] caller. Only homing contexts may
//! block on the index; the control loop polls [`QuadratureEncoder::take_index`]
//! instead.

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

// Phase value (a<<1 | b) → position in the gray cycle 00 → 01 → 11 → 10.
const PHASE_INDEX: [u8; 4] = [0, 1, 3, 2];

#[derive(Debug, Default)]
struct IndexLatch {
    armed: bool,
    fired: bool,
}

/// Shared quadrature decoder state.
///
/// One feeder context calls `on_edge`/`on_index`; any thread may read
/// position. The phase register is not synchronized against concurrent
/// feeders because there is exactly one sampling context per encoder.
#[derive(Debug)]
pub struct QuadratureEncoder {
    pulses: AtomicI64,
    noise: AtomicU64,
    phase: AtomicU8,
    /// Position offset in mm, stored as f64 bits.
    offset_bits: AtomicU64,
    pulses_per_mm: f64,
    index: Mutex<IndexLatch>,
    index_cv: Condvar,
}

impl QuadratureEncoder {
    pub fn new(pulses_per_mm: f64) -> Self {
        Self {
            pulses: AtomicI64::new(0),
            noise: AtomicU64::new(0),
            phase: AtomicU8::new(0),
            offset_bits: AtomicU64::new(0.0_f64.to_bits()),
            pulses_per_mm,
            index: Mutex::new(IndexLatch::default()),
            index_cv: Condvar::new(),
        }
    }

    /// Feed one sampled (A, B) channel pair.
    ///
    /// Counts ±1 per valid gray-code transition, giving four counts per
    /// electrical cycle. A double transition cannot tell direction and
    /// is dropped; the phase register still resyncs to the new pair.
    pub fn on_edge(&self, a: bool, b: bool) {
        let next = ((a as u8) << 1) | b as u8;
        let prev = self.phase.swap(next, Ordering::Relaxed);
        let diff = (4 + PHASE_INDEX[next as usize] - PHASE_INDEX[prev as usize]) % 4;
        match diff {
            0 => {}
            1 => {
                self.pulses.fetch_add(1, Ordering::Relaxed);
            }
            3 => {
                self.pulses.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {
                self.noise.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Index (Z) pulse from the sampling context. Zeroes the pulse
    /// counter when a capture is armed, otherwise ignored.
    pub fn on_index(&self) {
        let mut latch = lock_clean(&self.index);
        if latch.armed {
            self.pulses.store(0, Ordering::Relaxed);
            latch.armed = false;
            latch.fired = true;
            self.index_cv.notify_all();
        }
    }

    /// Arm the index capture: the next Z pulse zeroes the counter.
    pub fn reset_at_index(&self) {
        let mut latch = lock_clean(&self.index);
        latch.armed = true;
        latch.fired = false;
    }

    /// Block until an armed index capture fires, up to `timeout`.
    /// Returns false on timeout. Never call from the control loop.
    pub fn wait_for_index(&self, timeout: Duration) -> bool {
        let latch = lock_clean(&self.index);
        let (mut latch, result) = self
            .index_cv
            .wait_timeout_while(latch, timeout, |l| !l.fired)
            .unwrap_or_else(|p| p.into_inner());
        if result.timed_out() && !latch.fired {
            return false;
        }
        latch.fired = false;
        true
    }

    /// Non-blocking index check; consumes the latched pulse.
    pub fn take_index(&self) -> bool {
        let mut latch = lock_clean(&self.index);
        let fired = latch.fired;
        latch.fired = false;
        fired
    }

    /// Current position in mm: counted pulses scaled by the encoder
    /// resolution, plus the rebase offset.
    pub fn read_position(&self) -> f64 {
        let pulses = self.pulses.load(Ordering::Relaxed) as f64;
        pulses / self.pulses_per_mm + self.offset_mm()
    }

    /// Rebase the current physical position to `position_mm` without
    /// touching the pulse counter.
    pub fn set_position(&self, position_mm: f64) {
        let pulses = self.pulses.load(Ordering::Relaxed) as f64;
        let offset = position_mm - pulses / self.pulses_per_mm;
        self.offset_bits.store(offset.to_bits(), Ordering::Relaxed);
    }

    /// Raw counted pulses, for stall diagnostics.
    #[inline]
    pub fn pulse_count(&self) -> i64 {
        self.pulses.load(Ordering::Relaxed)
    }

    /// Discarded invalid transitions since startup.
    #[inline]
    pub fn noise_count(&self) -> u64 {
        self.noise.load(Ordering::Relaxed)
    }

    fn offset_mm(&self) -> f64 {
        f64::from_bits(self.offset_bits.load(Ordering::Relaxed))
    }
}

fn lock_clean<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk one full electrical cycle forward from phase 00.
    fn cycle_forward(enc: &QuadratureEncoder) {
        enc.on_edge(false, true);
        enc.on_edge(true, true);
        enc.on_edge(true, false);
        enc.on_edge(false, false);
    }

    fn cycle_backward(enc: &QuadratureEncoder) {
        enc.on_edge(true, false);
        enc.on_edge(true, true);
        enc.on_edge(false, true);
        enc.on_edge(false, false);
    }

    #[test]
    fn full_cycle_counts_four() {
        let enc = QuadratureEncoder::new(84.88);
        cycle_forward(&enc);
        assert_eq!(enc.pulse_count(), 4);
        cycle_backward(&enc);
        assert_eq!(enc.pulse_count(), 0);
        assert_eq!(enc.noise_count(), 0);
    }

    #[test]
    fn position_scales_by_resolution() {
        let enc = QuadratureEncoder::new(4.0);
        for _ in 0..10 {
            cycle_forward(&enc);
        }
        // 40 pulses at 4 pulses/mm.
        assert!((enc.read_position() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn double_transition_is_noise_not_count() {
        let enc = QuadratureEncoder::new(1.0);
        // 00 → 11 flips both channels at once.
        enc.on_edge(true, true);
        assert_eq!(enc.pulse_count(), 0);
        assert_eq!(enc.noise_count(), 1);
        // Decoder resynced at 11; a valid step still counts.
        enc.on_edge(true, false);
        assert_eq!(enc.pulse_count(), 1);
    }

    #[test]
    fn repeated_sample_is_ignored() {
        let enc = QuadratureEncoder::new(1.0);
        enc.on_edge(false, true);
        enc.on_edge(false, true);
        assert_eq!(enc.pulse_count(), 1);
        assert_eq!(enc.noise_count(), 0);
    }

    #[test]
    fn set_position_rebases_without_touching_pulses() {
        let enc = QuadratureEncoder::new(2.0);
        cycle_forward(&enc); // 4 pulses = 2 mm
        enc.set_position(250.0);
        assert_eq!(enc.pulse_count(), 4);
        assert!((enc.read_position() - 250.0).abs() < 1e-9);
        cycle_forward(&enc);
        assert!((enc.read_position() - 252.0).abs() < 1e-9);
    }

    #[test]
    fn index_capture_only_when_armed() {
        let enc = QuadratureEncoder::new(1.0);
        cycle_forward(&enc);
        enc.on_index();
        // Not armed: counter untouched, nothing latched.
        assert_eq!(enc.pulse_count(), 4);
        assert!(!enc.take_index());

        enc.reset_at_index();
        enc.on_index();
        assert_eq!(enc.pulse_count(), 0);
        assert!(enc.take_index());
        // Latch is consumed.
        assert!(!enc.take_index());
    }

    #[test]
    fn wait_for_index_times_out_without_pulse() {
        let enc = QuadratureEncoder::new(1.0);
        enc.reset_at_index();
        assert!(!enc.wait_for_index(Duration::from_millis(20)));
    }

    #[test]
    fn wait_for_index_wakes_on_pulse() {
        let enc = std::sync::Arc::new(QuadratureEncoder::new(1.0));
        enc.reset_at_index();
        let feeder = std::sync::Arc::clone(&enc);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            feeder.on_index();
        });
        assert!(enc.wait_for_index(Duration::from_secs(1)));
        t.join().unwrap();
    }
}
