//! # BLITZ Control Unit
//!
//! Axis control core for a two-head miter saw with one fixed (SX) and
//! one mobile (DX) cutting head. The crate owns the closed position
//! loop of the mobile head and the safety-interlocked cutting-mode
//! sequences built on top of it:
//!
//! - [`encoder`] — ×4 quadrature decoding with index-pulse capture.
//! - [`actuator`] — ramped DC drive command over a pluggable backend.
//! - [`bus`] — register-mapped serial bridge to the relay/sensor nodes.
//! - [`motion`] — PID position loop, controller state machine, homing.
//! - [`modes`] — length-band mode detection and the step sequencer for
//!   out-of-quota, ultra-short and extra-long cuts.
//! - [`unit`] — the composed upstream command surface.
//! - [`sim`] — simulation backends for tests and bench-top runs.
//! - [`rt`] — optional PREEMPT_RT thread setup (feature `rt`).

pub mod actuator;
pub mod bus;
pub mod encoder;
pub mod modes;
pub mod motion;
pub mod rt;
pub mod sim;
pub mod unit;
