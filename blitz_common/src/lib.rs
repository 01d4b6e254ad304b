//! # BLITZ Common Library
//!
//! Shared foundation for the BLITZ two-head saw control workspace:
//!
//! - [`config`] — immutable machine configuration (TOML) with load-time
//!   validation of the geometric threshold invariants.
//! - [`error`] — the workspace error taxonomy (configuration, bus,
//!   motion, sequence).
//! - [`io`] — logical interlock line identifiers, the register map onto
//!   the relay/coil bus, console input bitflags and angle-sensor
//!   register decoding.
//! - [`safety`] — the externally driven safety context (emergency,
//!   cut-in-progress) and the fresh-sampling contract.

pub mod config;
pub mod error;
pub mod io;
pub mod safety;
