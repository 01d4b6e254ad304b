//! Closed-loop carriage motion: PID position control and the
//! controller state machine with its command channel.

pub mod controller;
pub mod pid;

pub use controller::{
    Command, ControlLoop, ControllerState, HomeSensor, MotionHandle, StatusSnapshot,
};
pub use pid::{PidGains, PidState, pid_compute};
