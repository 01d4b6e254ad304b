//! Carriage motion controller: state machine, command channel and the
//! control-loop tick.
//!
//! One control-loop thread owns the actuator and is the only
//! control-purpose reader of the encoder. Commands arrive over an mpsc
//! channel and are applied at tick boundaries; each blocking command
//! carries its own bounded reply channel. The external emergency flag
//! is checked before anything else every tick, so an emergency takes
//! effect within one control period regardless of what the loop was
//! doing.
//!
//! State transitions:
//!
//! ```text
//! Uninitialized ──home──▶ Homing ──ok──▶ Idle ──move──▶ Moving ──ok──▶ Holding
//!       ▲                    │fault        ▲               │stop          │stop
//!       └────── reset ───── Fault ◀────────┴───fault───────┘◀────────────┘
//!                 (any state) ──emergency──▶ EmergencyStopped ──reset──▶ Idle/Uninitialized
//! ```
//!
//! A fault latches until an explicit reset; there is no automatic
//! retry of any motion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use blitz_common::config::MachineConfig;
use blitz_common::error::MotionError;
use tracing::{debug, error, info, warn};

use crate::actuator::{ActuatorDriver, DriveOutputs};
use crate::encoder::QuadratureEncoder;
use crate::motion::pid::{PidGains, PidState, pid_compute};

/// In-position tolerance.
pub const TOLERANCE_MM: f64 = 0.5;
/// Position overshoot past the soft limits that faults a running move.
const LIMIT_GUARD_MM: f64 = 5.0;
/// Commanded speed below which stall detection stays quiet.
const STALL_MIN_SPEED: f64 = 5.0;
/// Stall window in seconds of missing pulse progress.
const STALL_WINDOW_S: f64 = 0.5;

// ─── Public types ───────────────────────────────────────────────────

/// Controller state, published in every status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No position reference yet.
    Uninitialized,
    /// Homing cycle in progress.
    Homing,
    /// Homed, actuator stopped.
    Idle,
    /// Closed-loop move in progress.
    Moving,
    /// Move complete, holding position for the cut.
    Holding,
    /// Latched motion fault.
    Fault,
    /// Latched emergency stop.
    EmergencyStopped,
}

/// Consistent snapshot of the loop state, written once per tick.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: ControllerState,
    pub position_mm: f64,
    pub target_mm: Option<f64>,
    pub homed: bool,
    pub fault: Option<MotionError>,
}

impl StatusSnapshot {
    fn initial() -> Self {
        Self {
            state: ControllerState::Uninitialized,
            position_mm: 0.0,
            target_mm: None,
            homed: false,
            fault: None,
        }
    }
}

/// Homing reference switch at the minimum end of travel.
pub trait HomeSensor: Send {
    fn is_tripped(&self) -> bool;
}

type DoneTx = mpsc::SyncSender<Result<(), MotionError>>;

/// Loop commands. Applied at the next tick boundary.
pub enum Command {
    Home { done: DoneTx },
    MoveTo { target_mm: f64, min_mm: f64, done: DoneTx },
    Stop,
    Reset,
    Shutdown,
}

// ─── Handle ─────────────────────────────────────────────────────────

/// Cloneable client handle to the control loop.
#[derive(Clone)]
pub struct MotionHandle {
    tx: mpsc::Sender<Command>,
    status: Arc<Mutex<StatusSnapshot>>,
    min_target_mm: f64,
    max_target_mm: f64,
}

impl MotionHandle {
    /// Start a homing cycle; returns the completion channel.
    pub fn begin_home(&self) -> Result<mpsc::Receiver<Result<(), MotionError>>, MotionError> {
        let (done, rx) = mpsc::sync_channel(1);
        self.tx
            .send(Command::Home { done })
            .map_err(|_| MotionError::LoopUnavailable)?;
        Ok(rx)
    }

    /// Home and block until the cycle completes or faults.
    pub fn home(&self) -> Result<(), MotionError> {
        self.begin_home()?
            .recv()
            .map_err(|_| MotionError::LoopUnavailable)?
    }

    /// Start a move within the public travel band; returns the
    /// completion channel.
    pub fn begin_move_to(
        &self,
        target_mm: f64,
    ) -> Result<mpsc::Receiver<Result<(), MotionError>>, MotionError> {
        self.begin_move_bounded(target_mm, self.min_target_mm)
    }

    /// Move within `[zero_homing, max_travel]` and block to completion.
    pub fn move_to(&self, target_mm: f64) -> Result<(), MotionError> {
        self.begin_move_to(target_mm)?
            .recv()
            .map_err(|_| MotionError::LoopUnavailable)?
    }

    /// Sequencer-only move with the lower bound relaxed to zero, for
    /// retract targets below the homing reference.
    pub(crate) fn move_to_extended(&self, target_mm: f64) -> Result<(), MotionError> {
        self.begin_move_bounded(target_mm, 0.0)?
            .recv()
            .map_err(|_| MotionError::LoopUnavailable)?
    }

    fn begin_move_bounded(
        &self,
        target_mm: f64,
        min_mm: f64,
    ) -> Result<mpsc::Receiver<Result<(), MotionError>>, MotionError> {
        if !target_mm.is_finite() || target_mm < min_mm || target_mm > self.max_target_mm {
            return Err(MotionError::SoftLimit {
                target_mm,
                min_mm,
                max_mm: self.max_target_mm,
            });
        }
        let (done, rx) = mpsc::sync_channel(1);
        self.tx
            .send(Command::MoveTo { target_mm, min_mm, done })
            .map_err(|_| MotionError::LoopUnavailable)?;
        Ok(rx)
    }

    /// Cancel any in-flight move or homing cycle.
    pub fn stop(&self) -> Result<(), MotionError> {
        self.tx.send(Command::Stop).map_err(|_| MotionError::LoopUnavailable)
    }

    /// Clear a latched fault or emergency state.
    pub fn reset(&self) -> Result<(), MotionError> {
        self.tx.send(Command::Reset).map_err(|_| MotionError::LoopUnavailable)
    }

    /// Ask the loop thread to exit after a safe stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    /// Latest published snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.status.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

// ─── Loop internals ─────────────────────────────────────────────────

#[derive(Debug)]
enum HomingPhase {
    /// Drive toward the minimum until the reference switch trips.
    Approach,
    /// Creep back out until the switch clears plus the backoff travel.
    Backoff { cleared_at_mm: Option<f64> },
    /// Creep forward onto the next encoder index pulse.
    SeekIndex,
}

struct HomingOp {
    phase: HomingPhase,
    ticks: u32,
    done: DoneTx,
}

struct MovingOp {
    target_mm: f64,
    min_mm: f64,
    settle: u32,
    ticks: u32,
    stall: u32,
    last_pulses: i64,
    done: DoneTx,
}

enum ActiveOp {
    Homing(HomingOp),
    Moving(MovingOp),
}

struct LoopParams {
    dt_s: f64,
    settle_ticks: u32,
    move_timeout_ticks: u32,
    homing_timeout_ticks: u32,
    stall_window_ticks: u32,
    approach_speed: f64,
    creep_speed: f64,
    homing_backoff_mm: f64,
    zero_homing_mm: f64,
    max_travel_mm: f64,
}

/// The control loop proper. Owns the actuator, consumes the command
/// channel, publishes status. Run it on its own thread via
/// [`ControlLoop::spawn`], or drive [`ControlLoop::tick`] directly in
/// tests.
pub struct ControlLoop<D: DriveOutputs, S: HomeSensor> {
    params: LoopParams,
    gains: PidGains,
    pid: PidState,
    encoder: Arc<QuadratureEncoder>,
    actuator: ActuatorDriver<D>,
    sensor: S,
    emergency: Arc<AtomicBool>,
    rx: mpsc::Receiver<Command>,
    status: Arc<Mutex<StatusSnapshot>>,
    state: ControllerState,
    homed: bool,
    fault: Option<MotionError>,
    hold_mm: Option<f64>,
    op: Option<ActiveOp>,
}

impl<D: DriveOutputs, S: HomeSensor> ControlLoop<D, S> {
    pub fn new(
        config: &MachineConfig,
        encoder: Arc<QuadratureEncoder>,
        backend: D,
        sensor: S,
        emergency: Arc<AtomicBool>,
    ) -> (Self, MotionHandle) {
        let (tx, rx) = mpsc::channel();
        let status = Arc::new(Mutex::new(StatusSnapshot::initial()));
        let hz = config.control_loop_hz;
        let params = LoopParams {
            dt_s: config.tick_period_s(),
            settle_ticks: config.settle_ticks,
            move_timeout_ticks: (config.move_timeout_s * hz).ceil() as u32,
            homing_timeout_ticks: (config.homing_timeout_s * hz).ceil() as u32,
            stall_window_ticks: ((STALL_WINDOW_S * hz).ceil() as u32).max(1),
            approach_speed: config.max_speed_percent * 0.5,
            creep_speed: (config.max_speed_percent * 0.15).max(2.0),
            homing_backoff_mm: config.homing_backoff_mm,
            zero_homing_mm: config.zero_homing_mm,
            max_travel_mm: config.max_travel_mm,
        };
        let gains = PidGains {
            kp: config.pid_kp,
            ki: config.pid_ki,
            kd: config.pid_kd,
            out_max: config.max_speed_percent,
        };
        let handle = MotionHandle {
            tx,
            status: Arc::clone(&status),
            min_target_mm: config.zero_homing_mm,
            max_target_mm: config.max_travel_mm,
        };
        let actuator = ActuatorDriver::new(backend, config);
        let control = Self {
            params,
            gains,
            pid: PidState::default(),
            encoder,
            actuator,
            sensor,
            emergency,
            rx,
            status,
            state: ControllerState::Uninitialized,
            homed: false,
            fault: None,
            hold_mm: None,
            op: None,
        };
        (control, handle)
    }

    /// One control period. Returns false when the loop should exit.
    pub fn tick(&mut self) -> bool {
        // Emergency preempts everything, including pending commands.
        if self.emergency.load(Ordering::SeqCst) && self.state != ControllerState::EmergencyStopped
        {
            warn!("emergency stop asserted");
            self.actuator.emergency_stop();
            if let Some(op) = self.op.take() {
                reply(op_done(op), Err(MotionError::EmergencyActive));
            }
            self.state = ControllerState::EmergencyStopped;
            self.fault = Some(MotionError::EmergencyActive);
            self.hold_mm = None;
        }

        let mut running = true;
        loop {
            match self.rx.try_recv() {
                Ok(cmd) => {
                    if !self.apply(cmd) {
                        running = false;
                        break;
                    }
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    // All handles dropped; stop safely and exit.
                    running = false;
                    break;
                }
            }
        }

        if running {
            match self.state {
                ControllerState::Homing => self.tick_homing(),
                ControllerState::Moving => self.tick_moving(),
                ControllerState::Holding => self.tick_holding(),
                _ => {}
            }
        } else {
            self.actuator.disable();
        }

        self.actuator.tick(self.params.dt_s);
        self.publish();
        running
    }

    // ── command application ──

    fn apply(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Home { done } => {
                match self.state {
                    ControllerState::Uninitialized
                    | ControllerState::Idle
                    | ControllerState::Holding => {
                        info!("homing cycle started");
                        self.state = ControllerState::Homing;
                        self.hold_mm = None;
                        self.pid.reset();
                        self.op = Some(ActiveOp::Homing(HomingOp {
                            phase: HomingPhase::Approach,
                            ticks: 0,
                            done,
                        }));
                        self.actuator.set_speed(-self.params.approach_speed, true);
                    }
                    ControllerState::EmergencyStopped => {
                        reply(done, Err(MotionError::EmergencyActive));
                    }
                    ControllerState::Fault => {
                        reply(done, Err(self.fault_latched()));
                    }
                    ControllerState::Homing | ControllerState::Moving => {
                        reply(done, Err(MotionError::Busy));
                    }
                }
            }
            Command::MoveTo { target_mm, min_mm, done } => {
                match self.state {
                    ControllerState::Idle | ControllerState::Holding => {
                        if target_mm < min_mm || target_mm > self.params.max_travel_mm {
                            reply(
                                done,
                                Err(MotionError::SoftLimit {
                                    target_mm,
                                    min_mm,
                                    max_mm: self.params.max_travel_mm,
                                }),
                            );
                        } else {
                            debug!(target_mm, "move accepted");
                            self.state = ControllerState::Moving;
                            self.hold_mm = None;
                            self.pid.reset();
                            self.op = Some(ActiveOp::Moving(MovingOp {
                                target_mm,
                                min_mm,
                                settle: 0,
                                ticks: 0,
                                stall: 0,
                                last_pulses: self.encoder.pulse_count(),
                                done,
                            }));
                        }
                    }
                    ControllerState::Uninitialized => {
                        reply(done, Err(MotionError::NotHomed));
                    }
                    ControllerState::EmergencyStopped => {
                        reply(done, Err(MotionError::EmergencyActive));
                    }
                    ControllerState::Fault => {
                        reply(done, Err(self.fault_latched()));
                    }
                    ControllerState::Homing | ControllerState::Moving => {
                        reply(done, Err(MotionError::Busy));
                    }
                }
            }
            Command::Stop => match self.state {
                ControllerState::Homing | ControllerState::Moving => {
                    info!("motion stopped by command");
                    if let Some(op) = self.op.take() {
                        reply(op_done(op), Err(MotionError::Interrupted));
                    }
                    self.actuator.set_speed(0.0, true);
                    self.state = if self.homed {
                        ControllerState::Idle
                    } else {
                        ControllerState::Uninitialized
                    };
                }
                ControllerState::Holding => {
                    self.hold_mm = None;
                    self.actuator.set_speed(0.0, true);
                    self.state = ControllerState::Idle;
                }
                _ => {}
            },
            Command::Reset => match self.state {
                ControllerState::EmergencyStopped if self.emergency.load(Ordering::SeqCst) => {
                    warn!("reset refused: emergency still active");
                }
                ControllerState::Fault | ControllerState::EmergencyStopped => {
                    info!("controller reset");
                    self.actuator.reset();
                    self.fault = None;
                    self.state = if self.homed {
                        ControllerState::Idle
                    } else {
                        ControllerState::Uninitialized
                    };
                }
                _ => {}
            },
            Command::Shutdown => {
                info!("control loop shutdown requested");
                if let Some(op) = self.op.take() {
                    reply(op_done(op), Err(MotionError::Interrupted));
                }
                return false;
            }
        }
        true
    }

    // ── per-state processing ──

    fn tick_homing(&mut self) {
        let Some(ActiveOp::Homing(mut op)) = self.op.take() else {
            return;
        };
        op.ticks += 1;
        if op.ticks > self.params.homing_timeout_ticks {
            self.fail(op.done, MotionError::HomingTimeout);
            return;
        }

        let position = self.encoder.read_position();
        match op.phase {
            HomingPhase::Approach => {
                self.actuator.set_speed(-self.params.approach_speed, true);
                if self.sensor.is_tripped() {
                    debug!("homing switch tripped, backing off");
                    op.phase = HomingPhase::Backoff { cleared_at_mm: None };
                }
            }
            HomingPhase::Backoff { ref mut cleared_at_mm } => {
                self.actuator.set_speed(self.params.creep_speed, true);
                if !self.sensor.is_tripped() && cleared_at_mm.is_none() {
                    *cleared_at_mm = Some(position);
                }
                if let Some(cleared) = *cleared_at_mm
                    && position >= cleared + self.params.homing_backoff_mm
                {
                    debug!("backoff complete, seeking index pulse");
                    self.encoder.reset_at_index();
                    op.phase = HomingPhase::SeekIndex;
                }
            }
            HomingPhase::SeekIndex => {
                self.actuator.set_speed(self.params.creep_speed, true);
                if self.encoder.take_index() {
                    self.actuator.set_speed(0.0, false);
                    self.encoder.set_position(self.params.zero_homing_mm);
                    self.homed = true;
                    self.state = ControllerState::Idle;
                    info!(
                        reference_mm = self.params.zero_homing_mm,
                        "homing complete"
                    );
                    reply(op.done, Ok(()));
                    return;
                }
            }
        }
        self.op = Some(ActiveOp::Homing(op));
    }

    fn tick_moving(&mut self) {
        let Some(ActiveOp::Moving(mut op)) = self.op.take() else {
            return;
        };
        op.ticks += 1;
        let position = self.encoder.read_position();

        if position > self.params.max_travel_mm + LIMIT_GUARD_MM
            || position < op.min_mm - LIMIT_GUARD_MM
        {
            self.fail(
                op.done,
                MotionError::SoftLimit {
                    target_mm: position,
                    min_mm: op.min_mm,
                    max_mm: self.params.max_travel_mm,
                },
            );
            return;
        }
        if op.ticks > self.params.move_timeout_ticks {
            self.fail(
                op.done,
                MotionError::MoveTimeout {
                    target_mm: op.target_mm,
                    elapsed_s: f64::from(op.ticks) * self.params.dt_s,
                },
            );
            return;
        }
        if !self.actuator.is_enabled() {
            self.fail(op.done, MotionError::ActuatorDisabled);
            return;
        }

        // Stall: commanded speed but no pulse progress for a full window.
        let pulses = self.encoder.pulse_count();
        if self.actuator.current_speed().abs() > STALL_MIN_SPEED && pulses == op.last_pulses {
            op.stall += 1;
            if op.stall > self.params.stall_window_ticks {
                self.fail(op.done, MotionError::EncoderStall { position_mm: position });
                return;
            }
        } else {
            op.stall = 0;
            op.last_pulses = pulses;
        }

        let err = op.target_mm - position;
        if err.abs() <= TOLERANCE_MM {
            op.settle += 1;
            if op.settle >= self.params.settle_ticks {
                self.actuator.set_speed(0.0, false);
                self.pid.reset();
                self.hold_mm = Some(op.target_mm);
                self.state = ControllerState::Holding;
                info!(target_mm = op.target_mm, position_mm = position, "move complete");
                reply(op.done, Ok(()));
                return;
            }
        } else {
            op.settle = 0;
        }

        let out = pid_compute(&mut self.pid, &self.gains, err, self.params.dt_s);
        self.actuator.set_speed(out, false);
        self.op = Some(ActiveOp::Moving(op));
    }

    fn tick_holding(&mut self) {
        let Some(target) = self.hold_mm else {
            return;
        };
        let err = target - self.encoder.read_position();
        if err.abs() <= TOLERANCE_MM {
            self.actuator.set_speed(0.0, false);
        } else {
            let out = pid_compute(&mut self.pid, &self.gains, err, self.params.dt_s);
            self.actuator.set_speed(out, false);
        }
    }

    // ── helpers ──

    fn fail(&mut self, done: DoneTx, err: MotionError) {
        error!(%err, "motion fault");
        self.actuator.disable();
        self.fault = Some(err.clone());
        self.state = ControllerState::Fault;
        self.hold_mm = None;
        reply(done, Err(err));
    }

    fn fault_latched(&self) -> MotionError {
        let reason = self
            .fault
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        MotionError::FaultLatched(reason)
    }

    fn publish(&self) {
        let target = match &self.op {
            Some(ActiveOp::Moving(op)) => Some(op.target_mm),
            _ => self.hold_mm,
        };
        let snapshot = StatusSnapshot {
            state: self.state,
            position_mm: self.encoder.read_position(),
            target_mm: target,
            homed: self.homed,
            fault: self.fault.clone(),
        };
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = snapshot;
    }

    // ── loop runners ──

    /// Run to shutdown with tick pacing. `rt` builds pace on an
    /// absolute CLOCK_MONOTONIC schedule; the default build sleeps the
    /// remainder of each period.
    pub fn run(mut self) {
        #[cfg(feature = "rt")]
        self.run_rt();
        #[cfg(not(feature = "rt"))]
        self.run_std();
    }

    /// Spawn the loop on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>>
    where
        D: 'static,
        S: 'static,
    {
        std::thread::Builder::new()
            .name("control-loop".into())
            .spawn(move || self.run())
    }

    #[cfg(not(feature = "rt"))]
    fn run_std(&mut self) {
        let period = Duration::from_secs_f64(self.params.dt_s);
        loop {
            let start = Instant::now();
            if !self.tick() {
                break;
            }
            if let Some(remaining) = period.checked_sub(start.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
    }

    #[cfg(feature = "rt")]
    fn run_rt(&mut self) {
        use nix::time::{ClockId, clock_gettime, clock_nanosleep, ClockNanosleepFlags};

        let clock = ClockId::CLOCK_MONOTONIC;
        let period_ns = (self.params.dt_s * 1e9) as i64;
        let mut next_wake = match clock_gettime(clock) {
            Ok(now) => now,
            Err(e) => {
                error!("clock_gettime failed: {e}");
                return;
            }
        };
        loop {
            if !self.tick() {
                break;
            }
            next_wake = timespec_add_ns(next_wake, period_ns);
            let _ = clock_nanosleep(clock, ClockNanosleepFlags::TIMER_ABSTIME, &next_wake);
        }
    }
}

fn op_done(op: ActiveOp) -> DoneTx {
    match op {
        ActiveOp::Homing(h) => h.done,
        ActiveOp::Moving(m) => m.done,
    }
}

fn reply(done: DoneTx, result: Result<(), MotionError>) {
    // Reply channels are buffered; a gone receiver is not our problem.
    let _ = done.try_send(result);
}

/// Add nanoseconds to a TimeSpec.
#[cfg(feature = "rt")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    let mut secs = ts.tv_sec();
    let mut nanos = ts.tv_nsec() + ns;
    while nanos >= 1_000_000_000 {
        secs += 1;
        nanos -= 1_000_000_000;
    }
    TimeSpec::new(secs, nanos)
}

// ─── Tests ──────────────────────────────────────────────────────────
