//! # Blitz Control Unit
//!
//! Closed-loop axis control for the two-head miter saw line.
//!
//! The binary wires the control loop to the simulated plant (the
//! hardware backends plug into the same [`DriveOutputs`] and
//! [`SerialTransport`] seams), performs RT setup, and runs the loop on
//! the main thread. A supervisor thread homes the carriage, mirrors
//! the console emergency chain into the safety source, and logs status
//! until shutdown.
//!
//! [`DriveOutputs`]: blitz_control_unit::actuator::DriveOutputs
//! [`SerialTransport`]: blitz_control_unit::bus::SerialTransport

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use blitz_common::config::{MachineConfig, load_config};
use blitz_common::io::{ConsoleInputs, RegisterMap};
use blitz_common::safety::AtomicSafetySource;
use blitz_control_unit::bus::InterlockBridge;
use blitz_control_unit::encoder::QuadratureEncoder;
use blitz_control_unit::motion::{ControlLoop, MotionHandle};
use blitz_control_unit::rt::rt_setup;
use blitz_control_unit::sim::{SimAxis, SimBus, SimDrive, SimHomeSensor};
use blitz_control_unit::unit::SawControlUnit;
use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Blitz Control Unit — saw carriage axis control
#[derive(Parser, Debug)]
#[command(name = "blitz_control_unit")]
#[command(version)]
#[command(about = "Closed-loop carriage control for the two-head saw")]
struct Args {
    /// Path to the machine configuration TOML.
    #[arg(default_value = "config/machine.toml")]
    config: PathBuf,

    /// CPU core to pin the control thread to.
    #[arg(long, default_value_t = 1)]
    cpu_core: usize,

    /// SCHED_FIFO priority.
    #[arg(long, default_value_t = 80)]
    rt_priority: i32,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    info!("Blitz Control Unit v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("Blitz Control Unit shutdown complete");
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(load_config(&args.config)?);
    info!(
        "Config OK: loop={}Hz, travel=[{}, {}]mm, stock={}mm",
        config.control_loop_hz, config.zero_homing_mm, config.max_travel_mm, config.stock_length_mm,
    );

    // ── Plant and control loop ──
    let encoder = Arc::new(QuadratureEncoder::new(config.pulses_per_mm));
    let axis = Arc::new(SimAxis::new(
        config.zero_homing_mm + 150.0,
        config.zero_homing_mm - config.sensor_lead_mm,
        config.zero_homing_mm + config.homing_backoff_mm + 2.0,
        150.0,
    ));
    let drive = SimDrive::new(Arc::clone(&axis), Arc::clone(&encoder), config.pulses_per_mm);
    let sensor = SimHomeSensor::new(Arc::clone(&axis));

    let safety = Arc::new(AtomicSafetySource::new());
    let (control, handle) = ControlLoop::new(
        &config,
        encoder,
        drive,
        sensor,
        safety.emergency_flag(),
    );

    // ── Interlock bridge and unit facade ──
    let map = RegisterMap::default();
    let bridge = Arc::new(InterlockBridge::new(SimBus::new(), map));
    let unit = Arc::new(SawControlUnit::new(
        Arc::clone(&config),
        handle.clone(),
        Arc::clone(&bridge),
        Arc::clone(&safety) as Arc<dyn blitz_common::safety::SafetySource>,
    ));

    // ── Shutdown signal ──
    let running = Arc::new(AtomicBool::new(true));
    {
        let r = Arc::clone(&running);
        let h = handle.clone();
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            r.store(false, Ordering::SeqCst);
            h.shutdown();
        })?;
    }

    // ── Supervisor thread ──
    let supervisor = {
        let unit = Arc::clone(&unit);
        let safety = Arc::clone(&safety);
        let config = Arc::clone(&config);
        let running = Arc::clone(&running);
        let handle = handle.clone();
        std::thread::Builder::new()
            .name("supervisor".into())
            .spawn(move || supervise(&unit, &safety, &config, &running, &handle))?
    };

    // RT setup (mlockall, affinity, scheduler), then the loop owns the
    // main thread until shutdown.
    rt_setup(args.cpu_core, args.rt_priority)?;
    info!(
        "RT setup complete (cpu_core={}, priority={})",
        args.cpu_core, args.rt_priority
    );
    control.run();

    if supervisor.join().is_err() {
        warn!("supervisor thread panicked");
    }
    Ok(())
}

/// Home the carriage, then mirror the console safety chain into the
/// control loop and log status until shutdown.
fn supervise(
    unit: &SawControlUnit<SimBus>,
    safety: &AtomicSafetySource,
    config: &MachineConfig,
    running: &AtomicBool,
    handle: &MotionHandle,
) {
    match unit.home() {
        Ok(()) => info!(reference_mm = config.zero_homing_mm, "homing complete"),
        Err(e) => {
            error!("homing failed: {e}");
            return;
        }
    }

    let map = RegisterMap::default();
    let mut last_state = None;
    while running.load(Ordering::SeqCst) {
        match unit.bridge().read_inputs(map.relay_node) {
            Ok(bits) => {
                let inputs = ConsoleInputs::decode(bits);
                safety.set_emergency(inputs.contains(ConsoleInputs::EMERGENCY_ACTIVE));
                safety.set_cut_in_progress(inputs.contains(ConsoleInputs::CUT_IN_PROGRESS));
            }
            Err(e) => warn!("console input poll failed: {e}"),
        }

        let status = handle.status();
        if last_state != Some(status.state) {
            info!(
                state = ?status.state,
                position_mm = format!("{:.1}", status.position_mm),
                "controller state"
            );
            last_state = Some(status.state);
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
