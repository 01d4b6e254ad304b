//! Simulation backends for tests and bench-top runs.
//!
//! [`SimAxis`] is the shared virtual carriage: [`SimDrive`] integrates
//! drive commands into its position and feeds the resulting quadrature
//! edges (and index crossings) back into the encoder, so the control
//! loop closes over exactly the signals it would see on hardware.
//! [`SimBus`] is an in-memory register bank behind the serial transport
//! trait, with scriptable timeouts for fault-injection tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::actuator::{DriveCommand, DriveOutputs};
use crate::bus::{SerialTransport, TransportError, crc16};
use crate::encoder::QuadratureEncoder;
use crate::motion::controller::HomeSensor;

// ─── Virtual axis ───────────────────────────────────────────────────

#[derive(Debug)]
struct AxisState {
    position_mm: f64,
    velocity_mm_s: f64,
    jammed: bool,
}

/// Shared state of the simulated carriage.
#[derive(Debug)]
pub struct SimAxis {
    state: Mutex<AxisState>,
    /// Home switch trips at and below this position.
    pub home_trip_mm: f64,
    /// Encoder index pulse position.
    pub index_mm: f64,
    /// Carriage speed at 100 % drive.
    pub full_speed_mm_s: f64,
}

impl SimAxis {
    pub fn new(start_mm: f64, home_trip_mm: f64, index_mm: f64, full_speed_mm_s: f64) -> Self {
        Self {
            state: Mutex::new(AxisState {
                position_mm: start_mm,
                velocity_mm_s: 0.0,
                jammed: false,
            }),
            home_trip_mm,
            index_mm,
            full_speed_mm_s,
        }
    }

    pub fn position_mm(&self) -> f64 {
        self.lock().position_mm
    }

    pub fn velocity_mm_s(&self) -> f64 {
        self.lock().velocity_mm_s
    }

    /// Mechanically block the carriage: drive commands stop producing
    /// movement (and therefore encoder pulses).
    pub fn jam(&self, jammed: bool) {
        self.lock().jammed = jammed;
    }

    fn lock(&self) -> MutexGuard<'_, AxisState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ─── Drive backend ──────────────────────────────────────────────────

// Quadrature phase walk matching the decoder's gray order.
const PHASES: [(bool, bool); 4] = [(false, false), (false, true), (true, true), (true, false)];

/// Drive backend that moves the virtual axis and feeds the encoder.
pub struct SimDrive {
    axis: Arc<SimAxis>,
    encoder: Arc<QuadratureEncoder>,
    pulses_per_mm: f64,
    emitted_pulses: i64,
    phase: usize,
}

impl SimDrive {
    pub fn new(axis: Arc<SimAxis>, encoder: Arc<QuadratureEncoder>, pulses_per_mm: f64) -> Self {
        Self {
            axis,
            encoder,
            pulses_per_mm,
            emitted_pulses: 0,
            phase: 0,
        }
    }
}

impl DriveOutputs for SimDrive {
    fn apply(&mut self, command: DriveCommand, dt_s: f64) {
        let (old_pos, new_pos) = {
            let mut st = self.axis.lock();
            let direction = if command.forward { 1.0 } else { -1.0 };
            st.velocity_mm_s = if command.enable && !st.jammed {
                command.duty_percent / 100.0 * self.axis.full_speed_mm_s * direction
            } else {
                0.0
            };
            let old = st.position_mm;
            st.position_mm = old + st.velocity_mm_s * dt_s;
            (old, st.position_mm)
        };

        let index = self.axis.index_mm;
        if (old_pos < index && new_pos >= index) || (old_pos > index && new_pos <= index) {
            self.encoder.on_index();
        }

        // Emit one quadrature transition per pulse the movement crossed.
        let target_pulses = (new_pos * self.pulses_per_mm).round() as i64;
        while self.emitted_pulses != target_pulses {
            if self.emitted_pulses < target_pulses {
                self.phase = (self.phase + 1) % 4;
                self.emitted_pulses += 1;
            } else {
                self.phase = (self.phase + 3) % 4;
                self.emitted_pulses -= 1;
            }
            let (a, b) = PHASES[self.phase];
            self.encoder.on_edge(a, b);
        }
    }
}

/// Home switch of the virtual axis.
pub struct SimHomeSensor {
    axis: Arc<SimAxis>,
}

impl SimHomeSensor {
    pub fn new(axis: Arc<SimAxis>) -> Self {
        Self { axis }
    }
}

impl HomeSensor for SimHomeSensor {
    fn is_tripped(&self) -> bool {
        self.axis.position_mm() <= self.axis.home_trip_mm
    }
}

// ─── Bus bank ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BankState {
    coils: HashMap<(u8, u16), bool>,
    inputs: HashMap<u8, u8>,
    holdings: HashMap<(u8, u16), u16>,
    /// Remaining transactions to fail with a timeout.
    timeouts_pending: u32,
    transactions: u64,
}

/// In-memory register bank implementing the serial transport.
///
/// Cloneable handle; tests keep a clone to inspect coils and script
/// faults while the bridge owns another.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    bank: Arc<Mutex<BankState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current coil state, for assertions.
    pub fn coil(&self, node: u8, coil: u16) -> bool {
        *self.lock().coils.get(&(node, coil)).unwrap_or(&false)
    }

    /// Force a coil without going through the protocol, emulating a
    /// relay that did not follow its command.
    pub fn force_coil(&self, node: u8, coil: u16, on: bool) {
        self.lock().coils.insert((node, coil), on);
    }

    pub fn set_inputs(&self, node: u8, bits: u8) {
        self.lock().inputs.insert(node, bits);
    }

    pub fn set_holding(&self, node: u8, addr: u16, value: u16) {
        self.lock().holdings.insert((node, addr), value);
    }

    /// Fail the next `count` transactions with a response timeout.
    pub fn script_timeouts(&self, count: u32) {
        self.lock().timeouts_pending = count;
    }

    pub fn transaction_count(&self) -> u64 {
        self.lock().transactions
    }

    fn lock(&self) -> MutexGuard<'_, BankState> {
        self.bank.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn respond(bank: &mut BankState, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        if request.len() != 8 {
            return Err(TransportError::Io("malformed request length".into()));
        }
        let (body, crc_bytes) = request.split_at(6);
        let crc = u16::from(crc_bytes[0]) | (u16::from(crc_bytes[1]) << 8);
        if crc != crc16(body) {
            return Err(TransportError::Io("request CRC mismatch".into()));
        }
        let node = body[0];
        let function = body[1];
        let addr = u16::from_be_bytes([body[2], body[3]]);
        let value = u16::from_be_bytes([body[4], body[5]]);

        match function {
            // Read coils: pack `value` coils starting at `addr`, LSB first.
            0x01 => {
                let count = value.min(8);
                let mut bits = 0u8;
                for i in 0..count {
                    if *bank.coils.get(&(node, addr + i)).unwrap_or(&false) {
                        bits |= 1 << i;
                    }
                }
                Ok(with_crc(vec![node, function, 1, bits]))
            }
            // Read discrete inputs: the node's whole input byte.
            0x02 => {
                let bits = *bank.inputs.get(&node).unwrap_or(&0);
                Ok(with_crc(vec![node, function, 1, bits]))
            }
            // Read holding registers.
            0x03 => {
                let count = value.min(8);
                let mut payload = vec![node, function, (count * 2) as u8];
                for i in 0..count {
                    let reg = *bank.holdings.get(&(node, addr + i)).unwrap_or(&0);
                    payload.extend_from_slice(&reg.to_be_bytes());
                }
                Ok(with_crc(payload))
            }
            // Write single coil; the node echoes the request verbatim.
            0x05 => {
                bank.coils.insert((node, addr), value == 0xFF00);
                Ok(request.to_vec())
            }
            _ => {
                let payload = vec![node, function | 0x80, 0x01];
                Ok(with_crc(payload))
            }
        }
    }
}

fn with_crc(mut body: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&body);
    body.push((crc & 0xFF) as u8);
    body.push((crc >> 8) as u8);
    body
}

impl SerialTransport for SimBus {
    fn transact(&mut self, request: &[u8], _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut bank = self.lock();
        bank.transactions += 1;
        if bank.timeouts_pending > 0 {
            bank.timeouts_pending -= 1;
            return Err(TransportError::Timeout);
        }
        Self::respond(&mut bank, request)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
