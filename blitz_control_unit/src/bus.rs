//! Register-mapped serial bridge to the relay and sensor nodes.
//!
//! One RS-485 trunk carries every interlock relay, the console inputs
//! and the blade tilt sensors. Frames follow the classic RTU layout:
//! `node, function, addr_hi, addr_lo, val_hi, val_lo, crc_lo, crc_hi`
//! with CRC16 polynomial 0xA001. Function codes: 0x01 read coils,
//! 0x02 read discrete inputs, 0x03 read holding registers, 0x05 write
//! single coil (echoed by the node).
//!
//! Each call gets a 500 ms response window and two retries; after that
//! [`BusError::RetryExhausted`] surfaces to the caller, which decides
//! whether the operation was cut-affecting. The bridge keeps an
//! advisory cache of commanded line states, but every safety-relevant
//! read-back ([`InterlockBridge::blade_inhibited`],
//! [`InterlockBridge::clamp_locked`], [`InterlockBridge::get_line`])
//! queries hardware. A single mutex serializes transactions; the trunk
//! has exactly one transceiver.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use blitz_common::error::BusError;
use blitz_common::io::{AngleReading, CoilAddress, LineId, LineState, RegisterMap, Side, decode_angle};
use tracing::{debug, warn};

/// Per-call response timeout.
pub const CALL_TIMEOUT: Duration = Duration::from_millis(500);
/// Retries after the first failed attempt.
pub const RETRIES: u8 = 2;

const FN_READ_COILS: u8 = 0x01;
const FN_READ_INPUTS: u8 = 0x02;
const FN_READ_HOLDING: u8 = 0x03;
const FN_WRITE_COIL: u8 = 0x05;

// ─── Transport ──────────────────────────────────────────────────────

/// Raw transport fault, before the bridge attaches node context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No complete response within the deadline.
    Timeout,
    /// Port-level failure.
    Io(String),
}

/// Half-duplex request/response transport: write one frame, collect the
/// response within `timeout`. Serial port in production,
/// [`crate::sim::SimBus`] on the bench.
pub trait SerialTransport: Send {
    fn transact(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

// ─── Frame building ─────────────────────────────────────────────────

/// CRC16, polynomial 0xA001, initial 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn build_frame(node: u8, function: u8, addr: u16, value: u16) -> [u8; 8] {
    let mut frame = [
        node,
        function,
        (addr >> 8) as u8,
        (addr & 0xFF) as u8,
        (value >> 8) as u8,
        (value & 0xFF) as u8,
        0,
        0,
    ];
    let crc = crc16(&frame[..6]);
    frame[6] = (crc & 0xFF) as u8;
    frame[7] = (crc >> 8) as u8;
    frame
}

/// Check CRC, node and function of a response; return the payload
/// between the function byte and the CRC.
fn validate_response<'a>(node: u8, function: u8, resp: &'a [u8]) -> Result<&'a [u8], BusError> {
    if resp.len() < 4 {
        return Err(BusError::Frame { node, reason: "response too short" });
    }
    let (body, crc_bytes) = resp.split_at(resp.len() - 2);
    let got = u16::from(crc_bytes[0]) | (u16::from(crc_bytes[1]) << 8);
    let expected = crc16(body);
    if got != expected {
        return Err(BusError::Crc { node, expected, got });
    }
    if body[0] != node {
        return Err(BusError::Frame { node, reason: "response from wrong node" });
    }
    if body[1] == function | 0x80 {
        return Err(BusError::Frame { node, reason: "node reported exception" });
    }
    if body[1] != function {
        return Err(BusError::Frame { node, reason: "function code mismatch" });
    }
    Ok(&body[2..])
}

// ─── Bridge ─────────────────────────────────────────────────────────

struct Inner<T: SerialTransport> {
    transport: T,
    /// Last commanded/observed state per line. Advisory only.
    cache: HashMap<LineId, LineState>,
}

/// Serial interlock bridge over a [`SerialTransport`].
pub struct InterlockBridge<T: SerialTransport> {
    map: RegisterMap,
    inner: Mutex<Inner<T>>,
}

impl<T: SerialTransport> InterlockBridge<T> {
    pub fn new(transport: T, map: RegisterMap) -> Self {
        Self {
            map,
            inner: Mutex::new(Inner { transport, cache: HashMap::new() }),
        }
    }

    /// Command a relay line and verify the node's echo.
    pub fn set_line(&self, line: LineId, state: LineState) -> Result<(), BusError> {
        let CoilAddress { node, coil } = self.map.coil(line);
        let value: u16 = if state.is_energized() { 0xFF00 } else { 0x0000 };
        let request = build_frame(node, FN_WRITE_COIL, coil, value);

        let mut inner = self.lock();
        let resp = transact_with_retry(&mut inner.transport, node, &request)?;
        // A single-coil write is acknowledged by echoing the request.
        if resp != request {
            return Err(BusError::Frame { node, reason: "write echo mismatch" });
        }
        inner.cache.insert(line, state);
        debug!(?line, ?state, node, coil, "line written");
        Ok(())
    }

    /// Read a relay line back from hardware. Refreshes the cache.
    pub fn get_line(&self, line: LineId) -> Result<LineState, BusError> {
        let CoilAddress { node, coil } = self.map.coil(line);
        let request = build_frame(node, FN_READ_COILS, coil, 1);

        let mut inner = self.lock();
        let resp = transact_with_retry(&mut inner.transport, node, &request)?;
        let payload = validate_response(node, FN_READ_COILS, &resp)?;
        if payload.len() < 2 || payload[0] < 1 {
            return Err(BusError::Frame { node, reason: "short coil payload" });
        }
        let state = LineState::from_bool(payload[1] & 0x01 != 0);
        inner.cache.insert(line, state);
        Ok(state)
    }

    /// Read the 8-bit discrete-input word of a node.
    pub fn read_inputs(&self, node: u8) -> Result<u8, BusError> {
        let request = build_frame(node, FN_READ_INPUTS, 0, 8);
        let mut inner = self.lock();
        let resp = transact_with_retry(&mut inner.transport, node, &request)?;
        let payload = validate_response(node, FN_READ_INPUTS, &resp)?;
        if payload.len() < 2 || payload[0] < 1 {
            return Err(BusError::Frame { node, reason: "short input payload" });
        }
        Ok(payload[1])
    }

    /// Read and decode one head's tilt sensor register pair.
    pub fn read_angle(&self, side: Side) -> Result<AngleReading, BusError> {
        let node = self.map.angle_node(side);
        let request = build_frame(node, FN_READ_HOLDING, self.map.angle_base, 2);
        let mut inner = self.lock();
        let resp = transact_with_retry(&mut inner.transport, node, &request)?;
        let payload = validate_response(node, FN_READ_HOLDING, &resp)?;
        if payload.len() < 5 || payload[0] < 4 {
            return Err(BusError::Frame { node, reason: "short register payload" });
        }
        let regs = [
            u16::from_be_bytes([payload[1], payload[2]]),
            u16::from_be_bytes([payload[3], payload[4]]),
        ];
        Ok(decode_angle(regs))
    }

    /// Hardware read-back: is this head's blade descent inhibited?
    pub fn blade_inhibited(&self, side: Side) -> Result<bool, BusError> {
        Ok(self.get_line(LineId::BladeInhibit(side))?.is_energized())
    }

    /// Hardware read-back: is this head's clamp locked?
    pub fn clamp_locked(&self, side: Side) -> Result<bool, BusError> {
        Ok(self.get_line(LineId::ClampLock(side))?.is_energized())
    }

    /// Last commanded/observed state, no bus traffic. Advisory only;
    /// never a substitute for a read-back before a cut-affecting step.
    pub fn cached(&self, line: LineId) -> Option<LineState> {
        self.lock().cache.get(&line).copied()
    }

    /// Re-read every mapped line from hardware, e.g. after a fault or
    /// a node power cycle invalidated the cache.
    pub fn resync(&self) -> Result<(), BusError> {
        for line in LineId::ALL {
            self.get_line(line)?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// One logical bus call: first attempt plus [`RETRIES`] retries on
/// transport-level faults (timeout, port error, empty response), then
/// the retry budget surfaces. Protocol-level faults (CRC, echo or node
/// mismatch) fail fast at the call site; they indicate a wiring or
/// firmware problem a retry will not fix.
fn transact_with_retry<T: SerialTransport>(
    transport: &mut T,
    node: u8,
    request: &[u8],
) -> Result<Vec<u8>, BusError> {
    let attempts = RETRIES + 1;
    for attempt in 1..=attempts {
        let fault = match transport.transact(request, CALL_TIMEOUT) {
            Ok(resp) => {
                // Frame-level validation happens at the call site; here
                // only an empty response is treated as a failed attempt.
                if resp.is_empty() {
                    BusError::Frame { node, reason: "empty response" }
                } else {
                    return Ok(resp);
                }
            }
            Err(TransportError::Timeout) => BusError::Timeout { node },
            Err(TransportError::Io(msg)) => {
                warn!(node, %msg, "transport I/O fault");
                BusError::Frame { node, reason: "transport I/O fault" }
            }
        };
        if attempt < attempts {
            warn!(node, attempt, %fault, "bus call failed, retrying");
        }
    }
    Err(BusError::RetryExhausted { node, attempts })
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── crc / framing ──

    #[test]
    fn crc16_known_vector() {
        // Standard RTU reference frame: 01 04 00 00 00 02 → CRC 0x0B71.
        let crc = crc16(&[0x01, 0x04, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(crc, 0x0B71);
    }

    #[test]
    fn frame_carries_crc_low_byte_first() {
        let frame = build_frame(0x01, 0x04, 0x0000, 0x0002);
        assert_eq!(frame[6], 0x71);
        assert_eq!(frame[7], 0x0B);
    }

    #[test]
    fn validate_rejects_bad_crc() {
        let mut frame = build_frame(1, FN_READ_COILS, 0, 1).to_vec();
        frame[6] ^= 0xFF;
        let err = validate_response(1, FN_READ_COILS, &frame).unwrap_err();
        assert!(matches!(err, BusError::Crc { node: 1, .. }));
    }

    #[test]
    fn validate_rejects_wrong_node_and_exception() {
        let frame = build_frame(2, FN_READ_COILS, 0, 1);
        let err = validate_response(1, FN_READ_COILS, &frame).unwrap_err();
        assert!(matches!(err, BusError::Frame { .. }));

        let mut exc = [1u8, FN_READ_COILS | 0x80, 0x02, 0, 0];
        let crc = crc16(&exc[..3]);
        exc[3] = (crc & 0xFF) as u8;
        exc[4] = (crc >> 8) as u8;
        let err = validate_response(1, FN_READ_COILS, &exc).unwrap_err();
        assert!(matches!(err, BusError::Frame { reason: "node reported exception", .. }));
    }

    // ── retry policy ──

    /// Transport that fails the first N calls with a timeout.
    struct FlakyTransport {
        failures_left: u32,
        response: Vec<u8>,
        calls: u32,
    }

    impl SerialTransport for FlakyTransport {
        fn transact(&mut self, _req: &[u8], _t: Duration) -> Result<Vec<u8>, TransportError> {
            self.calls += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(TransportError::Timeout);
            }
            Ok(self.response.clone())
        }
    }

    #[test]
    fn retry_recovers_within_budget() {
        let mut t = FlakyTransport {
            failures_left: 2,
            response: vec![0xAA],
            calls: 0,
        };
        let resp = transact_with_retry(&mut t, 1, &[0x01]).unwrap();
        assert_eq!(resp, vec![0xAA]);
        assert_eq!(t.calls, 3);
    }

    #[test]
    fn retry_budget_exhausts_after_three_attempts() {
        let mut t = FlakyTransport {
            failures_left: 10,
            response: vec![],
            calls: 0,
        };
        let err = transact_with_retry(&mut t, 7, &[0x01]).unwrap_err();
        assert_eq!(err, BusError::RetryExhausted { node: 7, attempts: 3 });
        assert_eq!(t.calls, 3);
    }
}
