//! Logical interlock lines and their mapping onto the relay bus.
//!
//! Control code talks in terms of [`LineId`] and [`LineState`]; the
//! [`RegisterMap`] is the single place that knows which node/coil a
//! logical line lives on. Console push-buttons and safety inputs arrive
//! as a discrete-input bitfield decoded into [`ConsoleInputs`]; blade
//! tilt sensors are paired 16-bit holding registers decoded by
//! [`decode_angle`].

use bitflags::bitflags;

// ─── Sides and lines ────────────────────────────────────────────────

/// Machine head identifier. The fixed head sits on the left (SX), the
/// mobile head travels on the right (DX).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// Short label used in logs ("SX" fixed, "DX" mobile).
    pub fn label(self) -> &'static str {
        match self {
            Side::Left => "SX",
            Side::Right => "DX",
        }
    }
}

/// Logical interlock line. Identity is decoupled from bus wiring; the
/// [`RegisterMap`] owns the translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineId {
    /// Blade descent inhibit for one head. Energized = inhibited.
    BladeInhibit(Side),
    /// Workpiece clamp lock for one head. Energized = locked.
    ClampLock(Side),
    /// Carriage brake. Energized = brake released (carriage free).
    BrakeLock,
    /// Drive clutch. Energized = clutch engaged.
    ClutchEngage,
    /// Console cut-enable lamp/relay.
    CutEnable,
}

impl LineId {
    /// Every mapped line, in resync order.
    pub const ALL: [LineId; 7] = [
        LineId::BrakeLock,
        LineId::ClutchEngage,
        LineId::ClampLock(Side::Left),
        LineId::ClampLock(Side::Right),
        LineId::CutEnable,
        LineId::BladeInhibit(Side::Left),
        LineId::BladeInhibit(Side::Right),
    ];
}

/// Commanded or read-back state of a relay line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Energized,
    DeEnergized,
}

impl LineState {
    pub fn is_energized(self) -> bool {
        self == LineState::Energized
    }

    pub fn from_bool(on: bool) -> Self {
        if on { LineState::Energized } else { LineState::DeEnergized }
    }
}

// ─── Register map ───────────────────────────────────────────────────

/// Node address + coil number of one relay line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoilAddress {
    pub node: u8,
    pub coil: u16,
}

/// Bus wiring of the machine: which node and coil each logical line
/// occupies, where the console inputs live, and the holding-register
/// base of each angle sensor.
///
/// The default map matches the production cabinet: relay node A carries
/// brake/clutch/clamps/cut-enable and the console inputs, relay node B
/// carries the two blade-inhibit channels, and each head's tilt sensor
/// answers on its own node.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    /// Relay node A: brake, clutch, clamps, cut-enable, console inputs.
    pub relay_node: u8,
    /// Relay node B: blade inhibit channels.
    pub inhibit_node: u8,
    /// Tilt sensor node per head (left, right).
    pub angle_nodes: (u8, u8),
    /// Holding-register base of the angle value pair on a sensor node.
    pub angle_base: u16,
}

impl Default for RegisterMap {
    fn default() -> Self {
        RegisterMap {
            relay_node: 1,
            inhibit_node: 2,
            angle_nodes: (3, 4),
            angle_base: 0x0000,
        }
    }
}

impl RegisterMap {
    /// Coil address of a logical line.
    pub fn coil(&self, line: LineId) -> CoilAddress {
        match line {
            LineId::BrakeLock => CoilAddress { node: self.relay_node, coil: 0 },
            LineId::ClutchEngage => CoilAddress { node: self.relay_node, coil: 1 },
            LineId::ClampLock(Side::Left) => CoilAddress { node: self.relay_node, coil: 2 },
            LineId::ClampLock(Side::Right) => CoilAddress { node: self.relay_node, coil: 3 },
            LineId::CutEnable => CoilAddress { node: self.relay_node, coil: 4 },
            LineId::BladeInhibit(Side::Left) => CoilAddress { node: self.inhibit_node, coil: 0 },
            LineId::BladeInhibit(Side::Right) => CoilAddress { node: self.inhibit_node, coil: 1 },
        }
    }

    /// Node carrying the console discrete inputs.
    #[inline]
    pub fn input_node(&self) -> u8 {
        self.relay_node
    }

    /// Node address of one head's tilt sensor.
    pub fn angle_node(&self, side: Side) -> u8 {
        match side {
            Side::Left => self.angle_nodes.0,
            Side::Right => self.angle_nodes.1,
        }
    }
}

// ─── Console inputs ─────────────────────────────────────────────────

bitflags! {
    /// Discrete-input word of relay node A. Input numbers match the
    /// cabinet wiring: 0 start button, 1 emergency chain, 2 blade-out
    /// proximity, 3 cut-in-progress pulse.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConsoleInputs: u8 {
        const START_PRESSED    = 1 << 0;
        const EMERGENCY_ACTIVE = 1 << 1;
        const BLADE_OUT        = 1 << 2;
        const CUT_IN_PROGRESS  = 1 << 3;
    }
}

impl ConsoleInputs {
    /// Decode the raw input bitfield, discarding unmapped bits.
    pub fn decode(raw: u8) -> Self {
        ConsoleInputs::from_bits_truncate(raw)
    }
}

// ─── Angle sensors ──────────────────────────────────────────────────

bitflags! {
    /// Status byte of a tilt sensor reading.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SensorStatus: u8 {
        const FAULT   = 1 << 0;
        const TIMEOUT = 1 << 1;
    }
}

/// Decoded tilt sensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AngleReading {
    /// Raw 14-bit sensor count.
    pub raw: u16,
    /// Sensor-rounded whole degrees.
    pub degrees: u8,
    pub status: SensorStatus,
}

impl AngleReading {
    pub fn is_healthy(&self) -> bool {
        self.status.is_empty()
    }
}

/// Decode the paired holding registers of a tilt sensor: register 0
/// carries the raw 14-bit count, register 1 packs rounded degrees in
/// the low byte and the status flags in the high byte.
pub fn decode_angle(regs: [u16; 2]) -> AngleReading {
    AngleReading {
        raw: regs[0] & 0x3FFF,
        degrees: (regs[1] & 0x00FF) as u8,
        status: SensorStatus::from_bits_truncate((regs[1] >> 8) as u8),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── register map ──

    #[test]
    fn default_map_matches_cabinet_wiring() {
        let map = RegisterMap::default();
        assert_eq!(map.coil(LineId::BrakeLock), CoilAddress { node: 1, coil: 0 });
        assert_eq!(map.coil(LineId::ClutchEngage), CoilAddress { node: 1, coil: 1 });
        assert_eq!(
            map.coil(LineId::ClampLock(Side::Left)),
            CoilAddress { node: 1, coil: 2 }
        );
        assert_eq!(
            map.coil(LineId::ClampLock(Side::Right)),
            CoilAddress { node: 1, coil: 3 }
        );
        assert_eq!(map.coil(LineId::CutEnable), CoilAddress { node: 1, coil: 4 });
        assert_eq!(
            map.coil(LineId::BladeInhibit(Side::Left)),
            CoilAddress { node: 2, coil: 0 }
        );
        assert_eq!(
            map.coil(LineId::BladeInhibit(Side::Right)),
            CoilAddress { node: 2, coil: 1 }
        );
        assert_eq!(map.input_node(), 1);
        assert_eq!(map.angle_node(Side::Left), 3);
        assert_eq!(map.angle_node(Side::Right), 4);
    }

    #[test]
    fn all_lines_have_unique_addresses() {
        let map = RegisterMap::default();
        for (i, a) in LineId::ALL.iter().enumerate() {
            for b in &LineId::ALL[i + 1..] {
                assert_ne!(map.coil(*a), map.coil(*b), "{a:?} and {b:?} collide");
            }
        }
    }

    // ── console inputs ──

    #[test]
    fn console_inputs_decode() {
        let inputs = ConsoleInputs::decode(0b0000_1010);
        assert!(inputs.contains(ConsoleInputs::EMERGENCY_ACTIVE));
        assert!(inputs.contains(ConsoleInputs::CUT_IN_PROGRESS));
        assert!(!inputs.contains(ConsoleInputs::START_PRESSED));
    }

    #[test]
    fn console_inputs_discard_unmapped_bits() {
        let inputs = ConsoleInputs::decode(0xF1);
        assert_eq!(inputs, ConsoleInputs::START_PRESSED);
    }

    // ── angle sensors ──

    #[test]
    fn angle_decoding_masks_to_14_bits() {
        let reading = decode_angle([0xC123, 0x002D]);
        assert_eq!(reading.raw, 0x0123);
        assert_eq!(reading.degrees, 45);
        assert!(reading.is_healthy());
    }

    #[test]
    fn angle_status_flags_from_high_byte() {
        let reading = decode_angle([0x0100, 0x015A]);
        assert_eq!(reading.degrees, 90);
        assert!(reading.status.contains(SensorStatus::FAULT));
        assert!(!reading.is_healthy());
    }

    #[test]
    fn side_helpers() {
        assert_eq!(Side::Left.opposite(), Side::Right);
        assert_eq!(Side::Left.label(), "SX");
        assert_eq!(Side::Right.label(), "DX");
    }
}
