//! The board's list opcode format: one 12-byte record per operation.
//!
//! Byte layout: `opcode: u16_le`, then five `u16_le` parameters. Every
//! variant here corresponds to a `balor.MSBF.Operation` subclass; unknown
//! opcodes are preserved verbatim via [`ListOp::Unknown`] so that a
//! serialize/deserialize round trip never loses data (property 1, SPEC_FULL
//! §8).

use crate::error::{Error, Result};

/// Opcode constants, named for the operation they select.
pub mod opcode {
    pub const JUMP_TO: u16 = 0x8001;
    pub const NO_OP: u16 = 0x8002;
    pub const MARK_END_DELAY: u16 = 0x8004;
    pub const MARK_TO: u16 = 0x8005;
    pub const JUMP_SPEED: u16 = 0x8006;
    pub const LASER_ON_DELAY: u16 = 0x8007;
    pub const LASER_OFF_DELAY: u16 = 0x8008;
    pub const MARK_SPEED: u16 = 0x800C;
    pub const ALT_TRAVEL: u16 = 0x800D;
    pub const POLYGON_DELAY: u16 = 0x800F;
    pub const MARK_POWER_RATIO: u16 = 0x8012;
    pub const QSWITCH_PERIOD: u16 = 0x801B;
    pub const LASER_CONTROL: u16 = 0x8021;
    pub const READY_MARK: u16 = 0x8051;
}

/// One 12-byte list-level operation.
///
/// Variants that carry an (x, y) pair use galvo-space coordinates (16-bit,
/// 0x8000 = mechanical center). Variants that carry a distance field have it
/// back-filled by [`crate::commandlist::CommandList`] at serialization time;
/// constructors here accept `distance: 0` as a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOp {
    /// Travel (laser off) to (x, y). angle/distance tracked for the board's
    /// internal motion profile.
    JumpTo { x: u16, y: u16, angle: u16, distance: u16 },
    /// Padding / end-of-list filler. Carries no parameters.
    NoOp,
    /// Dwell after a mark stroke, in units of 10 microseconds.
    MarkEndDelay { units_10us: u16 },
    /// Cut (laser on) to (x, y).
    MarkTo { x: u16, y: u16, angle: u16, distance: u16 },
    /// Travel speed, in units of 1.9656 mm/s (see
    /// [`crate::commandlist::mm_per_s_to_speed_units`]).
    JumpSpeed { units: u16 },
    /// Laser-on delay compensation, microseconds.
    LaserOnDelay { us: u16, unknown: u16 },
    /// Laser-off delay compensation, microseconds.
    LaserOffDelay { us: u16 },
    /// Mark (cut) speed, same unit as [`ListOp::JumpSpeed`].
    MarkSpeed { units: u16 },
    /// Vendor variant of travel, used when jump-calibration mode is active.
    AltTravel { x: u16, y: u16, angle: u16, distance: u16 },
    /// Corner dwell, in units of 10 microseconds.
    PolygonDelay { units_10us: u16 },
    /// Mark power, scaled `units / 40.96` percent.
    MarkPowerRatio { units: u16 },
    /// Q-switch period, in units of 50 nanoseconds.
    QSwitchPeriod { units: u16 },
    /// Laser enable/disable gating.
    LaserControl { on: bool },
    /// Marks the beginning of a job; must precede any state-setting or
    /// geometric op in a command list.
    ReadyMark,
    /// Any opcode this crate does not model explicitly. Preserved verbatim
    /// so round-trips never lose data (includes the stub opcodes the
    /// original driver never interpreted: 0x800A, 0x800B, 0x801C-0x801F,
    /// 0x8023-0x8029, and anything else encountered on the wire).
    Unknown { opcode: u16, params: [u16; 5] },
}

impl ListOp {
    /// The 16-bit opcode this operation serializes to.
    pub fn opcode(&self) -> u16 {
        use opcode::*;
        match self {
            ListOp::JumpTo { .. } => JUMP_TO,
            ListOp::NoOp => NO_OP,
            ListOp::MarkEndDelay { .. } => MARK_END_DELAY,
            ListOp::MarkTo { .. } => MARK_TO,
            ListOp::JumpSpeed { .. } => JUMP_SPEED,
            ListOp::LaserOnDelay { .. } => LASER_ON_DELAY,
            ListOp::LaserOffDelay { .. } => LASER_OFF_DELAY,
            ListOp::MarkSpeed { .. } => MARK_SPEED,
            ListOp::AltTravel { .. } => ALT_TRAVEL,
            ListOp::PolygonDelay { .. } => POLYGON_DELAY,
            ListOp::MarkPowerRatio { .. } => MARK_POWER_RATIO,
            ListOp::QSwitchPeriod { .. } => QSWITCH_PERIOD,
            ListOp::LaserControl { .. } => LASER_CONTROL,
            ListOp::ReadyMark => READY_MARK,
            ListOp::Unknown { opcode, .. } => *opcode,
        }
    }

    /// True for operations that carry a galvo (x, y) coordinate pair.
    pub fn has_xy(&self) -> bool {
        matches!(
            self,
            ListOp::JumpTo { .. } | ListOp::MarkTo { .. } | ListOp::AltTravel { .. }
        )
    }

    /// The (x, y) coordinate pair, if this operation carries one.
    pub fn xy(&self) -> Option<(u16, u16)> {
        match *self {
            ListOp::JumpTo { x, y, .. } => Some((x, y)),
            ListOp::MarkTo { x, y, .. } => Some((x, y)),
            ListOp::AltTravel { x, y, .. } => Some((x, y)),
            _ => None,
        }
    }

    /// Overwrite the (x, y) coordinate pair in place. No-op if this variant
    /// does not carry coordinates.
    pub fn set_xy(&mut self, xy: (u16, u16)) {
        match self {
            ListOp::JumpTo { x, y, .. } => (*x, *y) = xy,
            ListOp::MarkTo { x, y, .. } => (*x, *y) = xy,
            ListOp::AltTravel { x, y, .. } => (*x, *y) = xy,
            _ => {}
        }
    }

    /// True for operations that carry a distance field to be back-filled by
    /// the command list builder.
    pub fn has_distance(&self) -> bool {
        matches!(
            self,
            ListOp::JumpTo { .. } | ListOp::MarkTo { .. } | ListOp::AltTravel { .. }
        )
    }

    /// Overwrite the distance field in place. No-op if this variant does not
    /// carry one.
    pub fn set_distance(&mut self, distance: u16) {
        match self {
            ListOp::JumpTo { distance: d, .. } => *d = distance,
            ListOp::MarkTo { distance: d, .. } => *d = distance,
            ListOp::AltTravel { distance: d, .. } => *d = distance,
            _ => {}
        }
    }

    /// Encode the five wire parameters in opcode-defined order.
    fn params(&self) -> [u16; 5] {
        match *self {
            ListOp::JumpTo { x, y, angle, distance } => [y, x, angle, distance, 0],
            ListOp::NoOp => [0; 5],
            ListOp::MarkEndDelay { units_10us } => [units_10us, 0, 0, 0, 0],
            ListOp::MarkTo { x, y, angle, distance } => [y, x, angle, distance, 0],
            ListOp::JumpSpeed { units } => [units, 0, 0, 0, 0],
            ListOp::LaserOnDelay { us, unknown } => [us, unknown, 0, 0, 0],
            ListOp::LaserOffDelay { us } => [us, 0, 0, 0, 0],
            ListOp::MarkSpeed { units } => [units, 0, 0, 0, 0],
            ListOp::AltTravel { x, y, angle, distance } => [y, x, angle, distance, 0],
            ListOp::PolygonDelay { units_10us } => [units_10us, 0, 0, 0, 0],
            ListOp::MarkPowerRatio { units } => [units, 0, 0, 0, 0],
            ListOp::QSwitchPeriod { units } => [units, 0, 0, 0, 0],
            ListOp::LaserControl { on } => [if on { 1 } else { 0 }, 0, 0, 0, 0],
            ListOp::ReadyMark => [0; 5],
            ListOp::Unknown { params, .. } => params,
        }
    }

    /// Serialize to the 12-byte wire record: opcode then five little-endian
    /// `u16` parameters.
    pub fn serialize(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..2].copy_from_slice(&self.opcode().to_le_bytes());
        for (i, p) in self.params().iter().enumerate() {
            let off = 2 + i * 2;
            buf[off..off + 2].copy_from_slice(&p.to_le_bytes());
        }
        buf
    }

    /// Parse a 12-byte wire record into a `ListOp`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DataValidity`] if `bytes` is not exactly 12 bytes
    /// long.
    pub fn deserialize(bytes: &[u8]) -> Result<ListOp> {
        if bytes.len() != 12 {
            return Err(Error::DataValidity {
                reason: format!("list op must be 12 bytes, got {}", bytes.len()),
            });
        }
        let op = u16::from_le_bytes([bytes[0], bytes[1]]);
        let mut p = [0u16; 5];
        for (i, slot) in p.iter_mut().enumerate() {
            let off = 2 + i * 2;
            *slot = u16::from_le_bytes([bytes[off], bytes[off + 1]]);
        }
        Ok(Self::from_opcode_and_params(op, p))
    }

    fn from_opcode_and_params(op: u16, p: [u16; 5]) -> ListOp {
        use opcode::*;
        match op {
            JUMP_TO => ListOp::JumpTo { y: p[0], x: p[1], angle: p[2], distance: p[3] },
            NO_OP => ListOp::NoOp,
            MARK_END_DELAY => ListOp::MarkEndDelay { units_10us: p[0] },
            MARK_TO => ListOp::MarkTo { y: p[0], x: p[1], angle: p[2], distance: p[3] },
            JUMP_SPEED => ListOp::JumpSpeed { units: p[0] },
            LASER_ON_DELAY => ListOp::LaserOnDelay { us: p[0], unknown: p[1] },
            LASER_OFF_DELAY => ListOp::LaserOffDelay { us: p[0] },
            MARK_SPEED => ListOp::MarkSpeed { units: p[0] },
            ALT_TRAVEL => ListOp::AltTravel { y: p[0], x: p[1], angle: p[2], distance: p[3] },
            POLYGON_DELAY => ListOp::PolygonDelay { units_10us: p[0] },
            MARK_POWER_RATIO => ListOp::MarkPowerRatio { units: p[0] },
            QSWITCH_PERIOD => ListOp::QSwitchPeriod { units: p[0] },
            LASER_CONTROL => ListOp::LaserControl { on: p[0] != 0 },
            READY_MARK => ListOp::ReadyMark,
            other => ListOp::Unknown { opcode: other, params: p },
        }
    }

    /// Human-readable rendering for debugging/CLI tools, e.g.
    /// `"MarkTo(x=100.00mm y=50.00mm)"`. `scale` converts a galvo unit back
    /// to millimeters for display only; pass `1.0` to show raw units.
    pub fn text_decode(&self, scale: f64) -> String {
        let mm = |v: u16| (v as i32 - 0x8000) as f64 * scale;
        match self {
            ListOp::JumpTo { x, y, .. } => format!("JumpTo(x={:.2}mm y={:.2}mm)", mm(*x), mm(*y)),
            ListOp::MarkTo { x, y, .. } => format!("MarkTo(x={:.2}mm y={:.2}mm)", mm(*x), mm(*y)),
            ListOp::AltTravel { x, y, .. } => {
                format!("AltTravel(x={:.2}mm y={:.2}mm)", mm(*x), mm(*y))
            }
            ListOp::NoOp => "NoOp".to_string(),
            ListOp::MarkEndDelay { units_10us } => format!("MarkEndDelay({units_10us})"),
            ListOp::JumpSpeed { units } => format!("JumpSpeed({units})"),
            ListOp::LaserOnDelay { us, .. } => format!("LaserOnDelay({us}us)"),
            ListOp::LaserOffDelay { us } => format!("LaserOffDelay({us}us)"),
            ListOp::MarkSpeed { units } => format!("MarkSpeed({units})"),
            ListOp::PolygonDelay { units_10us } => format!("PolygonDelay({units_10us})"),
            ListOp::MarkPowerRatio { units } => {
                format!("MarkPowerRatio({:.2}%)", *units as f64 / 40.96)
            }
            ListOp::QSwitchPeriod { units } => format!("QSwitchPeriod({units})"),
            ListOp::LaserControl { on } => format!("LaserControl({on})"),
            ListOp::ReadyMark => "ReadyMark".to_string(),
            ListOp::Unknown { opcode, params } => format!("Unknown(0x{opcode:04x}, {params:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_opcodes() {
        let ops = [
            ListOp::JumpTo { x: 0x9000, y: 0x7000, angle: 0, distance: 0x16A0 },
            ListOp::MarkTo { x: 0x1234, y: 0x5678, angle: 1, distance: 2 },
            ListOp::NoOp,
            ListOp::ReadyMark,
            ListOp::MarkPowerRatio { units: 2047 },
            ListOp::LaserControl { on: true },
            ListOp::LaserControl { on: false },
        ];
        for op in ops {
            let bytes = op.serialize();
            assert_eq!(ListOp::deserialize(&bytes).unwrap(), op);
        }
    }

    #[test]
    fn round_trips_unknown_opcode_verbatim() {
        let op = ListOp::Unknown { opcode: 0x801E, params: [1, 2, 3, 4, 5] };
        let bytes = op.serialize();
        assert_eq!(ListOp::deserialize(&bytes).unwrap(), op);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(ListOp::deserialize(&[0u8; 11]).is_err());
        assert!(ListOp::deserialize(&[0u8; 13]).is_err());
    }

    #[test]
    fn serialize_is_little_endian() {
        let op = ListOp::QSwitchPeriod { units: 0x1A0B };
        let bytes = op.serialize();
        assert_eq!(&bytes[0..2], &opcode::QSWITCH_PERIOD.to_le_bytes());
        assert_eq!(&bytes[2..4], &0x1A0Bu16.to_le_bytes());
    }
}
