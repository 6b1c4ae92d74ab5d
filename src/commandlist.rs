//! Builder that turns marking intent into a sequence of [`ListOp`]s.
//!
//! Tracks the state a real job needs to track: last galvo position (for
//! distance back-fill), and the last value passed to every `set_*` call (for
//! deduplication — SPEC_FULL §8 property 3: a setter emits no opcode when
//! the value hasn't changed).

use std::sync::Arc;

use crate::calibration::Calibration;
use crate::error::{Error, Result};
use crate::listop::ListOp;
use crate::transport::PACKET_SIZE;

/// Galvo-space mechanical center; also the default starting position.
pub const GALVO_CENTER: (u16, u16) = (0x8000, 0x8000);

/// Number of list ops per 3072-byte packet.
pub const OPS_PER_PACKET: usize = PACKET_SIZE / 12;

/// Convert a travel/cut speed in mm/s to the board's native speed units.
pub fn mm_per_s_to_speed_units(speed_mm_s: f64) -> Result<u16> {
    to_u16(speed_mm_s / 2.0, 0x8006)
}

/// Convert a power percentage (0-100) to the board's native power units.
pub fn percent_to_power_units(percent: f64) -> Result<u16> {
    to_u16(percent * 40.95, 0x8012)
}

/// Convert a Q-switch frequency in kHz to the board's native period units
/// (50 ns per unit).
pub fn khz_to_qswitch_units(freq_khz: f64) -> Result<u16> {
    let period_s = 1.0 / (freq_khz * 1e3);
    to_u16(period_s / 50e-9, 0x801B)
}

fn to_u16(value: f64, opcode: u16) -> Result<u16> {
    let rounded = value.round();
    if !(0.0..=u16::MAX as f64).contains(&rounded) {
        return Err(Error::ParameterOverflow { opcode, value: rounded as i64 });
    }
    Ok(rounded as u16)
}

/// Caller-settable callback invoked once per loop iteration by
/// [`crate::engine::Session::execute`], primarily used to animate a light
/// (aim) pattern.
pub type TickCallback = Box<dyn FnMut(&CommandList, usize) + Send>;

/// Mutable, cached marking state plus the accumulated opcode stream.
#[derive(Clone)]
pub struct CommandList {
    ops: Vec<ListOp>,
    last_xy: (u16, u16),
    ready_emitted: bool,
    calibration: Option<Arc<Calibration>>,

    travel_speed_units: Option<u16>,
    cut_speed_units: Option<u16>,
    power_units: Option<u16>,
    qswitch_units: Option<u16>,
    laser_on_delay_us: Option<u16>,
    laser_off_delay_us: Option<u16>,
    polygon_delay_units: Option<u16>,
    mark_end_delay_units: Option<u16>,
    light_on: bool,
    laser_control_on: bool,
    jump_calibration_on: bool,
}

impl CommandList {
    /// A new, empty command list with no calibration (identity mapping via
    /// [`ListOp`] coordinates taken as already being galvo units).
    pub fn new() -> Self {
        Self::with_calibration(None)
    }

    /// A new, empty command list that maps `goto`/`light`/`mark` coordinates
    /// (given in millimeters) through `calibration`.
    pub fn with_calibration(calibration: Option<Arc<Calibration>>) -> Self {
        CommandList {
            ops: Vec::new(),
            last_xy: GALVO_CENTER,
            ready_emitted: false,
            calibration,
            travel_speed_units: None,
            cut_speed_units: None,
            power_units: None,
            qswitch_units: None,
            laser_on_delay_us: None,
            laser_off_delay_us: None,
            polygon_delay_units: None,
            mark_end_delay_units: None,
            light_on: false,
            laser_control_on: false,
            jump_calibration_on: false,
        }
    }

    /// Accumulated ops, in emission order.
    pub fn ops(&self) -> &[ListOp] {
        &self.ops
    }

    /// Override the tracked "last position" without emitting an opcode.
    /// Used when the caller already knows the galvo's physical position
    /// (e.g. continuing after a prior job).
    pub fn init_position(&mut self, x: u16, y: u16) {
        self.last_xy = (x, y);
    }

    /// Emit [`ListOp::ReadyMark`] if it hasn't already been emitted for this
    /// list. Idempotent; every geometric/setting method calls this first.
    pub fn ready(&mut self) {
        if !self.ready_emitted {
            self.ops.push(ListOp::ReadyMark);
            self.ready_emitted = true;
        }
    }

    fn to_galvo(&self, x_mm: f64, y_mm: f64) -> Result<(u16, u16)> {
        match &self.calibration {
            Some(cal) => cal.interpolate(x_mm, y_mm),
            None => {
                let clamp = |v: f64| v.round().clamp(0.0, u16::MAX as f64) as u16;
                Ok((clamp(x_mm), clamp(y_mm)))
            }
        }
    }

    /// Travel (laser off) to `(x_mm, y_mm)`. When `light` is true, the
    /// aim-LED setting is ensured on first via [`CommandList::set_light`].
    pub fn goto(&mut self, x_mm: f64, y_mm: f64, light: bool) -> Result<()> {
        self.ready();
        if light {
            self.set_light(true);
        }
        let (x, y) = self.to_galvo(x_mm, y_mm)?;
        let op = if self.jump_calibration_on {
            ListOp::AltTravel { x, y, angle: 0, distance: 0 }
        } else {
            ListOp::JumpTo { x, y, angle: 0, distance: 0 }
        };
        self.push_geometric(op);
        Ok(())
    }

    /// Travel to `(x_mm, y_mm)` with the aim beam on. Alias of
    /// `goto(x_mm, y_mm, true)`.
    pub fn light(&mut self, x_mm: f64, y_mm: f64) -> Result<()> {
        self.goto(x_mm, y_mm, true)
    }

    /// Cut (laser on) to `(x_mm, y_mm)`.
    ///
    /// # Errors
    ///
    /// [`Error::MissingSetting`] if power, frequency, cut speed, laser-on
    /// delay, laser-off delay, or polygon delay have not been set yet.
    pub fn mark(&mut self, x_mm: f64, y_mm: f64) -> Result<()> {
        self.require_mark_settings()?;
        self.ready();
        self.laser_control(true);
        let (x, y) = self.to_galvo(x_mm, y_mm)?;
        self.push_geometric(ListOp::MarkTo { x, y, angle: 0, distance: 0 });
        Ok(())
    }

    fn require_mark_settings(&self) -> Result<()> {
        let missing = |name, present: bool| {
            if present {
                Ok(())
            } else {
                Err(Error::MissingSetting { setting: name })
            }
        };
        missing("power", self.power_units.is_some())?;
        missing("frequency", self.qswitch_units.is_some())?;
        missing("cut_speed", self.cut_speed_units.is_some())?;
        missing("laser_on_delay", self.laser_on_delay_us.is_some())?;
        missing("laser_off_delay", self.laser_off_delay_us.is_some())?;
        missing("polygon_delay", self.polygon_delay_units.is_some())?;
        Ok(())
    }

    fn push_geometric(&mut self, op: ListOp) {
        debug_assert!(op.has_xy());
        self.ops.push(op);
    }

    /// Linearly subdivide a straight segment from `(x0, y0)` to `(x1, y1)`
    /// into vertices spaced roughly `seg_size_mm` apart (minimum 2
    /// segments), emitting one geometric op per vertex via `emit`.
    pub fn draw_line(
        &mut self,
        x0: f64,
        y0: f64,
        x1: f64,
        y1: f64,
        seg_size_mm: f64,
        mut emit: impl FnMut(&mut Self, f64, f64) -> Result<()>,
    ) -> Result<()> {
        let len = ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
        let segments = ((len / seg_size_mm).ceil() as usize).max(2);
        for i in 1..=segments {
            let t = i as f64 / segments as f64;
            emit(self, x0 + (x1 - x0) * t, y0 + (y1 - y0) * t)?;
        }
        Ok(())
    }

    /// Set travel (jump) speed, mm/s. No-op (no opcode emitted) if
    /// unchanged from the last call.
    pub fn set_travel_speed(&mut self, speed_mm_s: f64) -> Result<()> {
        let units = mm_per_s_to_speed_units(speed_mm_s)?;
        if self.travel_speed_units != Some(units) {
            self.ready();
            self.ops.push(ListOp::JumpSpeed { units });
            self.travel_speed_units = Some(units);
        }
        Ok(())
    }

    /// Set cut (mark) speed, mm/s.
    pub fn set_cut_speed(&mut self, speed_mm_s: f64) -> Result<()> {
        let units = mm_per_s_to_speed_units(speed_mm_s)?;
        if self.cut_speed_units != Some(units) {
            self.ready();
            self.ops.push(ListOp::MarkSpeed { units });
            self.cut_speed_units = Some(units);
        }
        Ok(())
    }

    /// Set mark power, percent (0-100).
    pub fn set_power(&mut self, percent: f64) -> Result<()> {
        let units = percent_to_power_units(percent)?;
        if self.power_units != Some(units) {
            self.ready();
            self.ops.push(ListOp::MarkPowerRatio { units });
            self.power_units = Some(units);
        }
        Ok(())
    }

    /// Set Q-switch frequency, kHz.
    pub fn set_frequency(&mut self, freq_khz: f64) -> Result<()> {
        let units = khz_to_qswitch_units(freq_khz)?;
        if self.qswitch_units != Some(units) {
            self.ready();
            self.ops.push(ListOp::QSwitchPeriod { units });
            self.qswitch_units = Some(units);
        }
        Ok(())
    }

    pub fn set_laser_on_delay(&mut self, us: u16) {
        if self.laser_on_delay_us != Some(us) {
            self.ready();
            self.ops.push(ListOp::LaserOnDelay { us, unknown: 0x8000 });
            self.laser_on_delay_us = Some(us);
        }
    }

    pub fn set_laser_off_delay(&mut self, us: u16) {
        if self.laser_off_delay_us != Some(us) {
            self.ready();
            self.ops.push(ListOp::LaserOffDelay { us });
            self.laser_off_delay_us = Some(us);
        }
    }

    pub fn set_polygon_delay(&mut self, units_10us: u16) {
        if self.polygon_delay_units != Some(units_10us) {
            self.ready();
            self.ops.push(ListOp::PolygonDelay { units_10us });
            self.polygon_delay_units = Some(units_10us);
        }
    }

    pub fn set_mark_end_delay(&mut self, units_10us: u16) {
        if self.mark_end_delay_units != Some(units_10us) {
            self.ready();
            self.ops.push(ListOp::MarkEndDelay { units_10us });
            self.mark_end_delay_units = Some(units_10us);
        }
    }

    /// Toggle the aim LED. No opcode of its own; tracked so `light()` only
    /// pays the cost of turning it on once.
    pub fn set_light(&mut self, on: bool) {
        self.light_on = on;
    }

    /// Enable or disable jump-calibration mode (travel ops become
    /// [`ListOp::AltTravel`] instead of [`ListOp::JumpTo`]).
    pub fn jump_calibration(&mut self, on: bool) {
        self.jump_calibration_on = on;
    }

    /// Gate the laser. Rising edge emits `LaserControl(1)` followed by a
    /// `MarkEndDelay(0x320)`; falling edge emits `MarkEndDelay(0x1E)`
    /// followed by `LaserControl(0)` (matches the original driver's
    /// settle-delay bracketing around laser gating).
    pub fn laser_control(&mut self, on: bool) {
        if self.laser_control_on == on {
            return;
        }
        self.ready();
        if on {
            self.ops.push(ListOp::LaserControl { on: true });
            self.ops.push(ListOp::MarkEndDelay { units_10us: 0x320 });
        } else {
            self.ops.push(ListOp::MarkEndDelay { units_10us: 0x1E });
            self.ops.push(ListOp::LaserControl { on: false });
        }
        self.laser_control_on = on;
        self.mark_end_delay_units = None; // laser_control's delay bypasses the dedup cache
    }

    /// Append `repeats` additional copies of ops `[begin, end)`.
    pub fn duplicate(&mut self, begin: usize, end: usize, repeats: usize) {
        let slice = self.ops[begin..end].to_vec();
        for _ in 0..repeats {
            self.ops.extend_from_slice(&slice);
        }
    }

    /// Back-fill distance fields and return the padded, packetized byte
    /// stream (`ceil(len / OPS_PER_PACKET) * PACKET_SIZE` bytes).
    pub fn serialize(&self) -> Vec<u8> {
        let ops = self.with_distances_filled();
        let packet_count = ops.len().div_ceil(OPS_PER_PACKET).max(1);
        let mut out = Vec::with_capacity(packet_count * PACKET_SIZE);
        for packet in Self::pad_into_packets(&ops, packet_count) {
            out.extend_from_slice(&packet);
        }
        out
    }

    /// Stream exactly [`PACKET_SIZE`]-byte packets, in upload order. Used by
    /// [`crate::engine::Session::execute`] so packet upload can interleave
    /// with ready-polling.
    pub fn packet_generator(&self) -> Vec<[u8; PACKET_SIZE]> {
        let ops = self.with_distances_filled();
        let packet_count = ops.len().div_ceil(OPS_PER_PACKET).max(1);
        Self::pad_into_packets(&ops, packet_count)
    }

    fn with_distances_filled(&self) -> Vec<ListOp> {
        let mut ops = self.ops.clone();
        let mut prev = self.last_xy;
        for op in &mut ops {
            if op.has_distance() {
                let (x, y) = op.xy().unwrap();
                let dx = x as f64 - prev.0 as f64;
                let dy = y as f64 - prev.1 as f64;
                let distance = (dx * dx + dy * dy).sqrt().round().clamp(0.0, u16::MAX as f64) as u16;
                op.set_distance(distance);
            }
            if let Some(xy) = op.xy() {
                prev = xy;
            }
        }
        ops
    }

    fn pad_into_packets(ops: &[ListOp], packet_count: usize) -> Vec<[u8; PACKET_SIZE]> {
        let mut packets = Vec::with_capacity(packet_count);
        for packet_idx in 0..packet_count {
            let mut buf = [0u8; PACKET_SIZE];
            for slot in 0..OPS_PER_PACKET {
                let op_idx = packet_idx * OPS_PER_PACKET + slot;
                let op = ops.get(op_idx).copied().unwrap_or(ListOp::NoOp);
                let bytes = op.serialize();
                let off = slot * 12;
                buf[off..off + 12].copy_from_slice(&bytes);
            }
            packets.push(buf);
        }
        packets
    }
}

impl Default for CommandList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_job_is_one_padded_packet() {
        let mut cmd = CommandList::new();
        cmd.ready();
        let bytes = cmd.serialize();
        assert_eq!(bytes.len() % PACKET_SIZE, 0);
        assert_eq!(bytes.len(), PACKET_SIZE);
        assert_eq!(&bytes[0..2], &0x8051u16.to_le_bytes()); // ReadyMark
        assert_eq!(&bytes[12..14], &0x8002u16.to_le_bytes()); // NoOp padding
    }

    #[test]
    fn light_square_computes_expected_distances() {
        let mut cmd = CommandList::new();
        cmd.set_travel_speed(2000.0).unwrap();
        cmd.light(0x9000 as f64, 0x7000 as f64).unwrap();
        cmd.light(0x7000 as f64, 0x7000 as f64).unwrap();
        let ops = cmd.with_distances_filled();
        // ReadyMark, JumpSpeed, JumpTo, JumpTo
        assert_eq!(ops[0], ListOp::ReadyMark);
        assert!(matches!(ops[1], ListOp::JumpSpeed { units: 1000 }));
        match ops[2] {
            ListOp::JumpTo { x, y, distance, .. } => {
                assert_eq!((x, y), (0x9000, 0x7000));
                assert_eq!(distance, 0x16A1);
            }
            other => panic!("unexpected op {other:?}"),
        }
        match ops[3] {
            ListOp::JumpTo { distance, .. } => assert_eq!(distance, 0x2000),
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn dedup_setter_emits_once() {
        let mut cmd = CommandList::new();
        cmd.set_travel_speed(2000.0).unwrap();
        cmd.set_travel_speed(2000.0).unwrap();
        cmd.set_travel_speed(2000.0).unwrap();
        let speed_ops = cmd.ops().iter().filter(|op| matches!(op, ListOp::JumpSpeed { .. })).count();
        assert_eq!(speed_ops, 1);
    }

    #[test]
    fn mark_without_settings_is_missing_setting_error() {
        let mut cmd = CommandList::new();
        assert!(matches!(cmd.mark(0.0, 0.0), Err(Error::MissingSetting { .. })));
    }

    #[test]
    fn mark_emits_expected_sequence() {
        let mut cmd = CommandList::new();
        cmd.set_frequency(30.0).unwrap();
        cmd.set_power(50.0).unwrap();
        cmd.set_cut_speed(100.0).unwrap();
        cmd.set_laser_on_delay(100);
        cmd.set_laser_off_delay(100);
        cmd.set_polygon_delay(100);
        cmd.mark(0.0, 0.0).unwrap();
        cmd.mark(10.0, 0.0).unwrap();

        let kinds: Vec<&str> = cmd
            .ops()
            .iter()
            .map(|op| match op {
                ListOp::ReadyMark => "ReadyMark",
                ListOp::QSwitchPeriod { .. } => "QSwitchPeriod",
                ListOp::MarkPowerRatio { .. } => "MarkPowerRatio",
                ListOp::MarkSpeed { .. } => "MarkSpeed",
                ListOp::LaserOnDelay { .. } => "LaserOnDelay",
                ListOp::LaserOffDelay { .. } => "LaserOffDelay",
                ListOp::PolygonDelay { .. } => "PolygonDelay",
                ListOp::MarkEndDelay { .. } => "MarkEndDelay",
                ListOp::LaserControl { .. } => "LaserControl",
                ListOp::MarkTo { .. } => "MarkTo",
                other => panic!("unexpected op in mark sequence: {other:?}"),
            })
            .collect();

        assert_eq!(
            kinds,
            vec![
                "ReadyMark",
                "QSwitchPeriod",
                "MarkPowerRatio",
                "MarkSpeed",
                "LaserOnDelay",
                "LaserOffDelay",
                "PolygonDelay",
                "LaserControl",
                "MarkEndDelay",
                "MarkTo",
                "MarkTo",
            ]
        );
    }

    #[test]
    fn numeric_conversions_match_documented_constants() {
        assert_eq!(mm_per_s_to_speed_units(2000.0).unwrap(), 1000);
        assert_eq!(percent_to_power_units(50.0).unwrap(), 2048);
        assert_eq!(khz_to_qswitch_units(30.0).unwrap(), 667);
    }

    #[test]
    fn overflowing_speed_is_parameter_overflow() {
        assert!(matches!(
            mm_per_s_to_speed_units(200_000.0),
            Err(Error::ParameterOverflow { .. })
        ));
    }
}
